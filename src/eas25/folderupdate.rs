use log::{debug, warn};
use serde::Deserialize;

use super::handler::Handler;
use crate::error::CommandError;
use crate::store::{Folder, FolderKind, FolderStore, LockMode, StoreError, SyncStore, Transaction};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct FolderUpdateReq {
    sync_key: u64,
    server_id: u64,
    parent_id: u64,
    display_name: String,
}

#[derive(Debug, Default)]
struct FolderUpdateResp {
    status: i32,
    sync_key: Option<u64>,
}

impl FolderUpdateResp {
    fn status(status: i32) -> Self {
        FolderUpdateResp {
            status,
            sync_key: None,
        }
    }

    fn encode(&self) -> String {
        let mut out = String::from(r#"<FolderUpdate xmlns="FolderHierarchy:">"#);
        out.push_str(&format!("<Status>{}</Status>", self.status));
        if let Some(sync_key) = self.sync_key {
            out.push_str(&format!("<SyncKey>{sync_key}</SyncKey>"));
        }
        out.push_str("</FolderUpdate>");
        out
    }
}

impl Handler {
    pub(crate) async fn handle_folder_update(
        &mut self,
        tx: &mut dyn Transaction,
    ) -> Result<(), CommandError> {
        self.resp.set_wbxml(true);

        let req: FolderUpdateReq = self.parse_body()?;
        debug!("FolderUpdate request: {req:?}");

        let response = self.folder_update(tx, &req).await?;
        self.resp.write(response.encode());
        Ok(())
    }

    async fn folder_update(
        &mut self,
        tx: &mut dyn Transaction,
        req: &FolderUpdateReq,
    ) -> Result<FolderUpdateResp, CommandError> {
        // Empty or too long folder name?
        if req.display_name.is_empty() || req.display_name.chars().count() > 256 {
            // Malformed request.
            return Ok(FolderUpdateResp::status(10));
        }

        let scope = self.device_scope()?;
        // Read-lock the key row so it stays loadable below.
        let last_sync_key = tx.last_folder_sync_key(&scope, LockMode::Read).await?;
        if last_sync_key != Some(req.sync_key) {
            warn!(
                "Client sent corrupted folder sync key: IP={}, UserUID={}, DeviceID={}, lastSyncKey={last_sync_key:?}, sentSyncKey={}",
                self.req.remote_addr, scope.user_uid, scope.device_id, req.sync_key
            );
            return Ok(FolderUpdateResp::status(9));
        }

        // Write-lock the folder being updated.
        let folder = match tx
            .folder_by_id(scope.user_uid, req.server_id, LockMode::Write)
            .await
        {
            Ok(f) => f,
            // The folder does not exist.
            Err(StoreError::NotFound) => return Ok(FolderUpdateResp::status(4)),
            Err(e) => return Err(e.into()),
        };
        // Updating a special folder like INBOX?
        if folder.kind != FolderKind::Folder {
            return Ok(FolderUpdateResp::status(2));
        }

        match tx
            .update_folder(
                scope.user_uid,
                req.server_id,
                req.parent_id,
                &req.display_name,
            )
            .await
        {
            Ok(()) => {}
            // The parent folder does not exist.
            Err(StoreError::NotFound) => return Ok(FolderUpdateResp::status(5)),
            // The parent already contains a folder of this name.
            Err(StoreError::Duplicated) => return Ok(FolderUpdateResp::status(2)),
            Err(e) => return Err(e.into()),
        }

        let updated = Folder {
            id: folder.id,
            name: req.display_name.clone(),
            parent_id: req.parent_id,
            kind: folder.kind,
        };
        tx.update_virtual_folder(&scope, &updated).await?;

        let history_id = tx
            .load_folder_sync_key(&scope, req.sync_key, LockMode::None)
            .await?;
        // The history cursor must not move: this command is not a folder
        // sync.
        let new_sync_key = tx.new_folder_sync_key(&scope, history_id).await?;
        debug!(
            "Folder updated: FolderID={}, ParentID={}, FolderName={}, IP={}, UserUID={}, DeviceID={}",
            req.server_id,
            req.parent_id,
            req.display_name,
            self.req.remote_addr,
            scope.user_uid,
            scope.device_id
        );

        Ok(FolderUpdateResp {
            status: 1,
            sync_key: Some(new_sync_key),
        })
    }
}
