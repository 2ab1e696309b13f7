use log::{debug, warn};
use serde::Deserialize;

use super::handler::Handler;
use super::backend_folder_kind;
use crate::error::CommandError;
use crate::store::{Folder, FolderKind, FolderStore, LockMode, StoreError, SyncStore, Transaction};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct FolderCreateReq {
    sync_key: u64,
    parent_id: u64,
    display_name: String,
    #[serde(rename = "Type")]
    folder_type: i32,
}

#[derive(Debug, Default)]
struct FolderCreateResp {
    status: i32,
    sync_key: Option<u64>,
    server_id: Option<u64>,
}

impl FolderCreateResp {
    fn status(status: i32) -> Self {
        FolderCreateResp {
            status,
            ..Default::default()
        }
    }

    fn encode(&self) -> String {
        let mut out = String::from(r#"<FolderCreate xmlns="FolderHierarchy:">"#);
        out.push_str(&format!("<Status>{}</Status>", self.status));
        if let Some(sync_key) = self.sync_key {
            out.push_str(&format!("<SyncKey>{sync_key}</SyncKey>"));
        }
        if let Some(server_id) = self.server_id {
            out.push_str(&format!("<ServerId>{server_id}</ServerId>"));
        }
        out.push_str("</FolderCreate>");
        out
    }
}

impl Handler {
    pub(crate) async fn handle_folder_create(
        &mut self,
        tx: &mut dyn Transaction,
    ) -> Result<(), CommandError> {
        self.resp.set_wbxml(true);

        let req: FolderCreateReq = self.parse_body()?;
        debug!("FolderCreate request: {req:?}");

        let Some(kind) = backend_folder_kind(req.folder_type) else {
            // Only email folders are supported.
            self.resp.set_status(501);
            return Ok(());
        };

        let response = self.folder_create(tx, &req, kind).await?;
        self.resp.write(response.encode());
        Ok(())
    }

    async fn folder_create(
        &mut self,
        tx: &mut dyn Transaction,
        req: &FolderCreateReq,
        kind: FolderKind,
    ) -> Result<FolderCreateResp, CommandError> {
        // Creating a special folder like INBOX?
        if kind != FolderKind::Folder {
            // Malformed request.
            return Ok(FolderCreateResp::status(10));
        }

        // Empty or too long folder name?
        if req.display_name.is_empty() || req.display_name.chars().count() > 256 {
            return Ok(FolderCreateResp::status(10));
        }

        let scope = self.device_scope()?;
        // Read-lock the key row so it stays loadable below.
        let last_sync_key = tx.last_folder_sync_key(&scope, LockMode::Read).await?;
        if last_sync_key != Some(req.sync_key) {
            warn!(
                "Client sent corrupted folder sync key: IP={}, UserUID={}, DeviceID={}, lastSyncKey={last_sync_key:?}, sentSyncKey={}",
                self.req.remote_addr, scope.user_uid, scope.device_id, req.sync_key
            );
            // The client's sync state is corrupted; ask a full sync.
            return Ok(FolderCreateResp::status(9));
        }

        let folder_id = match tx
            .add_folder(scope.user_uid, req.parent_id, &req.display_name, kind)
            .await
        {
            Ok(id) => id,
            // The parent folder does not exist.
            Err(StoreError::NotFound) => return Ok(FolderCreateResp::status(5)),
            // The parent already contains a folder of this name.
            Err(StoreError::Duplicated) => return Ok(FolderCreateResp::status(2)),
            Err(e) => return Err(e.into()),
        };
        // The last history id related to this folder is zero because the
        // folder has been created just now.
        let folder = Folder {
            id: folder_id,
            name: req.display_name.clone(),
            parent_id: req.parent_id,
            kind,
        };
        match tx.add_virtual_folder(&scope, &folder, 0).await {
            Ok(()) | Err(StoreError::Duplicated) => {}
            Err(e) => return Err(e.into()),
        }

        let history_id = tx
            .load_folder_sync_key(&scope, req.sync_key, LockMode::None)
            .await?;
        // The history cursor must not move: this command is not a folder
        // sync. The next FolderSync absorbs the self-generated Add history
        // through the mirror skip rule.
        let new_sync_key = tx.new_folder_sync_key(&scope, history_id).await?;
        debug!(
            "New folder is created: FolderID={folder_id}, FolderName={}, IP={}, UserUID={}, DeviceID={}",
            req.display_name, self.req.remote_addr, scope.user_uid, scope.device_id
        );

        Ok(FolderCreateResp {
            status: 1,
            sync_key: Some(new_sync_key),
            server_id: Some(folder_id),
        })
    }
}
