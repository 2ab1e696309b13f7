use log::{debug, warn};
use serde::Deserialize;

use super::handler::Handler;
use crate::error::CommandError;
use crate::store::{FolderKind, FolderStore, LockMode, StoreError, SyncStore, Transaction};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct FolderDeleteReq {
    sync_key: u64,
    server_id: u64,
}

#[derive(Debug, Default)]
struct FolderDeleteResp {
    status: i32,
    sync_key: Option<u64>,
}

impl FolderDeleteResp {
    fn status(status: i32) -> Self {
        FolderDeleteResp {
            status,
            sync_key: None,
        }
    }

    fn encode(&self) -> String {
        let mut out = String::from(r#"<FolderDelete xmlns="FolderHierarchy:">"#);
        out.push_str(&format!("<Status>{}</Status>", self.status));
        if let Some(sync_key) = self.sync_key {
            out.push_str(&format!("<SyncKey>{sync_key}</SyncKey>"));
        }
        out.push_str("</FolderDelete>");
        out
    }
}

impl Handler {
    pub(crate) async fn handle_folder_delete(
        &mut self,
        tx: &mut dyn Transaction,
    ) -> Result<(), CommandError> {
        self.resp.set_wbxml(true);

        let req: FolderDeleteReq = self.parse_body()?;
        debug!("FolderDelete request: {req:?}");

        let response = self.folder_delete(tx, req.sync_key, req.server_id).await?;
        self.resp.write(response.encode());
        Ok(())
    }

    async fn folder_delete(
        &mut self,
        tx: &mut dyn Transaction,
        sync_key: u64,
        folder_id: u64,
    ) -> Result<FolderDeleteResp, CommandError> {
        let scope = self.device_scope()?;

        // Write-lock the folder to be deleted.
        let folder = match tx
            .folder_by_id(scope.user_uid, folder_id, LockMode::Write)
            .await
        {
            Ok(f) => f,
            // The folder does not exist.
            Err(StoreError::NotFound) => return Ok(FolderDeleteResp::status(4)),
            Err(e) => return Err(e.into()),
        };

        // Deleting a special folder like INBOX?
        if folder.kind != FolderKind::Folder {
            return Ok(FolderDeleteResp::status(3));
        }

        // Read-lock the key row so it stays loadable below.
        let last_sync_key = tx.last_folder_sync_key(&scope, LockMode::Read).await?;
        if last_sync_key != Some(sync_key) {
            warn!(
                "Client sent corrupted folder sync key: IP={}, UserUID={}, DeviceID={}, lastSyncKey={last_sync_key:?}, sentSyncKey={sync_key}",
                self.req.remote_addr, scope.user_uid, scope.device_id
            );
            return Ok(FolderDeleteResp::status(9));
        }

        tx.delete_folder(scope.user_uid, folder_id).await?;
        match tx.remove_virtual_folder(&scope, folder_id).await {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let history_id = tx
            .load_folder_sync_key(&scope, sync_key, LockMode::None)
            .await?;
        // The history cursor must not move: this command is not a folder
        // sync.
        let new_sync_key = tx.new_folder_sync_key(&scope, history_id).await?;
        debug!(
            "Deleted a folder: FolderID={folder_id}, FolderName={}, IP={}, UserUID={}, DeviceID={}",
            folder.name, self.req.remote_addr, scope.user_uid, scope.device_id
        );

        Ok(FolderDeleteResp {
            status: 1,
            sync_key: Some(new_sync_key),
        })
    }
}
