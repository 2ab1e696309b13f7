use log::{debug, warn};
use serde::Deserialize;

use super::handler::{Handler, MAX_QUERY_ROWS};
use super::{as_folder_type, truncate_folder_name, xml_escape};
use crate::error::CommandError;
use crate::store::{
    DeviceScope, Folder, FolderHistory, FolderOperation, FolderStore, LockMode, StoreError,
    SyncStore, Transaction,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct FolderSyncReq {
    sync_key: u64,
}

#[derive(Debug)]
pub(crate) struct FolderData {
    pub server_id: u64,
    pub parent_id: u64,
    pub display_name: String,
    pub folder_type: i32,
}

impl FolderData {
    pub(crate) fn from_folder(folder: &Folder) -> Self {
        FolderData {
            server_id: folder.id,
            parent_id: folder.parent_id,
            display_name: truncate_folder_name(&folder.name),
            folder_type: as_folder_type(folder),
        }
    }

    fn encode_into(&self, out: &mut String) {
        out.push_str(&format!(
            "<ServerId>{}</ServerId><ParentId>{}</ParentId><DisplayName>{}</DisplayName><Type>{}</Type>",
            self.server_id,
            self.parent_id,
            xml_escape(&self.display_name),
            self.folder_type,
        ));
    }
}

#[derive(Debug)]
pub(crate) enum FolderOp {
    Add(FolderData),
    Delete { server_id: u64 },
    Update(FolderData),
}

#[derive(Debug)]
struct FolderSyncResp {
    status: i32,
    sync_key: Option<u64>,
    changes: Option<Vec<FolderOp>>,
}

impl FolderSyncResp {
    fn status(status: i32) -> Self {
        FolderSyncResp {
            status,
            sync_key: None,
            changes: None,
        }
    }

    fn encode(&self) -> String {
        let mut out = String::from(r#"<FolderSync xmlns="FolderHierarchy:">"#);
        out.push_str(&format!("<Status>{}</Status>", self.status));
        if let Some(sync_key) = self.sync_key {
            out.push_str(&format!("<SyncKey>{sync_key}</SyncKey>"));
        }
        if let Some(ops) = &self.changes {
            out.push_str(&format!("<Changes><Count>{}</Count>", ops.len()));
            for op in ops {
                match op {
                    FolderOp::Add(data) => {
                        out.push_str("<Add>");
                        data.encode_into(&mut out);
                        out.push_str("</Add>");
                    }
                    FolderOp::Delete { server_id } => {
                        out.push_str(&format!("<Delete><ServerId>{server_id}</ServerId></Delete>"));
                    }
                    FolderOp::Update(data) => {
                        out.push_str("<Update>");
                        data.encode_into(&mut out);
                        out.push_str("</Update>");
                    }
                }
            }
            out.push_str("</Changes>");
        }
        out.push_str("</FolderSync>");
        out
    }
}

impl Handler {
    pub(crate) async fn handle_folder_sync(
        &mut self,
        tx: &mut dyn Transaction,
    ) -> Result<(), CommandError> {
        self.resp.set_wbxml(true);

        let req: FolderSyncReq = self.parse_body()?;
        debug!("FolderSync request: {req:?}");

        let scope = self.device_scope()?;
        let response = if req.sync_key == 0 {
            self.initial_folder_sync(tx, &scope).await?
        } else {
            self.folder_sync(tx, &scope, req.sync_key).await?
        };
        self.resp.write(response.encode());
        Ok(())
    }

    /// Handles the initial FolderSync request whose SyncKey is 0.
    async fn initial_folder_sync(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &DeviceScope,
    ) -> Result<FolderSyncResp, CommandError> {
        debug!(
            "Initial folder synchronizing: IP={}, UserUID={}, DeviceID={}",
            self.req.remote_addr, scope.user_uid, scope.device_id
        );

        tx.clear_folder_sync_keys(scope).await?;
        tx.clear_virtual_folders(scope).await?;

        // Read-lock the last history row so it survives until the new sync
        // key is bound to it.
        let last_history = tx
            .folder_histories(scope.user_uid, 0, 1, true, LockMode::Read)
            .await?;
        let new_sync_key = tx
            .new_folder_sync_key(scope, last_history.first().map(|h| h.id).unwrap_or(0))
            .await?;
        debug!("New SyncKey = {new_sync_key}");

        let folders = tx.folders(scope.user_uid, LockMode::None).await?;
        let mut add = Vec::with_capacity(folders.len());
        for folder in &folders {
            // The last history id related to this folder is zero because the
            // initial sync guarantees no pending histories.
            tx.add_virtual_folder(scope, folder, 0).await?;
            add.push(FolderOp::Add(FolderData::from_folder(folder)));
        }
        debug!("Synced {} folders", add.len());

        Ok(FolderSyncResp {
            status: 1,
            sync_key: Some(new_sync_key),
            changes: Some(add),
        })
    }

    /// Handles subsequent FolderSync requests.
    async fn folder_sync(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &DeviceScope,
        sync_key: u64,
    ) -> Result<FolderSyncResp, CommandError> {
        debug!(
            "Folder synchronizing: IP={}, UserUID={}, DeviceID={}, SyncKey={sync_key}",
            self.req.remote_addr, scope.user_uid, scope.device_id
        );

        // Write-lock the key row so concurrent requests carrying the same
        // sync key are processed sequentially.
        let history_id = match tx
            .load_folder_sync_key(scope, sync_key, LockMode::Write)
            .await
        {
            Ok(id) => id,
            Err(StoreError::NotFound) => {
                warn!(
                    "Client sent unknown folder sync key: IP={}, UserUID={}, DeviceID={}, SyncKey={sync_key}",
                    self.req.remote_addr, scope.user_uid, scope.device_id
                );
                // Ask folder full sync.
                return Ok(FolderSyncResp::status(9));
            }
            Err(e) => return Err(e.into()),
        };
        debug!("History ID = {history_id}");

        let last_sync_key = tx
            .last_folder_sync_key(scope, LockMode::None)
            .await?
            .ok_or_else(|| {
                // It must exist because the client's key just resolved.
                CommandError::Internal("last folder sync key should exist".into())
            })?;
        // Is the client replaying a previous, already processed sync key?
        if last_sync_key != sync_key {
            warn!(
                "Client sent corrupted folder sync key: IP={}, UserUID={}, DeviceID={}, lastSyncKey={last_sync_key}, sentSyncKey={sync_key}",
                self.req.remote_addr, scope.user_uid, scope.device_id
            );
            // Send the last SyncKey we assigned.
            let mut resp = FolderSyncResp::status(1);
            resp.sync_key = Some(last_sync_key);
            return Ok(resp);
        }

        // Read-lock the histories until the virtual mirror is updated.
        let histories = tx
            .folder_histories(
                scope.user_uid,
                history_id + 1,
                MAX_QUERY_ROWS,
                false,
                LockMode::Read,
            )
            .await?;
        if histories.is_empty() {
            debug!("No folder changes! NewSyncKey={sync_key}");
            // No changes; echo the sync key the client sent.
            let mut resp = FolderSyncResp::status(1);
            resp.sync_key = Some(sync_key);
            return Ok(resp);
        }
        if histories.len() as u64 == MAX_QUERY_ROWS {
            warn!(
                "Client needs to update too many histories, asking a re-fullsync instead: IP={}, UserUID={}, DeviceID={}, SyncKey={sync_key}",
                self.req.remote_addr, scope.user_uid, scope.device_id
            );
            return Ok(FolderSyncResp::status(9));
        }

        let affected = apply_folder_histories(tx, scope, &histories).await?;
        let new_sync_key = tx
            .new_folder_sync_key(scope, histories.last().map(|h| h.id).unwrap_or(history_id))
            .await?;
        debug!("New SyncKey = {new_sync_key}");

        Ok(FolderSyncResp {
            status: 1,
            sync_key: Some(new_sync_key),
            changes: Some(affected),
        })
    }
}

/// Last history id about `folder_id`, 0 when the folder has none.
async fn last_folder_history_id(
    tx: &mut dyn Transaction,
    user_uid: u64,
    folder_id: u64,
) -> Result<u64, CommandError> {
    match tx
        .last_folder_history(user_uid, folder_id, LockMode::Read)
        .await
    {
        Ok(history) => Ok(history.id),
        Err(StoreError::NotFound) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Replays folder histories against the virtual mirror, returning only the
/// operations that actually changed it.
async fn apply_folder_histories(
    tx: &mut dyn Transaction,
    scope: &DeviceScope,
    histories: &[FolderHistory],
) -> Result<Vec<FolderOp>, CommandError> {
    let mut ops = Vec::new();

    for hist in histories {
        let folder = &hist.folder;
        // Write-lock the virtual row before mutating it below.
        let virt = match tx
            .virtual_folder(scope, folder.id, LockMode::Write)
            .await
        {
            Ok(v) => Some(v),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        match hist.operation {
            FolderOperation::Add => {
                // Does the user still have this folder? Read-lock it until
                // the virtual row is created.
                let latest = match tx
                    .folder_by_id(scope.user_uid, folder.id, LockMode::Read)
                    .await
                {
                    Ok(f) => f,
                    Err(StoreError::NotFound) => {
                        // Gone from the backend; skipping retires every
                        // subsequent history about it as well.
                        debug!(
                            "ADD: FolderID={}, skip because it does not exist in the backend database",
                            folder.id
                        );
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                if virt.is_some() {
                    debug!(
                        "ADD: FolderID={}, skip because it already exists in the virtual database",
                        folder.id
                    );
                    continue;
                }
                let last_change = last_folder_history_id(tx, scope.user_uid, folder.id).await?;
                // Mirror the latest backend value, not the history snapshot,
                // so later histories carrying stale values skip themselves.
                tx.add_virtual_folder(scope, &latest, last_change).await?;
                ops.push(FolderOp::Add(FolderData::from_folder(&latest)));
                debug!("Added: FolderID={}", folder.id);
            }
            FolderOperation::Delete => {
                if virt.is_none() {
                    debug!(
                        "DELETE: FolderID={}, skip because it does not exist in the virtual database",
                        folder.id
                    );
                    continue;
                }
                tx.remove_virtual_folder(scope, folder.id).await?;
                ops.push(FolderOp::Delete {
                    server_id: folder.id,
                });
                debug!("Deleted: FolderID={}", folder.id);
            }
            FolderOperation::Update => {
                let skip = match &virt {
                    None => true,
                    Some(v) => {
                        (folder.name == v.name && folder.parent_id == v.parent_id)
                            || hist.id <= v.last_history_id
                    }
                };
                if skip {
                    debug!(
                        "UPDATE: FolderID={}, skip because it does not exist in the virtual database, has same values, or is already processed",
                        folder.id
                    );
                    continue;
                }
                tx.update_virtual_folder(scope, folder).await?;
                ops.push(FolderOp::Update(FolderData::from_folder(folder)));
                debug!(
                    "Updated: Folder ID={}, Name={}, ParentID={}",
                    folder.id, folder.name, folder.parent_id
                );
            }
        }
    }

    Ok(ops)
}
