// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Deserialize;

use super::email::email_application_data;
use super::handler::{Handler, MAX_QUERY_ROWS, MAX_SYNC_WINDOW_SIZE};
use super::{older_than, split_email_id, time_filter, xml_escape};
use crate::error::CommandError;
use crate::store::{
    Email, EmailHistory, EmailOperation, Folder, FolderKind, FolderScope, FolderStore, LockMode,
    MailStore, StoreError, SyncStore, Transaction,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub(crate) struct SyncReq {
    pub collections: Collections,
    /// Global window size; the per-collection value takes precedence.
    pub window_size: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Collections {
    #[serde(rename = "Collection")]
    pub collection: Vec<SyncCollection>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub(crate) struct SyncCollection {
    pub class: String,
    pub sync_key: u64,
    pub collection_id: u64,
    /// Boolean-valued but kept as a string to observe the self-closed tag.
    pub deletes_as_moves: Option<String>,
    pub get_changes: Option<String>,
    pub window_size: u32,
    pub options: SyncOptions,
    pub commands: Commands,
}

impl SyncCollection {
    pub(crate) fn has_deletes_as_moves(&self) -> bool {
        // Only false when the client explicitly said so.
        !matches!(self.deletes_as_moves.as_deref(), Some("0"))
    }

    pub(crate) fn has_get_changes(&self) -> bool {
        self.get_changes.is_some()
    }

    pub(crate) fn has_client_changes(&self) -> bool {
        !self.commands.values.is_empty()
    }

    fn effective_window_size(&self) -> usize {
        let requested = self.window_size as usize;
        if requested > 0 && requested < MAX_SYNC_WINDOW_SIZE {
            requested
        } else {
            MAX_SYNC_WINDOW_SIZE
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub(crate) struct SyncOptions {
    /// Absent element means 0, no time filter.
    pub filter_type: String,
    #[serde(rename = "MIMETruncation")]
    pub mime_truncation: String,
    #[serde(rename = "MIMESupport")]
    pub mime_support: String,
    /// Absent element means no body truncation.
    pub truncation: String,
}

impl SyncOptions {
    /// MIMESupport 0 and 1 get the regular ApplicationData shape; anything
    /// else gets the full MIME payload.
    pub(crate) fn wants_mime(&self) -> bool {
        !matches!(self.mime_support.as_str(), "0" | "1")
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct Commands {
    #[serde(rename = "$value")]
    pub values: Vec<ClientChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) enum ClientChange {
    Add(ChangeBody),
    Delete(ChangeBody),
    Change(ChangeBody),
    Fetch(ChangeBody),
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub(crate) struct ChangeBody {
    pub client_id: String,
    pub server_id: String,
    pub application_data: ApplicationData,
    pub class: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub(crate) struct ApplicationData {
    #[serde(rename = "MIMEData")]
    pub mime_data: String,
    pub read: String,
}

#[derive(Debug, Default)]
struct SyncResp {
    sync_key: u64,
    collection_id: u64,
    status: i32,
    more_available: bool,
    commands: String,
    responses: String,
}

impl SyncResp {
    fn new(collection_id: u64) -> Self {
        SyncResp {
            collection_id,
            ..Default::default()
        }
    }

    fn encode(&self) -> String {
        let mut out = String::from(
            r#"<Sync xmlns="AirSync:" xmlns:email="Email:"><Collections><Collection><Class>Email</Class>"#,
        );
        out.push_str(&format!(
            "<SyncKey>{}</SyncKey><CollectionId>{}</CollectionId><Status>{}</Status>",
            self.sync_key, self.collection_id, self.status
        ));
        if self.more_available {
            out.push_str("<MoreAvailable/>");
        }
        if !self.commands.is_empty() {
            out.push_str(&format!("<Commands>{}</Commands>", self.commands));
        }
        if !self.responses.is_empty() {
            out.push_str(&format!("<Responses>{}</Responses>", self.responses));
        }
        out.push_str("</Collection></Collections></Sync>");
        out
    }
}

impl Handler {
    pub(crate) async fn handle_sync(
        &mut self,
        tx: &mut dyn Transaction,
    ) -> Result<(), CommandError> {
        self.resp.set_wbxml(true);

        let req: SyncReq = self.parse_body()?;
        debug!("Sync request: {req:?}");

        // Only a single collection is supported; validate the count before
        // touching the collection list.
        if req.collections.collection.len() != 1 {
            let status = if req.collections.collection.is_empty() {
                // An empty or partial Sync request without a cached
                // collection set.
                13
            } else {
                // Too many collections.
                15
            };
            self.resp
                .write(format!(r#"<Sync xmlns="AirSync:"><Status>{status}</Status></Sync>"#));
            warn!(
                "Sync request with an empty or too many collections: # of collections={}",
                req.collections.collection.len()
            );
            return Ok(());
        }
        let collection = req.collections.collection[0].clone();

        // Check folder existence; read-lock it for the rest of this sync.
        let folder = match tx
            .folder_by_id(self.credential.user_uid, collection.collection_id, LockMode::Read)
            .await
        {
            Ok(f) => f,
            Err(StoreError::NotFound) => {
                // The folder hierarchy has changed; the client should run
                // FolderSync first.
                self.resp
                    .write(r#"<Sync xmlns="AirSync:"><Status>12</Status></Sync>"#);
                warn!(
                    "Sync request for an unknown folder: FolderID={}",
                    collection.collection_id
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let scope = self.folder_scope(collection.collection_id)?;
        let mut resp = SyncResp::new(collection.collection_id);

        if collection.has_client_changes() {
            debug!(
                "Client sent client-side changes: IP={}, UserUID={}, DeviceID={}",
                self.req.remote_addr, scope.user_uid, scope.device_id
            );
            self.apply_client_changes(tx, &scope, &collection, &folder, &mut resp)
                .await?;
        }

        if collection.sync_key == 0 {
            self.initial_sync(tx, &scope, &collection, &mut resp).await?;
        } else {
            self.sync_collection(tx, &scope, &collection, &mut resp)
                .await?;
        }
        self.resp.write(resp.encode());
        Ok(())
    }

    async fn apply_client_changes(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        collection: &SyncCollection,
        folder: &Folder,
        resp: &mut SyncResp,
    ) -> Result<(), CommandError> {
        let mut output = String::new();
        for change in &collection.commands.values {
            let fragment = match change {
                ClientChange::Add(body) => {
                    self.client_add(tx, scope, collection, body).await?
                }
                ClientChange::Delete(body) => {
                    self.client_delete(tx, scope, collection, folder, body).await?
                }
                ClientChange::Change(body) => self.client_change(tx, scope, body).await?,
                ClientChange::Fetch(body) => {
                    self.client_fetch(tx, scope, collection, body).await?
                }
            };
            output.push_str(&fragment);
        }
        resp.responses = output;
        Ok(())
    }

    async fn client_add(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        collection: &SyncCollection,
        body: &ChangeBody,
    ) -> Result<String, CommandError> {
        if body.class != "Email" || body.application_data.mime_data.is_empty() {
            // Protocol error; only email folders are supported.
            return Ok(format!(
                "<Add><ClientId>{}</ClientId><Status>4</Status></Add>",
                xml_escape(&body.client_id)
            ));
        }
        let email = tx
            .add_email(
                scope.user_uid,
                scope.folder_id,
                body.application_data.mime_data.as_bytes(),
            )
            .await?;
        // The last history id related to this email is zero because it was
        // added just now.
        tx.add_virtual_email(scope, &email, 0).await?;
        debug!(
            "Client-side ADD: ClientId={}, ServerId={}",
            body.client_id, email.id
        );
        Ok(format!(
            "<Add><ClientId>{}</ClientId><ServerId>{}:{}</ServerId><Class>Email</Class><Status>1</Status></Add>",
            xml_escape(&body.client_id),
            collection.collection_id,
            email.id
        ))
    }

    async fn client_delete(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        collection: &SyncCollection,
        folder: &Folder,
        body: &ChangeBody,
    ) -> Result<String, CommandError> {
        let email_id = split_email_id(&body.server_id)?;

        if collection.has_deletes_as_moves() && folder.kind != FolderKind::Trash {
            let trash = tx
                .folders_by_kind(scope.user_uid, FolderKind::Trash, LockMode::Read)
                .await?;
            let Some(trash) = trash.first() else {
                return Err(CommandError::Internal(
                    "failed to open a trash folder: not found".into(),
                ));
            };

            match tx
                .move_email(scope.user_uid, scope.folder_id, email_id, trash.id)
                .await
            {
                Ok(_) => {}
                Err(StoreError::NotFound) => {
                    // Object not found.
                    return Ok(format!(
                        "<Delete><ServerId>{}</ServerId><Status>8</Status></Delete>",
                        xml_escape(&body.server_id)
                    ));
                }
                Err(e) => return Err(e.into()),
            }
            match tx.remove_virtual_email(scope, email_id).await {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            match tx.remove_virtual_email(scope, email_id).await {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
            match tx
                .delete_email(scope.user_uid, scope.folder_id, email_id)
                .await
            {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(
            "Client-side DELETE: ServerId={} (DeletesAsMoves: {})",
            body.server_id,
            collection.has_deletes_as_moves()
        );
        Ok(format!(
            "<Delete><ServerId>{}</ServerId><Status>1</Status></Delete>",
            xml_escape(&body.server_id)
        ))
    }

    async fn client_change(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        body: &ChangeBody,
    ) -> Result<String, CommandError> {
        let email_id = split_email_id(&body.server_id)?;
        // Only the seen flag can be changed.
        if !body.application_data.read.is_empty() {
            let seen = body.application_data.read == "1";
            match tx
                .update_email(scope.user_uid, scope.folder_id, email_id, seen)
                .await
            {
                Ok(()) => {}
                Err(StoreError::NotFound) => {
                    return Ok(format!(
                        "<Change><ServerId>{}</ServerId><Status>8</Status></Change>",
                        xml_escape(&body.server_id)
                    ));
                }
                Err(e) => return Err(e.into()),
            }
            match tx.update_virtual_email_seen(scope, email_id, seen).await {
                Ok(()) => {}
                Err(StoreError::NotFound) => {
                    return Ok(format!(
                        "<Change><ServerId>{}</ServerId><Status>8</Status></Change>",
                        xml_escape(&body.server_id)
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!(
            "Client-side Change: ServerId={}, Seen={}",
            body.server_id, body.application_data.read
        );
        Ok(format!(
            "<Change><ServerId>{}</ServerId><Status>1</Status></Change>",
            xml_escape(&body.server_id)
        ))
    }

    // The fetched email is already synced and therefore already present in
    // the virtual mirror; no mirror update here.
    async fn client_fetch(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        collection: &SyncCollection,
        body: &ChangeBody,
    ) -> Result<String, CommandError> {
        let email_id = split_email_id(&body.server_id)?;
        let email = match tx
            .email(scope.user_uid, scope.folder_id, email_id, LockMode::None)
            .await
        {
            Ok(e) => e,
            Err(StoreError::NotFound) => {
                return Ok(format!(
                    "<Fetch><ServerId>{}</ServerId><Status>8</Status></Fetch>",
                    xml_escape(&body.server_id)
                ));
            }
            Err(e) => return Err(e.into()),
        };
        let data = email_application_data(tx, scope, &email, &collection.options).await?;
        debug!("Client-side Fetch: ServerId={}", body.server_id);
        Ok(format!(
            "<Fetch><ServerId>{}</ServerId><Status>1</Status>{data}</Fetch>",
            xml_escape(&body.server_id)
        ))
    }

    async fn initial_sync(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        collection: &SyncCollection,
        resp: &mut SyncResp,
    ) -> Result<(), CommandError> {
        debug!(
            "Initial email synchronizing: IP={}, UserUID={}, DeviceID={}",
            self.req.remote_addr, scope.user_uid, scope.device_id
        );

        if collection.has_get_changes() {
            debug!("Initial email sync request has the GetChanges tag, which is a protocol error!");
            // GetChanges must be absent when the SyncKey is 0.
            resp.status = 4;
            return Ok(());
        }

        tx.clear_email_sync_keys(scope).await?;
        tx.clear_virtual_emails(scope).await?;

        // Read-lock the last history row so it survives until the new sync
        // key is bound to it.
        let last_history = tx
            .email_histories(scope.user_uid, scope.folder_id, 0, 1, true, LockMode::Read)
            .await?;
        let new_sync_key = tx
            .new_email_sync_key(scope, last_history.first().map(|h| h.id).unwrap_or(0))
            .await?;
        debug!("New SyncKey = {new_sync_key}");

        resp.status = 1;
        resp.sync_key = new_sync_key;
        Ok(())
    }

    async fn sync_collection(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        collection: &SyncCollection,
        resp: &mut SyncResp,
    ) -> Result<(), CommandError> {
        debug!(
            "Email synchronizing: IP={}, UserUID={}, DeviceID={}, SyncKey={}",
            self.req.remote_addr, scope.user_uid, scope.device_id, collection.sync_key
        );

        // Write-lock the key row so concurrent requests carrying the same
        // sync key are processed sequentially.
        let history_id = match tx
            .load_email_sync_key(scope, collection.sync_key, LockMode::Write)
            .await
        {
            Ok(id) => id,
            Err(StoreError::NotFound) => {
                warn!(
                    "Client sent unknown email sync key: IP={}, UserUID={}, DeviceID={}, SyncKey={}",
                    self.req.remote_addr, scope.user_uid, scope.device_id, collection.sync_key
                );
                // Ask a full sync.
                resp.status = 3;
                resp.sync_key = 0;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        debug!(
            "History ID from the SyncKey {} = {history_id}",
            collection.sync_key
        );

        let last_sync_key = tx
            .last_email_sync_key(scope, LockMode::None)
            .await?
            .unwrap_or(0);
        // Is the client replaying a previous, already processed sync key?
        if last_sync_key != collection.sync_key {
            warn!(
                "Client sent corrupted email sync key: IP={}, UserUID={}, DeviceID={}, lastSyncKey={last_sync_key}, sentSyncKey={}",
                self.req.remote_addr, scope.user_uid, scope.device_id, collection.sync_key
            );
            // Send the last SyncKey we assigned. The response keeps the
            // responses for client-side changes if any were requested.
            resp.status = 1;
            resp.sync_key = last_sync_key;
            return Ok(());
        }

        let last_history = tx
            .email_histories(scope.user_uid, scope.folder_id, 0, 1, true, LockMode::None)
            .await?;
        // The account has no email yet, or the client declined server-side
        // changes?
        if last_history.is_empty() || !collection.has_get_changes() {
            debug!("The account does not have any email or the client does not want server-side changes");
            resp.status = 1;
            // No changes; echo the sync key the client sent.
            resp.sync_key = collection.sync_key;
            if collection.has_client_changes() {
                // Rotate the sync key because client-side changes were
                // applied, but the history cursor stays: there may be
                // server-side changes not yet delivered.
                resp.sync_key = tx.new_email_sync_key(scope, history_id).await?;
            }
            debug!("New SyncKey = {}", resp.sync_key);
            return Ok(());
        }
        debug!(
            "Last History ID of the folder {} = {}",
            scope.folder_id, last_history[0].id
        );

        let window_size = collection.effective_window_size();
        debug!("windowSize = {window_size}");

        let last_email_id = match tx.oldest_virtual_email(scope, LockMode::None).await? {
            None => 0,
            Some(v) if v.email_id == 0 => {
                return Err(CommandError::Internal("invalid oldest email id".into()))
            }
            Some(v) => v.email_id,
        };
        debug!("lastEmailID = {last_email_id}");

        // 0: empty mirror (special value), 1: no more emails below the
        // oldest, >1: there may be more historical emails to page in.
        if last_email_id != 1 {
            let next_email_id = last_email_id.saturating_sub(1);
            // Ping returns immediately while histories are pending, so this
            // paging phase only runs when the cursor is caught up.
            let emails = self
                .filtered_emails(tx, scope, next_email_id, window_size, &collection.options)
                .await?;
            debug!("# of candidate emails to be synced: {}", emails.len());
            if !emails.is_empty() {
                debug!("Syncing {} emails..", emails.len());
                return self
                    .sync_emails(tx, scope, collection, emails, window_size, history_id, resp)
                    .await;
            }
        }

        // No pending histories left?
        if history_id == last_history[0].id {
            debug!("Soft-deleting old emails..");
            return self
                .sync_soft_deletes(tx, scope, collection, window_size, history_id, resp)
                .await;
        }

        debug!("Syncing pending histories..");
        self.sync_pending_histories(tx, scope, collection, history_id, window_size, resp)
            .await
    }

    /// Up to `window_size + 1` emails at or below `next_email_id` (newest
    /// first), dropping the ones older than the time filter.
    async fn filtered_emails(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        next_email_id: u64,
        window_size: usize,
        options: &SyncOptions,
    ) -> Result<Vec<Email>, CommandError> {
        let emails = tx
            .emails(
                scope.user_uid,
                scope.folder_id,
                next_email_id,
                window_size as u64 + 1,
                true,
                LockMode::Read,
            )
            .await?;
        let threshold = time_filter(&options.filter_type);
        Ok(emails
            .into_iter()
            .filter(|e| !older_than(e.date, &threshold))
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_emails(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        collection: &SyncCollection,
        mut emails: Vec<Email>,
        window_size: usize,
        history_id: u64,
        resp: &mut SyncResp,
    ) -> Result<(), CommandError> {
        let mut more_available = false;
        if emails.len() == window_size + 1 {
            more_available = true;
            emails.pop();
            debug!("Cut the last one of the emails to be synced");
        }

        let mut output = String::new();
        for email in &emails {
            let last_change = last_email_history_id(tx, scope, email.id).await?;
            match tx.add_virtual_email(scope, email, last_change).await {
                Ok(()) => {}
                Err(StoreError::Duplicated) => {
                    debug!("Ignored the duplicated virtual email: {}", email.id);
                }
                Err(e) => return Err(e.into()),
            }
            let data = email_application_data(tx, scope, email, &collection.options).await?;
            output.push_str(&format!(
                "<Add><ServerId>{}:{}</ServerId>{data}</Add>",
                scope.folder_id, email.id
            ));
            debug!("Added: ServerID={}:{}", scope.folder_id, email.id);
        }

        // The history cursor does not move during initial paging.
        let new_sync_key = tx.new_email_sync_key(scope, history_id).await?;
        resp.status = 1;
        resp.sync_key = new_sync_key;
        resp.commands = output;
        resp.more_available = more_available;
        debug!(
            "New SyncKey = {new_sync_key} (historyID={history_id}, moreAvail={})",
            resp.more_available
        );
        Ok(())
    }

    async fn sync_soft_deletes(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        collection: &SyncCollection,
        window_size: usize,
        history_id: u64,
        resp: &mut SyncResp,
    ) -> Result<(), CommandError> {
        let mut old = match time_filter(&collection.options.filter_type) {
            Some(threshold) => {
                tx.old_virtual_emails(scope, threshold, window_size + 1, LockMode::Write)
                    .await?
            }
            // No filter, nothing drifts out of the window.
            None => Vec::new(),
        };
        if old.is_empty() {
            // No sync key change.
            resp.status = 1;
            resp.sync_key = collection.sync_key;
            debug!("No soft-deleted emails");
            return Ok(());
        }

        let mut more_available = false;
        if old.len() == window_size + 1 {
            more_available = true;
            old.pop();
        }
        debug!("Found {} old emails to be soft-deleted", old.len());

        let mut output = String::new();
        for v in &old {
            tx.remove_virtual_email(scope, v.email_id).await?;
            output.push_str(&format!(
                "<SoftDelete><ServerId>{}:{}</ServerId></SoftDelete>",
                scope.folder_id, v.email_id
            ));
            debug!("Soft-deleted: ServerID={}:{}", scope.folder_id, v.email_id);
        }

        // The history cursor does not move.
        let new_sync_key = tx.new_email_sync_key(scope, history_id).await?;
        resp.status = 1;
        resp.sync_key = new_sync_key;
        resp.commands = output;
        resp.more_available = more_available;
        debug!(
            "New SyncKey = {new_sync_key} (historyID={history_id}, moreAvail={})",
            resp.more_available
        );
        Ok(())
    }

    async fn sync_pending_histories(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        collection: &SyncCollection,
        history_id: u64,
        window_size: usize,
        resp: &mut SyncResp,
    ) -> Result<(), CommandError> {
        // Read-lock the histories until the virtual mirror is updated.
        let histories = tx
            .email_histories(
                scope.user_uid,
                scope.folder_id,
                history_id + 1,
                MAX_QUERY_ROWS,
                false,
                LockMode::Read,
            )
            .await?;

        let threshold = time_filter(&collection.options.filter_type);
        let mut last_id = history_id;
        let mut more_available = false;
        let mut ops: Vec<String> = Vec::new();
        for (i, hist) in histories.iter().enumerate() {
            last_id = hist.id;
            let op = match hist.operation {
                EmailOperation::Add => {
                    self.replay_add(tx, scope, collection, hist, &threshold).await?
                }
                EmailOperation::Delete => self.replay_delete(tx, scope, hist).await?,
                EmailOperation::UpdateSeen => self.replay_update_seen(tx, scope, hist).await?,
            };
            if let Some(op) = op {
                ops.push(op);
            }

            // Never replay more than the window size: the routines above
            // insert rows into the virtual mirror, so over-execution with a
            // cut-the-last-one approach would corrupt the mirror.
            if ops.len() == window_size {
                if i < histories.len() - 1 {
                    more_available = true;
                }
                break;
            }
        }

        // A new sync key is assigned even when every history was skipped:
        // the cursor must advance to the last inspected row so skipped
        // histories are permanently retired. An empty response is fine; a
        // later Ping will ask the client to sync again if more histories
        // remain.
        let new_sync_key = tx.new_email_sync_key(scope, last_id).await?;
        resp.status = 1;
        resp.sync_key = new_sync_key;
        if !ops.is_empty() {
            resp.commands = ops.concat();
            resp.more_available = more_available;
        }
        debug!(
            "New SyncKey = {new_sync_key} (historyID={last_id}, # of ops={}, moreAvail={})",
            ops.len(),
            resp.more_available
        );
        Ok(())
    }

    async fn replay_add(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        collection: &SyncCollection,
        hist: &EmailHistory,
        threshold: &Option<DateTime<Utc>>,
    ) -> Result<Option<String>, CommandError> {
        let email_id = hist.email.id;
        // Does the user still have this email?
        let latest = match tx
            .email(scope.user_uid, scope.folder_id, email_id, LockMode::Read)
            .await
        {
            Ok(e) => e,
            Err(StoreError::NotFound) => {
                // Gone from the backend; skipping retires every subsequent
                // history about it as well.
                debug!(
                    "ADD: emailId={email_id}, skip because it does not exist in the backend database"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let in_mirror = match tx.virtual_email(scope, email_id, LockMode::Write).await {
            Ok(_) => true,
            Err(StoreError::NotFound) => false,
            Err(e) => return Err(e.into()),
        };
        if older_than(hist.email.date, threshold) || in_mirror {
            debug!(
                "ADD: emailId={email_id}, skip because it is too old or already exists in the virtual table"
            );
            return Ok(None);
        }

        let last_change = last_email_history_id(tx, scope, email_id).await?;
        // Mirror the latest backend value, not the history snapshot, so
        // later histories carrying stale values skip themselves.
        tx.add_virtual_email(scope, &latest, last_change).await?;
        let data = email_application_data(tx, scope, &latest, &collection.options).await?;
        debug!("Added: ServerID={}:{email_id}", scope.folder_id);
        Ok(Some(format!(
            "<Add><ServerId>{}:{email_id}</ServerId>{data}</Add>",
            scope.folder_id
        )))
    }

    async fn replay_delete(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        hist: &EmailHistory,
    ) -> Result<Option<String>, CommandError> {
        let email_id = hist.email.id;
        match tx.virtual_email(scope, email_id, LockMode::Write).await {
            Ok(_) => {}
            Err(StoreError::NotFound) => {
                debug!(
                    "DELETE: emailId={email_id}, skip because it does not exist in the virtual table"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        tx.remove_virtual_email(scope, email_id).await?;
        debug!("Deleted: ServerID={}:{email_id}", scope.folder_id);
        Ok(Some(format!(
            "<Delete><ServerId>{}:{email_id}</ServerId></Delete>",
            scope.folder_id
        )))
    }

    async fn replay_update_seen(
        &mut self,
        tx: &mut dyn Transaction,
        scope: &FolderScope,
        hist: &EmailHistory,
    ) -> Result<Option<String>, CommandError> {
        let email_id = hist.email.id;
        let virt = match tx.virtual_email(scope, email_id, LockMode::Write).await {
            Ok(v) => Some(v),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        let skip = match &virt {
            None => true,
            Some(v) => v.seen == hist.email.seen || hist.id <= v.last_history_id,
        };
        if skip {
            debug!(
                "UPDATE: emailId={email_id}, skip because it does not exist, has same value, or is already processed"
            );
            return Ok(None);
        }

        tx.update_virtual_email_seen(scope, email_id, hist.email.seen)
            .await?;
        let seen = if hist.email.seen { 1 } else { 0 };
        debug!(
            "Updated: ServerID={}:{email_id}, Seen={seen}",
            scope.folder_id
        );
        Ok(Some(format!(
            "<Change><ServerId>{}:{email_id}</ServerId><ApplicationData><email:Read>{seen}</email:Read></ApplicationData></Change>",
            scope.folder_id
        )))
    }
}

/// Last history id about `email_id`, 0 when the email has none.
async fn last_email_history_id(
    tx: &mut dyn Transaction,
    scope: &FolderScope,
    email_id: u64,
) -> Result<u64, CommandError> {
    match tx
        .last_email_history(scope.user_uid, scope.folder_id, email_id, LockMode::Read)
        .await
    {
        Ok(history) => Ok(history.id),
        Err(StoreError::NotFound) => Ok(0),
        Err(e) => Err(e.into()),
    }
}
