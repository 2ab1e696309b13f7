// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::time::Duration;

use lazy_static::lazy_static;
use log::debug;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::Instant;

use super::handler::Handler;
use crate::error::CommandError;
use crate::store::{FolderStore, LockMode, MailStore, StoreError, SyncStore, Transaction, UserUid};

const MAX_PING_FOLDERS: usize = 20;
const MIN_HEARTBEAT_INTERVAL: u64 = 60; // sec
const MAX_HEARTBEAT_INTERVAL: u64 = 600; // sec
const POLL_INTERVAL: Duration = Duration::from_secs(15);

lazy_static! {
    // Process-local; a load-balanced deployment would move this to a shared
    // store. Not a correctness dependency: a lost entry only costs the
    // client one status-3 "resend" round-trip.
    static ref PING_REQ_CACHE: Mutex<HashMap<String, PingReq>> = Mutex::new(HashMap::new());
}

fn cache_ping_req(user_uid: UserUid, device_id: &str, req: &PingReq) {
    let key = format!("{user_uid}:{device_id}");
    PING_REQ_CACHE.lock().insert(key, req.clone());
}

fn load_cached_ping_req(user_uid: UserUid, device_id: &str) -> Option<PingReq> {
    let key = format!("{user_uid}:{device_id}");
    PING_REQ_CACHE.lock().get(&key).cloned()
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub(crate) struct PingReq {
    pub heartbeat_interval: u64,
    pub folders: PingFolders,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct PingFolders {
    #[serde(rename = "Folder")]
    pub folder: Vec<PingFolder>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub(crate) struct PingFolder {
    pub id: u64,
    pub class: String,
}

#[derive(Debug, Default)]
struct PingResp {
    status: i32,
    heartbeat_interval: Option<u64>,
    max_folders: Option<usize>,
    folders: Vec<u64>,
}

impl PingResp {
    fn status(status: i32) -> Self {
        PingResp {
            status,
            ..Default::default()
        }
    }

    fn encode(&self) -> String {
        let mut out = String::from(r#"<Ping xmlns="Ping:">"#);
        out.push_str(&format!("<Status>{}</Status>", self.status));
        if let Some(interval) = self.heartbeat_interval {
            out.push_str(&format!("<HeartbeatInterval>{interval}</HeartbeatInterval>"));
        }
        if let Some(max) = self.max_folders {
            out.push_str(&format!("<MaxFolders>{max}</MaxFolders>"));
        }
        if !self.folders.is_empty() {
            out.push_str("<Folders>");
            for id in &self.folders {
                out.push_str(&format!("<Folder>{id}</Folder>"));
            }
            out.push_str("</Folders>");
        }
        out.push_str("</Ping>");
        out
    }
}

impl Handler {
    // Ping returns immediately while there are histories to be synced in the
    // monitored folders. No read or write lock may be held in the scan loop:
    // it would block other requests for the whole sleep.
    pub(crate) async fn handle_ping(
        &mut self,
        tx: &mut dyn Transaction,
    ) -> Result<(), CommandError> {
        self.resp.set_wbxml(true);

        let req: PingReq = self.parse_body()?;
        debug!("Ping request: {req:?}");

        let response = self.ping(tx, req).await?;
        self.resp.write(response.encode());
        Ok(())
    }

    async fn ping(
        &mut self,
        tx: &mut dyn Transaction,
        mut req: PingReq,
    ) -> Result<PingResp, CommandError> {
        let user_uid = self.credential.user_uid;
        let device_id = self.device_id()?.to_string();

        // Trimmed request body?
        if req.folders.folder.is_empty() || req.heartbeat_interval == 0 {
            let Some(mut cached) = load_cached_ping_req(user_uid, &device_id) else {
                debug!(
                    "Invalid Ping request: # of folders = {}, HeartbeatInterval = {}",
                    req.folders.folder.len(),
                    req.heartbeat_interval
                );
                // Ask the client to reissue Ping with the entire XML body.
                return Ok(PingResp::status(3));
            };
            debug!("Loaded the Ping request cache: {cached:?}");

            // The fields present in this request overwrite the cached copy.
            if !req.folders.folder.is_empty() {
                cached.folders = req.folders.clone();
                debug!("Updated the Ping request cache: Folders={:?}", cached.folders);
            }
            if req.heartbeat_interval != 0 {
                cached.heartbeat_interval = req.heartbeat_interval;
                debug!(
                    "Updated the Ping request cache: HeartbeatInterval={}",
                    cached.heartbeat_interval
                );
            }
            req = cached;
        }

        // Ask for a shorter folder list when too many were requested.
        if req.folders.folder.len() > MAX_PING_FOLDERS {
            debug!(
                "Too many monitoring folders in the Ping request: {}",
                req.folders.folder.len()
            );
            let mut resp = PingResp::status(6);
            resp.max_folders = Some(MAX_PING_FOLDERS);
            return Ok(resp);
        }
        // Ask for an adjusted heartbeat when outside the allowed range.
        if req.heartbeat_interval < MIN_HEARTBEAT_INTERVAL {
            debug!("HeartbeatInterval is too short: {}", req.heartbeat_interval);
            let mut resp = PingResp::status(5);
            resp.heartbeat_interval = Some(MIN_HEARTBEAT_INTERVAL);
            return Ok(resp);
        }
        if req.heartbeat_interval > MAX_HEARTBEAT_INTERVAL {
            debug!("HeartbeatInterval is too long: {}", req.heartbeat_interval);
            let mut resp = PingResp::status(5);
            resp.heartbeat_interval = Some(MAX_HEARTBEAT_INTERVAL);
            return Ok(resp);
        }

        cache_ping_req(user_uid, &device_id, &req);
        let deadline = Instant::now() + Duration::from_secs(req.heartbeat_interval);
        loop {
            let mut changes = Vec::new();
            for folder in &req.folders.folder {
                // Check folder existence.
                match tx.folder_by_id(user_uid, folder.id, LockMode::None).await {
                    Ok(_) => {}
                    Err(StoreError::NotFound) => {
                        debug!("Unknown folder ID in the Ping request: folderID={}", folder.id);
                        // The folder hierarchy is out of date.
                        return Ok(PingResp::status(7));
                    }
                    Err(e) => return Err(e.into()),
                }

                let scope = self.folder_scope(folder.id)?;
                // An empty sync key table means nothing to notify about.
                let Some(last_sync_key) = tx.last_email_sync_key(&scope, LockMode::None).await?
                else {
                    continue;
                };
                // NotFound here is a logic error, not a client condition.
                let history_id = tx
                    .load_email_sync_key(&scope, last_sync_key, LockMode::None)
                    .await?;

                let histories = tx
                    .email_histories(user_uid, folder.id, 0, 1, true, LockMode::None)
                    .await?;
                if let Some(last) = histories.first() {
                    if history_id != last.id {
                        changes.push(folder.id);
                    }
                }
            }

            if !changes.is_empty() {
                // There are histories to be synced.
                debug!("Ping found {} changes: folder IDs={changes:?}", changes.len());
                let mut resp = PingResp::status(2);
                resp.folders = changes;
                return Ok(resp);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("No changes during the Ping period!");
                // No changed folders to be synchronized.
                return Ok(PingResp::status(1));
            }
            let gap = std::cmp::min(deadline - now, POLL_INTERVAL);
            debug!("Sleeping for {gap:?}..");
            tokio::time::sleep(gap).await;

            // Restart the transaction to observe freshly committed rows.
            tx.restart().await?;
        }
    }
}
