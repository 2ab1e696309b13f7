// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use rand::Rng;
use serde::de::DeserializeOwned;

use crate::auth::Credential;
use crate::eas::{
    parse_wbxml_request, CommandFactory, CommandHandler, EasRequest, Param, ResponseBuffer,
};
use crate::error::CommandError;
use crate::store::{DeviceScope, FolderScope, Transaction};

pub(crate) const MAX_DEADLOCK_RETRIES: u32 = 5;
pub(crate) const MAX_SYNC_WINDOW_SIZE: usize = 100;
// The maximum number of rows fetched by one history query. Must be at least
// the maximum Sync window size.
pub(crate) const MAX_QUERY_ROWS: u64 = (MAX_SYNC_WINDOW_SIZE * 2) as u64;

pub struct Eas25Factory;

impl CommandFactory for Eas25Factory {
    fn version(&self) -> &'static str {
        "2.5"
    }

    fn commands(&self) -> &'static [&'static str] {
        &[
            "FolderCreate",
            "FolderDelete",
            "FolderUpdate",
            "Provision",
            "FolderSync",
            "Sync",
            "Ping",
            "GetAttachment",
            "GetHierarchy",
            "GetItemEstimate",
            "MoveItems",
            "SendMail",
            "SmartForward",
            "SmartReply",
        ]
    }

    fn new_handler(
        &self,
        param: Arc<Param>,
        credential: Credential,
        req: EasRequest,
    ) -> Box<dyn CommandHandler> {
        Box::new(Handler::new(param, credential, req))
    }
}

pub struct Handler {
    pub(crate) param: Arc<Param>,
    pub(crate) credential: Credential,
    pub(crate) req: EasRequest,
    pub(crate) resp: ResponseBuffer,
}

impl Handler {
    pub fn new(param: Arc<Param>, credential: Credential, req: EasRequest) -> Self {
        Handler {
            param,
            credential,
            req,
            resp: ResponseBuffer::default(),
        }
    }

    pub(crate) fn device_id(&self) -> Result<&str, CommandError> {
        // The dispatcher already rejected requests without a DeviceId.
        self.req
            .query("DeviceId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CommandError::Internal("empty DeviceID in the HTTP request".into()))
    }

    pub(crate) fn device_scope(&self) -> Result<DeviceScope, CommandError> {
        Ok(DeviceScope {
            user_uid: self.credential.user_uid,
            device_id: self.device_id()?.to_string(),
        })
    }

    pub(crate) fn folder_scope(&self, folder_id: u64) -> Result<FolderScope, CommandError> {
        Ok(FolderScope {
            user_uid: self.credential.user_uid,
            device_id: self.device_id()?.to_string(),
            folder_id,
        })
    }

    pub(crate) fn parse_body<T>(&self) -> Result<T, CommandError>
    where
        T: DeserializeOwned + Default,
    {
        parse_wbxml_request(self.param.codec.as_ref(), &self.req.body)
    }

    async fn dispatch(
        &mut self,
        tx: &mut dyn Transaction,
        cmd: &str,
    ) -> Result<(), CommandError> {
        match cmd.to_ascii_uppercase().as_str() {
            "PROVISION" => self.handle_provision()?,
            "FOLDERSYNC" => self.handle_folder_sync(tx).await?,
            "FOLDERCREATE" => self.handle_folder_create(tx).await?,
            "FOLDERDELETE" => self.handle_folder_delete(tx).await?,
            "FOLDERUPDATE" => self.handle_folder_update(tx).await?,
            "SYNC" => self.handle_sync(tx).await?,
            "GETATTACHMENT" => self.handle_get_attachment(tx).await?,
            "PING" => self.handle_ping(tx).await?,
            "GETITEMESTIMATE" => self.handle_get_item_estimate()?,
            "MOVEITEMS" => self.handle_move_items(tx).await?,
            "GETHIERARCHY" => self.handle_get_hierarchy(tx).await?,
            "SENDMAIL" => self.handle_send_mail(tx).await?,
            // SmartReply shares the SmartForward path, so a replied-to
            // message carries the previous email as an attachment.
            "SMARTFORWARD" | "SMARTREPLY" => self.handle_smart_forward(tx).await?,
            _ => {
                debug!("Unsupported command ({cmd}) request");
                self.resp.set_status(501);
                return Ok(());
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for Handler {
    async fn handle(&mut self) -> ResponseBuffer {
        let cmd = match self.req.query("Cmd").filter(|c| !c.is_empty()) {
            Some(c) => c.to_string(),
            None => {
                debug!("Missing Cmd URI parameter from {}", self.req.remote_addr);
                let mut resp = ResponseBuffer::with_status(400);
                resp.write("Missing Cmd URI parameter");
                return resp;
            }
        };
        debug!("CMD: {cmd}");

        let mut deadlock_retries = 0u32;
        loop {
            // Clear the buffered response to avoid duplication on a retry.
            self.resp.clear();
            let mut tx = match self.param.tx_manager.begin().await {
                Ok(tx) => tx,
                Err(e) => {
                    error!("Failed to create a DB transaction: {e}");
                    return ResponseBuffer::with_status(500);
                }
            };

            match self.dispatch(tx.as_mut(), &cmd).await {
                Ok(()) => return std::mem::take(&mut self.resp),
                Err(err) => {
                    let _ = tx.rollback().await;
                    if err.is_deadlock() && deadlock_retries < MAX_DEADLOCK_RETRIES {
                        deadlock_retries += 1;
                        error!("DB deadlock occurs: deadlock_retries={deadlock_retries}");
                        let backoff = rand::thread_rng().gen_range(0..500);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        continue;
                    }
                    error!("{err}");
                    return ResponseBuffer::with_status(if err.is_bad_request() {
                        400
                    } else {
                        500
                    });
                }
            }
        }
    }
}
