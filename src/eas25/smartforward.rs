use log::debug;

use super::handler::Handler;
use super::mime::{build_forward_mime, MimeMessage};
use super::split_email_id;
use crate::error::CommandError;
use crate::store::{FolderStore, LockMode, MailStore, Transaction};

struct SmartForwardReq {
    save_in_sent: bool,
    collection_id: u64,
    item_id: u64,
    msg: MimeMessage,
}

impl Handler {
    pub(crate) async fn handle_smart_forward(
        &mut self,
        tx: &mut dyn Transaction,
    ) -> Result<(), CommandError> {
        let req = self.parse_smart_forward_request()?;
        debug!(
            "SmartForward request: SaveInSent={}, CollectionId={}, ItemId={}",
            req.save_in_sent, req.collection_id, req.item_id
        );

        let raw = self
            .raw_original_email(tx, req.collection_id, req.item_id)
            .await?;
        debug!("Fetched a raw email: size={}", raw.len());

        let mime = build_forward_mime(&req.msg, &raw);
        debug!(
            "Reconstructed a new MIME message for SmartForward: size={}",
            mime.len()
        );

        self.param
            .mailer
            .send(&self.credential.user_id, &req.msg.rcpts, &mime)
            .await?;

        // Keep a copy in the "Sent Messages" folder?
        if !req.save_in_sent {
            return Ok(());
        }
        let email = self.save_sent_email(tx, &mime).await?;
        debug!("Stored a new SmartForward email: ID={}", email.id);
        Ok(())
    }

    fn parse_smart_forward_request(&self) -> Result<SmartForwardReq, CommandError> {
        let (save_in_sent, msg) = self.parse_outgoing_request()?;

        let collection_id = self
            .req
            .query("CollectionId")
            .unwrap_or_default()
            .parse::<u64>()
            .map_err(|_| {
                CommandError::BadRequest("invalid CollectionId URI parameter".into())
            })?;
        let item_id = split_email_id(self.req.query("ItemId").unwrap_or_default())?;

        Ok(SmartForwardReq {
            save_in_sent,
            collection_id,
            item_id,
            msg,
        })
    }

    async fn raw_original_email(
        &mut self,
        tx: &mut dyn Transaction,
        folder_id: u64,
        email_id: u64,
    ) -> Result<Vec<u8>, CommandError> {
        debug!("raw_original_email: folderID={folder_id}, emailID={email_id}");

        // Check folder existence; read-lock it until the email is read.
        let user_uid = self.credential.user_uid;
        tx.folder_by_id(user_uid, folder_id, LockMode::Read).await?;
        Ok(tx
            .raw_email(user_uid, folder_id, email_id, LockMode::None)
            .await?)
    }
}
