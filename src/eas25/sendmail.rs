use log::debug;

use super::handler::Handler;
use super::mime::MimeMessage;
use crate::error::CommandError;
use crate::store::{Email, FolderKind, FolderStore, LockMode, MailStore, Transaction};

impl Handler {
    pub(crate) async fn handle_send_mail(
        &mut self,
        tx: &mut dyn Transaction,
    ) -> Result<(), CommandError> {
        let (save_in_sent, msg) = self.parse_outgoing_request()?;
        debug!(
            "Sendmail request: SaveInSent={save_in_sent}, rcpts={:?}",
            msg.rcpts
        );

        if save_in_sent {
            let email = self.save_sent_email(tx, &msg.norm).await?;
            debug!("Stored a new sent email: ID={}", email.id);
        }

        debug!("Sending an outgoing email..");
        self.param
            .mailer
            .send(&self.credential.user_id, &msg.rcpts, &msg.norm)
            .await?;
        Ok(())
    }

    /// Validates the SaveInSent URI parameter and the message/rfc822
    /// Content-Type, then parses the body. Shared with SmartForward.
    pub(crate) fn parse_outgoing_request(&self) -> Result<(bool, MimeMessage), CommandError> {
        let save_in_sent = match self.req.query("SaveInSent") {
            Some("T") => true,
            Some("F") => false,
            other => {
                return Err(CommandError::BadRequest(format!(
                    "invalid SaveInSent URI parameter: {}",
                    other.unwrap_or_default()
                )))
            }
        };

        let content_type = self
            .req
            .header("Content-Type")
            .unwrap_or_default()
            .to_ascii_lowercase();
        if content_type != "message/rfc822" {
            return Err(CommandError::BadRequest(format!(
                "invalid Content-Type value: {content_type}"
            )));
        }

        let msg = MimeMessage::parse(&self.req.body)?;
        Ok((save_in_sent, msg))
    }

    /// Stores an outgoing message in the Sent folder, already marked seen.
    /// It shows up in subsequent Syncs as an ordinary Add history.
    pub(crate) async fn save_sent_email(
        &mut self,
        tx: &mut dyn Transaction,
        msg: &[u8],
    ) -> Result<Email, CommandError> {
        let user_uid = self.credential.user_uid;
        let sent = tx
            .folders_by_kind(user_uid, FolderKind::Sent, LockMode::Read)
            .await?;
        let Some(sent) = sent.first() else {
            return Err(CommandError::Internal("not found a sent item folder".into()));
        };

        let email = tx.add_email(user_uid, sent.id, msg).await?;
        tx.update_email(user_uid, sent.id, email.id, true).await?;
        Ok(email)
    }
}
