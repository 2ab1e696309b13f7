use log::debug;

use super::handler::Handler;
use crate::error::CommandError;
use crate::store::{MailStore, StoreError, Transaction};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

impl Handler {
    pub(crate) async fn handle_get_attachment(
        &mut self,
        tx: &mut dyn Transaction,
    ) -> Result<(), CommandError> {
        debug!("GetAttachment request: {:?}", self.req.query);

        let name = self
            .req
            .query("AttachmentName")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                CommandError::BadRequest("missing AttachmentName URI parameter".into())
            })?;
        let (folder_id, attachment_id) = split_attachment_name(name)?;

        let (attachment, value) = match tx
            .attachment(self.credential.user_uid, folder_id, attachment_id)
            .await
        {
            Ok(found) => found,
            Err(StoreError::NotFound) => {
                // Retrieving an attachment deleted on the server yields an
                // HTTP 500 per the protocol.
                return Err(CommandError::Internal(format!(
                    "not found attachment: attachID={attachment_id}"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let content_type = if attachment.content_type.is_empty() {
            DEFAULT_CONTENT_TYPE
        } else {
            &attachment.content_type
        };
        self.resp.set_header("Content-Type", content_type);
        self.resp
            .set_header("Content-Length", &value.len().to_string());
        self.resp.write(value);
        Ok(())
    }
}

/// Parses the `<folderID>:<attachmentID>` AttachmentName URI parameter.
fn split_attachment_name(name: &str) -> Result<(u64, u64), CommandError> {
    let mut parts = name.split(':');
    let (Some(folder), Some(attachment), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(CommandError::BadRequest(format!(
            "invalid AttachmentName format: {name}"
        )));
    };
    let folder_id = folder
        .parse::<u64>()
        .map_err(|_| CommandError::BadRequest(format!("non-numeric ID value: {folder}")))?;
    let attachment_id = attachment
        .parse::<u64>()
        .map_err(|_| CommandError::BadRequest(format!("non-numeric ID value: {attachment}")))?;
    Ok((folder_id, attachment_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_name_parsing() {
        assert_eq!(split_attachment_name("3:17").unwrap(), (3, 17));
        assert!(split_attachment_name("3").is_err());
        assert!(split_attachment_name("3:x").is_err());
        assert!(split_attachment_name("3:17:1").is_err());
    }
}
