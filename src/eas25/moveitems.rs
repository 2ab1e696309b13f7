use log::debug;
use serde::Deserialize;

use super::handler::Handler;
use super::{split_email_id, xml_escape};
use crate::error::CommandError;
use crate::store::{FolderStore, LockMode, MailStore, StoreError, Transaction};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MoveItemsReq {
    #[serde(rename = "Move")]
    moves: Vec<MoveItem>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct MoveItem {
    src_msg_id: String,
    src_fld_id: u64,
    dst_fld_id: u64,
}

#[derive(Debug, Default)]
struct MoveItemsResp {
    responses: Vec<MoveResponse>,
}

#[derive(Debug)]
struct MoveResponse {
    src_msg_id: String,
    status: i32,
    dst_msg_id: Option<String>,
}

impl MoveItemsResp {
    fn encode(&self) -> String {
        let mut out = String::from(r#"<MoveItems xmlns="Move:">"#);
        for resp in &self.responses {
            out.push_str("<Response>");
            out.push_str(&format!(
                "<SrcMsgId>{}</SrcMsgId><Status>{}</Status>",
                xml_escape(&resp.src_msg_id),
                resp.status
            ));
            if let Some(dst) = &resp.dst_msg_id {
                out.push_str(&format!("<DstMsgId>{}</DstMsgId>", xml_escape(dst)));
            }
            out.push_str("</Response>");
        }
        out.push_str("</MoveItems>");
        out
    }
}

impl Handler {
    pub(crate) async fn handle_move_items(
        &mut self,
        tx: &mut dyn Transaction,
    ) -> Result<(), CommandError> {
        self.resp.set_wbxml(true);

        let req: MoveItemsReq = self.parse_body()?;
        debug!("MoveItems request: {req:?}");

        if req.moves.is_empty() {
            return Err(CommandError::BadRequest(format!(
                "empty MoveItems request: IP={}, UserUID={}",
                self.req.remote_addr, self.credential.user_uid
            )));
        }

        let user_uid = self.credential.user_uid;
        let mut resp = MoveItemsResp::default();
        for item in &req.moves {
            // Validate folder ids.
            if item.src_fld_id == item.dst_fld_id {
                // Source and destination collections are the same.
                resp.responses.push(MoveResponse {
                    src_msg_id: item.src_msg_id.clone(),
                    status: 4,
                    dst_msg_id: None,
                });
                continue;
            }
            if !folder_exists(tx, user_uid, item.src_fld_id).await? {
                // We don't have the source folder.
                resp.responses.push(MoveResponse {
                    src_msg_id: item.src_msg_id.clone(),
                    status: 1,
                    dst_msg_id: None,
                });
                continue;
            }
            if !folder_exists(tx, user_uid, item.dst_fld_id).await? {
                // We don't have the destination folder.
                resp.responses.push(MoveResponse {
                    src_msg_id: item.src_msg_id.clone(),
                    status: 2,
                    dst_msg_id: None,
                });
                continue;
            }

            let msg_id = split_email_id(&item.src_msg_id)?;
            // The virtual mirror is left untouched on purpose: the next Sync
            // request receives this move through the ordinary change
            // histories.
            let new_msg_id = match tx
                .move_email(user_uid, item.src_fld_id, msg_id, item.dst_fld_id)
                .await
            {
                Ok(id) => id,
                Err(StoreError::NotFound) => {
                    // We don't have the email that is being moved.
                    resp.responses.push(MoveResponse {
                        src_msg_id: item.src_msg_id.clone(),
                        status: 1,
                        dst_msg_id: None,
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            resp.responses.push(MoveResponse {
                src_msg_id: item.src_msg_id.clone(),
                status: 3,
                dst_msg_id: Some(format!("{}:{new_msg_id}", item.dst_fld_id)),
            });
        }

        self.resp.write(resp.encode());
        Ok(())
    }
}

/// Read-locks the folder so it survives until the move finishes.
async fn folder_exists(
    tx: &mut dyn Transaction,
    user_uid: u64,
    folder_id: u64,
) -> Result<bool, CommandError> {
    match tx.folder_by_id(user_uid, folder_id, LockMode::Read).await {
        Ok(_) => Ok(true),
        Err(StoreError::NotFound) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
