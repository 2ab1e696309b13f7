use super::handler::Handler;
use super::{as_folder_type, xml_escape};
use crate::error::CommandError;
use crate::store::{FolderStore, LockMode, Transaction};

impl Handler {
    // GetHierarchy has no XML body in the request.
    pub(crate) async fn handle_get_hierarchy(
        &mut self,
        tx: &mut dyn Transaction,
    ) -> Result<(), CommandError> {
        self.resp.set_wbxml(true);

        let folders = tx
            .folders(self.credential.user_uid, LockMode::None)
            .await?;

        // Folders is the top-level element here, not GetHierarchy.
        let mut out = String::from(r#"<Folders xmlns="FolderHierarchy:">"#);
        for folder in &folders {
            out.push_str(&format!(
                "<Folder><ServerId>{}</ServerId><ParentId>{}</ParentId><DisplayName>{}</DisplayName><Type>{}</Type></Folder>",
                folder.id,
                folder.parent_id,
                xml_escape(&folder.name),
                as_folder_type(folder),
            ));
        }
        out.push_str("</Folders>");
        self.resp.write(out);
        Ok(())
    }
}
