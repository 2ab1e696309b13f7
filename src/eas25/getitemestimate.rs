use log::debug;
use serde::Deserialize;

use super::handler::Handler;
use crate::error::CommandError;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct GetItemEstimateReq {
    collections: Collections,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Collections {
    #[serde(rename = "Collection")]
    collection: Vec<Collection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Collection {
    collection_id: u64,
}

impl Handler {
    pub(crate) fn handle_get_item_estimate(&mut self) -> Result<(), CommandError> {
        self.resp.set_wbxml(true);

        let req: GetItemEstimateReq = self.parse_body()?;
        debug!("GetItemEstimate request: {req:?}");

        // TODO: Implement this command.
        self.resp.set_status(501);
        Ok(())
    }
}
