//! Protocol-version plumbing shared by every ActiveSync handler: the
//! request/response buffers exchanged with the HTTP dispatcher, the
//! per-version command factory registry, and the WBXML request parsing
//! helper.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::auth::Credential;
use crate::codec::BodyCodec;
use crate::error::CommandError;
use crate::mailer::Mailer;
use crate::store::TransactionManager;

/// External collaborators handed to every command handler.
pub struct Param {
    pub tx_manager: Arc<dyn TransactionManager>,
    pub mailer: Arc<dyn Mailer>,
    pub codec: Arc<dyn BodyCodec>,
}

/// The parts of the HTTP request a command handler consumes, decoupled from
/// the HTTP framework so handlers can be driven directly in tests.
#[derive(Debug, Clone, Default)]
pub struct EasRequest {
    pub remote_addr: String,
    pub query: std::collections::HashMap<String, String>,
    /// Header names lower-cased.
    pub headers: std::collections::HashMap<String, String>,
    pub body: Vec<u8>,
}

impl EasRequest {
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Buffered response. Nothing reaches the wire until the dispatcher flushes
/// it, so a deadlock retry can discard a half-written response.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    status: Option<u16>,
    body: Vec<u8>,
    wbxml: bool,
    headers: Vec<(String, String)>,
}

impl ResponseBuffer {
    pub fn with_status(status: u16) -> Self {
        let mut resp = ResponseBuffer::default();
        resp.set_status(status);
        resp
    }

    pub fn clear(&mut self) {
        self.status = None;
        self.body.clear();
        self.headers.clear();
    }

    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        self.body.extend_from_slice(data.as_ref());
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn set_wbxml(&mut self, wbxml: bool) {
        self.wbxml = wbxml;
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_wbxml(&self) -> bool {
        self.wbxml
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

#[async_trait]
pub trait CommandHandler: Send {
    async fn handle(&mut self) -> ResponseBuffer;
}

/// One protocol version's entry point.
pub trait CommandFactory: Send + Sync {
    fn version(&self) -> &'static str;
    fn commands(&self) -> &'static [&'static str];
    fn new_handler(
        &self,
        param: Arc<Param>,
        credential: Credential,
        req: EasRequest,
    ) -> Box<dyn CommandHandler>;
}

/// Registry of protocol versions, built once at startup and immutable
/// afterwards.
#[derive(Default)]
pub struct CommandRegistry {
    factories: BTreeMap<String, Arc<dyn CommandFactory>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry::default()
    }

    pub fn register(&mut self, factory: Arc<dyn CommandFactory>) {
        self.factories.insert(factory.version().to_string(), factory);
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn get(&self, version: &str) -> Option<Arc<dyn CommandFactory>> {
        self.factories.get(version).cloned()
    }

    /// Registered versions, numerically sorted and comma-joined, for the
    /// MS-ASProtocolVersions OPTIONS header.
    pub fn versions(&self) -> String {
        let mut versions: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        versions.sort_by(|a, b| {
            let a = a.parse::<f64>().unwrap_or(0.0);
            let b = b.parse::<f64>().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
        });
        versions.join(",")
    }

    /// Union of the commands of every registered version, comma-joined, for
    /// the MS-ASProtocolCommands OPTIONS header.
    pub fn commands(&self) -> String {
        let mut set = BTreeSet::new();
        for factory in self.factories.values() {
            for cmd in factory.commands() {
                set.insert(*cmd);
            }
        }
        set.into_iter().collect::<Vec<_>>().join(",")
    }
}

/// Decodes and deserializes a WBXML request body. An empty body yields the
/// default value, which lets commands with optional bodies (Ping,
/// GetHierarchy) fall through to their own validation.
pub fn parse_wbxml_request<T>(codec: &dyn BodyCodec, body: &[u8]) -> Result<T, CommandError>
where
    T: DeserializeOwned + Default,
{
    if body.is_empty() {
        log::debug!("Empty WBXML request body");
        return Ok(T::default());
    }
    let xml = codec.decode(body)?;
    quick_xml::de::from_str(&xml)
        .map_err(|e| CommandError::BadRequest(format!("invalid request body: {e}")))
}
