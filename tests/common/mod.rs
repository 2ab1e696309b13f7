//! Shared fixtures: an in-memory server context, seeding helpers, and a
//! driver that feeds commands straight into the 2.5 handler.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use rustysync::auth::Credential;
use rustysync::codec::PlainXmlCodec;
use rustysync::eas::{CommandHandler, EasRequest, Param, ResponseBuffer};
use rustysync::eas25::Handler;
use rustysync::error::MailerError;
use rustysync::mailer::Mailer;
use rustysync::store::memory::MemoryStore;
use rustysync::store::{
    FolderKind, FolderStore, LockMode, MailStore, Transaction, TransactionManager, UserUid,
};

pub const USER: UserUid = 1;
pub const USER_ID: &str = "tester";

#[derive(Debug, Clone)]
pub struct SentMail {
    pub from: String,
    pub to: Vec<String>,
    pub msg: Vec<u8>,
}

/// Records outgoing mail instead of relaying it.
#[derive(Default, Clone)]
pub struct RecordingMailer {
    pub sent: Arc<Mutex<Vec<SentMail>>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, from: &str, to: &[String], msg: &[u8]) -> Result<(), MailerError> {
        self.sent.lock().push(SentMail {
            from: from.to_string(),
            to: to.to_vec(),
            msg: msg.to_vec(),
        });
        Ok(())
    }
}

pub struct TestServer {
    pub store: MemoryStore,
    pub param: Arc<Param>,
    pub mailer: RecordingMailer,
}

impl TestServer {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let mailer = RecordingMailer::default();
        let param = Arc::new(Param {
            tx_manager: Arc::new(store.clone()),
            mailer: Arc::new(mailer.clone()),
            codec: Arc::new(PlainXmlCodec),
        });
        TestServer {
            store,
            param,
            mailer,
        }
    }

    pub fn credential(&self) -> Credential {
        Credential {
            authorized: true,
            user_id: USER_ID.to_string(),
            user_uid: USER,
        }
    }

    pub fn request(&self, cmd: &str, device: &str, query: &[(&str, &str)], body: &[u8]) -> EasRequest {
        let mut q = HashMap::new();
        q.insert("Cmd".to_string(), cmd.to_string());
        q.insert("DeviceId".to_string(), device.to_string());
        for (name, value) in query {
            q.insert(name.to_string(), value.to_string());
        }
        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/vnd.ms-sync.wbxml".to_string(),
        );
        EasRequest {
            remote_addr: "127.0.0.1:4711".to_string(),
            query: q,
            headers,
            body: body.to_vec(),
        }
    }

    /// Runs one command through a fresh handler and returns the buffered
    /// response.
    pub async fn run(
        &self,
        cmd: &str,
        device: &str,
        query: &[(&str, &str)],
        body: &str,
    ) -> ResponseBuffer {
        self.run_raw(cmd, device, query, body.as_bytes()).await
    }

    pub async fn run_raw(
        &self,
        cmd: &str,
        device: &str,
        query: &[(&str, &str)],
        body: &[u8],
    ) -> ResponseBuffer {
        let req = self.request(cmd, device, query, body);
        let mut handler = Handler::new(self.param.clone(), self.credential(), req);
        handler.handle().await
    }

    pub async fn seed_folder(&self, parent_id: u64, name: &str, kind: FolderKind) -> u64 {
        let mut tx = self.store.begin().await.expect("begin");
        let id = tx
            .add_folder(USER, parent_id, name, kind)
            .await
            .expect("add_folder");
        tx.commit().await.expect("commit");
        id
    }

    pub async fn seed_email(&self, folder_id: u64, subject: &str, date: DateTime<Utc>) -> u64 {
        let raw = format!(
            "From: Alice <alice@example.com>\r\nTo: Bob <bob@example.com>\r\nSubject: {subject}\r\nDate: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nbody of {subject}\r\n",
            date.to_rfc2822()
        );
        self.seed_raw_email(folder_id, raw.as_bytes()).await
    }

    pub async fn seed_raw_email(&self, folder_id: u64, raw: &[u8]) -> u64 {
        let mut tx = self.store.begin().await.expect("begin");
        let email = tx.add_email(USER, folder_id, raw).await.expect("add_email");
        tx.commit().await.expect("commit");
        email.id
    }

    pub async fn mark_seen(&self, folder_id: u64, email_id: u64, seen: bool) {
        let mut tx = self.store.begin().await.expect("begin");
        tx.update_email(USER, folder_id, email_id, seen)
            .await
            .expect("update_email");
        tx.commit().await.expect("commit");
    }

    pub async fn delete_email(&self, folder_id: u64, email_id: u64) {
        let mut tx = self.store.begin().await.expect("begin");
        tx.delete_email(USER, folder_id, email_id)
            .await
            .expect("delete_email");
        tx.commit().await.expect("commit");
    }

    pub async fn emails_in(&self, folder_id: u64) -> Vec<rustysync::store::Email> {
        let mut tx = self.store.begin().await.expect("begin");
        let emails = tx
            .emails(USER, folder_id, 0, 0, false, LockMode::None)
            .await
            .expect("emails");
        tx.rollback().await.expect("rollback");
        emails
    }
}

/// Extracts the first `<SyncKey>` value from a response body.
pub fn sync_key_of(resp: &ResponseBuffer) -> u64 {
    extract_u64(&resp.body_str(), "SyncKey").expect("response carries a SyncKey")
}

/// Extracts the first `<tag>` integer value from an XML string.
pub fn extract_u64(xml: &str, tag: &str) -> Option<u64> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    xml[start..end].parse().ok()
}

pub fn count_occurrences(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}
