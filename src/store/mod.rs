//! Storage interfaces consumed by the sync engine.
//!
//! The engine never talks to a database directly; it goes through the
//! `FolderStore`, `MailStore` and `SyncStore` traits, all three implemented
//! by a single `Transaction` handle obtained from a `TransactionManager`.
//! Every read that feeds a later write in the same transaction carries a
//! `LockMode` hint so a row-locking backend can serialize concurrent
//! requests; backends that serialize whole transactions may ignore it.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub type UserUid = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("duplicated row")]
    Duplicated,
    #[error("deadlock detected")]
    Deadlock,
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderKind {
    Inbox,
    Draft,
    Trash,
    Sent,
    Outbox,
    /// Plain user-created email folder.
    Folder,
}

#[derive(Debug, Clone)]
pub struct Folder {
    pub id: u64,
    pub name: String,
    /// Parent folder id, 0 for the root.
    pub parent_id: u64,
    pub kind: FolderKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailAddress {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct Email {
    pub id: u64,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub reply_to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub body: String,
    /// Charset of the root MIME part; empty when unknown.
    pub charset: String,
    pub attachments: Vec<Attachment>,
    pub seen: bool,
}

/// Attachment metadata. The decoded payload is fetched separately through
/// `MailStore::attachment`, which keeps the handle free of any back
/// reference into the store that produced it.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: u64,
    pub name: String,
    /// MIME Content-Type; empty when the part did not carry one.
    pub content_type: String,
    /// MIME Content-ID without the surrounding angle brackets.
    pub content_id: String,
    /// Length of the decoded payload.
    pub size: u64,
    pub inline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderOperation {
    Add,
    Delete,
    Update,
}

/// One row of the append-only folder change log. Ids are strictly
/// increasing per user.
#[derive(Debug, Clone)]
pub struct FolderHistory {
    pub id: u64,
    pub operation: FolderOperation,
    /// Snapshot of the folder at mutation time.
    pub folder: Folder,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailOperation {
    Add,
    Delete,
    UpdateSeen,
}

/// One row of the append-only email change log. Ids are strictly
/// increasing per (user, folder).
#[derive(Debug, Clone)]
pub struct EmailHistory {
    pub id: u64,
    pub operation: EmailOperation,
    /// Snapshot of the email at mutation time.
    pub email: Email,
    pub timestamp: DateTime<Utc>,
}

/// Scope of the folder-hierarchy sync state.
#[derive(Debug, Clone)]
pub struct DeviceScope {
    pub user_uid: UserUid,
    pub device_id: String,
}

/// Scope of the per-folder email sync state.
#[derive(Debug, Clone)]
pub struct FolderScope {
    pub user_uid: UserUid,
    pub device_id: String,
    pub folder_id: u64,
}

/// Per-device projection of a folder the device currently knows about.
#[derive(Debug, Clone)]
pub struct VirtualFolder {
    pub folder_id: u64,
    pub parent_id: u64,
    pub name: String,
    /// Id of the folder history row that produced this projection. Never
    /// decreases; used to skip already-applied updates during replay.
    pub last_history_id: u64,
}

/// Per-device projection of an email the device currently knows about.
#[derive(Debug, Clone)]
pub struct VirtualEmail {
    pub email_id: u64,
    pub seen: bool,
    /// The email's Date; drives soft-deletion past the time filter.
    pub timestamp: DateTime<Utc>,
    pub last_history_id: u64,
}

#[async_trait]
pub trait FolderStore {
    /// All live folders of the user, ascending by id.
    async fn folders(&mut self, user: UserUid, lock: LockMode) -> Result<Vec<Folder>, StoreError>;

    async fn folder_by_id(
        &mut self,
        user: UserUid,
        folder_id: u64,
        lock: LockMode,
    ) -> Result<Folder, StoreError>;

    async fn folders_by_kind(
        &mut self,
        user: UserUid,
        kind: FolderKind,
        lock: LockMode,
    ) -> Result<Vec<Folder>, StoreError>;

    /// Creates a folder and appends a FolderAdd history row. Fails with
    /// `NotFound` when the parent is missing and `Duplicated` when the
    /// parent already contains a folder of that name.
    async fn add_folder(
        &mut self,
        user: UserUid,
        parent_id: u64,
        name: &str,
        kind: FolderKind,
    ) -> Result<u64, StoreError>;

    /// Tombstones a folder and appends a FolderDelete history row.
    async fn delete_folder(&mut self, user: UserUid, folder_id: u64) -> Result<(), StoreError>;

    /// Renames and/or reparents a folder and appends a FolderUpdate history
    /// row. Same error contract as `add_folder`.
    async fn update_folder(
        &mut self,
        user: UserUid,
        folder_id: u64,
        new_parent_id: u64,
        new_name: &str,
    ) -> Result<(), StoreError>;

    /// Folder histories starting at id `offset`. With `desc` set, a zero
    /// offset means "from the newest row". Zero limit means no limit.
    async fn folder_histories(
        &mut self,
        user: UserUid,
        offset: u64,
        limit: u64,
        desc: bool,
        lock: LockMode,
    ) -> Result<Vec<FolderHistory>, StoreError>;

    /// The newest history row about `folder_id`.
    async fn last_folder_history(
        &mut self,
        user: UserUid,
        folder_id: u64,
        lock: LockMode,
    ) -> Result<FolderHistory, StoreError>;
}

#[async_trait]
pub trait MailStore {
    /// Live emails of a folder starting at id `offset`. With `desc` set, a
    /// zero offset means "from the newest email". Zero limit means no limit.
    async fn emails(
        &mut self,
        user: UserUid,
        folder_id: u64,
        offset: u64,
        limit: u64,
        desc: bool,
        lock: LockMode,
    ) -> Result<Vec<Email>, StoreError>;

    async fn email(
        &mut self,
        user: UserUid,
        folder_id: u64,
        email_id: u64,
        lock: LockMode,
    ) -> Result<Email, StoreError>;

    async fn raw_email(
        &mut self,
        user: UserUid,
        folder_id: u64,
        email_id: u64,
        lock: LockMode,
    ) -> Result<Vec<u8>, StoreError>;

    /// Attachment metadata plus its decoded payload.
    async fn attachment(
        &mut self,
        user: UserUid,
        folder_id: u64,
        attachment_id: u64,
    ) -> Result<(Attachment, Vec<u8>), StoreError>;

    /// Parses and stores a raw RFC822 message, appending an EmailAdd
    /// history row.
    async fn add_email(
        &mut self,
        user: UserUid,
        folder_id: u64,
        raw: &[u8],
    ) -> Result<Email, StoreError>;

    /// Updates the seen flag and appends an EmailUpdateSeen history row.
    async fn update_email(
        &mut self,
        user: UserUid,
        folder_id: u64,
        email_id: u64,
        seen: bool,
    ) -> Result<(), StoreError>;

    /// Tombstones an email and appends an EmailDelete history row.
    async fn delete_email(
        &mut self,
        user: UserUid,
        folder_id: u64,
        email_id: u64,
    ) -> Result<(), StoreError>;

    /// Moves an email into another folder under a fresh id, appending an
    /// EmailDelete history to the source folder and an EmailAdd history to
    /// the destination. Returns the new email id.
    async fn move_email(
        &mut self,
        user: UserUid,
        folder_id: u64,
        email_id: u64,
        new_folder_id: u64,
    ) -> Result<u64, StoreError>;

    /// Email histories of a folder starting at id `offset`; same offset
    /// and limit conventions as `folder_histories`.
    async fn email_histories(
        &mut self,
        user: UserUid,
        folder_id: u64,
        offset: u64,
        limit: u64,
        desc: bool,
        lock: LockMode,
    ) -> Result<Vec<EmailHistory>, StoreError>;

    /// The newest history row about `email_id` within the folder.
    async fn last_email_history(
        &mut self,
        user: UserUid,
        folder_id: u64,
        email_id: u64,
        lock: LockMode,
    ) -> Result<EmailHistory, StoreError>;
}

/// Key–cursor registry and virtual mirror, for both the folder-hierarchy
/// scope and the per-folder email scope.
#[async_trait]
pub trait SyncStore {
    async fn clear_folder_sync_keys(&mut self, scope: &DeviceScope) -> Result<(), StoreError>;

    /// Resolves a sync key to its history cursor. Callers that validate or
    /// rotate the key must hold the row lock they pass here.
    async fn load_folder_sync_key(
        &mut self,
        scope: &DeviceScope,
        sync_key: u64,
        lock: LockMode,
    ) -> Result<u64, StoreError>;

    /// Issues the next sync key bound to `history_id`.
    async fn new_folder_sync_key(
        &mut self,
        scope: &DeviceScope,
        history_id: u64,
    ) -> Result<u64, StoreError>;

    /// The greatest sync key in the scope, or None when the table is empty.
    async fn last_folder_sync_key(
        &mut self,
        scope: &DeviceScope,
        lock: LockMode,
    ) -> Result<Option<u64>, StoreError>;

    async fn clear_virtual_folders(&mut self, scope: &DeviceScope) -> Result<(), StoreError>;

    async fn add_virtual_folder(
        &mut self,
        scope: &DeviceScope,
        folder: &Folder,
        last_history_id: u64,
    ) -> Result<(), StoreError>;

    async fn virtual_folder(
        &mut self,
        scope: &DeviceScope,
        folder_id: u64,
        lock: LockMode,
    ) -> Result<VirtualFolder, StoreError>;

    async fn update_virtual_folder(
        &mut self,
        scope: &DeviceScope,
        folder: &Folder,
    ) -> Result<(), StoreError>;

    async fn remove_virtual_folder(
        &mut self,
        scope: &DeviceScope,
        folder_id: u64,
    ) -> Result<(), StoreError>;

    async fn clear_email_sync_keys(&mut self, scope: &FolderScope) -> Result<(), StoreError>;

    async fn load_email_sync_key(
        &mut self,
        scope: &FolderScope,
        sync_key: u64,
        lock: LockMode,
    ) -> Result<u64, StoreError>;

    async fn new_email_sync_key(
        &mut self,
        scope: &FolderScope,
        history_id: u64,
    ) -> Result<u64, StoreError>;

    async fn last_email_sync_key(
        &mut self,
        scope: &FolderScope,
        lock: LockMode,
    ) -> Result<Option<u64>, StoreError>;

    async fn clear_virtual_emails(&mut self, scope: &FolderScope) -> Result<(), StoreError>;

    async fn add_virtual_email(
        &mut self,
        scope: &FolderScope,
        email: &Email,
        last_history_id: u64,
    ) -> Result<(), StoreError>;

    async fn virtual_email(
        &mut self,
        scope: &FolderScope,
        email_id: u64,
        lock: LockMode,
    ) -> Result<VirtualEmail, StoreError>;

    /// The virtual email with the smallest id, or None when the mirror is
    /// empty. Drives initial-sync paging.
    async fn oldest_virtual_email(
        &mut self,
        scope: &FolderScope,
        lock: LockMode,
    ) -> Result<Option<VirtualEmail>, StoreError>;

    /// Virtual emails with `timestamp < threshold`, ascending by timestamp,
    /// at most `limit` rows. Drives soft-deletion.
    async fn old_virtual_emails(
        &mut self,
        scope: &FolderScope,
        threshold: DateTime<Utc>,
        limit: usize,
        lock: LockMode,
    ) -> Result<Vec<VirtualEmail>, StoreError>;

    async fn update_virtual_email_seen(
        &mut self,
        scope: &FolderScope,
        email_id: u64,
        seen: bool,
    ) -> Result<(), StoreError>;

    async fn remove_virtual_email(
        &mut self,
        scope: &FolderScope,
        email_id: u64,
    ) -> Result<(), StoreError>;
}

/// A single database transaction. Commands run entirely inside one
/// transaction; Ping additionally restarts its transaction between poll
/// sleeps to observe concurrent commits.
#[async_trait]
pub trait Transaction: FolderStore + MailStore + SyncStore + Send {
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Rolls back any pending work. A no-op on an already finished
    /// transaction, so error paths may call it unconditionally.
    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Commits the current work and begins a fresh transaction on the same
    /// handle.
    async fn restart(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}
