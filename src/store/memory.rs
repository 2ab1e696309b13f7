// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory implementation of the storage interfaces.
//!
//! `begin` takes an owned async mutex over the whole store and clones the
//! state into a working set; `commit` publishes the working set and releases
//! the mutex, `rollback` just releases it. Transactions are therefore fully
//! serialized: a second request carrying the same sync key blocks in `begin`
//! until the first one commits, which is exactly the serialization the
//! row-lock hints ask a SQL backend for. Lock hints are accepted and
//! ignored.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{Address, MessageParser, MimeHeaders};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    Attachment, DeviceScope, Email, EmailAddress, EmailHistory, EmailOperation, Folder,
    FolderHistory, FolderKind, FolderOperation, FolderScope, FolderStore, LockMode, MailStore,
    StoreError, SyncStore, Transaction, TransactionManager, UserUid, VirtualEmail, VirtualFolder,
};

#[derive(Debug, Clone)]
struct FolderRow {
    folder: Folder,
    available: bool,
}

#[derive(Debug, Clone)]
struct EmailRow {
    email: Email,
    folder_id: u64,
    raw: Vec<u8>,
    /// Decoded attachment payloads keyed by attachment id.
    blobs: HashMap<u64, Vec<u8>>,
    available: bool,
}

/// Sync state of one (device, folder) pair.
type EmailScopeKey = (String, u64);

#[derive(Debug, Clone, Default)]
struct UserState {
    folders: BTreeMap<u64, FolderRow>,
    emails: BTreeMap<u64, EmailRow>,
    folder_histories: Vec<FolderHistory>,
    email_histories: HashMap<u64, Vec<EmailHistory>>,
    next_folder_id: u64,
    next_email_id: u64,
    next_attachment_id: u64,
    next_folder_history_id: u64,
    next_email_history_id: u64,
    folder_sync_keys: HashMap<String, BTreeMap<u64, u64>>,
    virtual_folders: HashMap<String, BTreeMap<u64, VirtualFolder>>,
    email_sync_keys: HashMap<EmailScopeKey, BTreeMap<u64, u64>>,
    virtual_emails: HashMap<EmailScopeKey, BTreeMap<u64, VirtualEmail>>,
}

#[derive(Debug, Clone, Default)]
struct MemState {
    users: HashMap<UserUid, UserState>,
    // Sync keys auto-increment per table, like the SQL schema.
    next_folder_sync_key: u64,
    next_email_sync_key: u64,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemState>>,
    injected_deadlocks: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection for tests: the next `n` commits fail with
    /// `StoreError::Deadlock`, exercising the handler retry loop.
    pub fn inject_commit_deadlocks(&self, n: u32) {
        self.injected_deadlocks.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionManager for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            guard: Some(guard),
            work: Some(work),
            injected_deadlocks: self.injected_deadlocks.clone(),
        }))
    }
}

pub struct MemoryTransaction {
    state: Arc<Mutex<MemState>>,
    guard: Option<OwnedMutexGuard<MemState>>,
    work: Option<MemState>,
    injected_deadlocks: Arc<AtomicU32>,
}

impl MemoryTransaction {
    fn work(&mut self) -> Result<&mut MemState, StoreError> {
        self.work
            .as_mut()
            .ok_or_else(|| StoreError::Backend("transaction already finished".into()))
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut pending = self.injected_deadlocks.load(Ordering::SeqCst);
        while pending > 0 {
            match self.injected_deadlocks.compare_exchange(
                pending,
                pending - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    // The injected deadlock aborts the transaction.
                    self.work = None;
                    self.guard = None;
                    return Err(StoreError::Deadlock);
                }
                Err(current) => pending = current,
            }
        }

        let work = self
            .work
            .take()
            .ok_or_else(|| StoreError::Backend("transaction already finished".into()))?;
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| StoreError::Backend("transaction already finished".into()))?;
        *guard = work;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.work = None;
        self.guard = None;
        Ok(())
    }

    async fn restart(&mut self) -> Result<(), StoreError> {
        self.commit().await?;
        let guard = self.state.clone().lock_owned().await;
        self.work = Some(guard.clone());
        self.guard = Some(guard);
        Ok(())
    }
}

fn user(state: &mut MemState, uid: UserUid) -> &mut UserState {
    state.users.entry(uid).or_default()
}

fn next_id(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

/// Applies the shared offset/limit conventions to an ascending id range.
fn select_range<T: Clone>(rows: &[T], id_of: impl Fn(&T) -> u64, offset: u64, limit: u64, desc: bool) -> Vec<T> {
    let mut out: Vec<T> = if desc {
        rows.iter()
            .rev()
            .filter(|r| offset == 0 || id_of(r) <= offset)
            .cloned()
            .collect()
    } else {
        rows.iter().filter(|r| id_of(r) >= offset).cloned().collect()
    };
    if limit > 0 && out.len() > limit as usize {
        out.truncate(limit as usize);
    }
    out
}

#[async_trait]
impl FolderStore for MemoryTransaction {
    async fn folders(&mut self, uid: UserUid, _lock: LockMode) -> Result<Vec<Folder>, StoreError> {
        let u = user(self.work()?, uid);
        Ok(u.folders
            .values()
            .filter(|r| r.available)
            .map(|r| r.folder.clone())
            .collect())
    }

    async fn folder_by_id(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        _lock: LockMode,
    ) -> Result<Folder, StoreError> {
        let u = user(self.work()?, uid);
        u.folders
            .get(&folder_id)
            .filter(|r| r.available)
            .map(|r| r.folder.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn folders_by_kind(
        &mut self,
        uid: UserUid,
        kind: FolderKind,
        _lock: LockMode,
    ) -> Result<Vec<Folder>, StoreError> {
        let u = user(self.work()?, uid);
        Ok(u.folders
            .values()
            .filter(|r| r.available && r.folder.kind == kind)
            .map(|r| r.folder.clone())
            .collect())
    }

    async fn add_folder(
        &mut self,
        uid: UserUid,
        parent_id: u64,
        name: &str,
        kind: FolderKind,
    ) -> Result<u64, StoreError> {
        let u = user(self.work()?, uid);
        if parent_id != 0 && !u.folders.get(&parent_id).map(|r| r.available).unwrap_or(false) {
            return Err(StoreError::NotFound);
        }
        let duplicated = u
            .folders
            .values()
            .any(|r| r.available && r.folder.parent_id == parent_id && r.folder.name == name);
        if duplicated {
            return Err(StoreError::Duplicated);
        }

        let id = next_id(&mut u.next_folder_id);
        let folder = Folder {
            id,
            name: name.to_string(),
            parent_id,
            kind,
        };
        u.folders.insert(
            id,
            FolderRow {
                folder: folder.clone(),
                available: true,
            },
        );
        let history_id = next_id(&mut u.next_folder_history_id);
        u.folder_histories.push(FolderHistory {
            id: history_id,
            operation: FolderOperation::Add,
            folder,
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    async fn delete_folder(&mut self, uid: UserUid, folder_id: u64) -> Result<(), StoreError> {
        let u = user(self.work()?, uid);
        let row = u
            .folders
            .get_mut(&folder_id)
            .filter(|r| r.available)
            .ok_or(StoreError::NotFound)?;
        row.available = false;
        let snapshot = row.folder.clone();
        let history_id = next_id(&mut u.next_folder_history_id);
        u.folder_histories.push(FolderHistory {
            id: history_id,
            operation: FolderOperation::Delete,
            folder: snapshot,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn update_folder(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        new_parent_id: u64,
        new_name: &str,
    ) -> Result<(), StoreError> {
        let u = user(self.work()?, uid);
        if !u.folders.get(&folder_id).map(|r| r.available).unwrap_or(false) {
            return Err(StoreError::NotFound);
        }
        if new_parent_id != 0
            && !u
                .folders
                .get(&new_parent_id)
                .map(|r| r.available)
                .unwrap_or(false)
        {
            return Err(StoreError::NotFound);
        }
        let duplicated = u.folders.values().any(|r| {
            r.available
                && r.folder.id != folder_id
                && r.folder.parent_id == new_parent_id
                && r.folder.name == new_name
        });
        if duplicated {
            return Err(StoreError::Duplicated);
        }

        let row = u.folders.get_mut(&folder_id).ok_or(StoreError::NotFound)?;
        row.folder.parent_id = new_parent_id;
        row.folder.name = new_name.to_string();
        let snapshot = row.folder.clone();
        let history_id = next_id(&mut u.next_folder_history_id);
        u.folder_histories.push(FolderHistory {
            id: history_id,
            operation: FolderOperation::Update,
            folder: snapshot,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn folder_histories(
        &mut self,
        uid: UserUid,
        offset: u64,
        limit: u64,
        desc: bool,
        _lock: LockMode,
    ) -> Result<Vec<FolderHistory>, StoreError> {
        let u = user(self.work()?, uid);
        Ok(select_range(&u.folder_histories, |h| h.id, offset, limit, desc))
    }

    async fn last_folder_history(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        _lock: LockMode,
    ) -> Result<FolderHistory, StoreError> {
        let u = user(self.work()?, uid);
        u.folder_histories
            .iter()
            .rev()
            .find(|h| h.folder.id == folder_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl MailStore for MemoryTransaction {
    async fn emails(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        offset: u64,
        limit: u64,
        desc: bool,
        _lock: LockMode,
    ) -> Result<Vec<Email>, StoreError> {
        let u = user(self.work()?, uid);
        let rows: Vec<Email> = u
            .emails
            .values()
            .filter(|r| r.available && r.folder_id == folder_id)
            .map(|r| r.email.clone())
            .collect();
        Ok(select_range(&rows, |e| e.id, offset, limit, desc))
    }

    async fn email(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        email_id: u64,
        _lock: LockMode,
    ) -> Result<Email, StoreError> {
        let u = user(self.work()?, uid);
        u.emails
            .get(&email_id)
            .filter(|r| r.available && r.folder_id == folder_id)
            .map(|r| r.email.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn raw_email(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        email_id: u64,
        _lock: LockMode,
    ) -> Result<Vec<u8>, StoreError> {
        let u = user(self.work()?, uid);
        u.emails
            .get(&email_id)
            .filter(|r| r.available && r.folder_id == folder_id)
            .map(|r| r.raw.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn attachment(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        attachment_id: u64,
    ) -> Result<(Attachment, Vec<u8>), StoreError> {
        let u = user(self.work()?, uid);
        for row in u.emails.values() {
            if !row.available || row.folder_id != folder_id {
                continue;
            }
            if let Some(meta) = row.email.attachments.iter().find(|a| a.id == attachment_id) {
                let blob = row
                    .blobs
                    .get(&attachment_id)
                    .cloned()
                    .ok_or(StoreError::NotFound)?;
                return Ok((meta.clone(), blob));
            }
        }
        Err(StoreError::NotFound)
    }

    async fn add_email(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        raw: &[u8],
    ) -> Result<Email, StoreError> {
        let u = user(self.work()?, uid);
        if !u.folders.get(&folder_id).map(|r| r.available).unwrap_or(false) {
            return Err(StoreError::NotFound);
        }
        let id = next_id(&mut u.next_email_id);
        let (mut email, blobs) = parse_raw_email(raw, &mut u.next_attachment_id)?;
        email.id = id;
        u.emails.insert(
            id,
            EmailRow {
                email: email.clone(),
                folder_id,
                raw: raw.to_vec(),
                blobs,
                available: true,
            },
        );
        let history_id = next_id(&mut u.next_email_history_id);
        u.email_histories.entry(folder_id).or_default().push(EmailHistory {
            id: history_id,
            operation: EmailOperation::Add,
            email: email.clone(),
            timestamp: Utc::now(),
        });
        Ok(email)
    }

    async fn update_email(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        email_id: u64,
        seen: bool,
    ) -> Result<(), StoreError> {
        let u = user(self.work()?, uid);
        let row = u
            .emails
            .get_mut(&email_id)
            .filter(|r| r.available && r.folder_id == folder_id)
            .ok_or(StoreError::NotFound)?;
        row.email.seen = seen;
        let snapshot = row.email.clone();
        let history_id = next_id(&mut u.next_email_history_id);
        u.email_histories.entry(folder_id).or_default().push(EmailHistory {
            id: history_id,
            operation: EmailOperation::UpdateSeen,
            email: snapshot,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn delete_email(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        email_id: u64,
    ) -> Result<(), StoreError> {
        let u = user(self.work()?, uid);
        let row = u
            .emails
            .get_mut(&email_id)
            .filter(|r| r.available && r.folder_id == folder_id)
            .ok_or(StoreError::NotFound)?;
        row.available = false;
        let snapshot = row.email.clone();
        let history_id = next_id(&mut u.next_email_history_id);
        u.email_histories.entry(folder_id).or_default().push(EmailHistory {
            id: history_id,
            operation: EmailOperation::Delete,
            email: snapshot,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn move_email(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        email_id: u64,
        new_folder_id: u64,
    ) -> Result<u64, StoreError> {
        let u = user(self.work()?, uid);
        if !u
            .folders
            .get(&new_folder_id)
            .map(|r| r.available)
            .unwrap_or(false)
        {
            return Err(StoreError::NotFound);
        }
        let row = u
            .emails
            .get_mut(&email_id)
            .filter(|r| r.available && r.folder_id == folder_id)
            .ok_or(StoreError::NotFound)?;
        row.available = false;
        let old_snapshot = row.email.clone();
        let raw = row.raw.clone();
        let blobs = row.blobs.clone();

        let new_id = next_id(&mut u.next_email_id);
        let mut moved = old_snapshot.clone();
        moved.id = new_id;
        u.emails.insert(
            new_id,
            EmailRow {
                email: moved.clone(),
                folder_id: new_folder_id,
                raw,
                blobs,
                available: true,
            },
        );

        let delete_id = next_id(&mut u.next_email_history_id);
        u.email_histories.entry(folder_id).or_default().push(EmailHistory {
            id: delete_id,
            operation: EmailOperation::Delete,
            email: old_snapshot,
            timestamp: Utc::now(),
        });
        let add_id = next_id(&mut u.next_email_history_id);
        u.email_histories
            .entry(new_folder_id)
            .or_default()
            .push(EmailHistory {
                id: add_id,
                operation: EmailOperation::Add,
                email: moved,
                timestamp: Utc::now(),
            });
        Ok(new_id)
    }

    async fn email_histories(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        offset: u64,
        limit: u64,
        desc: bool,
        _lock: LockMode,
    ) -> Result<Vec<EmailHistory>, StoreError> {
        let u = user(self.work()?, uid);
        let rows = u.email_histories.get(&folder_id).cloned().unwrap_or_default();
        Ok(select_range(&rows, |h| h.id, offset, limit, desc))
    }

    async fn last_email_history(
        &mut self,
        uid: UserUid,
        folder_id: u64,
        email_id: u64,
        _lock: LockMode,
    ) -> Result<EmailHistory, StoreError> {
        let u = user(self.work()?, uid);
        u.email_histories
            .get(&folder_id)
            .and_then(|rows| rows.iter().rev().find(|h| h.email.id == email_id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl SyncStore for MemoryTransaction {
    async fn clear_folder_sync_keys(&mut self, scope: &DeviceScope) -> Result<(), StoreError> {
        let u = user(self.work()?, scope.user_uid);
        u.folder_sync_keys.remove(&scope.device_id);
        Ok(())
    }

    async fn load_folder_sync_key(
        &mut self,
        scope: &DeviceScope,
        sync_key: u64,
        _lock: LockMode,
    ) -> Result<u64, StoreError> {
        let u = user(self.work()?, scope.user_uid);
        u.folder_sync_keys
            .get(&scope.device_id)
            .and_then(|keys| keys.get(&sync_key))
            .copied()
            .ok_or(StoreError::NotFound)
    }

    async fn new_folder_sync_key(
        &mut self,
        scope: &DeviceScope,
        history_id: u64,
    ) -> Result<u64, StoreError> {
        let state = self.work()?;
        let sync_key = next_id(&mut state.next_folder_sync_key);
        let u = user(state, scope.user_uid);
        u.folder_sync_keys
            .entry(scope.device_id.clone())
            .or_default()
            .insert(sync_key, history_id);
        Ok(sync_key)
    }

    async fn last_folder_sync_key(
        &mut self,
        scope: &DeviceScope,
        _lock: LockMode,
    ) -> Result<Option<u64>, StoreError> {
        let u = user(self.work()?, scope.user_uid);
        Ok(u.folder_sync_keys
            .get(&scope.device_id)
            .and_then(|keys| keys.keys().next_back())
            .copied())
    }

    async fn clear_virtual_folders(&mut self, scope: &DeviceScope) -> Result<(), StoreError> {
        let u = user(self.work()?, scope.user_uid);
        u.virtual_folders.remove(&scope.device_id);
        Ok(())
    }

    async fn add_virtual_folder(
        &mut self,
        scope: &DeviceScope,
        folder: &Folder,
        last_history_id: u64,
    ) -> Result<(), StoreError> {
        let u = user(self.work()?, scope.user_uid);
        let mirror = u.virtual_folders.entry(scope.device_id.clone()).or_default();
        if mirror.contains_key(&folder.id) {
            return Err(StoreError::Duplicated);
        }
        mirror.insert(
            folder.id,
            VirtualFolder {
                folder_id: folder.id,
                parent_id: folder.parent_id,
                name: folder.name.clone(),
                last_history_id,
            },
        );
        Ok(())
    }

    async fn virtual_folder(
        &mut self,
        scope: &DeviceScope,
        folder_id: u64,
        _lock: LockMode,
    ) -> Result<VirtualFolder, StoreError> {
        let u = user(self.work()?, scope.user_uid);
        u.virtual_folders
            .get(&scope.device_id)
            .and_then(|m| m.get(&folder_id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_virtual_folder(
        &mut self,
        scope: &DeviceScope,
        folder: &Folder,
    ) -> Result<(), StoreError> {
        let u = user(self.work()?, scope.user_uid);
        let row = u
            .virtual_folders
            .get_mut(&scope.device_id)
            .and_then(|m| m.get_mut(&folder.id))
            .ok_or(StoreError::NotFound)?;
        row.parent_id = folder.parent_id;
        row.name = folder.name.clone();
        Ok(())
    }

    async fn remove_virtual_folder(
        &mut self,
        scope: &DeviceScope,
        folder_id: u64,
    ) -> Result<(), StoreError> {
        let u = user(self.work()?, scope.user_uid);
        u.virtual_folders
            .get_mut(&scope.device_id)
            .and_then(|m| m.remove(&folder_id))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn clear_email_sync_keys(&mut self, scope: &FolderScope) -> Result<(), StoreError> {
        let u = user(self.work()?, scope.user_uid);
        u.email_sync_keys
            .remove(&(scope.device_id.clone(), scope.folder_id));
        Ok(())
    }

    async fn load_email_sync_key(
        &mut self,
        scope: &FolderScope,
        sync_key: u64,
        _lock: LockMode,
    ) -> Result<u64, StoreError> {
        let u = user(self.work()?, scope.user_uid);
        u.email_sync_keys
            .get(&(scope.device_id.clone(), scope.folder_id))
            .and_then(|keys| keys.get(&sync_key))
            .copied()
            .ok_or(StoreError::NotFound)
    }

    async fn new_email_sync_key(
        &mut self,
        scope: &FolderScope,
        history_id: u64,
    ) -> Result<u64, StoreError> {
        let state = self.work()?;
        let sync_key = next_id(&mut state.next_email_sync_key);
        let u = user(state, scope.user_uid);
        u.email_sync_keys
            .entry((scope.device_id.clone(), scope.folder_id))
            .or_default()
            .insert(sync_key, history_id);
        Ok(sync_key)
    }

    async fn last_email_sync_key(
        &mut self,
        scope: &FolderScope,
        _lock: LockMode,
    ) -> Result<Option<u64>, StoreError> {
        let u = user(self.work()?, scope.user_uid);
        Ok(u.email_sync_keys
            .get(&(scope.device_id.clone(), scope.folder_id))
            .and_then(|keys| keys.keys().next_back())
            .copied())
    }

    async fn clear_virtual_emails(&mut self, scope: &FolderScope) -> Result<(), StoreError> {
        let u = user(self.work()?, scope.user_uid);
        u.virtual_emails
            .remove(&(scope.device_id.clone(), scope.folder_id));
        Ok(())
    }

    async fn add_virtual_email(
        &mut self,
        scope: &FolderScope,
        email: &Email,
        last_history_id: u64,
    ) -> Result<(), StoreError> {
        let u = user(self.work()?, scope.user_uid);
        let mirror = u
            .virtual_emails
            .entry((scope.device_id.clone(), scope.folder_id))
            .or_default();
        if mirror.contains_key(&email.id) {
            return Err(StoreError::Duplicated);
        }
        mirror.insert(
            email.id,
            VirtualEmail {
                email_id: email.id,
                seen: email.seen,
                timestamp: email.date,
                last_history_id,
            },
        );
        Ok(())
    }

    async fn virtual_email(
        &mut self,
        scope: &FolderScope,
        email_id: u64,
        _lock: LockMode,
    ) -> Result<VirtualEmail, StoreError> {
        let u = user(self.work()?, scope.user_uid);
        u.virtual_emails
            .get(&(scope.device_id.clone(), scope.folder_id))
            .and_then(|m| m.get(&email_id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn oldest_virtual_email(
        &mut self,
        scope: &FolderScope,
        _lock: LockMode,
    ) -> Result<Option<VirtualEmail>, StoreError> {
        let u = user(self.work()?, scope.user_uid);
        Ok(u.virtual_emails
            .get(&(scope.device_id.clone(), scope.folder_id))
            .and_then(|m| m.values().next())
            .cloned())
    }

    async fn old_virtual_emails(
        &mut self,
        scope: &FolderScope,
        threshold: DateTime<Utc>,
        limit: usize,
        _lock: LockMode,
    ) -> Result<Vec<VirtualEmail>, StoreError> {
        let u = user(self.work()?, scope.user_uid);
        let mut old: Vec<VirtualEmail> = u
            .virtual_emails
            .get(&(scope.device_id.clone(), scope.folder_id))
            .map(|m| {
                m.values()
                    .filter(|v| v.timestamp < threshold)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        old.sort_by_key(|v| v.timestamp);
        old.truncate(limit);
        Ok(old)
    }

    async fn update_virtual_email_seen(
        &mut self,
        scope: &FolderScope,
        email_id: u64,
        seen: bool,
    ) -> Result<(), StoreError> {
        let u = user(self.work()?, scope.user_uid);
        let row = u
            .virtual_emails
            .get_mut(&(scope.device_id.clone(), scope.folder_id))
            .and_then(|m| m.get_mut(&email_id))
            .ok_or(StoreError::NotFound)?;
        row.seen = seen;
        Ok(())
    }

    async fn remove_virtual_email(
        &mut self,
        scope: &FolderScope,
        email_id: u64,
    ) -> Result<(), StoreError> {
        let u = user(self.work()?, scope.user_uid);
        u.virtual_emails
            .get_mut(&(scope.device_id.clone(), scope.folder_id))
            .and_then(|m| m.remove(&email_id))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

fn collect_addresses(addr: Option<&Address>) -> Vec<EmailAddress> {
    addr.map(|list| {
        list.iter()
            .map(|a| EmailAddress {
                name: a.name().unwrap_or_default().to_string(),
                address: a.address().unwrap_or_default().to_string(),
            })
            .collect()
    })
    .unwrap_or_default()
}

/// Parses a raw RFC822 message into the `Email` entity plus the decoded
/// attachment payloads, assigning attachment ids from the user counter.
fn parse_raw_email(
    raw: &[u8],
    next_attachment_id: &mut u64,
) -> Result<(Email, HashMap<u64, Vec<u8>>), StoreError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| StoreError::Backend("unparsable MIME message".into()))?;

    let from = collect_addresses(message.from()).into_iter().next().unwrap_or_default();
    let to = collect_addresses(message.to());
    let cc = collect_addresses(message.cc());
    let reply_to = collect_addresses(message.reply_to());
    let subject = message.subject().unwrap_or_default().to_string();
    let date = message
        .date()
        .and_then(|d| DateTime::parse_from_rfc3339(&d.to_rfc3339()).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let body = message
        .body_text(0)
        .or_else(|| message.body_html(0))
        .map(|b| b.into_owned())
        .unwrap_or_default();
    let charset = message
        .content_type()
        .and_then(|ct| ct.attribute("charset"))
        .unwrap_or_default()
        .to_string();

    let mut attachments = Vec::new();
    let mut blobs = HashMap::new();
    for part in message.attachments() {
        let id = next_id(next_attachment_id);
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_default();
        let inline = part
            .content_disposition()
            .map(|cd| cd.ctype().eq_ignore_ascii_case("inline"))
            .unwrap_or(false);
        let data = part.contents().to_vec();
        attachments.push(Attachment {
            id,
            name: part.attachment_name().unwrap_or_default().to_string(),
            content_type,
            content_id: part
                .content_id()
                .unwrap_or_default()
                .trim_matches(|c| c == '<' || c == '>')
                .to_string(),
            size: data.len() as u64,
            inline,
        });
        blobs.insert(id, data);
    }

    Ok((
        Email {
            id: 0,
            from,
            to,
            reply_to,
            cc,
            subject,
            date,
            body,
            charset,
            attachments,
            seen: false,
        },
        blobs,
    ))
}
