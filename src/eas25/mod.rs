//! ActiveSync protocol version 2.5 command handlers.

mod email;
mod foldercreate;
mod folderdelete;
mod foldersync;
mod folderupdate;
mod getattachment;
mod gethierarchy;
mod getitemestimate;
mod handler;
mod mime;
mod moveitems;
mod ping;
mod provision;
mod sendmail;
mod smartforward;
mod sync;

pub use handler::{Eas25Factory, Handler};

use std::borrow::Cow;

use chrono::{DateTime, Months, TimeDelta, Utc};

use crate::error::CommandError;
use crate::store::{Folder, FolderKind};

/// AS folder type codes of [MS-ASCMD] FolderHierarchy. Only email folders
/// are supported.
pub(crate) fn as_folder_type(folder: &Folder) -> i32 {
    match folder.kind {
        FolderKind::Inbox => 2,
        FolderKind::Draft => 3,
        FolderKind::Trash => 4,
        FolderKind::Sent => 5,
        FolderKind::Outbox => 6,
        FolderKind::Folder => 12,
    }
}

/// Maps an AS folder type back to a backend folder kind; None for the
/// non-email types this server does not speak.
pub(crate) fn backend_folder_kind(as_type: i32) -> Option<FolderKind> {
    match as_type {
        1 | 12 => Some(FolderKind::Folder),
        2 => Some(FolderKind::Inbox),
        3 => Some(FolderKind::Draft),
        4 => Some(FolderKind::Trash),
        5 => Some(FolderKind::Sent),
        6 => Some(FolderKind::Outbox),
        _ => None,
    }
}

pub(crate) fn truncate_folder_name(name: &str) -> String {
    name.chars().take(256).collect()
}

/// Splits a `<folderID>:<itemID>` ServerId and returns the item part.
pub(crate) fn split_email_id(server_id: &str) -> Result<u64, CommandError> {
    let mut parts = server_id.split(':');
    let (Some(_), Some(id), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(CommandError::BadRequest(format!(
            "invalid ServerId value: {server_id}"
        )));
    };
    if id.is_empty() {
        return Err(CommandError::BadRequest(format!(
            "invalid ServerId value: {server_id}"
        )));
    }
    id.parse::<u64>()
        .map_err(|_| CommandError::BadRequest(format!("non-numeric ServerId value: {server_id}")))
}

pub(crate) fn xml_escape(value: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(value)
}

/// Lower bound on email dates for a FilterType value; None means no filter.
pub(crate) fn time_filter(filter_type: &str) -> Option<DateTime<Utc>> {
    let now = Utc::now();
    match filter_type {
        "1" => Some(now - TimeDelta::days(1)),
        "2" => Some(now - TimeDelta::days(3)),
        "3" => Some(now - TimeDelta::days(7)),
        "4" => Some(now - TimeDelta::days(14)),
        "5" => now.checked_sub_months(Months::new(1)),
        _ => None,
    }
}

pub(crate) fn older_than(date: DateTime<Utc>, threshold: &Option<DateTime<Utc>>) -> bool {
    threshold.map(|t| date < t).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_parsing() {
        assert_eq!(split_email_id("5:42").unwrap(), 42);
        assert!(split_email_id("42").is_err());
        assert!(split_email_id("5:").is_err());
        assert!(split_email_id("5:x").is_err());
        assert!(split_email_id("5:42:1").is_err());
    }

    #[test]
    fn folder_name_truncation() {
        let long: String = "가".repeat(300);
        assert_eq!(truncate_folder_name(&long).chars().count(), 256);
        assert_eq!(truncate_folder_name("Projects"), "Projects");
    }

    #[test]
    fn filter_type_mapping() {
        assert!(time_filter("0").is_none());
        assert!(time_filter("").is_none());
        let week = time_filter("3").unwrap();
        let days = (Utc::now() - week).num_days();
        assert_eq!(days, 7);
    }
}
