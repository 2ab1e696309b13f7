mod common;

use chrono::Utc;
use common::{sync_key_of, TestServer};
use rustysync::store::FolderKind;

fn ping_body(interval: u64, folder_ids: &[u64]) -> String {
    let mut folders = String::new();
    for id in folder_ids {
        folders.push_str(&format!("<Folder><Id>{id}</Id><Class>Email</Class></Folder>"));
    }
    format!(
        "<Ping><HeartbeatInterval>{interval}</HeartbeatInterval><Folders>{folders}</Folders></Ping>"
    )
}

fn sync_body(folder_id: u64, sync_key: u64) -> String {
    format!(
        "<Sync><Collections><Collection><Class>Email</Class><SyncKey>{sync_key}</SyncKey><CollectionId>{folder_id}</CollectionId></Collection></Collections></Sync>"
    )
}

#[tokio::test]
async fn trimmed_request_without_cache_asks_full_body() {
    let server = TestServer::new();
    let resp = server.run("Ping", "ping-nocache", &[], "").await;
    assert_eq!(
        resp.body_str(),
        r#"<Ping xmlns="Ping:"><Status>3</Status></Ping>"#
    );
}

#[tokio::test]
async fn too_many_folders_rejected() {
    let server = TestServer::new();
    let ids: Vec<u64> = (1..=21).collect();
    let resp = server
        .run("Ping", "ping-folders", &[], &ping_body(300, &ids))
        .await;
    let body = resp.body_str().into_owned();
    assert!(body.contains("<Status>6</Status>"));
    assert!(body.contains("<MaxFolders>20</MaxFolders>"));
}

#[tokio::test]
async fn heartbeat_interval_is_clamped() {
    let server = TestServer::new();

    let resp = server
        .run("Ping", "ping-short", &[], &ping_body(59, &[1]))
        .await;
    let body = resp.body_str().into_owned();
    assert!(body.contains("<Status>5</Status>"));
    assert!(body.contains("<HeartbeatInterval>60</HeartbeatInterval>"));

    let resp = server
        .run("Ping", "ping-long", &[], &ping_body(601, &[1]))
        .await;
    let body = resp.body_str().into_owned();
    assert!(body.contains("<Status>5</Status>"));
    assert!(body.contains("<HeartbeatInterval>600</HeartbeatInterval>"));
}

#[tokio::test]
async fn unknown_folder_means_stale_hierarchy() {
    let server = TestServer::new();
    let resp = server
        .run("Ping", "ping-stale", &[], &ping_body(300, &[404]))
        .await;
    assert_eq!(
        resp.body_str(),
        r#"<Ping xmlns="Ping:"><Status>7</Status></Ping>"#
    );
}

#[tokio::test]
async fn pending_history_is_reported_immediately() {
    let server = TestServer::new();
    let device = "ping-change";
    let inbox = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;
    server.seed_email(inbox, "old", Utc::now()).await;

    // Device establishes its cursor.
    let resp = server.run("Sync", device, &[], &sync_body(inbox, 0)).await;
    assert!(sync_key_of(&resp) > 0);

    // A new email arrives while the device is away.
    server.seed_email(inbox, "breaking", Utc::now()).await;

    let resp = server
        .run("Ping", device, &[], &ping_body(300, &[inbox]))
        .await;
    assert_eq!(
        resp.body_str(),
        format!(
            r#"<Ping xmlns="Ping:"><Status>2</Status><Folders><Folder>{inbox}</Folder></Folders></Ping>"#
        )
    );
}

#[tokio::test]
async fn trimmed_request_reuses_cached_body() {
    let server = TestServer::new();
    let device = "ping-cached";
    let inbox = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;
    server.seed_email(inbox, "old", Utc::now()).await;
    let resp = server.run("Sync", device, &[], &sync_body(inbox, 0)).await;
    assert!(sync_key_of(&resp) > 0);
    server.seed_email(inbox, "new", Utc::now()).await;

    // The full request is answered and cached.
    let resp = server
        .run("Ping", device, &[], &ping_body(300, &[inbox]))
        .await;
    assert!(resp.body_str().contains("<Status>2</Status>"));

    // The trimmed follow-up is rescued by the cache.
    let resp = server.run("Ping", device, &[], "").await;
    let body = resp.body_str().into_owned();
    assert!(body.contains("<Status>2</Status>"));
    assert!(body.contains(&format!("<Folder>{inbox}</Folder>")));
}

#[tokio::test]
async fn folder_without_sync_state_is_skipped() {
    let server = TestServer::new();
    let device = "ping-nostate";
    let inbox = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;
    let other = server.seed_folder(0, "Other", FolderKind::Folder).await;
    server.seed_email(inbox, "old", Utc::now()).await;
    let resp = server.run("Sync", device, &[], &sync_body(inbox, 0)).await;
    assert!(sync_key_of(&resp) > 0);
    server.seed_email(inbox, "new", Utc::now()).await;

    // `other` has no sync key table; it is skipped silently while the inbox
    // still reports its change.
    let resp = server
        .run("Ping", device, &[], &ping_body(300, &[other, inbox]))
        .await;
    let body = resp.body_str().into_owned();
    assert!(body.contains("<Status>2</Status>"));
    assert!(body.contains(&format!("<Folder>{inbox}</Folder>")));
    assert!(!body.contains(&format!("<Folder>{other}</Folder>")));
}
