mod common;

use chrono::Utc;
use common::{count_occurrences, sync_key_of, TestServer};
use rustysync::store::FolderKind;

fn folder_sync_body(sync_key: u64) -> String {
    format!("<FolderSync><SyncKey>{sync_key}</SyncKey></FolderSync>")
}

fn sync_body(folder_id: u64, sync_key: u64, extra: &str) -> String {
    format!(
        "<Sync><Collections><Collection><Class>Email</Class><SyncKey>{sync_key}</SyncKey><CollectionId>{folder_id}</CollectionId>{extra}</Collection></Collections></Sync>"
    )
}

async fn initial_key(server: &TestServer, device: &str) -> u64 {
    let resp = server
        .run("FolderSync", device, &[], &folder_sync_body(0))
        .await;
    sync_key_of(&resp)
}

#[tokio::test]
async fn folder_create_name_boundaries() {
    let server = TestServer::new();
    let device = "cmd-name";
    let key = initial_key(&server, device).await;

    // Empty name.
    let resp = server
        .run(
            "FolderCreate",
            device,
            &[],
            &format!("<FolderCreate><SyncKey>{key}</SyncKey><ParentId>0</ParentId><DisplayName></DisplayName><Type>12</Type></FolderCreate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>10</Status>"));

    // 256 characters are accepted.
    let name_256 = "가".repeat(256);
    let resp = server
        .run(
            "FolderCreate",
            device,
            &[],
            &format!("<FolderCreate><SyncKey>{key}</SyncKey><ParentId>0</ParentId><DisplayName>{name_256}</DisplayName><Type>12</Type></FolderCreate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>1</Status>"));
    let key = sync_key_of(&resp);

    // 257 characters are not.
    let name_257 = "가".repeat(257);
    let resp = server
        .run(
            "FolderCreate",
            device,
            &[],
            &format!("<FolderCreate><SyncKey>{key}</SyncKey><ParentId>0</ParentId><DisplayName>{name_257}</DisplayName><Type>12</Type></FolderCreate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>10</Status>"));
}

#[tokio::test]
async fn folder_create_validations() {
    let server = TestServer::new();
    let device = "cmd-create";
    let key = initial_key(&server, device).await;

    // Special folder types are malformed requests.
    let resp = server
        .run(
            "FolderCreate",
            device,
            &[],
            &format!("<FolderCreate><SyncKey>{key}</SyncKey><ParentId>0</ParentId><DisplayName>Inbox2</DisplayName><Type>2</Type></FolderCreate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>10</Status>"));

    // Non-email folder types are not implemented at all.
    let resp = server
        .run(
            "FolderCreate",
            device,
            &[],
            &format!("<FolderCreate><SyncKey>{key}</SyncKey><ParentId>0</ParentId><DisplayName>Cal</DisplayName><Type>8</Type></FolderCreate>"),
        )
        .await;
    assert_eq!(resp.status(), Some(501));

    // Missing parent.
    let resp = server
        .run(
            "FolderCreate",
            device,
            &[],
            &format!("<FolderCreate><SyncKey>{key}</SyncKey><ParentId>999</ParentId><DisplayName>Orphan</DisplayName><Type>12</Type></FolderCreate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>5</Status>"));

    // Duplicate name under the same parent.
    let resp = server
        .run(
            "FolderCreate",
            device,
            &[],
            &format!("<FolderCreate><SyncKey>{key}</SyncKey><ParentId>0</ParentId><DisplayName>Projects</DisplayName><Type>12</Type></FolderCreate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>1</Status>"));
    let key = sync_key_of(&resp);
    let resp = server
        .run(
            "FolderCreate",
            device,
            &[],
            &format!("<FolderCreate><SyncKey>{key}</SyncKey><ParentId>0</ParentId><DisplayName>Projects</DisplayName><Type>12</Type></FolderCreate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>2</Status>"));

    // Stale sync key.
    let resp = server
        .run(
            "FolderCreate",
            device,
            &[],
            &format!("<FolderCreate><SyncKey>1</SyncKey><ParentId>0</ParentId><DisplayName>Late</DisplayName><Type>12</Type></FolderCreate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>9</Status>"));
}

#[tokio::test]
async fn folder_delete_validations() {
    let server = TestServer::new();
    let device = "cmd-delete";
    let inbox = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;
    let plain = server.seed_folder(0, "Old", FolderKind::Folder).await;
    let key = initial_key(&server, device).await;

    // Missing folder.
    let resp = server
        .run(
            "FolderDelete",
            device,
            &[],
            &format!("<FolderDelete><SyncKey>{key}</SyncKey><ServerId>999</ServerId></FolderDelete>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>4</Status>"));

    // Special folders are protected.
    let resp = server
        .run(
            "FolderDelete",
            device,
            &[],
            &format!("<FolderDelete><SyncKey>{key}</SyncKey><ServerId>{inbox}</ServerId></FolderDelete>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>3</Status>"));

    // Plain folders delete fine.
    let resp = server
        .run(
            "FolderDelete",
            device,
            &[],
            &format!("<FolderDelete><SyncKey>{key}</SyncKey><ServerId>{plain}</ServerId></FolderDelete>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>1</Status>"));
    assert!(sync_key_of(&resp) > key);
}

#[tokio::test]
async fn folder_update_validations() {
    let server = TestServer::new();
    let device = "cmd-update";
    let inbox = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;
    let one = server.seed_folder(0, "One", FolderKind::Folder).await;
    let two = server.seed_folder(0, "Two", FolderKind::Folder).await;
    let key = initial_key(&server, device).await;

    // Rename works.
    let resp = server
        .run(
            "FolderUpdate",
            device,
            &[],
            &format!("<FolderUpdate><SyncKey>{key}</SyncKey><ServerId>{one}</ServerId><ParentId>0</ParentId><DisplayName>Renamed</DisplayName></FolderUpdate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>1</Status>"));
    let key = sync_key_of(&resp);

    // Special folders cannot be renamed.
    let resp = server
        .run(
            "FolderUpdate",
            device,
            &[],
            &format!("<FolderUpdate><SyncKey>{key}</SyncKey><ServerId>{inbox}</ServerId><ParentId>0</ParentId><DisplayName>Mailbox</DisplayName></FolderUpdate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>2</Status>"));

    // Missing folder.
    let resp = server
        .run(
            "FolderUpdate",
            device,
            &[],
            &format!("<FolderUpdate><SyncKey>{key}</SyncKey><ServerId>999</ServerId><ParentId>0</ParentId><DisplayName>Ghost</DisplayName></FolderUpdate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>4</Status>"));

    // Duplicate sibling name.
    let resp = server
        .run(
            "FolderUpdate",
            device,
            &[],
            &format!("<FolderUpdate><SyncKey>{key}</SyncKey><ServerId>{two}</ServerId><ParentId>0</ParentId><DisplayName>Renamed</DisplayName></FolderUpdate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>2</Status>"));

    // Missing parent.
    let resp = server
        .run(
            "FolderUpdate",
            device,
            &[],
            &format!("<FolderUpdate><SyncKey>{key}</SyncKey><ServerId>{two}</ServerId><ParentId>999</ParentId><DisplayName>Moved</DisplayName></FolderUpdate>"),
        )
        .await;
    assert!(resp.body_str().contains("<Status>5</Status>"));
}

#[tokio::test]
async fn move_items_round_trip() {
    let server = TestServer::new();
    let device = "cmd-move";
    let src = server.seed_folder(0, "Source", FolderKind::Folder).await;
    let dst = server.seed_folder(0, "Target", FolderKind::Folder).await;
    let email = server.seed_email(src, "wanderer", Utc::now()).await;

    // The device pages the email in first.
    let resp = server.run("Sync", device, &[], &sync_body(src, 0, "")).await;
    let k_src = sync_key_of(&resp);
    let resp = server
        .run("Sync", device, &[], &sync_body(src, k_src, "<GetChanges/>"))
        .await;
    let k_src = sync_key_of(&resp);
    let resp = server.run("Sync", device, &[], &sync_body(dst, 0, "")).await;
    let k_dst = sync_key_of(&resp);

    let body = format!(
        "<MoveItems><Move><SrcMsgId>{src}:{email}</SrcMsgId><SrcFldId>{src}</SrcFldId><DstFldId>{dst}</DstFldId></Move></MoveItems>"
    );
    let resp = server.run("MoveItems", device, &[], &body).await;
    let body = resp.body_str().into_owned();
    assert!(body.contains("<Status>3</Status>"));
    assert!(body.contains(&format!("<DstMsgId>{dst}:")));
    let dst_msg = body
        .split("<DstMsgId>")
        .nth(1)
        .and_then(|rest| rest.split("</DstMsgId>").next())
        .expect("response carries a DstMsgId");
    let new_id: u64 = dst_msg.split(':').nth(1).unwrap().parse().unwrap();

    // The mirror was left alone: the move arrives as ordinary histories.
    let resp = server
        .run("Sync", device, &[], &sync_body(src, k_src, "<GetChanges/>"))
        .await;
    assert!(resp
        .body_str()
        .contains(&format!("<Delete><ServerId>{src}:{email}</ServerId></Delete>")));

    let resp = server
        .run("Sync", device, &[], &sync_body(dst, k_dst, "<GetChanges/>"))
        .await;
    assert!(resp
        .body_str()
        .contains(&format!("<Add><ServerId>{dst}:{new_id}</ServerId>")));
}

#[tokio::test]
async fn move_items_error_statuses() {
    let server = TestServer::new();
    let device = "cmd-move-errors";
    let src = server.seed_folder(0, "Source", FolderKind::Folder).await;
    let dst = server.seed_folder(0, "Target", FolderKind::Folder).await;

    let body = format!(
        "<MoveItems>\
         <Move><SrcMsgId>{src}:1</SrcMsgId><SrcFldId>{src}</SrcFldId><DstFldId>{src}</DstFldId></Move>\
         <Move><SrcMsgId>404:1</SrcMsgId><SrcFldId>404</SrcFldId><DstFldId>{dst}</DstFldId></Move>\
         <Move><SrcMsgId>{src}:1</SrcMsgId><SrcFldId>{src}</SrcFldId><DstFldId>404</DstFldId></Move>\
         <Move><SrcMsgId>{src}:123</SrcMsgId><SrcFldId>{src}</SrcFldId><DstFldId>{dst}</DstFldId></Move>\
         </MoveItems>"
    );
    let resp = server.run("MoveItems", device, &[], &body).await;
    let body = resp.body_str().into_owned();
    // Same src/dst, missing source folder, missing destination folder,
    // missing email.
    assert!(body.contains("<Status>4</Status>"));
    assert_eq!(count_occurrences(&body, "<Status>1</Status>"), 2);
    assert!(body.contains("<Status>2</Status>"));
    assert_eq!(count_occurrences(&body, "<Response>"), 4);
}

#[tokio::test]
async fn empty_move_items_is_a_bad_request() {
    let server = TestServer::new();
    let resp = server
        .run("MoveItems", "cmd-move-empty", &[], "<MoveItems></MoveItems>")
        .await;
    assert_eq!(resp.status(), Some(400));
}

const RAW_WITH_ATTACHMENT: &str = "From: alice@example.com\r\n\
To: bob@example.com\r\n\
Subject: with attachment\r\n\
Date: Mon, 06 Jan 2025 10:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"frontier\"\r\n\
\r\n\
--frontier\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
see the attached notes\r\n\
--frontier\r\n\
Content-Type: application/pdf; name=\"notes.pdf\"\r\n\
Content-Disposition: attachment; filename=\"notes.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
Tk9URVM=\r\n\
--frontier--\r\n";

#[tokio::test]
async fn get_attachment_streams_decoded_payload() {
    let server = TestServer::new();
    let folder = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;
    server.seed_raw_email(folder, RAW_WITH_ATTACHMENT.as_bytes()).await;

    let name = format!("{folder}:1");
    let resp = server
        .run(
            "GetAttachment",
            "cmd-attachment",
            &[("AttachmentName", &name)],
            "",
        )
        .await;
    assert_eq!(resp.status(), None);
    assert_eq!(resp.body(), b"NOTES");
    assert!(resp
        .headers()
        .iter()
        .any(|(k, v)| k == "Content-Type" && v == "application/pdf"));
    assert!(resp
        .headers()
        .iter()
        .any(|(k, v)| k == "Content-Length" && v == "5"));
}

#[tokio::test]
async fn get_attachment_missing_yields_500() {
    let server = TestServer::new();
    let folder = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;

    let name = format!("{folder}:42");
    let resp = server
        .run(
            "GetAttachment",
            "cmd-attachment-missing",
            &[("AttachmentName", &name)],
            "",
        )
        .await;
    assert_eq!(resp.status(), Some(500));
}

#[tokio::test]
async fn attachment_metadata_rides_in_sync_adds() {
    let server = TestServer::new();
    let device = "cmd-attachment-sync";
    let folder = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;
    server.seed_raw_email(folder, RAW_WITH_ATTACHMENT.as_bytes()).await;

    let resp = server.run("Sync", device, &[], &sync_body(folder, 0, "")).await;
    let k1 = sync_key_of(&resp);
    let resp = server
        .run("Sync", device, &[], &sync_body(folder, k1, "<GetChanges/>"))
        .await;
    let body = resp.body_str().into_owned();
    assert!(body.contains("<email:Attachments><email:Attachment>"));
    assert!(body.contains("<email:AttMethod>1</email:AttMethod>"));
    assert!(body.contains("<email:AttSize>5</email:AttSize>"));
    assert!(body.contains("<email:DisplayName>notes.pdf</email:DisplayName>"));
    assert!(body.contains(&format!("<email:AttName>{folder}:1</email:AttName>")));
}

#[tokio::test]
async fn get_hierarchy_lists_every_folder() {
    let server = TestServer::new();
    let inbox = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;
    let nested = server.seed_folder(inbox, "Nested", FolderKind::Folder).await;

    let resp = server.run("GetHierarchy", "cmd-hierarchy", &[], "").await;
    let body = resp.body_str().into_owned();
    assert!(body.starts_with(r#"<Folders xmlns="FolderHierarchy:">"#));
    assert!(body.contains(&format!(
        "<Folder><ServerId>{inbox}</ServerId><ParentId>0</ParentId><DisplayName>INBOX</DisplayName><Type>2</Type></Folder>"
    )));
    assert!(body.contains(&format!(
        "<Folder><ServerId>{nested}</ServerId><ParentId>{inbox}</ParentId><DisplayName>Nested</DisplayName><Type>12</Type></Folder>"
    )));
}

#[tokio::test]
async fn get_item_estimate_is_not_implemented() {
    let server = TestServer::new();
    let resp = server
        .run(
            "GetItemEstimate",
            "cmd-estimate",
            &[],
            "<GetItemEstimate><Collections><Collection><CollectionId>1</CollectionId></Collection></Collections></GetItemEstimate>",
        )
        .await;
    assert_eq!(resp.status(), Some(501));
}

#[tokio::test]
async fn unsupported_command_is_not_implemented() {
    let server = TestServer::new();
    let resp = server.run("Search", "cmd-unsupported", &[], "").await;
    assert_eq!(resp.status(), Some(501));
}

#[tokio::test]
async fn provision_round_trip() {
    let server = TestServer::new();

    let initial = "<Provision><Policies><Policy><PolicyType>MS-WAP-Provisioning-XML</PolicyType></Policy></Policies></Provision>";
    let resp = server.run("Provision", "cmd-provision", &[], initial).await;
    let body = resp.body_str().into_owned();
    assert!(body.contains("<PolicyKey>1</PolicyKey>"));
    assert!(body.contains("wap-provisioningdoc"));

    let ack = "<Provision><Policies><Policy><PolicyType>MS-WAP-Provisioning-XML</PolicyType><PolicyKey>1</PolicyKey><Status>1</Status></Policy></Policies></Provision>";
    let resp = server.run("Provision", "cmd-provision", &[], ack).await;
    let body = resp.body_str().into_owned();
    assert!(body.contains("<PolicyKey>2</PolicyKey>"));

    let bad = "<Provision><Policies><Policy><PolicyType>Other</PolicyType></Policy></Policies></Provision>";
    let resp = server.run("Provision", "cmd-provision", &[], bad).await;
    assert_eq!(resp.status(), Some(400));
}
