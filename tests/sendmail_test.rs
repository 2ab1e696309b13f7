// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod common;

use chrono::Utc;
use common::{TestServer, USER_ID};
use rustysync::store::FolderKind;

const OUTGOING: &str = "From: tester@example.com\n\
To: bob@example.com\n\
Cc: carol@example.com\n\
Bcc: mallory@example.com\n\
Subject: status update\n\
Date: Mon, 06 Jan 2025 10:00:00 +0000\n\
\n\
all systems nominal\n";

fn rfc822_query<'a>(save_in_sent: &'a str) -> Vec<(&'a str, &'a str)> {
    vec![("SaveInSent", save_in_sent)]
}

async fn run_mail(server: &TestServer, cmd: &str, device: &str, query: &[(&str, &str)], body: &str) -> rustysync::eas::ResponseBuffer {
    let mut req = server.request(cmd, device, query, body.as_bytes());
    req.headers
        .insert("content-type".to_string(), "message/rfc822".to_string());
    use rustysync::eas::CommandHandler;
    let mut handler = rustysync::eas25::Handler::new(server.param.clone(), server.credential(), req);
    handler.handle().await
}

#[tokio::test]
async fn send_mail_relays_normalized_message() {
    let server = TestServer::new();
    let resp = run_mail(&server, "SendMail", "mail-relay", &rfc822_query("F"), OUTGOING).await;
    assert_eq!(resp.status(), None);
    assert!(resp.body().is_empty());

    let sent = server.mailer.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from, USER_ID);
    assert_eq!(
        sent[0].to,
        vec![
            "bob@example.com".to_string(),
            "carol@example.com".to_string(),
            "mallory@example.com".to_string(),
        ]
    );

    let msg = String::from_utf8(sent[0].msg.clone()).unwrap();
    // CRLF line endings, Bcc header stripped from the wire copy.
    assert!(msg.contains("Subject: status update\r\n"));
    assert!(!msg.to_lowercase().contains("bcc:"));
    assert!(msg.contains("all systems nominal"));
}

#[tokio::test]
async fn send_mail_save_in_sent_stores_seen_copy() {
    let server = TestServer::new();
    let sent_folder = server.seed_folder(0, "Sent", FolderKind::Sent).await;

    let resp = run_mail(&server, "SendMail", "mail-sent", &rfc822_query("T"), OUTGOING).await;
    assert_eq!(resp.status(), None);

    let stored = server.emails_in(sent_folder).await;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].seen);
    assert_eq!(stored[0].subject, "status update");
}

#[tokio::test]
async fn send_mail_without_sent_folder_fails() {
    let server = TestServer::new();
    let resp = run_mail(&server, "SendMail", "mail-nosent", &rfc822_query("T"), OUTGOING).await;
    assert_eq!(resp.status(), Some(500));
    // Nothing was relayed: the transaction failed before submission.
    assert!(server.mailer.sent.lock().is_empty());
}

#[tokio::test]
async fn send_mail_validates_envelope_parameters() {
    let server = TestServer::new();

    // Invalid SaveInSent.
    let resp = run_mail(&server, "SendMail", "mail-badquery", &rfc822_query("X"), OUTGOING).await;
    assert_eq!(resp.status(), Some(400));

    // Wrong content type.
    let resp = server
        .run("SendMail", "mail-badtype", &rfc822_query("F"), OUTGOING)
        .await;
    assert_eq!(resp.status(), Some(400));

    // Missing To header.
    let no_to = "From: tester@example.com\nSubject: x\n\nhello\n";
    let resp = run_mail(&server, "SendMail", "mail-noto", &rfc822_query("F"), no_to).await;
    assert_eq!(resp.status(), Some(400));
}

const FORWARD_BODY: &str = "From: tester@example.com\n\
To: dave@example.com\n\
Subject: Fwd: numbers\n\
Date: Mon, 06 Jan 2025 11:00:00 +0000\n\
\n\
forwarding the report below\n";

#[tokio::test]
async fn smart_forward_wraps_original_as_rfc822_attachment() {
    let server = TestServer::new();
    let inbox = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;
    let original = server.seed_email(inbox, "numbers", Utc::now()).await;

    let item_id = format!("{inbox}:{original}");
    let collection_id = inbox.to_string();
    let query = vec![
        ("SaveInSent", "F"),
        ("CollectionId", collection_id.as_str()),
        ("ItemId", item_id.as_str()),
    ];
    let resp = run_mail(&server, "SmartForward", "mail-forward", &query, FORWARD_BODY).await;
    assert_eq!(resp.status(), None);

    let sent = server.mailer.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["dave@example.com".to_string()]);

    let msg = String::from_utf8(sent[0].msg.clone()).unwrap();
    assert!(msg.contains("Content-Type: multipart/related;"));
    assert!(msg.contains("type=\"multipart/alternative\""));
    assert!(msg.contains("Content-Type: message/rfc822"));
    assert!(msg.contains("filename=\"MailAttachment.eml\""));
    assert!(msg.contains("Subject: Fwd: numbers"));
}

#[tokio::test]
async fn smart_forward_save_in_sent_keeps_a_copy() {
    let server = TestServer::new();
    let inbox = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;
    let sent_folder = server.seed_folder(0, "Sent", FolderKind::Sent).await;
    let original = server.seed_email(inbox, "numbers", Utc::now()).await;

    let item_id = format!("{inbox}:{original}");
    let collection_id = inbox.to_string();
    let query = vec![
        ("SaveInSent", "T"),
        ("CollectionId", collection_id.as_str()),
        ("ItemId", item_id.as_str()),
    ];
    let resp = run_mail(&server, "SmartForward", "mail-forward-save", &query, FORWARD_BODY).await;
    assert_eq!(resp.status(), None);

    let stored = server.emails_in(sent_folder).await;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].seen);
}

#[tokio::test]
async fn smart_reply_takes_the_forward_path() {
    let server = TestServer::new();
    let inbox = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;
    let original = server.seed_email(inbox, "numbers", Utc::now()).await;

    let item_id = format!("{inbox}:{original}");
    let collection_id = inbox.to_string();
    let query = vec![
        ("SaveInSent", "F"),
        ("CollectionId", collection_id.as_str()),
        ("ItemId", item_id.as_str()),
    ];
    let resp = run_mail(&server, "SmartReply", "mail-reply", &query, FORWARD_BODY).await;
    assert_eq!(resp.status(), None);

    // The reply carries the previous email as an attachment too.
    let sent = server.mailer.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    let msg = String::from_utf8(sent[0].msg.clone()).unwrap();
    assert!(msg.contains("Content-Type: message/rfc822"));
}

#[tokio::test]
async fn smart_forward_missing_original_fails() {
    let server = TestServer::new();
    let inbox = server.seed_folder(0, "INBOX", FolderKind::Inbox).await;

    let item_id = format!("{inbox}:404");
    let collection_id = inbox.to_string();
    let query = vec![
        ("SaveInSent", "F"),
        ("CollectionId", collection_id.as_str()),
        ("ItemId", item_id.as_str()),
    ];
    let resp = run_mail(&server, "SmartForward", "mail-forward-missing", &query, FORWARD_BODY).await;
    assert_eq!(resp.status(), Some(500));
    assert!(server.mailer.sent.lock().is_empty());
}
