//! ApplicationData XML shaping for Sync responses.

use super::sync::SyncOptions;
use super::xml_escape;
use crate::error::CommandError;
use crate::store::{Email, EmailAddress, FolderScope, LockMode, MailStore, Transaction};

/// Renders the `<ApplicationData>` element of an email, fetching the raw
/// message when the client asked for the full MIME payload.
pub(crate) async fn email_application_data(
    tx: &mut dyn Transaction,
    scope: &FolderScope,
    email: &Email,
    options: &SyncOptions,
) -> Result<String, CommandError> {
    let raw = if options.wants_mime() {
        Some(
            tx.raw_email(scope.user_uid, scope.folder_id, email.id, LockMode::None)
                .await?,
        )
    } else {
        None
    };
    Ok(render_application_data(
        email,
        options,
        scope.folder_id,
        raw.as_deref(),
    ))
}

pub(crate) fn render_application_data(
    email: &Email,
    options: &SyncOptions,
    folder_id: u64,
    raw: Option<&[u8]>,
) -> String {
    let mut out = String::from("<ApplicationData>");
    render_basic(&mut out, email);
    if options.wants_mime() {
        render_attachments(&mut out, email, folder_id);
        render_mime(&mut out, email, options, raw.unwrap_or_default());
    } else {
        render_body(&mut out, email, options);
        render_attachments(&mut out, email, folder_id);
    }
    out.push_str("</ApplicationData>");
    out
}

/// Emits `<name>value</name>`, skipping empty values.
fn push_elem(out: &mut String, name: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    out.push_str(&format!("<{name}>{}</{name}>", xml_escape(value)));
}

fn render_basic(out: &mut String, email: &Email) {
    push_elem(out, "email:To", &addr_str(&email.to, ","));
    push_elem(out, "email:Cc", &addr_str(&email.cc, ","));
    push_elem(
        out,
        "email:From",
        &addr_str(std::slice::from_ref(&email.from), ","),
    );
    push_elem(out, "email:ReplyTo", &addr_str(&email.reply_to, ";"));
    push_elem(out, "email:Subject", &email.subject);
    // DateReceived must be given in UTC.
    push_elem(
        out,
        "email:DateReceived",
        &email.date.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
    );
    push_elem(out, "email:DisplayTo", &name_str(&email.to));
    push_elem(out, "email:ThreadTopic", &email.subject);
    // TODO: Set Importance dynamically.
    push_elem(out, "email:Importance", "1");
    push_elem(out, "email:Read", if email.seen { "1" } else { "0" });
}

fn render_body(out: &mut String, email: &Email, options: &SyncOptions) {
    let (mut body, truncated) = truncate_body(&email.body, &options.truncation);
    if body.is_empty() {
        // A space avoids the empty Body element some clients choke on.
        body = " ".to_string();
    }
    push_elem(out, "email:Body", &body);
    if truncated {
        push_elem(out, "email:BodyTruncated", "1");
        // BodySize is the original body size in characters.
        push_elem(
            out,
            "email:BodySize",
            &email.body.chars().count().to_string(),
        );
    } else {
        push_elem(out, "email:BodyTruncated", "0");
    }
}

fn render_attachments(out: &mut String, email: &Email, folder_id: u64) {
    if email.attachments.is_empty() {
        return;
    }

    out.push_str("<email:Attachments>");
    for attachment in &email.attachments {
        out.push_str("<email:Attachment>");
        let method = if attachment.content_type.eq_ignore_ascii_case("message/rfc822") {
            // Embedded message (EML).
            "5"
        } else {
            // Normal attachment.
            "1"
        };
        push_elem(out, "email:AttMethod", method);
        push_elem(out, "email:AttSize", &attachment.size.to_string());
        push_elem(out, "email:DisplayName", &attachment.name);
        // The attachment name is the folder id plus the attachment id.
        push_elem(
            out,
            "email:AttName",
            &format!("{folder_id}:{}", attachment.id),
        );
        out.push_str("</email:Attachment>");
    }
    out.push_str("</email:Attachments>");
}

fn render_mime(out: &mut String, email: &Email, options: &SyncOptions, raw: &[u8]) {
    let raw_str = String::from_utf8_lossy(raw);
    let (mut mime, truncated) = truncate_mime(&raw_str, &options.mime_truncation);
    if mime.is_empty() {
        // A space avoids the empty MIMEData element some clients choke on.
        mime = " ".to_string();
    }
    if truncated {
        push_elem(out, "email:MIMETruncated", "1");
        push_elem(out, "email:MIMESize", &raw.len().to_string());
    } else {
        push_elem(out, "email:MIMETruncated", "0");
    }
    push_elem(out, "email:MIMEData", &mime);

    // Normal e-mail message.
    push_elem(out, "email:MessageClass", "IPM.Note");
    push_elem(out, "email:InternetCPID", internet_cpid(&email.charset));
}

/// Windows code page identifiers for the charsets this server recognizes;
/// unknown charsets fall back to EUC-KR.
fn internet_cpid(charset: &str) -> &'static str {
    match charset.trim().to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => "65001",
        "utf-16le" => "1200",
        "utf-16be" => "1201",
        "gbk" => "936",
        "gb18030" => "54936",
        "hz-gb-2312" => "52936",
        "big5" => "950",
        "euc-jp" => "20932",
        "iso-2022-jp" => "50222",
        "shift_jis" | "shift-jis" => "932",
        _ => "51949",
    }
}

fn truncate_body(body: &str, truncation: &str) -> (String, bool) {
    match truncation {
        "0" => truncate_in_chars(body, 0),
        "1" => truncate_in_chars(body, 512),
        "2" => truncate_in_chars(body, 1024),
        "3" => truncate_in_chars(body, 2048),
        "4" => truncate_in_chars(body, 5120),
        "5" => truncate_in_chars(body, 10240),
        "6" => truncate_in_chars(body, 20480),
        "7" => truncate_in_chars(body, 51200),
        "8" => truncate_in_chars(body, 102400),
        // No truncation.
        _ => (body.to_string(), false),
    }
}

fn truncate_in_chars(s: &str, char_len: usize) -> (String, bool) {
    if s.is_empty() {
        return (String::new(), false);
    }
    if char_len == 0 {
        return (String::new(), true);
    }
    if s.chars().count() <= char_len {
        return (s.to_string(), false);
    }
    (s.chars().take(char_len).collect(), true)
}

fn truncate_mime(mime: &str, truncation: &str) -> (String, bool) {
    match truncation {
        "0" => truncate_in_bytes(mime, 0),
        "1" => truncate_in_bytes(mime, 4096),
        "2" => truncate_in_bytes(mime, 5120),
        "3" => truncate_in_bytes(mime, 7168),
        "4" => truncate_in_bytes(mime, 10240),
        "5" => truncate_in_bytes(mime, 20480),
        "6" => truncate_in_bytes(mime, 51200),
        "7" => truncate_in_bytes(mime, 102400),
        // No truncation.
        _ => (mime.to_string(), false),
    }
}

fn truncate_in_bytes(s: &str, length: usize) -> (String, bool) {
    if s.is_empty() {
        return (String::new(), false);
    }
    if length == 0 {
        return (String::new(), true);
    }
    if s.len() <= length {
        return (s.to_string(), false);
    }
    // Back off to the previous character boundary.
    let mut end = length;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (s[..end].to_string(), true)
}

/// `"Name" <address>` list capped at the 32,768-character field limit.
fn addr_str(addrs: &[EmailAddress], sep: &str) -> String {
    let mut out = String::new();
    for (i, addr) in addrs.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
            out.push(' ');
        }
        let entry = if addr.name.is_empty() {
            addr.address.clone()
        } else {
            format!("\"{}\" <{}>", addr.name, addr.address)
        };
        if out.len() + entry.len() > 32768 {
            break;
        }
        out.push_str(&entry);
    }
    out
}

fn name_str(addrs: &[EmailAddress]) -> String {
    let mut out = String::new();
    for (i, addr) in addrs.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        if addr.name.is_empty() {
            out.push_str(&addr.address);
        } else {
            out.push_str(&addr.name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_email() -> Email {
        Email {
            id: 7,
            from: EmailAddress {
                name: "Alice".into(),
                address: "alice@example.com".into(),
            },
            to: vec![EmailAddress {
                name: "Bob".into(),
                address: "bob@example.com".into(),
            }],
            reply_to: vec![],
            cc: vec![],
            subject: "hello <world>".into(),
            date: chrono::Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap(),
            body: "line one".into(),
            charset: "utf-8".into(),
            attachments: vec![],
            seen: false,
        }
    }

    #[test]
    fn regular_shape() {
        let options = SyncOptions {
            mime_support: "0".into(),
            ..Default::default()
        };
        let xml = render_application_data(&sample_email(), &options, 3, None);
        assert!(xml.starts_with("<ApplicationData>"));
        assert!(xml.contains("<email:Subject>hello &lt;world&gt;</email:Subject>"));
        assert!(xml.contains("<email:DateReceived>2025-01-06T10:00:00.000Z</email:DateReceived>"));
        assert!(xml.contains("<email:Body>line one</email:Body>"));
        assert!(xml.contains("<email:BodyTruncated>0</email:BodyTruncated>"));
        assert!(xml.contains("<email:Read>0</email:Read>"));
        assert!(!xml.contains("MIMEData"));
    }

    #[test]
    fn body_truncation_classes() {
        let (body, truncated) = truncate_body("abcdef", "0");
        assert_eq!(body, "");
        assert!(truncated);

        let long = "x".repeat(600);
        let (body, truncated) = truncate_body(&long, "1");
        assert_eq!(body.len(), 512);
        assert!(truncated);

        let (body, truncated) = truncate_body("short", "1");
        assert_eq!(body, "short");
        assert!(!truncated);
    }

    #[test]
    fn mime_truncation_respects_char_boundaries() {
        let s = format!("{}가나다", "x".repeat(4095));
        let (mime, truncated) = truncate_mime(&s, "1");
        assert!(truncated);
        assert!(mime.len() <= 4096);
        assert!(mime.is_char_boundary(mime.len()));
    }

    #[test]
    fn cpid_mapping() {
        assert_eq!(internet_cpid("UTF-8"), "65001");
        assert_eq!(internet_cpid("euc-jp"), "20932");
        assert_eq!(internet_cpid("unknown-charset"), "51949");
        assert_eq!(internet_cpid(""), "51949");
    }

    #[test]
    fn address_joining() {
        let addrs = vec![
            EmailAddress {
                name: "A".into(),
                address: "a@example.com".into(),
            },
            EmailAddress {
                name: String::new(),
                address: "b@example.com".into(),
            },
        ];
        assert_eq!(addr_str(&addrs, ","), "\"A\" <a@example.com>, b@example.com");
        assert_eq!(name_str(&addrs), "A; b@example.com");
    }
}
