//! MIME plumbing for outgoing mail: normalisation of client-submitted
//! RFC822 bodies and reconstruction of forwarded messages.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lazy_static::lazy_static;
use mail_parser::{Address, MessageParser, MimeHeaders};
use uuid::Uuid;

use crate::error::CommandError;

lazy_static! {
    static ref BCC_RE: regex::bytes::Regex =
        regex::bytes::Regex::new(r"(?im)^BCC:.*\r\n").expect("static BCC regex");
}

/// A parsed outgoing message as submitted by the client.
#[derive(Debug)]
pub(crate) struct MimeMessage {
    /// Normalized message: CRLF line endings, Bcc headers stripped.
    pub norm: Vec<u8>,
    /// Envelope recipients from To, Cc and Bcc.
    pub rcpts: Vec<String>,
    /// Top-level headers in original order.
    pub headers: Vec<(String, String)>,
    pub text: String,
    pub html: String,
    /// Attachments and inlines to be copied into a forward.
    pub parts: Vec<ForwardPart>,
}

#[derive(Debug)]
pub(crate) struct ForwardPart {
    pub content_type: String,
    pub name: String,
    pub content_id: String,
    pub inline: bool,
    pub data: Vec<u8>,
}

impl MimeMessage {
    pub(crate) fn parse(raw: &[u8]) -> Result<MimeMessage, CommandError> {
        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| CommandError::BadRequest("unparsable MIME message".into()))?;

        // To is required; Cc and Bcc are optional.
        let mut rcpts = plain_addresses(message.to());
        if rcpts.is_empty() {
            return Err(CommandError::BadRequest(
                "missing To addresses in the outgoing message".into(),
            ));
        }
        rcpts.extend(plain_addresses(message.cc()));
        rcpts.extend(plain_addresses(message.bcc()));

        let text = message
            .body_text(0)
            .map(|b| b.into_owned())
            .unwrap_or_default();
        let html = message
            .body_html(0)
            .map(|b| b.into_owned())
            .unwrap_or_default();

        let mut parts = Vec::new();
        for part in message.attachments() {
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let inline = part
                .content_disposition()
                .map(|cd| cd.ctype().eq_ignore_ascii_case("inline"))
                .unwrap_or(false);
            parts.push(ForwardPart {
                content_type,
                name: part.attachment_name().unwrap_or_default().to_string(),
                content_id: part
                    .content_id()
                    .unwrap_or_default()
                    .trim_matches(|c| c == '<' || c == '>')
                    .to_string(),
                inline,
                data: part.contents().to_vec(),
            });
        }

        Ok(MimeMessage {
            norm: remove_bcc(&to_crlf(raw)),
            rcpts,
            headers: raw_headers(raw),
            text,
            html,
            parts,
        })
    }
}

fn plain_addresses(addr: Option<&Address>) -> Vec<String> {
    addr.map(|list| {
        list.iter()
            .filter_map(|a| a.address())
            .map(|a| a.to_string())
            .collect()
    })
    .unwrap_or_default()
}

/// Normalizes line endings to CRLF.
pub(crate) fn to_crlf(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let lines: Vec<&[u8]> = data
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect();
    lines.join(&b"\r\n"[..])
}

/// Strips Bcc header lines before the message leaves the server.
pub(crate) fn remove_bcc(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    BCC_RE.replace_all(data, &b""[..]).into_owned()
}

/// Top-level headers of a raw message, with folded continuation lines
/// unfolded.
pub(crate) fn raw_headers(raw: &[u8]) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in String::from_utf8_lossy(raw).lines() {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim_start());
            }
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    headers
}

/// Base64 body text wrapped at 76 columns with CRLF line breaks.
pub(crate) fn wrap_base64(data: &str) -> String {
    if data.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(data.len() + data.len() / 76 * 2 + 2);
    let bytes = data.as_bytes();
    for chunk in bytes.chunks(76) {
        // Base64 text is pure ASCII.
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
    out
}

/// Rebuilds the top-level headers of a forward: the original fields minus
/// Bcc, Content-Type and Mime-Version, then the multipart/related envelope.
fn forward_header(headers: &[(String, String)], boundary: &str) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        let low = name.to_ascii_lowercase();
        if low == "bcc" || low == "content-type" || low == "mime-version" {
            continue;
        }
        if value.is_empty() {
            continue;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!(
        "Content-Type: multipart/related;\r\n\tboundary=\"{boundary}\";\r\n\ttype=\"multipart/alternative\"\r\n"
    ));
    out.push_str("Mime-Version: 1.0\r\n");
    out
}

fn new_boundary() -> String {
    format!("=_{}", Uuid::new_v4().simple())
}

/// Wraps a forwarded message: a multipart/alternative subpart with the new
/// text and HTML bodies, the new attachments and inlines, and the original
/// message as a base64 `message/rfc822` attachment.
pub(crate) fn build_forward_mime(msg: &MimeMessage, original: &[u8]) -> Vec<u8> {
    let boundary = new_boundary();
    let sub_boundary = new_boundary();

    let mut alternative = String::new();
    if !msg.text.is_empty() {
        alternative.push_str(&format!(
            "--{sub_boundary}\r\nContent-Type: text/plain; charset=\"utf-8\"\r\nContent-Transfer-Encoding: base64\r\n\r\n{}",
            wrap_base64(&BASE64.encode(msg.text.as_bytes()))
        ));
    }
    if !msg.html.is_empty() {
        alternative.push_str(&format!(
            "--{sub_boundary}\r\nContent-Type: text/html; charset=\"utf-8\"\r\nContent-Transfer-Encoding: base64\r\n\r\n{}",
            wrap_base64(&BASE64.encode(msg.html.as_bytes()))
        ));
    }
    alternative.push_str(&format!("--{sub_boundary}--\r\n"));

    let mut body = String::new();
    body.push_str(&format!(
        "--{boundary}\r\nContent-Type: multipart/alternative;\r\n\tboundary=\"{sub_boundary}\"\r\n\r\n{alternative}"
    ));

    // The new attachments and inlines of this forward, re-emitted verbatim
    // as base64.
    for part in &msg.parts {
        body.push_str(&format!("--{boundary}\r\n"));
        if part.name.is_empty() {
            body.push_str(&format!("Content-Type: {}\r\n", part.content_type));
        } else {
            body.push_str(&format!(
                "Content-Type: {}; name=\"{}\"\r\n",
                part.content_type, part.name
            ));
        }
        let disposition = if part.inline { "inline" } else { "attachment" };
        if part.name.is_empty() {
            body.push_str(&format!("Content-Disposition: {disposition}\r\n"));
        } else {
            body.push_str(&format!(
                "Content-Disposition: {disposition}; filename=\"{}\"\r\n",
                part.name
            ));
        }
        if !part.content_id.is_empty() {
            body.push_str(&format!("Content-ID: <{}>\r\n", part.content_id));
        }
        body.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
        body.push_str(&wrap_base64(&BASE64.encode(&part.data)));
    }

    // The previous message as an RFC822 attachment.
    body.push_str(&format!(
        "--{boundary}\r\nContent-Disposition: attachment; filename=\"MailAttachment.eml\"\r\nContent-Type: message/rfc822\r\nContent-Transfer-Encoding: base64\r\n\r\n{}",
        wrap_base64(&BASE64.encode(original))
    ));
    body.push_str(&format!("--{boundary}--\r\n"));

    let mut out = forward_header(&msg.headers, &boundary).into_bytes();
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body.as_bytes());
    out
}
