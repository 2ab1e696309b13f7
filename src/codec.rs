//! Wire-body transcoding boundary.
//!
//! The ActiveSync wire format is WBXML; the actual transcoder is an external
//! collaborator hidden behind `BodyCodec`. The crate ships a plain-XML
//! pass-through implementation that is byte-transparent, which the tests and
//! the debug listener use.

use crate::error::CommandError;

pub const WBXML_CONTENT_TYPE: &str = "application/vnd.ms-sync.wbxml";

const XML_PROLOG: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;
const ACTIVESYNC_DOCTYPE: &str =
    r#"<!DOCTYPE ActiveSync PUBLIC "-//MICROSOFT//DTD ActiveSync//EN" "http://www.microsoft.com/">"#;

pub trait BodyCodec: Send + Sync {
    /// Encodes a response document. The input may or may not carry the XML
    /// prolog; implementations prepend the ActiveSync prolog when missing.
    fn encode(&self, xml: &str) -> Result<Vec<u8>, CommandError>;

    /// Decodes a request body into an XML document.
    fn decode(&self, body: &[u8]) -> Result<String, CommandError>;
}

pub struct PlainXmlCodec;

impl BodyCodec for PlainXmlCodec {
    fn encode(&self, xml: &str) -> Result<Vec<u8>, CommandError> {
        let mut out = String::with_capacity(xml.len() + XML_PROLOG.len() + ACTIVESYNC_DOCTYPE.len());
        if !xml.starts_with("<?xml") {
            out.push_str(XML_PROLOG);
            out.push_str(ACTIVESYNC_DOCTYPE);
        }
        out.push_str(xml);
        Ok(out.into_bytes())
    }

    fn decode(&self, body: &[u8]) -> Result<String, CommandError> {
        String::from_utf8(body.to_vec())
            .map_err(|e| CommandError::BadRequest(format!("request body is not valid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prepends_prolog_once() {
        let codec = PlainXmlCodec;
        let out = codec.encode("<Ping/>").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("<?xml"));
        assert!(text.contains("DOCTYPE ActiveSync"));

        let already = codec.encode(&text).unwrap();
        assert_eq!(String::from_utf8(already).unwrap(), text);
    }
}
