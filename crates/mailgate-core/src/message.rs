//! MIME parsing of accepted messages
//!
//! The raw artifact is parsed once, in the delivery worker, after the
//! spam scan. Everything the downstream webhook needs is pulled into an
//! owned structure here.

use mail_parser::{MessageParser, MimeHeaders};
use mailgate_common::{Error, Result};
use serde::Serialize;

/// A mailbox named in a message header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailParty {
    pub name: Option<String>,
    pub address: Option<String>,
}

/// One decoded attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Structured view of a parsed message
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub subject: Option<String>,
    pub from: Option<MailParty>,
    pub to: Vec<MailParty>,
    pub cc: Vec<MailParty>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Parse a raw RFC 5322 message
pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| Error::MalformedMessage("message could not be parsed".to_string()))?;

    let from = parsed.from().and_then(|a| a.first()).map(party);
    let to = parsed
        .to()
        .map(|a| a.iter().map(party).collect())
        .unwrap_or_default();
    let cc = parsed
        .cc()
        .map(|a| a.iter().map(party).collect())
        .unwrap_or_default();

    let attachments = parsed
        .attachments()
        .map(|part| Attachment {
            file_name: part.attachment_name().map(|s| s.to_string()),
            content_type: part.content_type().map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            }),
            data: part.contents().to_vec(),
        })
        .collect();

    Ok(ParsedMessage {
        subject: parsed.subject().map(|s| s.to_string()),
        from,
        to,
        cc,
        message_id: parsed.message_id().map(|s| s.to_string()),
        in_reply_to: parsed.in_reply_to().as_text().map(|s| s.to_string()),
        body_text: parsed.body_text(0).map(|s| s.to_string()),
        body_html: parsed.body_html(0).map(|s| s.to_string()),
        attachments,
    })
}

fn party(addr: &mail_parser::Addr) -> MailParty {
    MailParty {
        name: addr.name().map(|s| s.to_string()),
        address: addr.address().map(|s| s.to_string()),
    }
}
