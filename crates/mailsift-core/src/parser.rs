//! Parser seam and the default header parser

use async_trait::async_trait;
use mail_parser::{MessageParser, MimeHeaders};
use mailsift_common::{ResultRecord, WorkItem};
use serde::Serialize;
use serde_json::json;

use crate::error::ParseError;

/// Turns one work item into a result record
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse(&self, item: &WorkItem) -> Result<ResultRecord, ParseError>;
}

#[derive(Debug, Serialize)]
struct AttachmentSummary {
    name: Option<String>,
    content_type: Option<String>,
    size: usize,
}

/// Summarizes headers, a body preview and attachments
#[derive(Debug, Clone)]
pub struct HeaderParser {
    preview_chars: usize,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self { preview_chars: 500 }
    }
}

impl HeaderParser {
    pub fn new(preview_chars: usize) -> Self {
        Self { preview_chars }
    }

    fn features(&self, raw: &[u8]) -> Result<serde_json::Value, ParseError> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| ParseError("not an RFC 5322 message".to_string()))?;

        let from = parsed
            .from()
            .and_then(|a| a.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string());
        let to: Vec<String> = parsed
            .to()
            .map(|list| {
                list.iter()
                    .filter_map(|a| a.address())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();

        let body_preview = parsed
            .body_text(0)
            .map(|s| s.chars().take(self.preview_chars).collect::<String>());

        let attachments: Vec<AttachmentSummary> = parsed
            .attachments()
            .map(|part| AttachmentSummary {
                name: part.attachment_name().map(|s| s.to_string()),
                content_type: part.content_type().map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                }),
                size: part.contents().len(),
            })
            .collect();

        Ok(json!({
            "subject": parsed.subject(),
            "from": from,
            "to": to,
            "message_id": parsed.message_id(),
            "date": parsed.date().map(|d| d.to_rfc3339()),
            "size": raw.len(),
            "header_count": parsed.headers().len(),
            "body_preview": body_preview,
            "attachment_count": parsed.attachment_count(),
            "attachments": attachments,
        }))
    }
}

#[async_trait]
impl Parser for HeaderParser {
    async fn parse(&self, item: &WorkItem) -> Result<ResultRecord, ParseError> {
        let features = self.features(&item.raw)?;
        Ok(ResultRecord::for_item(item, features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsift_common::Origin;
    use pretty_assertions::assert_eq;

    const MESSAGE: &str = "From: Alice <alice@example.com>\r\n\
To: bob@example.com, carol@example.com\r\n\
Subject: Quarterly numbers\r\n\
Message-ID: <q3@example.com>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain\r\n\
\r\n\
See attached.\r\n\
--XX\r\n\
Content-Type: text/csv\r\n\
Content-Disposition: attachment; filename=\"q3.csv\"\r\n\
\r\n\
a,b\r\n1,2\r\n\
--XX--\r\n";

    fn item(raw: &[u8]) -> WorkItem {
        WorkItem::new(
            "alice@example.com",
            vec!["bob@example.com".to_string()],
            Origin::new("mx.example.com", 25, "smtp"),
            raw.to_vec(),
        )
    }

    #[tokio::test]
    async fn test_header_parser_extracts_summary() {
        let item = item(MESSAGE.as_bytes());
        let record = HeaderParser::default().parse(&item).await.unwrap();

        assert_eq!(record.uid, item.id.to_string());
        assert_eq!(record.sender, "alice@example.com");

        let features = &record.features;
        assert_eq!(features["subject"], "Quarterly numbers");
        assert_eq!(features["from"], "alice@example.com");
        assert_eq!(features["to"], json!(["bob@example.com", "carol@example.com"]));
        assert_eq!(features["message_id"], "q3@example.com");
        assert_eq!(features["attachment_count"], 1);
        assert_eq!(features["attachments"][0]["name"], "q3.csv");
        assert_eq!(features["attachments"][0]["content_type"], "text/csv");
        assert!(features["body_preview"]
            .as_str()
            .unwrap()
            .starts_with("See attached."));
    }

    #[tokio::test]
    async fn test_preview_is_truncated() {
        let raw = format!("Subject: long\r\n\r\n{}", "x".repeat(100));
        let record = HeaderParser::new(10)
            .parse(&item(raw.as_bytes()))
            .await
            .unwrap();
        assert_eq!(record.features["body_preview"], "xxxxxxxxxx");
    }

    #[tokio::test]
    async fn test_empty_input_fails() {
        assert!(HeaderParser::default().parse(&item(b"")).await.is_err());
    }
}
