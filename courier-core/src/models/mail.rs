use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Discriminates templated sends from raw HTML sends.
///
/// The stream's `type` field carries the value; `template` selects the
/// templated path, anything else (including an absent field) is raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailKind {
    Templated,
    Raw,
}

impl MailKind {
    #[must_use]
    pub fn from_field(value: Option<&str>) -> Self {
        match value {
            Some("template" | "templated") => Self::Templated,
            _ => Self::Raw,
        }
    }
}

/// One unit of work on the mail stream.
///
/// Wire contract: string fields `to`, `subject`, `html`, `type` and
/// optional `data` on each stream entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub kind: MailKind,
    pub data: Option<String>,
}

impl MailMessage {
    /// Parse a mail message from a stream entry's field map.
    ///
    /// `to`, `subject` and `html` are required; a missing or non-string
    /// field is a permanent decode failure (the entry can never become
    /// deliverable by retrying).
    pub fn from_fields(fields: &HashMap<String, redis::Value>) -> Result<Self> {
        let get = |key: &str| -> Option<String> {
            fields
                .get(key)
                .and_then(|v| redis::from_redis_value::<String>(v.clone()).ok())
        };

        let missing = |field: &str| Error::Deserialization {
            context: format!("missing field '{field}'"),
        };

        let to = get("to").ok_or_else(|| missing("to"))?;
        let subject = get("subject").ok_or_else(|| missing("subject"))?;
        let html = get("html").ok_or_else(|| missing("html"))?;
        let kind = MailKind::from_field(get("type").as_deref());
        let data = get("data");

        Ok(Self {
            to,
            subject,
            html,
            kind,
            data,
        })
    }
}

/// Terminal record for an entry that exhausted its retry budget.
///
/// Appended to the dead-letter stream and never read back by this
/// service; operators inspect it out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_id: String,
    pub to: String,
    pub subject: String,
    pub reason: String,
    /// Unix timestamp (seconds)
    pub failed_at: i64,
}

impl DeadLetter {
    #[must_use]
    pub fn new(original_id: &str, mail: &MailMessage, reason: &str) -> Self {
        Self {
            original_id: original_id.to_string(),
            to: mail.to.clone(),
            subject: mail.subject.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now().timestamp(),
        }
    }

    /// Field pairs for XADD onto the dead-letter stream
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("original_id".to_string(), self.original_id.clone()),
            ("to".to_string(), self.to.clone()),
            ("subject".to_string(), self.subject.clone()),
            ("reason".to_string(), self.reason.clone()),
            ("failed_at".to_string(), self.failed_at.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> redis::Value {
        redis::Value::BulkString(s.as_bytes().to_vec())
    }

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, redis::Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), bulk(v)))
            .collect()
    }

    #[test]
    fn test_parse_full_entry() {
        let map = fields(&[
            ("to", "a@x.com"),
            ("subject", "S"),
            ("html", "<p>H</p>"),
            ("type", "template"),
            ("data", "{\"name\":\"Ada\"}"),
        ]);

        let mail = MailMessage::from_fields(&map).unwrap();
        assert_eq!(mail.to, "a@x.com");
        assert_eq!(mail.subject, "S");
        assert_eq!(mail.html, "<p>H</p>");
        assert_eq!(mail.kind, MailKind::Templated);
        assert_eq!(mail.data.as_deref(), Some("{\"name\":\"Ada\"}"));
    }

    #[test]
    fn test_parse_minimal_entry_defaults_to_raw() {
        let map = fields(&[("to", "a@x.com"), ("subject", "S"), ("html", "<p>H</p>")]);

        let mail = MailMessage::from_fields(&map).unwrap();
        assert_eq!(mail.kind, MailKind::Raw);
        assert!(mail.data.is_none());
    }

    #[test]
    fn test_parse_rejects_missing_required_fields() {
        let map = fields(&[("subject", "S"), ("html", "<p>H</p>")]);
        let err = MailMessage::from_fields(&map).unwrap_err();
        assert!(err.to_string().contains("'to'"));

        let map = fields(&[("to", "a@x.com"), ("html", "<p>H</p>")]);
        assert!(MailMessage::from_fields(&map).is_err());

        let map = fields(&[("to", "a@x.com"), ("subject", "S")]);
        assert!(MailMessage::from_fields(&map).is_err());
    }

    #[test]
    fn test_mail_kind_from_field() {
        assert_eq!(MailKind::from_field(Some("template")), MailKind::Templated);
        assert_eq!(MailKind::from_field(Some("templated")), MailKind::Templated);
        assert_eq!(MailKind::from_field(Some("raw")), MailKind::Raw);
        assert_eq!(MailKind::from_field(Some("anything")), MailKind::Raw);
        assert_eq!(MailKind::from_field(None), MailKind::Raw);
    }

    #[test]
    fn test_dead_letter_fields() {
        let mail = MailMessage {
            to: "a@x.com".to_string(),
            subject: "S".to_string(),
            html: "<p>H</p>".to_string(),
            kind: MailKind::Raw,
            data: None,
        };

        let record = DeadLetter::new("1700000000-0", &mail, "max retries");
        let fields = record.to_fields();

        assert_eq!(
            fields[0],
            ("original_id".to_string(), "1700000000-0".to_string())
        );
        assert_eq!(fields[1], ("to".to_string(), "a@x.com".to_string()));
        assert_eq!(fields[2], ("subject".to_string(), "S".to_string()));
        assert_eq!(fields[3], ("reason".to_string(), "max retries".to_string()));
        assert!(record.failed_at > 0);
    }
}
