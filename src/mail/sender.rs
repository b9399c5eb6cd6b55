use anyhow::{Result, anyhow};
use log::warn;
use mailparse::MailHeaderMap;

use crate::mail::decoders::{extract_address, same_address};
use crate::mail::store::MailMessage;

/// Address of the real sender: the raw `From:` header when it can be read,
/// else the client-reported from field.
pub fn authoritative_sender(message: &dyn MailMessage) -> String {
    match header_from(message) {
        Ok(from) => extract_address(&from),
        Err(e) => {
            warn!(
                "message {}: cannot read raw From header ({e}); using client from field",
                message.id()
            );
            extract_address(message.from())
        }
    }
}

pub fn is_sent_by(message: &dyn MailMessage, target: &str) -> bool {
    same_address(&authoritative_sender(message), target)
}

fn header_from(message: &dyn MailMessage) -> Result<String> {
    let raw = message.raw_source()?;
    let (headers, _) = mailparse::parse_headers(&raw)?;
    headers
        .get_first_value("From")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("no From header"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    struct FakeMessage {
        raw: Option<&'static str>,
        from: &'static str,
    }

    impl MailMessage for FakeMessage {
        fn id(&self) -> &str {
            "m1"
        }
        fn raw_source(&self) -> Result<Vec<u8>> {
            self.raw
                .map(|r| r.as_bytes().to_vec())
                .ok_or_else(|| anyhow!("raw source unavailable"))
        }
        fn from(&self) -> &str {
            self.from
        }
        fn to(&self) -> &str {
            ""
        }
        fn subject(&self) -> &str {
            ""
        }
        fn date(&self) -> Result<DateTime<Utc>> {
            Ok(Utc::now())
        }
        fn body(&self) -> Result<String> {
            Ok(String::new())
        }
    }

    #[test]
    fn raw_header_wins_over_client_from() {
        let msg = FakeMessage {
            raw: Some("From: Alias Name <real@address.com>\r\nSubject: hi\r\n\r\nbody"),
            from: "spoofed@other.com",
        };
        assert_eq!(authoritative_sender(&msg), "real@address.com");
        assert!(is_sent_by(&msg, "REAL@address.com"));
        assert!(!is_sent_by(&msg, "spoofed@other.com"));
    }

    #[test]
    fn falls_back_to_client_from_when_raw_unavailable() {
        let msg = FakeMessage {
            raw: None,
            from: "Me <me@work.com>",
        };
        assert_eq!(authoritative_sender(&msg), "me@work.com");
        assert!(is_sent_by(&msg, "me@work.com"));
    }

    #[test]
    fn falls_back_when_from_header_missing() {
        let msg = FakeMessage {
            raw: Some("Subject: no sender\r\n\r\nbody"),
            from: "me@work.com",
        };
        assert!(is_sent_by(&msg, "me@work.com"));
    }

    #[test]
    fn header_without_brackets_is_trimmed() {
        let msg = FakeMessage {
            raw: Some("From:   bare@work.com  \r\n\r\n"),
            from: "x@y.z",
        };
        assert_eq!(authoritative_sender(&msg), "bare@work.com");
    }
}
