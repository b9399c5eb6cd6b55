use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SEND_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct MessagePacket {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub raw_body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    pub email_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body_plaintext: String,
    pub send_date_formatted: String,
    pub import_label: String,
}

impl ImportRow {
    pub const COLUMNS: [&'static str; 7] = [
        "Email ID",
        "From",
        "To",
        "Subject",
        "Body",
        "Send Date",
        "Import Label",
    ];

    pub fn from_packet(packet: MessagePacket, body_plaintext: String, import_label: &str) -> Self {
        Self {
            email_id: packet.message_id,
            from: packet.from,
            to: packet.to,
            subject: packet.subject,
            body_plaintext,
            send_date_formatted: packet.date.format(SEND_DATE_FORMAT).to_string(),
            import_label: import_label.to_string(),
        }
    }

    pub fn cells(&self) -> [&str; 7] {
        [
            &self.email_id,
            &self.from,
            &self.to,
            &self.subject,
            &self.body_plaintext,
            &self.send_date_formatted,
            &self.import_label,
        ]
    }
}

/// Completion record for a (month, year). Presence means "already imported".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub month: u32,
    pub year: i32,
    /// Threads the month's search returned.
    pub email_count: u64,
    pub import_timestamp: DateTime<Utc>,
    pub notes: String,
}
