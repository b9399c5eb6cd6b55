use anyhow::Result;
use chrono::{DateTime, Utc};

/// Mailbox provider. `search` takes a query in the
/// `from:<addr> in:<mailbox> after:<date> before:<date>` grammar and returns
/// matching threads in a stable order.
pub trait MessageStore {
    fn search(&self, query: &str) -> Result<Vec<Box<dyn MailThread + '_>>>;
}

pub trait MailThread {
    fn id(&self) -> &str;
    fn messages(&self) -> Result<Vec<Box<dyn MailMessage + '_>>>;
}

pub trait MailMessage {
    fn id(&self) -> &str;

    fn raw_source(&self) -> Result<Vec<u8>>;

    /// "From" as rendered by the client; may carry a display name or alias.
    fn from(&self) -> &str;
    fn to(&self) -> &str;
    fn subject(&self) -> &str;
    fn date(&self) -> Result<DateTime<Utc>>;

    fn body(&self) -> Result<String>;
}
