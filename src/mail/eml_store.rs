use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveTime, Utc};
use log::{debug, warn};
use mailparse::MailHeaderMap;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::job::SearchQuery;
use crate::mail::decoders::same_address;
use crate::mail::store::{MailMessage, MailThread, MessageStore};

#[derive(Debug, Clone)]
struct StoredMessage {
    path: PathBuf,
    id: String,
    from: String,
    to: String,
    subject: String,
    date: Option<DateTime<Utc>>,
    thread_key: String,
}

pub struct EmlDirStore {
    mailbox: String,
    messages: Vec<StoredMessage>,
}

impl EmlDirStore {
    /// Index the headers of every file under `dir`. `mailbox` is the name the
    /// `in:` query term must use to match this store (e.g. "sent").
    pub fn open(dir: &Path, mailbox: &str) -> Result<Self> {
        if !dir.is_dir() {
            return Err(anyhow!("{} is not a directory", dir.display()));
        }

        let mut messages = Vec::new();
        for path in list_files(dir)? {
            match index_message(&path) {
                Ok(m) => messages.push(m),
                Err(e) => warn!("skipping {}: {e}", path.display()),
            }
        }
        debug!("indexed {} messages under {}", messages.len(), dir.display());

        Ok(Self {
            mailbox: mailbox.to_string(),
            messages,
        })
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn matches(m: &StoredMessage, from: &str, after: DateTime<Utc>, before: DateTime<Utc>) -> bool {
    let Some(date) = m.date else {
        return false;
    };
    same_address(&m.from, from) && date >= after && date < before
}

impl MessageStore for EmlDirStore {
    fn search(&self, query: &str) -> Result<Vec<Box<dyn MailThread + '_>>> {
        let q: SearchQuery = query.parse()?;
        if !q.mailbox.eq_ignore_ascii_case(&self.mailbox) {
            return Ok(vec![]);
        }
        let after = q.after.and_time(NaiveTime::MIN).and_utc();
        let before = q.before.and_time(NaiveTime::MIN).and_utc();

        let mut by_thread: HashMap<&str, Vec<&StoredMessage>> = HashMap::new();
        for m in &self.messages {
            by_thread.entry(m.thread_key.as_str()).or_default().push(m);
        }

        let mut threads: Vec<EmlThread<'_>> = by_thread
            .into_iter()
            .filter(|(_, msgs)| msgs.iter().any(|m| matches(m, &q.from, after, before)))
            .map(|(key, mut msgs)| {
                msgs.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
                EmlThread {
                    key: key.to_string(),
                    messages: msgs,
                }
            })
            .collect();

        // Oldest root first. New mail only ever joins an existing thread or
        // starts one at the end, so a saved offset keeps its meaning.
        threads.sort_by(|a, b| a.root().cmp(&b.root()).then_with(|| a.key.cmp(&b.key)));

        Ok(threads
            .into_iter()
            .map(|t| Box::new(t) as Box<dyn MailThread + '_>)
            .collect())
    }
}

struct EmlThread<'a> {
    key: String,
    messages: Vec<&'a StoredMessage>,
}

impl EmlThread<'_> {
    fn root(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().filter_map(|m| m.date).min()
    }
}

impl MailThread for EmlThread<'_> {
    fn id(&self) -> &str {
        &self.key
    }

    fn messages(&self) -> Result<Vec<Box<dyn MailMessage + '_>>> {
        Ok(self
            .messages
            .iter()
            .map(|m| Box::new(EmlMessage { stored: *m }) as Box<dyn MailMessage + '_>)
            .collect())
    }
}

struct EmlMessage<'a> {
    stored: &'a StoredMessage,
}

impl MailMessage for EmlMessage<'_> {
    fn id(&self) -> &str {
        &self.stored.id
    }

    fn raw_source(&self) -> Result<Vec<u8>> {
        fs::read(&self.stored.path)
            .with_context(|| format!("reading {}", self.stored.path.display()))
    }

    fn from(&self) -> &str {
        &self.stored.from
    }

    fn to(&self) -> &str {
        &self.stored.to
    }

    fn subject(&self) -> &str {
        &self.stored.subject
    }

    fn date(&self) -> Result<DateTime<Utc>> {
        self.stored
            .date
            .ok_or_else(|| anyhow!("message {} has no usable Date header", self.stored.id))
    }

    fn body(&self) -> Result<String> {
        let raw = self.raw_source()?;
        extract_body(&raw)
    }
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(d) = pending.pop() {
        for entry in fs::read_dir(&d)? {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if hidden {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn index_message(path: &Path) -> Result<StoredMessage> {
    let raw = fs::read(path)?;
    let (headers, _) = mailparse::parse_headers(&raw)?;

    let header = |name: &str| {
        headers
            .get_first_value(name)
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };

    let id = first_msg_id(&header("Message-ID")).unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let thread_key = first_msg_id(&header("References"))
        .or_else(|| first_msg_id(&header("In-Reply-To")))
        .unwrap_or_else(|| id.clone());

    let date = headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|epoch| DateTime::from_timestamp(epoch, 0));

    Ok(StoredMessage {
        path: path.to_path_buf(),
        id,
        from: header("From"),
        to: header("To"),
        subject: header("Subject"),
        date,
        thread_key,
    })
}

fn first_msg_id(value: &str) -> Option<String> {
    let start = value.find('<')?;
    let end = value[start..].find('>')? + start;
    let id = value[start + 1..end].trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// HTML part when present, else the plain-text part, else the whole body.
fn extract_body(raw: &[u8]) -> Result<String> {
    let parsed = mailparse::parse_mail(raw)?;
    if let Some(html) = find_part(&parsed, "text/html") {
        return Ok(html);
    }
    if let Some(plain) = find_part(&parsed, "text/plain") {
        return Ok(plain);
    }
    Ok(parsed.get_body()?)
}

fn find_part(p: &mailparse::ParsedMail, mime: &str) -> Option<String> {
    if p.subparts.is_empty() && p.ctype.mimetype.eq_ignore_ascii_case(mime) {
        return p.get_body().ok();
    }
    p.subparts.iter().find_map(|sp| find_part(sp, mime))
}
