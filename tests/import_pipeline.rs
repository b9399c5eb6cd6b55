use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use std::cell::{Cell, RefCell};
use std::time::Duration;
use tempfile::TempDir;

use sent_mail_import::domain::email::{ImportRow, MetadataRecord};
use sent_mail_import::domain::job::ImportJob;
use sent_mail_import::import::error::ImportError;
use sent_mail_import::import::progress::{self, Stage};
use sent_mail_import::import::{
    BatchReport, ImportOutcome, ImportSettings, Importer, Reconciliation, Verdict, clear_all,
    lock,
};
use sent_mail_import::mail::eml_store::EmlDirStore;
use sent_mail_import::mail::store::{MailMessage, MailThread, MessageStore};
use sent_mail_import::notify::Notifier;
use sent_mail_import::store::repo::{MetadataSheet, PropertyStore, TableStore};
use sent_mail_import::store::sqlite::SqliteRepo;

const ME: &str = "me@work.com";

#[derive(Clone)]
struct FakeMessage {
    id: String,
    raw: Option<String>,
    from: String,
    date: DateTime<Utc>,
    body: Option<String>,
}

impl FakeMessage {
    fn sent(id: &str, day: u32, body: &str) -> Self {
        let date = Utc.with_ymd_and_hms(2024, 2, day, 9, 30, 0).unwrap();
        Self::from_addr(id, &format!("Me <{ME}>"), date, body)
    }

    fn from_addr(id: &str, from: &str, date: DateTime<Utc>, body: &str) -> Self {
        Self {
            id: id.to_string(),
            raw: Some(format!("From: {from}\r\nSubject: s\r\n\r\n{body}")),
            from: from.to_string(),
            date,
            body: Some(body.to_string()),
        }
    }
}

impl MailMessage for FakeMessage {
    fn id(&self) -> &str {
        &self.id
    }
    fn raw_source(&self) -> Result<Vec<u8>> {
        self.raw
            .as_ref()
            .map(|r| r.as_bytes().to_vec())
            .ok_or_else(|| anyhow!("raw source unavailable"))
    }
    fn from(&self) -> &str {
        &self.from
    }
    fn to(&self) -> &str {
        "bob@x.com"
    }
    fn subject(&self) -> &str {
        "Status"
    }
    fn date(&self) -> Result<DateTime<Utc>> {
        Ok(self.date)
    }
    fn body(&self) -> Result<String> {
        self.body.clone().ok_or_else(|| anyhow!("body could not be decoded"))
    }
}

#[derive(Clone)]
struct FakeThread {
    id: String,
    messages: Vec<FakeMessage>,
    broken: bool,
}

impl FakeThread {
    fn new(id: &str, messages: Vec<FakeMessage>) -> Self {
        Self {
            id: id.to_string(),
            messages,
            broken: false,
        }
    }
}

impl MailThread for FakeThread {
    fn id(&self) -> &str {
        &self.id
    }
    fn messages(&self) -> Result<Vec<Box<dyn MailMessage + '_>>> {
        if self.broken {
            return Err(anyhow!("thread fetch timed out"));
        }
        Ok(self
            .messages
            .iter()
            .cloned()
            .map(|m| Box::new(m) as Box<dyn MailMessage>)
            .collect())
    }
}

#[derive(Default)]
struct FakeStore {
    threads: Vec<FakeThread>,
    fail_search: bool,
    queries: RefCell<Vec<String>>,
}

impl MessageStore for FakeStore {
    fn search(&self, query: &str) -> Result<Vec<Box<dyn MailThread + '_>>> {
        self.queries.borrow_mut().push(query.to_string());
        if self.fail_search {
            return Err(anyhow!("provider unavailable"));
        }
        Ok(self
            .threads
            .iter()
            .cloned()
            .map(|t| Box::new(t) as Box<dyn MailThread>)
            .collect())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    seen: RefCell<Vec<(String, String)>>,
}

impl RecordingNotifier {
    fn last_title(&self) -> String {
        self.seen
            .borrow()
            .last()
            .map(|(t, _)| t.clone())
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, message: &str) {
        self.seen
            .borrow_mut()
            .push((title.to_string(), message.to_string()));
    }
}

/// SQLite table that counts calls and can be told to fail writes.
struct CountingTable<'a> {
    inner: &'a SqliteRepo,
    appends: Cell<usize>,
    resizes: Cell<usize>,
    fail_append: Cell<bool>,
}

impl<'a> CountingTable<'a> {
    fn new(inner: &'a SqliteRepo) -> Self {
        Self {
            inner,
            appends: Cell::new(0),
            resizes: Cell::new(0),
            fail_append: Cell::new(false),
        }
    }
}

impl TableStore for CountingTable<'_> {
    fn append_rows(&self, rows: &[ImportRow]) -> Result<()> {
        if self.fail_append.get() {
            return Err(anyhow!("quota exceeded"));
        }
        self.appends.set(self.appends.get() + 1);
        self.inner.append_rows(rows)
    }
    fn set_values(&self, start_row: u64, rows: &[ImportRow]) -> Result<()> {
        self.inner.set_values(start_row, rows)
    }
    fn last_row(&self) -> Result<u64> {
        self.inner.last_row()
    }
    fn row_count(&self, label: &str) -> Result<u64> {
        self.inner.row_count(label)
    }
    fn rows_for_label(&self, label: &str) -> Result<Vec<ImportRow>> {
        self.inner.rows_for_label(label)
    }
    fn auto_resize_columns(&self) -> Result<()> {
        self.resizes.set(self.resizes.get() + 1);
        self.inner.auto_resize_columns()
    }
    fn column_widths(&self) -> Result<Vec<usize>> {
        self.inner.column_widths()
    }
    fn clear_rows(&self) -> Result<()> {
        self.inner.clear_rows()
    }
}

fn settings(dir: &TempDir, batch_size: usize) -> ImportSettings {
    let mut s = ImportSettings::new(dir.path().join("import.lock"));
    s.batch_size = batch_size;
    s.lock_timeout = Duration::from_millis(50);
    s
}

fn feb() -> ImportJob {
    ImportJob::new(2, 2024, ME).unwrap()
}

fn run(
    store: &dyn MessageStore,
    table: &dyn TableStore,
    repo: &SqliteRepo,
    notifier: &dyn Notifier,
    settings: ImportSettings,
) -> Result<ImportOutcome, ImportError> {
    Importer::new(store, table, repo, repo, notifier, settings).run(&feb())
}

/// Seven threads; every thread has one or two messages sent by the work
/// address plus a received reply.
fn seven_threads() -> FakeStore {
    let threads = (1..=7)
        .map(|n| {
            let mut msgs = vec![
                FakeMessage::sent(&format!("t{n}-a"), n, &format!("<p>Update {n}</p>")),
                FakeMessage::from_addr(
                    &format!("t{n}-reply"),
                    "Bob <bob@x.com>",
                    Utc.with_ymd_and_hms(2024, 2, n + 1, 8, 0, 0).unwrap(),
                    "thanks",
                ),
            ];
            if n % 2 == 0 {
                msgs.push(FakeMessage::sent(&format!("t{n}-b"), n + 2, "Follow-up"));
            }
            FakeThread::new(&format!("t{n}"), msgs)
        })
        .collect();
    FakeStore {
        threads,
        ..Default::default()
    }
}

fn completed(outcome: ImportOutcome) -> (BatchReport, Reconciliation) {
    match outcome {
        ImportOutcome::Completed {
            batch,
            reconciliation,
        } => (batch, reconciliation),
        other => panic!("expected completion, got {other:?}"),
    }
}

fn paused(outcome: ImportOutcome) -> BatchReport {
    match outcome {
        ImportOutcome::BatchPaused(batch) => batch,
        other => panic!("expected a paused batch, got {other:?}"),
    }
}

fn sorted_rows(repo: &SqliteRepo) -> Vec<ImportRow> {
    let mut rows = repo.rows_for_label("February 2024").unwrap();
    rows.sort_by(|a, b| a.email_id.cmp(&b.email_id));
    rows
}

#[test]
fn no_results_leaves_no_state() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let notes = RecordingNotifier::default();
    let store = FakeStore::default();

    let outcome = run(&store, &repo, &repo, &notes, settings(&dir, 5)).unwrap();

    assert_eq!(outcome, ImportOutcome::NoResults);
    assert!(
        repo.list_keys()
            .unwrap()
            .iter()
            .all(|k| k == progress::PROGRESS_KEY)
    );
    assert!(repo.metadata_rows().unwrap().is_empty());
    assert_eq!(notes.last_title(), "No emails found");
}

#[test]
fn search_uses_exclusive_first_of_next_month() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let store = FakeStore::default();
    run(&store, &repo, &repo, &RecordingNotifier::default(), settings(&dir, 5)).unwrap();

    assert_eq!(
        store.queries.borrow().as_slice(),
        ["from:me@work.com in:sent after:2024-02-01 before:2024-03-01"]
    );
}

#[test]
fn already_imported_month_is_refused() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let notes = RecordingNotifier::default();
    repo.append_metadata(&MetadataRecord {
        month: 2,
        year: 2024,
        email_count: 3,
        import_timestamp: Utc::now(),
        notes: String::new(),
    })
    .unwrap();
    let store = seven_threads();

    let outcome = run(&store, &repo, &repo, &notes, settings(&dir, 50)).unwrap();

    assert_eq!(outcome, ImportOutcome::AlreadyImported);
    assert_eq!(repo.last_row().unwrap(), 1);
    assert!(repo.list_keys().unwrap().is_empty());
    assert_eq!(repo.metadata_rows().unwrap().len(), 1);
    assert!(store.queries.borrow().is_empty());
    assert_eq!(notes.last_title(), "Already imported");
}

#[test]
fn resumed_batches_match_a_single_run() {
    let store = seven_threads();

    let single_dir = TempDir::new().unwrap();
    let single = SqliteRepo::open_in_memory().unwrap();
    let outcome = run(
        &store,
        &single,
        &single,
        &RecordingNotifier::default(),
        settings(&single_dir, 100),
    )
    .unwrap();
    let (_, reconciliation) = completed(outcome);
    assert_eq!(reconciliation.expected, 10);

    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let table = CountingTable::new(&repo);
    let notes = RecordingNotifier::default();

    let mut done = Vec::new();
    let final_outcome = loop {
        match run(&store, &table, &repo, &notes, settings(&dir, 3)).unwrap() {
            ImportOutcome::BatchPaused(batch) => {
                assert_eq!(
                    repo.get_property("batch_cursor_2024_02").unwrap(),
                    Some(batch.threads_done.to_string())
                );
                let state = progress::load(&repo).unwrap().unwrap();
                assert_eq!(state.stage, Stage::Paused);
                assert_eq!(state.emails_written, batch.rows_cumulative);
                done.push(batch.threads_done);
            }
            other => break other,
        }
    };
    assert_eq!(done, vec![3, 6]);

    let (batch, reconciliation) = completed(final_outcome);
    assert_eq!(batch.threads_done, 7);
    assert_eq!(reconciliation.expected, 10);
    assert_eq!(reconciliation.verdict(), Verdict::Pass);

    // one bulk write per invocation, columns sized once at the very end
    assert_eq!(table.appends.get(), 3);
    assert_eq!(table.resizes.get(), 1);

    assert_eq!(sorted_rows(&repo), sorted_rows(&single));
    assert!(repo.list_keys().unwrap().is_empty());
    let records = repo.metadata_rows().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].email_count, 7);
    assert!(records[0].notes.starts_with("PASS: expected 10 rows"));
    assert_eq!(notes.last_title(), "Import complete");

    // and the month is now closed
    assert_eq!(
        run(&store, &table, &repo, &notes, settings(&dir, 3)).unwrap(),
        ImportOutcome::AlreadyImported
    );
}

#[test]
fn rows_are_verified_normalized_and_labelled() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let mut spoofed = FakeMessage::sent("spoof", 3, "not mine");
    spoofed.raw = Some("From: Someone <someone@else.com>\r\n\r\nnot mine".to_string());
    let mut no_raw = FakeMessage::sent("no-raw", 4, "fallback");
    no_raw.raw = None;
    let march = FakeMessage::from_addr(
        "march",
        ME,
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        "too late",
    );
    let store = FakeStore {
        threads: vec![FakeThread::new(
            "t",
            vec![
                FakeMessage::sent(
                    "good",
                    2,
                    "Hello<br>World\n\nOn Mon, Jan 1 wrote:\n> old",
                ),
                spoofed,
                no_raw,
                march,
            ],
        )],
        ..Default::default()
    };

    run(&store, &repo, &repo, &RecordingNotifier::default(), settings(&dir, 10)).unwrap();

    let rows = repo.rows_for_label("February 2024").unwrap();
    let ids: Vec<&str> = rows.iter().map(|r| r.email_id.as_str()).collect();
    assert_eq!(ids, vec!["good", "no-raw"]);
    assert_eq!(rows[0].body_plaintext, "Hello\nWorld");
    assert_eq!(rows[0].send_date_formatted, "2024-02-02 09:30:00");
    assert_eq!(rows[0].import_label, "February 2024");
}

#[test]
fn unreadable_units_are_skipped_not_fatal() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let mut bad_body = FakeMessage::sent("bad", 5, "");
    bad_body.body = None;
    let mut broken = FakeThread::new("broken", vec![FakeMessage::sent("lost", 6, "x")]);
    broken.broken = true;
    let store = FakeStore {
        threads: vec![
            FakeThread::new("ok", vec![FakeMessage::sent("fine", 1, "hi"), bad_body]),
            broken,
        ],
        ..Default::default()
    };

    let notes = RecordingNotifier::default();
    let outcome = run(&store, &repo, &repo, &notes, settings(&dir, 10)).unwrap();

    let (batch, reconciliation) = completed(outcome);
    assert_eq!(reconciliation.expected, 1);
    assert_eq!(reconciliation.verdict(), Verdict::Pass);
    assert_eq!(batch.skipped.len(), 2);
    assert_eq!(batch.skipped[0].message_id.as_deref(), Some("bad"));
    assert_eq!(batch.skipped[1].thread_id, "broken");
    assert_eq!(batch.skipped[1].message_id, None);
}

#[test]
fn failed_search_resets_resume_state() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let notes = RecordingNotifier::default();
    repo.set_property("batch_cursor_2024_02", "3").unwrap();
    repo.set_property("count_ledger_2024_02", "4").unwrap();
    let store = FakeStore {
        fail_search: true,
        ..Default::default()
    };

    let err = run(&store, &repo, &repo, &notes, settings(&dir, 3)).unwrap_err();

    assert!(matches!(err, ImportError::Search(_)));
    assert_eq!(repo.get_property("batch_cursor_2024_02").unwrap(), None);
    assert_eq!(repo.get_property("count_ledger_2024_02").unwrap(), None);
    let state = progress::load(&repo).unwrap().unwrap();
    assert!(state.complete);
    assert!(state.error.unwrap().contains("provider unavailable"));
    assert_eq!(notes.last_title(), "Search failed");
    assert!(!dir.path().join("import.lock").exists());
}

#[test]
fn fatal_write_keeps_cursor_for_next_run() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let table = CountingTable::new(&repo);
    let notes = RecordingNotifier::default();
    let store = seven_threads();

    let first = paused(run(&store, &table, &repo, &notes, settings(&dir, 3)).unwrap());

    table.fail_append.set(true);
    let err = run(&store, &table, &repo, &notes, settings(&dir, 3)).unwrap_err();
    assert!(matches!(
        err,
        ImportError::Fatal {
            stage: Stage::Writing,
            ..
        }
    ));
    assert_eq!(
        repo.get_property("batch_cursor_2024_02").unwrap(),
        Some("3".to_string())
    );
    assert_eq!(
        repo.get_property("count_ledger_2024_02").unwrap(),
        Some(first.rows_cumulative.to_string())
    );
    let state = progress::load(&repo).unwrap().unwrap();
    assert_eq!(state.stage, Stage::Error);
    assert!(state.complete);
    assert!(!dir.path().join("import.lock").exists());

    table.fail_append.set(false);
    let second = paused(run(&store, &table, &repo, &notes, settings(&dir, 3)).unwrap());
    assert_eq!(second.threads_done, 6);
}

#[test]
fn count_mismatch_is_reported_but_completes() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let notes = RecordingNotifier::default();
    let store = seven_threads();

    run(&store, &repo, &repo, &notes, settings(&dir, 4)).unwrap();
    // a stray row written outside the pipeline
    repo.append_rows(&[ImportRow {
        email_id: "stray".to_string(),
        from: ME.to_string(),
        to: String::new(),
        subject: String::new(),
        body_plaintext: String::new(),
        send_date_formatted: "2024-02-10 00:00:00".to_string(),
        import_label: "February 2024".to_string(),
    }])
    .unwrap();

    let outcome = run(&store, &repo, &repo, &notes, settings(&dir, 4)).unwrap();
    let (_, reconciliation) = completed(outcome);
    assert_eq!(reconciliation.expected, 10);
    assert_eq!(reconciliation.actual, 11);
    assert_eq!(reconciliation.verdict(), Verdict::Mismatch { difference: -1 });

    assert_eq!(repo.metadata_rows().unwrap().len(), 1);
    assert!(repo.get_property("count_ledger_2024_02").unwrap().is_none());
    let (title, message) = notes.seen.borrow().last().cloned().unwrap();
    assert_eq!(title, "Import complete");
    assert!(message.contains("MISMATCH"));
}

#[test]
fn held_lock_reports_busy_without_touching_state() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let notes = RecordingNotifier::default();
    let store = seven_threads();
    let s = settings(&dir, 3);

    let _held = lock::acquire(
        &s.lock_path,
        Duration::from_millis(10),
        Duration::from_secs(3600),
    )
    .unwrap();
    let err = run(&store, &repo, &repo, &notes, s).unwrap_err();

    assert!(matches!(err, ImportError::Busy));
    assert!(repo.list_keys().unwrap().is_empty());
    assert_eq!(repo.last_row().unwrap(), 1);
    assert!(store.queries.borrow().is_empty());
    assert_eq!(notes.last_title(), "Import busy");
}

#[test]
fn clear_all_removes_rows_metadata_and_resume_keys() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let store = seven_threads();
    run(&store, &repo, &repo, &RecordingNotifier::default(), settings(&dir, 3)).unwrap();
    repo.set_property("unrelated", "keep").unwrap();

    let summary = clear_all(&repo, &repo, &repo, &settings(&dir, 3)).unwrap();

    // cursor, ledger and progress
    assert_eq!(summary.properties_removed, 3);
    assert_eq!(repo.list_keys().unwrap(), vec!["unrelated"]);
    assert_eq!(repo.last_row().unwrap(), 1);
    assert!(repo.metadata_rows().unwrap().is_empty());

    // a fresh import starts from the first thread
    let notes = RecordingNotifier::default();
    let batch = paused(run(&store, &repo, &repo, &notes, settings(&dir, 3)).unwrap());
    assert_eq!(batch.threads_done, 3);
}

fn write_eml(dir: &std::path::Path, name: &str, headers: &str, body: &str) {
    let content = format!("{headers}\n\n{body}\n").replace('\n', "\r\n");
    std::fs::write(dir.join(name), content).unwrap();
}

#[test]
fn mail_arriving_between_batches_keeps_offsets_valid() {
    let mail = TempDir::new().unwrap();
    write_eml(
        mail.path(),
        "a.eml",
        "Message-ID: <a@x>\nFrom: me@work.com\nTo: bob@x.com\nSubject: A\n\
         Date: Mon, 05 Feb 2024 10:00:00 +0000",
        "first thread",
    );
    write_eml(
        mail.path(),
        "b.eml",
        "Message-ID: <b@x>\nFrom: me@work.com\nTo: bob@x.com\nSubject: B\n\
         Date: Sat, 10 Feb 2024 10:00:00 +0000",
        "second thread",
    );

    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let notes = RecordingNotifier::default();

    let store = EmlDirStore::open(mail.path(), "sent").unwrap();
    let first = paused(run(&store, &repo, &repo, &notes, settings(&dir, 1)).unwrap());
    assert_eq!(first.threads_done, 1);

    // a March follow-up lands in the first thread before the next run
    write_eml(
        mail.path(),
        "a2.eml",
        "Message-ID: <a2@x>\nIn-Reply-To: <a@x>\nReferences: <a@x>\nFrom: me@work.com\n\
         To: bob@x.com\nSubject: Re: A\nDate: Mon, 04 Mar 2024 10:00:00 +0000",
        "follow-up",
    );
    let store = EmlDirStore::open(mail.path(), "sent").unwrap();
    let (_, reconciliation) =
        completed(run(&store, &repo, &repo, &notes, settings(&dir, 1)).unwrap());

    let ids: Vec<String> = sorted_rows(&repo).into_iter().map(|r| r.email_id).collect();
    assert_eq!(ids, vec!["a@x", "b@x"]);
    assert_eq!(reconciliation.verdict(), Verdict::Pass);
}

#[test]
fn metadata_counts_threads_not_rows() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let store = FakeStore {
        threads: vec![FakeThread::new(
            "t",
            vec![
                FakeMessage::sent("one", 3, "first"),
                FakeMessage::sent("two", 4, "second"),
            ],
        )],
        ..Default::default()
    };

    let notes = RecordingNotifier::default();
    let (_, reconciliation) =
        completed(run(&store, &repo, &repo, &notes, settings(&dir, 10)).unwrap());
    assert_eq!(reconciliation.expected, 2);

    let records = repo.metadata_rows().unwrap();
    assert_eq!(records[0].email_count, 1);
    assert_eq!(records[0].notes, reconciliation.summary());
}

#[test]
fn batch_without_rows_skips_write_but_advances() {
    let dir = TempDir::new().unwrap();
    let repo = SqliteRepo::open_in_memory().unwrap();
    let table = CountingTable::new(&repo);
    let received = |id: &str| {
        FakeMessage::from_addr(
            id,
            "Bob <bob@x.com>",
            Utc.with_ymd_and_hms(2024, 2, 8, 12, 0, 0).unwrap(),
            "hello",
        )
    };
    let store = FakeStore {
        threads: vec![
            FakeThread::new("in-only", vec![received("r1")]),
            FakeThread::new("mine", vec![FakeMessage::sent("s1", 9, "reply")]),
        ],
        ..Default::default()
    };
    let notes = RecordingNotifier::default();

    let first = paused(run(&store, &table, &repo, &notes, settings(&dir, 1)).unwrap());
    assert_eq!(first.rows_written, 0);
    assert_eq!(table.appends.get(), 0);
    assert_eq!(
        repo.get_property("batch_cursor_2024_02").unwrap(),
        Some("1".to_string())
    );
    assert_eq!(
        repo.get_property("count_ledger_2024_02").unwrap(),
        Some("0".to_string())
    );

    let (batch, _) = completed(run(&store, &table, &repo, &notes, settings(&dir, 1)).unwrap());
    assert_eq!(batch.rows_cumulative, 1);
    assert_eq!(table.appends.get(), 1);
}
