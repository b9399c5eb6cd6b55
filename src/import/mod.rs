pub mod cursor;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod progress;

use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::email::{ImportRow, MessagePacket, MetadataRecord};
use crate::domain::job::ImportJob;
use crate::mail::normalize::{DEFAULT_BODY_CHAR_LIMIT, TextNormalizer};
use crate::mail::sender::is_sent_by;
use crate::mail::store::{MailMessage, MailThread, MessageStore};
use crate::notify::Notifier;
use crate::store::repo::{MetadataSheet, PropertyStore, TableStore};

use cursor::{Period, ScopedCounter, is_counter_key};
use error::ImportError;
use ledger::MetadataLedger;
use progress::{PROGRESS_KEY, ProgressPatch, ProgressTracker, Stage};

pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub batch_size: usize,
    pub body_char_limit: usize,
    pub lock_path: PathBuf,
    pub lock_timeout: Duration,
    pub lock_stale_after: Duration,
}

impl ImportSettings {
    pub fn new(lock_path: PathBuf) -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            body_char_limit: DEFAULT_BODY_CHAR_LIMIT,
            lock_path,
            lock_timeout: Duration::from_secs(1),
            lock_stale_after: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSkip {
    pub thread_id: String,
    pub message_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// `difference` is expected minus actual.
    Mismatch { difference: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub expected: u64,
    pub actual: u64,
}

impl Reconciliation {
    pub fn verdict(&self) -> Verdict {
        if self.expected == self.actual {
            Verdict::Pass
        } else {
            Verdict::Mismatch {
                difference: self.expected as i64 - self.actual as i64,
            }
        }
    }

    pub fn summary(&self) -> String {
        match self.verdict() {
            Verdict::Pass => format!(
                "PASS: expected {} rows, found {}",
                self.expected, self.actual
            ),
            Verdict::Mismatch { difference } => format!(
                "MISMATCH: expected {} rows, found {} (difference {difference})",
                self.expected, self.actual
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub threads_total: usize,
    /// Threads handled by all invocations so far, this one included.
    pub threads_done: usize,
    pub rows_written: u64,
    pub rows_cumulative: u64,
    pub skipped: Vec<UnitSkip>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    AlreadyImported,
    NoResults,
    BatchPaused(BatchReport),
    Completed {
        batch: BatchReport,
        reconciliation: Reconciliation,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClearSummary {
    pub properties_removed: usize,
}

pub struct Importer<'a> {
    messages: &'a dyn MessageStore,
    table: &'a dyn TableStore,
    props: &'a dyn PropertyStore,
    sheet: &'a dyn MetadataSheet,
    notifier: &'a dyn Notifier,
    settings: ImportSettings,
}

impl<'a> Importer<'a> {
    pub fn new(
        messages: &'a dyn MessageStore,
        table: &'a dyn TableStore,
        props: &'a dyn PropertyStore,
        sheet: &'a dyn MetadataSheet,
        notifier: &'a dyn Notifier,
        settings: ImportSettings,
    ) -> Self {
        Self {
            messages,
            table,
            props,
            sheet,
            notifier,
            settings,
        }
    }

    /// Run one invocation for `job`: at most one batch of threads.
    pub fn run(&self, job: &ImportJob) -> Result<ImportOutcome, ImportError> {
        // Held until this function returns, whichever way it returns.
        let _lock = match acquire_run_lock(&self.settings) {
            Ok(guard) => guard,
            Err(e) => {
                self.notifier.notify(e.title(), &e.to_string());
                return Err(e);
            }
        };

        let mut progress = ProgressTracker::new(self.props, job);
        let result = self.run_locked(job, &mut progress);

        if let Err(e) = &result {
            error!("import of {} failed: {e}", job.label());
            if let Err(pe) = progress.fail(&e.to_string()) {
                warn!("could not record failure in progress state: {pe:#}");
            }
            self.notifier.notify(e.title(), &e.to_string());
        }
        result
    }

    fn run_locked(
        &self,
        job: &ImportJob,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<ImportOutcome, ImportError> {
        let period = Period::from(job);
        let label = job.label();
        let cursor = ScopedCounter::batch_cursor(self.props);
        let counts = ScopedCounter::count_ledger(self.props);
        let ledger = MetadataLedger::new(self.sheet);

        if ledger
            .is_imported(period)
            .map_err(ImportError::fatal(Stage::Checking))?
        {
            info!("{label} already imported");
            self.notifier.notify(
                "Already imported",
                &format!(
                    "{label} was already imported. Delete its metadata row to import it again."
                ),
            );
            return Ok(ImportOutcome::AlreadyImported);
        }

        progress
            .update(ProgressPatch {
                stage: Some(Stage::Searching),
                status: Some(format!("Searching sent mail for {label}")),
                ..Default::default()
            })
            .map_err(ImportError::fatal(Stage::Searching))?;

        let query = job.search_query().to_string();
        info!("searching: {query}");
        let threads = match self.messages.search(&query) {
            Ok(threads) => threads,
            Err(e) => {
                // A retry must start over, not resume against a stale offset.
                for counter in [&cursor, &counts] {
                    if let Err(ce) = counter.clear(period) {
                        warn!("could not clear counter after failed search: {ce:#}");
                    }
                }
                return Err(ImportError::Search(format!("{e:#}")));
            }
        };
        let total = threads.len();

        if total == 0 {
            info!("no sent mail found for {label}");
            progress
                .update(ProgressPatch {
                    stage: Some(Stage::Complete),
                    status: Some("No emails found".to_string()),
                    complete: Some(true),
                    ..Default::default()
                })
                .map_err(ImportError::fatal(Stage::Searching))?;
            self.notifier.notify(
                "No emails found",
                &format!("No sent mail from {} in {label}.", job.work_address),
            );
            return Ok(ImportOutcome::NoResults);
        }

        let offset = (cursor
            .get(period)
            .map_err(ImportError::fatal(Stage::Processing))? as usize)
            .min(total);
        let batch_end = (offset + self.settings.batch_size.max(1)).min(total);
        info!("{label}: {total} threads, processing [{offset}, {batch_end})");

        progress
            .update(ProgressPatch {
                stage: Some(Stage::Processing),
                threads_found: Some(total as u64),
                threads_processed: Some(offset as u64),
                status: Some(format!(
                    "Processing threads {}-{batch_end} of {total}",
                    offset + 1
                )),
                ..Default::default()
            })
            .map_err(ImportError::fatal(Stage::Processing))?;

        let normalizer = TextNormalizer::new(self.settings.body_char_limit);
        let mut rows = Vec::new();
        let mut skipped = Vec::new();
        for (i, thread) in threads[offset..batch_end].iter().enumerate() {
            self.collect_thread(
                job,
                &label,
                &normalizer,
                thread.as_ref(),
                &mut rows,
                &mut skipped,
            );
            progress
                .update(ProgressPatch {
                    threads_processed: Some((offset + i + 1) as u64),
                    emails_collected: Some(rows.len() as u64),
                    ..Default::default()
                })
                .map_err(ImportError::fatal(Stage::Processing))?;
        }

        progress
            .update(ProgressPatch::stage(Stage::Writing))
            .map_err(ImportError::fatal(Stage::Writing))?;
        if !rows.is_empty() {
            self.table
                .append_rows(&rows)
                .map_err(ImportError::fatal(Stage::Writing))?;
        }
        let rows_written = rows.len() as u64;
        let rows_cumulative = counts
            .add(period, rows_written)
            .map_err(ImportError::fatal(Stage::Writing))?;

        let batch = BatchReport {
            threads_total: total,
            threads_done: batch_end,
            rows_written,
            rows_cumulative,
            skipped,
        };

        if batch_end < total {
            cursor
                .set(period, batch_end as u64)
                .map_err(ImportError::fatal(Stage::Writing))?;
            let status = format!(
                "Processed {batch_end} of {total} threads, {rows_cumulative} emails so far. Run the import again to continue."
            );
            progress
                .update(ProgressPatch {
                    stage: Some(Stage::Paused),
                    emails_written: Some(rows_cumulative),
                    status: Some(status.clone()),
                    ..Default::default()
                })
                .map_err(ImportError::fatal(Stage::Paused))?;
            info!("{label}: batch paused at {batch_end}/{total}");
            self.notifier.notify("Batch complete", &status);
            return Ok(ImportOutcome::BatchPaused(batch));
        }

        self.finalize(job, &label, progress, batch)
    }

    fn finalize(
        &self,
        job: &ImportJob,
        label: &str,
        progress: &mut ProgressTracker<'_>,
        batch: BatchReport,
    ) -> Result<ImportOutcome, ImportError> {
        let period = Period::from(job);
        let fatal = || ImportError::fatal(Stage::Finalizing);

        progress
            .update(ProgressPatch {
                stage: Some(Stage::Finalizing),
                emails_written: Some(batch.rows_cumulative),
                ..Default::default()
            })
            .map_err(fatal())?;

        ScopedCounter::batch_cursor(self.props)
            .clear(period)
            .map_err(fatal())?;
        self.table.auto_resize_columns().map_err(fatal())?;

        let reconciliation = Reconciliation {
            expected: batch.rows_cumulative,
            actual: self.table.row_count(label).map_err(fatal())?,
        };
        let summary = reconciliation.summary();
        match reconciliation.verdict() {
            Verdict::Pass => info!("{label}: {summary}"),
            Verdict::Mismatch { .. } => warn!("{label}: {summary}"),
        }

        MetadataLedger::new(self.sheet)
            .record(&MetadataRecord {
                month: job.month,
                year: job.year,
                email_count: batch.threads_total as u64,
                import_timestamp: Utc::now(),
                notes: summary.clone(),
            })
            .map_err(fatal())?;

        ScopedCounter::count_ledger(self.props)
            .clear(period)
            .map_err(fatal())?;
        progress.clear().map_err(fatal())?;

        let mut message = format!(
            "Imported {} emails from {} threads for {label}. {summary}",
            reconciliation.actual, batch.threads_total
        );
        if !batch.skipped.is_empty() {
            message.push_str(&format!(
                " {} messages could not be read (see log).",
                batch.skipped.len()
            ));
        }
        self.notifier.notify("Import complete", &message);

        Ok(ImportOutcome::Completed {
            batch,
            reconciliation,
        })
    }

    fn collect_thread(
        &self,
        job: &ImportJob,
        label: &str,
        normalizer: &TextNormalizer,
        thread: &dyn MailThread,
        rows: &mut Vec<ImportRow>,
        skipped: &mut Vec<UnitSkip>,
    ) {
        let messages = match thread.messages() {
            Ok(m) => m,
            Err(e) => {
                warn!("skipping thread {}: {e:#}", thread.id());
                skipped.push(UnitSkip {
                    thread_id: thread.id().to_string(),
                    message_id: None,
                    reason: format!("{e:#}"),
                });
                return;
            }
        };

        for msg in &messages {
            match verified_packet(job, msg.as_ref()) {
                Ok(Some(packet)) => {
                    let body = normalizer.normalize(&packet.raw_body);
                    rows.push(ImportRow::from_packet(packet, body, label));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "skipping message {} in thread {}: {e:#}",
                        msg.id(),
                        thread.id()
                    );
                    skipped.push(UnitSkip {
                        thread_id: thread.id().to_string(),
                        message_id: Some(msg.id().to_string()),
                        reason: format!("{e:#}"),
                    });
                }
            }
        }
    }
}

/// Remove every imported row, every metadata record, all cursors and
/// ledgers, and the progress record. Takes the run-lock like an import.
pub fn clear_all(
    table: &dyn TableStore,
    sheet: &dyn MetadataSheet,
    props: &dyn PropertyStore,
    settings: &ImportSettings,
) -> Result<ClearSummary, ImportError> {
    let _lock = acquire_run_lock(settings)?;
    let fatal = || ImportError::fatal(Stage::Starting);

    table.clear_rows().map_err(fatal())?;
    sheet.clear_metadata().map_err(fatal())?;

    let mut summary = ClearSummary::default();
    for key in props.list_keys().map_err(fatal())? {
        if is_counter_key(&key) || key == PROGRESS_KEY {
            props.delete_property(&key).map_err(fatal())?;
            summary.properties_removed += 1;
        }
    }

    info!(
        "cleared all import data ({} properties)",
        summary.properties_removed
    );
    Ok(summary)
}

fn acquire_run_lock(settings: &ImportSettings) -> Result<lock::RunLockGuard, ImportError> {
    lock::acquire(
        &settings.lock_path,
        settings.lock_timeout,
        settings.lock_stale_after,
    )
    .map_err(|e| match e {
        lock::LockError::Busy(path) => {
            info!("run lock {} is held", path.display());
            ImportError::Busy
        }
        lock::LockError::Io(e) => ImportError::Fatal {
            stage: Stage::Starting,
            message: format!("cannot take run lock: {e}"),
        },
    })
}

fn verified_packet(job: &ImportJob, msg: &dyn MailMessage) -> Result<Option<MessagePacket>> {
    if !is_sent_by(msg, &job.work_address) {
        debug!("message {} not sent by {}", msg.id(), job.work_address);
        return Ok(None);
    }
    let date = msg.date()?;
    if !job.contains(&date) {
        debug!("message {} dated {date} is outside {}", msg.id(), job.label());
        return Ok(None);
    }
    Ok(Some(MessagePacket {
        message_id: msg.id().to_string(),
        from: msg.from().to_string(),
        to: msg.to().to_string(),
        subject: msg.subject().to_string(),
        date,
        raw_body: msg.body()?,
    }))
}
