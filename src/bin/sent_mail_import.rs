use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::Path;

use sent_mail_import::config::{Config, load_config, lock_path, resolve_db_path};
use sent_mail_import::domain::job::ImportJob;
use sent_mail_import::import::ledger::MetadataLedger;
use sent_mail_import::import::{ImportOutcome, Importer, clear_all, progress};
use sent_mail_import::mail::eml_store::EmlDirStore;
use sent_mail_import::notify::{ConsoleNotifier, DesktopNotifier, Notifier};
use sent_mail_import::store::repo::TableStore;
use sent_mail_import::store::sqlite::SqliteRepo;

#[derive(Parser)]
#[command(name = "sent_mail_import")]
#[command(about = "Import a month of sent mail into a table, resumably", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process the next batch of a month; run again until it completes
    Import {
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
        month: u32,

        #[arg(long)]
        year: i32,
    },

    /// List the months already imported
    Imported,

    /// Print the rows imported for a month
    Show {
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
        month: u32,

        #[arg(long)]
        year: i32,
    },

    /// Print the progress of the current or last import as JSON
    Status,

    /// Delete all imported rows, metadata and resume state
    ClearAll {
        /// Required; there is no undo
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let cfg = load_config().map_err(|e| anyhow!("Configuration error: {e}"))?;
    let repo = SqliteRepo::open(&resolve_db_path(&cfg)?)?;

    match cli.cmd {
        Command::Import { month, year } => {
            let job = ImportJob::new(month, year, cfg.work_address.clone())?;
            let messages = EmlDirStore::open(Path::new(&cfg.sent_dir), "sent")?;
            let notifier = notifier(&cfg);
            let importer = Importer::new(
                &messages,
                &repo,
                &repo,
                &repo,
                notifier.as_ref(),
                cfg.import_settings(lock_path()?),
            );

            let outcome = importer.run(&job)?;
            let skipped = match &outcome {
                ImportOutcome::BatchPaused(batch) | ImportOutcome::Completed { batch, .. } => {
                    batch.skipped.as_slice()
                }
                _ => &[],
            };
            if !skipped.is_empty() {
                eprintln!("{} messages were skipped:", skipped.len());
                for skip in skipped {
                    eprintln!(
                        "  thread {} message {}: {}",
                        skip.thread_id,
                        skip.message_id.as_deref().unwrap_or("-"),
                        skip.reason
                    );
                }
            }
            Ok(())
        }

        Command::Imported => {
            let records = MetadataLedger::new(&repo).imported_months()?;
            if records.is_empty() {
                println!("No months imported yet.");
            }
            for r in records {
                println!(
                    "{:04}-{:02}  {:>6} threads  {}  {}",
                    r.year,
                    r.month,
                    r.email_count,
                    r.import_timestamp.format("%Y-%m-%d %H:%M"),
                    r.notes
                );
            }
            Ok(())
        }

        Command::Show { month, year } => {
            let job = ImportJob::new(month, year, cfg.work_address.clone())?;
            let widths = repo.column_widths()?;
            for row in repo.rows_for_label(&job.label())? {
                let line: Vec<String> = row
                    .cells()
                    .iter()
                    .enumerate()
                    .map(|(i, cell)| fit(cell, widths.get(i).copied().unwrap_or(20)))
                    .collect();
                println!("{}", line.join(" | "));
            }
            Ok(())
        }

        Command::Status => {
            match progress::load(&repo)? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => println!("No import in progress."),
            }
            Ok(())
        }

        Command::ClearAll { yes } => {
            if !yes {
                bail!("clear-all deletes every imported row; pass --yes to confirm");
            }
            let summary = clear_all(&repo, &repo, &repo, &cfg.import_settings(lock_path()?))?;
            println!(
                "Cleared all rows, metadata and {} resume keys.",
                summary.properties_removed
            );
            Ok(())
        }
    }
}

fn notifier(cfg: &Config) -> Box<dyn Notifier> {
    if cfg.desktop_notifications {
        Box::new(DesktopNotifier::new("sent_mail_import"))
    } else {
        Box::new(ConsoleNotifier)
    }
}

/// Single-line cell padded or cut to `width` characters.
fn fit(cell: &str, width: usize) -> String {
    let flat = cell.replace('\n', " ");
    let cut: String = flat.chars().take(width).collect();
    format!("{cut:<width$}")
}
