use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params, params_from_iter};
use std::path::Path;

use crate::domain::email::{ImportRow, MetadataRecord};
use crate::store::repo::{MetadataSheet, PropertyStore, TableStore};

/// Widest a column is ever sized to; bodies would otherwise dominate.
pub const MAX_COLUMN_WIDTH: usize = 80;

const ROW_COLUMNS: [&str; 7] = [
    "email_id",
    "from_addr",
    "to_addr",
    "subject",
    "body",
    "send_date",
    "import_label",
];

const INSERT_ROW: &str = r#"
    INSERT INTO import_rows
      (email_id, from_addr, to_addr, subject, body, send_date, import_label)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#;

pub struct SqliteRepo {
    conn: Connection,
}

impl SqliteRepo {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let repo = Self { conn };
        repo.migrate()?;
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self> {
        let repo = Self {
            conn: Connection::open_in_memory()?,
        };
        repo.migrate()?;
        Ok(repo)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS import_rows (
                row_id        INTEGER PRIMARY KEY AUTOINCREMENT,
                email_id      TEXT NOT NULL,
                from_addr     TEXT NOT NULL,
                to_addr       TEXT NOT NULL,
                subject       TEXT NOT NULL,
                body          TEXT NOT NULL,
                send_date     TEXT NOT NULL,
                import_label  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS import_rows_label ON import_rows(import_label);

            CREATE TABLE IF NOT EXISTS import_metadata (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                month             INTEGER NOT NULL,
                year              INTEGER NOT NULL,
                email_count       INTEGER NOT NULL,
                import_timestamp  TEXT NOT NULL,
                notes             TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS properties (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS column_widths (
                col   INTEGER PRIMARY KEY,
                width INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl TableStore for SqliteRepo {
    fn append_rows(&self, rows: &[ImportRow]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_ROW)?;
            for r in rows {
                stmt.execute(params_from_iter(r.cells()))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn set_values(&self, start_row: u64, rows: &[ImportRow]) -> Result<()> {
        let last = self.last_row()?;
        if start_row < 2 || start_row > last + 1 {
            bail!("cannot write at row {start_row}; data rows are 2..={}", last + 1);
        }

        let tx = self.conn.unchecked_transaction()?;
        {
            let existing: Vec<i64> = tx
                .prepare("SELECT row_id FROM import_rows ORDER BY row_id LIMIT ?1 OFFSET ?2")?
                .query_map(params![rows.len() as i64, (start_row - 2) as i64], |r| {
                    r.get(0)
                })?
                .collect::<rusqlite::Result<_>>()?;

            let mut update = tx.prepare(
                r#"
                UPDATE import_rows
                SET email_id=?1, from_addr=?2, to_addr=?3, subject=?4, body=?5,
                    send_date=?6, import_label=?7
                WHERE row_id=?8
                "#,
            )?;
            let mut insert = tx.prepare(INSERT_ROW)?;
            for (i, r) in rows.iter().enumerate() {
                match existing.get(i) {
                    Some(row_id) => {
                        let [a, b, c, d, e, f, g] = r.cells();
                        update.execute(params![a, b, c, d, e, f, g, row_id])?
                    }
                    None => insert.execute(params_from_iter(r.cells()))?,
                };
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn last_row(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM import_rows", [], |r| r.get(0))?;
        Ok(n as u64 + 1)
    }

    fn row_count(&self, label: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM import_rows WHERE import_label=?1",
            params![label],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    fn rows_for_label(&self, label: &str) -> Result<Vec<ImportRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT email_id, from_addr, to_addr, subject, body, send_date, import_label
            FROM import_rows
            WHERE import_label=?1
            ORDER BY row_id
            "#,
        )?;

        let mut rows = stmt.query(params![label])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(ImportRow {
                email_id: r.get(0)?,
                from: r.get(1)?,
                to: r.get(2)?,
                subject: r.get(3)?,
                body_plaintext: r.get(4)?,
                send_date_formatted: r.get(5)?,
                import_label: r.get(6)?,
            });
        }
        Ok(out)
    }

    fn auto_resize_columns(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (idx, (col, header)) in ROW_COLUMNS.iter().zip(ImportRow::COLUMNS).enumerate() {
            let longest: Option<i64> = tx.query_row(
                &format!("SELECT MAX(LENGTH({col})) FROM import_rows"),
                [],
                |r| r.get(0),
            )?;
            let width = (longest.unwrap_or(0) as usize)
                .max(header.chars().count())
                .min(MAX_COLUMN_WIDTH);
            tx.execute(
                r#"
                INSERT INTO column_widths (col, width) VALUES (?1, ?2)
                ON CONFLICT(col) DO UPDATE SET width=excluded.width
                "#,
                params![idx as i64, width as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn column_widths(&self) -> Result<Vec<usize>> {
        let mut stmt = self
            .conn
            .prepare("SELECT width FROM column_widths ORDER BY col")?;
        let widths = stmt
            .query_map([], |r| r.get::<_, i64>(0))?
            .map(|w| w.map(|w| w as usize))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(widths)
    }

    fn clear_rows(&self) -> Result<()> {
        self.conn
            .execute_batch("DELETE FROM import_rows; DELETE FROM column_widths;")?;
        Ok(())
    }
}

impl PropertyStore for SqliteRepo {
    fn get_property(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare(r#"SELECT value FROM properties WHERE key=?1"#)?;
        let mut rows = stmt.query(params![key])?;
        if let Some(r) = rows.next()? {
            Ok(Some(r.get(0)?))
        } else {
            Ok(None)
        }
    }

    fn set_property(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO properties (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_property(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM properties WHERE key=?1", params![key])?;
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT key FROM properties ORDER BY key")?;
        let keys = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }
}

impl MetadataSheet for SqliteRepo {
    fn metadata_rows(&self) -> Result<Vec<MetadataRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT month, year, email_count, import_timestamp, notes
            FROM import_metadata
            ORDER BY id
            "#,
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let ts: String = r.get(3)?;
            let import_timestamp = DateTime::parse_from_rfc3339(&ts)
                .map_err(|e| anyhow!("bad import timestamp {ts:?}: {e}"))?
                .with_timezone(&Utc);
            out.push(MetadataRecord {
                month: r.get(0)?,
                year: r.get(1)?,
                email_count: r.get::<_, i64>(2)? as u64,
                import_timestamp,
                notes: r.get(4)?,
            });
        }
        Ok(out)
    }

    fn append_metadata(&self, record: &MetadataRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO import_metadata (month, year, email_count, import_timestamp, notes)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.month,
                record.year,
                record.email_count as i64,
                record.import_timestamp.to_rfc3339(),
                record.notes
            ],
        )?;
        Ok(())
    }

    fn clear_metadata(&self) -> Result<()> {
        self.conn.execute("DELETE FROM import_metadata", [])?;
        Ok(())
    }
}
