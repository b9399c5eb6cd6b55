use anyhow::Result;

use crate::domain::email::MetadataRecord;
use crate::import::cursor::Period;
use crate::store::repo::MetadataSheet;

/// Completed imports. A period with a record is never imported again; the
/// operator deletes the record to allow it.
pub struct MetadataLedger<'a> {
    sheet: &'a dyn MetadataSheet,
}

impl<'a> MetadataLedger<'a> {
    pub fn new(sheet: &'a dyn MetadataSheet) -> Self {
        Self { sheet }
    }

    pub fn is_imported(&self, period: Period) -> Result<bool> {
        Ok(self
            .sheet
            .metadata_rows()?
            .iter()
            .any(|r| r.month == period.month && r.year == period.year))
    }

    pub fn record(&self, record: &MetadataRecord) -> Result<()> {
        self.sheet.append_metadata(record)
    }

    pub fn imported_months(&self) -> Result<Vec<MetadataRecord>> {
        self.sheet.metadata_rows()
    }
}
