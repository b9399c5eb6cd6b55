use anyhow::Result;

use crate::domain::email::{ImportRow, MetadataRecord};

pub trait TableStore {
    /// Append all rows in a single write.
    fn append_rows(&self, rows: &[ImportRow]) -> Result<()>;

    /// Overwrite rows in place starting at sheet row `start_row` (the header
    /// is row 1). Rows past the current end are appended.
    fn set_values(&self, start_row: u64, rows: &[ImportRow]) -> Result<()>;

    /// Index of the last populated row, counting the header as row 1.
    fn last_row(&self) -> Result<u64>;

    fn row_count(&self, label: &str) -> Result<u64>;

    fn rows_for_label(&self, label: &str) -> Result<Vec<ImportRow>>;

    fn auto_resize_columns(&self) -> Result<()>;
    fn column_widths(&self) -> Result<Vec<usize>>;

    fn clear_rows(&self) -> Result<()>;
}

pub trait PropertyStore {
    fn get_property(&self, key: &str) -> Result<Option<String>>;
    fn set_property(&self, key: &str, value: &str) -> Result<()>;
    fn delete_property(&self, key: &str) -> Result<()>;
    fn list_keys(&self) -> Result<Vec<String>>;
}

pub trait MetadataSheet {
    fn metadata_rows(&self) -> Result<Vec<MetadataRecord>>;
    fn append_metadata(&self, record: &MetadataRecord) -> Result<()>;
    fn clear_metadata(&self) -> Result<()>;
}
