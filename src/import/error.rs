use thiserror::Error;

use crate::import::progress::Stage;

/// Failures that end an import invocation. Per-message problems and count
/// mismatches are reported as values, not through this type.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("another import is already running")]
    Busy,
    #[error("search failed: {0}")]
    Search(String),
    #[error("import failed while {stage}: {message}")]
    Fatal { stage: Stage, message: String },
}

impl ImportError {
    pub fn fatal(stage: Stage) -> impl FnOnce(anyhow::Error) -> ImportError {
        move |e| ImportError::Fatal {
            stage,
            message: format!("{e:#}"),
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ImportError::Busy => "Import busy",
            ImportError::Search(_) => "Search failed",
            ImportError::Fatal { .. } => "Import failed",
        }
    }
}
