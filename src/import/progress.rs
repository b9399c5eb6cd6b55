use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::job::ImportJob;
use crate::store::repo::PropertyStore;

pub const PROGRESS_KEY: &str = "import_progress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    Checking,
    Searching,
    Processing,
    Writing,
    Paused,
    Finalizing,
    Complete,
    Error,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Starting => "starting",
            Stage::Checking => "checking",
            Stage::Searching => "searching",
            Stage::Processing => "processing",
            Stage::Writing => "writing",
            Stage::Paused => "paused",
            Stage::Finalizing => "finalizing",
            Stage::Complete => "complete",
            Stage::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub month: u32,
    pub year: i32,
    pub start_time: DateTime<Utc>,
    pub stage: Stage,
    pub threads_found: u64,
    pub threads_processed: u64,
    pub emails_collected: u64,
    pub emails_written: u64,
    pub status: String,
    pub complete: bool,
    pub error: Option<String>,
}

impl ProgressState {
    pub fn new(job: &ImportJob) -> Self {
        Self {
            month: job.month,
            year: job.year,
            start_time: Utc::now(),
            stage: Stage::Starting,
            threads_found: 0,
            threads_processed: 0,
            emails_collected: 0,
            emails_written: 0,
            status: String::new(),
            complete: false,
            error: None,
        }
    }
}

/// Partial update of a [`ProgressState`]. Unknown fields are rejected when
/// a patch arrives as JSON.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProgressPatch {
    pub stage: Option<Stage>,
    pub threads_found: Option<u64>,
    pub threads_processed: Option<u64>,
    pub emails_collected: Option<u64>,
    pub emails_written: Option<u64>,
    pub status: Option<String>,
    pub complete: Option<bool>,
    pub error: Option<String>,
}

impl ProgressPatch {
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn apply(self, state: &mut ProgressState) {
        if let Some(v) = self.stage {
            state.stage = v;
        }
        if let Some(v) = self.threads_found {
            state.threads_found = v;
        }
        if let Some(v) = self.threads_processed {
            state.threads_processed = v;
        }
        if let Some(v) = self.emails_collected {
            state.emails_collected = v;
        }
        if let Some(v) = self.emails_written {
            state.emails_written = v;
        }
        if let Some(v) = self.status {
            state.status = v;
        }
        if let Some(v) = self.complete {
            state.complete = v;
        }
        if let Some(v) = self.error {
            state.error = Some(v);
        }
    }
}

/// Single writer of the progress record for one invocation. Nothing is
/// persisted until the first update.
pub struct ProgressTracker<'a> {
    props: &'a dyn PropertyStore,
    state: ProgressState,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(props: &'a dyn PropertyStore, job: &ImportJob) -> Self {
        Self {
            props,
            state: ProgressState::new(job),
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn update(&mut self, patch: ProgressPatch) -> Result<()> {
        patch.apply(&mut self.state);
        self.save()
    }

    pub fn fail(&mut self, message: &str) -> Result<()> {
        self.update(ProgressPatch {
            stage: Some(Stage::Error),
            status: Some("Import failed".to_string()),
            complete: Some(true),
            error: Some(message.to_string()),
            ..Default::default()
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.props.delete_property(PROGRESS_KEY)
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string(&self.state)?;
        self.props.set_property(PROGRESS_KEY, &json)
    }
}

pub fn load(props: &dyn PropertyStore) -> Result<Option<ProgressState>> {
    match props.get_property(PROGRESS_KEY)? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}
