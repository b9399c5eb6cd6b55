use anyhow::{Result, anyhow};

use crate::domain::job::ImportJob;
use crate::store::repo::PropertyStore;

pub const BATCH_CURSOR_PREFIX: &str = "batch_cursor_";
pub const COUNT_LEDGER_PREFIX: &str = "count_ledger_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
    pub month: u32,
    pub year: i32,
}

impl From<&ImportJob> for Period {
    fn from(job: &ImportJob) -> Self {
        Self {
            month: job.month,
            year: job.year,
        }
    }
}

/// The only place property keys for a period are built.
pub fn period_key(prefix: &str, period: Period) -> String {
    format!("{prefix}{:04}_{:02}", period.year, period.month)
}

/// Counter scoped by [`Period`]; absent means zero.
pub struct ScopedCounter<'a> {
    props: &'a dyn PropertyStore,
    prefix: &'static str,
}

impl<'a> ScopedCounter<'a> {
    pub fn batch_cursor(props: &'a dyn PropertyStore) -> Self {
        Self {
            props,
            prefix: BATCH_CURSOR_PREFIX,
        }
    }

    pub fn count_ledger(props: &'a dyn PropertyStore) -> Self {
        Self {
            props,
            prefix: COUNT_LEDGER_PREFIX,
        }
    }

    pub fn get(&self, period: Period) -> Result<u64> {
        let key = period_key(self.prefix, period);
        match self.props.get_property(&key)? {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|e| anyhow!("property {key} holds {v:?}, not a count: {e}")),
            None => Ok(0),
        }
    }

    pub fn set(&self, period: Period, value: u64) -> Result<()> {
        self.props
            .set_property(&period_key(self.prefix, period), &value.to_string())
    }

    pub fn add(&self, period: Period, delta: u64) -> Result<u64> {
        let total = self.get(period)? + delta;
        self.set(period, total)?;
        Ok(total)
    }

    pub fn clear(&self, period: Period) -> Result<()> {
        self.props.delete_property(&period_key(self.prefix, period))
    }
}

pub fn is_counter_key(key: &str) -> bool {
    key.starts_with(BATCH_CURSOR_PREFIX) || key.starts_with(COUNT_LEDGER_PREFIX)
}
