use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Datelike, Month, NaiveDate, Utc};
use std::fmt;
use std::str::FromStr;

const QUERY_DATE_FORMAT: &str = "%Y-%m-%d";

/// One unit of work: the sent mail of `work_address` during `month`/`year`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportJob {
    pub month: u32,
    pub year: i32,
    pub work_address: String,
}

impl ImportJob {
    pub fn new(month: u32, year: i32, work_address: impl Into<String>) -> Result<Self> {
        if !(1..=12).contains(&month) {
            bail!("month must be between 1 and 12, got {month}");
        }
        let work_address = work_address.into().trim().to_string();
        if work_address.is_empty() {
            bail!("work address must not be empty");
        }
        // Reject years chrono cannot represent up front.
        first_of_month(year, month)?;
        next_month_start(year, month)?;
        Ok(Self {
            month,
            year,
            work_address,
        })
    }

    pub fn start(&self) -> NaiveDate {
        first_of_month(self.year, self.month).unwrap_or(NaiveDate::MIN)
    }

    /// First day of the *following* month, exclusive.
    pub fn end(&self) -> NaiveDate {
        next_month_start(self.year, self.month).unwrap_or(NaiveDate::MAX)
    }

    pub fn contains(&self, date: &DateTime<Utc>) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    pub fn label(&self) -> String {
        let name = u8::try_from(self.month)
            .ok()
            .and_then(|m| Month::try_from(m).ok())
            .map(|m| m.name())
            .unwrap_or("Unknown");
        format!("{} {}", name, self.year)
    }

    pub fn search_query(&self) -> SearchQuery {
        SearchQuery {
            from: self.work_address.clone(),
            mailbox: "sent".to_string(),
            after: self.start(),
            before: self.end(),
        }
    }
}

fn first_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| anyhow!("invalid date {year}-{month}"))
}

fn next_month_start(year: i32, month: u32) -> Result<NaiveDate> {
    if month == 12 {
        first_of_month(year + 1, 1)
    } else {
        first_of_month(year, month + 1)
    }
}

/// `from:<address> in:<mailbox> after:<date> before:<date>`
///
/// `after` is inclusive and `before` exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub from: String,
    pub mailbox: String,
    pub after: NaiveDate,
    pub before: NaiveDate,
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "from:{} in:{} after:{} before:{}",
            self.from,
            self.mailbox,
            self.after.format(QUERY_DATE_FORMAT),
            self.before.format(QUERY_DATE_FORMAT)
        )
    }
}

impl FromStr for SearchQuery {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut from = None;
        let mut mailbox = None;
        let mut after = None;
        let mut before = None;

        for token in s.split_whitespace() {
            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed query term {token:?}"))?;
            match key {
                "from" => from = Some(value.to_string()),
                "in" => mailbox = Some(value.to_string()),
                "after" => after = Some(parse_query_date(value)?),
                "before" => before = Some(parse_query_date(value)?),
                other => bail!("unsupported query operator {other:?}"),
            }
        }

        Ok(Self {
            from: from.ok_or_else(|| anyhow!("query is missing from:"))?,
            mailbox: mailbox.ok_or_else(|| anyhow!("query is missing in:"))?,
            after: after.ok_or_else(|| anyhow!("query is missing after:"))?,
            before: before.ok_or_else(|| anyhow!("query is missing before:"))?,
        })
    }
}

fn parse_query_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, QUERY_DATE_FORMAT)
        .map_err(|e| anyhow!("bad query date {s:?}: {e}"))
}
