//! Report definitions + row formatting.
//!
//! Every report type is a configuration of the same pipeline: a query, a
//! display schema, a row mapper, and a summary-line renderer. The registry at
//! the bottom resolves a definition by kind.

use chrono::{FixedOffset, NaiveDateTime, TimeZone, Utc};
use drr_core::{row_fingerprint, NormalizedRow, ReportRow};
use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlRow;
use sqlx::Row;
use thiserror::Error;

pub const CRATE_NAME: &str = "drr-reports";

pub const DEFAULT_SUMMARY_CAP: usize = 50;
pub const EMPTY_SUMMARY: &str = "No new records";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    NewUsers,
    Subscriptions,
}

impl ReportKind {
    pub const ALL: [ReportKind; 2] = [ReportKind::NewUsers, ReportKind::Subscriptions];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::NewUsers => "new-users",
            ReportKind::Subscriptions => "subscriptions",
        }
    }
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown report kind: {0}")]
pub struct UnknownReportKind(String);

impl std::str::FromStr for ReportKind {
    type Err = UnknownReportKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new-users" => Ok(ReportKind::NewUsers),
            "subscriptions" => Ok(ReportKind::Subscriptions),
            other => Err(UnknownReportKind(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("row decode failed: {0}")]
    Decode(#[from] sqlx::Error),
    #[error("timestamp out of range for the report timezone")]
    InvalidTimestamp,
}

/// One report type: what to query, how a row looks in the sheet, and how a
/// row reads in the notification body.
pub trait ReportDefinition: Send + Sync {
    fn kind(&self) -> ReportKind;

    /// Human-facing name used in notification subjects ("New Users").
    fn display_name(&self) -> &'static str;

    /// Display columns in sheet order. The sink adds the fingerprint column.
    fn display_columns(&self) -> &'static [&'static str];

    /// Parameterized query with exactly two positional parameters: the
    /// inclusive window start and the exclusive window end.
    fn query(&self) -> &'static str;

    /// Map one database row into a [`ReportRow`]. Stored timestamps are
    /// wall-clock values in the report timezone.
    fn row_from(&self, row: &MySqlRow, timezone: FixedOffset) -> Result<ReportRow, ReportError>;

    /// One bullet line for the notification body.
    fn summary_line(&self, row: &ReportRow) -> String;
}

fn wall_clock_to_utc(
    naive: NaiveDateTime,
    timezone: FixedOffset,
) -> Result<chrono::DateTime<Utc>, ReportError> {
    timezone
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or(ReportError::InvalidTimestamp)
}

struct NewUsersReport;

impl ReportDefinition for NewUsersReport {
    fn kind(&self) -> ReportKind {
        ReportKind::NewUsers
    }

    fn display_name(&self) -> &'static str {
        "New Users"
    }

    fn display_columns(&self) -> &'static [&'static str] {
        &["Date", "Username"]
    }

    fn query(&self) -> &'static str {
        "SELECT user_id, username, creation_date \
           FROM engine4_users \
          WHERE creation_date >= ? AND creation_date < ? \
          ORDER BY creation_date ASC, user_id ASC"
    }

    fn row_from(&self, row: &MySqlRow, timezone: FixedOffset) -> Result<ReportRow, ReportError> {
        let user_id: i64 = row.try_get("user_id")?;
        let username: String = row.try_get("username")?;
        let creation_date: NaiveDateTime = row.try_get("creation_date")?;
        Ok(ReportRow {
            source_id: user_id.to_string(),
            created_at: wall_clock_to_utc(creation_date, timezone)?,
            values: vec![username],
        })
    }

    fn summary_line(&self, row: &ReportRow) -> String {
        let username = row.values.first().map(String::as_str).unwrap_or("?");
        format!("• {username}")
    }
}

struct SubscriptionsReport;

impl ReportDefinition for SubscriptionsReport {
    fn kind(&self) -> ReportKind {
        ReportKind::Subscriptions
    }

    fn display_name(&self) -> &'static str {
        "Subscriptions"
    }

    fn display_columns(&self) -> &'static [&'static str] {
        &["Date", "Username", "Subscription Type"]
    }

    fn query(&self) -> &'static str {
        "SELECT s.subscription_id, u.username, s.subscription_type, s.created_at \
           FROM subscriptions s \
           JOIN engine4_users u ON s.user_id = u.user_id \
          WHERE s.created_at >= ? AND s.created_at < ? \
          ORDER BY s.created_at ASC, s.subscription_id ASC"
    }

    fn row_from(&self, row: &MySqlRow, timezone: FixedOffset) -> Result<ReportRow, ReportError> {
        let subscription_id: i64 = row.try_get("subscription_id")?;
        let username: String = row.try_get("username")?;
        let subscription_type: String = row.try_get("subscription_type")?;
        let created_at: NaiveDateTime = row.try_get("created_at")?;
        Ok(ReportRow {
            source_id: subscription_id.to_string(),
            created_at: wall_clock_to_utc(created_at, timezone)?,
            values: vec![username, subscription_type],
        })
    }

    fn summary_line(&self, row: &ReportRow) -> String {
        let username = row.values.first().map(String::as_str).unwrap_or("?");
        let subscription_type = row.values.get(1).map(String::as_str).unwrap_or("?");
        format!("• {username} - {subscription_type}")
    }
}

static NEW_USERS: NewUsersReport = NewUsersReport;
static SUBSCRIPTIONS: SubscriptionsReport = SubscriptionsReport;

pub fn definition_for(kind: ReportKind) -> &'static dyn ReportDefinition {
    match kind {
        ReportKind::NewUsers => &NEW_USERS,
        ReportKind::Subscriptions => &SUBSCRIPTIONS,
    }
}

/// Deterministic conversion of fetched rows into sink-ready rows and into the
/// notification summary. Same input rows, same output, byte for byte.
#[derive(Debug, Clone, Copy)]
pub struct ReportFormatter {
    pub timezone: FixedOffset,
    pub summary_cap: usize,
}

impl ReportFormatter {
    pub fn new(timezone: FixedOffset, summary_cap: usize) -> Self {
        Self {
            timezone,
            summary_cap: summary_cap.max(1),
        }
    }

    /// Prefix each row with its calendar date in the report timezone and
    /// fingerprint the displayed values.
    pub fn format(&self, rows: &[ReportRow]) -> Vec<NormalizedRow> {
        rows.iter()
            .map(|row| {
                let date = row
                    .created_at
                    .with_timezone(&self.timezone)
                    .format("%Y-%m-%d")
                    .to_string();
                let mut values = Vec::with_capacity(row.values.len() + 1);
                values.push(date);
                values.extend(row.values.iter().cloned());
                let fingerprint = row_fingerprint(&row.source_id, row.created_at, &values);
                NormalizedRow {
                    values,
                    fingerprint,
                }
            })
            .collect()
    }

    /// Line-delimited listing capped at `summary_cap`, or [`EMPTY_SUMMARY`].
    pub fn summary_text(&self, definition: &dyn ReportDefinition, rows: &[ReportRow]) -> String {
        if rows.is_empty() {
            return EMPTY_SUMMARY.to_string();
        }
        let mut lines: Vec<String> = rows
            .iter()
            .take(self.summary_cap)
            .map(|row| definition.summary_line(row))
            .collect();
        if rows.len() > self.summary_cap {
            lines.push(format!("+{} more", rows.len() - self.summary_cap));
        }
        lines.join("\n")
    }
}
