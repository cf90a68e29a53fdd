pub mod json;
pub mod table;

use anyhow::Result;
use serde::Serialize;

use crate::coverage::Span;
use crate::db::models::{CoverageInterval, Mailbox, Run};
use crate::db::DatabaseStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// Gaps of one requested window, as reported by `gaps`.
#[derive(Debug, Clone, Serialize)]
pub struct GapReport {
    pub mailbox_id: String,
    pub window: Span,
    pub gaps: Vec<Span>,
    pub fully_covered: bool,
}

pub fn format_runs(format: OutputFormat, runs: &[Run]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_runs(runs)),
        OutputFormat::Json => json::to_pretty(runs),
    }
}

pub fn format_run(format: OutputFormat, run: &Run) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_run(run)),
        OutputFormat::Json => json::to_pretty(run),
    }
}

pub fn format_coverage(format: OutputFormat, intervals: &[CoverageInterval]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_coverage(intervals)),
        OutputFormat::Json => json::to_pretty(intervals),
    }
}

pub fn format_gaps(format: OutputFormat, report: &GapReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_gaps(report)),
        OutputFormat::Json => json::to_pretty(report),
    }
}

pub fn format_mailboxes(format: OutputFormat, mailboxes: &[Mailbox]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_mailboxes(mailboxes)),
        OutputFormat::Json => json::to_pretty(mailboxes),
    }
}

pub fn format_stats(format: OutputFormat, stats: &DatabaseStats) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_stats(stats)),
        OutputFormat::Json => json::to_pretty(stats),
    }
}
