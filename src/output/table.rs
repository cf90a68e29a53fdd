use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::coverage::Span;
use crate::db::models::{CoverageInterval, Mailbox, Run, RunStatus};
use crate::db::DatabaseStats;
use crate::output::GapReport;

const RUN_ID_WIDTH: usize = 36;
const MAILBOX_WIDTH: usize = 20;
const STATUS_WIDTH: usize = 10;
const WINDOW_WIDTH: usize = 35;
const ITEMS_WIDTH: usize = 7;
const AGE_WIDTH: usize = 12;

pub fn format_runs(runs: &[Run]) -> String {
    if runs.is_empty() {
        return "No runs found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<id$}  {:<mailbox$}  {:<status$}  {:<window$}  {:>items$}  {:<age$}\n",
        "Run",
        "Mailbox",
        "Status",
        "Window",
        "Items",
        "Created",
        id = RUN_ID_WIDTH,
        mailbox = MAILBOX_WIDTH,
        status = STATUS_WIDTH,
        window = WINDOW_WIDTH,
        items = ITEMS_WIDTH,
        age = AGE_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}  {}\n",
        "-".repeat(RUN_ID_WIDTH),
        "-".repeat(MAILBOX_WIDTH),
        "-".repeat(STATUS_WIDTH),
        "-".repeat(WINDOW_WIDTH),
        "-".repeat(ITEMS_WIDTH),
        "-".repeat(AGE_WIDTH)
    ));

    for run in runs {
        let window = format!(
            "{} → {}",
            short_time(run.window_start),
            short_time(run.window_end)
        );
        out.push_str(&format!(
            "{:<id$}  {:<mailbox$}  {:<status$}  {:<window$}  {:>items$}  {:<age$}\n",
            truncate_for_width(&run.run_id, RUN_ID_WIDTH),
            truncate_for_width(&run.mailbox_id, MAILBOX_WIDTH),
            run.status.as_str(),
            truncate_for_width(&window, WINDOW_WIDTH),
            run.items_processed,
            truncate_for_width(&relative_date(&run.created_at), AGE_WIDTH),
            id = RUN_ID_WIDTH,
            mailbox = MAILBOX_WIDTH,
            status = STATUS_WIDTH,
            window = WINDOW_WIDTH,
            items = ITEMS_WIDTH,
            age = AGE_WIDTH
        ));
    }

    out
}

pub fn format_run(run: &Run) -> String {
    let mut out = String::new();
    out.push_str(&format!("Run: {}\n", run.run_id));
    out.push_str(&format!("Mailbox: {}\n", run.mailbox_id));
    out.push_str(&format!("Status: {}\n", colorize_status(run.status)));
    out.push_str(&format!(
        "Window: {} → {}\n",
        short_time(run.window_start),
        short_time(run.window_end)
    ));
    if run.force {
        out.push_str("Force reanalysis: yes\n");
    }
    out.push_str(&format!("Items processed: {}\n", run.items_processed));
    out.push_str(&format!(
        "Created: {} ({})\n",
        run.created_at,
        relative_date(&run.created_at)
    ));
    if let Some(started_at) = &run.started_at {
        out.push_str(&format!("Started: {started_at}\n"));
    }
    if let Some(completed_at) = &run.completed_at {
        out.push_str(&format!("Finished: {completed_at}\n"));
    }

    if let Some(kind) = &run.error_kind {
        out.push('\n');
        out.push_str(&format!("Error kind: {kind}\n"));
        out.push_str(&format!(
            "Error: {}\n",
            run.error_message.as_deref().unwrap_or("(none)")
        ));
    }
    out
}

pub fn format_coverage(intervals: &[CoverageInterval]) -> String {
    if intervals.is_empty() {
        return "No coverage recorded.".to_string();
    }

    let mut out = String::new();
    out.push_str("Start             End               Items  Processed\n");
    out.push_str("----------------  ----------------  -----  ------------\n");
    for interval in intervals {
        out.push_str(&format!(
            "{:<16}  {:<16}  {:>5}  {}\n",
            short_time(interval.start),
            short_time(interval.end),
            interval.item_count,
            interval
                .processed_at
                .as_deref()
                .map(relative_date)
                .unwrap_or_else(|| "-".to_string())
        ));
    }
    out
}

pub fn format_gaps(report: &GapReport) -> String {
    let header = format!(
        "Mailbox {} window {}\n",
        report.mailbox_id,
        format_span(&report.window)
    );
    if report.gaps.is_empty() {
        let verdict = if report.fully_covered {
            "Window is fully covered."
        } else {
            "No gaps longer than the minimum to fetch."
        };
        return format!("{header}{verdict}");
    }

    let mut out = header;
    for (idx, gap) in report.gaps.iter().enumerate() {
        out.push_str(&format!(
            "{:>3}. {}  ({})\n",
            idx + 1,
            format_span(gap),
            human_duration(gap)
        ));
    }
    out
}

pub fn format_mailboxes(mailboxes: &[Mailbox]) -> String {
    if mailboxes.is_empty() {
        return "No mailboxes configured.".to_string();
    }

    let mut out = String::new();
    out.push_str("Mailbox               Provider      Address                         Active\n");
    out.push_str("--------------------  ------------  ------------------------------  ------\n");
    for mailbox in mailboxes {
        let address = match &mailbox.display_name {
            Some(display_name) => format!("{display_name} <{}>", mailbox.email_address),
            None => mailbox.email_address.clone(),
        };
        out.push_str(&format!(
            "{:<20}  {:<12}  {:<30}  {}\n",
            truncate_for_width(&mailbox.mailbox_id, 20),
            mailbox.provider.to_string(),
            truncate_for_width(&address, 30),
            if mailbox.is_active { "yes" } else { "no" }
        ));
    }
    out
}

pub fn format_stats(stats: &DatabaseStats) -> String {
    let mut out = String::new();
    out.push_str("Mailmind Stats\n");
    out.push_str("==============\n");
    out.push_str(&format!("Mailboxes: {}\n", stats.total_mailboxes));
    out.push_str(&format!("Messages:  {}\n", stats.total_messages));
    out.push_str(&format!("Artifacts: {}\n", stats.total_artifacts));
    out.push_str(&format!("Coverage:  {} intervals\n", stats.total_coverage_intervals));

    if !stats.runs_by_status.is_empty() {
        out.push('\n');
        out.push_str("Runs by status\n");
        out.push_str("--------------\n");
        for row in &stats.runs_by_status {
            out.push_str(&format!("{:<12} {:>8}\n", row.status, row.count));
        }
    }

    out
}

fn colorize_status(status: RunStatus) -> String {
    let raw = status.as_str();
    match status {
        RunStatus::Failed => format!("\u{1b}[31m{raw}\u{1b}[0m"),
        RunStatus::Completed => format!("\u{1b}[32m{raw}\u{1b}[0m"),
        _ => format!("\u{1b}[33m{raw}\u{1b}[0m"),
    }
}

fn short_time(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M").to_string()
}

fn format_span(span: &Span) -> String {
    format!("{} → {}", short_time(span.start), short_time(span.end))
}

fn human_duration(span: &Span) -> String {
    let duration = span.duration();
    if duration.num_days() >= 1 {
        let hours = duration.num_hours() % 24;
        if hours == 0 {
            return format!("{}d", duration.num_days());
        }
        return format!("{}d {}h", duration.num_days(), hours);
    }
    if duration.num_hours() >= 1 {
        return format!("{}h", duration.num_hours());
    }
    format!("{}m", duration.num_minutes())
}

fn relative_date(input: &str) -> String {
    let parsed = match DateTime::parse_from_rfc3339(input) {
        Ok(value) => value.with_timezone(&Utc),
        Err(_) => return input.to_string(),
    };

    let delta = Utc::now().signed_duration_since(parsed);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    parsed.format("%Y-%m-%d").to_string()
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }
    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{format_gaps, format_run, format_runs, truncate_for_width};
    use crate::coverage::Span;
    use crate::db::models::{Run, RunStatus};
    use crate::output::GapReport;

    fn sample_run() -> Run {
        Run {
            run_id: "4a3c5f1e-0000-4000-8000-000000000001".to_string(),
            mailbox_id: "work-mailbox-with-a-rather-long-name".to_string(),
            window_start: Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).single().expect("valid"),
            window_end: Utc.with_ymd_and_hms(2024, 1, 20, 0, 0, 0).single().expect("valid"),
            force: false,
            status: RunStatus::Failed,
            items_processed: 5,
            error_kind: Some("transient_network".to_string()),
            error_message: Some("provider returned 503".to_string()),
            created_at: (Utc::now() - Duration::hours(3)).to_rfc3339(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn run_table_has_headers_and_truncates_mailbox() {
        let rendered = format_runs(&[sample_run()]);
        assert!(rendered.contains("Status"));
        assert!(rendered.contains("failed"));
        assert!(rendered.contains("3h ago"));
        assert!(rendered.contains("work-mailbox-with-a…"));
    }

    #[test]
    fn run_detail_shows_classified_error() {
        let rendered = format_run(&sample_run());
        assert!(rendered.contains("Error kind: transient_network"));
        assert!(rendered.contains("provider returned 503"));
    }

    #[test]
    fn gap_listing_reports_durations() {
        let start = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).single().expect("valid");
        let window = Span::new(start, start + Duration::days(10)).expect("span");
        let gap = Span::new(start, start + Duration::hours(36)).expect("span");
        let rendered = format_gaps(&GapReport {
            mailbox_id: "mbx".to_string(),
            window,
            gaps: vec![gap],
            fully_covered: false,
        });
        assert!(rendered.contains("1d 12h"));

        let covered = format_gaps(&GapReport {
            mailbox_id: "mbx".to_string(),
            window,
            gaps: Vec::new(),
            fully_covered: true,
        });
        assert!(covered.ends_with("Window is fully covered."));
    }

    #[test]
    fn truncation_respects_display_width() {
        assert_eq!(truncate_for_width("short", 10), "short");
        assert_eq!(truncate_for_width("日本語のテキスト", 7), "日本語…");
    }
}
