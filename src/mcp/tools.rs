use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};

use crate::coverage::CoverageTracker;
use crate::db::models::format_timestamp;
use crate::db::Database;

pub fn tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "name": "mailmind_get_run",
            "description": "Return one analysis run with its status, progress and error",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "run_id": {"type": "string"}
                },
                "required": ["run_id"]
            }
        }),
        json!({
            "name": "mailmind_list_runs",
            "description": "List analysis runs, newest first",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "mailbox": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1}
                }
            }
        }),
        json!({
            "name": "mailmind_cancel_run",
            "description": "Request cancellation of a pending or processing run",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "run_id": {"type": "string"}
                },
                "required": ["run_id"]
            }
        }),
        json!({
            "name": "mailmind_coverage",
            "description": "List the processed intervals of a mailbox",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "mailbox": {"type": "string"}
                },
                "required": ["mailbox"]
            }
        }),
        json!({
            "name": "mailmind_gaps",
            "description": "Compute the unprocessed gaps of a mailbox inside [since, until)",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "mailbox": {"type": "string"},
                    "since": {"type": "string"},
                    "until": {"type": "string"}
                },
                "required": ["mailbox", "since", "until"]
            }
        }),
        json!({
            "name": "mailmind_stats",
            "description": "Return database totals and run counts by status",
            "inputSchema": {
                "type": "object",
                "properties": {}
            }
        }),
    ]
}

pub fn call_tool(db: &Database, name: &str, arguments: Value) -> Result<Value> {
    match name {
        "mailmind_get_run" => get_run(db, &arguments),
        "mailmind_list_runs" => list_runs(db, &arguments),
        "mailmind_cancel_run" => cancel_run(db, &arguments),
        "mailmind_coverage" => coverage(db, &arguments),
        "mailmind_gaps" => gaps(db, &arguments),
        "mailmind_stats" => Ok(serde_json::to_value(db.get_stats()?)?),
        other => Err(anyhow!("unknown tool: {other}")),
    }
}

fn get_run(db: &Database, arguments: &Value) -> Result<Value> {
    let run_id = required_string(arguments, "run_id")?;
    let run = db
        .get_run(&run_id)?
        .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
    Ok(serde_json::to_value(run)?)
}

fn list_runs(db: &Database, arguments: &Value) -> Result<Value> {
    let mailbox = optional_string(arguments, "mailbox");
    let limit = optional_usize(arguments, "limit")?.unwrap_or(50);
    let runs = db.list_runs(mailbox.as_deref(), limit)?;
    Ok(serde_json::to_value(runs)?)
}

fn cancel_run(db: &Database, arguments: &Value) -> Result<Value> {
    let run_id = required_string(arguments, "run_id")?;
    let run = db.request_cancel(&run_id)?;
    Ok(serde_json::to_value(run)?)
}

fn coverage(db: &Database, arguments: &Value) -> Result<Value> {
    let mailbox = required_string(arguments, "mailbox")?;
    let intervals = CoverageTracker::new(db, mailbox).intervals()?;
    Ok(serde_json::to_value(intervals)?)
}

fn gaps(db: &Database, arguments: &Value) -> Result<Value> {
    let mailbox = required_string(arguments, "mailbox")?;
    let since = required_bound(arguments, "since")?;
    let until = required_bound(arguments, "until")?;
    if since >= until {
        return Err(anyhow!("'since' must be before 'until'"));
    }

    let tracker = CoverageTracker::new(db, mailbox.clone());
    let gaps = tracker.gaps(since, until)?;
    Ok(json!({
        "mailbox": mailbox,
        "since": format_timestamp(since),
        "until": format_timestamp(until),
        "fully_covered": tracker.is_fully_covered(since, until)?,
        "gaps": gaps,
    }))
}

fn required_string(arguments: &Value, key: &str) -> Result<String> {
    optional_string(arguments, key).ok_or_else(|| anyhow!("missing required param '{key}'"))
}

fn optional_string(arguments: &Value, key: &str) -> Option<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn optional_usize(arguments: &Value, key: &str) -> Result<Option<usize>> {
    let Some(raw) = arguments.get(key) else {
        return Ok(None);
    };

    let value = raw
        .as_u64()
        .ok_or_else(|| anyhow!("param '{key}' must be a positive integer"))?;
    if value == 0 {
        return Err(anyhow!("param '{key}' must be greater than zero"));
    }
    Ok(Some(value as usize))
}

/// `YYYY-MM-DD` (UTC midnight) or a full RFC 3339 timestamp.
fn required_bound(arguments: &Value, key: &str) -> Result<DateTime<Utc>> {
    let raw = required_string(arguments, key)?;
    if let Ok(value) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(value.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .with_context(|| format!("param '{key}' must be YYYY-MM-DD or RFC 3339"))?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use super::call_tool;
    use crate::coverage::CoverageTracker;
    use crate::db::models::{Mailbox, Provider};
    use crate::db::Database;

    fn temp_db() -> (Database, PathBuf) {
        let path = std::env::temp_dir().join(format!("mailmind-mcp-tools-{}.db", Uuid::new_v4()));
        let db = Database::open(&path).expect("open db");
        db.insert_mailbox(&Mailbox {
            mailbox_id: "mbx".to_string(),
            provider: Provider::JsonArchive,
            email_address: "owner@example.com".to_string(),
            display_name: None,
            is_active: true,
            created_at: None,
            config: None,
        })
        .expect("insert mailbox");
        (db, path)
    }

    #[test]
    fn gaps_tool_reports_uncovered_days() {
        let (db, path) = temp_db();
        let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).single().expect("valid");
        CoverageTracker::new(&db, "mbx")
            .mark_processed(day(1), day(10), 4)
            .expect("mark");

        let result = call_tool(
            &db,
            "mailmind_gaps",
            json!({"mailbox": "mbx", "since": "2024-01-05", "until": "2024-01-20"}),
        )
        .expect("gaps");
        assert_eq!(result["fully_covered"], false);
        assert_eq!(result["gaps"].as_array().map(Vec::len), Some(1));
        assert_eq!(result["gaps"][0]["start"], "2024-01-10T00:00:00Z");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn cancel_tool_rejects_terminal_runs() {
        let (db, path) = temp_db();
        let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).single().expect("valid");
        let run = db.create_run("mbx", day(1), day(2), false).expect("run");

        let cancelled = call_tool(&db, "mailmind_cancel_run", json!({"run_id": run.run_id}))
            .expect("cancel");
        assert_eq!(cancelled["status"], "cancelled");

        let error = call_tool(&db, "mailmind_cancel_run", json!({"run_id": run.run_id}))
            .expect_err("second cancel rejected");
        assert!(error.to_string().contains("cancelled"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_required_params_are_reported() {
        let (db, path) = temp_db();
        let error = call_tool(&db, "mailmind_get_run", json!({})).expect_err("missing run_id");
        assert!(error.to_string().contains("run_id"));
        let _ = std::fs::remove_file(path);
    }
}
