use chrono::{DateTime, Utc};

/// Alert operations team (critical)
///
/// Alerts go to a dedicated tracing target and carry `alert = true`, so a log
/// shipper can route them to paging without parsing messages.
pub fn alert_operations_team_critical(message: String) {
    tracing::error!(
        target: "candle_ingest::alert",
        alert = true,
        severity = "critical",
        "{}",
        message
    );
}

/// Render an optional timestamp for operator-facing output.
pub fn format_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "-".to_string(),
    }
}
