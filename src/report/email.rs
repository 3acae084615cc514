//! Email dispatch of reports.

use async_trait::async_trait;
use thiserror::Error;

use crate::db::Report;

pub const REPORT_SUBJECT: &str = "Network Status Report";
pub const ERROR_SUBJECT: &str = "Ping Report - Error";

/// Email error types.
#[derive(Error, Debug)]
pub enum MailError {
    #[error("email transport is not configured")]
    NotConfigured,
    #[error("email transport failed: {0}")]
    Transport(String),
}

/// Sends rendered reports. Delivery is all-or-nothing per call.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, recipients: &[String], subject: &str, html: &str) -> Result<(), MailError>;
}

const REPORT_TEMPLATE: &str = r#"<html>
<body style="font-family: sans-serif">
<h2>{{title}}</h2>
<p>{{range_start}} to {{range_end}} (UTC)</p>
{{notice}}{{message}}<table border="1" cellpadding="4" cellspacing="0">
<tr><th>Connection</th><th>Tests</th><th>Success rate</th><th>Avg latency</th><th>Min latency</th><th>Max latency</th><th>Avg jitter</th><th>Avg loss</th></tr>
{{rows}}</table>
</body>
</html>
"#;

/// Subject line for a report's email.
pub fn report_subject(report: &Report) -> &'static str {
    if report.all_unreachable() {
        ERROR_SUBJECT
    } else {
        REPORT_SUBJECT
    }
}

/// Render a report as a standalone HTML document.
pub fn render_report_html(report: &Report) -> String {
    let rows: String = report
        .statistics_by_connection
        .iter()
        .map(|(connection, s)| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{:.2}%</td><td>{:.2} ms</td><td>{:.2} ms</td><td>{:.2} ms</td><td>{:.2} ms</td><td>{:.2}%</td></tr>\n",
                html_escape(connection),
                s.total_tests,
                s.success_rate_pct,
                s.avg_latency_ms,
                s.min_latency_ms,
                s.max_latency_ms,
                s.avg_jitter_ms,
                s.avg_packet_loss_pct,
            )
        })
        .collect();

    let notice = if report.all_unreachable() {
        "<p><strong>All addresses are unreachable or there is no internet access.</strong></p>\n"
    } else {
        ""
    };
    let message = report
        .message
        .as_deref()
        .map(|m| format!("<p>{}</p>\n", html_escape(m)))
        .unwrap_or_default();

    REPORT_TEMPLATE
        .replace("{{title}}", &html_escape(&report.title))
        .replace("{{range_start}}", &report.time_range_start.format("%Y-%m-%d %H:%M").to_string())
        .replace("{{range_end}}", &report.time_range_end.format("%Y-%m-%d %H:%M").to_string())
        .replace("{{notice}}", notice)
        .replace("{{message}}", &message)
        .replace("{{rows}}", &rows)
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MAIN_CONNECTION;
    use crate::report::AggregateStats;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn report(successful_tests: u64) -> Report {
        let mut stats = BTreeMap::new();
        stats.insert(
            MAIN_CONNECTION.to_string(),
            AggregateStats {
                total_tests: 4,
                successful_tests,
                success_rate_pct: successful_tests as f64 * 25.0,
                avg_latency_ms: 18.57,
                ..Default::default()
            },
        );
        stats.insert("fiber <primary>".to_string(), AggregateStats::default());
        Report {
            id: 1,
            router_id: 1,
            title: "Weekly & daily".to_string(),
            message: Some("Maintenance on <Tuesday>".to_string()),
            time_range_start: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            time_range_end: Utc.with_ymd_and_hms(2024, 6, 8, 0, 0, 0).unwrap(),
            created_at: Utc.with_ymd_and_hms(2024, 6, 8, 0, 0, 0).unwrap(),
            statistics_by_connection: stats,
            email_sent: false,
            recipients: Vec::new(),
        }
    }

    #[test]
    fn test_render_escapes_and_lists_connections() {
        let html = render_report_html(&report(3));
        assert!(html.contains("<h2>Weekly &amp; daily</h2>"));
        assert!(html.contains("<p>Maintenance on &lt;Tuesday&gt;</p>"));
        assert!(html.contains("<td>fiber &lt;primary&gt;</td>"));
        assert!(html.contains("<td>main</td><td>4</td><td>75.00%</td><td>18.57 ms</td>"));
        assert!(html.contains("2024-06-01 00:00 to 2024-06-08 00:00"));
        assert!(!html.contains("{{"));
        assert!(!html.contains("unreachable"));
    }

    #[test]
    fn test_subject_for_all_unreachable() {
        assert_eq!(report_subject(&report(3)), REPORT_SUBJECT);

        let down = report(0);
        assert_eq!(report_subject(&down), ERROR_SUBJECT);
        assert!(render_report_html(&down).contains("unreachable"));
    }
}
