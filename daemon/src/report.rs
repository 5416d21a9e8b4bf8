//! HTML alert report

use crate::detector::AlertBatch;

pub const ALERT_SUBJECT: &str = "High CPU Usage Alert";

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html>
	<head>
		<style>
		table, th, td {
			border: 1px solid black;
			border-collapse: collapse;
		}
		</style>
	</head>
	<body>
		<h1>High CPU Usage Alert</h1>
		<p>Our monitoring system has detected a high CPU usage.</p>
		<table>
			<thead>
				<tr>
					<th>PID</th>
					<th>Name</th>
					<th>CPU</th>
					<th>Mem</th>
				</tr>
			</thead>
			<tbody>
"#;

const PAGE_TAIL: &str = r#"			</tbody>
		</table>
	</body>
</html>
"#;

/// Renders the batch as a standalone HTML page with one table row per process.
pub fn render_html(batch: &AlertBatch) -> String {
    debug_assert!(!batch.is_empty(), "rendering an empty alert batch");

    let mut html = String::from(PAGE_HEAD);
    for p in batch.samples() {
        html.push_str(&format!(
            "\t\t\t<tr><td>{}</td><td>{}</td><td>{:.2}%</td><td>{:.2}%</td></tr>\n",
            p.pid,
            escape(&p.name),
            p.cpu_percent,
            p.memory_percent,
        ));
    }
    html.push_str(PAGE_TAIL);
    html
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
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
