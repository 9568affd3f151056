use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

pub const REPORT_HEADER: [&str; 3] = ["name", "id", "reason"];

/// One diagnostic about a resource. The three fields are the whole message
/// shape; nothing else is ever attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub name: String,
    pub id: String,
    pub reason: String,
}

impl Message {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Ordered row accumulator for one resource type. The header row is always
/// first; messages append in emission order.
#[derive(Debug, Clone)]
pub struct Report {
    key: String,
    rows: Vec<[String; 3]>,
}

impl Report {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            rows: vec![REPORT_HEADER.map(str::to_string)],
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn push(&mut self, message: &Message) {
        self.rows.push([
            message.name.clone(),
            message.id.clone(),
            message.reason.clone(),
        ]);
    }

    pub fn rows(&self) -> &[[String; 3]] {
        &self.rows
    }

    /// Message rows only, without the header.
    pub fn message_count(&self) -> usize {
        self.rows.len() - 1
    }
}

/// Render rows as CSV. Fields containing a comma, quote, or line break are
/// quoted; embedded quotes double.
pub fn render_csv(rows: &[[String; 3]]) -> String {
    let mut output = String::new();
    for row in rows {
        let mut first = true;
        for field in row {
            if !first {
                output.push(',');
            }
            first = false;
            output.push_str(&csv_field(field));
        }
        output.push('\n');
    }
    output
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Write one resource type's report under `out_dir` and return its path.
pub fn write_report(
    report: &Report,
    out_dir: &Path,
    org_id: &str,
    stamp: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let filename = sanitize_filename(&format!(
        "org_health_check-{org_id}-{stamp}-{}.csv",
        report.key()
    ));
    let path = out_dir.join(filename);
    fs::write(&path, render_csv(report.rows()))
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

pub fn sanitize_filename(value: &str) -> String {
    let mut output = String::new();
    let mut previous_dash = false;
    for ch in value.chars() {
        if ch.is_whitespace() || matches!(ch, '<' | '>' | ':' | '"' | '|' | '?' | '*' | '/' | '\\')
        {
            if !previous_dash && !output.is_empty() {
                output.push('-');
                previous_dash = true;
            }
            continue;
        }
        output.push(ch);
        previous_dash = false;
    }
    while output.ends_with('-') {
        output.pop();
    }
    output
}

pub fn timestamp_slug() -> String {
    Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}
