pub mod build;
pub mod builds;
pub mod cancel;
pub mod completions;
pub mod lint;
pub mod man_pages;
pub mod merge;
pub mod module;
pub mod project;
pub mod result;
pub mod status;

use clap::Args;
use ferry_core::{BuildRequest, FerryConfig};
use ferry_schema::VarMap;
use ferry_store::Store;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub struct Context {
    pub store: Store,
    pub config: FerryConfig,
    pub json: bool,
}

/// What to compose: a stored project or a single manifest file.
#[derive(Debug, Clone, Args)]
pub struct SourceArgs {
    /// Project to compose.
    #[arg(required_unless_present = "manifest")]
    pub project: Option<String>,
    /// Compose a single manifest file instead of a project.
    #[arg(long, conflicts_with = "project")]
    pub manifest: Option<PathBuf>,
    /// Name recorded on the build.
    #[arg(long)]
    pub name: Option<String>,
    /// Variable applied on top of every module (KEY=VALUE).
    #[arg(long = "set")]
    pub set: Vec<String>,
}

impl SourceArgs {
    pub fn request(&self) -> Result<BuildRequest, String> {
        let mut request = match (&self.project, &self.manifest) {
            (Some(project), _) => BuildRequest::project(project.as_str()),
            (None, Some(path)) => {
                let manifest = std::fs::read_to_string(path)
                    .map_err(|e| format!("failed to read manifest {}: {e}", path.display()))?;
                let name = self
                    .name
                    .clone()
                    .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
                    .unwrap_or_else(|| "adhoc".to_owned());
                BuildRequest::adhoc(name, manifest)
            }
            (None, None) => return Err("either a project or --manifest is required".to_owned()),
        };
        request.variables = parse_assignments(&self.set)?;
        request.name.clone_from(&self.name);
        Ok(request)
    }
}

/// `KEY=VALUE`. Values that parse as JSON keep their type; anything else
/// is a string.
pub fn parse_assignment(input: &str) -> Result<(String, Value), String> {
    let (key, raw) = input
        .split_once('=')
        .ok_or_else(|| format!("invalid variables: expected KEY=VALUE, got '{input}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid variables: empty key in '{input}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()));
    Ok((key.to_owned(), value))
}

pub fn parse_assignments(inputs: &[String]) -> Result<VarMap, String> {
    inputs.iter().map(|s| parse_assignment(s)).collect()
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "completed" => Style::new().green().apply_to(status).to_string(),
        "building" => Style::new().cyan().bold().apply_to(status).to_string(),
        "queued" => Style::new().yellow().apply_to(status).to_string(),
        "failed" => Style::new().red().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

pub fn colorize_severity(severity: &str) -> String {
    use console::Style;
    match severity {
        "ERROR" => Style::new().red().bold().apply_to(severity).to_string(),
        "WARNING" => Style::new().yellow().apply_to(severity).to_string(),
        other => other.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_keeps_json_types() {
        assert_eq!(
            parse_assignment("PORT=8080").unwrap(),
            ("PORT".to_owned(), serde_json::json!(8080))
        );
        assert_eq!(
            parse_assignment("TAG=1.25-alpine").unwrap().1,
            Value::String("1.25-alpine".to_owned())
        );
        assert_eq!(parse_assignment("DEBUG=true").unwrap().1, Value::Bool(true));
        assert_eq!(parse_assignment("EMPTY=").unwrap().1, Value::String(String::new()));
    }

    #[test]
    fn assignment_splits_on_first_equals() {
        let (key, value) = parse_assignment("URL=a=b").unwrap();
        assert_eq!(key, "URL");
        assert_eq!(value, Value::String("a=b".to_owned()));
    }

    #[test]
    fn malformed_assignment_is_rejected() {
        assert!(parse_assignment("NOVALUE").unwrap_err().starts_with("invalid variables"));
        assert!(parse_assignment("=x").is_err());
    }

    #[test]
    fn request_from_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.yml");
        std::fs::write(&path, "services: {}\n").unwrap();
        let args = SourceArgs {
            project: None,
            manifest: Some(path),
            name: None,
            set: vec!["A=1".to_owned()],
        };
        let request = args.request().unwrap();
        assert!(request.project_id().is_none());
        assert_eq!(request.variables["A"], serde_json::json!(1));
        match request.source {
            ferry_core::BuildSource::AdHoc { name, .. } => assert_eq!(name, "stack"),
            ferry_core::BuildSource::Project(_) => panic!("expected ad-hoc source"),
        }
    }

    #[test]
    fn colorize_keeps_text() {
        for status in ["completed", "building", "queued", "failed"] {
            assert!(colorize_status(status).contains(status));
        }
        assert_eq!(colorize_status("other"), "other");
        assert!(colorize_severity("ERROR").contains("ERROR"));
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_MANIFEST_ERROR);
        assert_ne!(EXIT_MANIFEST_ERROR, EXIT_STORE_ERROR);
    }
}
