//! Forensic artifact capture for failed tests.
//!
//! On failure the pipeline gathers the environment, classifies the error,
//! snapshots system resources, captures page evidence (screenshot, HTML,
//! console, network, performance), and emits a structured JSON record plus
//! a self-contained HTML report under the test's artifact directory.
//!
//! Two hard rules:
//!
//! - Writes are append-only: one file per failure id, never overwritten,
//!   so repeated failures across retries keep separate evidence.
//! - The pipeline never throws for its own bookkeeping. A failed artifact
//!   write is logged and ignored; diagnostics must not cause a false test
//!   failure. The original error always reaches the runner untouched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::classify::{self, FailureKind};
use crate::driver::{PageDriver, ReportSink};
use crate::fsguard;
use crate::probe::{CiProvider, EnvironmentInfo, OsFamily, SystemResources};

/// Subdirectories under each test's artifact directory.
const SUBDIRS: &[&str] = &[
    "screenshots",
    "html-dumps",
    "network-logs",
    "console-logs",
    "failures",
    "reports",
    "diagnostics",
];

/// Identity and metadata of the failing test invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestContext {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// 0 for the first attempt, 1 for the first retry, and so on.
    pub retry_attempt: u32,
    /// Elapsed test time when the failure occurred, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TestContext {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_retry_attempt(mut self, attempt: u32) -> Self {
        self.retry_attempt = attempt;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Environment subset embedded in each failure record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSummary {
    pub is_ci: bool,
    pub ci_provider: CiProvider,
    pub os: OsFamily,
    pub run_id: String,
    pub harness_version: String,
}

impl From<&EnvironmentInfo> for EnvironmentSummary {
    fn from(info: &EnvironmentInfo) -> Self {
        Self {
            is_ci: info.is_ci,
            ci_provider: info.ci_provider,
            os: info.os,
            run_id: info.run_id.clone(),
            harness_version: info.harness_version.clone(),
        }
    }
}

/// Paths of sibling evidence captured alongside a failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureArtifacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_log: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_log: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<PathBuf>,
}

/// One failure event, immutable after creation.
///
/// Written to disk exactly once and attached to the report; never mutated
/// post-write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub test_title: String,
    pub failure_message: String,
    pub failure_stack: String,
    pub failure_kind: FailureKind,
    pub recovery_hint: String,
    pub environment: EnvironmentSummary,
    pub test_metadata: TestContext,
    pub resources: SystemResources,
    pub artifacts: FailureArtifacts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
}

/// Replace anything outside `[a-z0-9._-]` and cap the length so test
/// titles become safe, collision-free directory names.
pub fn sanitize_test_name(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_dash = false;
    for c in title.trim().chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    let capped: String = trimmed.chars().take(100).collect();
    if capped.is_empty() {
        "unnamed-test".to_string()
    } else {
        capped
    }
}

/// Failure capture pipeline rooted at one artifacts directory.
#[derive(Debug, Clone)]
pub struct ArtifactPipeline {
    root: PathBuf,
    environment: EnvironmentInfo,
}

impl ArtifactPipeline {
    pub fn new(root: impl Into<PathBuf>, environment: EnvironmentInfo) -> Self {
        Self {
            root: root.into(),
            environment,
        }
    }

    /// Artifact directory for one test, created lazily on first write.
    pub fn test_dir(&self, title: &str) -> PathBuf {
        self.root.join(sanitize_test_name(title))
    }

    /// Capture a full forensic bundle for a failure.
    ///
    /// Infallible by design: any bookkeeping error is logged and the
    /// affected artifact is simply absent from the returned record.
    pub async fn capture_failure<P: PageDriver, S: ReportSink>(
        &self,
        message: &str,
        stack: &str,
        page: Option<&P>,
        context: &TestContext,
        sink: &S,
    ) -> FailureInfo {
        let id = Uuid::new_v4();
        let test_dir = self.test_dir(&context.title);
        let failure_kind = classify::classify(message, stack);
        debug!(%id, kind = ?failure_kind, test = %context.title, "capturing failure bundle");

        let mut artifacts = FailureArtifacts::default();
        let mut page_url = None;

        if let Some(page) = page {
            page_url = Some(page.current_url().await);

            match page.screenshot_png().await {
                Ok(png) => {
                    let path = test_dir.join("screenshots").join(format!("failure-{id}.png"));
                    artifacts.screenshot = self.try_write(&path, &png);
                }
                Err(err) => warn!(error = %err, "failure screenshot capture failed"),
            }

            match page.page_html().await {
                Ok(html) => {
                    let path = test_dir.join("html-dumps").join(format!("failure-{id}.html"));
                    artifacts.html = self.try_write(&path, html.as_bytes());
                }
                Err(err) => warn!(error = %err, "failure HTML dump failed"),
            }

            let console = page.console_log().await;
            if !console.is_empty() {
                let path = test_dir.join("console-logs").join(format!("failure-{id}.jsonl"));
                artifacts.console_log = self.try_write(&path, jsonl(&console).as_bytes());
            }

            let network = page.network_log().await;
            if !network.is_empty() {
                let path = test_dir.join("network-logs").join(format!("failure-{id}.jsonl"));
                artifacts.network_log = self.try_write(&path, jsonl(&network).as_bytes());
            }

            if let Some(perf) = page.performance_snapshot().await {
                let path = test_dir.join("diagnostics").join(format!("perf-{id}.json"));
                match serde_json::to_vec_pretty(&perf) {
                    Ok(bytes) => artifacts.performance = self.try_write(&path, &bytes),
                    Err(err) => warn!(error = %err, "performance snapshot serialization failed"),
                }
            }
        }

        let info = FailureInfo {
            id,
            timestamp: Utc::now(),
            test_title: context.title.clone(),
            failure_message: message.to_string(),
            failure_stack: stack.to_string(),
            failure_kind,
            recovery_hint: failure_kind.recovery_hint().to_string(),
            environment: EnvironmentSummary::from(&self.environment),
            test_metadata: context.clone(),
            resources: SystemResources::sample(),
            artifacts,
            page_url,
        };

        let json_path = test_dir.join("failures").join(format!("failure-{id}.json"));
        let json_written = match serde_json::to_vec_pretty(&info) {
            Ok(bytes) => self.try_write(&json_path, &bytes),
            Err(err) => {
                warn!(error = %err, "failure record serialization failed");
                None
            }
        };

        let html_path = test_dir.join("reports").join(format!("failure-{id}.html"));
        let html_written = self.try_write(&html_path, render_html_report(&info).as_bytes());

        if let Some(path) = &json_written {
            sink.attach("failure.json", "application/json", path);
        }
        if let Some(path) = &html_written {
            sink.attach("failure-report.html", "text/html", path);
        }
        if let Some(path) = &info.artifacts.screenshot {
            sink.attach("failure-screenshot.png", "image/png", path);
        }

        info
    }

    fn try_write(&self, path: &Path, data: &[u8]) -> Option<PathBuf> {
        match fsguard::write_file(path, data) {
            Ok(written) => Some(written),
            Err(err) => {
                warn!(error = %err, "artifact write failed, continuing without it");
                None
            }
        }
    }

    /// Pre-create the full subdirectory layout for a test. Optional —
    /// writes create directories on demand — but useful for hosts that
    /// want the layout visible up front.
    pub fn prepare_layout(&self, title: &str) -> PathBuf {
        let test_dir = self.test_dir(title);
        for subdir in SUBDIRS {
            if let Err(err) = fsguard::ensure_directory(&test_dir.join(subdir)) {
                warn!(error = %err, "artifact layout preparation failed");
            }
        }
        test_dir
    }
}

fn jsonl<T: Serialize>(entries: &[T]) -> String {
    let mut out = String::new();
    for entry in entries {
        match serde_json::to_string(entry) {
            Ok(line) => {
                out.push_str(&line);
                out.push('\n');
            }
            Err(err) => warn!(error = %err, "skipping unserializable log entry"),
        }
    }
    out
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render the self-contained HTML report for one failure.
fn render_html_report(info: &FailureInfo) -> String {
    let mut artifact_rows = String::new();
    let mut artifact_row = |label: &str, path: &Option<PathBuf>| {
        if let Some(path) = path {
            let display = escape_html(&path.display().to_string());
            artifact_rows.push_str(&format!(
                "<tr><td>{label}</td><td><a href=\"{display}\">{display}</a></td></tr>\n"
            ));
        }
    };
    artifact_row("Screenshot", &info.artifacts.screenshot);
    artifact_row("HTML dump", &info.artifacts.html);
    artifact_row("Console log", &info.artifacts.console_log);
    artifact_row("Network log", &info.artifacts.network_log);
    artifact_row("Performance", &info.artifacts.performance);
    artifact_row("Video", &info.artifacts.video);
    artifact_row("Trace", &info.artifacts.trace);

    let resources = &info.resources;
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Failure report: {title}</title>
<style>
body {{ font-family: -apple-system, system-ui, sans-serif; margin: 2rem; color: #1a1a2e; }}
h1 {{ font-size: 1.3rem; }}
.kind {{ display: inline-block; padding: 2px 10px; border-radius: 10px; background: #c0392b; color: #fff; }}
pre {{ background: #f4f4f8; padding: 1rem; overflow-x: auto; border-radius: 6px; }}
table {{ border-collapse: collapse; margin: 1rem 0; }}
td, th {{ border: 1px solid #ddd; padding: 6px 12px; text-align: left; }}
.hint {{ background: #fdf6e3; padding: 0.8rem 1rem; border-left: 4px solid #b58900; }}
</style>
</head>
<body>
<h1>{title}</h1>
<p><span class="kind">{kind}</span> &middot; failure <code>{id}</code> &middot; {timestamp} &middot; attempt {attempt}</p>
<div class="hint">{hint}</div>
<h2>Error</h2>
<pre>{message}</pre>
<h2>Stack</h2>
<pre>{stack}</pre>
<h2>Environment</h2>
<table>
<tr><td>CI</td><td>{is_ci} ({provider:?})</td></tr>
<tr><td>OS</td><td>{os:?}</td></tr>
<tr><td>Run id</td><td>{run_id}</td></tr>
<tr><td>Harness</td><td>{version}</td></tr>
<tr><td>CPU cores</td><td>{cores:?}</td></tr>
<tr><td>Free memory</td><td>{free:?}</td></tr>
<tr><td>Load average</td><td>{load:?}</td></tr>
<tr><td>Page URL</td><td>{url}</td></tr>
</table>
<h2>Artifacts</h2>
<table>
{artifact_rows}</table>
</body>
</html>
"#,
        title = escape_html(&info.test_title),
        kind = info.failure_kind.label(),
        id = info.id,
        timestamp = info.timestamp.to_rfc3339(),
        attempt = info.test_metadata.retry_attempt,
        hint = escape_html(&info.recovery_hint),
        message = escape_html(&info.failure_message),
        stack = escape_html(&info.failure_stack),
        is_ci = info.environment.is_ci,
        provider = info.environment.ci_provider,
        os = info.environment.os,
        run_id = info.environment.run_id,
        version = info.environment.harness_version,
        cores = resources.cpu_cores,
        free = resources.free_memory_bytes,
        load = resources.load_average,
        url = info
            .page_url
            .as_deref()
            .map(escape_html)
            .unwrap_or_else(|| "-".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockPage, RecordingSink};
    use crate::probe::EnvSnapshot;
    use tempfile::TempDir;

    fn environment() -> EnvironmentInfo {
        EnvironmentInfo::detect(&EnvSnapshot::default())
    }

    #[test]
    fn sanitizes_test_titles() {
        assert_eq!(
            sanitize_test_name("Button / renders @visual (dark)"),
            "button-renders-visual-dark"
        );
        assert_eq!(sanitize_test_name("  "), "unnamed-test");
        assert_eq!(sanitize_test_name("v1.2_rollout"), "v1.2_rollout");
        let long = "x".repeat(400);
        assert_eq!(sanitize_test_name(&long).len(), 100);
    }

    #[tokio::test]
    async fn captures_full_bundle_with_page() {
        let tmp = TempDir::new().unwrap();
        let pipeline = ArtifactPipeline::new(tmp.path(), environment());
        let sink = RecordingSink::new();
        let page = MockPage::builder()
            .screenshot(vec![1, 2, 3])
            .html("<html>broken</html>")
            .url("http://localhost:6006/story/button")
            .console(vec![crate::driver::ConsoleMessage {
                level: "error".to_string(),
                text: "hydration mismatch".to_string(),
                timestamp: Utc::now(),
            }])
            .build();

        let context = TestContext::new("button submits @critical").with_retry_attempt(1);
        let info = pipeline
            .capture_failure(
                "locator.click: timed out after 30000ms",
                "    at click (button.spec:12)",
                Some(&page),
                &context,
                &sink,
            )
            .await;

        assert_eq!(info.failure_kind, FailureKind::Timeout);
        assert_eq!(info.test_metadata.retry_attempt, 1);
        assert_eq!(info.page_url.as_deref(), Some("http://localhost:6006/story/button"));
        assert!(info.artifacts.screenshot.as_ref().unwrap().is_file());
        assert!(info.artifacts.html.as_ref().unwrap().is_file());
        assert!(info.artifacts.console_log.as_ref().unwrap().is_file());
        // No network entries were scripted, so no network log artifact.
        assert!(info.artifacts.network_log.is_none());

        // JSON + HTML + screenshot attached to the report sink.
        let names: Vec<_> = sink.attachments().iter().map(|a| a.name.clone()).collect();
        assert!(names.contains(&"failure.json".to_string()));
        assert!(names.contains(&"failure-report.html".to_string()));
        assert!(names.contains(&"failure-screenshot.png".to_string()));

        // The JSON on disk round-trips into the same record.
        let json_path = pipeline
            .test_dir(&context.title)
            .join("failures")
            .join(format!("failure-{}.json", info.id));
        let parsed: FailureInfo =
            serde_json::from_slice(&std::fs::read(json_path).unwrap()).unwrap();
        assert_eq!(parsed.id, info.id);
        assert_eq!(parsed.failure_kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn repeated_failures_never_clobber_each_other() {
        let tmp = TempDir::new().unwrap();
        let pipeline = ArtifactPipeline::new(tmp.path(), environment());
        let sink = RecordingSink::new();
        let context = TestContext::new("flaky checkout");

        let first = pipeline
            .capture_failure("timed out", "", None::<&MockPage>, &context, &sink)
            .await;
        let second = pipeline
            .capture_failure("timed out again", "", None::<&MockPage>, &context, &sink)
            .await;

        assert_ne!(first.id, second.id);
        let failures_dir = pipeline.test_dir("flaky checkout").join("failures");
        let files: Vec<_> = std::fs::read_dir(failures_dir).unwrap().collect();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn capture_survives_driver_failures() {
        let tmp = TempDir::new().unwrap();
        let pipeline = ArtifactPipeline::new(tmp.path(), environment());
        let sink = RecordingSink::new();
        let page = MockPage::builder()
            .failing_screenshot("target closed")
            .build();

        let info = pipeline
            .capture_failure(
                "expect(received).toBe(expected)",
                "",
                Some(&page),
                &TestContext::new("broken page"),
                &sink,
            )
            .await;

        // Screenshot capture failed; the record still exists and the JSON
        // is still written and attached.
        assert!(info.artifacts.screenshot.is_none());
        assert_eq!(info.failure_kind, FailureKind::Assertion);
        assert!(
            sink.attachments()
                .iter()
                .any(|a| a.name == "failure.json")
        );
    }

    #[tokio::test]
    async fn capture_never_panics_on_unwritable_root() {
        // A root under a file cannot be created; every write fails but the
        // pipeline still returns a complete record.
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();

        let pipeline = ArtifactPipeline::new(blocker.join("artifacts"), environment());
        let sink = RecordingSink::new();
        let info = pipeline
            .capture_failure("boom", "", None::<&MockPage>, &TestContext::new("t"), &sink)
            .await;

        assert_eq!(info.failure_kind, FailureKind::Unknown);
        assert!(sink.attachments().is_empty());
    }

    #[test]
    fn prepare_layout_creates_all_subdirs() {
        let tmp = TempDir::new().unwrap();
        let pipeline = ArtifactPipeline::new(tmp.path(), environment());
        let dir = pipeline.prepare_layout("Grid layout @visual");

        for subdir in SUBDIRS {
            assert!(dir.join(subdir).is_dir(), "missing {subdir}");
        }
    }

    #[test]
    fn html_report_escapes_untrusted_text() {
        let info = FailureInfo {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            test_title: "<script>alert(1)</script>".to_string(),
            failure_message: "a < b && c > d".to_string(),
            failure_stack: String::new(),
            failure_kind: FailureKind::Assertion,
            recovery_hint: FailureKind::Assertion.recovery_hint().to_string(),
            environment: EnvironmentSummary::from(&environment()),
            test_metadata: TestContext::new("t"),
            resources: SystemResources::default(),
            artifacts: FailureArtifacts::default(),
            page_url: None,
        };

        let html = render_html_report(&info);
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("a &lt; b &amp;&amp; c &gt; d"));
    }
}
