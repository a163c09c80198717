//! Interface boundary to the browser-automation layer.
//!
//! The core consumes page capabilities (snapshots, screenshots, waits,
//! logs) and a report-attachment sink; it never implements them. Hosts
//! adapt their driver and runner behind [`PageDriver`] and [`ReportSink`];
//! tests use [`MockPage`] and [`RecordingSink`].

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the browser-automation driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver operation timed out: {0}")]
    Timeout(String),
    #[error("driver protocol error: {0}")]
    Protocol(String),
    #[error("screenshot capture failed: {0}")]
    Screenshot(String),
}

/// One console message captured from the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub level: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// One network request observed on the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    /// Driver-reported failure text for requests that never completed.
    pub failure: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time page performance reading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: Option<DateTime<Utc>>,
    pub js_heap_used_bytes: Option<u64>,
    pub js_heap_total_bytes: Option<u64>,
    pub dom_node_count: Option<u64>,
    pub layout_count: Option<u64>,
}

/// Capabilities the core needs from a live page.
///
/// Implementations wrap whatever automation driver the host runner uses.
/// All methods take `&self`; drivers with mutable sessions use interior
/// mutability, as [`MockPage`] does.
pub trait PageDriver {
    /// Current viewport as (width, height) in CSS pixels.
    fn viewport(&self) -> (u32, u32);

    fn set_viewport(
        &self,
        width: u32,
        height: u32,
    ) -> impl Future<Output = Result<(), DriverError>>;

    /// Textual DOM snapshot used for animation-settle detection.
    fn dom_snapshot(&self) -> impl Future<Output = Result<String, DriverError>>;

    /// Full-page screenshot as PNG bytes.
    fn screenshot_png(&self) -> impl Future<Output = Result<Vec<u8>, DriverError>>;

    /// Serialized page HTML for forensic dumps.
    fn page_html(&self) -> impl Future<Output = Result<String, DriverError>>;

    fn wait_for_load(&self, timeout: Duration) -> impl Future<Output = Result<(), DriverError>>;

    fn wait_for_network_idle(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), DriverError>>;

    /// Console messages observed so far. Best-effort; may be empty.
    fn console_log(&self) -> impl Future<Output = Vec<ConsoleMessage>>;

    /// Network entries observed so far. Best-effort; may be empty.
    fn network_log(&self) -> impl Future<Output = Vec<NetworkEntry>>;

    /// Current performance reading, when the driver exposes one.
    fn performance_snapshot(&self) -> impl Future<Output = Option<PerformanceSnapshot>>;

    fn current_url(&self) -> impl Future<Output = String>;
}

/// Attachment interface into the host test runner's report.
///
/// The only interface back into the excluded test-runner layer. Hosts that
/// expose no attachment mechanism can use a no-op sink; the forensic files
/// remain on disk either way.
pub trait ReportSink {
    fn attach(&self, name: &str, content_type: &str, path: &Path);
}

/// Sink that records attachments in memory (tests, and hosts without a
/// native attachment mechanism).
#[derive(Debug, Default)]
pub struct RecordingSink {
    attachments: Mutex<Vec<Attachment>>,
}

/// One recorded attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub path: PathBuf,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.attachments.lock().unwrap().clone()
    }
}

impl ReportSink for RecordingSink {
    fn attach(&self, name: &str, content_type: &str, path: &Path) {
        self.attachments.lock().unwrap().push(Attachment {
            name: name.to_string(),
            content_type: content_type.to_string(),
            path: path.to_path_buf(),
        });
    }
}

#[derive(Debug)]
struct MockPageState {
    viewport: (u32, u32),
    /// DOM snapshots returned in sequence; the last repeats forever.
    snapshots: Vec<String>,
    snapshot_cursor: usize,
    screenshot: Result<Vec<u8>, String>,
    html: String,
    url: String,
    console: Vec<ConsoleMessage>,
    network: Vec<NetworkEntry>,
    performance: Option<PerformanceSnapshot>,
    fail_network_idle: bool,
}

/// Scripted in-memory page for tests. No browser, no sockets.
#[derive(Debug)]
pub struct MockPage {
    state: Mutex<MockPageState>,
}

impl MockPage {
    pub fn builder() -> MockPageBuilder {
        MockPageBuilder::default()
    }
}

/// Builder for [`MockPage`].
#[derive(Debug)]
pub struct MockPageBuilder {
    viewport: (u32, u32),
    snapshots: Vec<String>,
    screenshot: Result<Vec<u8>, String>,
    html: String,
    url: String,
    console: Vec<ConsoleMessage>,
    network: Vec<NetworkEntry>,
    performance: Option<PerformanceSnapshot>,
    fail_network_idle: bool,
}

impl Default for MockPageBuilder {
    fn default() -> Self {
        Self {
            viewport: (1280, 720),
            snapshots: vec!["<body></body>".to_string()],
            screenshot: Ok(Vec::new()),
            html: "<html><body></body></html>".to_string(),
            url: "http://localhost/".to_string(),
            console: Vec::new(),
            network: Vec::new(),
            performance: None,
            fail_network_idle: false,
        }
    }
}

impl MockPageBuilder {
    /// DOM snapshots to return in sequence (last one repeats).
    pub fn snapshots(mut self, snapshots: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.snapshots = snapshots.into_iter().map(Into::into).collect();
        self
    }

    pub fn screenshot(mut self, png: Vec<u8>) -> Self {
        self.screenshot = Ok(png);
        self
    }

    pub fn failing_screenshot(mut self, reason: impl Into<String>) -> Self {
        self.screenshot = Err(reason.into());
        self
    }

    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn console(mut self, messages: Vec<ConsoleMessage>) -> Self {
        self.console = messages;
        self
    }

    pub fn network(mut self, entries: Vec<NetworkEntry>) -> Self {
        self.network = entries;
        self
    }

    pub fn performance(mut self, snapshot: PerformanceSnapshot) -> Self {
        self.performance = Some(snapshot);
        self
    }

    pub fn failing_network_idle(mut self) -> Self {
        self.fail_network_idle = true;
        self
    }

    pub fn build(self) -> MockPage {
        let mut snapshots = self.snapshots;
        if snapshots.is_empty() {
            snapshots.push(String::new());
        }
        MockPage {
            state: Mutex::new(MockPageState {
                viewport: self.viewport,
                snapshots,
                snapshot_cursor: 0,
                screenshot: self.screenshot,
                html: self.html,
                url: self.url,
                console: self.console,
                network: self.network,
                performance: self.performance,
                fail_network_idle: self.fail_network_idle,
            }),
        }
    }
}

impl PageDriver for MockPage {
    fn viewport(&self) -> (u32, u32) {
        self.state.lock().unwrap().viewport
    }

    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), DriverError> {
        self.state.lock().unwrap().viewport = (width, height);
        Ok(())
    }

    async fn dom_snapshot(&self) -> Result<String, DriverError> {
        let mut state = self.state.lock().unwrap();
        let index = state.snapshot_cursor.min(state.snapshots.len() - 1);
        if state.snapshot_cursor < state.snapshots.len() {
            state.snapshot_cursor += 1;
        }
        Ok(state.snapshots[index].clone())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, DriverError> {
        self.state
            .lock()
            .unwrap()
            .screenshot
            .clone()
            .map_err(DriverError::Screenshot)
    }

    async fn page_html(&self) -> Result<String, DriverError> {
        Ok(self.state.lock().unwrap().html.clone())
    }

    async fn wait_for_load(&self, _timeout: Duration) -> Result<(), DriverError> {
        Ok(())
    }

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), DriverError> {
        if self.state.lock().unwrap().fail_network_idle {
            Err(DriverError::Timeout(format!(
                "network did not go idle within {timeout:?}"
            )))
        } else {
            Ok(())
        }
    }

    async fn console_log(&self) -> Vec<ConsoleMessage> {
        self.state.lock().unwrap().console.clone()
    }

    async fn network_log(&self) -> Vec<NetworkEntry> {
        self.state.lock().unwrap().network.clone()
    }

    async fn performance_snapshot(&self) -> Option<PerformanceSnapshot> {
        self.state.lock().unwrap().performance.clone()
    }

    async fn current_url(&self) -> String {
        self.state.lock().unwrap().url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_page_replays_snapshots_and_repeats_last() {
        let page = MockPage::builder().snapshots(["a", "b", "c"]).build();
        assert_eq!(page.dom_snapshot().await.unwrap(), "a");
        assert_eq!(page.dom_snapshot().await.unwrap(), "b");
        assert_eq!(page.dom_snapshot().await.unwrap(), "c");
        assert_eq!(page.dom_snapshot().await.unwrap(), "c");
    }

    #[tokio::test]
    async fn mock_page_viewport_round_trips() {
        let page = MockPage::builder().build();
        page.set_viewport(375, 667).await.unwrap();
        assert_eq!(page.viewport(), (375, 667));
    }

    #[tokio::test]
    async fn failing_screenshot_surfaces_driver_error() {
        let page = MockPage::builder().failing_screenshot("target closed").build();
        let err = page.screenshot_png().await.unwrap_err();
        assert!(matches!(err, DriverError::Screenshot(_)));
    }

    #[test]
    fn recording_sink_collects_attachments() {
        let sink = RecordingSink::new();
        sink.attach("failure.json", "application/json", Path::new("/tmp/f.json"));
        sink.attach("report.html", "text/html", Path::new("/tmp/r.html"));

        let attachments = sink.attachments();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].name, "failure.json");
        assert_eq!(attachments[1].content_type, "text/html");
    }
}
