//! Flakeguard core: test orchestration and forensic diagnostics for
//! browser-driven end-to-end suites.
//!
//! E2E browser tests are flaky across operating systems, CI providers, and
//! rendering engines. This crate makes that flakiness observable and
//! manageable instead of silently hidden or fatal:
//!
//! - [`probe`] — environment detection (CI provider, OS, system resources)
//! - [`mode`] — one immutable [`mode::TestModeConfig`] resolved per process
//! - [`tags`] — tag-based test segmentation against the active mode
//! - [`retry`] — generic exponential-backoff retry for fallible async steps
//! - [`visual`] — threshold-adaptive screenshot comparison
//! - [`classify`] — failure taxonomy over error messages and stacks
//! - [`artifact`] — forensic capture pipeline producing JSON + HTML bundles
//! - [`fsguard`] — permission-checked filesystem operations backing it all
//! - [`driver`] — the interface boundary to the browser-automation layer
//! - [`metrics`] — interval sampling and test-finish lifecycle hooks
//!
//! All environment-variable reads go through [`probe::EnvSnapshot`]; every
//! other component receives fully-resolved values. The resolver itself is a
//! pure function of the snapshot, so tests can inject arbitrary environments
//! without touching real process state.

pub mod artifact;
pub mod classify;
pub mod driver;
pub mod fsguard;
pub mod metrics;
pub mod mode;
pub mod probe;
pub mod retry;
pub mod tags;
pub mod visual;

pub use artifact::{ArtifactPipeline, FailureInfo, TestContext};
pub use classify::{FailureKind, classify};
pub use driver::{ConsoleMessage, DriverError, NetworkEntry, PageDriver, ReportSink};
pub use fsguard::{FsErrorCode, FsGuardError, PermissionReport};
pub use metrics::{FinalizerSet, MetricsSampler};
pub use mode::{BrowserEngine, TestMode, TestModeConfig};
pub use probe::{CiProvider, EnvSnapshot, EnvironmentInfo, OsFamily};
pub use retry::RetryPolicy;
pub use tags::{SkipReason, Tag};
pub use visual::{
    CompareOptions, ThresholdPreset, Viewport, VisualComparator, VisualError, VisualOutcome,
    VisualSettings,
};
