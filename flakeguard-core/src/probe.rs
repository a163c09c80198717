//! Environment detection: CI provider, OS, and system resources.
//!
//! All environment-variable reads in the crate go through [`EnvSnapshot`]
//! so detection is a pure function of an injectable map. Components never
//! touch `std::env::var` directly; tests hand the probe (and the mode
//! resolver built on it) arbitrary environments without mutating process
//! state.
//!
//! Resource reads (`/proc/meminfo`, `/proc/loadavg`) are best-effort local
//! reads: they never block, never retry, and degrade to `None` fields
//! rather than errors.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Immutable snapshot of the process environment.
///
/// The sole seam through which flakeguard reads environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the real process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build a snapshot from explicit pairs (for tests and tooling).
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Raw value of a variable, if set.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Whether a variable is set at all (any value, including empty).
    pub fn is_set(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Whether a variable holds a truthy value.
    ///
    /// Accepts: 1, true, yes, on (case-insensitive).
    pub fn is_truthy(&self, name: &str) -> bool {
        matches!(
            self.get(name).map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("1" | "true" | "yes" | "on")
        )
    }
}

/// Known CI providers, in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiProvider {
    GitHubActions,
    GitLabCi,
    CircleCi,
    TravisCi,
    Jenkins,
    Buildkite,
    AzurePipelines,
    Drone,
    /// A generic `CI` marker with no recognized provider marker.
    Unknown,
    /// Not running under CI at all.
    Local,
}

impl CiProvider {
    /// Provider-specific markers, checked in this fixed order.
    ///
    /// Checks fail closed: no marker means `Unknown` (if `CI` is set) or
    /// `Local`, never an error.
    const MARKERS: &'static [(&'static str, CiProvider)] = &[
        ("GITHUB_ACTIONS", CiProvider::GitHubActions),
        ("GITLAB_CI", CiProvider::GitLabCi),
        ("CIRCLECI", CiProvider::CircleCi),
        ("TRAVIS", CiProvider::TravisCi),
        ("JENKINS_URL", CiProvider::Jenkins),
        ("BUILDKITE", CiProvider::Buildkite),
        ("TF_BUILD", CiProvider::AzurePipelines),
        ("DRONE", CiProvider::Drone),
    ];

    /// Detect the provider from an environment snapshot.
    pub fn detect(env: &EnvSnapshot) -> Self {
        for (marker, provider) in Self::MARKERS {
            if env.is_set(marker) {
                return *provider;
            }
        }
        if env.is_truthy("CI") {
            CiProvider::Unknown
        } else {
            CiProvider::Local
        }
    }
}

/// True iff a known CI environment marker is present.
pub fn is_ci(env: &EnvSnapshot) -> bool {
    CiProvider::detect(env) != CiProvider::Local
}

/// Host operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl OsFamily {
    /// The family the crate was compiled for.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => OsFamily::Linux,
            "macos" => OsFamily::MacOs,
            "windows" => OsFamily::Windows,
            _ => OsFamily::Other,
        }
    }

    /// Short platform slug used in baseline screenshot names.
    pub fn slug(self) -> &'static str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::MacOs => "darwin",
            OsFamily::Windows => "win32",
            OsFamily::Other => "other",
        }
    }
}

/// Best-effort system resource readings.
///
/// All fields are optional: a failed read degrades to `None`, never to an
/// error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemResources {
    /// Logical CPU count.
    pub cpu_cores: Option<usize>,
    /// Total usable RAM in bytes.
    pub total_memory_bytes: Option<u64>,
    /// Available memory for new allocations in bytes.
    pub free_memory_bytes: Option<u64>,
    /// 1/5/15 minute load averages.
    pub load_average: Option<[f64; 3]>,
}

impl SystemResources {
    /// Sample current resources. Never blocks, never errors.
    pub fn sample() -> Self {
        let cpu_cores = std::thread::available_parallelism().ok().map(|n| n.get());
        let (total_memory_bytes, free_memory_bytes) = read_meminfo();
        let load_average = read_loadavg();
        Self {
            cpu_cores,
            total_memory_bytes,
            free_memory_bytes,
            load_average,
        }
    }
}

/// Parse MemTotal/MemAvailable out of /proc/meminfo content.
///
/// Values in the file are kilobytes; returned values are bytes.
fn parse_meminfo(content: &str) -> (Option<u64>, Option<u64>) {
    let mut total = None;
    let mut available = None;
    let mut free = None;
    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let kb = value.trim().trim_end_matches(" kB").trim().parse::<u64>();
            match (key, kb) {
                ("MemTotal", Ok(kb)) => total = Some(kb * 1024),
                ("MemAvailable", Ok(kb)) => available = Some(kb * 1024),
                ("MemFree", Ok(kb)) => free = Some(kb * 1024),
                _ => {}
            }
        }
    }
    // MemAvailable is missing on very old kernels; fall back to MemFree.
    (total, available.or(free))
}

#[cfg(target_os = "linux")]
fn read_meminfo() -> (Option<u64>, Option<u64>) {
    match std::fs::read_to_string("/proc/meminfo") {
        Ok(content) => parse_meminfo(&content),
        Err(err) => {
            debug!(error = %err, "failed to read /proc/meminfo");
            (None, None)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn read_meminfo() -> (Option<u64>, Option<u64>) {
    (None, None)
}

#[cfg(target_os = "linux")]
fn read_loadavg() -> Option<[f64; 3]> {
    let content = std::fs::read_to_string("/proc/loadavg").ok()?;
    let mut parts = content.split_whitespace();
    let one = parts.next()?.parse().ok()?;
    let five = parts.next()?.parse().ok()?;
    let fifteen = parts.next()?.parse().ok()?;
    Some([one, five, fifteen])
}

#[cfg(not(target_os = "linux"))]
fn read_loadavg() -> Option<[f64; 3]> {
    None
}

/// Unique id for this process, stable across calls.
pub fn run_id() -> &'static str {
    static RUN_ID: OnceLock<String> = OnceLock::new();
    RUN_ID.get_or_init(|| Uuid::new_v4().simple().to_string())
}

/// Immutable snapshot of the detected environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub is_ci: bool,
    pub ci_provider: CiProvider,
    pub os: OsFamily,
    #[serde(flatten)]
    pub resources: SystemResources,
    /// Harness crate version, standing in for a runtime version string.
    pub harness_version: String,
    /// Unique per process; reset only across process restarts.
    pub run_id: String,
    pub detected_at: DateTime<Utc>,
    /// Browser engine under test, when the host runner reports one.
    pub browser: Option<String>,
    pub browser_version: Option<String>,
}

impl EnvironmentInfo {
    /// Detect from an explicit snapshot. Pure given the snapshot, apart
    /// from best-effort resource reads.
    pub fn detect(env: &EnvSnapshot) -> Self {
        let ci_provider = CiProvider::detect(env);
        Self {
            is_ci: ci_provider != CiProvider::Local,
            ci_provider,
            os: OsFamily::current(),
            resources: SystemResources::sample(),
            harness_version: env!("CARGO_PKG_VERSION").to_string(),
            run_id: run_id().to_string(),
            detected_at: Utc::now(),
            browser: env.get("FLAKEGUARD_BROWSER").map(str::to_string),
            browser_version: env.get("FLAKEGUARD_BROWSER_VERSION").map(str::to_string),
        }
    }

    /// Process-wide cached snapshot, computed once from the real
    /// environment.
    pub fn current() -> &'static EnvironmentInfo {
        static CURRENT: OnceLock<EnvironmentInfo> = OnceLock::new();
        CURRENT.get_or_init(|| EnvironmentInfo::detect(&EnvSnapshot::from_process()))
    }
}
