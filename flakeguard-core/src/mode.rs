//! Test-mode resolution: one immutable policy bundle per process.
//!
//! A mode bundles retry counts, timeouts, enabled browsers, the visual
//! testing toggle, threshold preset, and tag filters. Resolution is a pure
//! function of (explicit override, CI detection, feature markers) and is
//! deterministic given identical inputs; the only side-effectful entry
//! point is [`apply_environment`], which writes the resolved config's
//! variable map back into the process environment for downstream tooling.
//!
//! Precedence, highest first:
//!
//! 1. `TEST_MODE` naming a valid mode — used verbatim.
//! 2. Under CI: `VISUAL_TESTS` → CiVisual, `LIGHTWEIGHT_TESTS` →
//!    CiLightweight, `FULL_BROWSER_MATRIX` → CiFull, else CiFunctional.
//! 3. Otherwise LocalDevelopment.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::probe::{EnvSnapshot, is_ci};
use crate::tags::Tag;
use crate::visual::ThresholdPreset;

/// Explicit mode override variable.
pub const MODE_VAR: &str = "TEST_MODE";
/// CI marker selecting the visual-only mode.
pub const VISUAL_VAR: &str = "VISUAL_TESTS";
/// CI marker selecting the lightweight smoke mode.
pub const LIGHTWEIGHT_VAR: &str = "LIGHTWEIGHT_TESTS";
/// CI marker selecting the full browser matrix.
pub const FULL_MATRIX_VAR: &str = "FULL_BROWSER_MATRIX";

/// The five named execution modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestMode {
    LocalDevelopment,
    CiFunctional,
    CiVisual,
    CiFull,
    CiLightweight,
}

impl TestMode {
    pub const ALL: [TestMode; 5] = [
        TestMode::LocalDevelopment,
        TestMode::CiFunctional,
        TestMode::CiVisual,
        TestMode::CiFull,
        TestMode::CiLightweight,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TestMode::LocalDevelopment => "local-development",
            TestMode::CiFunctional => "ci-functional",
            TestMode::CiVisual => "ci-visual",
            TestMode::CiFull => "ci-full",
            TestMode::CiLightweight => "ci-lightweight",
        }
    }

    /// Parse a mode name, tolerating case and `_`/`-` variation.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        TestMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Browser engines a mode may enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserEngine {
    Chromium,
    Firefox,
    WebKit,
}

/// Fully-resolved execution policy for one mode.
///
/// Immutable once constructed; exactly one instance is active per process
/// and every consumer receives it by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestModeConfig {
    pub mode: TestMode,
    pub include_tags: BTreeSet<Tag>,
    pub exclude_tags: BTreeSet<Tag>,
    pub retries: u32,
    pub browsers: BTreeSet<BrowserEngine>,
    pub test_timeout: Duration,
    pub action_timeout: Duration,
    pub navigation_timeout: Duration,
    pub visual_testing_enabled: bool,
    /// Pixel-difference threshold in `[0, 1]` for screenshot comparison.
    pub visual_test_threshold: f64,
    pub threshold_preset: ThresholdPreset,
    pub performance_threshold_multiplier: f64,
    /// Side channel propagated to child processes via [`apply_environment`].
    pub environment_variables: BTreeMap<String, String>,
}

/// Partial config: fields a mode overrides on top of the shared base.
///
/// Merge semantics are override, not deep-merge: a set field replaces the
/// base value wholesale (sets and maps included).
#[derive(Debug, Clone, Default)]
struct ModeOverrides {
    include_tags: Option<BTreeSet<Tag>>,
    exclude_tags: Option<BTreeSet<Tag>>,
    retries: Option<u32>,
    browsers: Option<BTreeSet<BrowserEngine>>,
    test_timeout: Option<Duration>,
    action_timeout: Option<Duration>,
    navigation_timeout: Option<Duration>,
    visual_testing_enabled: Option<bool>,
    visual_test_threshold: Option<f64>,
    performance_threshold_multiplier: Option<f64>,
}

fn tag_set(raw: &[&str]) -> BTreeSet<Tag> {
    raw.iter().map(|t| Tag::new(t)).collect()
}

/// Shared defaults every mode layers over (the local-development values).
fn base_config(mode: TestMode) -> TestModeConfig {
    TestModeConfig {
        mode,
        include_tags: BTreeSet::new(),
        exclude_tags: BTreeSet::new(),
        retries: 0,
        browsers: BTreeSet::from([BrowserEngine::Chromium]),
        test_timeout: Duration::from_secs(30),
        action_timeout: Duration::from_secs(10),
        navigation_timeout: Duration::from_secs(30),
        visual_testing_enabled: true,
        visual_test_threshold: 0.20,
        threshold_preset: ThresholdPreset::Default,
        performance_threshold_multiplier: 1.0,
        environment_variables: BTreeMap::new(),
    }
}

fn overrides_for(mode: TestMode) -> ModeOverrides {
    match mode {
        TestMode::LocalDevelopment => ModeOverrides::default(),
        TestMode::CiFunctional => ModeOverrides {
            retries: Some(1),
            test_timeout: Some(Duration::from_secs(45)),
            action_timeout: Some(Duration::from_secs(15)),
            navigation_timeout: Some(Duration::from_secs(45)),
            visual_testing_enabled: Some(false),
            visual_test_threshold: Some(0.35),
            exclude_tags: Some(tag_set(&["visual", "performance"])),
            performance_threshold_multiplier: Some(1.5),
            ..Default::default()
        },
        TestMode::CiVisual => ModeOverrides {
            retries: Some(1),
            test_timeout: Some(Duration::from_secs(60)),
            action_timeout: Some(Duration::from_secs(20)),
            navigation_timeout: Some(Duration::from_secs(60)),
            visual_testing_enabled: Some(true),
            visual_test_threshold: Some(0.35),
            include_tags: Some(tag_set(&["visual"])),
            performance_threshold_multiplier: Some(1.5),
            ..Default::default()
        },
        TestMode::CiFull => ModeOverrides {
            retries: Some(2),
            test_timeout: Some(Duration::from_secs(60)),
            action_timeout: Some(Duration::from_secs(20)),
            navigation_timeout: Some(Duration::from_secs(60)),
            visual_testing_enabled: Some(true),
            visual_test_threshold: Some(0.35),
            browsers: Some(BTreeSet::from([
                BrowserEngine::Chromium,
                BrowserEngine::Firefox,
                BrowserEngine::WebKit,
            ])),
            performance_threshold_multiplier: Some(2.0),
            ..Default::default()
        },
        TestMode::CiLightweight => ModeOverrides {
            retries: Some(1),
            test_timeout: Some(Duration::from_secs(45)),
            action_timeout: Some(Duration::from_secs(15)),
            navigation_timeout: Some(Duration::from_secs(45)),
            visual_testing_enabled: Some(false),
            visual_test_threshold: Some(0.35),
            exclude_tags: Some(tag_set(&["visual", "performance", "slow"])),
            performance_threshold_multiplier: Some(1.5),
            ..Default::default()
        },
    }
}

impl TestModeConfig {
    /// Total, side-effect-free lookup of the canonical config for a mode.
    pub fn for_mode(mode: TestMode) -> Self {
        let mut config = base_config(mode);
        let overrides = overrides_for(mode);

        if let Some(v) = overrides.include_tags {
            config.include_tags = v;
        }
        if let Some(v) = overrides.exclude_tags {
            config.exclude_tags = v;
        }
        if let Some(v) = overrides.retries {
            config.retries = v;
        }
        if let Some(v) = overrides.browsers {
            config.browsers = v;
        }
        if let Some(v) = overrides.test_timeout {
            config.test_timeout = v;
        }
        if let Some(v) = overrides.action_timeout {
            config.action_timeout = v;
        }
        if let Some(v) = overrides.navigation_timeout {
            config.navigation_timeout = v;
        }
        if let Some(v) = overrides.visual_testing_enabled {
            config.visual_testing_enabled = v;
        }
        if let Some(v) = overrides.visual_test_threshold {
            config.visual_test_threshold = v;
        }
        if let Some(v) = overrides.performance_threshold_multiplier {
            config.performance_threshold_multiplier = v;
        }

        config.environment_variables = BTreeMap::from([
            ("FLAKEGUARD_MODE".to_string(), mode.as_str().to_string()),
            ("FLAKEGUARD_RETRIES".to_string(), config.retries.to_string()),
            (
                VISUAL_VAR.to_string(),
                if config.visual_testing_enabled { "1" } else { "0" }.to_string(),
            ),
        ]);
        config
    }
}

/// Resolve the active mode from an environment snapshot.
pub fn resolve(env: &EnvSnapshot) -> TestMode {
    if let Some(raw) = env.get(MODE_VAR) {
        if let Some(mode) = TestMode::parse(raw) {
            debug!(mode = %mode, "mode taken from explicit override");
            return mode;
        }
        debug!(raw, "ignoring unrecognized {MODE_VAR} value");
    }

    let mode = if is_ci(env) {
        if env.is_truthy(VISUAL_VAR) {
            TestMode::CiVisual
        } else if env.is_truthy(LIGHTWEIGHT_VAR) {
            TestMode::CiLightweight
        } else if env.is_truthy(FULL_MATRIX_VAR) {
            TestMode::CiFull
        } else {
            TestMode::CiFunctional
        }
    } else {
        TestMode::LocalDevelopment
    };
    debug!(mode = %mode, "mode resolved from environment");
    mode
}

/// Resolve the mode and build its config in one step.
pub fn resolve_config(env: &EnvSnapshot) -> TestModeConfig {
    TestModeConfig::for_mode(resolve(env))
}

/// Write the resolved config's variable map into the process environment.
///
/// Idempotent: variables already holding the target value are left alone.
/// Must run before any child process that depends on the propagated values
/// is spawned, while the process is still single-threaded with respect to
/// environment access.
#[allow(unsafe_code)]
pub fn apply_environment(config: &TestModeConfig) {
    for (key, value) in &config.environment_variables {
        if std::env::var(key).as_deref() == Ok(value.as_str()) {
            continue;
        }
        // SAFETY: callers invoke this during process setup, before worker
        // threads or child processes that read the environment exist.
        unsafe { std::env::set_var(key, value) };
        info!(key, value, "applied mode environment variable");
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
}
