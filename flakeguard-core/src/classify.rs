//! Failure classification over error messages and stacks.
//!
//! Classification is pure substring matching against an ordered table of
//! pattern groups. The table order encodes precedence: timeout patterns
//! are checked before generic JavaScript-error patterns so a timeout whose
//! stack happens to contain `TypeError` still classifies as a timeout.
//! Matching is case-sensitive, first group wins, and the table is data,
//! not control flow, so the taxonomy extends without touching the loop.

use memchr::memmem;
use serde::{Deserialize, Serialize};

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Network,
    ElementNotFound,
    Assertion,
    Navigation,
    ElementInteraction,
    Permission,
    JavaScript,
    Environment,
    Unknown,
}

impl FailureKind {
    /// Short human label used in reports.
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Network => "network error",
            FailureKind::ElementNotFound => "element not found",
            FailureKind::Assertion => "assertion failure",
            FailureKind::Navigation => "navigation failure",
            FailureKind::ElementInteraction => "element interaction failure",
            FailureKind::Permission => "permission error",
            FailureKind::JavaScript => "javascript error",
            FailureKind::Environment => "environment error",
            FailureKind::Unknown => "unknown failure",
        }
    }

    /// Suggested first step when triaging this failure class.
    pub fn recovery_hint(self) -> &'static str {
        match self {
            FailureKind::Timeout => {
                "increase the relevant timeout or tag the test @slow; check for missing awaits"
            }
            FailureKind::Network => {
                "verify the app server and any stubbed endpoints are reachable from the worker"
            }
            FailureKind::ElementNotFound => {
                "confirm the selector still matches the rendered DOM; wait for hydration first"
            }
            FailureKind::Assertion => {
                "inspect expected vs actual in the failure report; the app behavior changed"
            }
            FailureKind::Navigation => {
                "check the target URL and any redirects; navigation may race with teardown"
            }
            FailureKind::ElementInteraction => {
                "wait for overlays/animations to settle before interacting; see the screenshot"
            }
            FailureKind::Permission => {
                "check artifact-directory ownership and CI workspace permissions"
            }
            FailureKind::JavaScript => {
                "open the console log artifact; the page threw before the test assertion"
            }
            FailureKind::Environment => {
                "browser binaries or system resources are missing on this worker"
            }
            FailureKind::Unknown => "read the full failure report; no known pattern matched",
        }
    }
}

/// Ordered pattern groups. First group with any matching substring wins.
static RULES: &[(FailureKind, &[&str])] = &[
    (
        FailureKind::Timeout,
        &[
            "timed out",
            "Timeout",
            "timeout",
            "TimeoutError",
            "exceeded while waiting",
        ],
    ),
    (
        FailureKind::Network,
        &[
            "net::ERR_",
            "ECONNREFUSED",
            "ECONNRESET",
            "EHOSTUNREACH",
            "socket hang up",
            "fetch failed",
            "NetworkError",
        ],
    ),
    (
        FailureKind::ElementNotFound,
        &[
            "element(s) not found",
            "no element matches selector",
            "waiting for selector",
            "waiting for locator",
            "strict mode violation",
        ],
    ),
    (
        FailureKind::Assertion,
        &[
            "expect(",
            "AssertionError",
            "assertion failed",
            "toHaveScreenshot",
            "toMatchSnapshot",
            "Expected:",
        ],
    ),
    (
        FailureKind::Navigation,
        &[
            "Navigation failed",
            "page.goto",
            "frame was detached",
            "Navigation interrupted",
        ],
    ),
    (
        FailureKind::ElementInteraction,
        &[
            "not clickable",
            "element is not attached",
            "intercepts pointer events",
            "element is not stable",
            "outside of the viewport",
            "element is not visible",
        ],
    ),
    (
        FailureKind::Permission,
        &["EACCES", "EPERM", "permission denied", "Permission denied"],
    ),
    (
        FailureKind::JavaScript,
        &[
            "TypeError",
            "ReferenceError",
            "SyntaxError",
            "RangeError",
            "is not a function",
            "undefined is not",
        ],
    ),
    (
        FailureKind::Environment,
        &[
            "browserType.launch",
            "Executable doesn't exist",
            "Failed to launch",
            "ENOSPC",
            "ENOMEM",
            "out of memory",
        ],
    ),
];

/// Classify a failure by its message and stack.
///
/// Falls through to [`FailureKind::Unknown`] when nothing matches.
pub fn classify(message: &str, stack: &str) -> FailureKind {
    for (kind, patterns) in RULES {
        for pattern in *patterns {
            if memmem::find(message.as_bytes(), pattern.as_bytes()).is_some()
                || memmem::find(stack.as_bytes(), pattern.as_bytes()).is_some()
            {
                return *kind;
            }
        }
    }
    FailureKind::Unknown
}
