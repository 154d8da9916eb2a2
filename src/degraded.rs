//! Offline comment templates.
//!
//! The terminal fallback of the pipeline: builds a remark from the scene
//! alone, with no network dependency. Output is always a non-empty single
//! line.
//!
//! | Reason | Remark |
//! |--------|--------|
//! | `NotConfigured` | not connected to a remote model |
//! | `GateCooling` / `NetworkUnstable` | network is shaky, staying local (mentions the top label) |
//! | `RemoteFailed` / `Cancelled` with detections | refers to the most confident label |
//! | anything with an empty scene | generic "nothing notable" remark |

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::classifier::ErrorCategory;
use crate::retry::{CallFailure, FailureOrigin};
use crate::vision::SceneDescription;

const MAX_LABEL_CHARS: usize = 40;

const NOT_CONFIGURED: [&str; 2] = [
    "Meow? I'm not connected to my AI service yet.",
    "Meow? No AI service configured, so I'm just keeping you company.",
];

const NETWORK_SHAKY: [&str; 2] = [
    "Meow, the network is a bit shaky, I'll stay local with you for now.",
    "Meow, can't reach the AI right now, staying local for a while.",
];

const NETWORK_SHAKY_LABEL: [&str; 2] = [
    "Meow, the network is shaky, so I'll just keep an eye on the {label} for now.",
    "Meow, staying local for a bit, but I can see the {label}!",
];

const TOP_LABEL: [&str; 3] = [
    "Meow~ that {label} looks interesting, keep going!",
    "Meow! I spotted the {label}, nice work.",
    "Purr... the {label} caught my eye.",
];

const NOTHING_NOTABLE: [&str; 3] = [
    "Meow~ nothing notable here, keep up the good work!",
    "Meow, the screen is a bit hard to read, but keep going!",
    "Purr... all quiet here, carry on with your spreadsheet.",
];

/// Why the pipeline fell back to a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    /// No remote provider is configured.
    NotConfigured,
    /// The text endpoint's gate is cooling.
    GateCooling,
    /// The last failure was a connection or timeout error.
    NetworkUnstable,
    /// The remote call failed for another reason.
    RemoteFailed,
    /// The host cancelled the call.
    Cancelled,
}

impl DegradeReason {
    /// Reason implied by the failure that ended a remote call.
    pub fn from_failure(failure: &CallFailure) -> Self {
        match failure.origin {
            FailureOrigin::GateRejected => Self::GateCooling,
            FailureOrigin::Cancelled => Self::Cancelled,
            FailureOrigin::Call => match failure.category {
                ErrorCategory::Connection | ErrorCategory::Timeout => Self::NetworkUnstable,
                _ => Self::RemoteFailed,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::GateCooling => "gate_cooling",
            Self::NetworkUnstable => "network_unstable",
            Self::RemoteFailed => "remote_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collapse all whitespace (newlines included) into single spaces.
pub fn normalize_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_label(label: &str) -> Option<String> {
    let line = normalize_line(label);
    if line.is_empty() {
        return None;
    }
    let mut clipped: String = line.chars().take(MAX_LABEL_CHARS).collect();
    if line.chars().count() > MAX_LABEL_CHARS {
        clipped.push_str("...");
    }
    Some(clipped)
}

/// Template-based commenter. Rotates through its templates so repeated
/// degraded comments do not read identically.
#[derive(Debug, Default)]
pub struct DegradedCommenter {
    turn: AtomicUsize,
}

impl DegradedCommenter {
    pub fn new() -> Self {
        Self::default()
    }

    fn pick<'a>(&self, templates: &[&'a str]) -> &'a str {
        let turn = self.turn.fetch_add(1, Ordering::Relaxed);
        templates[turn % templates.len()]
    }

    /// Build a one-line remark for `scene`.
    pub fn comment(&self, reason: DegradeReason, scene: &SceneDescription) -> String {
        let label = scene.top().and_then(|d| clean_label(&d.label));

        let text = match (reason, label) {
            (DegradeReason::NotConfigured, _) => self.pick(&NOT_CONFIGURED).to_string(),
            (DegradeReason::GateCooling | DegradeReason::NetworkUnstable, Some(label)) => {
                self.pick(&NETWORK_SHAKY_LABEL).replace("{label}", &label)
            }
            (DegradeReason::GateCooling | DegradeReason::NetworkUnstable, None) => {
                self.pick(&NETWORK_SHAKY).to_string()
            }
            (_, Some(label)) => self.pick(&TOP_LABEL).replace("{label}", &label),
            (_, None) => self.pick(&NOTHING_NOTABLE).to_string(),
        };

        let line = normalize_line(&text);
        if line.is_empty() {
            NOTHING_NOTABLE[0].to_string()
        } else {
            line
        }
    }
}
