//! Tunnel Layer
//!
//! The inbound -> rule -> outbound glue plus the live-connection registry.

mod dispatcher;
mod tracker;

pub use dispatcher::{Dispatcher, DIAL_TIMEOUT};
pub use tracker::{ConnectionSnapshot, Tracker};

use serde::Serialize;

/// Dispatch mode, mutable at runtime through the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Evaluate the rule set
    #[default]
    Rule,
    /// Send everything through the first proxy group
    Global,
    /// Bypass everything
    Direct,
}

impl Mode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "rule" => Some(Mode::Rule),
            "global" => Some(Mode::Global),
            "direct" => Some(Mode::Direct),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Rule => "rule",
            Mode::Global => "global",
            Mode::Direct => "direct",
        }
    }
}
