//! Rule Layer
//!
//! An ordered list of predicates over Metadata; the first match names the
//! outbound to use. Rules that need a destination IP are marked so the
//! dispatcher can resolve on demand before evaluating them.

mod engine;
mod rule;

pub use engine::{RuleEngine, RuleMatch};
pub use rule::{Rule, RuleKind};
