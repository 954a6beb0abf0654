//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Stream: unified async I/O abstraction
//! - Metadata: connection context for rule evaluation
//! - Address: network address representation
//! - Pipe: bidirectional splice with counters and cancellation

mod address;
mod metadata;
pub mod pipe;
mod stream;

pub use address::Address;
pub use metadata::{InboundKind, Metadata, Network};
pub use pipe::{relay, CancelToken, Counter, Pipe, SPLICE_BUFFER_SIZE};
pub use stream::{IntoStream, PrependStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
