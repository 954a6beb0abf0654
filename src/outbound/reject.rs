//! Reject outbound - refuse the connection immediately

use crate::common::{Metadata, Stream};
use crate::error::{Error, Result};

/// Rejects every dial with a structured error. The dispatcher surfaces the
/// rejection to the inbound without touching the network.
pub struct RejectOutbound {
    name: String,
}

impl RejectOutbound {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn dial(&self, meta: &Metadata) -> Result<Stream> {
        Err(Error::Dial(format!(
            "{} rejected by {}",
            meta, self.name
        )))
    }
}
