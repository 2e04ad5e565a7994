//! Placeholder connection for a broker that was unreachable at boot

use crate::{Broker, BrokerChannel, BusError, BusResult};
use async_trait::async_trait;
use std::sync::Arc;

/// A connection that never connected
///
/// A service that must keep serving HTTP while the broker is down holds
/// one of these instead of a live connection; every publish then fails
/// with [`BusError::Connection`] and is reported to the caller.
#[derive(Debug, Clone)]
pub struct OfflineBroker {
    reason: String,
}

impl OfflineBroker {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[async_trait]
impl Broker for OfflineBroker {
    async fn open_channel(&self) -> BusResult<Arc<dyn BrokerChannel>> {
        Err(BusError::Connection(format!(
            "broker unavailable: {}",
            self.reason
        )))
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn close(&self) -> BusResult<()> {
        Ok(())
    }
}
