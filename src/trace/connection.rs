use super::{TracingMirror, CONNECTION_TRACING_EVENT_TARGET};
use crate::event::cmap::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason};

/// Every pool record names the server it belongs to.
macro_rules! pool_debug {
    ($address:expr, $message:literal $(, $field:ident = $value:expr)* $(,)?) => {
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            serverHost = $address.host().as_ref(),
            serverPort = $address.port_tracing_representation(),
            $($field = $value,)*
            $message,
        )
    };
}

impl TracingMirror {
    pub(crate) fn pool_event(&self, event: &CmapEvent) {
        match event {
            CmapEvent::PoolCreated(e) => {
                let options = e.options.as_ref();
                pool_debug!(
                    e.address,
                    "Connection pool created",
                    maxIdleTimeMS = options.and_then(|o| o.max_idle_time.map(|d| d.as_millis())),
                    maxPoolSize = options.and_then(|o| o.max_pool_size),
                    minPoolSize = options.and_then(|o| o.min_pool_size),
                    maxConnecting = options.and_then(|o| o.max_connecting),
                    loadBalanced = options.and_then(|o| o.load_balanced),
                );
            }
            CmapEvent::PoolReady(e) => pool_debug!(e.address, "Connection pool ready"),
            CmapEvent::PoolCleared(e) => pool_debug!(
                e.address,
                "Connection pool cleared",
                serviceId = e.service_id.map(|id| id.to_hex()),
                interruptInUseConnections = e.interrupt_in_use_connections,
            ),
            CmapEvent::PoolClosed(e) => pool_debug!(e.address, "Connection pool closed"),
            CmapEvent::ConnectionCreated(e) => pool_debug!(
                e.address,
                "Connection created",
                driverConnectionId = e.connection_id,
            ),
            CmapEvent::ConnectionReady(e) => pool_debug!(
                e.address,
                "Connection ready",
                driverConnectionId = e.connection_id,
                durationMS = e.duration.as_millis(),
            ),
            CmapEvent::ConnectionClosed(e) => pool_debug!(
                e.address,
                "Connection closed",
                driverConnectionId = e.connection_id,
                reason = e.reason.describe(),
                error = e.error.as_ref().map(|err| self.error(err)),
            ),
            CmapEvent::ConnectionCheckoutStarted(e) => {
                pool_debug!(e.address, "Connection checkout started")
            }
            CmapEvent::ConnectionCheckoutFailed(e) => pool_debug!(
                e.address,
                "Connection checkout failed",
                reason = e.reason.describe(),
                error = e.error.as_ref().map(|err| self.error(err)),
                durationMS = e.duration.as_millis(),
            ),
            CmapEvent::ConnectionCheckedOut(e) => pool_debug!(
                e.address,
                "Connection checked out",
                driverConnectionId = e.connection_id,
                durationMS = e.duration.as_millis(),
            ),
            CmapEvent::ConnectionCheckedIn(e) => pool_debug!(
                e.address,
                "Connection checked in",
                driverConnectionId = e.connection_id,
            ),
        }
    }
}

impl ConnectionClosedReason {
    pub(crate) fn describe(self) -> &'static str {
        match self {
            Self::Stale => "Connection became stale because the pool was cleared",
            Self::Idle => {
                "Connection has been available but unused for longer than the configured max idle \
                 time"
            }
            Self::Error => "An error occurred while using the connection",
            Self::Dropped => "Connection was dropped during an operation",
            Self::PoolClosed => "Connection pool was closed",
        }
    }
}

impl ConnectionCheckoutFailedReason {
    pub(crate) fn describe(self) -> &'static str {
        match self {
            Self::Timeout => "Wait queue timeout elapsed without a connection becoming available",
            Self::ConnectionError => "An error occurred while trying to establish a new connection",
            Self::PoolClosed => "Connection pool was closed",
        }
    }
}
