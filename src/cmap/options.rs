use std::time::Duration;

use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    bson_util,
    error::{Error, Result},
    event::{cmap::CmapEvent, EventHandler},
};

/// Options for a connection pool.
///
/// Durations of zero mean "unbounded", as does a `max_pool_size` of zero.
#[derive(Clone, Default, Deserialize, Serialize, TypedBuilder)]
#[derive_where(Debug, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionPoolOptions {
    /// The maximum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    ///
    /// The default is 100.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. If fewer than `min_pool_size`
    /// connections are in the pool, connections will be added to the pool in the background.
    ///
    /// The default is that no minimum is enforced.
    pub min_pool_size: Option<u32>,

    /// The maximum number of new connections that can be created concurrently.
    ///
    /// The default is 2.
    pub max_connecting: Option<u32>,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time` will
    /// not be used.
    ///
    /// The default is that connections will not be closed due to being idle.
    #[serde(rename = "maxIdleTimeMS")]
    #[serde(default)]
    #[serde(deserialize_with = "bson_util::deserialize_duration_option_from_u64_millis")]
    #[serde(serialize_with = "bson_util::serialize_duration_option_as_int_millis")]
    pub max_idle_time: Option<Duration>,

    /// How long a checkout may wait for a connection before failing.
    ///
    /// The default is to wait indefinitely.
    #[serde(rename = "waitQueueTimeoutMS")]
    #[serde(default)]
    #[serde(deserialize_with = "bson_util::deserialize_duration_option_from_u64_millis")]
    #[serde(serialize_with = "bson_util::serialize_duration_option_as_int_millis")]
    pub wait_queue_timeout: Option<Duration>,

    /// Whether the pool's connections go through a load balancer. Generations are then tracked
    /// per backend service.
    pub load_balanced: Option<bool>,

    /// Receives the pool's monitoring events.
    #[derive_where(skip)]
    #[builder(setter(strip_option))]
    #[serde(skip)]
    pub cmap_event_handler: Option<EventHandler<CmapEvent>>,

    /// Whether the pool starts out ready.
    #[cfg(test)]
    #[serde(skip)]
    pub(crate) ready: Option<bool>,

    /// How often the pool runs its maintenance pass.
    #[cfg(test)]
    #[serde(skip)]
    pub(crate) maintenance_frequency: Option<Duration>,
}

impl ConnectionPoolOptions {
    /// Checks the options for consistency.
    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_pool_size, self.max_pool_size) {
            if max != 0 && min > max {
                return Err(Error::invalid_argument(format!(
                    "min_pool_size ({min}) is greater than max_pool_size ({max})"
                )));
            }
        }
        if self.max_connecting == Some(0) {
            return Err(Error::invalid_argument("max_connecting must be at least 1"));
        }
        Ok(())
    }

    /// The options as they are reported in a pool created event.
    pub(crate) fn to_event_options(&self) -> Self {
        Self {
            cmap_event_handler: None,
            ..self.clone()
        }
    }
}
