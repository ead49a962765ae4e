use std::time::Duration;

use crate::{
    bson::oid::ObjectId,
    compression::Compressor,
    hello::{HelloReply, ServerType},
    options::ServerAddress,
};

/// Contains information about a given server in a format digestible by a connection.
///
/// Computed once per handshake; nothing in it changes afterwards.
#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct StreamDescription {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub min_wire_version: Option<i32>,

    /// The supported authentication mechanisms that the server understands.
    pub sasl_supported_mechs: Option<Vec<String>>,

    /// How long sessions started on this server will stay alive without
    /// without executing an operation before the server kills them.
    pub logical_session_timeout: Option<Duration>,

    /// The maximum size of writes (excluding command overhead) that should be sent to the server.
    pub max_bson_object_size: i64,

    /// The maximum number of inserts, updates, or deletes that
    /// can be included in a write batch.
    pub max_write_batch_size: i64,

    /// Whether the server associated with this connection supports the `hello` command.
    pub hello_ok: bool,

    /// The maximum permitted size of a BSON wire protocol message.
    pub max_message_size_bytes: i32,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,

    /// The compressor both sides agreed on, if any.
    pub compressor: Option<Compressor>,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: reply.command_response.server_type(),
            max_wire_version: reply.command_response.max_wire_version,
            min_wire_version: reply.command_response.min_wire_version,
            sasl_supported_mechs: reply.command_response.sasl_supported_mechs.clone(),
            logical_session_timeout: reply
                .command_response
                .logical_session_timeout_minutes
                .and_then(|mins| u64::try_from(mins).ok()?.checked_mul(60))
                .map(Duration::from_secs),
            max_bson_object_size: reply.command_response.max_bson_object_size,
            max_write_batch_size: reply
                .command_response
                .max_write_batch_size
                .unwrap_or(100_000),
            hello_ok: reply.command_response.hello_ok.unwrap_or(false),
            max_message_size_bytes: reply.command_response.max_message_size_bytes,
            service_id: reply.command_response.service_id,
            compressor: None,
        }
    }

    /// Whether this StreamDescription supports retryable writes.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.initial_server_type != ServerType::Standalone
            && self.logical_session_timeout.is_some()
            && self.max_wire_version.is_some_and(|version| version >= 6)
    }

    /// Whether sessions may be used on this connection.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    /// Gets a description of a stream for a 4.2 connection.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self::with_wire_version(8)
    }

    /// Gets a description of a stream for a connection to a server with the provided
    /// maxWireVersion.
    #[cfg(test)]
    pub(crate) fn with_wire_version(max_wire_version: i32) -> Self {
        Self {
            server_address: Default::default(),
            initial_server_type: ServerType::RsPrimary,
            max_wire_version: Some(max_wire_version),
            min_wire_version: Some(max_wire_version),
            sasl_supported_mechs: Default::default(),
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            max_bson_object_size: 16 * 1024 * 1024,
            max_write_batch_size: 100_000,
            hello_ok: false,
            max_message_size_bytes: 48_000_000,
            service_id: None,
            compressor: None,
        }
    }
}
