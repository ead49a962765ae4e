//! Mirrors monitoring events as `tracing` records.
//!
//! Pool and connection events are logged under [`CONNECTION_TRACING_EVENT_TARGET`], command
//! events under [`COMMAND_TRACING_EVENT_TARGET`], both at debug level.

mod command;
mod connection;

use crate::{
    bson::{Bson, Document},
    error::Error,
    options::{ServerAddress, DEFAULT_PORT},
};

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongowire::command";
pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongowire::connection";

/// Documents and error messages longer than this are truncated in log records.
pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

/// Formats events into `tracing` records.
#[derive(Clone, Debug)]
pub(crate) struct TracingMirror {
    max_document_length_bytes: usize,
}

impl Default for TracingMirror {
    fn default() -> Self {
        Self {
            max_document_length_bytes: DEFAULT_MAX_DOCUMENT_LENGTH_BYTES,
        }
    }
}

impl TracingMirror {
    /// Relaxed extended JSON, cut to the configured length.
    fn document(&self, doc: &Document) -> String {
        let mut json = Bson::Document(doc.clone())
            .into_relaxed_extjson()
            .to_string();
        truncate_on_char_boundary(&mut json, self.max_document_length_bytes);
        json
    }

    fn error(&self, error: &Error) -> String {
        let mut message = error.to_string();
        truncate_on_char_boundary(&mut message, self.max_document_length_bytes);
        message
    }
}

impl ServerAddress {
    /// The port to log, with the default filled in. Ports are meaningless for Unix sockets.
    pub(crate) fn port_tracing_representation(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => Some(port.unwrap_or(DEFAULT_PORT)),
            #[cfg(unix)]
            Self::Unix { .. } => None,
        }
    }
}

/// Cuts `s` to at most `max_length` bytes without splitting a character, appending "..." when
/// anything was removed.
pub(crate) fn truncate_on_char_boundary(s: &mut String, max_length: usize) {
    if s.len() <= max_length {
        return;
    }
    let mut end = max_length;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s.push_str("...");
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        bson::doc,
        event::cmap::{
            CmapEvent,
            ConnectionCheckoutFailedReason,
            ConnectionClosedReason,
            PoolReadyEvent,
        },
    };

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut s = "aé".repeat(4);
        truncate_on_char_boundary(&mut s, 2);
        assert_eq!(s, "a...");

        let mut short = String::from("abc");
        truncate_on_char_boundary(&mut short, 10);
        assert_eq!(short, "abc");
    }

    #[test]
    fn long_documents_are_truncated() {
        let mirror = TracingMirror::default();
        let serialized = mirror.document(&doc! { "find": "x".repeat(2000) });
        assert_eq!(serialized.len(), DEFAULT_MAX_DOCUMENT_LENGTH_BYTES + 3);
        assert!(serialized.ends_with("..."));

        let narrow = TracingMirror {
            max_document_length_bytes: 20,
        };
        let short = narrow.document(&doc! { "ping": 1 });
        assert_eq!(short, r#"{"ping":1}"#);
    }

    #[test]
    fn default_port_is_reported() {
        let address = ServerAddress::Tcp {
            host: "localhost".to_string(),
            port: None,
        };
        assert_eq!(address.port_tracing_representation(), Some(DEFAULT_PORT));
    }

    #[test]
    fn reasons_have_messages() {
        assert!(ConnectionClosedReason::Idle.describe().contains("max idle time"));
        assert!(ConnectionCheckoutFailedReason::Timeout
            .describe()
            .contains("Wait queue timeout"));
    }

    #[test]
    fn mirroring_without_a_subscriber_is_harmless() {
        let mirror = TracingMirror::default();
        let address = ServerAddress::Tcp {
            host: "localhost".to_string(),
            port: Some(27018),
        };
        mirror.pool_event(&CmapEvent::PoolReady(PoolReadyEvent { address }));
    }
}
