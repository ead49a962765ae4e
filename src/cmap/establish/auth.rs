//! Pluggable authentication run as the last step of the handshake.

use derive_where::derive_where;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{
    bson::{Document, RawDocumentBuf},
    cmap::{Connection, StreamDescription},
    error::Result,
    options::ServerApi,
};

/// The database credentials are checked against when no source is given.
const DEFAULT_AUTH_SOURCE: &str = "admin";

/// A set of information used to authenticate a connection.
///
/// The mechanism itself is implemented by an [`AuthProvider`]; this crate only carries the
/// credential through the handshake.
#[derive(Clone, Default, Deserialize, PartialEq, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with.
    pub username: Option<String>,

    /// The database used to authenticate. Defaults to "admin".
    pub source: Option<String>,

    /// The password to authenticate with.
    #[derive_where(skip(Debug))]
    pub password: Option<String>,

    /// The name of the mechanism to use. When unset with a username present, the handshake asks
    /// the server which mechanisms the user supports.
    pub mechanism: Option<String>,

    /// Additional properties for the mechanism.
    pub mechanism_properties: Option<Document>,
}

impl Credential {
    /// The database the credential is checked against.
    pub fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or(DEFAULT_AUTH_SOURCE)
    }

    /// If the mechanism is missing, append the appropriate mechanism negotiation key-value-pair to
    /// the provided hello command document.
    pub(crate) fn append_needed_mechanism_negotiation(&self, command: &mut RawDocumentBuf) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            command.append(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }
}

/// Everything an [`AuthProvider`] may use while authenticating one connection.
#[non_exhaustive]
pub struct AuthContext<'a> {
    /// The connection being authenticated. Its handshake has completed, so commands may be
    /// sent on it.
    pub connection: &'a mut Connection,

    /// The credential configured for the connection.
    pub credential: &'a Credential,

    /// The description built from the handshake reply.
    pub stream_description: &'a StreamDescription,

    /// The server's answer to the speculative authentication payload, if one was sent.
    pub speculative_reply: Option<&'a Document>,

    /// The declared server API, which every command sent must carry.
    pub server_api: Option<&'a ServerApi>,
}

/// Authenticates connections during the handshake.
///
/// Implementations run the conversation for their mechanism over
/// [`AuthContext::connection`]. A returned error fails the connection's establishment.
pub trait AuthProvider: Send + Sync {
    /// A payload to send along with the hello command, saving a round trip when the server
    /// supports it. The server's answer is passed back through
    /// [`AuthContext::speculative_reply`].
    fn speculative_authenticate(&self, _credential: &Credential) -> Result<Option<Document>> {
        Ok(None)
    }

    /// Authenticates the connection in `context`.
    fn authenticate<'a>(&'a self, context: AuthContext<'a>) -> BoxFuture<'a, Result<()>>;
}
