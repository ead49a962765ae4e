//! Address, transport, and selection options shared by the connection, pool and executor layers.

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, Bson, Document},
    error::{Error, ErrorKind, Result},
};

pub use crate::{
    cmap::{
        establish::{ClientMetadata, Credential, DriverInfo, EstablisherOptions},
        options::ConnectionPoolOptions,
    },
    compression::Compressor,
    executor::ExecutorOptions,
};

/// The default port servers listen on.
pub const DEFAULT_PORT: u16 = 27017;

/// An enum representing the address of a server.
#[derive(Clone, Debug, Eq, Serialize)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the server can be found.
        host: String,

        /// The TCP port that the server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
    /// A Unix Domain Socket path.
    #[cfg(unix)]
    Unix {
        /// The path to the Unix Domain Socket.
        path: PathBuf,
    },
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{e}")))
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host == other_host
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
            #[cfg(unix)]
            (Self::Unix { path }, Self::Unix { path: other_path }) => path == other_path,
            #[cfg(unix)]
            _ => false,
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
            #[cfg(unix)]
            Self::Unix { path } => path.hash(state),
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`. Strings ending in `.sock` are treated as
    /// Unix Domain Socket paths.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();

        #[cfg(unix)]
        if address.ends_with(".sock") {
            return Ok(ServerAddress::Unix {
                path: PathBuf::from(address),
            });
        }

        let invalid = || -> Error {
            ErrorKind::InvalidArgument {
                message: format!("invalid server address: \"{address}\""),
            }
            .into()
        };

        let (hostname, port) = if let Some(ip_literal) = address.strip_prefix('[') {
            let (hostname, rest) = ip_literal.split_once(']').ok_or_else(invalid)?;
            let port = match rest {
                "" => None,
                _ => Some(rest.strip_prefix(':').ok_or_else(invalid)?),
            };
            (hostname, port)
        } else {
            match address.split_once(':') {
                Some((hostname, port)) => (hostname, Some(port)),
                None => (address, None),
            }
        };

        if hostname.is_empty() {
            return Err(invalid());
        }

        let port = match port {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| {
                    Error::invalid_argument(format!(
                        "port must be valid 16-bit unsigned integer, instead got: {part}"
                    ))
                })?;
                if port == 0 {
                    return Err(Error::invalid_argument(format!(
                        "invalid port specified in address \"{address}\""
                    )));
                }
                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    pub(crate) fn host(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Self::Tcp { host, .. } => std::borrow::Cow::Borrowed(host.as_str()),
            #[cfg(unix)]
            Self::Unix { path } => path.to_string_lossy(),
        }
    }

    pub(crate) fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
            #[cfg(unix)]
            Self::Unix { .. } => None,
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
            #[cfg(unix)]
            Self::Unix { path } => write!(fmt, "{}", path.display()),
        }
    }
}

/// Specifies whether TLS configuration should be used with the operations that the
/// connection establisher performs.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Tls {
    /// Enable TLS with the specified options.
    Enabled(TlsOptions),

    /// Disable TLS.
    Disabled,
}

impl From<TlsOptions> for Tls {
    fn from(options: TlsOptions) -> Self {
        Self::Enabled(options)
    }
}

impl From<TlsOptions> for Option<Tls> {
    fn from(options: TlsOptions) -> Self {
        Some(Tls::Enabled(options))
    }
}

/// Specifies the TLS configuration that connections should use.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TlsOptions {
    /// Whether or not to return an error if the server presents an invalid certificate. This
    /// setting should _not_ be set to `true` in production; it should only be used for testing.
    ///
    /// The default value is to error when the server presents an invalid certificate.
    pub allow_invalid_certificates: Option<bool>,

    /// The path to the CA file to use for TLS. If none is specified, the Mozilla root
    /// certificates from the `webpki-roots` crate are used.
    pub ca_file_path: Option<PathBuf>,

    /// The path to the file containing the PEM-encoded certificate and private key to present to
    /// the server to verify the client's identity.
    pub cert_key_file_path: Option<PathBuf>,
}

/// Specifies a SOCKS5 proxy that connections should be routed through.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, TypedBuilder)]
#[non_exhaustive]
pub struct Socks5Proxy {
    /// The hostname or IP address of the proxy.
    #[builder(setter(into))]
    pub host: String,

    /// The port of the proxy. Defaults to 1080.
    #[builder(default, setter(into))]
    pub port: Option<u16>,

    /// A username/password pair to authenticate with the proxy.
    #[builder(default, setter(into))]
    pub authentication: Option<(String, String)>,
}

/// The declared API version for a connection.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum ServerApiVersion {
    /// Use API version 1.
    #[serde(rename = "1")]
    V1,
}

impl Display for ServerApiVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "1"),
        }
    }
}

/// Options used to declare a stable server API. Once declared, every command sent carries the
/// declared version, and the handshake always uses `hello` over the modern message format.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[non_exhaustive]
pub struct ServerApi {
    /// The declared API version.
    #[serde(rename = "apiVersion")]
    pub version: ServerApiVersion,

    /// Whether the server should return errors for features that are not part of the API
    /// version.
    #[serde(rename = "apiStrict")]
    #[builder(default, setter(into))]
    pub strict: Option<bool>,

    /// Whether the server should return errors for deprecated features.
    #[serde(rename = "apiDeprecationErrors")]
    #[builder(default, setter(into))]
    pub deprecation_errors: Option<bool>,
}

impl ServerApi {
    pub(crate) fn append_to(&self, command: &mut Document) {
        command.insert("apiVersion", self.version.to_string());
        if let Some(strict) = self.strict {
            command.insert("apiStrict", strict);
        }
        if let Some(deprecation_errors) = self.deprecation_errors {
            command.insert("apiDeprecationErrors", deprecation_errors);
        }
    }
}

/// A set of tags used to filter eligible servers.
pub type TagSet = std::collections::HashMap<String, String>;

/// Options shared by the non-primary read preference modes.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Tag sets that eligible servers must match, in order of preference.
    pub tag_sets: Option<Vec<TagSet>>,

    /// The maximum replication lag an eligible secondary may have.
    #[serde(
        rename = "maxStalenessSeconds",
        default,
        deserialize_with = "crate::bson_util::deserialize_duration_option_from_u64_seconds",
        serialize_with = "crate::bson_util::serialize_duration_option_as_int_secs"
    )]
    pub max_staleness: Option<Duration>,
}

/// Specifies how an operation should select which server to run against.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        #[allow(missing_docs)]
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries
    /// if not.
    PrimaryPreferred {
        #[allow(missing_docs)]
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        #[allow(missing_docs)]
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the node with the least network latency regardless of whether
    /// it's the primary or a secondary.
    Nearest {
        #[allow(missing_docs)]
        options: Option<ReadPreferenceOptions>,
    },
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    /// Whether this preference permits reading from a non-primary.
    pub(crate) fn is_secondary_ok(&self) -> bool {
        !matches!(self, Self::Primary)
    }

    /// The `$readPreference` document sent to the server.
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = doc! { "mode": self.mode() };
        if let Some(options) = self.options() {
            if let Some(ref tag_sets) = options.tag_sets {
                let tags: Vec<Bson> = tag_sets
                    .iter()
                    .map(|set| {
                        Bson::Document(
                            set.iter()
                                .map(|(k, v)| (k.clone(), Bson::String(v.clone())))
                                .collect(),
                        )
                    })
                    .collect();
                doc.insert("tags", tags);
            }
            if let Some(max_staleness) = options.max_staleness {
                doc.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
            }
        }
        doc
    }
}

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable.
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    pub(crate) fn is_read_pref_primary(&self) -> bool {
        matches!(self, Self::ReadPreference(ReadPreference::Primary))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerAddress) -> bool>;
