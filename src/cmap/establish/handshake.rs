
use std::{sync::LazyLock, sync::Arc};

use derive_where::derive_where;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use super::auth::{AuthContext, AuthProvider, Credential};
use crate::{
    bson::{doc, Bson, Document, RawArrayBuf, RawBson, RawDocumentBuf},
    cmap::{Command, Connection, StreamDescription},
    compression::{self, Compressor},
    error::{Error, ErrorKind, Result, HANDSHAKE_ERROR, RETRYABLE_WRITE_ERROR},
    hello::{hello_command, run_hello, HelloReply},
    options::ServerApi,
};

/// The oldest wire version this crate can talk to (MongoDB 3.6).
pub(crate) const MIN_WIRE_VERSION: i32 = 6;

/// The newest wire version this crate knows about.
pub(crate) const MAX_WIRE_VERSION: i32 = 25;

/// Information about the client sent to the server in the `client` field of the handshake.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ClientMetadata {
    pub(crate) application: Option<AppMetadata>,
    pub(crate) driver: DriverMetadata,
    pub(crate) os: OsMetadata,
    pub(crate) platform: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct AppMetadata {
    pub(crate) name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DriverMetadata {
    pub(crate) name: String,
    pub(crate) version: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OsMetadata {
    pub(crate) os_type: String,
    pub(crate) architecture: String,
}

impl From<ClientMetadata> for Bson {
    fn from(metadata: ClientMetadata) -> Self {
        Bson::Document(metadata.to_document())
    }
}

impl ClientMetadata {
    /// The metadata this crate reports, naming `app_name` as the application if given.
    pub fn new(app_name: Option<String>) -> Self {
        let mut metadata = BASE_CLIENT_METADATA.clone();
        metadata.application = app_name.map(|name| AppMetadata { name });
        metadata
    }

    /// Appends the details of a library built on top of this one.
    pub fn append_driver_info(&mut self, driver_info: &DriverInfo) {
        self.driver.name.push('|');
        self.driver.name.push_str(&driver_info.name);

        if let Some(ref version) = driver_info.version {
            self.driver.version.push('|');
            self.driver.version.push_str(version);
        }

        if let (Some(platform), Some(extra)) = (self.platform.as_mut(), &driver_info.platform) {
            platform.push('|');
            platform.push_str(extra);
        }
    }

    /// The name of the application, if one was configured.
    pub fn application_name(&self) -> Option<&str> {
        self.application.as_ref().map(|app| app.name.as_str())
    }

    /// The document sent as the `client` field.
    pub fn to_document(&self) -> Document {
        let mut metadata_doc = Document::new();

        if let Some(ref application) = self.application {
            metadata_doc.insert("application", doc! { "name": application.name.clone() });
        }

        metadata_doc.insert(
            "driver",
            doc! {
                "name": self.driver.name.clone(),
                "version": self.driver.version.clone(),
            },
        );

        metadata_doc.insert(
            "os",
            doc! {
                "type": self.os.os_type.clone(),
                "architecture": self.os.architecture.clone(),
            },
        );

        if let Some(ref platform) = self.platform {
            metadata_doc.insert("platform", platform.clone());
        }

        metadata_doc
    }
}

/// Extra details identifying a library that wraps this one. Appended to the handshake metadata.
#[derive(Clone, Debug, Deserialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct DriverInfo {
    /// The name of the library.
    #[builder(!default)]
    pub name: String,

    /// The version of the library.
    pub version: Option<String>,

    /// Optional platform information for the library.
    pub platform: Option<String>,
}

/// Contains the basic handshake information that can be statically determined.
static BASE_CLIENT_METADATA: LazyLock<ClientMetadata> = LazyLock::new(|| ClientMetadata {
    application: None,
    driver: DriverMetadata {
        name: env!("CARGO_PKG_NAME").into(),
        version: env!("CARGO_PKG_VERSION").into(),
    },
    os: OsMetadata {
        os_type: std::env::consts::OS.into(),
        architecture: std::env::consts::ARCH.into(),
    },
    platform: Some(format!(
        "rustc {} with tokio",
        rustc_version_runtime::version()
    )),
});

/// Contains the logic needed to handshake a connection.
#[derive(Clone)]
#[derive_where(Debug)]
pub struct Handshaker {
    /// The hello command to send when handshaking. This will always be identical given the same
    /// options, so it is built once when the Handshaker is created.
    command: Command,

    compressors: Option<Vec<Compressor>>,

    credential: Option<Credential>,

    #[derive_where(skip)]
    auth_provider: Option<Arc<dyn AuthProvider>>,

    server_api: Option<ServerApi>,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: HandshakerOptions) -> Result<Self> {
        let mut metadata = options
            .metadata
            .unwrap_or_else(|| ClientMetadata::new(None));
        if let Some(app_name) = options.app_name {
            metadata.application = Some(AppMetadata { name: app_name });
        }
        if let Some(ref driver_info) = options.driver_info {
            metadata.append_driver_info(driver_info);
        }

        let mut command = hello_command(options.server_api.as_ref(), options.load_balanced);
        command.body.append(
            "client",
            RawDocumentBuf::from_document(&metadata.to_document())?,
        );

        if options.load_balanced {
            command.body.append("loadBalanced", true);
        }

        if let Some(ref compressors) = options.compressors {
            let mut names = RawArrayBuf::new();
            for compressor in compressors {
                compressor.validate()?;
                names.push(compressor.name());
            }
            command.body.append("compression", RawBson::Array(names));
        }

        if let Some(ref credential) = options.credential {
            credential.append_needed_mechanism_negotiation(&mut command.body);
            command.target_db = credential.resolved_source().to_string();
        }

        Ok(Self {
            command,
            compressors: options.compressors,
            credential: options.credential,
            auth_provider: options.auth_provider,
            server_api: options.server_api,
        })
    }

    /// Handshakes a connection: sends hello, checks the server can be talked to, records the
    /// stream description and authenticates. The connection is only marked established once all
    /// of that succeeded.
    pub(crate) async fn handshake(&self, conn: &mut Connection) -> Result<HelloReply> {
        let mut command = self.command.clone();

        if let (Some(credential), Some(provider)) = (&self.credential, &self.auth_provider) {
            if let Some(first) = provider.speculative_authenticate(credential)? {
                command
                    .body
                    .append("speculativeAuthenticate", RawDocumentBuf::from_document(&first)?);
            }
        }

        let hello_reply = run_hello(conn, command).await?;
        let mut description = StreamDescription::from_hello_reply(&hello_reply);
        verify_wire_version(&description)?;

        if let (Some(client), Some(server)) = (
            self.compressors.as_deref(),
            hello_reply.command_response.compressors.as_deref(),
        ) {
            description.compressor = compression::negotiate(client, server);
        }
        conn.compressor = description.compressor.clone();
        conn.server_id = hello_reply.command_response.connection_id;
        conn.stream_description = Some(description.clone());

        if let Some(ref credential) = self.credential {
            self.authenticate(conn, credential, &description, &hello_reply)
                .await
                .map_err(|error| label_auth_error(error, &description))?;
        }

        conn.established = true;
        Ok(hello_reply)
    }

    async fn authenticate(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        description: &StreamDescription,
        hello_reply: &HelloReply,
    ) -> Result<()> {
        let Some(ref provider) = self.auth_provider else {
            return Err(Error::authentication_error(
                credential.mechanism.as_deref().unwrap_or("default"),
                "a credential was configured without an auth provider",
            ));
        };

        let context = AuthContext {
            connection: conn,
            credential,
            stream_description: description,
            speculative_reply: hello_reply
                .command_response
                .speculative_authenticate
                .as_ref(),
            server_api: self.server_api.as_ref(),
        };
        provider.authenticate(context).await
    }
}

/// Tags an authentication failure so the executor can tell it happened during the handshake.
fn label_auth_error(mut error: Error, description: &StreamDescription) -> Error {
    error.add_label(HANDSHAKE_ERROR);
    let max_wire_version = description.max_wire_version.unwrap_or(0);
    if error.should_add_retryable_write_label(max_wire_version, Some(description.initial_server_type))
    {
        error.add_label(RETRYABLE_WRITE_ERROR);
    }
    error
}

/// Fails if the server's wire version range does not overlap the range this crate supports.
fn verify_wire_version(description: &StreamDescription) -> Result<()> {
    let address = &description.server_address;

    if let Some(server_min) = description.min_wire_version {
        if server_min > MAX_WIRE_VERSION {
            return Err(ErrorKind::IncompatibleServer {
                message: format!(
                    "Server at {address} requires wire version {server_min}, but this version of \
                     mongowire only supports up to {MAX_WIRE_VERSION}"
                ),
            }
            .into());
        }
    }

    let server_max = description.max_wire_version.unwrap_or(0);
    if server_max < MIN_WIRE_VERSION {
        return Err(ErrorKind::IncompatibleServer {
            message: format!(
                "Server at {address} reports wire version {server_max}, but this version of \
                 mongowire requires at least {MIN_WIRE_VERSION} (MongoDB 3.6)"
            ),
        }
        .into());
    }

    Ok(())
}

/// The handshake-related subset of the establisher's options.
#[derive(Clone, Default)]
#[derive_where(Debug)]
pub(crate) struct HandshakerOptions {
    pub(crate) app_name: Option<String>,
    pub(crate) metadata: Option<ClientMetadata>,
    pub(crate) driver_info: Option<DriverInfo>,
    pub(crate) compressors: Option<Vec<Compressor>>,
    pub(crate) credential: Option<Credential>,
    #[derive_where(skip)]
    pub(crate) auth_provider: Option<Arc<dyn AuthProvider>>,
    pub(crate) server_api: Option<ServerApi>,
    pub(crate) load_balanced: bool,
}
