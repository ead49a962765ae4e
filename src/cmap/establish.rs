pub(crate) mod auth;
pub(crate) mod handshake;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use derive_where::derive_where;
use typed_builder::TypedBuilder;

use self::handshake::{Handshaker, HandshakerOptions};
pub use self::{
    auth::{AuthContext, AuthProvider, Credential},
    handshake::{ClientMetadata, DriverInfo},
};
use super::{
    conn::{ConnectionGeneration, LoadBalancedGeneration, PendingConnection, PooledConnection},
    status::InterruptSignal,
    Connection,
    PoolGeneration,
};
use crate::{
    compression::Compressor,
    error::{Error, ErrorKind, Result},
    options::{ServerAddress, ServerApi, Socks5Proxy, Tls},
    runtime::{self, stream::DEFAULT_CONNECT_TIMEOUT, AsyncStream, TlsConfig},
};
#[cfg(test)]
use crate::cmap::StreamDescription;

/// Replaces connecting and handshaking in tests: given the address, yields the stream the
/// connection should use and the description it should report.
#[cfg(test)]
pub(crate) type TestEstablish = Arc<
    dyn Fn(&ServerAddress) -> futures_util::future::BoxFuture<'static, Result<(AsyncStream, StreamDescription)>>
        + Send
        + Sync,
>;

/// Options for opening and handshaking connections.
#[derive(Clone, Default, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct EstablisherOptions {
    /// The application name reported in the handshake metadata.
    pub app_name: Option<String>,

    /// Details of a library built on this one, appended to the handshake metadata.
    pub driver_info: Option<DriverInfo>,

    /// Whether to connect over TLS.
    pub tls: Option<Tls>,

    /// How long to wait for the socket to connect. Zero means no limit.
    ///
    /// The default is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// How long one request and reply cycle on an established connection may take before the
    /// connection is failed with a network timeout. Unset or zero means no limit.
    pub socket_timeout: Option<Duration>,

    /// A SOCKS5 proxy to route TCP connections through.
    pub socks5_proxy: Option<Socks5Proxy>,

    /// The compressors to offer the server, in order of preference.
    pub compressors: Option<Vec<Compressor>>,

    /// The declared server API.
    pub server_api: Option<ServerApi>,

    /// Whether the connections go through a load balancer.
    pub load_balanced: Option<bool>,

    /// The credential connections authenticate with.
    pub credential: Option<Credential>,

    /// Runs the authentication conversation for `credential`.
    #[derive_where(skip)]
    #[builder(setter(strip_option))]
    pub auth_provider: Option<Arc<dyn AuthProvider>>,

    #[cfg(test)]
    #[derive_where(skip)]
    #[builder(setter(skip))]
    pub(crate) test_establish: Option<TestEstablish>,
}

impl EstablisherOptions {
    fn handshaker_options(&self) -> HandshakerOptions {
        HandshakerOptions {
            app_name: self.app_name.clone(),
            metadata: None,
            driver_info: self.driver_info.clone(),
            compressors: self.compressors.clone(),
            credential: self.credential.clone(),
            auth_provider: self.auth_provider.clone(),
            server_api: self.server_api.clone(),
            load_balanced: self.load_balanced.unwrap_or(false),
        }
    }
}

/// Contains the logic to establish a connection, including handshaking, authenticating, and
/// potentially more.
#[derive(Clone)]
#[derive_where(Debug)]
pub struct ConnectionEstablisher {
    /// Contains the logic for handshaking a connection.
    handshaker: Handshaker,

    /// Cached configuration needed to create TLS connections, if needed.
    #[derive_where(skip)]
    tls_config: Option<TlsConfig>,

    connect_timeout: Duration,

    socket_timeout: Option<Duration>,

    proxy: Option<Socks5Proxy>,

    #[cfg(test)]
    #[derive_where(skip)]
    test_establish: Option<TestEstablish>,
}

impl ConnectionEstablisher {
    /// Creates a new ConnectionEstablisher from the given options.
    pub fn new(options: EstablisherOptions) -> Result<Self> {
        let handshaker = Handshaker::new(options.handshaker_options())?;

        let tls_config = match options.tls {
            Some(Tls::Enabled(ref tls_options)) => Some(TlsConfig::new(tls_options.clone())?),
            Some(Tls::Disabled) | None => None,
        };

        let connect_timeout = match options.connect_timeout {
            Some(d) if d.is_zero() => Duration::MAX,
            Some(d) => d,
            None => DEFAULT_CONNECT_TIMEOUT,
        };

        #[cfg(not(feature = "socks5-proxy"))]
        if options.socks5_proxy.is_some() {
            return Err(Error::invalid_argument(
                "a SOCKS5 proxy was configured but the socks5-proxy feature is disabled",
            ));
        }

        Ok(Self {
            handshaker,
            tls_config,
            connect_timeout,
            socket_timeout: options.socket_timeout.filter(|d| !d.is_zero()),
            proxy: options.socks5_proxy,
            #[cfg(test)]
            test_establish: options.test_establish,
        })
    }

    async fn make_stream(&self, address: ServerAddress) -> Result<AsyncStream> {
        runtime::timeout(
            self.connect_timeout,
            AsyncStream::connect(address, self.tls_config.as_ref(), self.proxy.as_ref()),
        )
        .await?
    }

    /// Opens and handshakes a connection for the pool. Closing the pool cancels both the connect
    /// and the handshake.
    pub(crate) async fn establish_connection(
        &self,
        mut pending_connection: PendingConnection,
    ) -> Result<PooledConnection> {
        let address = pending_connection.address.clone();
        let cancellation_receiver = pending_connection.cancellation_receiver.take();
        let establish = self.connect_and_handshake(pending_connection);

        match cancellation_receiver {
            Some(mut cancellation_receiver) => {
                tokio::select! {
                    result = establish => result,
                    _ = cancellation_receiver.recv() => {
                        Err(Error::pool_closed_error(&address))
                    }
                }
            }
            None => establish.await,
        }
    }

    async fn connect_and_handshake(
        &self,
        mut pending_connection: PendingConnection,
    ) -> Result<PooledConnection> {
        let pool_gen = pending_connection.generation.clone();
        let address = pending_connection.address.clone();
        let interrupt_subscriber = pending_connection.interrupt_subscriber.take();

        #[cfg(test)]
        if let Some(ref establish) = self.test_establish {
            let (stream, mut description) = establish(&address).await?;
            description.server_address = address;
            let mut connection = PooledConnection::new(pending_connection, stream);
            connection.socket_timeout = self.socket_timeout;
            connection.compressor = description.compressor.clone();
            connection.stream_description = Some(description);
            connection.established = true;
            let mut connection = assign_generation(connection, &pool_gen, &Ok(()))?;
            if let Some(subscriber) = interrupt_subscriber {
                connection.interrupt_signal =
                    Some(InterruptSignal::new(subscriber, connection.generation));
            }
            return Ok(connection);
        }

        let stream = self.make_stream(address).await?;

        let mut connection = PooledConnection::new(pending_connection, stream);
        connection.socket_timeout = self.socket_timeout;
        let handshake_result = self.handshaker.handshake(&mut connection).await.map(drop);

        let mut connection = assign_generation(connection, &pool_gen, &handshake_result)?;

        if let Err(error) = handshake_result {
            connection.destroy();
            return Err(error);
        }

        if let Some(subscriber) = interrupt_subscriber {
            connection.interrupt_signal =
                Some(InterruptSignal::new(subscriber, connection.generation));
        }
        Ok(connection)
    }

    /// Opens and handshakes a connection that does not belong to any pool.
    pub async fn establish_standalone(
        &self,
        address: ServerAddress,
        id: u32,
    ) -> Result<Connection> {
        let stream = self.make_stream(address.clone()).await?;
        let mut connection = Connection::new(address, stream, id, Instant::now());
        connection.socket_timeout = self.socket_timeout;
        if let Err(error) = self.handshaker.handshake(&mut connection).await {
            connection.destroy();
            return Err(error);
        }
        Ok(connection)
    }
}

/// If the handshake response had a `serviceId` field, this is a connection to a load balancer and
/// must derive its generation from the per-service generation map.
fn assign_generation(
    mut connection: PooledConnection,
    pool_gen: &PoolGeneration,
    handshake_result: &Result<()>,
) -> Result<PooledConnection> {
    match (pool_gen, connection.service_id()) {
        (PoolGeneration::Normal(_), _) => {}
        (PoolGeneration::LoadBalanced(gen_map), Some(service_id)) => {
            connection.generation = ConnectionGeneration::LoadBalanced(Some(LoadBalancedGeneration {
                generation: *gen_map.get(&service_id).unwrap_or(&0),
                service_id,
            }));
        }
        (PoolGeneration::LoadBalanced(_), None) => {
            // A failed handshake reports its own error instead.
            if handshake_result.is_ok() {
                connection.destroy();
                return Err(ErrorKind::IncompatibleServer {
                    message: "Attempted to initialize in load balancing mode, but the server \
                              does not support this mode."
                        .to_string(),
                }
                .into());
            }
        }
    }
    Ok(connection)
}
