mod acknowledged_message;
mod join_handle;
pub(crate) mod stream;
mod sync_read_ext;
#[cfg(feature = "rustls-tls")]
mod tls_rustls;
mod worker_handle;

use std::{future::Future, net::SocketAddr, time::Duration};

pub(crate) use self::{
    acknowledged_message::AcknowledgedMessage,
    join_handle::AsyncJoinHandle,
    stream::AsyncStream,
    sync_read_ext::SyncLittleEndianRead,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::{error::Result, options::ServerAddress};
#[cfg(feature = "rustls-tls")]
use tls_rustls as tls;

#[cfg(feature = "rustls-tls")]
pub(crate) use tls::TlsConfig;

/// Stand-in used when no TLS backend is compiled in; it can never be constructed.
#[cfg(not(feature = "rustls-tls"))]
#[derive(Clone, Debug)]
pub(crate) enum TlsConfig {}

#[cfg(not(feature = "rustls-tls"))]
impl TlsConfig {
    pub(crate) fn new(_options: crate::options::TlsOptions) -> Result<Self> {
        Err(crate::error::ErrorKind::InvalidTlsConfig {
            message: "TLS requested but the rustls-tls feature is disabled".to_string(),
        }
        .into())
    }
}

/// Spawn a task in the background to run a future.
///
/// This must be called from an async block or function running on a runtime.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Spawn a task in the background to run a future, discarding its result.
pub(crate) fn execute<F, O>(fut: F)
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    spawn(fut);
}

/// Delay for the specified duration.
pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| std::io::ErrorKind::TimedOut.into())
}

pub(crate) async fn resolve_address(
    address: &ServerAddress,
) -> Result<impl Iterator<Item = SocketAddr>> {
    let socket_addrs = tokio::net::lookup_host(format!("{address}")).await?;
    Ok(socket_addrs)
}
