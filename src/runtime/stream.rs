use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    error::{Error, ErrorKind, Result},
    options::{ServerAddress, Socks5Proxy},
    runtime,
};

#[cfg(feature = "rustls-tls")]
use super::tls::{tls_connect, TlsStream};
use super::TlsConfig;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(not(target_os = "wasi"))]
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);
const CONNECTION_ATTEMPT_DELAY: Duration = Duration::from_millis(250);
#[cfg(feature = "socks5-proxy")]
const DEFAULT_PROXY_PORT: u16 = 1080;

/// The transport underneath a connection.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// A stream that has been shut down. Reads see EOF and writes accept nothing.
    Null,

    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    #[cfg(feature = "rustls-tls")]
    Tls(TlsStream<TcpStream>),

    /// A Unix domain socket connection.
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),

    /// A connection through a SOCKS5 proxy.
    #[cfg(feature = "socks5-proxy")]
    Socks5(fast_socks5::client::Socks5Stream<TcpStream>),

    /// A TLS connection through a SOCKS5 proxy.
    #[cfg(all(feature = "socks5-proxy", feature = "rustls-tls"))]
    Socks5Tls(TlsStream<fast_socks5::client::Socks5Stream<TcpStream>>),

    /// An in-memory pipe standing in for a server.
    #[cfg(test)]
    Duplex(tokio::io::DuplexStream),
}

#[cfg(feature = "socks5-proxy")]
impl Socks5Proxy {
    async fn connect(
        &self,
        host: String,
        port: Option<u16>,
    ) -> Result<fast_socks5::client::Socks5Stream<TcpStream>> {
        use crate::options::DEFAULT_PORT;
        use fast_socks5::{
            client::{Config, Socks5Stream},
            SocksError,
        };

        let proxy_address = format!(
            "{}:{}",
            self.host,
            self.port.unwrap_or(DEFAULT_PROXY_PORT)
        );
        let port = port.unwrap_or(DEFAULT_PORT);

        let stream = match self.authentication {
            Some((ref username, ref password)) => {
                Socks5Stream::connect_with_password(
                    proxy_address,
                    host,
                    port,
                    username.clone(),
                    password.clone(),
                    Config::default(),
                )
                .await
            }
            None => Socks5Stream::connect(proxy_address, host, port, Config::default()).await,
        }
        .map_err(|error| match error {
            SocksError::Io(io_error) => ErrorKind::from(io_error),
            other => ErrorKind::ProxyConnect {
                message: other.to_string(),
            },
        })?;
        Ok(stream)
    }
}

impl AsyncStream {
    pub(crate) async fn connect(
        address: ServerAddress,
        tls_cfg: Option<&TlsConfig>,
        #[allow(unused)] proxy: Option<&Socks5Proxy>,
    ) -> Result<Self> {
        match &address {
            #[allow(unused)]
            ServerAddress::Tcp { host, port } => {
                #[cfg(feature = "socks5-proxy")]
                if let Some(proxy) = proxy {
                    let inner = proxy.connect(host.clone(), *port).await?;
                    return match tls_cfg {
                        #[cfg(feature = "rustls-tls")]
                        Some(cfg) => {
                            Ok(AsyncStream::Socks5Tls(tls_connect(host, inner, cfg).await?))
                        }
                        #[cfg(not(feature = "rustls-tls"))]
                        Some(cfg) => match *cfg {},
                        None => Ok(AsyncStream::Socks5(inner)),
                    };
                }

                let resolved: Vec<_> = runtime::resolve_address(&address).await?.collect();
                if resolved.is_empty() {
                    return Err(ErrorKind::DnsResolve {
                        message: format!("No DNS results for domain {address}"),
                    }
                    .into());
                }
                let tcp_stream = tcp_connect(resolved).await?;

                match tls_cfg {
                    #[cfg(feature = "rustls-tls")]
                    Some(cfg) => Ok(AsyncStream::Tls(tls_connect(host, tcp_stream, cfg).await?)),
                    #[cfg(not(feature = "rustls-tls"))]
                    Some(cfg) => match *cfg {},
                    None => Ok(AsyncStream::Tcp(tcp_stream)),
                }
            }
            #[cfg(unix)]
            ServerAddress::Unix { path } => Ok(AsyncStream::Unix(
                tokio::net::UnixStream::connect(path.as_path()).await?,
            )),
        }
    }
}

async fn tcp_try_connect(address: &SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;

    #[cfg(not(target_os = "wasi"))]
    {
        let sock_ref = socket2::SockRef::from(&stream);
        let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        sock_ref.set_tcp_keepalive(&conf)?;
    }

    Ok(stream)
}

/// Races connection attempts across the resolved addresses, starting a new attempt every
/// `CONNECTION_ATTEMPT_DELAY` and alternating between IPv6 and IPv4, IPv6 first.
pub(crate) async fn tcp_connect(resolved: Vec<SocketAddr>) -> Result<TcpStream> {
    let (addrs_v6, addrs_v4): (Vec<_>, Vec<_>) = resolved
        .into_iter()
        .partition(|a| matches!(a, SocketAddr::V6(_)));
    let socket_addrs = interleave(addrs_v6, addrs_v4);

    fn handle_join(
        result: std::result::Result<Result<TcpStream>, tokio::task::JoinError>,
    ) -> Result<TcpStream> {
        result.unwrap_or_else(|e| Err(Error::internal(format!("TCP connect task failure: {e}"))))
    }

    let mut attempts = tokio::task::JoinSet::new();
    let mut connect_error = None;
    'spawn: for a in socket_addrs {
        attempts.spawn(async move { tcp_try_connect(&a).await });
        let sleep = tokio::time::sleep(CONNECTION_ATTEMPT_DELAY);
        tokio::pin!(sleep);
        while !attempts.is_empty() {
            tokio::select! {
                biased;
                connect_res = attempts.join_next() => {
                    match connect_res.map(handle_join) {
                        None => return Err(Error::internal("empty TCP connect task set")),
                        // Remaining attempts are cancelled when the set is dropped.
                        Some(Ok(cnx)) => return Ok(cnx),
                        Some(Err(e)) => {
                            connect_error.get_or_insert(e);
                        },
                    }
                }
                _ = &mut sleep => continue 'spawn
            }
        }
    }

    while let Some(result) = attempts.join_next().await {
        match handle_join(result) {
            Ok(cnx) => return Ok(cnx),
            Err(e) => {
                connect_error.get_or_insert(e);
            }
        }
    }

    Err(connect_error.unwrap_or_else(|| {
        Error::internal("connecting to all DNS results failed but no error reported")
    }))
}

fn interleave<T>(left: Vec<T>, right: Vec<T>) -> Vec<T> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let (mut left, mut right) = (left.into_iter(), right.into_iter());
    while let Some(a) = left.next() {
        out.push(a);
        std::mem::swap(&mut left, &mut right);
    }
    out.extend(right);
    out
}

/// Forwards a poll call to whichever transport backs the stream.
macro_rules! with_inner {
    ($stream:expr, $inner:ident => $call:expr, $null:expr) => {
        match $stream {
            AsyncStream::Null => $null,
            AsyncStream::Tcp($inner) => $call,
            #[cfg(feature = "rustls-tls")]
            AsyncStream::Tls($inner) => $call,
            #[cfg(unix)]
            AsyncStream::Unix($inner) => $call,
            #[cfg(feature = "socks5-proxy")]
            AsyncStream::Socks5($inner) => $call,
            #[cfg(all(feature = "socks5-proxy", feature = "rustls-tls"))]
            AsyncStream::Socks5Tls($inner) => $call,
            #[cfg(test)]
            AsyncStream::Duplex($inner) => $call,
        }
    };
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        with_inner!(self.get_mut(), inner => Pin::new(inner).poll_read(cx, buf), Poll::Ready(Ok(())))
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        with_inner!(self.get_mut(), inner => Pin::new(inner).poll_write(cx, buf), Poll::Ready(Ok(0)))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        with_inner!(self.get_mut(), inner => Pin::new(inner).poll_flush(cx), Poll::Ready(Ok(())))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        with_inner!(self.get_mut(), inner => Pin::new(inner).poll_shutdown(cx), Poll::Ready(Ok(())))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        with_inner!(
            self.get_mut(),
            inner => Pin::new(inner).poll_write_vectored(cx, bufs),
            Poll::Ready(Ok(0))
        )
    }

    fn is_write_vectored(&self) -> bool {
        with_inner!(self, inner => inner.is_write_vectored(), false)
    }
}
