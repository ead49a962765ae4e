mod command;
mod exhaust;
mod pooled;
mod stream_description;
pub mod wire;

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use derive_where::derive_where;
use serde::Serialize;
use tokio::{
    io::{AsyncWriteExt, BufStream},
    sync::{broadcast, mpsc, Mutex},
};

use self::wire::{MessageOptions, QueryOptions, ResponseMessage, WireFrame};
use crate::{
    bson::oid::ObjectId,
    cmap::{
        status::{InterruptSignal, PoolGenerationSubscriber},
        PoolGeneration,
    },
    compression::Compressor,
    error::{load_balanced_mode_mismatch, Error, ErrorKind, Result},
    event::cmap::{CmapEventEmitter, ConnectionCreatedEvent},
    options::ServerAddress,
    runtime::{self, AsyncStream},
};
pub(crate) use self::command::{CommandErrorBody, CommandResponse};
pub use self::{
    command::{Command, RawCommandResponse},
    exhaust::ExhaustStream,
    pooled::PooledConnection,
    stream_description::StreamDescription,
};

/// User-facing information about a connection to the database.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A driver-generated identifier that uniquely identifies the connection.
    pub id: u32,

    /// A server-generated identifier that uniquely identifies the connection. Available on server
    /// versions 4.2+. This may be used to correlate driver connections with server logs.
    pub server_id: Option<i64>,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// A wrapper around an established stream to a server.
///
/// A connection runs one command cycle at a time. Once any I/O on it fails, the error is recorded
/// and the stream is shut down; the connection is never used again.
#[derive_where(Debug)]
pub struct Connection {
    /// Driver-generated ID for the connection.
    pub(crate) id: u32,

    /// The server-side ID for this connection, reported in the handshake reply.
    pub(crate) server_id: Option<i64>,

    pub(crate) address: ServerAddress,

    pub(crate) time_created: Instant,

    /// The cached description of the server this connection is to. `None` until the handshake
    /// has completed.
    pub(crate) stream_description: Option<StreamDescription>,

    /// Set once the handshake and authentication have completed.
    pub(crate) established: bool,

    /// Marks the connection as having a command in flight. If the future running the command is
    /// dropped before it completes, this stays set and the pool closes the connection on
    /// check-in.
    command_executing: bool,

    /// Whether the last reply had the moreToCome flag set.
    more_to_come: bool,

    closed: bool,

    /// The first error encountered on this connection, if any.
    pub(crate) error: Option<Error>,

    /// Negotiated during the handshake; applied to every command that may be compressed.
    pub(crate) compressor: Option<Compressor>,

    /// Limit on each request and reply cycle. Expiry fails the connection.
    pub(crate) socket_timeout: Option<Duration>,

    /// Set for pooled connections; fires when a clear interrupts in-use connections of this
    /// connection's generation.
    pub(crate) interrupt_signal: Option<InterruptSignal>,

    #[derive_where(skip)]
    stream: BufStream<AsyncStream>,
}

impl Connection {
    /// Wraps an already connected stream. The handshake has not happened yet.
    pub(crate) fn new(
        address: ServerAddress,
        stream: AsyncStream,
        id: u32,
        time_created: Instant,
    ) -> Self {
        Self {
            id,
            server_id: None,
            address,
            time_created,
            stream_description: None,
            established: false,
            command_executing: false,
            more_to_come: false,
            closed: false,
            error: None,
            compressor: None,
            socket_timeout: None,
            interrupt_signal: None,
            stream: BufStream::new(stream),
        }
    }

    /// Moves everything into a new connection, leaving this one with a null stream.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
            time_created: self.time_created,
            stream_description: self.stream_description.take(),
            established: self.established,
            command_executing: self.command_executing,
            more_to_come: self.more_to_come,
            closed: self.closed,
            error: self.error.take(),
            compressor: self.compressor.take(),
            socket_timeout: self.socket_timeout,
            interrupt_signal: self.interrupt_signal.take(),
            stream: std::mem::replace(&mut self.stream, BufStream::new(AsyncStream::Null)),
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
        }
    }

    /// The address of the server this connection is to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The driver-generated ID of this connection.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Gets the connection's StreamDescription.
    pub fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "Stream checked out but not handshaked".to_string(),
            }
            .into()
        })
    }

    pub(crate) fn is_executing(&self) -> bool {
        self.command_executing
    }

    pub(crate) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the server may still send replies to the last request.
    pub(crate) fn is_streaming(&self) -> bool {
        self.more_to_come
    }

    /// Whether the stream has been shut down.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn max_message_size_bytes(&self) -> Option<i32> {
        self.stream_description
            .as_ref()
            .map(|sd| sd.max_message_size_bytes)
    }

    /// Encodes `command` the way this connection sends it: OP_QUERY for legacy framing, OP_MSG
    /// otherwise, wrapped in OP_COMPRESSED if a compressor was negotiated and the command allows
    /// it.
    fn encode_command(&self, command: Command, request_id: Option<i32>) -> Result<WireFrame> {
        let name = command.name.clone();
        let target_db = command.target_db.clone();
        let legacy_framing = command.legacy_framing;
        let exhaust_allowed = command.exhaust_allowed;
        let read_preference = command.read_preference().cloned();
        let document = command.into_document()?;

        let frame = if legacy_framing {
            let options = QueryOptions {
                read_preference,
                request_id,
                ..Default::default()
            };
            wire::encode_legacy_query(&target_db, &document, &options)?
        } else {
            let options = MessageOptions {
                exhaust_allowed,
                read_preference,
                request_id,
                ..Default::default()
            };
            wire::encode_modern_message(&target_db, &document, &options)?
        };

        match self.compressor {
            Some(ref compressor) if wire::can_compress(&name) => {
                wire::wrap_compressed(&frame, compressor)
            }
            _ => Ok(frame),
        }
    }

    /// Executes a `Command` and returns the server's reply. The reply is not checked for a
    /// command error.
    pub async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
    ) -> Result<RawCommandResponse> {
        let frame = self.encode_command(command, request_id.into())?;
        let response = self.send_message(frame).await?;
        self.into_raw_response(response)
    }

    /// Sends a command that allows the server to stream its replies. The returned stream yields
    /// the first reply and then every further reply the server pushes.
    pub async fn stream_command(&mut self, mut command: Command) -> Result<ExhaustStream<'_>> {
        command.set_exhaust_allowed(true);
        let frame = self.encode_command(command, None)?;
        let response = self.send_message(frame).await?;
        let previous_request_id = response.request_id();
        let more_to_come = response.more_to_come();
        let first = self.into_raw_response(response)?;
        Ok(ExhaustStream::new(
            self,
            first,
            more_to_come.then_some(previous_request_id),
        ))
    }

    /// Writes an encoded frame and reads the reply to it.
    pub async fn send_message(&mut self, frame: WireFrame) -> Result<ResponseMessage> {
        if self.more_to_come {
            return Err(Error::internal(format!(
                "attempted to send a new message to {} but moreToCome bit was set",
                self.address
            )));
        }
        self.ensure_open()?;

        self.command_executing = true;
        let request_id = frame.request_id();
        let max_message_size = self.max_message_size_bytes();
        let stream = &mut self.stream;
        let write_and_read = async {
            stream.write_all(frame.as_bytes()).await?;
            stream.flush().await?;
            wire::read_response(stream, max_message_size).await
        };
        let result = tokio::select! {
            biased;
            _ = interrupted(self.interrupt_signal.as_mut()) => Err(interruption_error()),
            result = with_socket_timeout(self.socket_timeout, write_and_read) => result,
        };
        let response = match result {
            Ok(response) => response,
            Err(error) => return Err(self.fail(error)),
        };

        if response.response_to() != request_id {
            return Err(self.fail(Error::invalid_response(format!(
                "expected a reply to request {request_id}, got a reply to {}",
                response.response_to()
            ))));
        }

        self.more_to_come = response.more_to_come();
        self.command_executing = false;
        Ok(response)
    }

    /// Reads a reply the server pushed without a new request. Only valid while the last reply
    /// had moreToCome set.
    pub(crate) async fn receive_message(&mut self) -> Result<ResponseMessage> {
        if !self.more_to_come {
            return Err(Error::internal(format!(
                "attempted to stream a reply from {} but moreToCome bit was not set",
                self.address
            )));
        }
        self.ensure_open()?;

        self.command_executing = true;
        let max_message_size = self.max_message_size_bytes();
        let read = wire::read_response(&mut self.stream, max_message_size);
        let result = tokio::select! {
            biased;
            _ = interrupted(self.interrupt_signal.as_mut()) => Err(interruption_error()),
            result = with_socket_timeout(self.socket_timeout, read) => result,
        };
        let response = match result {
            Ok(response) => response,
            Err(error) => return Err(self.fail(error)),
        };

        self.more_to_come = response.more_to_come();
        self.command_executing = false;
        Ok(response)
    }

    fn into_raw_response(&mut self, response: ResponseMessage) -> Result<RawCommandResponse> {
        match response.into_document() {
            Ok(document) => Ok(RawCommandResponse::new(self.address.clone(), document)),
            Err(error) => Err(self.fail(error)),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("connection {} to {} is closed", self.id, self.address),
            )
            .into());
        }
        Ok(())
    }

    /// Records the first error seen on this connection and shuts the stream down. Returns the
    /// error, tagged with the server's address.
    pub(crate) fn fail(&mut self, error: Error) -> Error {
        let error = error.with_address(self.address.clone());
        if self.error.is_none() {
            self.error = Some(error.clone());
        }
        self.destroy();
        error
    }

    /// Gracefully shuts the stream down.
    pub async fn close(&mut self) {
        if !self.closed {
            let _ = self.stream.shutdown().await;
        }
        self.destroy();
    }

    /// Drops the underlying stream. Calling this more than once has no further effect.
    pub fn destroy(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.more_to_come = false;
        self.stream = BufStream::new(AsyncStream::Null);
    }
}

/// Runs `io`, failing with a network timeout if it outlasts `timeout`.
async fn with_socket_timeout<T>(
    timeout: Option<Duration>,
    io: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(timeout) => runtime::timeout(timeout, io).await?,
        None => io.await,
    }
}

async fn interrupted(signal: Option<&mut InterruptSignal>) {
    match signal {
        Some(signal) => signal.interrupted().await,
        None => std::future::pending().await,
    }
}

fn interruption_error() -> Error {
    std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        "connection interrupted because its pool was cleared",
    )
    .into()
}

/// The generation of a checked-out connection, used to detect whether the pool has been cleared
/// since it was created.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ConnectionGeneration {
    Normal(u32),
    /// `None` until the handshake has reported the service ID.
    LoadBalanced(Option<LoadBalancedGeneration>),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LoadBalancedGeneration {
    pub(crate) generation: u32,
    pub(crate) service_id: ObjectId,
}

impl ConnectionGeneration {
    pub(crate) fn service_id(self) -> Option<ObjectId> {
        match self {
            ConnectionGeneration::Normal(_) => None,
            ConnectionGeneration::LoadBalanced(gen) => gen.map(|gen| gen.service_id),
        }
    }

    pub(crate) fn is_stale(self, current_generation: &PoolGeneration) -> bool {
        match (self, current_generation) {
            (ConnectionGeneration::Normal(cgen), PoolGeneration::Normal(pgen)) => cgen != *pgen,
            (
                ConnectionGeneration::LoadBalanced(Some(LoadBalancedGeneration {
                    generation,
                    service_id,
                })),
                PoolGeneration::LoadBalanced(gen_map),
            ) => generation != *gen_map.get(&service_id).unwrap_or(&0),
            _ => load_balanced_mode_mismatch!(false),
        }
    }
}

/// A connection that has been created by the pool but not yet handshaked.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: PoolGeneration,
    pub(crate) event_emitter: CmapEventEmitter,
    pub(crate) time_created: Instant,
    /// Fires when the pool closes, aborting the connect.
    pub(crate) cancellation_receiver: Option<broadcast::Receiver<()>>,
    /// Tracks the generations of clears that interrupt in-use connections.
    pub(crate) interrupt_subscriber: Option<PoolGenerationSubscriber>,
}

impl PendingConnection {
    pub(crate) fn created_event(&self) -> ConnectionCreatedEvent {
        ConnectionCreatedEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }
}

/// A handle to a connection bound to a session or cursor. While the handle lives, the pinned
/// connection returns to the handle instead of the pool whenever it is dropped; once every
/// replica of the handle is gone, it goes back to the pool.
#[derive(Debug)]
pub struct PinnedConnectionHandle {
    id: u32,
    receiver: Arc<Mutex<mpsc::Receiver<PooledConnection>>>,
}

impl PinnedConnectionHandle {
    /// Make a new `PinnedConnectionHandle` that refers to the same connection as this one.
    /// Use with care and only when "lending" a handle in a way that can't be expressed as a
    /// normal borrow.
    pub(crate) fn replicate(&self) -> Self {
        Self {
            id: self.id,
            receiver: self.receiver.clone(),
        }
    }

    /// Retrieve the pinned connection. Will fail if the connection has been unpinned or is still
    /// in use.
    pub(crate) async fn take_connection(&self) -> Result<PooledConnection> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.ok_or_else(|| {
            Error::internal(format!(
                "cannot take connection after unpin (id={})",
                self.id
            ))
        })
    }

    /// The driver-generated ID of the pinned connection.
    pub fn id(&self) -> u32 {
        self.id
    }
}
