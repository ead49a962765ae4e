//! In-memory stand-ins for a server, used by unit tests across the crate.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    bson::{doc, Document, RawDocumentBuf},
    cmap::{
        conn::wire::{
            decode_frame,
            next_request_id,
            DecodedFrame,
            Header,
            Message,
            MessageFlags,
            OpCode,
            ResponseMessage,
        },
        Connection,
        StreamDescription,
    },
    error::Result,
    event::{cmap::CmapEvent, command::CommandEvent, EventHandler},
    options::ServerAddress,
    runtime::{self, AsyncStream},
};

/// A request as the fake server saw it.
#[derive(Clone, Debug)]
pub(crate) struct ReceivedRequest {
    pub(crate) request_id: i32,
    /// The opcode of the message, after unwrapping any compression envelope.
    pub(crate) op_code: OpCode,
    /// Whether the message arrived inside an OP_COMPRESSED envelope.
    pub(crate) compressed: bool,
    pub(crate) command: Document,
    pub(crate) exhaust_allowed: bool,
}

pub(crate) trait ServerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ServerStream for T {}

/// The server half of a connection, scripted by the test.
pub(crate) struct FakeServer {
    stream: Box<dyn ServerStream>,
}

/// Returns a connected client stream and the fake server on the other end of it.
pub(crate) fn duplex() -> (AsyncStream, FakeServer) {
    let (client, server) = tokio::io::duplex(1024 * 1024);
    (AsyncStream::Duplex(client), FakeServer::new(server))
}

/// A connection to a fake server that has skipped the handshake.
pub(crate) fn connected_pair() -> (Connection, FakeServer) {
    let (stream, server) = duplex();
    let address = ServerAddress::default();
    let mut connection = Connection::new(address.clone(), stream, 1, Instant::now());
    let mut description = StreamDescription::new_testing();
    description.server_address = address;
    connection.stream_description = Some(description);
    connection.established = true;
    (connection, server)
}

impl FakeServer {
    pub(crate) fn new(stream: impl ServerStream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
        }
    }

    /// Reads the next request. Returns `None` once the client has gone away.
    pub(crate) async fn receive(&mut self) -> Option<ReceivedRequest> {
        let mut header_bytes = [0u8; 16];
        self.stream.read_exact(&mut header_bytes).await.ok()?;
        let length = i32::from_le_bytes(header_bytes[0..4].try_into().ok()?) as usize;
        let outer_op_code = i32::from_le_bytes(header_bytes[12..16].try_into().ok()?);

        let mut bytes = header_bytes.to_vec();
        bytes.resize(length, 0);
        self.stream.read_exact(&mut bytes[16..]).await.ok()?;

        let (header, frame) = decode_frame(&bytes).ok()?;
        let (command, exhaust_allowed) = match frame {
            DecodedFrame::Query(query) => (query.query, false),
            DecodedFrame::Response(ResponseMessage::Message(message)) => (
                message.document_payload.to_document().ok()?,
                message.flags.contains(MessageFlags::EXHAUST_ALLOWED),
            ),
            DecodedFrame::Response(ResponseMessage::Reply(_)) => return None,
        };

        Some(ReceivedRequest {
            request_id: header.request_id,
            op_code: header.op_code,
            compressed: outer_op_code == OpCode::Compressed as i32,
            command,
            exhaust_allowed,
        })
    }

    /// Sends an OP_MSG reply. Returns the reply's own request ID.
    pub(crate) async fn reply(&mut self, response_to: i32, document: Document) -> i32 {
        self.reply_with_flags(response_to, document, false).await
    }

    /// Sends an OP_MSG reply, optionally announcing that more replies follow.
    pub(crate) async fn reply_with_flags(
        &mut self,
        response_to: i32,
        document: Document,
        more_to_come: bool,
    ) -> i32 {
        let flags = if more_to_come {
            MessageFlags::MORE_TO_COME
        } else {
            MessageFlags::empty()
        };
        let request_id = next_request_id();
        let mut message = Message::new(
            RawDocumentBuf::from_document(&document).unwrap(),
            flags,
            request_id,
        );
        message.response_to = response_to;
        let frame = message.encode().unwrap();
        self.stream.write_all(frame.as_bytes()).await.unwrap();
        request_id
    }

    /// Sends a legacy OP_REPLY holding `document`.
    pub(crate) async fn reply_legacy(&mut self, response_to: i32, document: Document) {
        let document = bson_bytes(&document);
        let length = (Header::LENGTH + 20 + document.len()) as i32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes.extend_from_slice(&next_request_id().to_le_bytes());
        bytes.extend_from_slice(&response_to.to_le_bytes());
        bytes.extend_from_slice(&(OpCode::Reply as i32).to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0i64.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&document);
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Answers a handshake with `hello_reply`, using the framing the request came in.
    pub(crate) async fn answer(&mut self, request: &ReceivedRequest, document: Document) {
        if request.op_code == OpCode::Query {
            self.reply_legacy(request.request_id, document).await;
        } else {
            self.reply(request.request_id, document).await;
        }
    }

    /// Writes raw bytes, e.g. a malformed frame.
    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }
}

fn bson_bytes(document: &Document) -> Vec<u8> {
    let mut bytes = Vec::new();
    document.to_writer(&mut bytes).unwrap();
    bytes
}

/// A hello reply from a 4.2 replica set primary.
pub(crate) fn hello_reply() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "setName": "rs",
        "minWireVersion": 0,
        "maxWireVersion": 8,
        "logicalSessionTimeoutMinutes": 30,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "maxMessageSizeBytes": 48_000_000,
        "connectionId": 42i64,
    }
}

/// What a scripted server does with a request.
#[derive(Clone, Debug)]
pub(crate) enum ServerAction {
    Reply(Document),
    /// Drop the connection without answering.
    Hangup,
}

/// Every request a scripted server has received, in order.
pub(crate) type RequestLog = Arc<Mutex<Vec<Document>>>;

/// Serves `server` until the client hangs up, answering each request with `respond`.
pub(crate) fn serve(
    mut server: FakeServer,
    log: RequestLog,
    respond: impl Fn(&Document) -> ServerAction + Send + Sync + 'static,
) {
    runtime::execute(async move {
        while let Some(request) = server.receive().await {
            log.lock().unwrap().push(request.command.clone());
            match respond(&request.command) {
                ServerAction::Reply(reply) => server.answer(&request, reply).await,
                ServerAction::Hangup => return,
            }
        }
    });
}

/// Collects CMAP events delivered through a callback handler.
#[derive(Clone, Default)]
pub(crate) struct CmapEventBuffer {
    events: Arc<Mutex<Vec<CmapEvent>>>,
}

impl CmapEventBuffer {
    pub(crate) fn handler(&self) -> EventHandler<CmapEvent> {
        let events = self.events.clone();
        EventHandler::callback(move |event| events.lock().unwrap().push(event))
    }

    pub(crate) fn all(&self) -> Vec<CmapEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Polls until `predicate` matches `count` events or `timeout` elapses.
    pub(crate) async fn wait_for(
        &self,
        count: usize,
        timeout: Duration,
        predicate: impl Fn(&CmapEvent) -> bool,
    ) -> Vec<CmapEvent> {
        let start = Instant::now();
        loop {
            let matching: Vec<_> = self.all().into_iter().filter(|e| predicate(e)).collect();
            if matching.len() >= count || start.elapsed() > timeout {
                return matching;
            }
            runtime::delay_for(Duration::from_millis(5)).await;
        }
    }
}

/// Collects command events delivered through a callback handler.
#[derive(Clone, Default)]
pub(crate) struct CommandEventBuffer {
    events: Arc<Mutex<Vec<CommandEvent>>>,
}

impl CommandEventBuffer {
    pub(crate) fn handler(&self) -> EventHandler<CommandEvent> {
        let events = self.events.clone();
        EventHandler::callback(move |event| events.lock().unwrap().push(event))
    }

    pub(crate) fn all(&self) -> Vec<CommandEvent> {
        self.events.lock().unwrap().clone()
    }
}

/// Fails the test if `result` is not an error.
pub(crate) fn expect_err<T: std::fmt::Debug>(result: Result<T>) -> crate::error::Error {
    match result {
        Ok(value) => panic!("expected an error, got {value:?}"),
        Err(error) => error,
    }
}
