//! Encoding and decoding of wire protocol frames.
//!
//! Everything here is a pure transformation between documents and bytes, except
//! [`read_response`], which pulls one frame off a stream before handing it to
//! [`decode_response`].

mod header;
mod message;
mod query;
mod reply;
#[cfg(test)]
mod test;
mod util;

use tokio::io::{AsyncRead, AsyncReadExt};

pub use self::{
    header::{Header, OpCode},
    message::{Message, MessageFlags},
    query::{Query, QueryFlags, QueryOptions},
    reply::{Reply, ResponseFlags},
    util::next_request_id,
};
use crate::{
    bson::{Document, RawBson, RawDocument, RawDocumentBuf},
    compression::{decompress_message, Compressor, CompressorId},
    error::{Error, Result},
    options::ReadPreference,
    runtime::SyncLittleEndianRead,
};

/// Replies larger than this are rejected unless the handshake reported a different limit.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// Size of the OP_COMPRESSED fields preceding the compressed payload.
const COMPRESSED_PREAMBLE_LENGTH: usize = 9;

/// Commands whose frames are never compressed.
const UNCOMPRESSIBLE_COMMANDS: [&str; 11] = [
    "hello",
    "ismaster",
    "saslstart",
    "saslcontinue",
    "getnonce",
    "authenticate",
    "createuser",
    "updateuser",
    "copydbsaslstart",
    "copydbgetnonce",
    "copydb",
];

/// Whether a command with the given name may be sent inside a compression envelope.
pub fn can_compress(command_name: &str) -> bool {
    let name = command_name.to_ascii_lowercase();
    !UNCOMPRESSIBLE_COMMANDS.contains(&name.as_str())
}

/// A fully encoded frame, header included.
#[derive(Clone, Debug)]
pub struct WireFrame {
    pub(crate) header: Header,
    pub(crate) bytes: Vec<u8>,
}

impl WireFrame {
    /// The header written at the start of the frame.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The request ID replies to this frame will reference.
    pub fn request_id(&self) -> i32 {
        self.header.request_id
    }

    /// The encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn body(&self) -> &[u8] {
        &self.bytes[Header::LENGTH..]
    }
}

/// Options for encoding an OP_MSG frame.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct MessageOptions {
    /// Allow the server to answer with a stream of replies.
    pub exhaust_allowed: bool,
    /// The server will not reply to this message.
    pub more_to_come: bool,
    /// Sent as `$readPreference`.
    pub read_preference: Option<ReadPreference>,
    /// The request ID to use. A fresh one is drawn when unset.
    pub request_id: Option<i32>,
}

/// Builds an OP_QUERY frame sending `document` to `database`.
pub fn encode_legacy_query(
    database: &str,
    document: &RawDocument,
    options: &QueryOptions,
) -> Result<WireFrame> {
    let request_id = options.request_id.unwrap_or_else(next_request_id);
    Query::new(database, Document::try_from(document)?, options, request_id).encode()
}

/// Builds an OP_MSG frame with a single body section holding `document`, with `$db` and
/// `$readPreference` added.
pub fn encode_modern_message(
    database: &str,
    document: &RawDocument,
    options: &MessageOptions,
) -> Result<WireFrame> {
    let mut payload = document.to_raw_document_buf();
    if payload.get("$db")?.is_none() {
        payload.append("$db", database);
    }
    if let Some(ref read_pref) = options.read_preference {
        if payload.get("$readPreference")?.is_none() {
            payload.append(
                "$readPreference",
                RawBson::Document(RawDocumentBuf::from_document(&read_pref.to_document())?),
            );
        }
    }

    let mut flags = MessageFlags::empty();
    if options.exhaust_allowed {
        flags |= MessageFlags::EXHAUST_ALLOWED;
    }
    if options.more_to_come {
        flags |= MessageFlags::MORE_TO_COME;
    }

    let request_id = options.request_id.unwrap_or_else(next_request_id);
    Message::new(payload, flags, request_id).encode()
}

/// Re-frames `frame` inside an OP_COMPRESSED envelope. The request ID and the original opcode are
/// preserved.
pub fn wrap_compressed(frame: &WireFrame, compressor: &Compressor) -> Result<WireFrame> {
    let uncompressed = frame.body();
    let compressed = compressor.compress(uncompressed)?;

    let total_length = Header::LENGTH + COMPRESSED_PREAMBLE_LENGTH + compressed.len();
    let header = Header {
        length: util::frame_length(total_length)?,
        request_id: frame.header.request_id,
        response_to: frame.header.response_to,
        op_code: OpCode::Compressed,
    };

    let mut bytes = Vec::with_capacity(total_length);
    header.write_into(&mut bytes);
    bytes.extend_from_slice(&(frame.header.op_code as i32).to_le_bytes());
    bytes.extend_from_slice(&util::frame_length(uncompressed.len())?.to_le_bytes());
    bytes.push(compressor.id() as u8);
    bytes.extend_from_slice(&compressed);

    Ok(WireFrame { header, bytes })
}

/// A decoded reply from the server.
#[derive(Clone, Debug)]
pub enum ResponseMessage {
    /// An OP_MSG reply.
    Message(Message),
    /// A legacy OP_REPLY.
    Reply(Reply),
}

impl ResponseMessage {
    /// The request this reply answers.
    pub fn response_to(&self) -> i32 {
        match self {
            Self::Message(m) => m.response_to(),
            Self::Reply(r) => r.response_to(),
        }
    }

    /// The ID the server assigned to this reply. The next reply of an exhaust stream answers it.
    pub fn request_id(&self) -> i32 {
        match self {
            Self::Message(m) => m.request_id(),
            Self::Reply(r) => r.request_id(),
        }
    }

    /// Whether the server will keep sending replies without further requests. Always false for
    /// legacy replies.
    pub fn more_to_come(&self) -> bool {
        match self {
            Self::Message(m) => m.more_to_come(),
            Self::Reply(_) => false,
        }
    }

    /// The reply document: the body section of an OP_MSG, or the first document of an OP_REPLY.
    pub fn into_document(self) -> Result<RawDocumentBuf> {
        match self {
            Self::Message(m) => Ok(m.document_payload),
            Self::Reply(r) => r
                .documents
                .into_iter()
                .next()
                .ok_or_else(|| Error::invalid_response("OP_REPLY contained no documents")),
        }
    }
}

/// Decodes the body of a reply frame described by `header`, unwrapping compression first.
pub fn decode_response(header: &Header, body: &[u8]) -> Result<ResponseMessage> {
    match header.op_code {
        OpCode::Message => Ok(ResponseMessage::Message(Message::decode(header, body)?)),
        OpCode::Reply => Ok(ResponseMessage::Reply(Reply::decode(header, body)?)),
        OpCode::Compressed => {
            let (inner, decompressed) = unwrap_compressed(header, body)?;
            decode_response(&inner, &decompressed)
        }
        OpCode::Query => Err(Error::invalid_response(
            "received an OP_QUERY where a reply was expected",
        )),
    }
}

/// Decompresses an OP_COMPRESSED body, returning the header and body of the original frame.
fn unwrap_compressed(header: &Header, mut body: &[u8]) -> Result<(Header, Vec<u8>)> {
    let original_op_code = OpCode::from_i32(body.read_i32_sync()?)?;
    let uncompressed_size = body.read_i32_sync()?;
    let compressor_id = CompressorId::from_u8(body.read_u8_sync()?)?;

    if original_op_code == OpCode::Compressed {
        return Err(Error::invalid_response(
            "compressed message wraps another compressed message",
        ));
    }

    let decompressed = decompress_message(body, compressor_id)?;
    if usize::try_from(uncompressed_size).ok() != Some(decompressed.len()) {
        return Err(Error::invalid_response(format!(
            "The server's message claims that the uncompressed length is {uncompressed_size}, \
             but was computed to be {}.",
            decompressed.len(),
        )));
    }

    let inner = Header {
        length: util::frame_length(Header::LENGTH + decompressed.len())?,
        op_code: original_op_code,
        ..header.clone()
    };
    Ok((inner, decompressed))
}

/// Decodes a whole frame, header included. Requests as well as replies are accepted, which makes
/// this the inverse of the encoders above. For compressed frames the returned header is that of
/// the original message.
pub fn decode_frame(bytes: &[u8]) -> Result<(Header, DecodedFrame)> {
    let header = Header::parse(bytes)?;
    let body_len = header.body_length()?;
    let body = bytes
        .get(Header::LENGTH..Header::LENGTH + body_len)
        .ok_or_else(|| Error::invalid_response("frame is shorter than its declared length"))?;

    let (header, body) = match header.op_code {
        OpCode::Compressed => unwrap_compressed(&header, body)?,
        _ => (header, body.to_vec()),
    };
    let decoded = match header.op_code {
        OpCode::Query => DecodedFrame::Query(Query::decode(&header, &body)?),
        _ => DecodedFrame::Response(decode_response(&header, &body)?),
    };
    Ok((header, decoded))
}

/// The result of [`decode_frame`].
#[derive(Clone, Debug)]
pub enum DecodedFrame {
    /// A legacy query.
    Query(Query),
    /// Any other message.
    Response(ResponseMessage),
}

/// Reads one reply frame from `reader`, rejecting frames above `max_message_size_bytes`.
pub(crate) async fn read_response<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    max_message_size_bytes: Option<i32>,
) -> Result<ResponseMessage> {
    let header = Header::read_from(reader).await?;
    let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
    if header.length > max_len {
        return Err(Error::invalid_response(format!(
            "Message length {} over maximum {max_len}",
            header.length
        )));
    }

    let mut body = vec![0u8; header.body_length()?];
    reader.read_exact(&mut body).await?;
    decode_response(&header, &body)
}
