use bitflags::bitflags;

use super::{
    header::{Header, OpCode},
    util::frame_length,
    WireFrame,
};
use crate::{
    bson::{Document, RawDocument, RawDocumentBuf},
    bson_util,
    error::{Error, ErrorKind, Result},
    runtime::SyncLittleEndianRead,
};

/// Represents an OP_MSG wire protocol operation carrying a single body section.
#[derive(Clone, Debug)]
pub struct Message {
    /// The payload type 0 section.
    pub document_payload: RawDocumentBuf,
    pub(crate) response_to: i32,
    pub(crate) request_id: i32,
    /// Flag bits of the message.
    pub flags: MessageFlags,
    pub(crate) checksum: Option<u32>,
}

impl Message {
    pub(crate) fn new(document_payload: RawDocumentBuf, flags: MessageFlags, request_id: i32) -> Self {
        Self {
            document_payload,
            response_to: 0,
            request_id,
            flags,
            checksum: None,
        }
    }

    /// Whether the server will send another reply without waiting for a request.
    pub fn more_to_come(&self) -> bool {
        self.flags.contains(MessageFlags::MORE_TO_COME)
    }

    /// The request this message answers.
    pub fn response_to(&self) -> i32 {
        self.response_to
    }

    /// The ID of this message.
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    /// Gets this message's body as a Document. If parsing fails, returns a document containing
    /// the error.
    pub(crate) fn get_command_document(&self) -> Document {
        match self.document_payload.to_document() {
            Ok(document) => document,
            Err(error) => crate::bson::doc! { "serialization error": error.to_string() },
        }
    }

    /// Parses the body of an OP_MSG frame, i.e. everything after the header.
    pub(crate) fn decode(header: &Header, mut body: &[u8]) -> Result<Self> {
        let flags = MessageFlags::from_bits_truncate(body.read_u32_sync()?);

        // Trailing checksum bytes are not part of any section.
        let sections_end = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            body.len().checked_sub(4).ok_or_else(|| {
                Error::invalid_response("message has the checksum flag set but no checksum")
            })?
        } else {
            body.len()
        };
        let (mut sections, mut trailer) = body.split_at(sections_end);

        let mut document_payload = None;
        while !sections.is_empty() {
            match sections.read_u8_sync()? {
                0 => {
                    let bytes = bson_util::read_document_bytes(&mut sections)?;
                    if document_payload.is_some() {
                        return Err(Error::invalid_response(
                            "an OP_MSG response must contain exactly one payload type 0 section",
                        ));
                    }
                    document_payload = Some(RawDocumentBuf::from_bytes(bytes)?);
                }
                1 => {
                    return Err(Error::invalid_response(
                        "OP_MSG document sequence sections are not supported",
                    ))
                }
                other => {
                    return Err(Error::invalid_response(format!(
                        "invalid OP_MSG section payload type: {other}"
                    )))
                }
            }
        }

        let checksum = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            Some(trailer.read_u32_sync()?)
        } else {
            None
        };

        Ok(Self {
            response_to: header.response_to,
            request_id: header.request_id,
            flags,
            document_payload: document_payload.ok_or_else(|| ErrorKind::InvalidResponse {
                message: "an OP_MSG response must contain exactly one payload type 0 section"
                    .into(),
            })?,
            checksum,
        })
    }

    /// Serializes the message into a complete frame.
    pub(crate) fn encode(&self) -> Result<WireFrame> {
        let payload = self.document_payload.as_bytes();
        let checksum_len = self
            .checksum
            .as_ref()
            .map(std::mem::size_of_val)
            .unwrap_or(0);
        let total_length = Header::LENGTH + std::mem::size_of::<u32>() + 1 + payload.len() + checksum_len;

        let header = Header {
            length: frame_length(total_length)?,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        let mut bytes = Vec::with_capacity(total_length);
        header.write_into(&mut bytes);
        bytes.extend_from_slice(&self.flags.bits().to_le_bytes());
        bytes.push(0);
        bytes.extend_from_slice(payload);
        if let Some(checksum) = self.checksum {
            bytes.extend_from_slice(&checksum.to_le_bytes());
        }

        Ok(WireFrame { header, bytes })
    }

    /// The document carried by the message.
    pub fn document(&self) -> &RawDocument {
        &self.document_payload
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        /// A CRC-32C checksum trails the sections.
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        /// Another message follows this one without a further request.
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        /// The client is prepared for the server to stream several replies.
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}
