use bitflags::bitflags;

use super::header::Header;
use crate::{
    bson::RawDocumentBuf,
    bson_util,
    error::{Error, Result},
    runtime::SyncLittleEndianRead,
};

/// Size of the fixed fields preceding the documents of an OP_REPLY.
const REPLY_PREAMBLE_LENGTH: usize = 20;

bitflags! {
    /// The bitwise flags of an OP_REPLY.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ResponseFlags: i32 {
        /// The cursor named in a getMore was not found on the server.
        const CURSOR_NOT_FOUND = 0b0000_0001;
        /// The query failed and the single returned document describes the error.
        const QUERY_FAILURE    = 0b0000_0010;
        /// The server supports the await-data query option.
        const AWAIT_CAPABLE    = 0b0000_1000;
    }
}

/// Represents an OP_REPLY wire protocol operation.
#[derive(Clone, Debug)]
pub struct Reply {
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    /// Flag bits of the reply.
    pub response_flags: ResponseFlags,
    /// The cursor this reply belongs to, or 0.
    pub cursor_id: i64,
    /// Position of the first returned document within the cursor.
    pub starting_from: i32,
    /// How many documents the server claims to have returned.
    pub number_returned: i32,
    /// The returned documents.
    pub documents: Vec<RawDocumentBuf>,
}

impl Reply {
    /// Parses the body of an OP_REPLY frame: a fixed preamble followed by a run of
    /// length-prefixed documents.
    pub(crate) fn decode(header: &Header, mut body: &[u8]) -> Result<Self> {
        if body.len() < REPLY_PREAMBLE_LENGTH {
            return Err(Error::invalid_response(format!(
                "OP_REPLY body of {} bytes is shorter than its preamble",
                body.len()
            )));
        }

        let response_flags = ResponseFlags::from_bits_truncate(body.read_i32_sync()?);
        let cursor_id = body.read_i64_sync()?;
        let starting_from = body.read_i32_sync()?;
        let number_returned = body.read_i32_sync()?;

        let mut documents = Vec::new();
        while !body.is_empty() {
            let bytes = bson_util::read_document_bytes(&mut body)?;
            documents.push(RawDocumentBuf::from_bytes(bytes)?);
        }

        if usize::try_from(number_returned).ok() != Some(documents.len()) {
            return Err(Error::invalid_response(format!(
                "OP_REPLY claims {number_returned} documents but carries {}",
                documents.len()
            )));
        }

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            response_flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    /// The request this reply answers.
    pub fn response_to(&self) -> i32 {
        self.response_to
    }

    /// The ID the server assigned to this reply.
    pub fn request_id(&self) -> i32 {
        self.request_id
    }
}
