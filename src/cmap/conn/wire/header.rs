use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    error::{ErrorKind, Result},
    runtime::SyncLittleEndianRead,
};

/// The wire protocol op codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum OpCode {
    /// A legacy reply to an OP_QUERY.
    Reply = 1,
    /// A legacy query.
    Query = 2004,
    /// A message wrapped in a compression envelope.
    Compressed = 2012,
    /// An extensible message.
    Message = 2013,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    pub(crate) fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2012 => Ok(OpCode::Compressed),
            2013 => Ok(OpCode::Message),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("Invalid wire protocol opcode: {other}"),
            }
            .into()),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    /// Total frame length in bytes, this header included.
    pub length: i32,
    /// Identifier chosen by the sender of the frame.
    pub request_id: i32,
    /// The request this frame answers, or 0 for requests.
    pub response_to: i32,
    /// The format of the frame body.
    pub op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    pub(crate) fn write_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&(self.op_code as i32).to_le_bytes());
    }

    /// Parses a header from the first sixteen bytes of `bytes`.
    pub fn parse(mut bytes: &[u8]) -> Result<Self> {
        let length = bytes.read_i32_sync()?;
        let request_id = bytes.read_i32_sync()?;
        let response_to = bytes.read_i32_sync()?;
        let op_code = OpCode::from_i32(bytes.read_i32_sync()?)?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }

    /// Reads bytes from `reader` and deserializes them into a header.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let length = reader.read_i32_le().await?;
        let request_id = reader.read_i32_le().await?;
        let response_to = reader.read_i32_le().await?;
        let op_code = OpCode::from_i32(reader.read_i32_le().await?)?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }

    /// The number of body bytes that follow this header.
    pub(crate) fn body_length(&self) -> Result<usize> {
        usize::try_from(self.length)
            .ok()
            .and_then(|len| len.checked_sub(Self::LENGTH))
            .ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: format!("invalid message length: {}", self.length),
                }
                .into()
            })
    }
}
