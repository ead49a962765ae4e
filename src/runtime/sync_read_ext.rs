use std::io::Read;

use crate::error::{Error, Result};

/// Little-endian primitive reads over an in-memory frame body.
///
/// The frame has already been read off the socket in full, so running out of bytes here means the
/// peer sent a malformed message and is reported as an invalid response rather than an I/O error.
pub(crate) trait SyncLittleEndianRead: Read {
    /// Fill `buf` completely from the frame.
    fn read_exact_sync(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf)
            .map_err(|error| Error::invalid_response(format!("message is truncated: {error}")))
    }

    /// Read an `i32` in little-endian order.
    fn read_i32_sync(&mut self) -> Result<i32> {
        let mut buf: [u8; 4] = [0; 4];
        self.read_exact_sync(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read a `u32` in little-endian order.
    fn read_u32_sync(&mut self) -> Result<u32> {
        let mut buf: [u8; 4] = [0; 4];
        self.read_exact_sync(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read an `i64` in little-endian order.
    fn read_i64_sync(&mut self) -> Result<i64> {
        let mut buf: [u8; 8] = [0; 8];
        self.read_exact_sync(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn read_u8_sync(&mut self) -> Result<u8> {
        let mut buf: [u8; 1] = [0; 1];
        self.read_exact_sync(&mut buf)?;
        Ok(buf[0])
    }
}

impl<R: Read> SyncLittleEndianRead for R {}
