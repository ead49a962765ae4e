use std::{
    io::Read,
    sync::atomic::{AtomicI32, Ordering},
};

use crate::{
    error::{Error, Result},
    runtime::SyncLittleEndianRead,
};

/// Obtain a new request ID. IDs stay within 31 bits, wrapping back to 0 after `i32::MAX`.
pub fn next_request_id() -> i32 {
    static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

    take_id(&REQUEST_ID)
}

fn take_id(counter: &AtomicI32) -> i32 {
    let advance = |id: i32| Some(id.wrapping_add(1) & i32::MAX);
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, advance) {
        Ok(id) | Err(id) => id,
    }
}

/// Converts a computed frame length into the wire's `int32` representation.
pub(super) fn frame_length(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| {
        Error::invalid_argument(format!("message of {len} bytes exceeds the wire length limit"))
    })
}

pub(super) fn write_cstring(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(Error::invalid_argument(format!(
            "cstring {s:?} contains an interior null byte"
        )));
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

pub(super) fn read_cstring<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8_sync()?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes).map_err(|e| Error::invalid_response(e.to_string()))
}
