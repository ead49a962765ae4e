use std::{io::Read, time::Duration};

use serde::{Deserialize, Deserializer, Serializer};

use crate::{
    bson::{Bson, Document, RawDocument, RawDocumentBuf},
    error::{Error, Result},
    runtime::SyncLittleEndianRead,
};

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

/// The first key of a raw document, which names the command it holds.
pub(crate) fn raw_first_key(document: &RawDocument) -> Result<Option<&str>> {
    match document.into_iter().next() {
        Some(Ok((key, _))) => Ok(Some(key)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

/// Reads one length-prefixed BSON document from `reader`.
pub(crate) fn read_document_bytes<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let length = reader.read_i32_sync()?;
    if length < 5 {
        return Err(Error::invalid_response(format!(
            "invalid BSON document length: {length}"
        )));
    }

    // The buffer grows with the bytes actually present rather than the declared length.
    let mut bytes = length.to_le_bytes().to_vec();
    reader
        .take(length as u64 - 4)
        .read_to_end(&mut bytes)
        .map_err(|error| Error::invalid_response(format!("could not read document: {error}")))?;
    if bytes.len() != length as usize {
        return Err(Error::invalid_response(format!(
            "BSON document truncated: expected {length} bytes, got {}",
            bytes.len()
        )));
    }

    Ok(bytes)
}

pub(crate) fn document_to_raw(document: &Document) -> Result<RawDocumentBuf> {
    Ok(RawDocumentBuf::from_document(document)?)
}

pub(crate) fn serialize_duration_option_as_int_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) if duration.as_millis() > i32::MAX as u128 => {
            serializer.serialize_i64(duration.as_millis() as i64)
        }
        Some(duration) => serializer.serialize_i32(duration.as_millis() as i32),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn serialize_duration_option_as_int_secs<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) if duration.as_secs() > i32::MAX as u64 => {
            serializer.serialize_i64(duration.as_secs() as i64)
        }
        Some(duration) => serializer.serialize_i32(duration.as_secs() as i32),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_duration_option_from_u64_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

pub(crate) fn deserialize_duration_option_from_u64_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = Option::<u64>::deserialize(deserializer)?;
    Ok(secs.map(Duration::from_secs))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bson::{doc, rawdoc};

    #[test]
    fn get_int_is_lossless_only() {
        assert_eq!(get_int(&Bson::Int32(5)), Some(5));
        assert_eq!(get_int(&Bson::Double(3.0)), Some(3));
        assert_eq!(get_int(&Bson::Double(3.5)), None);
        assert_eq!(get_int(&Bson::String("3".into())), None);
    }

    #[test]
    fn read_document_bytes_consumes_one_document() {
        let first = rawdoc! { "a": 1 };
        let second = rawdoc! { "b": "two" };
        let mut bytes = first.as_bytes().to_vec();
        bytes.extend_from_slice(second.as_bytes());

        let mut reader = bytes.as_slice();
        assert_eq!(read_document_bytes(&mut reader).unwrap(), first.as_bytes());
        assert_eq!(read_document_bytes(&mut reader).unwrap(), second.as_bytes());
        assert!(read_document_bytes(&mut reader).is_err());
    }

    #[test]
    fn read_document_bytes_rejects_truncation() {
        let doc = rawdoc! { "a": "a long enough string value" };
        let bytes = &doc.as_bytes()[..doc.as_bytes().len() - 3];
        assert!(read_document_bytes(bytes).is_err());
    }

    #[test]
    fn first_keys() {
        assert_eq!(first_key(&doc! { "ping": 1, "x": 2 }), Some("ping"));
        assert_eq!(
            raw_first_key(&rawdoc! { "hello": 1 }).unwrap(),
            Some("hello")
        );
        assert_eq!(raw_first_key(&rawdoc! {}).unwrap(), None);
    }
}
