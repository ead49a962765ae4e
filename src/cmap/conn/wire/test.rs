use pretty_assertions::assert_eq;

use super::*;
use crate::{
    bson::{doc, rawdoc, Bson},
    error::ErrorKind,
    options::ReadPreference,
};

fn expect_response(frame: &WireFrame) -> ResponseMessage {
    match decode_frame(frame.as_bytes()).unwrap().1 {
        DecodedFrame::Response(response) => response,
        DecodedFrame::Query(query) => panic!("expected a response, got {query:?}"),
    }
}

fn expect_query(frame: &WireFrame) -> Query {
    match decode_frame(frame.as_bytes()).unwrap().1 {
        DecodedFrame::Query(query) => query,
        DecodedFrame::Response(response) => panic!("expected a query, got {response:?}"),
    }
}

#[test]
fn modern_message_round_trip() {
    let command = rawdoc! { "ping": 1, "comment": "hi" };
    let frame = encode_modern_message("admin", &command, &MessageOptions::default()).unwrap();

    assert_eq!(frame.header().op_code, OpCode::Message);
    assert_eq!(frame.header().length as usize, frame.as_bytes().len());

    let document = expect_response(&frame).into_document().unwrap();
    assert_eq!(
        document.to_document().unwrap(),
        doc! { "ping": 1, "comment": "hi", "$db": "admin" }
    );
}

#[test]
fn modern_message_keeps_existing_db() {
    let command = rawdoc! { "ping": 1, "$db": "other" };
    let frame = encode_modern_message("admin", &command, &MessageOptions::default()).unwrap();

    let document = expect_response(&frame).into_document().unwrap();
    assert_eq!(document.get_str("$db").unwrap(), "other");
}

#[test]
fn modern_message_flags_and_read_preference() {
    let options = MessageOptions {
        exhaust_allowed: true,
        more_to_come: true,
        read_preference: Some(ReadPreference::Secondary {
            options: Default::default(),
        }),
        request_id: Some(77),
    };
    let frame = encode_modern_message("db", &rawdoc! { "find": "c" }, &options).unwrap();

    let (header, decoded) = decode_frame(frame.as_bytes()).unwrap();
    assert_eq!(header.request_id, 77);
    let DecodedFrame::Response(ResponseMessage::Message(message)) = decoded else {
        panic!("expected an OP_MSG");
    };
    assert!(message.flags.contains(MessageFlags::EXHAUST_ALLOWED));
    assert!(message.more_to_come());
    assert_eq!(
        message.get_command_document().get_document("$readPreference").unwrap(),
        &doc! { "mode": "secondary" }
    );
}

#[test]
fn request_ids_increase() {
    let first = encode_modern_message("a", &rawdoc! { "x": 1 }, &Default::default()).unwrap();
    let second = encode_modern_message("a", &rawdoc! { "x": 1 }, &Default::default()).unwrap();
    assert!(second.request_id() > first.request_id());
}

/// Builds the body of an OP_MSG by hand: flag bits followed by raw section bytes.
fn message_frame(flags: u32, sections: &[u8]) -> Vec<u8> {
    let mut body = flags.to_le_bytes().to_vec();
    body.extend_from_slice(sections);

    let header = Header {
        length: (Header::LENGTH + body.len()) as i32,
        request_id: 7,
        response_to: 3,
        op_code: OpCode::Message,
    };
    let mut bytes = Vec::new();
    header.write_into(&mut bytes);
    bytes.extend_from_slice(&body);
    bytes
}

#[test]
fn document_sequence_section_is_rejected() {
    let document = rawdoc! { "insert": "c" };
    let mut sections = vec![0u8];
    sections.extend_from_slice(document.as_bytes());
    sections.push(1);
    sections.extend_from_slice(&8i32.to_le_bytes());
    sections.extend_from_slice(b"doc\0");

    let error = decode_frame(&message_frame(0, &sections)).unwrap_err();
    assert!(
        matches!(*error.kind, ErrorKind::InvalidResponse { .. }),
        "{error:?}"
    );
}

#[test]
fn unknown_section_kind_is_rejected() {
    let error = decode_frame(&message_frame(0, &[5, 0, 0, 0, 0, 0])).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidResponse { .. }));
}

#[test]
fn checksum_is_tolerated() {
    let document = rawdoc! { "ok": 1 };
    let mut sections = vec![0u8];
    sections.extend_from_slice(document.as_bytes());
    sections.extend_from_slice(&0xdead_beef_u32.to_le_bytes());

    let bytes = message_frame(MessageFlags::CHECKSUM_PRESENT.bits(), &sections);
    let (header, decoded) = decode_frame(&bytes).unwrap();
    assert_eq!(header.response_to, 3);

    let DecodedFrame::Response(ResponseMessage::Message(message)) = decoded else {
        panic!("expected an OP_MSG");
    };
    assert_eq!(message.checksum, Some(0xdead_beef));
    assert_eq!(message.document_payload, document);
}

#[test]
fn noop_compressed_round_trip() {
    let command = rawdoc! { "find": "coll", "filter": { "x": 1 } };
    let frame = encode_modern_message("db", &command, &MessageOptions::default()).unwrap();
    let compressed = wrap_compressed(&frame, &Compressor::Noop).unwrap();

    assert_eq!(compressed.header().op_code, OpCode::Compressed);
    assert_eq!(compressed.request_id(), frame.request_id());
    assert_eq!(compressed.as_bytes().len(), frame.as_bytes().len() + 9);

    let (header, decoded) = decode_frame(compressed.as_bytes()).unwrap();
    assert_eq!(header.op_code, OpCode::Message);
    assert_eq!(header.request_id, frame.request_id());

    let DecodedFrame::Response(response) = decoded else {
        panic!("expected an OP_MSG");
    };
    assert_eq!(
        response.into_document().unwrap().to_document().unwrap(),
        doc! { "find": "coll", "filter": { "x": 1 }, "$db": "db" }
    );
}

#[test]
fn compressed_length_mismatch_is_rejected() {
    let frame = encode_modern_message("db", &rawdoc! { "ping": 1 }, &Default::default()).unwrap();
    let mut bytes = wrap_compressed(&frame, &Compressor::Noop)
        .unwrap()
        .as_bytes()
        .to_vec();
    // Corrupt the recorded uncompressed size.
    bytes[20..24].copy_from_slice(&1i32.to_le_bytes());

    let error = decode_frame(&bytes).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidResponse { .. }));
}

fn assert_protocol_error(error: crate::error::Error) {
    assert!(
        matches!(*error.kind, ErrorKind::InvalidResponse { .. }),
        "{error:?}"
    );
    assert!(!error.is_network_error());
    assert!(!error.is_read_retryable());
}

#[test]
fn truncated_bodies_are_protocol_errors() {
    let message = Header {
        length: (Header::LENGTH + 2) as i32,
        request_id: 1,
        response_to: 1,
        op_code: OpCode::Message,
    };
    assert_protocol_error(decode_response(&message, &[0, 0]).unwrap_err());

    let compressed = Header {
        length: (Header::LENGTH + 3) as i32,
        op_code: OpCode::Compressed,
        ..message.clone()
    };
    assert_protocol_error(decode_response(&compressed, &[1, 0, 0]).unwrap_err());

    // A section kind byte with no document after it.
    assert_protocol_error(decode_frame(&message_frame(0, &[0])).unwrap_err());
}

#[test]
fn oversized_document_length_is_rejected() {
    let mut sections = vec![0u8];
    sections.extend_from_slice(&i32::MAX.to_le_bytes());
    sections.extend_from_slice(&[0; 8]);

    assert_protocol_error(decode_frame(&message_frame(0, &sections)).unwrap_err());
}

#[test]
fn legacy_reply_decode() {
    let documents = [rawdoc! { "ok": 1, "n": 2 }, rawdoc! { "extra": true }];
    let mut body = Vec::new();
    body.extend_from_slice(&ResponseFlags::AWAIT_CAPABLE.bits().to_le_bytes());
    body.extend_from_slice(&42i64.to_le_bytes());
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&2i32.to_le_bytes());
    for document in &documents {
        body.extend_from_slice(document.as_bytes());
    }
    let header = Header {
        length: (Header::LENGTH + body.len()) as i32,
        request_id: 1,
        response_to: 99,
        op_code: OpCode::Reply,
    };

    let response = decode_response(&header, &body).unwrap();
    assert_eq!(response.response_to(), 99);
    assert!(!response.more_to_come());

    let ResponseMessage::Reply(ref reply) = response else {
        panic!("expected an OP_REPLY");
    };
    assert_eq!(reply.cursor_id, 42);
    assert_eq!(reply.documents.len(), 2);
    assert_eq!(response.into_document().unwrap(), documents[0]);
}

#[test]
fn legacy_reply_with_wrong_count_is_rejected() {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&0i64.to_le_bytes());
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&3i32.to_le_bytes());
    body.extend_from_slice(rawdoc! { "ok": 1 }.as_bytes());
    let header = Header {
        length: (Header::LENGTH + body.len()) as i32,
        request_id: 1,
        response_to: 1,
        op_code: OpCode::Reply,
    };

    assert!(decode_response(&header, &body).is_err());
}

#[test]
fn legacy_reply_short_preamble_is_rejected() {
    let header = Header {
        length: (Header::LENGTH + 8) as i32,
        request_id: 1,
        response_to: 1,
        op_code: OpCode::Reply,
    };
    assert!(decode_response(&header, &[0; 8]).is_err());
}

#[test]
fn legacy_command_round_trip() {
    let frame = encode_legacy_query(
        "admin",
        &rawdoc! { "isMaster": 1, "helloOk": true },
        &QueryOptions::default(),
    )
    .unwrap();
    assert_eq!(frame.header().op_code, OpCode::Query);

    let query = expect_query(&frame);
    assert_eq!(query.full_collection_name, "admin.$cmd");
    assert_eq!(query.number_to_return, -1);
    assert_eq!(query.namespace(), ("admin", "$cmd"));
    assert_eq!(
        query.to_command_document(),
        doc! { "isMaster": 1, "helloOk": true }
    );
}

#[test]
fn legacy_command_with_read_preference_is_wrapped() {
    let options = QueryOptions {
        read_preference: Some(ReadPreference::SecondaryPreferred {
            options: Default::default(),
        }),
        ..Default::default()
    };
    let frame = encode_legacy_query("admin", &rawdoc! { "count": "c" }, &options).unwrap();
    let query = expect_query(&frame);

    assert!(query.flags.contains(QueryFlags::SLAVE_OK));
    assert_eq!(query.query.get_document("$query").unwrap(), &doc! { "count": "c" });
    assert_eq!(query.to_command_document(), doc! { "count": "c" });
}

#[test]
fn legacy_find_is_remapped() {
    let options = QueryOptions {
        collection: Some("people".into()),
        flags: QueryFlags::TAILABLE_CURSOR | QueryFlags::AWAIT_DATA,
        number_to_skip: 5,
        number_to_return: Some(-10),
        return_field_selector: Some(doc! { "name": 1 }),
        read_preference: None,
        request_id: None,
    };
    let frame = encode_legacy_query(
        "test",
        &rawdoc! {
            "$query": { "age": { "$gt": 30 } },
            "$orderby": { "age": -1 },
            "$showDiskLoc": true,
            "$maxTimeMS": 100,
        },
        &options,
    )
    .unwrap();

    assert_eq!(
        expect_query(&frame).to_command_document(),
        doc! {
            "find": "people",
            "filter": { "age": { "$gt": 30 } },
            "sort": { "age": -1 },
            "showRecordId": true,
            "maxTimeMS": 100,
            "projection": { "name": 1 },
            "skip": 5,
            "batchSize": 10,
            "singleBatch": true,
            "tailable": true,
            "awaitData": true,
        }
    );
}

#[test]
fn legacy_find_without_modifiers_uses_plain_filter() {
    let options = QueryOptions {
        collection: Some("c".into()),
        number_to_return: Some(3),
        ..Default::default()
    };
    let frame = encode_legacy_query("db", &rawdoc! { "x": 1 }, &options).unwrap();

    let command = expect_query(&frame).to_command_document();
    assert_eq!(command.get("filter"), Some(&Bson::Document(doc! { "x": 1 })));
    assert_eq!(command.get_i32("batchSize").unwrap(), 3);
    assert!(command.get("singleBatch").is_none());
}

#[test]
fn handshake_and_auth_commands_are_not_compressible() {
    for name in ["hello", "isMaster", "saslStart", "saslContinue", "createUser"] {
        assert!(!can_compress(name), "{name}");
    }
    for name in ["find", "insert", "ping"] {
        assert!(can_compress(name), "{name}");
    }
}

#[tokio::test]
async fn oversized_reply_is_rejected() {
    let frame = encode_modern_message("db", &rawdoc! { "ok": 1 }, &Default::default()).unwrap();
    let mut bytes = frame.as_bytes();

    let error = read_response(&mut bytes, Some(20)).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidResponse { .. }));
}

#[tokio::test]
async fn read_response_from_stream() {
    let frame = encode_modern_message("db", &rawdoc! { "ok": 1 }, &Default::default()).unwrap();
    let mut bytes = frame.as_bytes();

    let response = read_response(&mut bytes, None).await.unwrap();
    assert_eq!(response.into_document().unwrap().get_i32("ok").unwrap(), 1);
}
