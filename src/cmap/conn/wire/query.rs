use bitflags::bitflags;

use super::{
    header::{Header, OpCode},
    util::{frame_length, read_cstring, write_cstring},
    WireFrame,
};
use crate::{
    bson::{Bson, Document, RawDocumentBuf},
    bson_util,
    error::{Error, Result},
    options::ReadPreference,
    runtime::SyncLittleEndianRead,
};

/// The collection name legacy commands are addressed to.
pub(crate) const COMMAND_COLLECTION: &str = "$cmd";

/// Legacy query modifiers and the `find` command fields they correspond to.
const MODIFIER_REMAP: [(&str, &str); 11] = [
    ("$query", "filter"),
    ("$orderby", "sort"),
    ("$hint", "hint"),
    ("$comment", "comment"),
    ("$maxScan", "maxScan"),
    ("$max", "max"),
    ("$min", "min"),
    ("$returnKey", "returnKey"),
    ("$showDiskLoc", "showRecordId"),
    ("$maxTimeMS", "maxTimeMS"),
    ("$snapshot", "snapshot"),
];

bitflags! {
    /// The bitwise flags of an OP_QUERY.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueryFlags: i32 {
        /// The cursor is not closed when the last data is retrieved.
        const TAILABLE_CURSOR   = 0b0000_0010;
        /// The query may run against a replica set secondary.
        const SLAVE_OK          = 0b0000_0100;
        /// Internal replication use only.
        const OPLOG_RELAY       = 0b0000_1000;
        /// The server should not time out idle cursors.
        const NO_CURSOR_TIMEOUT = 0b0001_0000;
        /// Block for a while rather than returning no data on a tailable cursor.
        const AWAIT_DATA        = 0b0010_0000;
        /// Stream the data down full blast in multiple replies.
        const EXHAUST           = 0b0100_0000;
        /// Return partial results if some shards are down.
        const PARTIAL           = 0b1000_0000;
    }
}

/// Options for encoding a legacy OP_QUERY frame.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct QueryOptions {
    /// The collection to query. Defaults to the command collection `$cmd`.
    pub collection: Option<String>,
    /// Extra flag bits. `SLAVE_OK` is set automatically for non-primary read preferences.
    pub flags: QueryFlags,
    /// How many documents to skip.
    pub number_to_skip: i32,
    /// Batch size hint. Commands always use -1.
    pub number_to_return: Option<i32>,
    /// Fields to project.
    pub return_field_selector: Option<Document>,
    /// Sent as `$readPreference`, with the query wrapped in `$query`.
    pub read_preference: Option<ReadPreference>,
    /// The request ID to use. A fresh one is drawn when unset.
    pub request_id: Option<i32>,
}

/// Represents an OP_QUERY wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub(crate) request_id: i32,
    /// Flag bits of the query.
    pub flags: QueryFlags,
    /// The `<database>.<collection>` namespace the query is addressed to.
    pub full_collection_name: String,
    /// How many documents to skip.
    pub number_to_skip: i32,
    /// Batch size hint.
    pub number_to_return: i32,
    /// The query document, possibly wrapped in `$query`.
    pub query: Document,
    /// Fields to project.
    pub return_field_selector: Option<Document>,
}

impl Query {
    /// Builds the query for `document` addressed to `database` with `options`.
    pub(crate) fn new(
        database: &str,
        document: Document,
        options: &QueryOptions,
        request_id: i32,
    ) -> Self {
        let collection = options.collection.as_deref().unwrap_or(COMMAND_COLLECTION);
        let is_command = collection == COMMAND_COLLECTION;

        let mut flags = options.flags;
        let query = match options.read_preference {
            Some(ref read_pref) => {
                if read_pref.is_secondary_ok() {
                    flags |= QueryFlags::SLAVE_OK;
                }
                let mut wrapped = Document::new();
                wrapped.insert("$query", document);
                wrapped.insert("$readPreference", read_pref.to_document());
                wrapped
            }
            None => document,
        };

        Self {
            request_id,
            flags,
            full_collection_name: format!("{database}.{collection}"),
            number_to_skip: options.number_to_skip,
            number_to_return: match options.number_to_return {
                Some(n) => n,
                None if is_command => -1,
                None => 0,
            },
            query,
            return_field_selector: options.return_field_selector.clone(),
        }
    }

    /// Serializes the query into a complete frame.
    pub(crate) fn encode(&self) -> Result<WireFrame> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.flags.bits().to_le_bytes());
        write_cstring(&mut body, &self.full_collection_name)?;
        body.extend_from_slice(&self.number_to_skip.to_le_bytes());
        body.extend_from_slice(&self.number_to_return.to_le_bytes());
        self.query.to_writer(&mut body)?;
        if let Some(ref selector) = self.return_field_selector {
            selector.to_writer(&mut body)?;
        }

        let header = Header {
            length: frame_length(Header::LENGTH + body.len())?,
            request_id: self.request_id,
            response_to: 0,
            op_code: OpCode::Query,
        };
        let mut bytes = Vec::with_capacity(Header::LENGTH + body.len());
        header.write_into(&mut bytes);
        bytes.extend_from_slice(&body);

        Ok(WireFrame { header, bytes })
    }

    /// Parses the body of an OP_QUERY frame.
    pub(crate) fn decode(header: &Header, mut body: &[u8]) -> Result<Self> {
        let flags = QueryFlags::from_bits_truncate(body.read_i32_sync()?);
        let full_collection_name = read_cstring(&mut body)?;
        let number_to_skip = body.read_i32_sync()?;
        let number_to_return = body.read_i32_sync()?;

        let query = RawDocumentBuf::from_bytes(bson_util::read_document_bytes(&mut body)?)?
            .to_document()?;
        let return_field_selector = if body.is_empty() {
            None
        } else {
            Some(
                RawDocumentBuf::from_bytes(bson_util::read_document_bytes(&mut body)?)?
                    .to_document()?,
            )
        };

        if !body.is_empty() {
            return Err(Error::invalid_response(format!(
                "OP_QUERY frame has {} trailing bytes",
                body.len()
            )));
        }

        Ok(Self {
            request_id: header.request_id,
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_field_selector,
        })
    }

    /// Splits the namespace into its database and collection parts.
    pub fn namespace(&self) -> (&str, &str) {
        self.full_collection_name
            .split_once('.')
            .unwrap_or((self.full_collection_name.as_str(), ""))
    }

    /// Up-converts this legacy query into the equivalent modern command document.
    ///
    /// Queries against `$cmd` are commands: their `$query` wrapper, if any, is removed. Any other
    /// collection turns into a `find` command with the legacy modifiers renamed.
    pub fn to_command_document(&self) -> Document {
        let (_, collection) = self.namespace();

        if collection == COMMAND_COLLECTION {
            return match self.query.get("$query") {
                Some(Bson::Document(inner)) => inner.clone(),
                _ => self.query.clone(),
            };
        }

        let mut command = Document::new();
        command.insert("find", collection);

        let has_modifiers = self.query.keys().any(|k| k.starts_with('$'));
        if has_modifiers {
            for (legacy, modern) in MODIFIER_REMAP {
                if let Some(value) = self.query.get(legacy) {
                    command.insert(modern, value.clone());
                }
            }
        } else {
            command.insert("filter", self.query.clone());
        }

        if let Some(ref projection) = self.return_field_selector {
            command.insert("projection", projection.clone());
        }
        if self.number_to_skip > 0 {
            command.insert("skip", self.number_to_skip);
        }
        if self.number_to_return < 0 {
            command.insert("batchSize", self.number_to_return.saturating_abs());
            command.insert("singleBatch", true);
        } else if self.number_to_return > 0 {
            command.insert("batchSize", self.number_to_return);
        }
        if self.flags.contains(QueryFlags::TAILABLE_CURSOR) {
            command.insert("tailable", true);
        }
        if self.flags.contains(QueryFlags::AWAIT_DATA) {
            command.insert("awaitData", true);
        }
        if self.flags.contains(QueryFlags::NO_CURSOR_TIMEOUT) {
            command.insert("noCursorTimeout", true);
        }
        if self.flags.contains(QueryFlags::PARTIAL) {
            command.insert("allowPartialResults", true);
        }

        command
    }
}
