use serde::{Deserialize, Serialize};

use crate::{
    bson::{Bson, Document, RawBsonRef, RawDocument, RawDocumentBuf, Timestamp},
    error::{CommandError, Error, ErrorKind, Result, WriteConcernError, WriteFailure},
    hello::{HelloCommandResponse, HelloReply},
    options::{ReadPreference, ServerAddress, ServerApi},
    session::{ClientSession, ClusterTime},
};

/// Driver-side model of a database command.
///
/// The body holds the command document as the caller built it; session, cluster time, API
/// version and transaction fields are kept separately and appended when the command is
/// serialized for the wire. `$db` and `$readPreference` are added by the codec.
#[derive(Clone, Debug)]
pub struct Command {
    pub(crate) name: String,

    pub(crate) target_db: String,

    pub(crate) exhaust_allowed: bool,

    /// Send as an OP_QUERY against `<db>.$cmd` rather than as an OP_MSG.
    pub(crate) legacy_framing: bool,

    pub(crate) body: RawDocumentBuf,

    pub(crate) lsid: Option<Document>,

    cluster_time: Option<ClusterTime>,

    server_api: Option<ServerApi>,

    read_preference: Option<ReadPreference>,

    pub(crate) txn_number: Option<i64>,

    start_transaction: Option<bool>,

    autocommit: Option<bool>,
}

impl Command {
    /// Creates a command named `name` that runs against `target_db`.
    pub fn new(name: impl ToString, target_db: impl ToString, body: RawDocumentBuf) -> Self {
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            exhaust_allowed: false,
            legacy_framing: false,
            body,
            lsid: None,
            cluster_time: None,
            server_api: None,
            read_preference: None,
            txn_number: None,
            start_transaction: None,
            autocommit: None,
        }
    }

    /// The name of the command, i.e. the first key of its body.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The database the command runs against.
    pub fn target_db(&self) -> &str {
        &self.target_db
    }

    /// The command document as provided by the caller.
    pub fn body(&self) -> &RawDocument {
        &self.body
    }

    /// Routes the command according to `read_preference`.
    pub fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.read_preference = Some(read_preference);
    }

    pub(crate) fn read_preference(&self) -> Option<&ReadPreference> {
        self.read_preference.as_ref()
    }

    /// Allows the server to answer this command with a stream of replies.
    pub fn set_exhaust_allowed(&mut self, exhaust_allowed: bool) {
        self.exhaust_allowed = exhaust_allowed;
    }

    pub(crate) fn set_session(&mut self, session: &ClientSession) {
        self.lsid = Some(session.id().clone())
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        self.cluster_time = Some(cluster_time.clone());
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.txn_number = Some(txn_number);
    }

    pub(crate) fn set_server_api(&mut self, server_api: &ServerApi) {
        self.server_api = Some(server_api.clone());
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.start_transaction = Some(true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.autocommit = Some(false);
    }

    /// Whether the command carries credentials or other data that must not be logged.
    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        REDACTED_COMMANDS.contains(&name.as_str())
            || (HELLO_COMMAND_NAMES.contains(&name.as_str())
                && self.body.get("speculativeAuthenticate").ok().flatten().is_some())
    }

    /// Builds the document that goes on the wire: the body followed by the session, cluster
    /// time, API version and transaction fields that are set.
    pub(crate) fn into_document(self) -> Result<RawDocumentBuf> {
        let mut document = self.body;

        if let Some(lsid) = self.lsid {
            document.append("lsid", RawDocumentBuf::from_document(&lsid)?);
        }
        if let Some(ref cluster_time) = self.cluster_time {
            let cluster_time = crate::bson::to_document(cluster_time)?;
            document.append("$clusterTime", RawDocumentBuf::from_document(&cluster_time)?);
        }
        if let Some(server_api) = self.server_api {
            document.append("apiVersion", server_api.version.to_string());
            if let Some(strict) = server_api.strict {
                document.append("apiStrict", strict);
            }
            if let Some(deprecation_errors) = server_api.deprecation_errors {
                document.append("apiDeprecationErrors", deprecation_errors);
            }
        }
        if let Some(txn_number) = self.txn_number {
            document.append("txnNumber", txn_number);
        }
        if let Some(start_transaction) = self.start_transaction {
            document.append("startTransaction", start_transaction);
        }
        if let Some(autocommit) = self.autocommit {
            document.append("autocommit", autocommit);
        }

        Ok(document)
    }
}

/// Commands whose bodies and replies are replaced with an empty document in monitoring events.
const REDACTED_COMMANDS: [&str; 7] = [
    "authenticate",
    "saslstart",
    "saslcontinue",
    "getnonce",
    "createuser",
    "updateuser",
    "copydbsaslstart",
];

const HELLO_COMMAND_NAMES: [&str; 2] = ["hello", "ismaster"];

/// The fields common to every server reply, plus the reply-specific `body`.
#[derive(Debug, Deserialize)]
pub(crate) struct CommandResponse<T> {
    pub(crate) ok: Bson,

    #[serde(rename = "$clusterTime")]
    pub(crate) cluster_time: Option<ClusterTime>,

    #[serde(flatten)]
    pub(crate) body: T,
}

impl<T> CommandResponse<T> {
    pub(crate) fn is_success(&self) -> bool {
        crate::bson_util::get_int(&self.ok) == Some(1)
    }
}

/// The shape of a failed reply.
#[derive(Deserialize, Debug)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}

/// A successful reply may still report that its write concern could not be satisfied.
#[derive(Deserialize, Debug)]
struct WriteConcernErrorBody {
    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    error_labels: Option<Vec<String>>,
}

/// The fields a reply gossips back to the session that sent the command.
#[derive(Deserialize, Serialize, Debug, Default)]
struct GossipFields {
    #[serde(rename = "$clusterTime")]
    cluster_time: Option<ClusterTime>,

    #[serde(rename = "operationTime")]
    operation_time: Option<Timestamp>,
}

/// A reply from the server, kept as raw bytes and parsed on access.
#[derive(Debug, Clone)]
pub struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    raw: RawDocumentBuf,
}

impl RawCommandResponse {
    #[cfg(test)]
    pub(crate) fn with_document_and_address(source: ServerAddress, doc: Document) -> Result<Self> {
        Ok(Self {
            source,
            raw: RawDocumentBuf::from_document(&doc)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_document(doc: Document) -> Result<Self> {
        Self::with_document_and_address(ServerAddress::default(), doc)
    }

    pub(crate) fn new(source: ServerAddress, raw: RawDocumentBuf) -> Self {
        Self { source, raw }
    }

    /// Deserializes the reply into `T`.
    pub fn body<'a, T: Deserialize<'a>>(&'a self) -> Result<T> {
        crate::bson::from_slice(self.raw.as_bytes()).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                message: format!("{e}"),
            })
        })
    }

    /// The reply document.
    pub fn raw_body(&self) -> &RawDocument {
        &self.raw
    }

    /// The encoded reply document.
    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }

    /// Whether the reply has `ok: 1`.
    pub fn is_success(&self) -> bool {
        match self.raw.get("ok") {
            Ok(Some(RawBsonRef::Int32(ok))) => ok == 1,
            Ok(Some(RawBsonRef::Int64(ok))) => ok == 1,
            Ok(Some(RawBsonRef::Double(ok))) => ok == 1.0,
            Ok(Some(RawBsonRef::Boolean(ok))) => ok,
            _ => false,
        }
    }

    /// Converts a failed reply into a command error carrying the server's error labels, and a
    /// successful reply with a `writeConcernError` into a write concern failure.
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.is_success() {
            let error = match self.body::<CommandErrorBody>() {
                Ok(body) => Error::new(ErrorKind::Command(body.command_error), body.error_labels),
                Err(_) => Error::invalid_response("invalid server response"),
            };
            return Err(error
                .with_server_response(self)
                .with_address(self.source.clone()));
        }

        if let Ok(WriteConcernErrorBody {
            write_concern_error: Some(wc_error),
            error_labels,
        }) = self.body::<WriteConcernErrorBody>()
        {
            return Err(Error::new(
                ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)),
                error_labels,
            )
            .with_server_response(self)
            .with_address(self.source.clone()));
        }

        Ok(())
    }

    /// Gets the cluster time from the response, if any.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.body::<GossipFields>().ok()?.cluster_time
    }

    pub(crate) fn operation_time(&self) -> Option<Timestamp> {
        self.body::<GossipFields>().ok()?.operation_time
    }

    pub(crate) fn into_hello_reply(self) -> Result<HelloReply> {
        match self.body::<CommandResponse<HelloCommandResponse>>() {
            Ok(response) if response.is_success() => {
                let server_address = self.source_address().clone();
                Ok(HelloReply {
                    server_address,
                    command_response: response.body,
                    cluster_time: response.cluster_time,
                    raw_command_response: self.into_raw_document_buf(),
                })
            }
            _ => match self.body::<CommandErrorBody>() {
                Ok(command_error_body) => Err(Error::new(
                    ErrorKind::Command(command_error_body.command_error),
                    command_error_body.error_labels,
                )
                .with_address(self.source.clone())),
                Err(_) => Err(ErrorKind::InvalidResponse {
                    message: "invalid server response".into(),
                }
                .into()),
            },
        }
    }

    /// The address of the server that sent this response.
    pub fn source_address(&self) -> &ServerAddress {
        &self.source
    }

    /// Takes the reply document.
    pub fn into_raw_document_buf(self) -> RawDocumentBuf {
        self.raw
    }
}

