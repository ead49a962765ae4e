use super::{Connection, RawCommandResponse};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExhaustState {
    /// The server will send another reply, answering the reply with this request ID.
    AwaitingNextReply { previous_request_id: i32 },
    StreamComplete,
}

/// The replies to a command sent with the exhaust flag.
///
/// Replies are pulled one at a time with [`ExhaustStream::next`]. Stopping early with
/// [`ExhaustStream::stop`] shuts the connection down, since the unread replies would otherwise be
/// mistaken for answers to the next request.
#[derive(Debug)]
pub struct ExhaustStream<'a> {
    connection: &'a mut Connection,
    first: Option<RawCommandResponse>,
    state: ExhaustState,
}

impl<'a> ExhaustStream<'a> {
    pub(super) fn new(
        connection: &'a mut Connection,
        first: RawCommandResponse,
        awaiting_reply_to: Option<i32>,
    ) -> Self {
        let state = match awaiting_reply_to {
            Some(previous_request_id) => ExhaustState::AwaitingNextReply {
                previous_request_id,
            },
            None => ExhaustState::StreamComplete,
        };
        Self {
            connection,
            first: Some(first),
            state,
        }
    }

    /// Returns the next reply, or `None` once the server has signalled that the stream is over.
    pub async fn next(&mut self) -> Result<Option<RawCommandResponse>> {
        if let Some(first) = self.first.take() {
            return Ok(Some(first));
        }

        let previous_request_id = match self.state {
            ExhaustState::StreamComplete => return Ok(None),
            ExhaustState::AwaitingNextReply {
                previous_request_id,
            } => previous_request_id,
        };

        let response = match self.connection.receive_message().await {
            Ok(response) => response,
            Err(error) => {
                self.state = ExhaustState::StreamComplete;
                return Err(error);
            }
        };
        if response.response_to() != previous_request_id {
            self.state = ExhaustState::StreamComplete;
            return Err(self.connection.fail(Error::invalid_response(format!(
                "expected a streamed reply to {previous_request_id}, got a reply to {}",
                response.response_to()
            ))));
        }

        self.state = if response.more_to_come() {
            ExhaustState::AwaitingNextReply {
                previous_request_id: response.request_id(),
            }
        } else {
            ExhaustState::StreamComplete
        };
        self.connection.into_raw_response(response).map(Some)
    }

    /// Whether the server has finished sending replies.
    pub fn is_complete(&self) -> bool {
        self.state == ExhaustState::StreamComplete
    }

    /// Ends the stream. If the server may still send replies, the connection is destroyed.
    pub fn stop(mut self) {
        if let ExhaustState::AwaitingNextReply { .. } = self.state {
            self.connection.destroy();
        }
        self.state = ExhaustState::StreamComplete;
    }
}
