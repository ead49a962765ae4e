use super::{TracingMirror, COMMAND_TRACING_EVENT_TARGET};
use crate::event::command::CommandEvent;

/// Command records carry the connection they ran on.
macro_rules! command_debug {
    ($event:expr, $message:literal $(, $field:ident = $value:expr)* $(,)?) => {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            commandName = $event.command_name,
            requestId = $event.request_id,
            driverConnectionId = $event.connection.id,
            serverConnectionId = $event.connection.server_id,
            serverHost = $event.connection.address.host().as_ref(),
            serverPort = $event.connection.address.port_tracing_representation(),
            serviceId = $event.service_id.map(|id| id.to_hex()),
            $($field = $value,)*
            $message,
        )
    };
}

impl TracingMirror {
    pub(crate) fn command_event(&self, event: &CommandEvent) {
        match event {
            CommandEvent::Started(e) => command_debug!(
                e,
                "Command started",
                databaseName = e.db,
                command = self.document(&e.command),
            ),
            CommandEvent::Succeeded(e) => command_debug!(
                e,
                "Command succeeded",
                reply = self.document(&e.reply),
                durationMS = e.duration.as_millis(),
            ),
            CommandEvent::Failed(e) => command_debug!(
                e,
                "Command failed",
                failure = self.error(&e.failure),
                durationMS = e.duration.as_millis(),
            ),
        }
    }
}
