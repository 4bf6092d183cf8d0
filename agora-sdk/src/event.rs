//! Events emitted by the chat connection for the consumer to observe.

use std::time::Duration;

use crate::types::ChatMessage;

/// Events that the stream connection emits to the consumer (CLI, GUI, bot).
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Connection established (or re-established) and ready to send.
    Open,

    /// A chat message arrived. Delivered in transport order.
    Message(ChatMessage),

    /// The connection dropped uncleanly; a reconnect attempt is scheduled
    /// after `delay`.
    Reconnecting { attempt: u32, delay: Duration },

    /// The server rejected the credential. Stored credentials have been
    /// cleared and no reconnect will be attempted; the caller must sign in
    /// again.
    SessionExpired { reason: String },

    /// The connection is permanently closed: clean close, explicit
    /// disconnect, or reconnect attempts exhausted.
    Closed { reason: Option<String> },
}
