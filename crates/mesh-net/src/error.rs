//! User-visible send failures.
//!
//! Decode errors, MIC failures and replay discards never reach this type;
//! they are dropped inside the layers. What surfaces to the application is
//! whether its own message made it out.

use thiserror::Error;

use crate::bearer::BearerError;

/// Why a send completed unsuccessfully.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The peer did not acknowledge all segments, or an acknowledged
    /// message saw no response, within the retry/timeout budget.
    #[error("Timed out")]
    Timeout,

    /// The peer answered a segmented message with an empty block-ack: it
    /// cannot take the message right now. Not retried.
    #[error("Peer is busy")]
    Busy,

    /// The caller cancelled the message before delivery.
    #[error("Cancelled")]
    Cancelled,

    /// Segmented messages cannot be originated while an IV-Update is in
    /// progress.
    #[error("IV-Update in progress")]
    IvUpdateInProgress,

    /// The referenced application key or device key is not in the store.
    #[error("No key material for the requested key set")]
    UnknownKey,

    /// The local element's 24-bit sequence space is exhausted for this
    /// IV-Index.
    #[error("Sequence numbers exhausted")]
    SequenceExhausted,

    /// The access payload cannot fit the transport (more than 32 segments).
    #[error("Payload too long")]
    PayloadTooLong,

    /// The message was malformed before it reached the wire.
    #[error("Invalid message")]
    InvalidMessage,

    /// The bearer refused the PDU.
    #[error("Bearer error: {0}")]
    Bearer(#[from] BearerError),
}
