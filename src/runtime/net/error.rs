use std::{io, time::Duration};

use thiserror::Error;

use crate::runtime::{ids::ConnectionId, sim::ProtocolViolation};

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("could not encode message")]
    CouldNotEncodeMessage,
    #[error("could not decode message")]
    CouldNotDecodeMessage,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    MessageLengthOverflowed { len: u64, max: u32 },
    #[error("channel closed")]
    ChannelClosed,
    #[error("connection {0} is disconnected")]
    Disconnected(ConnectionId),
    #[error("no response within {0:?}")]
    TimedOut(Duration),
    /// An error response, either sent by the peer or synthesized locally.
    #[error("{0}")]
    Remote(String),
    #[error("expected a response, received {0}")]
    UnexpectedResponse(&'static str),
    #[error("logical thread queue closed")]
    QueueClosed,
    #[error("no request is waiting for a response")]
    NoPendingRequest,
    #[error("unsupported request {0}")]
    UnsupportedRequest(&'static str),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("missing collaborator: {0}")]
    MissingCollaborator(&'static str),
    #[error("simulation stopped")]
    SimulationStopped,
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
}

impl Error {
    /// Whether this is one of the ordinary ways a transport shuts down, which
    /// shouldn't be reported as a failure.
    pub fn is_expected_close(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            Error::ChannelClosed => true,
            _ => false,
        }
    }
}
