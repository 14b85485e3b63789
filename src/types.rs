use std::io;
use thiserror::Error;

pub type ResultT<A> = Result<A, Error>;

// Server is the only variant that leaves the connection usable; Protocol
// means the wire may be desynchronized and the connection gets torn down.
#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    // an error reply from the server, verbatim
    #[error("server error: {0}")]
    Server(String),

    // rejected locally, illegal in the current mode
    #[error("{0}")]
    Mode(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Error {
        Error::Protocol(msg.into())
    }

    pub(crate) fn mode(msg: impl Into<String>) -> Error {
        Error::Mode(msg.into())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::ConnectionClosed)
    }

    // io::Error is not Clone, so when one failure has to reach two places we
    // rebuild a lookalike
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Protocol(msg) => Error::Protocol(msg.clone()),
            Error::Transport(err) => {
                Error::Transport(io::Error::new(err.kind(), err.to_string()))
            }
            Error::ConnectionClosed => Error::ConnectionClosed,
            Error::Server(msg) => Error::Server(msg.clone()),
            Error::Mode(msg) => Error::Mode(msg.clone()),
            Error::InvalidArgument(msg) => Error::InvalidArgument(msg.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_transport_classification() {
        let io_err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(io_err.is_transport());
        assert!(Error::ConnectionClosed.is_transport());
        assert!(!Error::Server("ERR nope".into()).is_transport());
        assert!(!Error::Protocol("bad tag".into()).is_transport());
    }

    #[test]
    pub fn test_duplicate_keeps_variant() {
        let err = Error::Transport(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        match err.duplicate() {
            Error::Transport(inner) => assert_eq!(inner.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected duplicate {:?}", other),
        }
    }
}
