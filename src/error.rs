//! Error taxonomy for the daemon, grouped by the handling policy in the
//! design: malformed input and an expired deadline both short-circuit to a
//! response; everything else recoverable is absorbed as `Option`/`Result`
//! at the component boundary and never reaches this type.

use thiserror::Error;

/// An error that short-circuits the orchestrator straight to response
/// emission, or terminates the process.
#[derive(Error, Debug)]
pub enum Error {
    /// The query line could not be parsed into two valid ports.
    #[error("invalid port")]
    InvalidPort,

    /// The deadline elapsed before a sub-step completed.
    #[error("deadline expired")]
    Expired,

    /// A privilege-reduction step required for the NAT path failed.
    #[error("privilege reduction failed: {0}")]
    Privilege(String),

    /// A forwarded request could not be built within the protocol's line
    /// limit.
    #[error("forward request malformed: {0}")]
    Forward(String),

    /// An unrecoverable I/O or allocation failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The RFC 1413 error token a short-circuiting variant maps to, for the
    /// variants that reach the wire directly rather than being logged and
    /// folded into a generic fallback.
    pub fn wire_token(&self) -> &'static str {
        match self {
            Error::InvalidPort => "INVALID-PORT",
            Error::Expired => "UNKNOWN-ERROR",
            Error::Privilege(_) | Error::Forward(_) | Error::Io(_) => "UNKNOWN-ERROR",
        }
    }
}
