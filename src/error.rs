//! Unified error type for the session engine.

use thiserror::Error;

use crate::jid::AddressError;
use crate::stanza::StanzaError;
use crate::stream::StreamError;

/// Errors surfaced by sessions, framing and stanza handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A JID failed to parse or normalize.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// A stream-level error, either received from the peer or generated
    /// locally. Always fatal to the session.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A stanza-level error. Recoverable; the stream stays up.
    #[error(transparent)]
    Stanza(#[from] StanzaError),

    /// Malformed XML or an unexpected token at the stream level.
    #[error("stream framing error: {0}")]
    Framing(String),

    /// A read was attempted after the input stream closed.
    #[error("attempted to read token from closed stream")]
    InputClosed,

    /// A write was attempted after the output stream closed.
    #[error("attempted to write token to closed stream")]
    OutputClosed,

    /// The close deadline passed before the peer closed its stream.
    #[error("deadline reached before the peer closed the stream")]
    Timeout,

    /// A token stream handed to a send call did not begin with a start element.
    #[error("token stream did not begin with a start element")]
    NotAStart,

    /// A token stream handed to an IQ call did not begin with an `iq` element.
    #[error("expected an iq start element")]
    NotAnIq,

    /// Transport I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// XML parser failure.
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
}
