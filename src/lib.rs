//! An XMPP (RFC 6120/6121) session engine.
//!
//! This crate owns the hard parts of an XMPP implementation: a negotiation
//! state machine driving pluggable stream features (including ones that
//! restart the stream or replace the transport, like STARTTLS and SASL), a
//! full-duplex XML framing layer that survives mid-stream decoder rebuilds,
//! a stanza router that correlates IQ request/response pairs and enforces
//! the reply obligation, and a normalized [`Jid`] address type.
//!
//! What it deliberately does not contain: SASL mechanisms, concrete feature
//! implementations, dialing/DNS, or extension protocols. Those plug in from
//! the outside, features through [`StreamFeature`] and transports through
//! [`Conn`].
//!
//! # Layout
//!
//! - [`jid`]: address parsing, normalization and comparison
//! - [`uri`]: `xmpp:` URI parsing
//! - [`stream`]: stream header framing and stream errors
//! - [`stanza`]: Message/Presence/IQ types and stanza errors
//! - [`negotiate`]: the negotiator contract and the default feature walker
//! - [`Session`]: construction, sending, IQ correlation, the serve loop
//!
//! # A minimal client
//!
//! ```no_run
//! use fluux_xmpp::{Conn, FeatureNegotiator, Jid, Session, SessionState, StreamConfig};
//!
//! # async fn run(tls_stream: tokio::net::TcpStream) -> Result<(), fluux_xmpp::Error> {
//! let origin = Jid::new("alice@example.com")?;
//! let session = Session::new(
//!     origin.domain(),
//!     origin,
//!     Conn::secure(tls_stream),
//!     SessionState::empty(),
//!     FeatureNegotiator::new(StreamConfig::default()),
//! )
//! .await?;
//!
//! tokio::select! {
//!     served = session.serve(()) => served?,
//!     _ = async { /* application logic sending via &session */ } => {}
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod conn;
mod error;
pub mod jid;
mod negotiate;
pub mod ns;
mod session;
pub mod stanza;
pub mod stream;
pub mod uri;
pub mod xml;

pub use conn::{Conn, Transport};
pub use error::Error;
pub use jid::Jid;
pub use negotiate::{
    Carry, FeatureData, FeatureNegotiator, Handshake, Negotiated, Negotiator, Step, StreamConfig,
    StreamFeature,
};
pub use session::{
    Handler, IqResponse, Session, SessionState, TokenReadHandle, TokenWriteHandle, Transaction,
};
pub use xml::IntoXml;

// Stanza payloads are built and consumed as quick-xml events.
pub use quick_xml::events;
