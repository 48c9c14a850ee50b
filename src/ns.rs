//! Protocol namespace constants.

/// Default stanza namespace for client-to-server streams.
pub const CLIENT: &str = "jabber:client";

/// Default stanza namespace for server-to-server streams.
pub const SERVER: &str = "jabber:server";

/// Namespace of the outer `<stream:stream>` element.
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// Namespace of stream error defined conditions (RFC 6120 §4.9.3).
pub const STREAM_ERROR: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Namespace of stanza error defined conditions (RFC 6120 §8.3.3).
pub const STANZA_ERROR: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// RFC 7395 WebSocket framing namespace (`<open/>`/`<close/>`).
pub const WS_FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
