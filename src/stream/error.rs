//! Stream-level error conditions (RFC 6120 §4.9).
//!
//! A stream error is always fatal: whichever side detects the condition
//! writes `<stream:error>` followed by the stream close tag, and the session
//! terminates.

use std::fmt;

use quick_xml::escape::escape;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use crate::ns;
use crate::xml::{self, IntoXml};

/// Defined stream error conditions (RFC 6120 §4.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Condition {
    BadFormat,
    BadNamespacePrefix,
    Conflict,
    ConnectionTimeout,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    NotWellFormed,
    PolicyViolation,
    RemoteConnectionFailed,
    Reset,
    ResourceConstraint,
    RestrictedXml,
    SeeOtherHost,
    SystemShutdown,
    UndefinedCondition,
    UnsupportedEncoding,
    UnsupportedFeature,
    UnsupportedStanzaType,
    UnsupportedVersion,
}

impl Condition {
    /// The defined-condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::BadFormat => "bad-format",
            Condition::BadNamespacePrefix => "bad-namespace-prefix",
            Condition::Conflict => "conflict",
            Condition::ConnectionTimeout => "connection-timeout",
            Condition::HostGone => "host-gone",
            Condition::HostUnknown => "host-unknown",
            Condition::ImproperAddressing => "improper-addressing",
            Condition::InternalServerError => "internal-server-error",
            Condition::InvalidFrom => "invalid-from",
            Condition::InvalidNamespace => "invalid-namespace",
            Condition::InvalidXml => "invalid-xml",
            Condition::NotAuthorized => "not-authorized",
            Condition::NotWellFormed => "not-well-formed",
            Condition::PolicyViolation => "policy-violation",
            Condition::RemoteConnectionFailed => "remote-connection-failed",
            Condition::Reset => "reset",
            Condition::ResourceConstraint => "resource-constraint",
            Condition::RestrictedXml => "restricted-xml",
            Condition::SeeOtherHost => "see-other-host",
            Condition::SystemShutdown => "system-shutdown",
            Condition::UndefinedCondition => "undefined-condition",
            Condition::UnsupportedEncoding => "unsupported-encoding",
            Condition::UnsupportedFeature => "unsupported-feature",
            Condition::UnsupportedStanzaType => "unsupported-stanza-type",
            Condition::UnsupportedVersion => "unsupported-version",
        }
    }

    fn from_name(name: &[u8]) -> Option<Condition> {
        Some(match name {
            b"bad-format" => Condition::BadFormat,
            b"bad-namespace-prefix" => Condition::BadNamespacePrefix,
            b"conflict" => Condition::Conflict,
            b"connection-timeout" => Condition::ConnectionTimeout,
            b"host-gone" => Condition::HostGone,
            b"host-unknown" => Condition::HostUnknown,
            b"improper-addressing" => Condition::ImproperAddressing,
            b"internal-server-error" => Condition::InternalServerError,
            b"invalid-from" => Condition::InvalidFrom,
            b"invalid-namespace" => Condition::InvalidNamespace,
            b"invalid-xml" => Condition::InvalidXml,
            b"not-authorized" => Condition::NotAuthorized,
            b"not-well-formed" => Condition::NotWellFormed,
            b"policy-violation" => Condition::PolicyViolation,
            b"remote-connection-failed" => Condition::RemoteConnectionFailed,
            b"reset" => Condition::Reset,
            b"resource-constraint" => Condition::ResourceConstraint,
            b"restricted-xml" => Condition::RestrictedXml,
            b"see-other-host" => Condition::SeeOtherHost,
            b"system-shutdown" => Condition::SystemShutdown,
            b"undefined-condition" => Condition::UndefinedCondition,
            b"unsupported-encoding" => Condition::UnsupportedEncoding,
            b"unsupported-feature" => Condition::UnsupportedFeature,
            b"unsupported-stanza-type" => Condition::UnsupportedStanzaType,
            b"unsupported-version" => Condition::UnsupportedVersion,
            _ => return None,
        })
    }
}

/// A typed stream error with its optional human-readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub condition: Condition,
    pub text: Option<String>,
}

impl StreamError {
    pub fn new(condition: Condition) -> StreamError {
        StreamError {
            condition,
            text: None,
        }
    }

    pub fn with_text(condition: Condition, text: impl Into<String>) -> StreamError {
        StreamError {
            condition,
            text: Some(text.into()),
        }
    }

    /// Reconstructs a stream error from the inner events of a received
    /// `<stream:error>` element. An unrecognized or missing condition maps
    /// to `undefined-condition`.
    pub(crate) fn from_events(inner: &[Event<'static>]) -> StreamError {
        let mut condition = Condition::UndefinedCondition;
        let mut text = None;

        for (start, child_inner) in xml::split_children(inner) {
            let name = start.name();
            let local = name.local_name();
            if local.as_ref() == b"text" {
                let mut s = String::new();
                for event in &child_inner {
                    if let Event::Text(t) = event {
                        if let Ok(unescaped) = t.unescape() {
                            s.push_str(&unescaped);
                        }
                    }
                }
                if !s.is_empty() {
                    text = Some(s);
                }
            } else if let Some(c) = Condition::from_name(local.as_ref()) {
                condition = c;
            }
        }

        StreamError { condition, text }
    }
}

impl IntoXml for StreamError {
    fn into_xml(self) -> Vec<Event<'static>> {
        let mut events = Vec::with_capacity(6);
        events.push(Event::Start(BytesStart::new("stream:error")));

        let mut cond = BytesStart::new(self.condition.as_str());
        cond.push_attribute(("xmlns", ns::STREAM_ERROR));
        events.push(Event::Empty(cond));

        if let Some(text) = self.text {
            let mut t = BytesStart::new("text");
            t.push_attribute(("xmlns", ns::STREAM_ERROR));
            events.push(Event::Start(t));
            events.push(Event::Text(BytesText::from_escaped(
                escape(&text).into_owned(),
            )));
            events.push(Event::End(BytesEnd::new("text")));
        }

        events.push(Event::End(BytesEnd::new("stream:error")));
        events
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream error: {}", self.condition.as_str())?;
        if let Some(text) = &self.text {
            write!(f, " ({text})")?;
        }
        Ok(())
    }
}

impl std::error::Error for StreamError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::{events_to_bytes, parse_events};

    #[test]
    fn test_serialize_condition_only() {
        let bytes = events_to_bytes(&StreamError::new(Condition::NotWellFormed).into_xml());
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "<stream:error><not-well-formed xmlns=\"urn:ietf:params:xml:ns:xmpp-streams\"/></stream:error>"
        );
    }

    #[test]
    fn test_serialize_with_text() {
        let err = StreamError::with_text(Condition::Conflict, "Replaced by new connection");
        let bytes = events_to_bytes(&err.into_xml());
        let s = std::str::from_utf8(&bytes).unwrap();
        assert!(s.contains("<conflict"));
        assert!(s.contains(">Replaced by new connection</text>"));
    }

    #[test]
    fn test_parse_round_trip() {
        let err = StreamError::with_text(Condition::SystemShutdown, "going down");
        let events = err.clone().into_xml();
        // Strip the outer <stream:error> wrapper, as the dispatcher does.
        let inner = &events[1..events.len() - 1];
        let parsed = StreamError::from_events(inner);
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_parse_unknown_condition_is_undefined() {
        let inner = parse_events("<made-up xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>").unwrap();
        let parsed = StreamError::from_events(&inner);
        assert_eq!(parsed.condition, Condition::UndefinedCondition);
    }

    #[test]
    fn test_condition_names() {
        assert_eq!(Condition::BadFormat.as_str(), "bad-format");
        assert_eq!(
            Condition::from_name(b"unsupported-version"),
            Some(Condition::UnsupportedVersion)
        );
        assert_eq!(Condition::from_name(b"nope"), None);
    }
}
