//! Stanza-level errors (RFC 6120 §8.3).
//!
//! Unlike stream errors these are recoverable: they travel inside an
//! `error`-typed stanza and the stream stays up.

use std::fmt;

use quick_xml::escape::escape;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use crate::jid::Jid;
use crate::ns;
use crate::xml::{self, IntoXml};

/// The five stanza error classes (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Retry after providing credentials.
    Auth,
    /// Do not retry; the error cannot be remedied.
    Cancel,
    /// The condition is only a warning.
    Continue,
    /// Retry after changing the data sent.
    Modify,
    /// Retry after waiting.
    Wait,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }

    fn from_name(name: &str) -> Option<ErrorType> {
        Some(match name {
            "auth" => ErrorType::Auth,
            "cancel" => ErrorType::Cancel,
            "continue" => ErrorType::Continue,
            "modify" => ErrorType::Modify,
            "wait" => ErrorType::Wait,
            _ => return None,
        })
    }
}

/// Defined stanza error conditions (RFC 6120 §8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Condition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PolicyViolation,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    UnexpectedRequest,
}

impl Condition {
    /// The defined-condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::BadRequest => "bad-request",
            Condition::Conflict => "conflict",
            Condition::FeatureNotImplemented => "feature-not-implemented",
            Condition::Forbidden => "forbidden",
            Condition::Gone => "gone",
            Condition::InternalServerError => "internal-server-error",
            Condition::ItemNotFound => "item-not-found",
            Condition::JidMalformed => "jid-malformed",
            Condition::NotAcceptable => "not-acceptable",
            Condition::NotAllowed => "not-allowed",
            Condition::NotAuthorized => "not-authorized",
            Condition::PolicyViolation => "policy-violation",
            Condition::RecipientUnavailable => "recipient-unavailable",
            Condition::Redirect => "redirect",
            Condition::RegistrationRequired => "registration-required",
            Condition::RemoteServerNotFound => "remote-server-not-found",
            Condition::RemoteServerTimeout => "remote-server-timeout",
            Condition::ResourceConstraint => "resource-constraint",
            Condition::ServiceUnavailable => "service-unavailable",
            Condition::SubscriptionRequired => "subscription-required",
            Condition::UndefinedCondition => "undefined-condition",
            Condition::UnexpectedRequest => "unexpected-request",
        }
    }

    fn from_name(name: &[u8]) -> Option<Condition> {
        Some(match name {
            b"bad-request" => Condition::BadRequest,
            b"conflict" => Condition::Conflict,
            b"feature-not-implemented" => Condition::FeatureNotImplemented,
            b"forbidden" => Condition::Forbidden,
            b"gone" => Condition::Gone,
            b"internal-server-error" => Condition::InternalServerError,
            b"item-not-found" => Condition::ItemNotFound,
            b"jid-malformed" => Condition::JidMalformed,
            b"not-acceptable" => Condition::NotAcceptable,
            b"not-allowed" => Condition::NotAllowed,
            b"not-authorized" => Condition::NotAuthorized,
            b"policy-violation" => Condition::PolicyViolation,
            b"recipient-unavailable" => Condition::RecipientUnavailable,
            b"redirect" => Condition::Redirect,
            b"registration-required" => Condition::RegistrationRequired,
            b"remote-server-not-found" => Condition::RemoteServerNotFound,
            b"remote-server-timeout" => Condition::RemoteServerTimeout,
            b"resource-constraint" => Condition::ResourceConstraint,
            b"service-unavailable" => Condition::ServiceUnavailable,
            b"subscription-required" => Condition::SubscriptionRequired,
            b"undefined-condition" => Condition::UndefinedCondition,
            b"unexpected-request" => Condition::UnexpectedRequest,
            _ => return None,
        })
    }
}

/// A typed stanza error. Comparison by condition is the common operation, so
/// the fields are public and equality covers all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub typ: ErrorType,
    pub condition: Condition,
    pub text: Option<String>,
    /// The entity that generated the error, if different from the stanza's
    /// addressee.
    pub by: Option<Jid>,
}

impl StanzaError {
    pub fn new(typ: ErrorType, condition: Condition) -> StanzaError {
        StanzaError {
            typ,
            condition,
            text: None,
            by: None,
        }
    }

    pub fn with_text(typ: ErrorType, condition: Condition, text: impl Into<String>) -> StanzaError {
        StanzaError {
            typ,
            condition,
            text: Some(text.into()),
            by: None,
        }
    }

    /// Reconstructs a stanza error from a received `<error>` element.
    pub(crate) fn from_element(start: &BytesStart<'_>, inner: &[Event<'static>]) -> StanzaError {
        let typ = xml::attr_value(start, "type")
            .and_then(|t| ErrorType::from_name(&t))
            .unwrap_or(ErrorType::Cancel);
        let by = xml::attr_value(start, "by").and_then(|b| Jid::new(&b).ok());

        let mut condition = Condition::UndefinedCondition;
        let mut text = None;
        for (child, child_inner) in xml::split_children(inner) {
            let local = child.name().local_name().as_ref().to_vec();
            if local == b"text" {
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
            } else if let Some(c) = Condition::from_name(&local) {
                condition = c;
            }
        }

        StanzaError {
            typ,
            condition,
            text,
            by,
        }
    }
}

impl IntoXml for StanzaError {
    fn into_xml(self) -> Vec<Event<'static>> {
        let mut events = Vec::with_capacity(6);

        let mut error = BytesStart::new("error");
        error.push_attribute(("type", self.typ.as_str()));
        if let Some(by) = &self.by {
            error.push_attribute(("by", by.to_string().as_str()));
        }
        events.push(Event::Start(error));

        let mut cond = BytesStart::new(self.condition.as_str());
        cond.push_attribute(("xmlns", ns::STANZA_ERROR));
        events.push(Event::Empty(cond));

        if let Some(text) = self.text {
            let mut t = BytesStart::new("text");
            t.push_attribute(("xmlns", ns::STANZA_ERROR));
            events.push(Event::Start(t));
            events.push(Event::Text(BytesText::from_escaped(
                escape(&text).into_owned(),
            )));
            events.push(Event::End(BytesEnd::new("text")));
        }

        events.push(Event::End(BytesEnd::new("error")));
        events
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stanza error ({}): {}",
            self.typ.as_str(),
            self.condition.as_str()
        )?;
        if let Some(text) = &self.text {
            write!(f, " ({text})")?;
        }
        Ok(())
    }
}

impl std::error::Error for StanzaError {}
