//! Structural stanza types: `message`, `presence` and `iq`.
//!
//! These are thin wrappers over the attribute sets RFC 6120 defines, plus
//! helpers to wrap a payload event stream in the stanza element. Namespace
//! qualification is deliberately absent here: the session's output filter
//! stamps the stream's default namespace onto outgoing stanzas.

mod error;

pub use error::{Condition, ErrorType, StanzaError};

use quick_xml::events::{BytesEnd, BytesStart, Event};

use crate::error::Error;
use crate::jid::Jid;
use crate::xml::{self, IntoXml};

/// Message stanza types (RFC 6121 §5.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    Chat,
    Error,
    Groupchat,
    Headline,
    #[default]
    Normal,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Error => "error",
            MessageType::Groupchat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Normal => "normal",
        }
    }

    pub fn from_name(name: &str) -> Option<MessageType> {
        Some(match name {
            "chat" => MessageType::Chat,
            "error" => MessageType::Error,
            "groupchat" => MessageType::Groupchat,
            "headline" => MessageType::Headline,
            "normal" => MessageType::Normal,
            _ => return None,
        })
    }
}

/// Presence stanza types (RFC 6121 §4.7.1). `Available` is the absent
/// `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceType {
    #[default]
    Available,
    Error,
    Probe,
    Subscribe,
    Subscribed,
    Unavailable,
    Unsubscribe,
    Unsubscribed,
}

impl PresenceType {
    /// The wire value, or `""` for available presence.
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceType::Available => "",
            PresenceType::Error => "error",
            PresenceType::Probe => "probe",
            PresenceType::Subscribe => "subscribe",
            PresenceType::Subscribed => "subscribed",
            PresenceType::Unavailable => "unavailable",
            PresenceType::Unsubscribe => "unsubscribe",
            PresenceType::Unsubscribed => "unsubscribed",
        }
    }

    pub fn from_name(name: &str) -> Option<PresenceType> {
        Some(match name {
            "" => PresenceType::Available,
            "error" => PresenceType::Error,
            "probe" => PresenceType::Probe,
            "subscribe" => PresenceType::Subscribe,
            "subscribed" => PresenceType::Subscribed,
            "unavailable" => PresenceType::Unavailable,
            "unsubscribe" => PresenceType::Unsubscribe,
            "unsubscribed" => PresenceType::Unsubscribed,
            _ => return None,
        })
    }
}

/// IQ stanza types (RFC 6120 §8.2.3). `get` and `set` demand a reply with
/// the same id; `result` and `error` are the replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<IqType> {
        Some(match name {
            "get" => IqType::Get,
            "set" => IqType::Set,
            "result" => IqType::Result,
            "error" => IqType::Error,
            _ => return None,
        })
    }

    /// True for the request types that obligate a reply.
    pub fn needs_reply(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

/// A message stanza header.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub id: String,
    pub to: Option<Jid>,
    pub from: Option<Jid>,
    pub typ: MessageType,
    pub lang: String,
}

impl Message {
    /// A chat message addressed to `to`.
    pub fn chat(to: Jid) -> Message {
        Message {
            to: Some(to),
            typ: MessageType::Chat,
            ..Message::default()
        }
    }

    /// Wraps a payload event stream in this message element.
    pub fn wrap(self, payload: Vec<Event<'static>>) -> Vec<Event<'static>> {
        wrap_stanza("message", self.typ.as_str(), &self.id, &self.to, &self.from, &self.lang, payload)
    }
}

impl IntoXml for Message {
    fn into_xml(self) -> Vec<Event<'static>> {
        self.wrap(Vec::new())
    }
}

/// A presence stanza header.
#[derive(Debug, Clone, Default)]
pub struct Presence {
    pub id: String,
    pub to: Option<Jid>,
    pub from: Option<Jid>,
    pub typ: PresenceType,
    pub lang: String,
}

impl Presence {
    /// Available presence with no addressing (initial presence).
    pub fn available() -> Presence {
        Presence::default()
    }

    /// Unavailable presence addressed to `to` (e.g. leaving a MUC).
    pub fn unavailable(to: Jid) -> Presence {
        Presence {
            to: Some(to),
            typ: PresenceType::Unavailable,
            ..Presence::default()
        }
    }

    /// Wraps a payload event stream in this presence element.
    pub fn wrap(self, payload: Vec<Event<'static>>) -> Vec<Event<'static>> {
        wrap_stanza("presence", self.typ.as_str(), &self.id, &self.to, &self.from, &self.lang, payload)
    }
}

impl IntoXml for Presence {
    fn into_xml(self) -> Vec<Event<'static>> {
        self.wrap(Vec::new())
    }
}

/// An IQ stanza header.
#[derive(Debug, Clone)]
pub struct Iq {
    pub id: String,
    pub to: Option<Jid>,
    pub from: Option<Jid>,
    pub typ: IqType,
    pub lang: String,
}

impl Iq {
    pub fn get(to: Option<Jid>) -> Iq {
        Iq {
            id: String::new(),
            to,
            from: None,
            typ: IqType::Get,
            lang: String::new(),
        }
    }

    pub fn set(to: Option<Jid>) -> Iq {
        Iq {
            typ: IqType::Set,
            ..Iq::get(to)
        }
    }

    /// Builds the result reply skeleton for this request: same id, swapped
    /// addressing.
    pub fn result_for(request: &Iq) -> Iq {
        Iq {
            id: request.id.clone(),
            to: request.from.clone(),
            from: request.to.clone(),
            typ: IqType::Result,
            lang: String::new(),
        }
    }

    /// Parses the stanza header out of an `iq` start element.
    pub fn from_start(start: &BytesStart<'_>) -> Result<Iq, Error> {
        let typ = xml::attr_value(start, "type")
            .and_then(|t| IqType::from_name(&t))
            .ok_or_else(|| Error::Framing("iq stanza with missing or unknown type".into()))?;
        let to = match xml::attr_value(start, "to") {
            Some(v) => Some(Jid::new(&v)?),
            None => None,
        };
        let from = match xml::attr_value(start, "from") {
            Some(v) => Some(Jid::new(&v)?),
            None => None,
        };
        Ok(Iq {
            id: xml::attr_value(start, "id").unwrap_or_default(),
            to,
            from,
            typ,
            lang: xml::attr_value(start, "xml:lang").unwrap_or_default(),
        })
    }

    /// Wraps a payload event stream in this iq element.
    pub fn wrap(self, payload: Vec<Event<'static>>) -> Vec<Event<'static>> {
        wrap_stanza("iq", self.typ.as_str(), &self.id, &self.to, &self.from, &self.lang, payload)
    }
}

impl IntoXml for Iq {
    fn into_xml(self) -> Vec<Event<'static>> {
        self.wrap(Vec::new())
    }
}

fn wrap_stanza(
    name: &'static str,
    typ: &str,
    id: &str,
    to: &Option<Jid>,
    from: &Option<Jid>,
    lang: &str,
    payload: Vec<Event<'static>>,
) -> Vec<Event<'static>> {
    let mut start = BytesStart::new(name);
    if !typ.is_empty() {
        start.push_attribute(("type", typ));
    }
    if !id.is_empty() {
        start.push_attribute(("id", id));
    }
    if let Some(to) = to {
        start.push_attribute(("to", to.to_string().as_str()));
    }
    if let Some(from) = from {
        start.push_attribute(("from", from.to_string().as_str()));
    }
    if !lang.is_empty() {
        start.push_attribute(("xml:lang", lang));
    }

    let mut events = Vec::with_capacity(payload.len() + 2);
    if payload.is_empty() {
        events.push(Event::Empty(start));
    } else {
        events.push(Event::Start(start));
        events.extend(payload);
        events.push(Event::End(BytesEnd::new(name)));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::{events_to_bytes, parse_events};

    #[test]
    fn test_message_wrap() {
        let msg = Message {
            id: "m1".into(),
            to: Some(Jid::new("a@b").unwrap()),
            typ: MessageType::Chat,
            ..Message::default()
        };
        let body = parse_events("<body>hi</body>").unwrap();
        let bytes = events_to_bytes(&msg.wrap(body));
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "<message type=\"chat\" id=\"m1\" to=\"a@b\"><body>hi</body></message>"
        );
    }

    #[test]
    fn test_available_presence_has_no_type() {
        let bytes = events_to_bytes(&Presence::available().into_xml());
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), "<presence/>");
    }

    #[test]
    fn test_unavailable_presence() {
        let p = Presence::unavailable(Jid::new("room@muc.example/nick").unwrap());
        let bytes = events_to_bytes(&p.into_xml());
        let s = std::str::from_utf8(&bytes).unwrap();
        assert!(s.contains("type=\"unavailable\""));
        assert!(s.contains("to=\"room@muc.example/nick\""));
    }

    #[test]
    fn test_iq_parse_and_reply_skeleton() {
        let events = parse_events("<iq type='get' id='q7' from='peer@d/r' to='me@d'/>").unwrap();
        let start = match &events[0] {
            Event::Empty(s) => s.clone(),
            other => panic!("expected empty element, got {other:?}"),
        };
        let iq = Iq::from_start(&start).unwrap();
        assert_eq!(iq.typ, IqType::Get);
        assert!(iq.typ.needs_reply());
        assert_eq!(iq.id, "q7");
        assert_eq!(iq.from, Some(Jid::new("peer@d/r").unwrap()));

        let reply = Iq::result_for(&iq);
        assert_eq!(reply.id, "q7");
        assert_eq!(reply.to, Some(Jid::new("peer@d/r").unwrap()));
        assert_eq!(reply.from, Some(Jid::new("me@d").unwrap()));
        assert_eq!(reply.typ, IqType::Result);
    }

    #[test]
    fn test_iq_unknown_type_rejected() {
        let events = parse_events("<iq type='ask' id='1'/>").unwrap();
        let start = match &events[0] {
            Event::Empty(s) => s.clone(),
            other => panic!("expected empty element, got {other:?}"),
        };
        assert!(Iq::from_start(&start).is_err());
    }

    #[test]
    fn test_iq_round_trip() {
        let iq = Iq {
            id: "r1".into(),
            to: Some(Jid::new("example.com").unwrap()),
            from: None,
            typ: IqType::Result,
            lang: String::new(),
        };
        let events = iq.clone().into_xml();
        let start = match &events[0] {
            Event::Empty(s) => s.clone(),
            other => panic!("expected empty element, got {other:?}"),
        };
        let parsed = Iq::from_start(&start).unwrap();
        assert_eq!(parsed.id, iq.id);
        assert_eq!(parsed.to, iq.to);
        assert_eq!(parsed.typ, iq.typ);
    }
}
