//! Outer stream framing: the `<stream:stream>` element and its errors.
//!
//! The opening tag binds the `stream:` prefix in the tag itself and has to
//! survive decoder rebuilds on restart, so it is written as a literal byte
//! template rather than through an XML encoder, and the closing tag is a
//! literal as well. Reading the header is a small per-event state machine so
//! the session can drive it from whatever byte source is current.

mod error;

pub use error::{Condition, StreamError};

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::error::Error;
use crate::jid::Jid;
use crate::ns;
use crate::xml;

/// The only stream version this engine speaks (RFC 6120 §4.7.5).
pub(crate) const DEFAULT_VERSION: &str = "1.0";

/// Literal closing tag for RFC 6120 TCP framing.
pub(crate) const CLOSE_STREAM_TAG: &str = "</stream:stream>";

/// Literal closing tag for RFC 7395 WebSocket framing.
pub(crate) const CLOSE_WS_TAG: &str = r#"<close xmlns="urn:ietf:params:xml:ns:xmpp-framing"/>"#;

/// Per-direction stream information, captured from the stream header.
#[derive(Debug, Clone, Default)]
pub struct Info {
    /// The `to` attribute of the header.
    pub to: Option<Jid>,
    /// The `from` attribute of the header.
    pub from: Option<Jid>,
    /// The stream id. Generated by the receiving side.
    pub id: String,
    /// The `xml:lang` attribute.
    pub lang: String,
    /// The stream version. Always "1.0" once negotiated.
    pub version: String,
    /// The default stanza namespace (`jabber:client` or `jabber:server`).
    pub ns: String,
}

impl Info {
    /// Resets everything except the addressing attributes, which must match
    /// across stream restarts.
    pub(crate) fn reset_for_restart(&mut self) {
        self.id.clear();
        self.lang.clear();
        self.version.clear();
        self.ns.clear();
    }
}

/// Renders the literal stream open: XML declaration plus `<stream:stream …>`.
///
/// Attributes with empty values are omitted. The `id` is only present on
/// headers sent by the receiving side.
pub(crate) fn stream_open_bytes(info: &Info) -> Vec<u8> {
    let mut out = String::from("<?xml version='1.0'?><stream:stream");
    if !info.id.is_empty() {
        push_attr(&mut out, "id", &info.id);
    }
    if let Some(to) = &info.to {
        push_attr(&mut out, "to", &to.to_string());
    }
    if let Some(from) = &info.from {
        push_attr(&mut out, "from", &from.to_string());
    }
    push_attr(&mut out, "version", DEFAULT_VERSION);
    if !info.lang.is_empty() {
        push_attr(&mut out, "xml:lang", &info.lang);
    }
    push_attr(&mut out, "xmlns", &info.ns);
    push_attr(&mut out, "xmlns:stream", ns::STREAM);
    out.push('>');
    out.into_bytes()
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("='");
    out.push_str(&escape(value));
    out.push('\'');
}

enum HeaderState {
    /// Waiting for the XML declaration or the stream start element.
    Expect { seen_decl: bool },
    /// Inside a top-level `<stream:error>`, accumulating its contents.
    InError {
        depth: usize,
        inner: Vec<Event<'static>>,
    },
}

/// Event-driven parser for one incoming stream header.
///
/// Feed it events until it yields an [`Info`]; every protocol violation maps
/// to the stream error RFC 6120 prescribes for it.
pub(crate) struct HeaderParser {
    state: HeaderState,
    /// True on the receiving side, where a missing stream id is tolerated.
    received: bool,
}

impl HeaderParser {
    pub(crate) fn new(received: bool) -> HeaderParser {
        HeaderParser {
            state: HeaderState::Expect { seen_decl: false },
            received,
        }
    }

    /// Consumes one event. Returns `Ok(Some(info))` once the header is
    /// complete, `Ok(None)` while more events are needed.
    pub(crate) fn feed(&mut self, event: Event<'static>) -> Result<Option<Info>, Error> {
        match &mut self.state {
            HeaderState::Expect { seen_decl } => match event {
                Event::Decl(decl) => {
                    if *seen_decl {
                        return Err(StreamError::new(Condition::RestrictedXml).into());
                    }
                    *seen_decl = true;
                    check_decl(&decl)?;
                    Ok(None)
                }
                Event::Text(t) => {
                    if xml::is_xml_whitespace(&t) {
                        Ok(None)
                    } else {
                        Err(StreamError::new(Condition::RestrictedXml).into())
                    }
                }
                Event::Start(start) => {
                    if start.name().as_ref() == b"stream:error" {
                        self.state = HeaderState::InError {
                            depth: 1,
                            inner: Vec::new(),
                        };
                        return Ok(None);
                    }
                    self.parse_start(&start).map(Some)
                }
                Event::End(_) => Err(StreamError::new(Condition::NotWellFormed).into()),
                Event::Eof => Err(StreamError::new(Condition::NotWellFormed).into()),
                // Processing instructions, comments, doctypes and premature
                // empty elements are all restricted at the stream level.
                _ => Err(StreamError::new(Condition::RestrictedXml).into()),
            },
            HeaderState::InError { depth, inner } => {
                match &event {
                    Event::Start(_) => *depth += 1,
                    Event::End(_) => {
                        *depth -= 1;
                        if *depth == 0 {
                            let err = StreamError::from_events(inner);
                            return Err(err.into());
                        }
                    }
                    Event::Eof => {
                        return Err(StreamError::new(Condition::NotWellFormed).into());
                    }
                    _ => {}
                }
                inner.push(event);
                Ok(None)
            }
        }
    }

    fn parse_start(&self, start: &BytesStart<'static>) -> Result<Info, Error> {
        let name = start.name();
        if name.local_name().as_ref() != b"stream" {
            return Err(StreamError::new(Condition::BadFormat).into());
        }
        if name.as_ref() != b"stream:stream" {
            return Err(StreamError::new(Condition::InvalidNamespace).into());
        }

        let mut info = Info::default();
        for attr in start.attributes().flatten() {
            let value = match attr.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(_) => return Err(StreamError::new(Condition::BadFormat).into()),
            };
            match attr.key.as_ref() {
                b"to" => {
                    info.to = Some(
                        Jid::new(&value)
                            .map_err(|_| StreamError::new(Condition::ImproperAddressing))?,
                    );
                }
                b"from" => {
                    info.from = Some(
                        Jid::new(&value)
                            .map_err(|_| StreamError::new(Condition::ImproperAddressing))?,
                    );
                }
                b"id" => info.id = value,
                b"version" => info.version = value,
                b"xml:lang" => info.lang = value,
                b"xmlns" => {
                    if value != ns::CLIENT && value != ns::SERVER {
                        return Err(StreamError::new(Condition::InvalidNamespace).into());
                    }
                    info.ns = value;
                }
                b"xmlns:stream" => {
                    if value != ns::STREAM {
                        return Err(StreamError::new(Condition::InvalidNamespace).into());
                    }
                }
                _ => {}
            }
        }

        if info.version != DEFAULT_VERSION {
            return Err(StreamError::new(Condition::UnsupportedVersion).into());
        }
        if !self.received && info.id.is_empty() {
            // The receiving side must assign a stream id.
            return Err(StreamError::new(Condition::BadFormat).into());
        }

        Ok(info)
    }
}

fn check_decl(decl: &quick_xml::events::BytesDecl<'_>) -> Result<(), Error> {
    if let Ok(version) = decl.version() {
        if version.as_ref() != b"1.0" {
            return Err(StreamError::new(Condition::RestrictedXml).into());
        }
    }
    if let Some(Ok(encoding)) = decl.encoding() {
        if !encoding.as_ref().eq_ignore_ascii_case(b"utf-8") {
            return Err(StreamError::new(Condition::UnsupportedEncoding).into());
        }
    }
    Ok(())
}
