//! XML token layer: incremental event extraction and literal serialization.
//!
//! The engine never hands the transport to a long-lived XML parser. Incoming
//! bytes accumulate in a [`TokenBuffer`] and each token is extracted with a
//! fresh `quick_xml::Reader` over the buffered slice; a syntax error at the
//! end of the buffer just means the token is still in flight on the wire.
//! This is what makes mid-stream transport replacement safe: dropping the
//! buffer discards all decoder state.
//!
//! Serialization is the mirror image: events are written back out literally,
//! preserving the original escaped text, so tokens copied from the input to
//! the output survive byte-for-byte.

use std::borrow::Cow;

use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;

use crate::error::Error;

/// Length of generated stanza and stream ids.
const ID_LEN: usize = 16;

/// A value that can be turned into a stream of XML events.
///
/// Implemented by the stanza types and by plain event vectors, this is what
/// the session's `encode` family accepts.
pub trait IntoXml {
    /// Consumes the value and returns its XML event stream.
    fn into_xml(self) -> Vec<Event<'static>>;
}

impl IntoXml for Vec<Event<'static>> {
    fn into_xml(self) -> Vec<Event<'static>> {
        self
    }
}

/// True if the bytes are nothing but XML 1.0 `S` whitespace (space, tab,
/// CR, LF). Deliberately narrower than ASCII whitespace: form-feed is not a
/// legal XML character and must not pass as a keepalive.
pub(crate) fn is_xml_whitespace(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .all(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
}

/// Generates a random alphanumeric id for stanzas and streams.
pub(crate) fn random_id() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

/// Accumulates transport bytes and extracts complete XML events.
///
/// `next_event` parses the buffered bytes with a fresh reader each call and
/// drains exactly the bytes the returned event consumed. An event that is
/// still incomplete (the tail of the buffer stops mid-tag) yields `None`
/// until more bytes arrive.
pub(crate) struct TokenBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl TokenBuffer {
    pub(crate) fn new(limit: usize) -> TokenBuffer {
        TokenBuffer {
            buf: Vec::new(),
            limit,
        }
    }

    /// Discards all buffered bytes and parser state. Called on stream
    /// restarts and transport swaps.
    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }

    /// True if undelivered bytes remain in the buffer.
    pub(crate) fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Appends transport bytes, enforcing the buffer cap.
    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.buf.len() + bytes.len() > self.limit {
            return Err(Error::Framing(format!(
                "token buffer exceeded {} byte limit",
                self.limit
            )));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Extracts the next complete event, or `None` if more bytes are needed.
    pub(crate) fn next_event(&mut self) -> Result<Option<Event<'static>>, Error> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut reader = Reader::from_reader(self.buf.as_slice());
        reader.check_end_names(false);
        reader.trim_text(false);

        match reader.read_event() {
            Ok(Event::Eof) => Ok(None),
            Ok(event) => {
                let consumed = reader.buffer_position() as usize;
                let event = event.into_owned();
                self.buf.drain(..consumed);
                Ok(Some(event))
            }
            // An unexpected-EOF error here almost always means the buffer ends in
            // the middle of a token; wait for more bytes. Genuinely malformed
            // input eventually trips the buffer cap instead.
            Err(quick_xml::Error::UnexpectedEof(_)) => Ok(None),
            Err(e) => Err(Error::Framing(format!("malformed XML on stream: {e}"))),
        }
    }
}

/// Serializes one event to its literal byte form.
///
/// The `Bytes*` payloads hold the raw (already escaped) content between the
/// angle brackets, so this is a straight reassembly.
pub(crate) fn write_event(out: &mut Vec<u8>, event: &Event<'_>) {
    match event {
        Event::Start(e) => {
            out.push(b'<');
            out.extend_from_slice(e);
            out.push(b'>');
        }
        Event::Empty(e) => {
            out.push(b'<');
            out.extend_from_slice(e);
            out.extend_from_slice(b"/>");
        }
        Event::End(e) => {
            out.extend_from_slice(b"</");
            out.extend_from_slice(e);
            out.push(b'>');
        }
        Event::Text(e) => out.extend_from_slice(e),
        Event::CData(e) => {
            out.extend_from_slice(b"<![CDATA[");
            out.extend_from_slice(e);
            out.extend_from_slice(b"]]>");
        }
        Event::Comment(e) => {
            out.extend_from_slice(b"<!--");
            out.extend_from_slice(e);
            out.extend_from_slice(b"-->");
        }
        Event::Decl(e) => {
            out.extend_from_slice(b"<?");
            out.extend_from_slice(e);
            out.extend_from_slice(b"?>");
        }
        Event::PI(e) => {
            out.extend_from_slice(b"<?");
            out.extend_from_slice(e);
            out.extend_from_slice(b"?>");
        }
        Event::DocType(e) => {
            out.extend_from_slice(b"<!DOCTYPE ");
            out.extend_from_slice(e);
            out.push(b'>');
        }
        Event::Eof => {}
    }
}

/// Serializes a whole event slice into a fresh byte vector.
pub fn events_to_bytes(events: &[Event<'_>]) -> Vec<u8> {
    let mut out = Vec::new();
    for event in events {
        write_event(&mut out, event);
    }
    out
}

/// Looks up an attribute by qualified name, returning its unescaped value.
pub(crate) fn attr_value(start: &BytesStart<'_>, name: &str) -> Option<String> {
    for attr in start.attributes().flatten() {
        if attr.key.as_ref() == name.as_bytes() {
            return attr.unescape_value().ok().map(|v| v.into_owned());
        }
    }
    None
}

/// Rebuilds a start element with the same name and a replacement attribute
/// list. Values are raw (already escaped) bytes taken from parsed attributes.
pub(crate) fn with_attrs(
    start: &BytesStart<'_>,
    attrs: &[(Vec<u8>, Vec<u8>)],
) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut rebuilt = BytesStart::new(name);
    for (key, value) in attrs {
        rebuilt.push_attribute(Attribute {
            key: QName(key),
            value: Cow::Borrowed(value.as_slice()),
        });
    }
    rebuilt.into_owned()
}

/// Collects the raw `(key, value)` attribute pairs of a start element.
pub(crate) fn raw_attrs(start: &BytesStart<'_>) -> Vec<(Vec<u8>, Vec<u8>)> {
    start
        .attributes()
        .flatten()
        .map(|a| (a.key.as_ref().to_vec(), a.value.into_owned()))
        .collect()
}

/// Splits a flat event list into its depth-0 child elements.
///
/// Each child is returned as its start element plus its inner events.
/// Top-level character data (whitespace between children) is discarded.
pub(crate) fn split_children(
    events: &[Event<'static>],
) -> Vec<(BytesStart<'static>, Vec<Event<'static>>)> {
    let mut children = Vec::new();
    let mut current: Option<(BytesStart<'static>, Vec<Event<'static>>)> = None;
    let mut depth = 0usize;

    for event in events {
        match event {
            Event::Start(e) => {
                if depth == 0 {
                    current = Some((e.clone(), Vec::new()));
                } else if let Some((_, inner)) = current.as_mut() {
                    inner.push(event.clone());
                }
                depth += 1;
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(child) = current.take() {
                        children.push(child);
                    }
                } else if let Some((_, inner)) = current.as_mut() {
                    inner.push(event.clone());
                }
            }
            Event::Empty(e) => {
                if depth == 0 {
                    children.push((e.clone(), Vec::new()));
                } else if let Some((_, inner)) = current.as_mut() {
                    inner.push(event.clone());
                }
            }
            _ => {
                if depth > 0 {
                    if let Some((_, inner)) = current.as_mut() {
                        inner.push(event.clone());
                    }
                }
            }
        }
    }
    children
}

/// Approximate serialized size of an event, used to bound element buffering.
pub(crate) fn event_len(event: &Event<'_>) -> usize {
    let content = match event {
        Event::Start(e) => e.len(),
        Event::Empty(e) => e.len(),
        Event::End(e) => e.len(),
        Event::Text(e) => e.len(),
        Event::CData(e) => e.len(),
        Event::Comment(e) => e.len(),
        Event::Decl(e) => e.len(),
        Event::PI(e) => e.len(),
        Event::DocType(e) => e.len(),
        Event::Eof => 0,
    };
    content + 12
}

/// Pulls owned events out of an async byte source.
///
/// Keeps the incremental [`TokenBuffer`] plus a pushback queue so callers can
/// unread an event they looked at but decided not to consume. The byte
/// source is passed per call rather than owned, which lets negotiation use
/// the whole transport while a live session uses only its read half.
pub(crate) struct EventReader {
    buf: TokenBuffer,
    pending: std::collections::VecDeque<Event<'static>>,
}

impl EventReader {
    pub(crate) fn new(limit: usize) -> EventReader {
        EventReader {
            buf: TokenBuffer::new(limit),
            pending: std::collections::VecDeque::new(),
        }
    }

    /// Discards buffered bytes and queued events. Called on stream restarts
    /// and transport swaps so no stale decoder state survives.
    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.pending.clear();
    }

    /// Pushes an event back; the next `next_event` call returns it first.
    pub(crate) fn unread(&mut self, event: Event<'static>) {
        self.pending.push_front(event);
    }

    /// Returns the next event, reading from `io` as needed. A clean
    /// end-of-stream yields `Event::Eof`; EOF in the middle of a token is a
    /// framing error.
    pub(crate) async fn next_event<R>(&mut self, io: &mut R) -> Result<Event<'static>, Error>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        use tokio::io::AsyncReadExt;

        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        loop {
            if let Some(event) = self.buf.next_event()? {
                return Ok(event);
            }
            let mut read_buf = [0u8; 8192];
            let n = io.read(&mut read_buf).await?;
            if n == 0 {
                if self.buf.has_pending() {
                    return Err(Error::Framing(
                        "transport closed in the middle of a token".into(),
                    ));
                }
                return Ok(Event::Eof);
            }
            self.buf.push_bytes(&read_buf[..n])?;
        }
    }

    /// Reads the inner events of an element whose start was just consumed,
    /// up to and excluding its end element. Bounded by `cap` serialized
    /// bytes.
    pub(crate) async fn read_inner<R>(
        &mut self,
        io: &mut R,
        cap: usize,
    ) -> Result<Vec<Event<'static>>, Error>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut inner = Vec::new();
        let mut depth = 1usize;
        let mut size = 0usize;
        loop {
            let event = self.next_event(io).await?;
            match &event {
                Event::Start(_) => depth += 1,
                Event::End(_) => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(inner);
                    }
                }
                Event::Eof => {
                    return Err(Error::Framing(
                        "transport closed inside an element".into(),
                    ));
                }
                _ => {}
            }
            size += event_len(&event);
            if size > cap {
                return Err(Error::Framing(format!(
                    "element exceeded {cap} byte limit"
                )));
            }
            inner.push(event);
        }
    }
}

/// Buffers outgoing events and writes them to an async sink on flush.
///
/// One flush per top-level element gives per-element write atomicity: the
/// serialized bytes leave in a single `write_all`.
pub(crate) struct EventWriter {
    buf: Vec<u8>,
}

impl EventWriter {
    pub(crate) fn new() -> EventWriter {
        EventWriter { buf: Vec::new() }
    }

    pub(crate) fn write_event(&mut self, event: &Event<'_>) {
        write_event(&mut self.buf, event);
    }

    pub(crate) fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Sends all buffered bytes and flushes the sink.
    pub(crate) async fn flush<W>(&mut self, io: &mut W) -> Result<(), Error>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        use tokio::io::AsyncWriteExt;

        if !self.buf.is_empty() {
            io.write_all(&self.buf).await?;
            self.buf.clear();
        }
        io.flush().await?;
        Ok(())
    }

    /// Drops buffered bytes without sending them. Used on restarts.
    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Parses a standalone XML string into owned events. The input must be a
/// complete, balanced fragment.
pub fn parse_events(xml: &str) -> Result<Vec<Event<'static>>, Error> {
    let mut buf = TokenBuffer::new(xml.len() + 1);
    buf.push_bytes(xml.as_bytes())?;
    let mut events = Vec::new();
    while let Some(event) = buf.next_event()? {
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- TokenBuffer extraction ---

    #[test]
    fn test_extract_complete_events() {
        let mut buf = TokenBuffer::new(1024);
        buf.push_bytes(b"<iq type='get' id='1'><ping/></iq>").unwrap();

        assert!(matches!(buf.next_event().unwrap(), Some(Event::Start(_))));
        assert!(matches!(buf.next_event().unwrap(), Some(Event::Empty(_))));
        assert!(matches!(buf.next_event().unwrap(), Some(Event::End(_))));
        assert!(buf.next_event().unwrap().is_none());
        assert!(!buf.has_pending());
    }

    #[test]
    fn test_partial_tag_waits_for_more_bytes() {
        let mut buf = TokenBuffer::new(1024);
        buf.push_bytes(b"<message to='a@exam").unwrap();
        assert!(buf.next_event().unwrap().is_none());
        assert!(buf.has_pending());

        buf.push_bytes(b"ple.com'>").unwrap();
        let event = buf.next_event().unwrap().unwrap();
        match event {
            Event::Start(e) => assert_eq!(e.name().as_ref(), b"message"),
            other => panic!("expected start element, got {other:?}"),
        }
    }

    #[test]
    fn test_buffer_cap_enforced() {
        let mut buf = TokenBuffer::new(8);
        assert!(buf.push_bytes(b"<aaaaaaaaaa").is_err());
    }

    #[test]
    fn test_whitespace_keepalive_is_text_event() {
        let mut buf = TokenBuffer::new(64);
        buf.push_bytes(b" \n\t").unwrap();
        match buf.next_event().unwrap() {
            Some(Event::Text(t)) => assert_eq!(t.as_ref(), b" \n\t"),
            other => panic!("expected text event, got {other:?}"),
        }
    }

    #[test]
    fn test_xml_whitespace_is_the_s_production_only() {
        assert!(is_xml_whitespace(b" \t\r\n"));
        assert!(is_xml_whitespace(b""));
        // Form-feed and vertical tab are not legal XML characters; they
        // must not count as keepalives.
        assert!(!is_xml_whitespace(b" \x0c "));
        assert!(!is_xml_whitespace(b"\x0b"));
        assert!(!is_xml_whitespace(b" x "));
    }

    // --- serialization round trips ---

    #[test]
    fn test_serialize_round_trip() {
        let inputs = [
            "<iq type='get' id='1'><ping/></iq>",
            "<message to='a@b'><body>Hello &amp; welcome &lt;friend&gt;</body></message>",
            "<presence/>",
            "<message><body><![CDATA[raw <content>]]></body></message>",
        ];
        for input in inputs {
            let events = parse_events(input).unwrap();
            let bytes = events_to_bytes(&events);
            assert_eq!(std::str::from_utf8(&bytes).unwrap(), input);
        }
    }

    // --- attribute helpers ---

    #[test]
    fn test_attr_value_unescapes() {
        let events = parse_events("<iq id='a&amp;b' type='get'/>").unwrap();
        match &events[0] {
            Event::Empty(e) => {
                assert_eq!(attr_value(e, "id").as_deref(), Some("a&b"));
                assert_eq!(attr_value(e, "type").as_deref(), Some("get"));
                assert_eq!(attr_value(e, "from"), None);
            }
            other => panic!("expected empty element, got {other:?}"),
        }
    }

    #[test]
    fn test_with_attrs_rebuilds_element() {
        let events = parse_events("<iq id='1' type='get'/>").unwrap();
        let start = match &events[0] {
            Event::Empty(e) => e.clone(),
            other => panic!("expected empty element, got {other:?}"),
        };
        let mut attrs = raw_attrs(&start);
        attrs.retain(|(k, _)| k != b"id");
        let rebuilt = with_attrs(&start, &attrs);
        assert_eq!(attr_value(&rebuilt, "id"), None);
        assert_eq!(attr_value(&rebuilt, "type").as_deref(), Some("get"));
    }

    // --- child splitting ---

    #[test]
    fn test_split_children_groups_elements() {
        let events = parse_events(
            "<a><x>1</x></a> <b/><c attr='v'><y/><z>t</z></c>",
        )
        .unwrap();
        let children = split_children(&events);
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].0.name().as_ref(), b"a");
        assert_eq!(children[0].1.len(), 3);
        assert_eq!(children[1].0.name().as_ref(), b"b");
        assert!(children[1].1.is_empty());
        assert_eq!(children[2].0.name().as_ref(), b"c");
        assert_eq!(children[2].1.len(), 4);
    }
}
