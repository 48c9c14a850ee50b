//! Outgoing stanza filter.
//!
//! Sits between the senders and the wire. Depth-1 `iq`/`message`/`presence`
//! elements get the attributes RFC 6120 requires of the sending entity:
//! a default-namespace qualification, a non-empty `id` (REQUIRED for iq,
//! RECOMMENDED otherwise), and on server-to-server streams a `from` of the
//! local address. Nested elements pass through untouched.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::xml::{self, random_id};

const STANZA_NAMES: [&[u8]; 3] = [b"iq", b"message", b"presence"];

pub(crate) struct StanzaEncoder {
    depth: usize,
    /// Default stanza namespace of the output stream.
    ns: String,
    /// Local address, stamped as `from` on S2S streams only.
    from: Option<String>,
}

impl StanzaEncoder {
    pub(crate) fn new(ns: String, from: Option<String>) -> StanzaEncoder {
        StanzaEncoder {
            depth: 0,
            ns,
            from,
        }
    }

    /// Filters one outgoing event, tracking element depth.
    pub(crate) fn filter(&mut self, event: Event<'static>) -> Event<'static> {
        match event {
            Event::Start(e) => {
                let filtered = self.filter_start(e);
                self.depth += 1;
                Event::Start(filtered)
            }
            Event::Empty(e) => Event::Empty(self.filter_start(e)),
            Event::End(e) => {
                self.depth = self.depth.saturating_sub(1);
                Event::End(e)
            }
            other => other,
        }
    }

    fn filter_start(&mut self, start: BytesStart<'static>) -> BytesStart<'static> {
        let name = start.name();
        let is_stanza = name.prefix().is_none()
            && STANZA_NAMES.contains(&name.local_name().as_ref());

        let attrs = xml::raw_attrs(&start);
        let ns_ok = attrs
            .iter()
            .find(|(k, _)| k == b"xmlns")
            .map_or(true, |(_, v)| {
                v == crate::ns::CLIENT.as_bytes() || v == crate::ns::SERVER.as_bytes()
            });

        if self.depth == 0 && is_stanza && ns_ok {
            return self.qualify_stanza(&start, attrs);
        }

        // Any other element only gets duplicate-xmlns protection.
        let mut seen_xmlns = false;
        let mut kept = Vec::with_capacity(attrs.len());
        let mut dropped = false;
        for (key, value) in attrs {
            if key == b"xmlns" {
                if seen_xmlns {
                    dropped = true;
                    continue;
                }
                seen_xmlns = true;
            }
            kept.push((key, value));
        }
        if dropped {
            xml::with_attrs(&start, &kept)
        } else {
            start
        }
    }

    /// Rewrites a depth-1 stanza start element per RFC 6120 §4.7/§8.1.
    fn qualify_stanza(
        &mut self,
        start: &BytesStart<'static>,
        attrs: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> BytesStart<'static> {
        let mut kept: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(attrs.len() + 3);
        let mut found_id = false;
        let mut found_from = false;
        let mut found_xmlns = false;

        for (key, value) in attrs {
            match key.as_slice() {
                b"id" => {
                    // An empty id is treated as absent and replaced below.
                    if value.is_empty() {
                        continue;
                    }
                    found_id = true;
                }
                b"from" => {
                    if value.is_empty() {
                        continue;
                    }
                    found_from = true;
                }
                b"xmlns" => {
                    if found_xmlns {
                        continue;
                    }
                    found_xmlns = true;
                }
                _ => {}
            }
            kept.push((key, value));
        }

        if !found_xmlns {
            kept.push((b"xmlns".to_vec(), self.ns.as_bytes().to_vec()));
        }
        if !found_from {
            if let Some(from) = &self.from {
                kept.push((b"from".to_vec(), escape(from).into_owned().into_bytes()));
            }
        }
        if !found_id {
            kept.push((b"id".to_vec(), random_id().into_bytes()));
        }

        xml::with_attrs(start, &kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;
    use crate::xml::{attr_value, events_to_bytes, parse_events};

    fn filter_all(encoder: &mut StanzaEncoder, input: &str) -> Vec<Event<'static>> {
        parse_events(input)
            .unwrap()
            .into_iter()
            .map(|e| encoder.filter(e))
            .collect()
    }

    fn first_start(events: &[Event<'static>]) -> BytesStart<'static> {
        match &events[0] {
            Event::Start(e) | Event::Empty(e) => e.clone(),
            other => panic!("expected start element, got {other:?}"),
        }
    }

    #[test]
    fn test_injects_namespace_and_id() {
        let mut enc = StanzaEncoder::new(ns::CLIENT.into(), None);
        let events = filter_all(&mut enc, "<message to='a@b'>hi</message>");
        let start = first_start(&events);
        assert_eq!(attr_value(&start, "xmlns").as_deref(), Some(ns::CLIENT));
        assert_eq!(attr_value(&start, "to").as_deref(), Some("a@b"));
        let id = attr_value(&start, "id").expect("id generated");
        assert!(!id.is_empty());
        // No from on client-to-server streams.
        assert_eq!(attr_value(&start, "from"), None);
    }

    #[test]
    fn test_empty_stanza_element_is_qualified() {
        let mut enc = StanzaEncoder::new(ns::CLIENT.into(), None);
        let events = filter_all(&mut enc, "<presence/>");
        let start = first_start(&events);
        assert_eq!(attr_value(&start, "xmlns").as_deref(), Some(ns::CLIENT));
        assert!(attr_value(&start, "id").is_some());
    }

    #[test]
    fn test_existing_id_preserved() {
        let mut enc = StanzaEncoder::new(ns::CLIENT.into(), None);
        let events = filter_all(&mut enc, "<iq type='get' id='q1'/>");
        let start = first_start(&events);
        assert_eq!(attr_value(&start, "id").as_deref(), Some("q1"));
    }

    #[test]
    fn test_empty_id_replaced() {
        let mut enc = StanzaEncoder::new(ns::CLIENT.into(), None);
        let events = filter_all(&mut enc, "<iq type='get' id=''/>");
        let start = first_start(&events);
        let id = attr_value(&start, "id").expect("id regenerated");
        assert!(!id.is_empty());
        // Exactly one id attribute survives.
        let serialized = String::from_utf8(events_to_bytes(&events)).unwrap();
        assert_eq!(serialized.matches("id=").count(), 1);
    }

    #[test]
    fn test_s2s_inserts_local_from() {
        let mut enc = StanzaEncoder::new(ns::SERVER.into(), Some("im.example.net".into()));
        let events = filter_all(&mut enc, "<message to='x@other'/>");
        let start = first_start(&events);
        assert_eq!(attr_value(&start, "from").as_deref(), Some("im.example.net"));
    }

    #[test]
    fn test_s2s_keeps_caller_from() {
        let mut enc = StanzaEncoder::new(ns::SERVER.into(), Some("im.example.net".into()));
        let events = filter_all(&mut enc, "<message from='user@im.example.net' to='x@o'/>");
        let start = first_start(&events);
        assert_eq!(
            attr_value(&start, "from").as_deref(),
            Some("user@im.example.net")
        );
    }

    #[test]
    fn test_empty_from_dropped_on_c2s() {
        let mut enc = StanzaEncoder::new(ns::CLIENT.into(), None);
        let events = filter_all(&mut enc, "<message from='' to='a@b'/>");
        let start = first_start(&events);
        assert_eq!(attr_value(&start, "from"), None);
    }

    #[test]
    fn test_nested_elements_untouched() {
        let mut enc = StanzaEncoder::new(ns::CLIENT.into(), None);
        let events = filter_all(
            &mut enc,
            "<iq type='set' id='a'><query xmlns='jabber:iq:roster'><item jid='u@d'/></query></iq>",
        );
        let serialized = String::from_utf8(events_to_bytes(&events)).unwrap();
        // The inner query passes through byte-for-byte, keeping its own
        // namespace and gaining nothing.
        assert!(serialized.contains("<query xmlns='jabber:iq:roster'><item jid='u@d'/></query>"));
    }

    #[test]
    fn test_foreign_namespace_element_not_treated_as_stanza() {
        let mut enc = StanzaEncoder::new(ns::CLIENT.into(), None);
        let events = filter_all(&mut enc, "<message xmlns='urn:example:other'/>");
        let start = first_start(&events);
        // Not a stanza in this stream's namespace: no id injected.
        assert_eq!(attr_value(&start, "id"), None);
    }

    #[test]
    fn test_duplicate_xmlns_removed() {
        let mut enc = StanzaEncoder::new(ns::CLIENT.into(), None);
        let start = {
            let mut s = BytesStart::new("message");
            s.push_attribute(("xmlns", ns::CLIENT));
            s.push_attribute(("xmlns", ns::CLIENT));
            s
        };
        let filtered = enc.filter(Event::Empty(start));
        let serialized = String::from_utf8(events_to_bytes(&[filtered])).unwrap();
        assert_eq!(serialized.matches("xmlns=").count(), 1);
    }

    #[test]
    fn test_depth_tracking_resets_between_stanzas() {
        let mut enc = StanzaEncoder::new(ns::CLIENT.into(), None);
        let first = filter_all(&mut enc, "<message to='a@b'><body>x</body></message>");
        let second = filter_all(&mut enc, "<presence/>");
        assert!(attr_value(&first_start(&first), "id").is_some());
        assert!(attr_value(&first_start(&second), "id").is_some());
    }
}
