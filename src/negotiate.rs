//! Stream negotiation: the negotiator contract and the default
//! feature-driven negotiator.
//!
//! A negotiator is invoked repeatedly by the session constructor until the
//! `READY` bit is set. Each invocation may OR bits into the session state,
//! hand back a replacement transport (a TLS upgrade, or the same transport to
//! force a bare stream restart) and thread an opaque carry value into its
//! next invocation. The default negotiator composes an ordered list of
//! [`StreamFeature`]s and walks them to completion, restarting the stream
//! whenever a feature swaps the transport.

use std::any::Any;
use std::collections::{HashMap, HashSet};

use futures_util::future::BoxFuture;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use tracing::{debug, info};

use crate::conn::Conn;
use crate::error::Error;
use crate::jid::Jid;
use crate::ns;
use crate::session::{SessionState, MAX_STANZA_BUFFER_SIZE};
use crate::stream::{self, HeaderParser, Info, StreamError};
use crate::xml::{self, EventReader, EventWriter};

/// Opaque parsed-feature value stored in the per-stream feature registry.
pub type FeatureData = Box<dyn Any + Send + Sync>;

/// Opaque value a negotiator threads between its own invocations.
pub type Carry = Box<dyn Any + Send>;

/// Result of one negotiator invocation.
pub struct Step {
    /// Bits to OR into the session state.
    pub mask: SessionState,
    /// Replacement transport. `Some` forces a stream restart; the session
    /// rebuilds its XML machinery and clears the feature registry.
    pub conn: Option<Conn>,
    /// Value handed to the next invocation.
    pub carry: Option<Carry>,
}

/// Result of negotiating one stream feature.
pub struct Negotiated {
    /// Bits to OR into the session state.
    pub mask: SessionState,
    /// Replacement transport, when the feature changed the wire.
    pub conn: Option<Conn>,
}

impl Negotiated {
    /// A feature outcome that only sets state bits.
    pub fn mask(mask: SessionState) -> Negotiated {
        Negotiated { mask, conn: None }
    }
}

/// Drives stream negotiation for a session.
///
/// Most code wants [`FeatureNegotiator`]; implementing this directly is only
/// useful to replace the whole negotiation strategy.
pub trait Negotiator: Send {
    /// Performs one negotiation round.
    fn negotiate(
        &mut self,
        handshake: &mut Handshake,
        carry: Option<Carry>,
    ) -> impl std::future::Future<Output = Result<Step, Error>> + Send;
}

/// One pluggable stream feature (STARTTLS, SASL, resource binding, …).
///
/// The engine only knows the negotiation contract; what a feature does to
/// the wire is its own business.
pub trait StreamFeature: Send + Sync {
    /// The feature namespace, used as its registry key and to match its
    /// advertisement and negotiation command.
    fn namespace(&self) -> &'static str;

    /// True if the initiating side must negotiate this feature before the
    /// session can become ready.
    fn mandatory(&self) -> bool {
        false
    }

    /// State bits that must be set before this feature becomes eligible
    /// (SASL requires `SECURE`, say).
    fn necessary(&self) -> SessionState {
        SessionState::empty()
    }

    /// State bits that make this feature ineligible (STARTTLS is pointless
    /// once `SECURE` is set).
    fn prohibited(&self) -> SessionState {
        SessionState::empty()
    }

    /// Feature namespaces that must be negotiated before this one becomes
    /// eligible.
    fn prerequisites(&self) -> &'static [&'static str] {
        &[]
    }

    /// Events advertising this feature inside `<stream:features>`, emitted
    /// by the receiving side.
    fn advertise(&self, state: SessionState) -> Vec<Event<'static>>;

    /// Parses the peer's advertisement of this feature on the initiating
    /// side. Returns whether the peer marked it required, plus an opaque
    /// parsed value kept in the session's feature registry.
    fn parse(
        &self,
        start: &BytesStart<'static>,
        inner: &[Event<'static>],
    ) -> Result<(bool, FeatureData), Error>;

    /// Drives the feature to completion. On the receiving side the peer's
    /// command element is the next event on the handshake reader.
    fn negotiate<'a>(
        &'a self,
        handshake: &'a mut Handshake,
        data: Option<&'a FeatureData>,
    ) -> BoxFuture<'a, Result<Negotiated, Error>>;
}

/// Mutable negotiation-time view of a session.
///
/// Owns the transport whole (reads and writes interleave during negotiation)
/// plus the stream infos and the feature registry. Once `READY` is set the
/// session constructor tears this apart into the locked full-duplex halves.
pub struct Handshake {
    pub(crate) conn: Option<Conn>,
    pub(crate) reader: EventReader,
    pub(crate) writer: EventWriter,
    pub(crate) state: SessionState,
    pub(crate) in_info: Info,
    pub(crate) out_info: Info,
    pub(crate) features: HashMap<String, FeatureData>,
    pub(crate) negotiated: HashSet<String>,
    pub(crate) lang: String,
}

impl Handshake {
    pub(crate) fn new(
        location: Option<Jid>,
        origin: Option<Jid>,
        conn: Conn,
        mut state: SessionState,
        lang: String,
    ) -> Handshake {
        if conn.is_secure() {
            state |= SessionState::SECURE;
        }

        let mut in_info = Info::default();
        let mut out_info = Info::default();
        if state.contains(SessionState::RECEIVED) {
            in_info.to = location.clone();
            in_info.from = origin.clone();
            out_info.to = origin;
            out_info.from = location;
        } else {
            in_info.to = origin.clone();
            in_info.from = location.clone();
            out_info.to = location;
            out_info.from = origin;
        }

        Handshake {
            conn: Some(conn),
            reader: EventReader::new(MAX_STANZA_BUFFER_SIZE),
            writer: EventWriter::new(),
            state,
            in_info,
            out_info,
            features: HashMap::new(),
            negotiated: HashSet::new(),
            lang,
        }
    }

    /// The session state accumulated so far.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True if the session was initiated by the peer.
    pub fn received(&self) -> bool {
        self.state.contains(SessionState::RECEIVED)
    }

    /// The local address: origin for initiated sessions, location for
    /// received ones.
    pub fn local_addr(&self) -> Option<&Jid> {
        self.in_info.to.as_ref()
    }

    /// The remote address.
    pub fn remote_addr(&self) -> Option<&Jid> {
        self.in_info.from.as_ref()
    }

    /// Looks up the parsed advertisement of a feature for the current
    /// stream.
    pub fn feature(&self, namespace: &str) -> Option<&FeatureData> {
        self.features.get(namespace)
    }

    /// Removes a parsed advertisement from the registry.
    pub fn take_feature(&mut self, namespace: &str) -> Option<FeatureData> {
        self.features.remove(namespace)
    }

    /// Records the parsed advertisement of a feature.
    pub fn set_feature(&mut self, namespace: &str, data: FeatureData) {
        self.features.insert(namespace.to_string(), data);
    }

    /// True if the feature was negotiated on the current stream.
    pub fn is_negotiated(&self, namespace: &str) -> bool {
        self.negotiated.contains(namespace)
    }

    /// Marks a feature negotiated for the current stream.
    pub fn mark_negotiated(&mut self, namespace: &str) {
        self.negotiated.insert(namespace.to_string());
    }

    /// Takes the transport out of the handshake so a feature can wrap it.
    /// The feature must return a replacement via [`Negotiated::conn`].
    pub fn take_conn(&mut self) -> Option<Conn> {
        self.conn.take()
    }

    /// Reads the next event from the transport.
    pub async fn read_event(&mut self) -> Result<Event<'static>, Error> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::Framing("transport taken during negotiation".into()))?;
        self.reader.next_event(conn).await
    }

    /// Reads the remaining events of an element whose start was consumed.
    pub async fn read_inner(&mut self) -> Result<Vec<Event<'static>>, Error> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::Framing("transport taken during negotiation".into()))?;
        self.reader.read_inner(conn, MAX_STANZA_BUFFER_SIZE).await
    }

    /// Pushes an event back onto the reader.
    pub fn unread(&mut self, event: Event<'static>) {
        self.reader.unread(event);
    }

    /// Queues events for the next flush.
    pub fn write_events(&mut self, events: &[Event<'static>]) {
        for event in events {
            self.writer.write_event(event);
        }
    }

    /// Sends everything queued on the writer.
    pub async fn flush(&mut self) -> Result<(), Error> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::Framing("transport taken during negotiation".into()))?;
        self.writer.flush(conn).await
    }

    /// Writes this side's stream header. Receiving sides pass the stream id
    /// they assign.
    pub async fn send_stream_open(&mut self, id: Option<String>) -> Result<(), Error> {
        self.out_info.reset_for_restart();
        self.out_info.ns = if self.state.contains(SessionState::S2S) {
            ns::SERVER.to_string()
        } else {
            ns::CLIENT.to_string()
        };
        self.out_info.version = stream::DEFAULT_VERSION.to_string();
        self.out_info.lang = self.lang.clone();
        if let Some(id) = id {
            self.out_info.id = id;
        }
        let bytes = stream::stream_open_bytes(&self.out_info);
        debug!(header = %String::from_utf8_lossy(&bytes), "sending stream header");
        self.writer.write_raw(&bytes);
        self.flush().await
    }

    /// Reads and validates the peer's stream header. Addressing must match
    /// what this side already expects; later streams of the same session
    /// must repeat the addressing of the first.
    pub async fn recv_stream_open(&mut self) -> Result<(), Error> {
        let mut parser = HeaderParser::new(self.received());
        let header = loop {
            let event = self.read_event().await?;
            if let Some(info) = parser.feed(event)? {
                break info;
            }
        };

        // Adopt addressing we did not know yet; reject changes to
        // addressing we do.
        match (&self.in_info.to, &header.to) {
            (Some(expected), Some(got)) if expected != got => {
                return Err(StreamError::new(stream::Condition::InvalidFrom).into());
            }
            (None, Some(got)) => self.in_info.to = Some(got.clone()),
            _ => {}
        }
        match (&self.in_info.from, &header.from) {
            (Some(expected), Some(got)) if expected != got => {
                return Err(StreamError::new(stream::Condition::InvalidFrom).into());
            }
            (None, Some(got)) => self.in_info.from = Some(got.clone()),
            _ => {}
        }

        self.in_info.id = header.id;
        self.in_info.lang = header.lang;
        self.in_info.version = header.version;
        self.in_info.ns = header.ns;
        debug!(id = %self.in_info.id, ns = %self.in_info.ns, "received stream header");
        Ok(())
    }

    /// Installs a replacement transport, clearing every per-stream artifact:
    /// buffered bytes, queued events and the feature registry.
    pub(crate) fn install_conn(&mut self, conn: Conn) {
        if conn.is_secure() {
            self.state |= SessionState::SECURE;
        }
        self.conn = Some(conn);
        self.reader.clear();
        self.writer.clear();
        self.features.clear();
        self.negotiated.clear();
    }
}

/// Configuration for the default negotiator.
#[derive(Default)]
pub struct StreamConfig {
    /// Value of the `xml:lang` attribute on outgoing stream headers.
    pub lang: String,
    /// Features to negotiate, in preference order.
    pub features: Vec<Box<dyn StreamFeature>>,
}

/// The default negotiator: exchanges stream headers, advertises or consumes
/// `<stream:features>`, and negotiates one feature per round until nothing
/// required remains.
pub struct FeatureNegotiator {
    features: Vec<Box<dyn StreamFeature>>,
    lang: String,
    /// Namespaces the peer marked `<required/>` in the current
    /// advertisement.
    required_by_peer: HashSet<String>,
    exchange_header: bool,
    need_features: bool,
}

impl FeatureNegotiator {
    pub fn new(config: StreamConfig) -> FeatureNegotiator {
        FeatureNegotiator {
            features: config.features,
            lang: config.lang,
            required_by_peer: HashSet::new(),
            exchange_header: true,
            need_features: false,
        }
    }

    fn prerequisites_met(&self, feature: &dyn StreamFeature, handshake: &Handshake) -> bool {
        feature
            .prerequisites()
            .iter()
            .all(|ns| handshake.is_negotiated(ns))
    }

    /// True if the session state permits negotiating this feature at all.
    fn state_permits(feature: &dyn StreamFeature, state: SessionState) -> bool {
        state.contains(feature.necessary()) && !state.intersects(feature.prohibited())
    }

    /// Picks the next feature for the initiating side: required features
    /// first, then optional; within a class, advertisement order. A required
    /// feature with unmet prerequisites selects an advertised prerequisite
    /// instead of failing.
    fn select(&self, handshake: &Handshake) -> Option<usize> {
        let state = handshake.state();
        let candidate = |f: &dyn StreamFeature| {
            !handshake.is_negotiated(f.namespace())
                && handshake.feature(f.namespace()).is_some()
                && Self::state_permits(f, state)
        };

        for (i, f) in self.features.iter().enumerate() {
            if !candidate(f.as_ref()) {
                continue;
            }
            if !(f.mandatory() || self.required_by_peer.contains(f.namespace())) {
                continue;
            }
            if self.prerequisites_met(f.as_ref(), handshake) {
                return Some(i);
            }
            for prereq in f.prerequisites() {
                let found = self.features.iter().position(|g| {
                    g.namespace() == *prereq
                        && candidate(g.as_ref())
                        && self.prerequisites_met(g.as_ref(), handshake)
                });
                if found.is_some() {
                    return found;
                }
            }
        }

        self.features.iter().position(|f| {
            candidate(f.as_ref()) && self.prerequisites_met(f.as_ref(), handshake)
        })
    }

    /// Required features not yet negotiated on the current stream. Features
    /// the session state rules out entirely are not counted.
    fn unsatisfied_required(&self, handshake: &Handshake) -> Option<&'static str> {
        let state = handshake.state();
        self.features
            .iter()
            .find(|f| {
                (f.mandatory() || self.required_by_peer.contains(f.namespace()))
                    && !handshake.is_negotiated(f.namespace())
                    && Self::state_permits(f.as_ref(), state)
            })
            .map(|f| f.namespace())
    }

    /// Features the receiving side may advertise on the current stream.
    fn eligible(&self, handshake: &Handshake) -> Vec<usize> {
        let state = handshake.state();
        self.features
            .iter()
            .enumerate()
            .filter(|(_, f)| {
                !handshake.is_negotiated(f.namespace())
                    && self.prerequisites_met(f.as_ref(), handshake)
                    && Self::state_permits(f.as_ref(), state)
            })
            .map(|(i, _)| i)
            .collect()
    }

    async fn run_feature(
        &mut self,
        handshake: &mut Handshake,
        index: usize,
    ) -> Result<Step, Error> {
        let feature = &self.features[index];
        let namespace = feature.namespace();
        debug!(feature = namespace, "negotiating stream feature");

        let data = handshake.take_feature(namespace);
        let result = feature.negotiate(handshake, data.as_ref()).await;
        if let Some(data) = data {
            handshake.set_feature(namespace, data);
        }
        let result = result?;

        handshake.mark_negotiated(namespace);
        if result.conn.is_some() {
            info!(feature = namespace, "feature replaced the transport, restarting stream");
            self.exchange_header = true;
        }
        Ok(Step {
            mask: result.mask,
            conn: result.conn,
            carry: None,
        })
    }

    async fn advertise_features(&mut self, handshake: &mut Handshake) -> Result<bool, Error> {
        let eligible = self.eligible(handshake);
        if eligible.is_empty() {
            handshake.write_events(&[Event::Empty(BytesStart::new("stream:features"))]);
            handshake.flush().await?;
            return Ok(false);
        }

        let state = handshake.state();
        let mut events = vec![Event::Start(BytesStart::new("stream:features"))];
        for &i in &eligible {
            events.extend(self.features[i].advertise(state));
        }
        events.push(Event::End(BytesEnd::new("stream:features")));
        handshake.write_events(&events);
        handshake.flush().await?;
        Ok(true)
    }

    async fn consume_features(&mut self, handshake: &mut Handshake) -> Result<(), Error> {
        let (_start, inner) = loop {
            match handshake.read_event().await? {
                Event::Text(t) if xml::is_xml_whitespace(&t) => continue,
                Event::Start(s) if s.name().as_ref() == b"stream:features" => {
                    let inner = handshake.read_inner().await?;
                    break (s, inner);
                }
                Event::Empty(s) if s.name().as_ref() == b"stream:features" => {
                    break (s, Vec::new());
                }
                Event::Start(s) if s.name().as_ref() == b"stream:error" => {
                    let inner = handshake.read_inner().await?;
                    return Err(StreamError::from_events(&inner).into());
                }
                Event::Eof => {
                    return Err(Error::Framing(
                        "transport closed while waiting for stream features".into(),
                    ));
                }
                other => {
                    return Err(Error::Framing(format!(
                        "expected stream features, got {other:?}"
                    )));
                }
            }
        };

        self.required_by_peer.clear();
        for (child, child_inner) in xml::split_children(&inner) {
            let Some(child_ns) = xml::attr_value(&child, "xmlns") else {
                continue;
            };
            let Some(feature) = self.features.iter().find(|f| f.namespace() == child_ns) else {
                debug!(ns = %child_ns, "peer advertised a feature this session does not implement");
                continue;
            };
            let (required, data) = feature.parse(&child, &child_inner)?;
            handshake.set_feature(feature.namespace(), data);
            if required {
                self.required_by_peer.insert(feature.namespace().to_string());
            }
        }
        Ok(())
    }

    async fn negotiate_round(&mut self, handshake: &mut Handshake) -> Result<Step, Error> {
        if self.exchange_header {
            if !self.lang.is_empty() {
                handshake.lang = self.lang.clone();
            }
            if handshake.received() {
                handshake.recv_stream_open().await?;
                handshake.send_stream_open(Some(xml::random_id())).await?;
            } else {
                handshake.send_stream_open(None).await?;
                handshake.recv_stream_open().await?;
            }
            self.exchange_header = false;
            self.need_features = true;
        }

        if self.need_features {
            self.need_features = false;
            if handshake.received() {
                if !self.advertise_features(handshake).await? {
                    return Ok(Step {
                        mask: SessionState::READY,
                        conn: None,
                        carry: None,
                    });
                }
            } else {
                self.consume_features(handshake).await?;
            }
        }

        if handshake.received() {
            // Wait for the peer to pick one of the advertised features.
            loop {
                match handshake.read_event().await? {
                    Event::Text(t) if xml::is_xml_whitespace(&t) => continue,
                    event @ (Event::Start(_) | Event::Empty(_)) => {
                        let start = match &event {
                            Event::Start(s) | Event::Empty(s) => s.clone(),
                            _ => unreachable!(),
                        };
                        let command_ns = xml::attr_value(&start, "xmlns").unwrap_or_default();
                        let chosen = self
                            .eligible(handshake)
                            .into_iter()
                            .find(|&i| self.features[i].namespace() == command_ns);
                        if let Some(index) = chosen {
                            handshake.unread(event);
                            return self.run_feature(handshake, index).await;
                        }
                        // Not a feature command. If nothing mandatory is
                        // outstanding the stream is ready and this element
                        // is the first stanza.
                        let state = handshake.state();
                        if self.features.iter().all(|f| {
                            !f.mandatory()
                                || handshake.is_negotiated(f.namespace())
                                || !Self::state_permits(f.as_ref(), state)
                        }) {
                            handshake.unread(event);
                            return Ok(Step {
                                mask: SessionState::READY,
                                conn: None,
                                carry: None,
                            });
                        }
                        return Err(Error::Framing(format!(
                            "peer sent {command_ns:?} while mandatory features remain"
                        )));
                    }
                    Event::Eof => {
                        return Err(Error::Framing(
                            "transport closed during feature negotiation".into(),
                        ));
                    }
                    other => {
                        return Err(Error::Framing(format!(
                            "unexpected token during negotiation: {other:?}"
                        )));
                    }
                }
            }
        }

        match self.select(handshake) {
            Some(index) => self.run_feature(handshake, index).await,
            None => {
                if let Some(ns) = self.unsatisfied_required(handshake) {
                    return Err(Error::Framing(format!(
                        "required stream feature {ns} was not offered by the peer"
                    )));
                }
                Ok(Step {
                    mask: SessionState::READY,
                    conn: None,
                    carry: None,
                })
            }
        }
    }
}

impl Negotiator for FeatureNegotiator {
    async fn negotiate(
        &mut self,
        handshake: &mut Handshake,
        _carry: Option<Carry>,
    ) -> Result<Step, Error> {
        self.negotiate_round(handshake).await
    }
}
