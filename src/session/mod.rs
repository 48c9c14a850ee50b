//! The XMPP session: a negotiated, full-duplex XML stream with stanza
//! dispatch and IQ correlation.
//!
//! One task per session runs [`Session::serve`]; any number of tasks may
//! send concurrently. The input and output sides are guarded by their own
//! async mutexes, held for the duration of one stanza. The state bitmask is
//! guarded by a read-write lock and only ever advances: `READY` never
//! clears, and the two stream-closed bits latch.

mod encoder;

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, RwLock};

use bitflags::bitflags;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::conn::Conn;
use crate::error::Error;
use crate::jid::Jid;
use crate::negotiate::{Carry, FeatureData, Handshake, Negotiator};
use crate::ns;
use crate::stanza::{Condition, ErrorType, Iq, IqType, StanzaError};
use crate::stream::{self, Info, StreamError};
use crate::xml::{self, EventReader, EventWriter, IntoXml};

use encoder::StanzaEncoder;

/// Maximum bytes buffered for a single element on either side.
///
/// 1 MiB is generous for XMPP: typical stanzas are a few KB, and even the
/// largest legitimate payloads (vCard avatars, history pages) rarely exceed
/// 100 KB. Exceeding the cap is a stream-level policy violation.
pub(crate) const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

bitflags! {
    /// Bitmask describing the current state of a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionState: u8 {
        /// The underlying connection has been secured, either by a feature
        /// upgrade or because the transport was secure to begin with.
        const SECURE = 1 << 0;
        /// The session has been authenticated (probably with SASL).
        const AUTHN = 1 << 1;
        /// Negotiation is complete; stanzas may be sent and received.
        const READY = 1 << 2;
        /// The session was initiated by the peer.
        const RECEIVED = 1 << 3;
        /// The output stream has been closed with a stream end tag. All
        /// writes fail even while the transport stays open.
        const OUTPUT_STREAM_CLOSED = 1 << 4;
        /// The input stream has been closed. All reads fail.
        const INPUT_STREAM_CLOSED = 1 << 5;
        /// This is a server-to-server stream.
        const S2S = 1 << 6;
    }
}

struct ReadState {
    io: ReadHalf<Conn>,
    reader: EventReader,
}

struct WriteState {
    io: WriteHalf<Conn>,
    writer: EventWriter,
    encoder: StanzaEncoder,
}

/// A fully negotiated IQ response: the reply's start element plus its inner
/// events.
#[derive(Debug)]
pub struct IqResponse {
    start: BytesStart<'static>,
    inner: Vec<Event<'static>>,
}

impl IqResponse {
    /// The reply's start element.
    pub fn start(&self) -> &BytesStart<'static> {
        &self.start
    }

    /// Parses the reply's stanza header.
    pub fn iq(&self) -> Result<Iq, Error> {
        Iq::from_start(&self.start)
    }

    /// The events between the reply's start and end tags.
    pub fn payload(&self) -> &[Event<'static>] {
        &self.inner
    }

    /// Consumes the response into a complete event stream including the
    /// outer element.
    pub fn into_events(self) -> Vec<Event<'static>> {
        let name = String::from_utf8_lossy(self.start.name().as_ref()).into_owned();
        let mut events = Vec::with_capacity(self.inner.len() + 2);
        if self.inner.is_empty() {
            events.push(Event::Empty(self.start));
        } else {
            events.push(Event::Start(self.start));
            events.extend(self.inner);
            events.push(Event::End(BytesEnd::new(name)));
        }
        events
    }
}

/// Callback invoked by [`Session::serve`] for each incoming element.
///
/// The handler receives a [`Transaction`] holding both stream locks, so it
/// must not call the session's send methods while handling; it reads the
/// element through the transaction and writes any reply the same way.
pub trait Handler: Send {
    fn handle_stanza(
        &mut self,
        tx: &mut Transaction<'_>,
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send;
}

/// The nop handler: ignores everything, letting serve's auto-reply answer
/// unhandled IQ requests.
impl Handler for () {
    async fn handle_stanza(&mut self, _tx: &mut Transaction<'_>) -> Result<(), Error> {
        Ok(())
    }
}

/// An XMPP session over a negotiated stream.
pub struct Session {
    state: RwLock<SessionState>,
    in_info: Info,
    out_info: Info,
    features: HashMap<String, FeatureData>,
    pending_iqs: StdMutex<HashMap<String, oneshot::Sender<IqResponse>>>,
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
    close_deadline: watch::Sender<Option<Instant>>,
}

impl Session {
    /// Negotiates a session from the initiating entity's perspective.
    ///
    /// `location` is the remote server's address and `origin` this entity's
    /// address. Returns only once the `READY` bit is set.
    pub async fn new<N: Negotiator>(
        location: Jid,
        origin: Jid,
        conn: Conn,
        state: SessionState,
        negotiator: N,
    ) -> Result<Session, Error> {
        negotiate_session(Some(location), Some(origin), conn, state, negotiator).await
    }

    /// Negotiates a session from the receiving entity's perspective. The
    /// peer's addressing is learned from its stream header.
    pub async fn accept<N: Negotiator>(
        conn: Conn,
        state: SessionState,
        negotiator: N,
    ) -> Result<Session, Error> {
        negotiate_session(None, None, conn, state | SessionState::RECEIVED, negotiator).await
    }

    /// The current session state.
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn or_state(&self, bits: SessionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) |= bits;
    }

    /// The local address: origin for initiated sessions, location for
    /// received ones.
    pub fn local_addr(&self) -> Option<&Jid> {
        self.in_info.to.as_ref()
    }

    /// The peer's address.
    pub fn remote_addr(&self) -> Option<&Jid> {
        self.in_info.from.as_ref()
    }

    /// The stream id of the input stream.
    pub fn in_sid(&self) -> &str {
        &self.in_info.id
    }

    /// The stream id of the output stream.
    pub fn out_sid(&self) -> &str {
        &self.out_info.id
    }

    /// The parsed advertisement of a feature negotiated on the final
    /// stream, if the peer advertised it.
    pub fn feature(&self, namespace: &str) -> Option<&FeatureData> {
        self.features.get(namespace)
    }

    /// Tears the session down into its transport. The caller owns the
    /// transport's lifetime; `close` does not close it.
    pub fn into_conn(self) -> Conn {
        let read = self.read.into_inner();
        let write = self.write.into_inner();
        read.io.unsplit(write.io)
    }

    fn check_output_open(&self) -> Result<(), Error> {
        if self.state().contains(SessionState::OUTPUT_STREAM_CLOSED) {
            return Err(Error::OutputClosed);
        }
        Ok(())
    }

    /// Marshals a value and transmits it as one element. The output lock is
    /// held for the duration; the element is flushed before returning.
    pub async fn encode<T: IntoXml>(&self, value: T) -> Result<(), Error> {
        self.send(value.into_xml()).await
    }

    /// Transmits exactly one element from the given event stream; events
    /// after the first element's end are ignored.
    pub async fn send(&self, events: Vec<Event<'static>>) -> Result<(), Error> {
        match events.first() {
            Some(Event::Start(_)) | Some(Event::Empty(_)) => {}
            _ => return Err(Error::NotAStart),
        }

        let mut element = Vec::with_capacity(events.len());
        let mut depth = 0usize;
        for event in events {
            match &event {
                Event::Start(_) => depth += 1,
                Event::End(_) => depth = depth.saturating_sub(1),
                _ => {}
            }
            let complete = depth == 0;
            element.push(event);
            if complete {
                break;
            }
        }

        let mut write = self.write.lock().await;
        self.write_element(&mut write, &element).await
    }

    /// Like [`Session::send`] but wraps the payload in `start`.
    pub async fn send_element(
        &self,
        payload: Vec<Event<'static>>,
        start: BytesStart<'static>,
    ) -> Result<(), Error> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut events = Vec::with_capacity(payload.len() + 2);
        if payload.is_empty() {
            events.push(Event::Empty(start));
        } else {
            events.push(Event::Start(start));
            events.extend(payload);
            events.push(Event::End(BytesEnd::new(name)));
        }
        self.send(events).await
    }

    async fn write_element(
        &self,
        write: &mut WriteState,
        events: &[Event<'static>],
    ) -> Result<(), Error> {
        self.check_output_open()?;
        for event in events {
            let filtered = write.encoder.filter(event.clone());
            write.writer.write_event(&filtered);
        }
        self.flush_write(write).await
    }

    /// Flushes buffered output. A transport failure here leaves the output
    /// stream in an undefined state, so it latches the closed bit.
    async fn flush_write(&self, write: &mut WriteState) -> Result<(), Error> {
        let WriteState { io, writer, .. } = write;
        match writer.flush(io).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.or_state(SessionState::OUTPUT_STREAM_CLOSED);
                Err(e)
            }
        }
    }

    /// Sends an IQ stanza. For `get` and `set` requests this registers the
    /// stanza id, transmits the element, and blocks until the matching
    /// `result` or `error` reply arrives on the input stream; the serve loop
    /// must be running or the call never completes. For `result` and
    /// `error` stanzas it sends without waiting and returns `None`.
    ///
    /// Dropping the returned future (timeout, select) reclaims the pending
    /// entry; a reply arriving later is routed to the serve handler instead.
    pub async fn send_iq(
        &self,
        mut events: Vec<Event<'static>>,
    ) -> Result<Option<IqResponse>, Error> {
        let (start, is_empty) = match events.first() {
            Some(Event::Start(s)) => (s.clone(), false),
            Some(Event::Empty(s)) => (s.clone(), true),
            _ => return Err(Error::NotAStart),
        };
        if !is_iq_name(&start) {
            return Err(Error::NotAnIq);
        }

        // Honor a caller-provided id, otherwise generate one.
        let id = match xml::attr_value(&start, "id") {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = xml::random_id();
                let mut attrs = xml::raw_attrs(&start);
                attrs.retain(|(k, _)| k != b"id");
                attrs.push((b"id".to_vec(), id.clone().into_bytes()));
                let rebuilt = xml::with_attrs(&start, &attrs);
                events[0] = if is_empty {
                    Event::Empty(rebuilt)
                } else {
                    Event::Start(rebuilt)
                };
                id
            }
        };

        let needs_reply = xml::attr_value(&start, "type")
            .and_then(|t| IqType::from_name(&t))
            .is_some_and(|t| t.needs_reply());
        if !needs_reply {
            self.send(events).await?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        self.pending_iqs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);
        let pending = PendingIq { session: self, id };

        self.send(events).await?;
        debug!(id = %pending.id, "awaiting iq response");

        match rx.await {
            Ok(response) => Ok(Some(response)),
            // The dispatcher dropped the slot without delivering: the input
            // stream is gone.
            Err(_) => Err(Error::InputClosed),
        }
    }

    /// Marshals a value that must be an IQ stanza and sends it via
    /// [`Session::send_iq`].
    pub async fn encode_iq<T: IntoXml>(&self, value: T) -> Result<Option<IqResponse>, Error> {
        self.send_iq(value.into_xml()).await
    }

    /// Wraps a payload in the given IQ header and sends it via
    /// [`Session::send_iq`].
    pub async fn encode_iq_element(
        &self,
        payload: Vec<Event<'static>>,
        iq: Iq,
    ) -> Result<Option<IqResponse>, Error> {
        self.send_iq(iq.wrap(payload)).await
    }

    /// Sends an IQ request and returns the children of its response
    /// payload. An `error`-typed reply is surfaced as a [`StanzaError`].
    pub async fn iter_iq(
        &self,
        events: Vec<Event<'static>>,
    ) -> Result<Vec<(BytesStart<'static>, Vec<Event<'static>>)>, Error> {
        let Some(response) = self.send_iq(events).await? else {
            return Ok(Vec::new());
        };
        let iq = response.iq()?;
        if iq.typ == IqType::Error {
            for (child, child_inner) in xml::split_children(response.payload()) {
                if child.name().local_name().as_ref() == b"error" {
                    return Err(StanzaError::from_element(&child, &child_inner).into());
                }
            }
            return Err(StanzaError::new(ErrorType::Cancel, Condition::UndefinedCondition).into());
        }

        match xml::split_children(response.payload()).into_iter().next() {
            Some((_, payload_inner)) => Ok(xml::split_children(&payload_inner)),
            None => Ok(Vec::new()),
        }
    }

    /// Like [`Session::iter_iq`] but wraps the payload in the given IQ
    /// header first.
    pub async fn iter_iq_element(
        &self,
        payload: Vec<Event<'static>>,
        iq: Iq,
    ) -> Result<Vec<(BytesStart<'static>, Vec<Event<'static>>)>, Error> {
        self.iter_iq(iq.wrap(payload)).await
    }

    /// Acquires exclusive ownership of the input stream. All other reads,
    /// including the serve loop, block until the handle is dropped.
    pub async fn token_reader(&self) -> TokenReadHandle<'_> {
        TokenReadHandle {
            session: self,
            guard: self.read.lock().await,
        }
    }

    /// Acquires exclusive ownership of the output stream. All other writes
    /// block until the handle is dropped.
    pub async fn token_writer(&self) -> TokenWriteHandle<'_> {
        TokenWriteHandle {
            session: self,
            guard: self.write.lock().await,
        }
    }

    /// Ends the output stream by sending the closing stream tag. Idempotent;
    /// the underlying transport stays open and is the caller's to close.
    pub async fn close(&self) -> Result<(), Error> {
        let mut write = self.write.lock().await;
        self.close_locked(&mut write).await
    }

    async fn close_locked(&self, write: &mut WriteState) -> Result<(), Error> {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if state.contains(SessionState::OUTPUT_STREAM_CLOSED) {
                return Ok(());
            }
            state.insert(SessionState::OUTPUT_STREAM_CLOSED);
        }
        // The opening tag was written literally, so the closing tag is too;
        // an XML encoder would consider them mismatched.
        let tag = if self.out_info.ns == ns::WS_FRAMING {
            stream::CLOSE_WS_TAG
        } else {
            stream::CLOSE_STREAM_TAG
        };
        write.writer.write_raw(tag.as_bytes());
        let WriteState { io, writer, .. } = write;
        writer.flush(io).await?;
        info!("output stream closed");
        Ok(())
    }

    /// Requires the peer to close its stream by `deadline`; after it passes,
    /// a blocked [`Session::serve`] marks the input closed and returns a
    /// timeout error. Normally called just before [`Session::close`].
    pub fn set_close_deadline(&self, deadline: Instant) {
        self.close_deadline.send_replace(Some(deadline));
    }

    fn close_input(&self) {
        self.or_state(SessionState::INPUT_STREAM_CLOSED);
    }

    /// Runs the dispatch loop until the peer closes its stream, the close
    /// deadline passes, or a fatal error occurs. Returns `Ok(())` on a clean
    /// close from the peer.
    pub async fn serve<H: Handler>(&self, mut handler: H) -> Result<(), Error> {
        let result = self.serve_loop(&mut handler).await;
        self.close_input();
        let close_result = self.close().await;
        match result {
            Ok(()) => close_result,
            Err(e) => Err(e),
        }
    }

    async fn serve_loop<H: Handler>(&self, handler: &mut H) -> Result<(), Error> {
        let mut deadline_rx = self.close_deadline.subscribe();
        loop {
            let mut read = self.read.lock().await;
            if self.state().contains(SessionState::INPUT_STREAM_CLOSED) {
                return Err(Error::InputClosed);
            }

            let event = {
                let ReadState { io, reader } = &mut *read;
                tokio::select! {
                    event = reader.next_event(io) => event?,
                    _ = await_deadline(&mut deadline_rx) => {
                        debug!("close deadline reached");
                        return Err(Error::Timeout);
                    }
                }
            };

            let step = self.handle_input(&mut read, event, handler).await;
            drop(read);
            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Eof) => return Ok(()),
                Ok(Flow::PeerError(e)) => {
                    warn!(error = %e, "peer reported a stream error");
                    return Err(e.into());
                }
                Err(e) => return self.send_error(e).await,
            }
        }
    }

    /// Processes one top-level event: keepalive, stream close, stream error,
    /// IQ response rendezvous, or handler dispatch.
    async fn handle_input<H: Handler>(
        &self,
        read: &mut MutexGuard<'_, ReadState>,
        event: Event<'static>,
        handler: &mut H,
    ) -> Result<Flow, Error> {
        let (start, inner) = match event {
            Event::Eof => {
                debug!("peer closed the transport");
                return Ok(Flow::Eof);
            }
            Event::End(e) => {
                if e.name().as_ref() == b"stream:stream" {
                    debug!("peer closed its stream");
                    return Ok(Flow::Eof);
                }
                return Err(Error::Framing(format!(
                    "unexpected end element {:?} at stream level",
                    String::from_utf8_lossy(e.name().as_ref())
                )));
            }
            Event::Text(t) => {
                // XML whitespace is a keepalive; anything else at the top
                // of the stream is fatal.
                if xml::is_xml_whitespace(&t) {
                    return Ok(Flow::Continue);
                }
                return Err(Error::Framing("unexpected stream-level chardata".into()));
            }
            Event::Start(s) => {
                let inner = {
                    let ReadState { io, reader } = &mut **read;
                    reader.read_inner(io, MAX_STANZA_BUFFER_SIZE).await?
                };
                if s.name().as_ref() == b"stream:error" {
                    return Ok(Flow::PeerError(StreamError::from_events(&inner)));
                }
                (s, inner)
            }
            Event::Empty(s) => {
                if s.name().as_ref() == b"close"
                    && xml::attr_value(&s, "xmlns").as_deref() == Some(ns::WS_FRAMING)
                {
                    debug!("peer closed its stream (framing close)");
                    return Ok(Flow::Eof);
                }
                (s, Vec::new())
            }
            other => {
                return Err(Error::Framing(format!(
                    "stream in a bad state, expected start element or whitespace but got {other:?}"
                )));
            }
        };

        // Drop a redundant from attribute: servers echo our own bare
        // address on stanzas they reflect back.
        let start = self.normalize_from(start);

        let iq = if is_stanza_name(&start) && start.name().local_name().as_ref() == b"iq" {
            Some((
                xml::attr_value(&start, "id").unwrap_or_default(),
                xml::attr_value(&start, "type").and_then(|t| IqType::from_name(&t)),
            ))
        } else {
            None
        };

        // Response IQs rendezvous with a pending send_iq call by id.
        if let Some((id, Some(typ))) = &iq {
            if !typ.needs_reply() {
                let slot = self
                    .pending_iqs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(id);
                if let Some(tx) = slot {
                    match tx.send(IqResponse { start, inner }) {
                        Ok(()) => {
                            debug!(id = %id, "delivered iq response");
                            return Ok(Flow::Continue);
                        }
                        // The caller cancelled after the slot was looked
                        // up; hand the response to the normal handler path.
                        Err(response) => {
                            debug!(id = %id, "iq response slot closed, dispatching to handler");
                            return self.dispatch(response.start, response.inner, handler).await;
                        }
                    }
                }
                // No pending request: no reply is required, fall through.
            }
        }

        self.dispatch(start, inner, handler).await
    }

    /// Invokes the handler for one element and enforces the IQ reply
    /// obligation.
    async fn dispatch<H: Handler>(
        &self,
        start: BytesStart<'static>,
        inner: Vec<Event<'static>>,
        handler: &mut H,
    ) -> Result<Flow, Error> {
        let request = if is_stanza_name(&start) && start.name().local_name().as_ref() == b"iq" {
            let needs_reply = xml::attr_value(&start, "type")
                .and_then(|t| IqType::from_name(&t))
                .is_some_and(|t| t.needs_reply());
            needs_reply.then(|| Iq::from_start(&start)).transpose()?
        } else {
            None
        };

        let mut write = self.write.lock().await;
        let end_name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let reply_id = request.as_ref().map(|iq| iq.id.clone()).unwrap_or_default();
        let mut tx = Transaction {
            session: self,
            start,
            inner: inner.into_iter(),
            end_name,
            emitted_end: false,
            write: &mut *write,
            reply_id,
            wrote_reply: false,
            depth: 0,
        };

        handler.handle_stanza(&mut tx).await?;
        let wrote_reply = tx.wrote_reply;

        // An unanswered get/set gets a service-unavailable error with the
        // addressing swapped.
        if let Some(request) = request {
            if !wrote_reply {
                debug!(id = %request.id, "synthesizing service-unavailable reply");
                let reply = Iq {
                    id: request.id.clone(),
                    to: request.from.clone(),
                    from: request.to.clone(),
                    typ: IqType::Error,
                    lang: String::new(),
                };
                let events = reply.wrap(
                    StanzaError::new(ErrorType::Cancel, Condition::ServiceUnavailable).into_xml(),
                );
                self.check_output_open()?;
                for event in &events {
                    let filtered = write.encoder.filter(event.clone());
                    write.writer.write_event(&filtered);
                }
            }
        }

        self.flush_write(&mut write).await?;
        Ok(Flow::Continue)
    }

    /// Drops the `from` attribute of a stanza when it merely repeats our
    /// own bare address.
    fn normalize_from(&self, start: BytesStart<'static>) -> BytesStart<'static> {
        if !is_stanza_name(&start) {
            return start;
        }
        let Some(from) = xml::attr_value(&start, "from") else {
            return start;
        };
        let Some(local) = self.local_addr() else {
            return start;
        };
        if from != local.bare().to_string() {
            return start;
        }
        let mut attrs = xml::raw_attrs(&start);
        attrs.retain(|(k, _)| k != b"from");
        xml::with_attrs(&start, &attrs)
    }

    /// Transmits a fatal error and closes the output stream: stream and
    /// stanza errors as themselves, anything else as `undefined-condition`.
    /// Always returns the original error.
    async fn send_error(&self, err: Error) -> Result<(), Error> {
        let mut write = self.write.lock().await;
        if self.state().contains(SessionState::OUTPUT_STREAM_CLOSED) {
            return Err(err);
        }

        let events = match &err {
            Error::Stream(e) => e.clone().into_xml(),
            Error::Stanza(e) => e.clone().into_xml(),
            _ => StreamError::new(stream::Condition::UndefinedCondition).into_xml(),
        };
        for event in &events {
            write.writer.write_event(event);
        }
        if let Err(flush_err) = self.flush_write(&mut write).await {
            debug!(error = %flush_err, "failed to transmit error before close");
            return Err(err);
        }
        if let Err(close_err) = self.close_locked(&mut write).await {
            debug!(error = %close_err, "failed to close stream after error");
        }
        Err(err)
    }
}

enum Flow {
    Continue,
    Eof,
    PeerError(StreamError),
}

async fn negotiate_session<N: Negotiator>(
    location: Option<Jid>,
    origin: Option<Jid>,
    conn: Conn,
    state: SessionState,
    mut negotiator: N,
) -> Result<Session, Error> {
    let mut handshake = Handshake::new(location, origin, conn, state, String::new());
    let mut carry: Option<Carry> = None;

    while !handshake.state.contains(SessionState::READY) {
        let step = negotiator.negotiate(&mut handshake, carry.take()).await?;
        carry = step.carry;
        if let Some(conn) = step.conn {
            handshake.install_conn(conn);
        }
        handshake.state |= step.mask;
    }

    let Handshake {
        conn,
        reader,
        writer,
        state,
        in_info,
        out_info,
        features,
        ..
    } = handshake;
    let conn = conn
        .ok_or_else(|| Error::Framing("negotiation finished without a transport".into()))?;
    let (read_io, write_io) = tokio::io::split(conn);

    let s2s = state.contains(SessionState::S2S);
    let stanza_ns = if s2s { ns::SERVER } else { ns::CLIENT };
    let encoder_from = if s2s {
        in_info.to.as_ref().map(|j| j.to_string())
    } else {
        None
    };

    info!(
        local = %in_info.to.as_ref().map(|j| j.to_string()).unwrap_or_default(),
        remote = %in_info.from.as_ref().map(|j| j.to_string()).unwrap_or_default(),
        secure = state.contains(SessionState::SECURE),
        "session ready"
    );

    let (close_deadline, _) = watch::channel(None);
    Ok(Session {
        state: RwLock::new(state),
        in_info,
        out_info,
        features,
        pending_iqs: StdMutex::new(HashMap::new()),
        read: Mutex::new(ReadState {
            io: read_io,
            reader,
        }),
        write: Mutex::new(WriteState {
            io: write_io,
            writer,
            encoder: StanzaEncoder::new(stanza_ns.to_string(), encoder_from),
        }),
        close_deadline,
    })
}

/// Resolves once the configured close deadline passes. Pends forever while
/// no deadline is set.
async fn await_deadline(rx: &mut watch::Receiver<Option<Instant>>) {
    loop {
        let deadline = *rx.borrow_and_update();
        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                }
            }
            None => {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

/// Removes the pending-IQ table entry when a send_iq call ends, by
/// cancellation or by delivery.
struct PendingIq<'a> {
    session: &'a Session,
    id: String,
}

impl Drop for PendingIq<'_> {
    fn drop(&mut self) {
        self.session
            .pending_iqs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Scoped read/write view handed to the serve handler: the element's start,
/// a reader over its inner events followed by its end, and a writer for the
/// reply.
pub struct Transaction<'a> {
    session: &'a Session,
    start: BytesStart<'static>,
    inner: std::vec::IntoIter<Event<'static>>,
    end_name: String,
    emitted_end: bool,
    write: &'a mut WriteState,
    reply_id: String,
    wrote_reply: bool,
    depth: usize,
}

impl Transaction<'_> {
    /// The element's start tag.
    pub fn start(&self) -> &BytesStart<'static> {
        &self.start
    }

    /// Returns the element's next inner event, then its end element, then
    /// `None`.
    pub fn read_event(&mut self) -> Option<Event<'static>> {
        if let Some(event) = self.inner.next() {
            return Some(event);
        }
        if !self.emitted_end {
            self.emitted_end = true;
            return Some(Event::End(BytesEnd::new(self.end_name.clone())));
        }
        None
    }

    /// Queues one event on the output stream, tracking whether the handler
    /// replied to the element it was invoked for.
    pub fn write_event(&mut self, event: Event<'static>) -> Result<(), Error> {
        self.session.check_output_open()?;
        match &event {
            Event::Start(s) | Event::Empty(s) => {
                if self.depth == 0 && !self.reply_id.is_empty() && is_iq_name(s) {
                    let id = xml::attr_value(s, "id").unwrap_or_default();
                    let replies = xml::attr_value(s, "type")
                        .and_then(|t| IqType::from_name(&t))
                        .is_some_and(|t| !t.needs_reply());
                    if id == self.reply_id && replies {
                        self.wrote_reply = true;
                    }
                }
                if matches!(event, Event::Start(_)) {
                    self.depth += 1;
                }
            }
            Event::End(_) => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        let filtered = self.write.encoder.filter(event);
        self.write.writer.write_event(&filtered);
        Ok(())
    }

    /// Writes a whole event stream.
    pub fn write_events(&mut self, events: Vec<Event<'static>>) -> Result<(), Error> {
        for event in events {
            self.write_event(event)?;
        }
        Ok(())
    }
}

/// Exclusive, lock-holding view of the session's input stream.
pub struct TokenReadHandle<'a> {
    session: &'a Session,
    guard: MutexGuard<'a, ReadState>,
}

impl TokenReadHandle<'_> {
    /// Reads the next event. Fails with [`Error::InputClosed`] once the
    /// input stream has been closed.
    pub async fn read_event(&mut self) -> Result<Event<'static>, Error> {
        if self
            .session
            .state()
            .contains(SessionState::INPUT_STREAM_CLOSED)
        {
            return Err(Error::InputClosed);
        }
        let ReadState { io, reader } = &mut *self.guard;
        reader.next_event(io).await
    }
}

/// Exclusive, lock-holding view of the session's output stream.
pub struct TokenWriteHandle<'a> {
    session: &'a Session,
    guard: MutexGuard<'a, WriteState>,
}

impl TokenWriteHandle<'_> {
    /// Queues one event for transmission. Fails with
    /// [`Error::OutputClosed`] once the output stream has been closed.
    pub fn write_event(&mut self, event: Event<'static>) -> Result<(), Error> {
        self.session.check_output_open()?;
        let filtered = self.guard.encoder.filter(event);
        self.guard.writer.write_event(&filtered);
        Ok(())
    }

    /// Sends everything queued so far.
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.session.check_output_open()?;
        self.session.flush_write(&mut self.guard).await
    }
}

/// True for unprefixed `iq`/`message`/`presence` elements in the empty or a
/// stanza namespace.
fn is_stanza_name(start: &BytesStart<'_>) -> bool {
    let name = start.name();
    if name.prefix().is_some() {
        return false;
    }
    if !matches!(
        name.local_name().as_ref(),
        b"iq" | b"message" | b"presence"
    ) {
        return false;
    }
    match xml::attr_value(start, "xmlns") {
        None => true,
        Some(ns_attr) => ns_attr == ns::CLIENT || ns_attr == ns::SERVER,
    }
}

/// True for unprefixed `iq` elements in the empty or a stanza namespace.
fn is_iq_name(start: &BytesStart<'_>) -> bool {
    is_stanza_name(start) && start.name().local_name().as_ref() == b"iq"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_events;

    fn start_of(input: &str) -> BytesStart<'static> {
        match parse_events(input).unwrap().into_iter().next().unwrap() {
            Event::Start(s) | Event::Empty(s) => s,
            other => panic!("expected start element, got {other:?}"),
        }
    }

    #[test]
    fn test_stanza_name_predicates() {
        assert!(is_stanza_name(&start_of("<iq type='get'/>")));
        assert!(is_stanza_name(&start_of("<message/>")));
        assert!(is_stanza_name(&start_of("<presence xmlns='jabber:client'/>")));
        assert!(!is_stanza_name(&start_of("<stream:features/>")));
        assert!(!is_stanza_name(&start_of("<ping/>")));
        assert!(!is_stanza_name(&start_of("<message xmlns='urn:other'/>")));

        assert!(is_iq_name(&start_of("<iq type='result' id='1'/>")));
        assert!(!is_iq_name(&start_of("<message/>")));
    }

    #[test]
    fn test_session_state_bits_are_distinct() {
        let all = [
            SessionState::SECURE,
            SessionState::AUTHN,
            SessionState::READY,
            SessionState::RECEIVED,
            SessionState::OUTPUT_STREAM_CLOSED,
            SessionState::INPUT_STREAM_CLOSED,
            SessionState::S2S,
        ];
        let mut acc = SessionState::empty();
        for bit in all {
            assert!(!acc.intersects(bit));
            acc |= bit;
        }
    }

    #[test]
    fn test_iq_response_into_events() {
        let response = IqResponse {
            start: start_of("<iq type='result' id='q1'>"),
            inner: parse_events("<query xmlns='urn:example'/>").unwrap(),
        };
        let bytes = crate::xml::events_to_bytes(&response.into_events());
        let s = String::from_utf8(bytes).unwrap();
        assert!(s.starts_with("<iq"));
        assert!(s.contains("<query"));
        assert!(s.ends_with("</iq>"));
    }
}
