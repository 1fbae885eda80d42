//! One BSP stream: receive reordering, windowed sending, marks and teardown.
//!
//! A [`Channel`] is shared between the dispatch path, which feeds it inbound
//! packets, and the handler thread, which blocks in [`Channel::read`] and
//! writes replies. All protocol state sits behind one mutex; a condition
//! variable wakes readers when data arrives and writers when the peer opens
//! its window. Outbound packets are built under the lock and handed to the
//! router after it is released.

use super::ack::BspAck;
use super::mark::Mark;
use crate::config::BspConfig;
use crate::error::Error;
use crate::pup::{HostAddress, Pup, PupPort, PupRouter, PupType, MAX_PUP_DATA};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

// Error PUPs carry the offending header before the code and text.
const ERROR_HEADER_SIZE: usize = 20;

// Published exactly once when the channel reaches a terminal state.
pub(crate) type DestroyHook = Box<dyn FnOnce(&Channel) + Send>;

// ============================================================================
// Public Types
// ============================================================================

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Registered, rendezvous reply not yet sent.
    Establishing,
    Active,
    /// We sent End and wait for the peer's EndReply.
    ClosingLocal,
    /// The peer sent End; we replied and wait for its final EndReply.
    ClosingRemote,
    Destroyed,
    Aborted,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Destroyed | ChannelState::Aborted)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Result of a [`Channel::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many data bytes were copied into the buffer.
    Data(usize),
    /// A mark was next in the stream; no bytes were copied.
    Mark(Mark),
}

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug)]
enum Delivered {
    Data(VecDeque<u8>),
    Mark(u8),
}

#[derive(Debug)]
struct Segment {
    pup_type: PupType,
    contents: Vec<u8>,
}

impl Segment {
    fn len(&self) -> u32 {
        match self.pup_type {
            PupType::Mark | PupType::AMark => 1,
            _ => self.contents.len() as u32,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ChannelState,
    abort_message: Option<String>,
    cancelled: bool,

    // Receive side
    recv_pos: u32,
    reorder: HashMap<u32, Segment>,
    delivered: VecDeque<Delivered>,
    unread: usize,
    last_mark: Option<Mark>,
    interrupts: u64,

    // Send side
    send_pos: u32,
    outstanding: VecDeque<Pup>,
    peer: BspAck,
    stalled_rounds: u32,
}

impl Inner {
    fn terminal_error(&self) -> Option<Error> {
        match self.state {
            ChannelState::Destroyed => Some(Error::ChannelClosed),
            ChannelState::Aborted => Some(Error::ChannelAborted {
                message: self.abort_message.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }

    // Writers may proceed only while Active; Establishing means "wait".
    fn check_writable(&self) -> Result<bool, Error> {
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        match self.state {
            ChannelState::Establishing => Ok(false),
            ChannelState::Active => Ok(true),
            ChannelState::ClosingLocal | ChannelState::ClosingRemote => Err(Error::ChannelClosing),
            ChannelState::Destroyed | ChannelState::Aborted => Err(Error::ChannelClosed),
        }
    }

    fn deliver(&mut self, segment: Segment) {
        match segment.pup_type {
            PupType::Mark | PupType::AMark => {
                let code = segment.contents.first().copied().unwrap_or_default();
                self.delivered.push_back(Delivered::Mark(code));
            }
            _ => {
                self.unread += segment.contents.len();
                match self.delivered.back_mut() {
                    Some(Delivered::Data(bytes)) => bytes.extend(segment.contents),
                    _ => self
                        .delivered
                        .push_back(Delivered::Data(segment.contents.into())),
                }
            }
        }
    }

    fn release(&mut self) {
        self.reorder.clear();
        self.delivered.clear();
        self.outstanding.clear();
        self.unread = 0;
    }
}

// Signed distance from `base` to `pos` in the wrapping 32-bit byte space.
fn seq_offset(pos: u32, base: u32) -> i64 {
    pos.wrapping_sub(base) as i32 as i64
}

fn pup_span(pup: &Pup) -> u32 {
    match pup.pup_type {
        PupType::Mark | PupType::AMark => 1,
        _ => pup.contents.len() as u32,
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A single BSP stream bound to one client connection port.
///
/// Handlers use [`read`](Self::read), [`read_byte`](Self::read_byte),
/// [`write`](Self::write), [`send_mark`](Self::send_mark),
/// [`close`](Self::close) and [`send_abort`](Self::send_abort). Inbound
/// packets reach it through the dispatcher.
pub struct Channel {
    socket_id: u32,
    server_port: PupPort,
    client_port: PupPort,
    original_destination: PupPort,
    advertised: BspAck,
    ack_timeout: Duration,
    max_retransmits: u32,
    router: Arc<dyn PupRouter>,
    inner: Mutex<Inner>,
    cond: Condvar,
    destroy_hook: Mutex<Option<DestroyHook>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("socket_id", &self.socket_id)
            .field("server_port", &self.server_port)
            .field("client_port", &self.client_port)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Channel {
    /// Builds a channel from a rendezvous request.
    ///
    /// The request payload carries the client's connection port; its id seeds
    /// both stream positions. The channel starts in
    /// [`ChannelState::Establishing`].
    pub fn from_rendezvous(
        rfc: &Pup,
        socket_id: u32,
        local: HostAddress,
        config: &BspConfig,
        router: Arc<dyn PupRouter>,
    ) -> Result<Self, Error> {
        if rfc.pup_type != PupType::Rfc {
            return Err(Error::NotRendezvous(rfc.pup_type.to_string()));
        }
        let client_port = PupPort::from_bytes(&rfc.contents).ok_or_else(|| {
            Error::MalformedRendezvous(format!(
                "payload of {} bytes has no connection port",
                rfc.contents.len()
            ))
        })?;

        let peer = BspAck::new(config.max_bytes, config.max_pups, 0);
        Ok(Self {
            socket_id,
            server_port: PupPort::from_host(local, socket_id),
            client_port,
            original_destination: rfc.destination,
            advertised: BspAck::new(config.max_bytes, config.max_pups, 0),
            ack_timeout: config.ack_timeout,
            max_retransmits: config.max_retransmits,
            router,
            inner: Mutex::new(Inner {
                state: ChannelState::Establishing,
                abort_message: None,
                cancelled: false,
                recv_pos: rfc.id,
                reorder: HashMap::new(),
                delivered: VecDeque::new(),
                unread: 0,
                last_mark: None,
                interrupts: 0,
                send_pos: rfc.id,
                outstanding: VecDeque::new(),
                peer,
                stalled_rounds: 0,
            }),
            cond: Condvar::new(),
            destroy_hook: Mutex::new(None),
        })
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl Channel {
    pub fn socket_id(&self) -> u32 {
        self.socket_id
    }

    /// Our end of the stream.
    pub fn server_port(&self) -> PupPort {
        self.server_port
    }

    /// The client's connection port from the rendezvous payload.
    pub fn client_port(&self) -> PupPort {
        self.client_port
    }

    /// Destination of the rendezvous request, i.e. the service the client
    /// asked for.
    pub fn original_destination(&self) -> PupPort {
        self.original_destination
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    /// The mark most recently returned by [`read`](Self::read).
    pub fn last_mark(&self) -> Option<Mark> {
        self.lock().last_mark
    }

    pub fn interrupts_received(&self) -> u64 {
        self.lock().interrupts
    }

    /// Packets sent but not yet acknowledged by the peer.
    pub fn outstanding_count(&self) -> usize {
        self.lock().outstanding.len()
    }

    /// Limits most recently advertised by the peer.
    pub fn peer_limits(&self) -> BspAck {
        self.lock().peer
    }

    /// The acknowledgment record this channel advertises.
    pub fn advertised(&self) -> BspAck {
        let inner = self.lock();
        BspAck {
            bytes_sent: inner.unread.min(u16::MAX as usize) as u16,
            ..self.advertised
        }
    }
}

// ============================================================================
// Handler Operations
// ============================================================================

impl Channel {
    /// Blocks until data or a mark is available.
    ///
    /// Copies as many contiguous data bytes as fit into `buf`, or consumes one
    /// mark. Returns [`Error::ChannelClosed`] at end of stream (after the
    /// peer's End has been drained, or once the channel is destroyed),
    /// [`Error::ChannelAborted`] after an abort and [`Error::Cancelled`] once
    /// the worker is terminated.
    pub fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, Error> {
        let mut inner = self.lock();
        loop {
            let state = &mut *inner;
            if state.cancelled {
                return Err(Error::Cancelled);
            }
            match state.delivered.front_mut() {
                Some(Delivered::Mark(code)) => {
                    let mark = Mark::from(*code);
                    state.delivered.pop_front();
                    state.last_mark = Some(mark);
                    trace!(socket = self.socket_id, %mark, "Read mark");
                    return Ok(ReadOutcome::Mark(mark));
                }
                Some(Delivered::Data(bytes)) => {
                    let n = buf.len().min(bytes.len());
                    for (dst, src) in buf[..n].iter_mut().zip(bytes.drain(..n)) {
                        *dst = src;
                    }
                    if bytes.is_empty() {
                        state.delivered.pop_front();
                    }
                    state.unread -= n;
                    trace!(socket = self.socket_id, len = n, "Read data");
                    return Ok(ReadOutcome::Data(n));
                }
                None => {}
            }
            if let Some(err) = inner.terminal_error() {
                return Err(err);
            }
            if inner.state == ChannelState::ClosingRemote {
                return Err(Error::ChannelClosed);
            }
            inner = self.wait(inner);
        }
    }

    /// Blocks until one data byte is available and returns it.
    ///
    /// Used for the parameter byte that follows some marks. Returns
    /// [`Error::UnexpectedMark`] without consuming it if a mark comes first.
    pub fn read_byte(&self) -> Result<u8, Error> {
        let mut inner = self.lock();
        loop {
            let state = &mut *inner;
            if state.cancelled {
                return Err(Error::Cancelled);
            }
            match state.delivered.front_mut() {
                Some(Delivered::Mark(code)) => return Err(Error::UnexpectedMark(*code)),
                Some(Delivered::Data(bytes)) => {
                    if let Some(byte) = bytes.pop_front() {
                        if bytes.is_empty() {
                            state.delivered.pop_front();
                        }
                        state.unread -= 1;
                        return Ok(byte);
                    }
                    state.delivered.pop_front();
                    continue;
                }
                None => {}
            }
            if let Some(err) = inner.terminal_error() {
                return Err(err);
            }
            if inner.state == ChannelState::ClosingRemote {
                return Err(Error::ChannelClosed);
            }
            inner = self.wait(inner);
        }
    }

    /// Sends `data`, blocking while the peer's window is full.
    ///
    /// Writes are only accepted while the channel is active. Once a close has
    /// started (from either side) they fail with [`Error::ChannelClosing`];
    /// nothing is buffered for later.
    #[instrument(skip(self, data), fields(socket = self.socket_id, len = data.len()))]
    pub fn write(&self, data: &[u8]) -> Result<(), Error> {
        let mut rest = data;
        while !rest.is_empty() {
            let mut inner = self.wait_for_room(|inner| {
                (inner.outstanding.len() as u32) < inner.peer.max_pups as u32
            })?;

            let chunk_size = (inner.peer.max_bytes as usize).clamp(1, MAX_PUP_DATA);
            let (chunk, tail) = rest.split_at(chunk_size.min(rest.len()));
            let fills_window = inner.outstanding.len() + 1 >= inner.peer.max_pups as usize;
            let pup_type = if tail.is_empty() || fills_window {
                PupType::AData
            } else {
                PupType::Data
            };

            let pup = self.outbound(pup_type, inner.send_pos, chunk.to_vec());
            inner.send_pos = inner.send_pos.wrapping_add(chunk.len() as u32);
            inner.outstanding.push_back(pup.clone());
            drop(inner);

            debug!(id = pup.id, len = chunk.len(), %pup_type, "Sending data");
            self.router.send_pup(pup);
            rest = tail;
        }
        Ok(())
    }

    /// Sends a mark, optionally asking the peer to acknowledge it.
    #[instrument(skip(self), fields(socket = self.socket_id))]
    pub fn send_mark(&self, mark: Mark, ack: bool) -> Result<(), Error> {
        let mut inner = self.wait_for_room(|inner| {
            (inner.outstanding.len() as u32) < inner.peer.max_pups as u32
        })?;
        let pup_type = if ack { PupType::AMark } else { PupType::Mark };
        let pup = self.outbound(pup_type, inner.send_pos, vec![mark.code()]);
        inner.send_pos = inner.send_pos.wrapping_add(1);
        inner.outstanding.push_back(pup.clone());
        drop(inner);

        debug!(id = pup.id, %mark, "Sending mark");
        self.router.send_pup(pup);
        Ok(())
    }

    /// Starts the graceful close: waits for outstanding data to be
    /// acknowledged, then sends End.
    ///
    /// Closing an already closing channel is a no-op.
    #[instrument(skip(self), fields(socket = self.socket_id))]
    pub fn close(&self) -> Result<(), Error> {
        {
            let inner = self.lock();
            match inner.state {
                ChannelState::ClosingLocal | ChannelState::ClosingRemote => return Ok(()),
                _ => {
                    if let Some(err) = inner.terminal_error() {
                        return Err(err);
                    }
                }
            }
        }

        let mut inner = self.wait_for_room(|inner| inner.outstanding.is_empty())?;
        inner.state = ChannelState::ClosingLocal;
        let pup = self.outbound(PupType::End, inner.send_pos, Vec::new());
        drop(inner);
        self.cond.notify_all();

        info!("Closing channel, sending End");
        self.router.send_pup(pup);
        Ok(())
    }

    /// Waits for a close handshake already under way to finish.
    ///
    /// While we wait for the peer's EndReply, End is resent every ack
    /// timeout. A peer that stays silent for more than `max_retransmits`
    /// timeouts gets the channel destroyed. Returns at once if no close is
    /// in progress and with [`Error::Cancelled`] once the worker is
    /// terminated.
    #[instrument(skip(self), fields(socket = self.socket_id))]
    pub fn await_close(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        let mut rounds = 0;
        loop {
            if inner.cancelled {
                return Err(Error::Cancelled);
            }
            match inner.state {
                ChannelState::ClosingLocal | ChannelState::ClosingRemote => {}
                _ => return Ok(()),
            }

            let (guard, timeout) = self
                .cond
                .wait_timeout(inner, self.ack_timeout)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
            if !timeout.timed_out() {
                continue;
            }

            rounds += 1;
            if rounds > self.max_retransmits {
                warn!(state = %inner.state, rounds, "Peer never finished closing, destroying channel");
                self.finish(inner, ChannelState::Destroyed, None);
                return Ok(());
            }
            if inner.state == ChannelState::ClosingLocal {
                let pup = self.outbound(PupType::End, inner.send_pos, Vec::new());
                drop(inner);
                debug!(round = rounds, "No EndReply yet, resending End");
                self.router.send_pup(pup);
                inner = self.lock();
            }
        }
    }

    /// Sends an Abort carrying `message` and tears the channel down at once.
    ///
    /// Does nothing if the channel is already destroyed or aborted.
    #[instrument(skip(self), fields(socket = self.socket_id))]
    pub fn send_abort(&self, message: &str) {
        let inner = self.lock();
        if inner.state.is_terminal() {
            debug!(state = %inner.state, "Channel already terminated, not sending Abort");
            return;
        }
        let pup = self.outbound(PupType::Abort, inner.send_pos, message.as_bytes().to_vec());
        warn!(reason = message, "Aborting channel");
        self.finish(inner, ChannelState::Aborted, Some(message.to_string()));
        self.router.send_pup(pup);
    }

    /// Tears the channel down locally without a handshake.
    #[instrument(skip(self), fields(socket = self.socket_id))]
    pub fn destroy(&self) {
        let inner = self.lock();
        self.finish(inner, ChannelState::Destroyed, None);
    }
}

// ============================================================================
// Inbound Packets
// ============================================================================

impl Channel {
    /// Registers the single terminal-event consumer.
    pub(crate) fn set_destroy_hook(&self, hook: DestroyHook) {
        *self
            .destroy_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Moves an establishing channel to Active once the rendezvous reply is
    /// out.
    pub(crate) fn activate(&self) {
        let mut inner = self.lock();
        if inner.state == ChannelState::Establishing {
            inner.state = ChannelState::Active;
            drop(inner);
            self.cond.notify_all();
        }
    }

    /// Wakes blocked readers and writers with [`Error::Cancelled`].
    pub(crate) fn cancel(&self) {
        self.lock().cancelled = true;
        self.cond.notify_all();
    }

    /// Ingests a Data, AData, Mark or AMark packet.
    ///
    /// Accepted while Establishing too: the peer may answer the rendezvous
    /// reply before the channel is marked Active.
    pub(crate) fn recv_sequenced(&self, pup: &Pup) {
        let mut inner = self.lock();
        match inner.state {
            ChannelState::Establishing | ChannelState::Active | ChannelState::ClosingLocal => {}
            state => {
                warn!(socket = self.socket_id, %state, pup_type = %pup.pup_type, "Stream data outside an open channel, ignoring");
                return;
            }
        }

        let is_mark = matches!(pup.pup_type, PupType::Mark | PupType::AMark);
        if is_mark && pup.contents.len() != 1 {
            warn!(socket = self.socket_id, len = pup.contents.len(), "Mark without a single code byte, ignoring");
            return;
        }
        if pup.contents.len() > self.advertised.max_bytes as usize {
            warn!(
                socket = self.socket_id,
                len = pup.contents.len(),
                max_bytes = self.advertised.max_bytes,
                "Packet exceeds advertised size, ignoring"
            );
            return;
        }

        let span = pup_span(pup) as i64;
        let offset = seq_offset(pup.id, inner.recv_pos);
        let window = self.advertised.max_bytes as i64 * self.advertised.max_pups as i64;

        if span > 0 && offset + span <= 0 {
            debug!(socket = self.socket_id, id = pup.id, recv_pos = inner.recv_pos, "Duplicate packet");
        } else if span > 0 && offset + span + inner.unread as i64 > window {
            warn!(
                socket = self.socket_id,
                id = pup.id,
                recv_pos = inner.recv_pos,
                window,
                "Packet beyond advertised window, ignoring"
            );
            return;
        } else if span > 0 {
            // Trim any prefix we already hold.
            let (id, contents) = if offset < 0 {
                (inner.recv_pos, pup.contents[(-offset) as usize..].to_vec())
            } else {
                (pup.id, pup.contents.clone())
            };
            inner.reorder.entry(id).or_insert(Segment {
                pup_type: pup.pup_type,
                contents,
            });

            let mut delivered = false;
            loop {
                let recv_pos = inner.recv_pos;
                let Some(segment) = inner.reorder.remove(&recv_pos) else {
                    break;
                };
                inner.recv_pos = recv_pos.wrapping_add(segment.len());
                inner.deliver(segment);
                delivered = true;
            }
            if delivered {
                let recv_pos = inner.recv_pos;
                inner
                    .reorder
                    .retain(|&id, _| seq_offset(id, recv_pos) > 0);
                self.cond.notify_all();
            } else {
                trace!(socket = self.socket_id, id = pup.id, recv_pos = inner.recv_pos, "Buffered out-of-order packet");
            }
        }

        if pup.pup_type.wants_ack() {
            let ack = BspAck {
                bytes_sent: inner.unread.min(u16::MAX as usize) as u16,
                ..self.advertised
            };
            let reply = self.outbound(PupType::Ack, inner.recv_pos, ack.to_bytes().to_vec());
            drop(inner);
            trace!(socket = self.socket_id, id = reply.id, "Acknowledging");
            self.router.send_pup(reply);
        }
    }

    /// Processes an Ack: releases acknowledged packets and adopts the peer's
    /// limits.
    pub(crate) fn recv_ack(&self, pup: &Pup) {
        let mut inner = self.lock();
        match inner.state {
            ChannelState::Active | ChannelState::ClosingLocal | ChannelState::ClosingRemote => {}
            state => {
                warn!(socket = self.socket_id, %state, "Ack outside an open channel, ignoring");
                return;
            }
        }

        let limits = match BspAck::from_bytes(&pup.contents) {
            Ok(limits) => limits,
            Err(err) => {
                warn!(socket = self.socket_id, %err, "Ignoring ack");
                return;
            }
        };
        if seq_offset(pup.id, inner.send_pos) > 0 {
            warn!(socket = self.socket_id, id = pup.id, send_pos = inner.send_pos, "Ack beyond data sent, ignoring");
            return;
        }

        let before = inner.outstanding.len();
        while let Some(front) = inner.outstanding.front() {
            let end = front.id.wrapping_add(pup_span(front));
            if seq_offset(pup.id, end) >= 0 {
                inner.outstanding.pop_front();
            } else {
                break;
            }
        }
        if inner.outstanding.len() < before {
            inner.stalled_rounds = 0;
        }
        inner.peer = BspAck {
            max_bytes: limits.max_bytes.min(MAX_PUP_DATA as u16),
            ..limits
        };
        debug!(
            socket = self.socket_id,
            id = pup.id,
            released = before - inner.outstanding.len(),
            max_bytes = limits.max_bytes,
            max_pups = limits.max_pups,
            "Received ack"
        );
        drop(inner);
        self.cond.notify_all();
    }

    /// Peer-initiated close, or the peer's answer to our End.
    pub(crate) fn recv_end(&self, pup: &Pup) {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            ChannelState::Establishing | ChannelState::Active => {
                inner.state = ChannelState::ClosingRemote;
                info!(socket = self.socket_id, "Peer closing channel, sending EndReply");
            }
            ChannelState::ClosingLocal => {
                debug!(socket = self.socket_id, "End during local close, sending EndReply");
            }
            ChannelState::ClosingRemote => {
                debug!(socket = self.socket_id, "Repeated End, resending EndReply");
            }
            ChannelState::Destroyed | ChannelState::Aborted => {
                debug!(socket = self.socket_id, %state, "End on terminated channel, ignoring");
                return;
            }
        }
        let reply = self.outbound(PupType::EndReply, pup.id, Vec::new());
        drop(inner);
        self.cond.notify_all();
        self.router.send_pup(reply);
    }

    /// Final step of either close sequence.
    pub(crate) fn recv_end_reply(&self, pup: &Pup) {
        let inner = self.lock();
        let state = inner.state;
        match state {
            ChannelState::ClosingLocal => {
                let reply = self.outbound(PupType::EndReply, pup.id, Vec::new());
                info!(socket = self.socket_id, "Close handshake complete");
                self.finish(inner, ChannelState::Destroyed, None);
                self.router.send_pup(reply);
            }
            ChannelState::ClosingRemote => {
                info!(socket = self.socket_id, "Close handshake complete");
                self.finish(inner, ChannelState::Destroyed, None);
            }
            ChannelState::Establishing | ChannelState::Active => {
                info!(socket = self.socket_id, %state, "EndReply without End, tearing down");
                self.finish(inner, ChannelState::Destroyed, None);
            }
            ChannelState::Destroyed | ChannelState::Aborted => {
                debug!(socket = self.socket_id, "EndReply on terminated channel, ignoring");
            }
        }
    }

    /// The peer aborted the stream.
    pub(crate) fn recv_abort(&self, pup: &Pup) {
        let inner = self.lock();
        self.finish(inner, ChannelState::Aborted, Some(pup.contents_lossy()));
    }

    /// Logs an Error packet from the transport or the peer.
    pub(crate) fn recv_error(&self, pup: &Pup) {
        if pup.contents.len() >= ERROR_HEADER_SIZE + 2 {
            let code = u16::from_be_bytes([
                pup.contents[ERROR_HEADER_SIZE],
                pup.contents[ERROR_HEADER_SIZE + 1],
            ]);
            let text = String::from_utf8_lossy(&pup.contents[ERROR_HEADER_SIZE + 2..]);
            warn!(socket = self.socket_id, code, %text, "Received error pup");
        } else {
            warn!(socket = self.socket_id, text = %pup.contents_lossy(), "Received error pup");
        }
    }

    /// Counts an Interrupt and answers it with an InterruptReply.
    pub(crate) fn recv_interrupt(&self, pup: &Pup) {
        let mut inner = self.lock();
        if inner.state.is_terminal() || inner.state == ChannelState::Establishing {
            warn!(socket = self.socket_id, state = %inner.state, "Interrupt outside an open channel, ignoring");
            return;
        }
        inner.interrupts += 1;
        let reply = self.outbound(PupType::InterruptReply, pup.id, Vec::new());
        drop(inner);
        info!(socket = self.socket_id, id = pup.id, "Received interrupt");
        self.router.send_pup(reply);
    }
}

// ============================================================================
// Internals
// ============================================================================

impl Channel {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self, pup_type: PupType, id: u32, contents: Vec<u8>) -> Pup {
        Pup::new(pup_type, id, self.client_port, self.server_port, contents)
    }

    // Blocks until the channel is writable and `ready` holds. Each ack
    // timeout retransmits everything outstanding; too many fruitless rounds
    // abort the channel.
    fn wait_for_room(
        &self,
        ready: impl Fn(&Inner) -> bool,
    ) -> Result<MutexGuard<'_, Inner>, Error> {
        let mut inner = self.lock();
        loop {
            if inner.check_writable()? && ready(&*inner) {
                return Ok(inner);
            }
            if inner.state == ChannelState::Establishing {
                inner = self.wait(inner);
                continue;
            }

            let (guard, timeout) = self
                .cond
                .wait_timeout(inner, self.ack_timeout)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
            if !timeout.timed_out() || inner.check_writable().is_err() {
                continue;
            }

            inner.stalled_rounds += 1;
            if inner.stalled_rounds > self.max_retransmits {
                drop(inner);
                self.send_abort("Timed out waiting for acknowledgment.");
                return Err(Error::AckTimeout);
            }

            let mut resend: Vec<Pup> = inner.outstanding.iter().cloned().collect();
            if let Some(last) = resend.last_mut() {
                last.pup_type = match last.pup_type {
                    PupType::Data => PupType::AData,
                    PupType::Mark => PupType::AMark,
                    other => other,
                };
            }
            let round = inner.stalled_rounds;
            drop(inner);

            warn!(socket = self.socket_id, count = resend.len(), round, "Ack timeout, retransmitting");
            for pup in resend {
                self.router.send_pup(pup);
            }
            inner = self.lock();
        }
    }

    // Enters a terminal state, releases buffers, wakes everyone and publishes
    // the destroy event. Repeated calls are no-ops.
    fn finish(&self, mut inner: MutexGuard<'_, Inner>, state: ChannelState, message: Option<String>) {
        if inner.state.is_terminal() {
            return;
        }
        let previous = inner.state;
        inner.state = state;
        inner.abort_message = message;
        inner.release();
        drop(inner);
        self.cond.notify_all();

        info!(socket = self.socket_id, %previous, %state, "Channel terminated");

        let hook = self
            .destroy_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook(self);
        }
    }
}
