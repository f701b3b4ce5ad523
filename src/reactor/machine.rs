use crate::codec::Frame;
use crate::delivery::{Delivery, DeliveryTag};
use crate::errors::*;
use crate::handler::{Handler, LinkId, SessionId};
use crate::options::{ConnectionOptions, ReceiverOptions, SenderOptions};
use crate::performative::{
    Attach, Begin, Close, Condition, Detach, Disposition, End, Flow, Open, Outcome, Performative,
    Role, Transfer,
};
use crate::reactor::link::{Link, LinkState};
use crate::reactor::session::{Session, SessionState, UnsettledSend, SESSION_WINDOW};
use crate::reactor::session_slots::SessionSlots;
use crate::reactor::Context;
use indexmap::IndexMap;
use log::{debug, error, trace, warn};
use snafu::{ensure, OptionExt};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

/// Connection lifecycle. `Idle` is both the initial state and the state
/// between generations while reconnection backs off. `Closed` and `Failed`
/// are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Idle,
    Connecting,
    AuthPending,
    Open,
    Closing,
    Closed,
    Failed,
}

/// Idle-timeout windows negotiated from the Open exchange, handed to the
/// event loop's timers once per generation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct IdlePlan {
    /// How often we must emit traffic to keep the peer from expiring us.
    pub(crate) tx: Option<Duration>,
    /// How long the peer may stay silent before we expire it.
    pub(crate) rx: Option<Duration>,
}

/// Run application code (a handler callback or a work task), containing any
/// panic. A panicking handler is a bug in the application, but it must not
/// take the event loop down with it.
pub(crate) fn shielded<F: FnOnce()>(callback: &'static str, f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        error!("handler panicked in {}: {}", callback, message);
    }
}

fn promote_0_u16(v: u16) -> u16 {
    if v == 0 {
        u16::max_value()
    } else {
        v
    }
}

fn promote_0_u32(v: u32) -> u32 {
    if v == 0 {
        u32::max_value()
    } else {
        v
    }
}

fn unexpected<T>(performative: &'static str, state: ConnectionState) -> Result<T> {
    UnexpectedPerformativeSnafu {
        performative,
        state: format!("{:?}", state),
    }
    .fail()
}

fn client_properties() -> Vec<(String, String)> {
    vec![
        ("product".to_string(), crate::built_info::PKG_NAME.to_string()),
        (
            "version".to_string(),
            crate::built_info::PKG_VERSION.to_string(),
        ),
        ("platform".to_string(), crate::built_info::TARGET.to_string()),
    ]
}

/// The connection's protocol state machine.
///
/// Owns every session and link for the lifetime of the container; the
/// per-generation wire details (channels, handles, credit) are reset on
/// failover while the endpoint records themselves survive and drive replay.
/// The core never touches the transport: incoming frames arrive through
/// [`process_frame`](Core::process_frame) and outgoing frames accumulate in
/// an outbox the event loop drains into the codec.
pub(crate) struct Core {
    options: ConnectionOptions,
    state: ConnectionState,
    /// Bumped on every failover; deliveries are stamped with it so stale
    /// settlements can be refused.
    generation: u64,
    next_session_id: u32,
    next_link_id: u32,
    sessions: IndexMap<SessionId, Session>,
    links: IndexMap<LinkId, Link>,
    /// Our channel number to session.
    channels: SessionSlots,
    /// The peer's channel number to session, learned from Begin.
    remote_channels: HashMap<u16, SessionId>,
    outbox: Vec<Frame>,
    writes_sealed: bool,
    pending_idle: Option<IdlePlan>,
    /// Settlements produced by local operations; delivered to the handler
    /// at the next dispatch point since local operations run inside handler
    /// or work-task context where no handler borrow is available.
    pending_settles: Vec<(LinkId, DeliveryTag, Outcome)>,
    close_requested: bool,
    close_dispatched: bool,
    done: Option<Result<()>>,
}

impl Core {
    pub(crate) fn new(options: ConnectionOptions) -> Core {
        Core {
            options,
            state: ConnectionState::Idle,
            generation: 0,
            next_session_id: 0,
            next_link_id: 0,
            sessions: IndexMap::new(),
            links: IndexMap::new(),
            channels: SessionSlots::new(),
            remote_channels: HashMap::new(),
            outbox: Vec::new(),
            writes_sealed: false,
            pending_idle: None,
            pending_settles: Vec::new(),
            close_requested: false,
            close_dispatched: false,
            done: None,
        }
    }

    pub(crate) fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn done(&self) -> Option<&Result<()>> {
        self.done.as_ref()
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<Frame> {
        std::mem::replace(&mut self.outbox, Vec::new())
    }

    pub(crate) fn writes_sealed(&self) -> bool {
        self.writes_sealed
    }

    pub(crate) fn take_idle_plan(&mut self) -> Option<IdlePlan> {
        self.pending_idle.take()
    }

    fn push(&mut self, channel: u16, performative: Performative) {
        trace!("enqueueing {} on channel {}", performative.name(), channel);
        self.outbox.push(Frame::amqp(channel, performative));
    }

    // ---- connection lifecycle -------------------------------------------

    pub(crate) fn set_connecting(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Idle);
        self.state = ConnectionState::Connecting;
    }

    /// The transport is up; send Open and wait for the peer's.
    pub(crate) fn transport_connected(&mut self, hostname: &str) {
        debug_assert_eq!(self.state, ConnectionState::Connecting);
        let open = Open {
            container_id: self.options.container_id.clone(),
            hostname: Some(hostname.to_string()),
            max_frame_size: promote_0_u32(self.options.max_frame_size),
            channel_max: promote_0_u16(self.options.channel_max),
            idle_timeout_ms: self
                .options
                .idle_timeout
                .map(|d| d.as_millis() as u32)
                .unwrap_or(0),
            properties: client_properties(),
        };
        self.push(0, Performative::Open(open));
        self.state = ConnectionState::AuthPending;
    }

    /// The transport died while a retry is still allowed. Resets all
    /// per-generation state; the surviving session and link records drive
    /// replay once a new transport comes up.
    pub(crate) fn fail_over(&mut self, err: &Error, handler: &mut dyn Handler) {
        warn!("connection lost ({}); preparing to reconnect", err);
        shielded("on_transport_error", || {
            handler.on_transport_error(&mut Context::new(self), err)
        });
        let pending = self.drain_unsettled();
        for (link, tag) in pending {
            self.pending_settles.push((link, tag, Outcome::Indeterminate));
        }
        if self.close_requested {
            // the application already asked to close; finish locally rather
            // than reconnecting just to say goodbye
            self.state = ConnectionState::Closed;
            self.done = Some(Ok(()));
            self.drain_pending(handler);
            return;
        }
        self.drain_pending(handler);

        self.generation += 1;
        self.outbox.clear();
        self.writes_sealed = false;
        self.pending_idle = None;
        self.remote_channels.clear();
        self.channels.clear();
        for session in self.sessions.values_mut() {
            session.reset_for_replay();
        }
        for link in self.links.values_mut() {
            link.reset_for_replay();
        }
        self.state = ConnectionState::Idle;
    }

    /// Terminal failure; no further attempts will be made. A result already
    /// recorded (an orderly close that raced the socket dying) wins.
    pub(crate) fn fail(&mut self, err: Error) {
        if self.done.is_some() {
            trace!("connection already finished; dropping late error {}", err);
            return;
        }
        let pending = self.drain_unsettled();
        for (link, tag) in pending {
            self.pending_settles.push((link, tag, Outcome::Indeterminate));
        }
        self.state = ConnectionState::Failed;
        self.done = Some(Err(err));
    }

    /// Deliver queued settlements and, once the connection is done, the
    /// final close callback. Safe to call at any time.
    pub(crate) fn drain_pending(&mut self, handler: &mut dyn Handler) {
        while !self.pending_settles.is_empty() {
            let batch: Vec<_> = self.pending_settles.drain(..).collect();
            for (link, tag, outcome) in batch {
                shielded("on_delivery_settle", || {
                    handler.on_delivery_settle(&mut Context::new(self), link, tag, outcome)
                });
            }
        }
        if self.done.is_some() && !self.close_dispatched {
            self.close_dispatched = true;
            let err = match &self.done {
                Some(Err(err)) => Some(err.clone()),
                _ => None,
            };
            shielded("on_connection_close", || {
                handler.on_connection_close(&mut Context::new(self), err.as_ref())
            });
        }
    }

    fn drain_unsettled(&mut self) -> Vec<(LinkId, DeliveryTag)> {
        let mut out = Vec::new();
        for session in self.sessions.values_mut() {
            for (_, unsettled) in session.unsettled.drain(..) {
                out.push((unsettled.link, unsettled.tag));
            }
        }
        out
    }

    // ---- incoming frames ------------------------------------------------

    pub(crate) fn process_frame(&mut self, frame: Frame, handler: &mut dyn Handler) -> Result<()> {
        let result = match frame {
            Frame::Empty => {
                trace!("received empty frame");
                Ok(())
            }
            Frame::Amqp {
                channel,
                performative,
            } => {
                if self.state == ConnectionState::Closed || self.state == ConnectionState::Failed {
                    trace!(
                        "ignoring {} received after connection finished",
                        performative.name()
                    );
                    return Ok(());
                }
                trace!("received {} on channel {}", performative.name(), channel);
                match performative {
                    Performative::Open(open) => self.process_open(open, handler),
                    Performative::Begin(begin) => self.process_begin(channel, begin, handler),
                    Performative::Attach(attach) => self.process_attach(channel, attach, handler),
                    Performative::Flow(flow) => self.process_flow(channel, flow, handler),
                    Performative::Transfer(transfer) => {
                        self.process_transfer(channel, transfer, handler)
                    }
                    Performative::Disposition(disposition) => {
                        self.process_disposition(channel, disposition, handler)
                    }
                    Performative::Detach(detach) => self.process_detach(channel, detach, handler),
                    Performative::End(end) => self.process_end(channel, end, handler),
                    Performative::Close(close) => self.process_close(close, handler),
                }
            }
        };
        self.drain_pending(handler);
        result
    }

    fn session_on(&self, channel: u16) -> Result<SessionId> {
        self.remote_channels
            .get(&channel)
            .copied()
            .context(UnknownChannelSnafu { channel })
    }

    fn process_open(&mut self, open: Open, handler: &mut dyn Handler) -> Result<()> {
        if self.state == ConnectionState::Closing {
            // we closed out of AuthPending and the peer's pipelined Open
            // crossed our Close on the wire
            trace!("ignoring open received while closing");
            return Ok(());
        }
        if self.state != ConnectionState::AuthPending {
            return unexpected("open", self.state);
        }
        debug!(
            "connection open (remote container {:?}, channel_max {}, idle_timeout {}ms)",
            open.container_id, open.channel_max, open.idle_timeout_ms
        );

        let local_max = promote_0_u16(self.options.channel_max);
        self.channels
            .set_channel_max(u16::min(local_max, open.channel_max));

        // we must produce traffic within the peer's window and may expire
        // the peer when it exceeds ours; half and double give both sides
        // scheduling slack
        self.pending_idle = Some(IdlePlan {
            tx: match open.idle_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(u64::from(ms)) / 2),
            },
            rx: self.options.idle_timeout.map(|d| d * 2),
        });
        self.state = ConnectionState::Open;

        shielded("on_connection_open", || {
            handler.on_connection_open(&mut Context::new(self))
        });

        // replay sessions that survived from an earlier generation plus any
        // opened while disconnected
        let to_begin: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state == SessionState::Unmapped)
            .map(|(id, _)| *id)
            .collect();
        for id in to_begin {
            self.send_begin(id)?;
        }
        Ok(())
    }

    fn send_begin(&mut self, id: SessionId) -> Result<()> {
        let channel = self.channels.allocate(id)?;
        let session = self.sessions.get_mut(&id).expect("session exists");
        session.local_channel = Some(channel);
        session.state = SessionState::BeginSent;
        let begin = Begin {
            remote_channel: None,
            next_outgoing_id: session.next_outgoing_id,
            incoming_window: SESSION_WINDOW,
            outgoing_window: SESSION_WINDOW,
        };
        self.push(channel, Performative::Begin(begin));
        Ok(())
    }

    fn process_begin(&mut self, channel: u16, begin: Begin, handler: &mut dyn Handler) -> Result<()> {
        // the peer echoes our channel; a Begin without one would be a
        // peer-initiated session, which this runtime does not accept
        let local_channel = match begin.remote_channel {
            Some(ch) => ch,
            None => return unexpected("begin", self.state),
        };
        let id = self
            .channels
            .lookup(local_channel)
            .context(UnknownChannelSnafu {
                channel: local_channel,
            })?;
        let session = self.sessions.get_mut(&id).expect("allocated session exists");
        if session.state != SessionState::BeginSent {
            return unexpected("begin", self.state);
        }
        session.state = SessionState::Mapped;
        session.remote_channel = Some(channel);
        session.next_incoming_id = begin.next_outgoing_id;
        self.remote_channels.insert(channel, id);
        debug!("{} mapped to channels {}/{}", id, local_channel, channel);

        shielded("on_session_open", || {
            handler.on_session_open(&mut Context::new(self), id)
        });

        let to_attach: Vec<LinkId> = self.sessions[&id]
            .links
            .iter()
            .copied()
            .filter(|lid| self.links[lid].state == LinkState::Unattached)
            .collect();
        for lid in to_attach {
            self.send_attach(lid);
        }
        Ok(())
    }

    fn send_attach(&mut self, id: LinkId) {
        let session_id = self.links[&id].session;
        let (handle, channel) = {
            let session = self.sessions.get_mut(&session_id).expect("link session exists");
            let handle = session.next_handle;
            session.next_handle += 1;
            (handle, session.local_channel.expect("mapped session has a channel"))
        };
        let link = self.links.get_mut(&id).expect("link exists");
        link.handle = Some(handle);
        link.state = LinkState::AttachSent;
        let (source, target) = match link.role {
            Role::Receiver => (Some(link.address.clone()), None),
            Role::Sender => (None, Some(link.address.clone())),
        };
        let attach = Attach {
            name: link.name.clone(),
            handle,
            role: link.role,
            source,
            target,
        };
        self.push(channel, Performative::Attach(attach));
    }

    fn process_attach(
        &mut self,
        channel: u16,
        attach: Attach,
        handler: &mut dyn Handler,
    ) -> Result<()> {
        let session_id = self.session_on(channel)?;
        let link_id = match self.sessions[&session_id]
            .links
            .iter()
            .copied()
            .find(|lid| self.links[lid].name == attach.name)
        {
            Some(lid) => lid,
            // an attach we never initiated
            None => return unexpected("attach", self.state),
        };
        {
            let link = self.links.get_mut(&link_id).expect("link exists");
            if link.state != LinkState::AttachSent {
                return unexpected("attach", self.state);
            }
            link.state = LinkState::Attached;
            link.remote_handle = Some(attach.handle);
        }
        self.sessions
            .get_mut(&session_id)
            .expect("session exists")
            .remote_handles
            .insert(attach.handle, link_id);
        debug!("{} attached ({})", link_id, attach.name);

        // receivers lead with their standing window
        let initial_window = {
            let link = &self.links[&link_id];
            if link.role == Role::Receiver && link.credit_window > 0 {
                Some(link.credit_window)
            } else {
                None
            }
        };
        if let Some(window) = initial_window {
            let link = self.links.get_mut(&link_id).expect("link exists");
            link.credit = window;
            self.push_link_flow(link_id);
        }

        shielded("on_link_open", || {
            handler.on_link_open(&mut Context::new(self), link_id)
        });
        Ok(())
    }

    fn push_link_flow(&mut self, id: LinkId) {
        let (frame_channel, flow) = {
            let link = &self.links[&id];
            let session = &self.sessions[&link.session];
            let flow = Flow {
                handle: link.handle,
                delivery_count: link.delivery_count,
                link_credit: link.credit,
                next_incoming_id: session.next_incoming_id,
                incoming_window: SESSION_WINDOW,
                next_outgoing_id: session.next_outgoing_id,
                outgoing_window: SESSION_WINDOW,
            };
            (
                session.local_channel.expect("mapped session has a channel"),
                flow,
            )
        };
        self.push(frame_channel, Performative::Flow(flow));
    }

    fn link_on(&self, channel: u16, handle: u32) -> Result<LinkId> {
        let session_id = self.session_on(channel)?;
        self.sessions[&session_id]
            .remote_handles
            .get(&handle)
            .copied()
            .context(UnknownLinkHandleSnafu { channel, handle })
    }

    fn process_flow(&mut self, channel: u16, flow: Flow, handler: &mut dyn Handler) -> Result<()> {
        let handle = match flow.handle {
            Some(handle) => handle,
            // session-level flow carries nothing we enforce
            None => return Ok(()),
        };
        let link_id = self.link_on(channel, handle)?;
        let newly_sendable = {
            let link = self.links.get_mut(&link_id).expect("link exists");
            match link.role {
                Role::Sender => {
                    link.apply_sender_flow(&flow);
                    trace!("{} credit now {}", link_id, link.credit);
                    let newly = link.state == LinkState::Attached
                        && link.credit > 0
                        && !link.was_sendable;
                    if newly {
                        link.was_sendable = true;
                    }
                    newly
                }
                Role::Receiver => {
                    // the sender announces its delivery count, e.g. when it
                    // advances the count instead of sending (drain)
                    link.delivery_count = flow.delivery_count;
                    false
                }
            }
        };
        if newly_sendable {
            shielded("on_sendable", || {
                handler.on_sendable(&mut Context::new(self), link_id)
            });
        }
        Ok(())
    }

    fn process_transfer(
        &mut self,
        channel: u16,
        transfer: Transfer,
        handler: &mut dyn Handler,
    ) -> Result<()> {
        let session_id = self.session_on(channel)?;
        let link_id = self.link_on(channel, transfer.handle)?;
        let auto_accept = {
            let link = self.links.get_mut(&link_id).expect("link exists");
            if link.role != Role::Receiver || link.state != LinkState::Attached {
                return unexpected("transfer", self.state);
            }
            ensure!(link.credit > 0, CreditViolationSnafu { link: link_id });
            link.credit -= 1;
            link.delivery_count = link.delivery_count.wrapping_add(1);
            link.auto_accept
        };
        {
            let session = self.sessions.get_mut(&session_id).expect("session exists");
            session.next_incoming_id = transfer.delivery_id.wrapping_add(1);
        }

        let mut delivery = Delivery {
            link: link_id,
            session: session_id,
            delivery_id: transfer.delivery_id,
            tag: transfer.delivery_tag,
            payload: transfer.payload,
            settled: transfer.settled,
            outcome: None,
            generation: self.generation,
        };
        shielded("on_message", || {
            handler.on_message(&mut Context::new(self), &mut delivery)
        });
        if !delivery.settled && auto_accept {
            // cannot fail: the delivery is unsettled and from this generation
            let _ = self.settle_delivery(&mut delivery, Outcome::Accepted);
        }
        self.replenish(link_id);
        Ok(())
    }

    /// Top the standing credit window back up once half of it is consumed.
    fn replenish(&mut self, id: LinkId) {
        let needs_flow = {
            let link = self.links.get_mut(&id).expect("link exists");
            if link.role != Role::Receiver
                || link.credit_window == 0
                || link.state != LinkState::Attached
            {
                false
            } else if link.credit <= link.credit_window / 2 {
                link.credit = link.credit_window;
                true
            } else {
                false
            }
        };
        if needs_flow {
            self.push_link_flow(id);
        }
    }

    fn process_disposition(
        &mut self,
        channel: u16,
        disposition: Disposition,
        handler: &mut dyn Handler,
    ) -> Result<()> {
        let session_id = self.session_on(channel)?;
        if disposition.role != Role::Receiver {
            // the peer reporting state for its own transfers; nothing to do
            return Ok(());
        }
        let last = disposition.last.unwrap_or(disposition.first);
        let mut settled = Vec::new();
        {
            // walk what we actually have outstanding; the peer's range can
            // legally span the whole id space
            let session = self.sessions.get_mut(&session_id).expect("session exists");
            let in_range: Vec<u32> = session
                .unsettled
                .keys()
                .copied()
                .filter(|id| *id >= disposition.first && *id <= last)
                .collect();
            for id in in_range {
                if let Some(unsettled) = session.unsettled.shift_remove(&id) {
                    settled.push((unsettled.link, unsettled.tag));
                }
            }
        }
        let outcome = disposition.state.unwrap_or(Outcome::Accepted);
        for (link, tag) in settled {
            shielded("on_delivery_settle", || {
                handler.on_delivery_settle(&mut Context::new(self), link, tag, outcome)
            });
        }
        // a deferred close may now be able to proceed
        self.maybe_finish_close();
        Ok(())
    }

    fn process_detach(
        &mut self,
        channel: u16,
        detach: Detach,
        handler: &mut dyn Handler,
    ) -> Result<()> {
        let session_id = self.session_on(channel)?;
        let link_id = self
            .sessions
            .get_mut(&session_id)
            .expect("session exists")
            .remote_handles
            .remove(&detach.handle)
            .context(UnknownLinkHandleSnafu {
                channel,
                handle: detach.handle,
            })?;
        let (previous, our_handle) = {
            let link = self.links.get_mut(&link_id).expect("link exists");
            let previous = link.state;
            link.state = LinkState::Detached;
            link.remote_handle = None;
            (previous, link.handle)
        };
        match previous {
            LinkState::DetachSent => (),
            LinkState::Attached | LinkState::AttachSent => {
                // peer-initiated; acknowledge
                let handle = our_handle.expect("attached link has a handle");
                let frame_channel = self.sessions[&session_id]
                    .local_channel
                    .expect("mapped session has a channel");
                self.push(
                    frame_channel,
                    Performative::Detach(Detach {
                        handle,
                        closed: true,
                        error: None,
                    }),
                );
            }
            _ => return unexpected("detach", self.state),
        }
        if let Some(condition) = &detach.error {
            warn!(
                "peer detached {} ({}: {})",
                link_id, condition.condition, condition.description
            );
        }
        shielded("on_link_close", || {
            handler.on_link_close(&mut Context::new(self), link_id, detach.error.as_ref())
        });
        Ok(())
    }

    fn process_end(&mut self, channel: u16, end: End, handler: &mut dyn Handler) -> Result<()> {
        let session_id = self.session_on(channel)?;
        let (previous, local_channel) = {
            let session = self.sessions.get_mut(&session_id).expect("session exists");
            let previous = session.state;
            session.state = SessionState::Ended;
            session.remote_handles.clear();
            (previous, session.local_channel)
        };
        let local_channel = local_channel.expect("mapped session has a channel");
        match previous {
            SessionState::EndSent => (),
            SessionState::Mapped | SessionState::BeginSent => {
                // peer-initiated; acknowledge
                self.push(local_channel, Performative::End(End { error: None }));
            }
            _ => return unexpected("end", self.state),
        }
        self.channels.release(local_channel);
        self.remote_channels.remove(&channel);

        // child links die with the session
        let children: Vec<LinkId> = self.sessions[&session_id]
            .links
            .iter()
            .copied()
            .filter(|lid| !self.links[lid].is_retired())
            .collect();
        for child in children {
            self.links.get_mut(&child).expect("link exists").state = LinkState::Detached;
            shielded("on_link_close", || {
                handler.on_link_close(&mut Context::new(self), child, None)
            });
        }
        shielded("on_session_close", || {
            handler.on_session_close(&mut Context::new(self), session_id, end.error.as_ref())
        });
        Ok(())
    }

    fn process_close(&mut self, close: Close, _handler: &mut dyn Handler) -> Result<()> {
        match self.state {
            ConnectionState::Closing => {
                // ack of our close
                self.state = ConnectionState::Closed;
                self.done = Some(Ok(()));
            }
            ConnectionState::AuthPending | ConnectionState::Open => {
                // peer-initiated; in-flight deliveries will never settle now
                let pending = self.drain_unsettled();
                for (link, tag) in pending {
                    self.pending_settles.push((link, tag, Outcome::Indeterminate));
                }
                self.push_close(None);
                self.state = ConnectionState::Closed;
                self.done = Some(match close.error {
                    Some(condition) => {
                        error!(
                            "peer closed connection ({}: {})",
                            condition.condition, condition.description
                        );
                        RemoteClosedConnectionSnafu {
                            condition: condition.condition,
                            description: condition.description,
                        }
                        .fail()
                    }
                    None => Ok(()),
                });
            }
            _ => return unexpected("close", self.state),
        }
        Ok(())
    }

    fn push_close(&mut self, error: Option<Condition>) {
        self.push(0, Performative::Close(Close { error }));
        self.writes_sealed = true;
    }

    // ---- local operations (reached through Context) ---------------------

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                ConnectionClosedSnafu.fail()
            }
            _ if self.close_requested => ConnectionClosedSnafu.fail(),
            _ => Ok(()),
        }
    }

    pub(crate) fn open_session(&mut self) -> Result<SessionId> {
        self.ensure_usable()?;
        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        self.sessions.insert(id, Session::new(id));
        if self.state == ConnectionState::Open {
            if let Err(err) = self.send_begin(id) {
                self.sessions.shift_remove(&id);
                return Err(err);
            }
        }
        debug!("opened {}", id);
        Ok(id)
    }

    pub(crate) fn close_session(&mut self, id: SessionId) -> Result<()> {
        self.ensure_usable()?;
        let session = self
            .sessions
            .get_mut(&id)
            .context(UnknownSessionSnafu { session: id })?;
        match session.state {
            SessionState::Ended | SessionState::EndSent => Ok(()),
            SessionState::Unmapped => {
                // never reached the wire; retire locally along with its links
                session.state = SessionState::Ended;
                let children = session.links.clone();
                for child in children {
                    self.links.get_mut(&child).expect("link exists").state = LinkState::Detached;
                }
                Ok(())
            }
            SessionState::BeginSent | SessionState::Mapped => {
                let channel = session.local_channel.expect("begun session has a channel");
                session.state = SessionState::EndSent;
                self.push(channel, Performative::End(End { error: None }));
                Ok(())
            }
        }
    }

    pub(crate) fn open_sender(
        &mut self,
        session: SessionId,
        address: &str,
        options: SenderOptions,
    ) -> Result<LinkId> {
        self.open_link(session, address, Role::Sender, options.auto_settle, 0, true)
    }

    pub(crate) fn open_receiver(
        &mut self,
        session: SessionId,
        address: &str,
        options: ReceiverOptions,
    ) -> Result<LinkId> {
        let window = options.credit_window.unwrap_or(self.options.credit_window);
        let auto_accept = options.auto_accept.unwrap_or(self.options.auto_accept);
        self.open_link(session, address, Role::Receiver, false, window, auto_accept)
    }

    fn open_link(
        &mut self,
        session_id: SessionId,
        address: &str,
        role: Role,
        auto_settle: bool,
        credit_window: u32,
        auto_accept: bool,
    ) -> Result<LinkId> {
        self.ensure_usable()?;
        let session = self
            .sessions
            .get_mut(&session_id)
            .context(UnknownSessionSnafu {
                session: session_id,
            })?;
        ensure!(
            !session.is_retired(),
            UnknownSessionSnafu {
                session: session_id
            }
        );
        let id = LinkId(self.next_link_id);
        self.next_link_id += 1;
        let name = format!("{}-{}", self.options.container_id, id);
        let mut link = Link::new(id, session_id, name, role, address.to_string());
        link.auto_settle = auto_settle;
        link.credit_window = credit_window;
        link.auto_accept = auto_accept;
        session.links.push(id);
        let mapped = session.state == SessionState::Mapped;
        self.links.insert(id, link);
        if mapped {
            self.send_attach(id);
        }
        debug!("opened {} ({:?} for {:?})", id, role, address);
        Ok(id)
    }

    pub(crate) fn close_link(&mut self, id: LinkId) -> Result<()> {
        self.ensure_usable()?;
        let (state, handle, session_id) = {
            let link = self.links.get_mut(&id).context(UnknownLinkSnafu { link: id })?;
            (link.state, link.handle, link.session)
        };
        match state {
            LinkState::Detached | LinkState::DetachSent => Ok(()),
            LinkState::Unattached => {
                self.links.get_mut(&id).expect("link exists").state = LinkState::Detached;
                Ok(())
            }
            LinkState::AttachSent | LinkState::Attached => {
                let handle = handle.expect("attach sent implies handle");
                let channel = self.sessions[&session_id]
                    .local_channel
                    .expect("mapped session has a channel");
                self.links.get_mut(&id).expect("link exists").state = LinkState::DetachSent;
                self.push(
                    channel,
                    Performative::Detach(Detach {
                        handle,
                        closed: true,
                        error: None,
                    }),
                );
                Ok(())
            }
        }
    }

    pub(crate) fn send(&mut self, id: LinkId, payload: &[u8]) -> Result<DeliveryTag> {
        self.ensure_usable()?;
        let (handle, tag, settled, session_id) = {
            let link = self.links.get_mut(&id).context(UnknownLinkSnafu { link: id })?;
            ensure!(link.role == Role::Sender, WrongRoleSnafu { link: id });
            ensure!(
                link.state == LinkState::Attached,
                LinkNotAttachedSnafu { link: id }
            );
            ensure!(link.credit > 0, InsufficientCreditSnafu { link: id });
            link.credit -= 1;
            if link.credit == 0 {
                link.was_sendable = false;
            }
            link.delivery_count = link.delivery_count.wrapping_add(1);
            let tag = DeliveryTag(link.next_tag);
            link.next_tag += 1;
            (
                link.handle.expect("attached link has a handle"),
                tag,
                link.auto_settle,
                link.session,
            )
        };
        let (channel, delivery_id) = {
            let session = self.sessions.get_mut(&session_id).expect("link session exists");
            let delivery_id = session.next_outgoing_id;
            session.next_outgoing_id = session.next_outgoing_id.wrapping_add(1);
            if !settled {
                session
                    .unsettled
                    .insert(delivery_id, UnsettledSend { link: id, tag });
            }
            (
                session.local_channel.expect("mapped session has a channel"),
                delivery_id,
            )
        };
        self.push(
            channel,
            Performative::Transfer(Transfer {
                handle,
                delivery_id,
                delivery_tag: tag.to_bytes().to_vec(),
                settled,
                payload: payload.to_vec(),
            }),
        );
        trace!("sent delivery {} on {}", tag, id);
        Ok(tag)
    }

    pub(crate) fn credit(&self, id: LinkId) -> Result<u32> {
        let link = self.links.get(&id).context(UnknownLinkSnafu { link: id })?;
        Ok(link.credit)
    }

    pub(crate) fn session_is_open(&self, id: SessionId) -> Result<bool> {
        let session = self
            .sessions
            .get(&id)
            .context(UnknownSessionSnafu { session: id })?;
        Ok(session.state == SessionState::Mapped)
    }

    pub(crate) fn link_is_open(&self, id: LinkId) -> Result<bool> {
        let link = self.links.get(&id).context(UnknownLinkSnafu { link: id })?;
        Ok(link.state == LinkState::Attached)
    }

    pub(crate) fn link_address(&self, id: LinkId) -> Result<&str> {
        let link = self.links.get(&id).context(UnknownLinkSnafu { link: id })?;
        Ok(&link.address)
    }

    pub(crate) fn add_credit(&mut self, id: LinkId, n: u32) -> Result<()> {
        self.ensure_usable()?;
        {
            let link = self.links.get_mut(&id).context(UnknownLinkSnafu { link: id })?;
            ensure!(link.role == Role::Receiver, WrongRoleSnafu { link: id });
            ensure!(
                link.state == LinkState::Attached,
                LinkNotAttachedSnafu { link: id }
            );
            link.credit = link.credit.saturating_add(n);
        }
        self.push_link_flow(id);
        Ok(())
    }

    pub(crate) fn settle_delivery(
        &mut self,
        delivery: &mut Delivery,
        outcome: Outcome,
    ) -> Result<()> {
        ensure!(!delivery.settled, AlreadySettledSnafu);
        ensure!(delivery.generation == self.generation, StaleDeliverySnafu);
        self.ensure_usable()?;
        let channel = {
            let session = self
                .sessions
                .get(&delivery.session)
                .context(UnknownSessionSnafu {
                    session: delivery.session,
                })?;
            match session.local_channel {
                Some(channel) => channel,
                None => return StaleDeliverySnafu.fail(),
            }
        };
        self.push(
            channel,
            Performative::Disposition(Disposition {
                role: Role::Receiver,
                first: delivery.delivery_id,
                last: None,
                settled: true,
                state: Some(outcome),
            }),
        );
        delivery.settled = true;
        delivery.outcome = Some(outcome);
        self.replenish(delivery.link);
        Ok(())
    }

    pub(crate) fn request_close(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                return Ok(())
            }
            _ => (),
        }
        if self.close_requested {
            return Ok(());
        }
        self.close_requested = true;
        if !self.options.close_waits_for_settlement {
            // in-flight deliveries settle locally; their fate is unknown
            let pending = self.drain_unsettled();
            for (link, tag) in pending {
                self.pending_settles.push((link, tag, Outcome::Indeterminate));
            }
        }
        if self.state == ConnectionState::Idle || self.state == ConnectionState::Connecting {
            // nothing on the wire to close
            self.state = ConnectionState::Closed;
            self.done = Some(Ok(()));
            return Ok(());
        }
        self.maybe_finish_close();
        Ok(())
    }

    fn has_unsettled(&self) -> bool {
        self.sessions.values().any(|s| !s.unsettled.is_empty())
    }

    fn maybe_finish_close(&mut self) {
        if !self.close_requested {
            return;
        }
        match self.state {
            ConnectionState::AuthPending | ConnectionState::Open => (),
            _ => return,
        }
        if self.options.close_waits_for_settlement && self.has_unsettled() {
            trace!("close deferred until in-flight deliveries settle");
            return;
        }
        self.push_close(None);
        self.state = ConnectionState::Closing;
    }
}
