//! The hub: single authority over presence and membership.
//!
//! Register, Unregister and Deliver go through one unbounded intake and are
//! applied by a single consumer ([`HubLoop`]) in submission order. Presence
//! queries and conversation joins bypass the loop and take the registry
//! locks directly.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use parley_core::{ConversationId, EventKind, HubError, UserId, WireEvent};
use parley_telemetry::MetricsRecorder;

use crate::registry::{MembershipIndex, PresenceRegistry};
use crate::session::{QueueError, Session};

/// Event consumed by the hub loop.
#[derive(Debug)]
pub enum HubEvent {
    Register(Session),
    Unregister(Session),
    Deliver(WireEvent),
}

struct HubState {
    presence: PresenceRegistry,
    membership: MembershipIndex,
    metrics: Arc<MetricsRecorder>,
}

/// Cloneable handle used by the gateway and the HTTP layer.
#[derive(Clone)]
pub struct Hub {
    intake: mpsc::UnboundedSender<HubEvent>,
    state: Arc<HubState>,
}

impl Hub {
    /// Create a hub and the loop that must be driven for it to make progress.
    pub fn new(metrics: Arc<MetricsRecorder>) -> (Self, HubLoop) {
        let (intake, rx) = mpsc::unbounded_channel();
        let state = Arc::new(HubState {
            presence: PresenceRegistry::new(),
            membership: MembershipIndex::new(),
            metrics,
        });
        let hub = Self {
            intake,
            state: Arc::clone(&state),
        };
        (hub, HubLoop { rx, state })
    }

    /// Create a hub and spawn its loop; the loop stops when `shutdown` fires.
    pub fn spawn(
        metrics: Arc<MetricsRecorder>,
        shutdown: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (hub, hub_loop) = Self::new(metrics);
        let handle = tokio::spawn(hub_loop.run(shutdown));
        (hub, handle)
    }

    pub fn register(&self, session: Session) -> Result<(), HubError> {
        self.submit(HubEvent::Register(session))
    }

    pub fn unregister(&self, session: Session) -> Result<(), HubError> {
        self.submit(HubEvent::Unregister(session))
    }

    /// Queue `event` for delivery to the live members of its conversation.
    pub fn broadcast(&self, event: WireEvent) -> Result<(), HubError> {
        self.submit(HubEvent::Deliver(event))
    }

    fn submit(&self, event: HubEvent) -> Result<(), HubError> {
        self.intake.send(event).map_err(|_| HubError::Closed)
    }

    /// Subscribe `user_id` to live events of `conversation_id`. Returns false
    /// if the user was already a member.
    pub fn join_conversation(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        let joined = self.state.membership.join(conversation_id, user_id);
        if joined {
            debug!(conversation_id = %conversation_id, user_id = %user_id, "joined conversation");
        }
        joined
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.state.presence.is_online(user_id)
    }

    pub fn list_online(&self) -> Vec<UserId> {
        self.state.presence.list_online()
    }

    pub fn online_count(&self) -> usize {
        self.state.presence.online_count()
    }

    pub fn is_member(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        self.state.membership.is_member(conversation_id, user_id)
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.state.metrics
    }

    /// True once the loop has stopped consuming events.
    pub fn is_closed(&self) -> bool {
        self.intake.is_closed()
    }
}

/// Single consumer of hub events. The only code that mutates presence.
pub struct HubLoop {
    rx: mpsc::UnboundedReceiver<HubEvent>,
    state: Arc<HubState>,
}

impl HubLoop {
    /// Process events until every `Hub` handle is dropped or `shutdown`
    /// fires. On shutdown all live sessions are closed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("hub loop started");
        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        self.rx.close();
        // Sessions still waiting in the intake never make it into the registry.
        while let Ok(event) = self.rx.try_recv() {
            if let HubEvent::Register(session) | HubEvent::Unregister(session) = event {
                session.close();
            }
        }
        self.close_all();
        info!("hub loop stopped");
    }

    /// Apply every event already queued, without waiting for more.
    /// Returns how many were processed.
    pub fn run_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.handle(event);
            processed += 1;
        }
        processed
    }

    fn handle(&self, event: HubEvent) {
        match event {
            HubEvent::Register(session) => self.register(session),
            HubEvent::Unregister(session) => self.unregister(&session),
            HubEvent::Deliver(event) => self.deliver(event),
        }
    }

    fn register(&self, session: Session) {
        let registration = self.state.presence.register(session.clone());

        if let Some(previous) = registration.replaced {
            if !previous.is_same_connection(&session) {
                info!(
                    user_id = %session.user_id,
                    connection_id = %previous.connection_id,
                    "closing superseded session"
                );
                previous.close();
            }
        }

        info!(
            user_id = %session.user_id,
            connection_id = %session.connection_id,
            online = registration.others.len() + 1,
            "session registered"
        );
        let metrics = &self.state.metrics;
        metrics.counter_inc("hub.sessions.registered", &[], 1);
        metrics.gauge_set("hub.sessions.online", &[], self.state.presence.online_count() as i64);

        // Snapshot of who is already here, one event per user.
        for other in &registration.others {
            if let Some(payload) = encode(&WireEvent::user_online(&other.user_id)) {
                push_presence(&session, payload, EventKind::UserOnline, metrics);
            }
        }

        if let Some(payload) = encode(&WireEvent::user_online(&session.user_id)) {
            for other in &registration.others {
                push_presence(other, payload.clone(), EventKind::UserOnline, metrics);
            }
        }
    }

    fn unregister(&self, session: &Session) {
        session.close();

        if !self.state.presence.unregister(session) {
            debug!(
                user_id = %session.user_id,
                connection_id = %session.connection_id,
                "session already unregistered"
            );
            return;
        }

        info!(
            user_id = %session.user_id,
            connection_id = %session.connection_id,
            "session unregistered"
        );
        let metrics = &self.state.metrics;
        metrics.counter_inc("hub.sessions.unregistered", &[], 1);
        metrics.gauge_set("hub.sessions.online", &[], self.state.presence.online_count() as i64);

        if let Some(payload) = encode(&WireEvent::user_offline(&session.user_id)) {
            for remaining in self.state.presence.sessions() {
                push_presence(&remaining, payload.clone(), EventKind::UserOffline, metrics);
            }
        }
    }

    fn deliver(&self, event: WireEvent) {
        let metrics = &self.state.metrics;
        let Some(members) = self.state.membership.members(&event.conversation_id) else {
            debug!(
                conversation_id = %event.conversation_id,
                kind = %event.kind,
                "no members for conversation, dropping event"
            );
            metrics.counter_inc("hub.broadcasts.dropped", &[], 1);
            return;
        };

        let Some(payload) = encode(&event) else {
            return;
        };

        let mut delivered = 0u64;
        let mut overflowed = Vec::new();
        for user_id in members {
            if user_id == event.sender_id {
                continue;
            }
            let Some(session) = self.state.presence.get(&user_id) else {
                trace!(user_id = %user_id, "member offline, skipping");
                continue;
            };
            match session.try_push(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(QueueError::Full) => overflowed.push(session),
                // An Unregister for this session is already queued behind us.
                Err(QueueError::Closed) => {
                    trace!(user_id = %user_id, "session closing, skipping");
                }
            }
        }

        debug!(
            conversation_id = %event.conversation_id,
            kind = %event.kind,
            delivered,
            "event delivered"
        );
        metrics.counter_inc("hub.deliveries", &[("kind", event.kind.as_str())], delivered);

        for session in overflowed {
            warn!(
                user_id = %session.user_id,
                connection_id = %session.connection_id,
                "outbound queue full, evicting session"
            );
            metrics.counter_inc("hub.sessions.evicted", &[], 1);
            self.unregister(&session);
        }
    }

    fn close_all(&self) {
        let sessions = self.state.presence.drain();
        for session in &sessions {
            session.close();
        }
        if !sessions.is_empty() {
            info!(closed = sessions.len(), "closed live sessions");
        }
        self.state.metrics.gauge_set("hub.sessions.online", &[], 0);
    }
}

fn encode(event: &WireEvent) -> Option<Bytes> {
    match event.encode() {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(error = %e, kind = %event.kind, "failed to encode event");
            None
        }
    }
}

/// Presence notifications are best-effort: a full queue drops the
/// notification but does not evict the session.
fn push_presence(session: &Session, payload: Bytes, kind: EventKind, metrics: &MetricsRecorder) {
    match session.try_push(payload) {
        Ok(()) => metrics.counter_inc("hub.deliveries", &[("kind", kind.as_str())], 1),
        Err(e) => debug!(user_id = %session.user_id, kind = %kind, error = %e, "presence event dropped"),
    }
}
