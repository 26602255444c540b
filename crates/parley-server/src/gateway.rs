//! Connection gateway: upgrades authenticated requests into sessions and
//! routes every inbound frame to the hub or the chat service.

use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tracing::{debug, info, warn};

use parley_core::{now_unix, ChatService, EventKind, HubError, UserId, WireEvent};

use crate::auth::AuthenticatedUser;
use crate::hub::Hub;
use crate::pump;
use crate::server::AppState;
use crate::session::Session;

/// `GET /ws`. Authentication happens in the extractor, before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    AuthenticatedUser(user_id): AuthenticatedUser,
    State(state): State<AppState>,
) -> Response {
    ws.max_message_size(state.config.max_frame_bytes)
        .max_frame_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| serve_socket(socket, user_id, state))
}

async fn serve_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let (session, outbound) = Session::new(user_id, state.config.send_queue_capacity);
    info!(
        user_id = %session.user_id,
        connection_id = %session.connection_id,
        "connection accepted"
    );

    if let Err(e) = state.hub.register(session.clone()) {
        warn!(user_id = %session.user_id, error = %e, "hub unavailable, dropping connection");
        return;
    }

    pump::run(
        socket,
        session,
        outbound,
        state.hub.clone(),
        Arc::clone(&state.chat),
        state.config.pump_config(),
    )
    .await;
}

/// Handle one inbound text frame for `session`.
///
/// Malformed frames and unknown event types are logged and dropped. The only
/// error is the hub having stopped, which ends the session.
pub async fn dispatch_frame(
    raw: &[u8],
    session: &Session,
    hub: &Hub,
    chat: &dyn ChatService,
) -> Result<(), HubError> {
    let mut event = match WireEvent::decode(raw) {
        Ok(event) => event,
        Err(e) => {
            warn!(user_id = %session.user_id, error = %e, "dropping malformed frame");
            hub.metrics().counter_inc("gateway.frames.malformed", &[], 1);
            return Ok(());
        }
    };

    match event.kind {
        EventKind::JoinConversation => {
            if event.conversation_id.is_empty() {
                warn!(user_id = %session.user_id, "join_conversation without conversation_id");
                return Ok(());
            }
            hub.join_conversation(&event.conversation_id, &session.user_id);
            let ack = WireEvent::join_success(&event.conversation_id, &session.user_id);
            match ack.encode() {
                Ok(payload) => {
                    if let Err(e) = session.try_push(payload) {
                        debug!(user_id = %session.user_id, error = %e, "join_success dropped");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode join_success"),
            }
            Ok(())
        }
        EventKind::NewMessage => {
            event.sender_id = session.user_id.clone();
            match chat
                .send_message(&event.conversation_id, &event.sender_id, &event.message)
                .await
            {
                Ok(sent) => {
                    event.message = sent.body;
                    event.created_at = sent.created_at;
                }
                Err(e) => {
                    warn!(
                        user_id = %session.user_id,
                        conversation_id = %event.conversation_id,
                        error = %e,
                        "failed to persist message, delivering anyway"
                    );
                    event.created_at = now_unix();
                }
            }
            hub.broadcast(event)
        }
        EventKind::NewConversation => {
            event.sender_id = session.user_id.clone();
            hub.broadcast(event)
        }
        other => {
            debug!(user_id = %session.user_id, kind = %other, "ignoring frame");
            Ok(())
        }
    }
}
