pub mod collab;
pub mod errors;
pub mod events;
pub mod ids;

pub use collab::{ChatService, SentMessage, TokenValidator};
pub use errors::{AuthError, ChatError, FrameError, HubError};
pub use events::{now_unix, EventKind, WireEvent};
pub use ids::{ConnectionId, ConversationId, UserId};

#[cfg(test)]
mod tests {
    use crate::{now_unix, UserId, WireEvent};

    #[test]
    fn presence_events_are_stamped_with_current_time() {
        let before = now_unix();
        let event = WireEvent::user_online(&UserId::from("alice"));
        assert!(event.created_at >= before);
        assert!(event.created_at <= now_unix());
    }
}
