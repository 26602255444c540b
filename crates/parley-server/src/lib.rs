pub mod auth;
pub mod gateway;
pub mod hub;
pub mod pump;
pub mod registry;
pub mod server;
pub mod session;

pub use auth::{AuthenticatedUser, JwtValidator};
pub use hub::{Hub, HubEvent, HubLoop};
pub use pump::PumpConfig;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use session::{Outbound, QueueError, Session};
