pub mod events;
pub mod ids;
pub mod session;
pub mod time;

pub use events::{HookEvent, HookEventType};
pub use ids::SessionId;
