pub mod config;
pub mod error;
pub mod events;
pub mod store;
pub mod types;

pub use config::QuireConfig;
pub use error::{QuireError, Result};
pub use events::{EngineEvent, EventBus};
pub use store::ConversationStore;
pub use types::*;
