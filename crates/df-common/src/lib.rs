pub mod config;
pub mod events;

pub use config::EnvConfig;
pub use events::{ConfigChangeEvent, EventBus};
