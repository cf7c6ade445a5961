pub mod config;
pub mod error;
pub mod event;
pub mod types;

pub use config::{AppConfig, EngineConfig, LogConfig};
pub use error::{Result, RunnelError};
pub use event::EventBus;
pub use types::*;
