pub mod config;
pub mod error;
pub mod message;
pub mod paths;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{ChatMessage, MessageContent, MessageMeta, MessageNature, SocketEvent};
pub use paths::Paths;
