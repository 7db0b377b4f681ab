//! Chat-channel connectors.
//!
//! Currently Discord only: a Gateway WebSocket client for receiving
//! direct messages and a thin REST layer for replies, typing indicators,
//! and DM channel creation.

pub mod discord;

pub use discord::{DirectMessage, DiscordChannel, DiscordRest};
