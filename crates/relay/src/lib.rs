//! Session-relay engine.
//!
//! One headless Chromium process per logged-in user, driven over the Chrome
//! DevTools Protocol. The engine logs into the companion app, keeps the
//! authenticated session alive across page reloads, watches the page's own
//! WebSocket traffic for incoming messages, and drains per-user outbound
//! queues into the page's input controls.

pub mod auth;
pub mod browser;
pub mod cdp;
pub mod media;
pub mod observer;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod relay;

pub use auth::{Authenticator, LoginOutcome};
pub use pool::{BrowserPool, ContextLease};
pub use queue::OutboundQueues;
pub use registry::{AuthArtifacts, SessionRegistry};
pub use relay::{start_session, EndReason, RelayDeps, RelayEvent};
