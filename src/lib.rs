//! Local bridge between automation clients and office add-ins.
//!
//! Add-ins hold a WebSocket open to the bridge and execute code fragments on
//! request. The bridge tracks which add-in sessions are reachable, routes each
//! client request to the right one, and correlates it with its response under
//! a deadline.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod hub;
pub mod pending;
pub mod protocol;
pub mod server;
pub mod session;

pub use bridge::{Bridge, ExecuteResult, RequestPayload};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use hub::{ConnectionHub, ConnectionId};
pub use pending::{PendingResponse, RequestKind};
pub use session::{AppType, Session};
