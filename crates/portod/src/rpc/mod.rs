//! Client connections, wire framing and request dispatch.

pub mod client;
pub mod dispatch;
pub mod wire;

pub use client::{AccessLevel, ClientConn, Identity};
pub use dispatch::Dispatcher;
pub use wire::{Request, Response};
