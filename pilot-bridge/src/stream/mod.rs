//! Backend event handling: routing, streaming, typing and per-channel hooks.

pub mod coordinator;
pub mod events;
pub mod hooks;
pub mod idle;
pub mod router;
pub mod telegram;
pub mod tool_updates;
pub mod typing;
