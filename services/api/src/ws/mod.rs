//! WebSocket Session Management
//!
//! Both interactive surfaces run over WebSockets. It is structured into submodules:
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `playground`: Drives a two-persona dialogue and relays its events.
//! - `chat`: A single persona answering the user, streamed as it types.

mod chat;
mod playground;
pub mod protocol;

pub use chat::chat_handler;
pub use playground::playground_handler;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, stream::SplitSink};
use serde::Serialize;

/// Serializes `msg` and sends it as one text frame.
pub(crate) async fn send_json<T: Serialize>(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: &T,
) -> Result<()> {
    let serialized = serde_json::to_string(msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
