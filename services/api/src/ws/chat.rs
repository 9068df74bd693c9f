//! WebSocket session for chatting with a single persona.

use super::{
    protocol::{ChatClientMessage, ChatServerMessage},
    send_json,
};
use crate::state::AppState;
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chrono::Local;
use futures_util::{
    StreamExt,
    stream::{SplitSink, SplitStream},
};
use personaverse_core::{
    EventPublisher, PersonaChat, SessionEvent,
    export::{ExportHeader, export_transcript},
};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const EVENT_BUFFER: usize = 256;

type SocketTx = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Axum handler to upgrade an HTTP connection to a chat WebSocket.
pub async fn chat_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

#[instrument(name = "chat_session", skip_all, fields(connection_id = %Uuid::new_v4(), persona = tracing::field::Empty))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New chat connection. Awaiting initialization...");
    let (socket_tx, mut socket_rx) = socket.split();
    let socket_tx: SocketTx = Arc::new(Mutex::new(socket_tx));
    let (events, event_rx) = EventPublisher::channel(EVENT_BUFFER);

    // The first message from the client must be an `init` message.
    let chat = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => initialize_chat(&text, &state, events),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };
    let mut chat = match chat {
        Ok(chat) => chat,
        Err(e) => {
            error!("Chat initialization failed: {:?}", e);
            let _ = send_json(
                &mut *socket_tx.lock().await,
                &ChatServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };
    tracing::Span::current().record("persona", chat.persona().name.as_str());

    let initialized = ChatServerMessage::Initialized {
        history: chat.history(),
    };
    if send_json(&mut *socket_tx.lock().await, &initialized).await.is_err() {
        error!("Failed to send Initialized message to client.");
        return;
    }

    if let Err(e) = run_chat_session(&mut chat, &socket_tx, socket_rx, event_rx).await {
        error!(error = ?e, "Chat session terminated with error.");
    }
    info!("Chat session finished.");
}

fn initialize_chat(init_text: &str, state: &AppState, events: EventPublisher) -> Result<PersonaChat> {
    match serde_json::from_str::<ChatClientMessage>(init_text)? {
        ChatClientMessage::Init { persona, history } => Ok(PersonaChat::new(
            persona,
            state.generator.clone(),
            state.chat_rate,
            events,
        )
        .with_history(history)),
        _ => Err(anyhow!("First message must be `init`")),
    }
}

/// What the connection loop should do after a client message.
enum Flow {
    Continue,
    Close,
}

/// One decoded socket frame.
enum Frame {
    Command(ChatClientMessage),
    Ignored,
    Closed,
}

fn read_frame(msg_result: Option<Result<Message, axum::Error>>) -> Frame {
    match msg_result {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ChatClientMessage>(&text) {
            Ok(command) => Frame::Command(command),
            Err(e) => {
                warn!("Ignoring malformed chat message: {}", e);
                Frame::Ignored
            }
        },
        Some(Ok(Message::Close(_))) | None => {
            info!("Client closed the chat connection.");
            Frame::Closed
        }
        Some(Ok(_)) => Frame::Ignored,
        Some(Err(e)) => {
            error!("Error receiving from client WebSocket: {:?}", e);
            Frame::Closed
        }
    }
}

async fn run_chat_session(
    chat: &mut PersonaChat,
    socket_tx: &SocketTx,
    mut socket_rx: SplitStream<WebSocket>,
    mut event_rx: mpsc::Receiver<SessionEvent>,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            Some(event) = event_rx.recv() => {
                send_json(&mut *socket_tx.lock().await, &ChatServerMessage::Event { event }).await?;
            },
            msg_result = socket_rx.next() => {
                match read_frame(msg_result) {
                    Frame::Command(ChatClientMessage::UserMessage { text }) => {
                        let flow = reply(chat, &text, socket_tx, &mut socket_rx, &mut event_rx).await?;
                        if let Flow::Close = flow {
                            break;
                        }
                    }
                    Frame::Command(ChatClientMessage::Init { .. }) => {
                        reject(socket_tx, "The chat is already initialized.").await?;
                    }
                    Frame::Command(ChatClientMessage::Export) => match export(chat) {
                        Some((filename, content)) => {
                            let exported = ChatServerMessage::Exported { filename, content };
                            send_json(&mut *socket_tx.lock().await, &exported).await?;
                        }
                        None => reject(socket_tx, "No conversation to export.").await?,
                    },
                    // Nothing is being typed.
                    Frame::Command(ChatClientMessage::Stop) | Frame::Ignored => {}
                    Frame::Closed => break,
                }
            },
        }
    }
    Ok(())
}

/// The settled chat as a download, or `None` when nothing was said yet.
fn export(chat: &PersonaChat) -> Option<(String, String)> {
    let transcript = chat.transcript();
    transcript.settled().next()?;
    let header = ExportHeader::Chat {
        persona: chat.persona().name.clone(),
    };
    let now = Local::now();
    Some((
        header.filename(now.date_naive()),
        export_transcript(&header, transcript, &now),
    ))
}

async fn reject(socket_tx: &SocketTx, message: &str) -> Result<()> {
    send_json(
        &mut *socket_tx.lock().await,
        &ChatServerMessage::Rejected {
            message: message.to_string(),
        },
    )
    .await
}

/// Streams one reply while still forwarding events and honouring `stop`.
async fn reply(
    chat: &mut PersonaChat,
    text: &str,
    socket_tx: &SocketTx,
    socket_rx: &mut SplitStream<WebSocket>,
    event_rx: &mut mpsc::Receiver<SessionEvent>,
) -> Result<Flow> {
    let cancel = CancellationToken::new();
    let mut flow = Flow::Continue;
    let result = {
        let sending = chat.send(text, &cancel);
        tokio::pin!(sending);
        loop {
            tokio::select! {
                biased;
                Some(event) = event_rx.recv() => {
                    send_json(&mut *socket_tx.lock().await, &ChatServerMessage::Event { event }).await?;
                },
                result = &mut sending => break result,
                msg_result = socket_rx.next(), if !cancel.is_cancelled() => {
                    match read_frame(msg_result) {
                        Frame::Command(ChatClientMessage::Stop) => cancel.cancel(),
                        Frame::Command(_) => {
                            reject(socket_tx, "Wait for the current reply to finish.").await?
                        }
                        Frame::Ignored => {}
                        Frame::Closed => {
                            flow = Flow::Close;
                            cancel.cancel();
                        }
                    }
                },
            }
        }
    };

    // Flush what the reply published before reporting it.
    while let Ok(event) = event_rx.try_recv() {
        send_json(&mut *socket_tx.lock().await, &ChatServerMessage::Event { event }).await?;
    }

    match result {
        Ok(reply) => {
            let complete = ChatServerMessage::ReplyComplete {
                message: reply.message,
                failure: reply.failure,
                cancelled: reply.cancelled,
                history: chat.history(),
            };
            if let Flow::Continue = flow {
                send_json(&mut *socket_tx.lock().await, &complete).await?;
            }
        }
        Err(e) => reject(socket_tx, &e.to_string()).await?,
    }
    Ok(flow)
}
