//! WebSocket session driving a two-persona playground dialogue.
//!
//! The scheduler runs in its own task while the connection loop keeps
//! forwarding events and listening for `stop`/`reset`. When the run ends the
//! task hands the scheduler back so the next command can use it.

use super::{
    protocol::{PlaygroundCommand, PlaygroundServerMessage},
    send_json,
};
use crate::state::AppState;
use anyhow::Result;
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
    DialogueConfig, DialogueScheduler, EventPublisher, SessionEvent, StopHandle,
    export::{ExportHeader, export_transcript},
};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::{JoinError, JoinHandle},
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const EVENT_BUFFER: usize = 256;

/// Axum handler to upgrade an HTTP connection to a playground WebSocket.
pub async fn playground_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

#[instrument(name = "playground_session", skip_all, fields(connection_id = %Uuid::new_v4()))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New playground connection.");
    let (socket_tx, socket_rx) = socket.split();
    let socket_tx = Arc::new(Mutex::new(socket_tx));
    let (events, event_rx) = EventPublisher::channel(EVENT_BUFFER);
    let scheduler = DialogueScheduler::new(state.generator.clone(), state.playground, events.clone());

    let mut session = PlaygroundSession {
        socket_tx,
        slot: Slot::Idle(Box::new(scheduler)),
        state,
        events,
    };
    if let Err(e) = session.run(socket_rx, event_rx).await {
        error!(error = ?e, "Playground session terminated with error.");
    }
    session.shutdown();
    info!("Playground session finished.");
}

/// A scheduler run in progress.
struct RunningDialogue {
    task: JoinHandle<Box<DialogueScheduler>>,
    stop: StopHandle,
    reset_when_done: bool,
}

enum Slot {
    Idle(Box<DialogueScheduler>),
    Running(RunningDialogue),
    /// Transient, while the scheduler moves into its task.
    Empty,
}

struct PlaygroundSession {
    socket_tx: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    slot: Slot,
    state: Arc<AppState>,
    /// Kept so a replacement scheduler reports to the same connection.
    events: EventPublisher,
}

/// Resolves when the running dialogue hands its scheduler back.
async fn finished(slot: &mut Slot) -> Result<Box<DialogueScheduler>, JoinError> {
    match slot {
        Slot::Running(running) => (&mut running.task).await,
        _ => std::future::pending().await,
    }
}

impl PlaygroundSession {
    async fn send(&self, msg: PlaygroundServerMessage) -> Result<()> {
        send_json(&mut *self.socket_tx.lock().await, &msg).await
    }

    async fn reject(&self, message: impl Into<String>) -> Result<()> {
        self.send(PlaygroundServerMessage::Rejected {
            message: message.into(),
        })
        .await
    }

    async fn run(
        &mut self,
        mut socket_rx: SplitStream<WebSocket>,
        mut event_rx: mpsc::Receiver<SessionEvent>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                Some(event) = event_rx.recv() => {
                    self.send(PlaygroundServerMessage::Event { event }).await?;
                },
                joined = finished(&mut self.slot) => {
                    self.on_run_finished(joined).await?;
                },
                msg_result = socket_rx.next() => {
                    match msg_result {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<PlaygroundCommand>(&text) {
                                Ok(command) => self.handle_command(command).await?,
                                Err(e) => {
                                    warn!("Ignoring malformed playground command: {}", e);
                                    self.reject(format!("Malformed command: {e}")).await?;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Client closed the playground connection.");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Error receiving from client WebSocket: {:?}", e);
                            break;
                        }
                    }
                },
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: PlaygroundCommand) -> Result<()> {
        if let Slot::Running(running) = &mut self.slot {
            return match command {
                PlaygroundCommand::Stop => {
                    running.stop.stop();
                    Ok(())
                }
                PlaygroundCommand::Reset => {
                    running.stop.stop();
                    running.reset_when_done = true;
                    Ok(())
                }
                _ => self.reject("An interaction is already running.").await,
            };
        }
        let Slot::Idle(scheduler) = &mut self.slot else {
            return self.reject("The playground is not ready.").await;
        };

        match command {
            PlaygroundCommand::Start(request) => {
                let config = DialogueConfig::from(request);
                match scheduler.start(config).await {
                    Ok(handle) => self.launch(handle).await?,
                    Err(e) => self.reject(e.to_string()).await?,
                }
            }
            PlaygroundCommand::Continue { max_turns } => match scheduler.resume(max_turns).await {
                Ok(handle) => self.launch(handle).await?,
                Err(e) => self.reject(e.to_string()).await?,
            },
            PlaygroundCommand::Stop => scheduler.stop().await,
            PlaygroundCommand::Reset => scheduler.reset().await,
            PlaygroundCommand::Export => {
                let export = scheduler.session().and_then(|session| {
                    let transcript = session.transcript();
                    if transcript.settled().next().is_none() {
                        return None;
                    }
                    let header = ExportHeader::for_dialogue(session.config());
                    let now = Local::now();
                    Some((
                        header.filename(now.date_naive()),
                        export_transcript(&header, transcript, &now),
                    ))
                });
                match export {
                    Some((filename, content)) => {
                        self.send(PlaygroundServerMessage::Exported { filename, content })
                            .await?
                    }
                    None => self.reject("No conversation to export.").await?,
                }
            }
        }
        Ok(())
    }

    /// Moves the idle scheduler into a task that runs the dialogue.
    async fn launch(&mut self, stop: StopHandle) -> Result<()> {
        let mut scheduler = match std::mem::replace(&mut self.slot, Slot::Empty) {
            Slot::Idle(scheduler) => scheduler,
            other => {
                self.slot = other;
                return Ok(());
            }
        };
        let turn_count = scheduler.turn_count();
        let task = tokio::spawn(async move {
            scheduler.run().await;
            scheduler
        });
        self.slot = Slot::Running(RunningDialogue {
            task,
            stop,
            reset_when_done: false,
        });
        self.send(PlaygroundServerMessage::Started { turn_count }).await
    }

    async fn on_run_finished(
        &mut self,
        joined: Result<Box<DialogueScheduler>, JoinError>,
    ) -> Result<()> {
        let reset = matches!(&self.slot, Slot::Running(r) if r.reset_when_done);
        match joined {
            Ok(mut scheduler) => {
                if reset {
                    scheduler.reset().await;
                }
                info!(state = ?scheduler.state(), turn_count = scheduler.turn_count(), "Dialogue run ended.");
                self.slot = Slot::Idle(scheduler);
                Ok(())
            }
            Err(e) => {
                error!(error = ?e, "Dialogue task failed.");
                self.slot = Slot::Idle(Box::new(self.fresh_scheduler()));
                self.send(PlaygroundServerMessage::Error {
                    message: "The interaction ended unexpectedly and was reset.".to_string(),
                })
                .await
            }
        }
    }

    fn fresh_scheduler(&self) -> DialogueScheduler {
        DialogueScheduler::new(
            self.state.generator.clone(),
            self.state.playground,
            self.events.clone(),
        )
    }

    fn shutdown(&mut self) {
        if let Slot::Running(running) = &self.slot {
            running.stop.stop();
            running.task.abort();
        }
    }
}
