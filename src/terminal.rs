//! Interactive terminal sessions over `/ws`.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::pipeline::RunRequest;
use crate::protocol::{ClientMessage, RunPayload, ServerMessage, TerminalRenderer};
use crate::session::Session;
use crate::state::AppState;

const REPLY_QUEUE_CAPACITY: usize = 32;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let max = state.engine.config().max_message_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let sid = uuid::Uuid::new_v4().to_string();
    let session = state.registry.open(&sid).await;
    let mut shutdown = state.shutdown.subscribe();
    let (ws_tx, mut ws_rx) = socket.split();

    let config = state.engine.config();
    let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
    let (replies_tx, replies_rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);
    let renderer = TerminalRenderer {
        crlf: config.terminal_newlines,
    };
    let writer = tokio::spawn(write_frames(ws_tx, events_rx, replies_rx, renderer));

    let connected = ServerMessage::Connected { sid: sid.clone() };
    let _ = replies_tx.send(Message::Text(connected.to_json())).await;
    info!(session = %sid, "Terminal connected");

    let conn = Connection {
        state: &state,
        session: &session,
        events: events_tx,
        replies: replies_tx,
    };
    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => conn.handle_text(&text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(session = %sid, error = %e, "WebSocket read failed");
                    break;
                }
                Some(Ok(_)) => continue,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: "server shutting down".into(),
                    };
                    let _ = conn.replies.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    }

    state.registry.close(&sid).await;
    drop(conn);
    // Ends once the last run task has emitted its final event.
    let _ = writer.await;
    info!(session = %sid, "Terminal disconnected");
}

struct Connection<'a> {
    state: &'a AppState,
    session: &'a Arc<Session>,
    events: mpsc::Sender<SessionEvent>,
    replies: mpsc::Sender<Message>,
}

impl Connection<'_> {
    async fn reply(&self, message: ServerMessage) {
        let _ = self.replies.send(Message::Text(message.to_json())).await;
    }

    async fn handle_text(&self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(session = %self.session.id(), error = %e, "Rejected frame");
                self.reply(ServerMessage::error(e)).await;
                return;
            }
        };
        match message {
            ClientMessage::Run(payload) => self.run(payload).await,
            ClientMessage::Input(input) => {
                if let Err(e) = self.session.write_stdin(Bytes::from(input.data)) {
                    self.reply(ServerMessage::error(e.to_string())).await;
                }
            }
            ClientMessage::Kill => {
                if let Err(e) = self.session.kill() {
                    self.reply(ServerMessage::error(e.to_string())).await;
                }
            }
            ClientMessage::Resize => {}
            ClientMessage::Ping => self.reply(ServerMessage::Pong).await,
        }
    }

    async fn run(&self, payload: RunPayload) {
        let engine = &self.state.engine;
        if self.session.state().is_busy() && engine.config().replace_active_run {
            debug!(session = %self.session.id(), "Replacing active run");
            let _ = self.session.kill();
            self.session.settled().await;
        }
        let request = RunRequest {
            source: payload.code,
            stdin: payload.stdin,
            close_stdin: false,
        };
        match engine.start_run(self.session, request, self.events.clone()) {
            Ok(run_id) => debug!(session = %self.session.id(), run_id, "Run started"),
            Err(SessionError::Closed) => debug!(session = %self.session.id(), "Run refused on closed session"),
            Err(e) => self.reply(ServerMessage::error(e.to_string())).await,
        }
    }
}

/// Sole owner of the socket's sending half. Keeps draining both queues
/// until every producer is gone; stops early only if the socket fails.
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut events: mpsc::Receiver<SessionEvent>,
    mut replies: mpsc::Receiver<Message>,
    renderer: TerminalRenderer,
) {
    let mut replies_open = true;
    loop {
        let message = tokio::select! {
            biased;
            reply = replies.recv(), if replies_open => match reply {
                Some(message) => message,
                None => {
                    replies_open = false;
                    continue;
                }
            },
            event = events.recv() => match event {
                Some(event) => Message::Text(renderer.render(event).to_json()),
                None => break,
            },
        };
        let closing = matches!(message, Message::Close(_));
        if ws_tx.send(message).await.is_err() || closing {
            return;
        }
    }
    let _ = ws_tx.close().await;
}
