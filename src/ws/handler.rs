//! WebSocket upgrade handlers and the per-connection session

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::competition::PlayerId;
use crate::game::{Direction, RoomId};
use crate::matchmaking::{Intent, RouteError};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::connection::{ConnectionHandle, Outbound, CLOSE_NOT_ACCEPTING, OUTBOUND_CAPACITY};
use crate::ws::protocol::{ClientMsg, ProtocolError, ServerMsg};

#[derive(Debug, Default, Deserialize)]
pub struct JoinQuery {
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ObserveQuery {
    pub room_id: Option<RoomId>,
}

/// Generic endpoint: the client says what it wants with its first message
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, None))
}

/// Player endpoint: registers as soon as the socket opens
pub async fn join_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<JoinQuery>,
    State(state): State<AppState>,
) -> Response {
    let opening = ClientMsg::Join { name: query.name };
    ws.on_upgrade(move |socket| handle_socket(socket, state, Some(opening)))
}

/// Observer endpoint: attaches to a room as soon as the socket opens
pub async fn observe_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ObserveQuery>,
    State(state): State<AppState>,
) -> Response {
    let opening = ClientMsg::Observe {
        room_id: query.room_id,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, Some(opening)))
}

async fn handle_socket(socket: WebSocket, state: AppState, opening: Option<ClientMsg>) {
    let (conn, mut outbound) = ConnectionHandle::new(OUTBOUND_CAPACITY);
    let conn_id = conn.id();
    state.connections.insert(conn.clone());
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (mut sink, mut stream) = socket.split();
    let limiter = ConnectionRateLimiter::new();
    let mut session = Session::new(conn.clone(), state.clone());

    if let Some(msg) = opening {
        session.dispatch(msg).await;
    }

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Msg(msg)) => {
                    if let Err(e) = send_msg(&mut sink, &msg).await {
                        debug!(conn_id = %conn_id, error = %e, "WebSocket send failed");
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    info!(conn_id = %conn_id, code, reason = %reason, "Closing connection");
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if !limiter.check_input() {
                        warn!(conn_id = %conn_id, "Rate limited input message");
                        continue;
                    }
                    match ClientMsg::parse(&text) {
                        Ok(msg) => session.dispatch(msg).await,
                        Err(e) => {
                            warn!(conn_id = %conn_id, error = %e, "Failed to parse client message");
                            conn.send(ServerMsg::error(e.to_string()));
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(conn_id = %conn_id, "Client closed connection");
                    break;
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(conn_id = %conn_id, "Received binary message, ignoring");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    session.close().await;
    state.connections.remove(conn_id);
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// What one connection is doing: playing, watching, or neither yet
struct Session {
    conn: ConnectionHandle,
    state: AppState,
    player: Option<PlayerId>,
    observing: bool,
}

impl Session {
    fn new(conn: ConnectionHandle, state: AppState) -> Self {
        Self {
            conn,
            state,
            player: None,
            observing: false,
        }
    }

    async fn dispatch(&mut self, msg: ClientMsg) {
        let result = match msg {
            ClientMsg::Join { name } => self.join(name).await,
            ClientMsg::Ready { mode, name } => self.ready(mode, name).await,
            ClientMsg::Move { direction } => self.steer(direction).await,
            ClientMsg::Observe { room_id } => self.observe(Intent::Observe(room_id)).await,
            ClientMsg::SwitchRoom { room_id } => self.observe(Intent::SwitchRoom(room_id)).await,
            ClientMsg::GetRooms => {
                self.send_room_list().await;
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(conn_id = %self.conn.id(), error = %e, "Client request rejected");
            self.conn.send(ServerMsg::error(e.to_string()));
        }
    }

    async fn join(&mut self, name: Option<String>) -> Result<(), SessionError> {
        if self.player.is_some() {
            return Err(ProtocolError::OutOfSequence("Already joined").into());
        }
        if self.observing {
            return Err(ProtocolError::OutOfSequence("Observers cannot join the competition").into());
        }

        match self.state.competition.register(name, self.conn.clone()).await {
            Ok(player) => {
                self.player = Some(player);
            }
            Err(e) => {
                info!(conn_id = %self.conn.id(), reason = %e, "Registration refused");
                self.conn.send(ServerMsg::error(e.to_string()));
                self.conn.close(CLOSE_NOT_ACCEPTING, e.to_string());
            }
        }
        Ok(())
    }

    async fn ready(&mut self, mode: Option<String>, name: Option<String>) -> Result<(), SessionError> {
        if let Some(mode) = mode.as_deref().filter(|m| *m != "two_player") {
            debug!(conn_id = %self.conn.id(), mode, "Unsupported mode requested, playing two_player");
        }
        if self.player.is_none() {
            self.join(name.clone()).await?;
        }
        let Some(player) = self.player else {
            return Ok(());
        };

        let competition = self.state.competition.clone();
        competition.ready(player, name, &self.conn).await;
        Ok(())
    }

    async fn steer(&mut self, direction: Direction) -> Result<(), SessionError> {
        let player = self
            .player
            .ok_or(ProtocolError::OutOfSequence("Join before moving"))?;

        match self
            .state
            .rooms
            .route(&self.conn, Intent::Move(player, direction))
            .await
        {
            Ok(_) | Err(RouteError::NotSeated) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn observe(&mut self, intent: Intent) -> Result<(), SessionError> {
        if self.player.is_some() {
            return Err(ProtocolError::OutOfSequence("Players cannot observe").into());
        }
        self.observing = true;

        match self.state.rooms.route(&self.conn, intent).await {
            Ok(_) | Err(RouteError::NoActiveRoom) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn send_room_list(&self) {
        let rooms = &self.state.rooms;
        let current_room = rooms.observed_room(self.conn.id()).await;
        self.conn.send(ServerMsg::RoomList {
            rooms: rooms.summaries().await,
            current_room,
        });
    }

    async fn close(self) {
        if let Some(player) = self.player {
            self.state.competition.disconnect(player, self.conn.id()).await;
        }
        if self.observing {
            self.state.rooms.remove_observer(self.conn.id()).await;
        }
    }
}

async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json)).await.map_err(|e| e.to_string())
}
