//! HTTP route definitions

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::competition::{ChampionRecord, CompetitionState, CompetitionStatus};
use crate::game::{RoomId, RoomSummary};
use crate::util::time::uptime_secs;
use crate::ws::handler::{join_handler, observe_handler, ws_handler};

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CLIENT_ORIGIN may list several origins, comma-separated
    let origins: Vec<HeaderValue> = state
        .config
        .client_origin
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let ws_routes = Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/", get(ws_handler))
        .route("/ws/join", get(join_handler))
        .route("/ws/observe", get(observe_handler));

    let query_routes = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/competition", get(competition_handler))
        .route("/history", get(history_handler))
        .route("/add_bot", post(add_bot_handler))
        .route("/rooms", get(rooms_handler))
        .route("/rooms/active", get(active_rooms_handler))
        .route("/rooms/:room_id", get(room_handler));

    Router::new()
        .merge(ws_routes)
        .merge(query_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Server endpoints
// ============================================================================

#[derive(Serialize)]
struct IndexResponse {
    name: &'static str,
    version: &'static str,
    websocket: &'static str,
    join: &'static str,
    observe: &'static str,
}

async fn index_handler() -> Json<IndexResponse> {
    Json(IndexResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        websocket: "/ws",
        join: "/ws/join",
        observe: "/ws/observe",
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    connections: usize,
    active_rooms: usize,
    seated_players: usize,
    observers: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let active_rooms = state.rooms.active_rooms().await.len();
    let observers = state.rooms.observer_count().await;

    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        connections: state.connections.len(),
        active_rooms,
        seated_players: state.rooms.seated_players(),
        observers,
    })
}

#[derive(Serialize)]
struct StatusResponse {
    state: CompetitionState,
    round: u32,
    total_rounds: u32,
    players: usize,
    required: usize,
    champion: Option<String>,
    active_rooms: usize,
    arenas: u32,
    points_to_win: u32,
    grid_size: String,
    speed: f64,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let status = state.competition.status().await;
    let settings = state.competition.settings();

    Json(StatusResponse {
        state: status.state,
        round: status.round,
        total_rounds: status.total_rounds,
        players: status.players,
        required: status.required,
        champion: status.champion,
        active_rooms: status.rooms.len(),
        arenas: settings.arenas,
        points_to_win: settings.points_to_win,
        grid_size: settings.grid_size.to_string(),
        speed: settings.speed,
    })
}

// ============================================================================
// Competition endpoints
// ============================================================================

async fn competition_handler(State(state): State<AppState>) -> Json<CompetitionStatus> {
    Json(state.competition.status().await)
}

#[derive(Serialize)]
struct HistoryResponse {
    champions: Vec<ChampionRecord>,
}

async fn history_handler(State(state): State<AppState>) -> Json<HistoryResponse> {
    Json(HistoryResponse {
        champions: state.competition.history(),
    })
}

#[derive(Deserialize)]
struct AddBotQuery {
    /// Kept as text so a malformed value falls back to a random level
    difficulty: Option<String>,
}

#[derive(Serialize)]
struct AddBotResponse {
    success: bool,
    message: String,
}

async fn add_bot_handler(
    State(state): State<AppState>,
    Query(query): Query<AddBotQuery>,
) -> Json<AddBotResponse> {
    let requested = query.difficulty.and_then(|d| d.trim().parse::<u32>().ok());
    let response = match state.competition.add_bot(requested).await {
        Ok(difficulty) => AddBotResponse {
            success: true,
            message: format!("CopperBot L{difficulty} added to the competition"),
        },
        Err(e) => AddBotResponse {
            success: false,
            message: e.to_string(),
        },
    };
    Json(response)
}

// ============================================================================
// Room endpoints
// ============================================================================

#[derive(Serialize)]
struct RoomsResponse {
    rooms: Vec<RoomSummary>,
}

async fn rooms_handler(State(state): State<AppState>) -> Json<RoomsResponse> {
    Json(RoomsResponse {
        rooms: state.rooms.summaries().await,
    })
}

async fn active_rooms_handler(State(state): State<AppState>) -> Json<RoomsResponse> {
    Json(RoomsResponse {
        rooms: state.rooms.active_rooms().await,
    })
}

async fn room_handler(
    State(state): State<AppState>,
    Path(room_id): Path<u64>,
) -> Result<Json<RoomSummary>, AppError> {
    state
        .rooms
        .room(RoomId(room_id))
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Room {} not found", room_id)))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::bots::BotLauncher;
    use crate::config::{Config, GameSettings};
    use crate::ws::connection::ConnectionHandle;

    fn test_config() -> Config {
        Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "info".to_string(),
            settings_path: None,
            bot_command: None,
            public_ws_url: "ws://localhost:8765/ws/".to_string(),
            client_origin: None,
        }
    }

    fn test_state() -> AppState {
        let (state, _events) = AppState::new(test_config(), GameSettings::default());
        state
    }

    struct FixedBots;

    impl BotLauncher for FixedBots {
        fn launch_one(&self, difficulty: Option<u32>) -> Option<u32> {
            Some(difficulty.unwrap_or(4))
        }

        fn terminate_all(&self) {}
    }

    async fn post_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_competition() {
        let router = build_router(test_state());

        let (status, health) = get_json(router.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "ok");
        assert_eq!(health["active_rooms"], 0);

        let (status, competition) = get_json(router, "/competition").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(competition["state"], "waiting_for_players");
        assert_eq!(competition["required"], 2);
    }

    #[tokio::test]
    async fn test_unknown_room_is_404() {
        let router = build_router(test_state());
        let (status, body) = get_json(router, "/rooms/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Room 999 not found");
    }

    #[tokio::test]
    async fn test_add_bot_reports_launch() {
        let bots: Arc<dyn BotLauncher> = Arc::new(FixedBots);
        let (state, _events) = AppState::with_bots(test_config(), GameSettings::default(), bots);
        let router = build_router(state);

        let (status, body) = post_json(router.clone(), "/add_bot?difficulty=9").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "CopperBot L9 added to the competition");

        // junk difficulty falls back to the launcher's pick
        let (_, body) = post_json(router, "/add_bot?difficulty=hard").await;
        assert_eq!(body["message"], "CopperBot L4 added to the competition");
    }

    #[tokio::test]
    async fn test_add_bot_refused_when_no_slots() {
        let bots: Arc<dyn BotLauncher> = Arc::new(FixedBots);
        let (state, _events) = AppState::with_bots(test_config(), GameSettings::default(), bots);
        let competition = state.competition.clone();
        let router = build_router(state);

        for name in ["Ada", "Bo"] {
            let (conn, _rx) = ConnectionHandle::new(16);
            competition.register(Some(name.to_string()), conn).await.unwrap();
        }

        let (status, body) = post_json(router, "/add_bot").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(
            body["message"],
            "Competition not accepting players (in progress)"
        );
    }

    #[tokio::test]
    async fn test_add_bot_without_bot_command() {
        let (_, body) = post_json(build_router(test_state()), "/add_bot").await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Bot could not be launched");
    }
}
