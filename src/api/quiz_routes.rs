use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use warp::http::StatusCode;
use warp::Filter;

use crate::config::Config;
use crate::error::QuizError;
use crate::live::room::Question;
use crate::live::RoomRegistry;

use super::quiz_websocket;

/// WebSocket endpoint carrying the live session protocol
pub fn quiz_websocket_route(
    registry: Arc<RoomRegistry>,
    config: Arc<Config>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("live")
        .and(warp::ws())
        .and(with_registry(registry))
        .and(with_config(config))
        .map(|ws: warp::ws::Ws, registry: Arc<RoomRegistry>, config: Arc<Config>| {
            ws.on_upgrade(move |websocket| {
                quiz_websocket::handle_connection(websocket, registry, config)
            })
        })
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default)]
    pub time_limit_seconds: Option<u32>,
    pub questions: Vec<Question>,
}

/// Presenter submits a question set and gets back the join code
pub fn create_room_route(
    registry: Arc<RoomRegistry>,
    config: Arc<Config>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "rooms")
        .and(warp::post())
        .and(warp::header::optional::<String>("x-presenter-key"))
        .and(warp::body::json())
        .and(with_registry(registry))
        .and(with_config(config))
        .and_then(handle_create_room)
}

async fn handle_create_room(
    presenter_key: Option<String>,
    request: CreateRoomRequest,
    registry: Arc<RoomRegistry>,
    config: Arc<Config>,
) -> Result<impl warp::Reply, Infallible> {
    if presenter_key.as_deref() != Some(config.session.presenter_key.as_str()) {
        return Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({
                "code": "forbidden",
                "message": "missing or invalid presenter key"
            })),
            StatusCode::UNAUTHORIZED,
        ));
    }

    match registry
        .create_room(request.name, request.time_limit_seconds, request.questions)
        .await
    {
        Ok(handle) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({
                "room_code": handle.code,
            })),
            StatusCode::CREATED,
        )),
        Err(e) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({
                "code": e.code(),
                "message": e.to_string(),
            })),
            StatusCode::BAD_REQUEST,
        )),
    }
}

/// Room summary for presenter dashboards and status pages
pub fn room_summary_route(
    registry: Arc<RoomRegistry>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("api" / "rooms" / String)
        .and(warp::get())
        .and(with_registry(registry))
        .and_then(handle_room_summary)
}

async fn handle_room_summary(
    code: String,
    registry: Arc<RoomRegistry>,
) -> Result<impl warp::Reply, Infallible> {
    let summary = match registry.lookup_required(&code).await {
        Ok(handle) => handle.summary().await,
        Err(_) => None,
    };

    match summary {
        Some(summary) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({
                "status": summary.status,
                "participant_count": summary.participant_count,
            })),
            StatusCode::OK,
        )),
        None => {
            let err = QuizError::RoomNotFound(code);
            Ok(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({
                    "code": err.code(),
                    "message": err.to_string(),
                })),
                StatusCode::NOT_FOUND,
            ))
        }
    }
}

pub fn health_check() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::get())
        .map(|| {
            warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "Quiz Server",
                "version": "1.0.0"
            }))
        })
}

fn with_registry(
    registry: Arc<RoomRegistry>,
) -> impl Filter<Extract = (Arc<RoomRegistry>,), Error = Infallible> + Clone {
    warp::any().map(move || registry.clone())
}

fn with_config(
    config: Arc<Config>,
) -> impl Filter<Extract = (Arc<Config>,), Error = Infallible> + Clone {
    warp::any().map(move || config.clone())
}
