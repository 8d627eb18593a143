mod api;
mod config;
mod error;
mod live;

use std::sync::Arc;
use std::time::Duration;

use warp::Filter;

use config::Config;
use live::scoring::ScorePolicy;
use live::RoomRegistry;

#[tokio::main]
async fn main() {
    let config = Arc::new(Config::from_env());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let policy = ScorePolicy::new(config.scoring.base_points, config.scoring.max_speed_bonus);
    let registry = RoomRegistry::new(config.session.default_time_limit_secs, policy);

    spawn_housekeeping(registry.clone(), Duration::from_secs(config.session.room_ttl_secs));

    let routes = api::quiz_routes::quiz_websocket_route(registry.clone(), config.clone())
        .or(api::quiz_routes::create_room_route(registry.clone(), config.clone()))
        .or(api::quiz_routes::room_summary_route(registry.clone()))
        .or(api::quiz_routes::health_check());

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Quiz server listening"
    );
    warp::serve(routes).run(config.bind_address()).await;
}

/// Periodic sweep reclaiming rooms that ended more than the TTL ago
fn spawn_housekeeping(registry: Arc<RoomRegistry>, ttl: Duration) {
    tokio::spawn(async move {
        let period = ttl.min(Duration::from_secs(60)).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let removed = registry.sweep_ended(ttl).await;
            if removed > 0 {
                tracing::info!(removed, "Housekeeping reclaimed ended rooms");
            }
        }
    });
}
