use std::net::SocketAddr;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use castgrid_server::{api, bus, generate_node_id, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "castgrid_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let node_id = generate_node_id();
    tracing::info!(node = %node_id, "starting castgrid node");

    let (state, bus_rx) = AppState::new(config.clone(), node_id)?;

    if config.standalone {
        tracing::info!("stand-alone mode: inter-node bus disabled");
        drop(bus_rx);
    } else {
        bus::spawn(state.registry.clone(), bus_rx, &config.redis_url)?;
    }

    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("listening on {}", config.bind_address);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
