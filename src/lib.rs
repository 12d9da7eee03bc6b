use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use std::convert::Infallible;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming as IncomingBody, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

pub mod campaign;
pub mod config;
pub mod db;
pub mod drain;
pub mod error;
pub mod handlers;
pub mod limiter;
pub mod message;
pub mod queue;
pub mod telegram;

use campaign::{CampaignAggregator, PgCampaignRepo};
use config::Config;
use drain::Drainer;
use handlers::AppState;
use queue::RedisQueue;
use telegram::TelegramClient;

type HttpResult = Result<Response<Full<Bytes>>, Infallible>;

async fn http_handler(req: Request<IncomingBody>, state: Arc<AppState>) -> HttpResult {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/broadcast/process") => {
            handlers::process_broadcast(&req, &state).await
        }
        (&Method::GET, "/broadcast/status") => handlers::broadcast_status(&state).await,
        (&Method::GET, "/health") => handlers::health_check(&state).await,
        _ => {
            let mut not_found = Response::new(Full::new(Bytes::from("Not Found")));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    };
    Ok(response)
}

async fn run_http_server(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| http_handler(req, state.clone()));

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Error serving HTTP connection: {:?}", err);
            }
        });
    }
}

pub async fn run() -> Result<()> {
    let config = Config::from_env()?;

    // Connect to database
    let db_pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    tracing::info!("Connected to database");

    tracing::info!("Applying database migrations...");
    sqlx::migrate!().run(&db_pool).await?;
    tracing::info!("Database migrations applied successfully.");

    // Connect to Redis; mask credentials in the logged URL
    let redis_url_safe = if let Some(at_pos) = config.redis_url.find('@') {
        let protocol_end = config.redis_url.find("://").map(|p| p + 3).unwrap_or(0);
        format!(
            "{}***{}",
            &config.redis_url[..protocol_end],
            &config.redis_url[at_pos..]
        )
    } else {
        config.redis_url.clone()
    };
    tracing::info!("Connecting to Redis at: {}", redis_url_safe);

    let redis_queue = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        RedisQueue::connect(&config.redis_url, config.redis_keys.clone()),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis connection timed out after 10 seconds"))??;
    tracing::info!("Connected to Redis");

    let queue = Arc::new(redis_queue);

    let transport = Arc::new(TelegramClient::new(
        &config.telegram_api_base,
        &config.bot_token,
        config.send_timeout_secs,
    )?);

    let aggregator = CampaignAggregator::new(Arc::new(PgCampaignRepo::new(db_pool.clone())));
    let drainer = Arc::new(Drainer::new(
        queue.clone(),
        transport,
        aggregator,
        config.drain.clone(),
    ));

    let bind_address = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("Broadcast queue server listening on http://{}", bind_address);

    let state = Arc::new(AppState {
        config,
        queue,
        drainer,
        db_pool,
    });

    tokio::select! {
        res = run_http_server(state, listener) => {
            if let Err(e) = res {
                tracing::error!("HTTP server failed: {}", e);
            }
        },
        _ = signal::ctrl_c() => {
            tracing::info!("Shutdown signal received. Shutting down...");
        }
    }

    Ok(())
}
