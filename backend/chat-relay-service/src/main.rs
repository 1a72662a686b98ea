use actix_web::{web, App, HttpServer};
use chat_relay_service::{
    auth::JwtAuthenticator,
    broker::{BrokerAdapter, BrokerConnector, MemoryBroker, RedisStreamsConnector},
    config::{BrokerBackend, Config},
    db,
    error::AppError,
    logging, routes,
    services::{PgMembershipStore, PgMessageStore, RelayService, RelaySettings, RoomMembership},
    state::AppState,
    websocket::ConnectionRegistry,
};
use std::sync::Arc;
use tracing_actix_web::TracingLogger;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Config::from_env()?;

    let pool = db::init_pool(&cfg.database_url, cfg.db_max_connections)
        .await
        .map_err(|e| AppError::StartServer(format!("db: {e}")))?;

    let connector: Arc<dyn BrokerConnector> = match cfg.broker.backend {
        BrokerBackend::Redis => Arc::new(RedisStreamsConnector::new(
            &cfg.broker.redis_url,
            cfg.broker.block,
        )?),
        BrokerBackend::Memory => {
            tracing::warn!("in-memory broker selected, fan-out is limited to this instance");
            Arc::new(MemoryBroker::with_block(cfg.broker.block))
        }
    };

    let broker = BrokerAdapter::connect(
        connector,
        cfg.broker.exchange.clone(),
        cfg.broker.backoff_policy(),
    )
    .await
    .map_err(|e| AppError::StartServer(format!("broker: {e}")))?;

    let relay = RelayService::new(
        ConnectionRegistry::new(),
        RoomMembership::new(),
        Arc::new(PgMessageStore::new(pool.clone())),
        Arc::new(PgMembershipStore::new(pool)),
        Arc::new(broker),
        RelaySettings {
            queue_capacity: cfg.session_queue_capacity,
            persist_timeout: cfg.persist_timeout,
        },
    );

    let consumer = relay
        .start_consumer(&cfg.broker.exchange, &cfg.broker.queue)
        .await
        .map_err(|e| AppError::StartServer(format!("broker consume: {e}")))?;

    let state = AppState {
        relay,
        authenticator: Arc::new(JwtAuthenticator::new(&cfg.jwt_secret)),
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(
        %bind_addr,
        exchange = %cfg.broker.exchange,
        queue = %cfg.broker.queue,
        "starting chat-relay-service"
    );

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind: {e}")))?
    .run();

    tokio::select! {
        res = server => {
            res.map_err(|e| AppError::StartServer(format!("http server: {e}")))?;
            Ok(())
        }
        res = consumer => {
            res.map_err(|e| AppError::StartServer(format!("consumer task join: {e}")))??;
            Err(AppError::Broker("consume loop exited".into()))
        }
    }
}
