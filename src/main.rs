use std::sync::Arc;

use anyhow::Context;
use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use plan_settlement::{
    app,
    config::Config,
    db::{
        billing_repository::BillingRepository,
        plan_history_repository::PlanHistoryRepository,
        postgres_billing_repository::PostgresBillingRepository,
        postgres_plan_history_repository::PostgresPlanHistoryRepository,
        postgres_plan_repository::PostgresPlanRepository,
        postgres_user_repository::PostgresUserRepository, user_repository::UserRepository,
    },
    services::{billing::BillingEngine, gateway::LiveStripeGateway},
    utils::jwt::JwtKeys,
    AppState,
};

fn init_tracing() -> Option<sentry::ClientInitGuard> {
    let guard = std::env::var("SENTRY_DSN")
        .ok()
        .filter(|dsn| !dsn.trim().is_empty())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(guard.as_ref().map(|_| sentry_tracing::layer()))
        .init();

    guard
}

/// Establish a connection to the database and verify it.
async fn establish_connection(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to the database")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("failed to verify database connection")?;

    info!("connected to the database");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _sentry = init_tracing();

    let config = Arc::new(Config::from_env().context("invalid configuration")?);
    let pg_pool = establish_connection(&config.database_url).await?;

    let user_repo = Arc::new(PostgresUserRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn UserRepository>;
    let billing_repo = Arc::new(PostgresBillingRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn BillingRepository>;
    let history_repo = Arc::new(PostgresPlanHistoryRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn PlanHistoryRepository>;
    let plan_repo = Arc::new(PostgresPlanRepository { pool: pg_pool });

    let gateway = Arc::new(LiveStripeGateway::from_settings(&config.stripe));
    let billing = BillingEngine::new(
        user_repo.clone(),
        plan_repo,
        billing_repo.clone(),
        history_repo.clone(),
        gateway,
        config.billing.currency.clone(),
    );

    let jwt_keys = Arc::new(JwtKeys::from_secret(&config.jwt_secret).context("invalid JWT_SECRET")?);

    let state = AppState {
        db: user_repo,
        billing_repo,
        history_repo,
        billing,
        config: config.clone(),
        jwt_keys,
    };

    let origin = config
        .frontend_origin
        .parse::<HeaderValue>()
        .context("FRONTEND_ORIGIN is not a valid header value")?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true);

    let router = app(state).layer(cors);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "plan settlement listening");
    axum::serve(listener, router).await?;
    Ok(())
}
