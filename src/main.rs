mod auth;
mod bookings;
mod config;
mod db;
mod error;
mod generator;
mod ledger;
mod models;
mod payments;
mod reservations;
mod retry;
mod routes;
mod schedule;
mod state;
mod sweeper;

use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use tokio::sync::broadcast;

use crate::{
    config::AppConfig, payments::SimulatedGateway, retry::RetryPolicy, state::AppState,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    if let Err(err) = run().await {
        eprintln!("Startup error: {err}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env();
    db::ensure_sqlite_dir(&config.database_url)?;

    let pool = db::connect(&config.database_url, config.max_connections).await?;
    db::run_migrations(&pool).await?;
    db::seed_defaults(&pool).await?;

    let (events, _) = broadcast::channel(128);
    let state = AppState {
        db: pool,
        authorizer: Arc::new(SimulatedGateway::new(config.payment_success_rate)),
        retry: RetryPolicy::store(config.store_retry_attempts),
        events,
        config: config.clone(),
    };

    let _sweeper = sweeper::spawn(state.clone(), config.sweep_interval_secs);

    let address = format!("0.0.0.0:{}", config.port);
    log::info!(
        "Starting academy booking on http://{address} (hold {} min, horizon {} days)",
        config.engine.reservation_ttl_minutes,
        config.engine.horizon_days
    );

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(middleware::Logger::default())
            .configure(routes::public::configure)
            .configure(routes::admin::configure)
            .configure(routes::api::configure)
    })
    .bind(address)?
    .run()
    .await?;

    Ok(())
}
