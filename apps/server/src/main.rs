#![warn(clippy::all, clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};

mod error;
mod routes;

use error::AppError;
use logger::init_tracing;
use store::SubscriptionStore;

pub struct AppState {
    pub store: Arc<dyn SubscriptionStore>,
    pub default_grace_hours: i64,
}

#[actix_web::main]
async fn main() -> Result<(), AppError> {
    init_tracing();

    let db_path = std::env::var("WEATHER_DB").unwrap_or_else(|_| "weather.db".to_string());
    let store = store::open(&db_path).await?;

    let bind = std::env::var("WEATHER_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = bind.parse()?;

    run_server(addr, Arc::new(store)).await
}

async fn run_server(addr: SocketAddr, store: Arc<dyn SubscriptionStore>) -> Result<(), AppError> {
    let state = web::Data::new(AppState { store, default_grace_hours: 4 });

    tracing::info!("subscription API listening on {addr}");
    HttpServer::new(move || App::new().app_data(state.clone()).configure(routes::routes))
        .bind(addr)?
        .run()
        .await?;

    Ok(())
}
