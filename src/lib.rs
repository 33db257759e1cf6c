//! InsightVault upload protocol: a client that sends conversation exports
//! in one request or in fixed-size chunks, and the service that receives,
//! assembles and stores them.

pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod limits;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::storage_service::FileStorage;

/// The full service router with its state attached.
pub fn app(storage: FileStorage, api_token: Option<String>) -> Router {
    routes::routes::routes(api_token).with_state(storage)
}
