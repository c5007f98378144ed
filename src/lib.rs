// src/lib.rs

use sea_orm::DatabaseConnection;
use scrapers::monitor::MonitorFleet;
use services::notifier::Notifier;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub fleet: MonitorFleet,
    pub notifier: Notifier,
}

pub mod entities {
    pub mod prelude;
    pub mod agents;
    pub mod auth_tokens;
    pub mod sessions;
    pub mod transactions;
}

pub mod services {
    pub mod auth_token_cache;
    pub mod notifier;
    pub mod reconciliation;
    pub mod session_store;
    pub mod transcript;
}

pub mod models {
    pub mod transaction;
}

pub mod handlers {
    pub mod status;
}

pub mod config;
pub mod error;
pub mod jobs;
pub mod scrapers;
