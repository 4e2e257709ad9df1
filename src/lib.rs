pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod reconcile;
pub mod remote;
pub mod sensor;
pub mod session;
pub mod state;
pub mod tracking;
