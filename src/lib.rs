pub mod api;
pub mod auth;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod limits;
pub mod model;
pub mod observability;
pub mod propagation;
pub mod protocol;
pub mod rooms;
pub mod server;
pub mod store;
pub mod tls;
