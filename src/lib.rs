pub mod auth;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod retry;
pub mod scheduler;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
