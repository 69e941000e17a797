pub mod auth;
pub mod compactor;
pub mod config;
pub mod dates;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod wal;
pub mod wire;
