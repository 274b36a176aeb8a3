pub mod checkin;
pub mod compactor;
pub mod config;
pub mod directory;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod property;
pub mod sql;
pub mod wal;
pub mod wire;
