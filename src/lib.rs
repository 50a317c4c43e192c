pub mod config;
pub mod consumer;
pub mod core;
pub mod error;
pub mod http_server;
pub mod monitoring;
pub mod relay;
pub mod sync;

pub use config::{Config, RunMode};
pub use core::ImageSyncPipeline;
pub use error::{Result, SyncError};
pub use http_server::HttpServer;
