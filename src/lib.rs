pub mod config;
pub mod error;
pub mod model_download;
pub mod pipeline;
pub mod server;
pub mod types;
