pub mod agent_client;
pub mod build_info;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod executor;
pub mod logging;
pub mod progress;
pub mod repair_service;
pub mod segmenter;
pub mod server;
pub mod state;
pub mod store;
pub mod topology;
