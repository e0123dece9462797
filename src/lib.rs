pub mod config;
pub mod consumer;
pub mod emitter;
pub mod keymap;
pub mod map_store;
pub mod models;
pub mod resolver;
pub mod sanitize;
pub mod stats;
pub mod telemetry;
pub mod zabbix_db;
