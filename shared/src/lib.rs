pub mod admin_service;
pub mod db;
pub mod errors;
pub mod http;
pub mod metrics_defs;
