pub mod auth;
pub mod clock;
pub mod config_parser;
pub mod endpoints;
pub mod error;
pub mod gateway_util;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod rate_limit;
pub mod session_memory;
pub mod storage;
mod testing;
pub mod usage_limit;
