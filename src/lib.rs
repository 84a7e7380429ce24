// Public API for integration tests and potential library usage

pub mod api;
pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod protocol;
pub mod retry;
pub mod state;
pub mod stream;
pub mod types;
pub mod ws;
