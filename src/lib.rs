#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod connector;
pub mod constants;
pub mod consumer;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub mod sse;
pub mod storage;
pub mod str_utils;
pub mod types;
pub mod wire;

pub use types::*;

pub use server::{AppState, Args};
