//! HTTP transport

pub mod handlers;
pub mod health;
pub mod server;

pub use server::{build_router, serve};

use crate::dispatcher::Dispatcher;
use std::sync::Arc;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}
