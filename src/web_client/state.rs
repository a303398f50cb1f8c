//! Shared application state.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::dashboard::Controller;
use crate::storage::Storage;

pub struct AppState {
    /// The one mounted dashboard. Cloned out of the lock by handlers.
    pub controller: Controller,
    pub storage: Storage,
    pub avatar_bucket: String,
    /// `"memory"` or `"supabase"`.
    pub backend_kind: &'static str,
    pub ws_connection_count: Arc<AtomicUsize>,
}

pub type SharedState = Arc<Mutex<AppState>>;
