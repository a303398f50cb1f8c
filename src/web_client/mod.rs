//! huddle-web: local server that keeps one chat dashboard mounted against
//! the platform and exposes it as a REST API plus a WebSocket event stream.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod sync;
pub mod utils;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use clap::Parser;

use crate::backend::memory::MemoryBackend;
use crate::backend::supabase::SupabaseBackend;
use crate::backend::{self, Backend};
use crate::dashboard::Controller;
use crate::storage::{db_path, Storage};

use config::{BackendChoice, Cli, Config, WS_CHANNEL_CAPACITY};
use state::{AppState, SharedState};

pub fn build_backend(choice: &BackendChoice) -> Arc<dyn Backend> {
    match choice {
        BackendChoice::Memory => Arc::new(MemoryBackend::new()),
        BackendChoice::Supabase(config) => Arc::new(SupabaseBackend::new(config.clone())),
    }
}

/// Wire the controller to `backend`, start the change pump, and restore a
/// saved session (mounting the dashboard when it still validates).
pub async fn bootstrap(
    backend: Arc<dyn Backend>,
    storage: Storage,
    avatar_bucket: String,
    backend_kind: &'static str,
) -> SharedState {
    let (controller, inbound) = Controller::new(backend, WS_CHANNEL_CAPACITY);
    tokio::spawn(sync::change_pump(controller.clone(), inbound));

    match storage.load_session() {
        Ok(Some(saved)) => {
            let restored =
                backend::blocking(controller.backend(), move |b| b.restore_session(saved)).await;
            match restored {
                Ok(()) => match controller.mount().await {
                    Ok(()) => {
                        sync::persist_session(&controller, &storage);
                        crate::hlog!("  session: restored");
                    }
                    Err(e) => {
                        crate::hlog!("  session: saved session rejected: {}", e);
                        let _ = storage.clear_session();
                    }
                },
                Err(e) => {
                    crate::hlog!("  session: could not restore: {}", e);
                    let _ = storage.clear_session();
                }
            }
        }
        Ok(None) => crate::hlog!("  session: none saved, waiting for sign-in"),
        Err(e) => crate::hlog!("  session: store unreadable: {}", e),
    }

    Arc::new(tokio::sync::Mutex::new(AppState {
        controller,
        storage,
        avatar_bucket,
        backend_kind,
        ws_connection_count: Arc::new(AtomicUsize::new(0)),
    }))
}

/// Entry point: parse CLI, open the session store, start the server.
pub async fn run() -> Result<(), String> {
    let config = Config::from_cli_and_env(Cli::parse())?;

    crate::logging::init();

    crate::hlog!("huddle-web starting");
    crate::hlog!("  data directory: {}", config.data_dir.display());
    match &config.backend {
        BackendChoice::Memory => crate::hlog!("  backend: in-process (nothing is persisted)"),
        BackendChoice::Supabase(c) => crate::hlog!("  backend: {}", c.url),
    }

    let db = db_path(&config.data_dir);
    let storage = Storage::open(&db).map_err(|e| format!("opening {}: {e}", db.display()))?;
    crate::hlog!("  database: {}", db.display());

    let backend = build_backend(&config.backend);
    let state = bootstrap(
        backend,
        storage,
        config.avatar_bucket.clone(),
        config.backend.kind(),
    )
    .await;

    let app = router::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", config.bind_addr))?;
    crate::hlog!("huddle-web listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| format!("server error: {e}"))
}
