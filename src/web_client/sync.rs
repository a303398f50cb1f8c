//! Background tasks: the realtime change pump and session persistence.

use tokio::sync::mpsc;

use crate::backend::ChannelMessage;
use crate::dashboard::Controller;
use crate::storage::Storage;

/// Feed every realtime item into the controller, in arrival order.
pub async fn change_pump(
    controller: Controller,
    mut inbound: mpsc::UnboundedReceiver<ChannelMessage>,
) {
    while let Some(message) = inbound.recv().await {
        controller.handle(message).await;
    }
    crate::hlog!("realtime: change pump stopped");
}

/// Persist the backend's current session, or clear the stored one when
/// there is none.
pub fn persist_session(controller: &Controller, storage: &Storage) {
    let result = match controller.backend().session() {
        Some(session) => storage.save_session(&session),
        None => storage.clear_session(),
    };
    if let Err(e) = result {
        crate::hlog!("session: could not persist: {}", e);
    }
}
