//! Route handler modules for the huddle-web REST API.

pub mod auth;
pub mod conversation;
pub mod health;
pub mod settings;
pub mod users;
pub mod websocket;

use crate::dashboard::Controller;
use crate::web_client::state::SharedState;

/// Clone the controller out of the state lock.
pub(crate) async fn controller(state: &SharedState) -> Controller {
    state.lock().await.controller.clone()
}
