//! huddle-web: local dashboard server for the chat platform.
//!
//! See [`huddle::web_client`] for configuration and routes.

#[tokio::main]
async fn main() {
    if let Err(e) = huddle::web_client::run().await {
        eprintln!("huddle-web: {e}");
        std::process::exit(1);
    }
}
