//! Configuration types and constants for the huddle-web server.

use std::path::PathBuf;

use clap::Parser;

use crate::backend::supabase::SupabaseConfig;

pub(crate) const WS_CHANNEL_CAPACITY: usize = 256;
pub(crate) const MAX_WS_CONNECTIONS: usize = 8;
/// Largest avatar accepted by `POST /api/settings/avatar`.
pub(crate) const MAX_AVATAR_SIZE: usize = 5 * 1024 * 1024; // 5 MiB
pub(crate) const DEFAULT_AVATAR_BUCKET: &str = "avatars";
pub(crate) const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Local dashboard server for a hosted chat platform.
///
/// Keeps one signed-in dashboard, exposes it as a REST API plus a WebSocket
/// event stream, and talks to the platform's auth, tables, storage and
/// realtime services.
///
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug, Default)]
#[command(name = "huddle-web", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: HUDDLE_WEB_BIND] [default: 127.0.0.1:3000]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Data directory for the session database [env: HUDDLE_HOME] [default: ~/.huddle]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// Platform project URL [env: HUDDLE_BACKEND_URL]
    #[arg(long, short = 'u')]
    pub backend_url: Option<String>,

    /// Platform anon (public) API key [env: HUDDLE_ANON_KEY]
    #[arg(long, short = 'k')]
    pub anon_key: Option<String>,

    /// Storage bucket for avatars [env: HUDDLE_AVATAR_BUCKET] [default: avatars]
    #[arg(long)]
    pub avatar_bucket: Option<String>,

    /// Run against an in-process platform instead of a hosted one [env: HUDDLE_MEMORY]
    #[arg(long)]
    pub memory: bool,
}

#[derive(Debug, Clone)]
pub enum BackendChoice {
    Memory,
    Supabase(SupabaseConfig),
}

impl BackendChoice {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendChoice::Memory => "memory",
            BackendChoice::Supabase(_) => "supabase",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub backend: BackendChoice,
    pub avatar_bucket: String,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Result<Self, String> {
        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("HUDDLE_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".huddle"))
                    .unwrap_or_else(|_| PathBuf::from(".huddle"))
            });

        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("HUDDLE_WEB_BIND").ok())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let avatar_bucket = cli
            .avatar_bucket
            .or_else(|| std::env::var("HUDDLE_AVATAR_BUCKET").ok())
            .unwrap_or_else(|| DEFAULT_AVATAR_BUCKET.to_string());

        let backend_url = cli
            .backend_url
            .or_else(|| std::env::var("HUDDLE_BACKEND_URL").ok())
            .filter(|u| !u.trim().is_empty());
        let anon_key = cli
            .anon_key
            .or_else(|| std::env::var("HUDDLE_ANON_KEY").ok());

        let backend = match backend_url {
            _ if cli.memory || env_flag("HUDDLE_MEMORY") => BackendChoice::Memory,
            None => BackendChoice::Memory,
            Some(url) => {
                let anon_key = anon_key
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| {
                        "a backend URL needs an anon key (HUDDLE_ANON_KEY)".to_string()
                    })?;
                BackendChoice::Supabase(SupabaseConfig { url, anon_key })
            }
        };

        Ok(Self {
            bind_addr,
            data_dir,
            backend,
            avatar_bucket,
        })
    }
}
