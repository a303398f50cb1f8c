//! Log lines with timestamps, source locations, and ANSI colour support.
//!
//! The [`hlog!`] macro writes one line per event:
//!
//! ```text
//! 20261016T09:12:44.318 - src/dashboard.rs:212 - send: m-temp-3f confirmed by u-91c0a2e
//! ```
//!
//! On a terminal, timestamps and locations are dimmed and user/message ids
//! get a stable colour derived from their text. Output goes to stderr unless
//! [`set_writer`] installs another destination (which also turns colour off).

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};

static USE_COLOUR: AtomicBool = AtomicBool::new(false);

static SINK: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Call once at startup. Enables colour when stderr is a terminal.
pub fn init() {
    USE_COLOUR.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Send all subsequent [`hlog!`] output to `w`, without colour.
pub fn set_writer(out: Box<dyn Write + Send>) {
    USE_COLOUR.store(false, Ordering::Relaxed);
    *SINK.lock().unwrap_or_else(|e| e.into_inner()) = out;
}

pub fn colour_enabled() -> bool {
    USE_COLOUR.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const MSG_ID_COLOUR: &str = "\x1b[93m";

const ID_COLOURS: &[&str] = &[
    "\x1b[91m", "\x1b[92m", "\x1b[93m", "\x1b[94m", "\x1b[95m", "\x1b[96m", "\x1b[31m",
    "\x1b[32m", "\x1b[33m", "\x1b[34m", "\x1b[35m", "\x1b[36m",
];

fn colour_for(id: &str) -> &'static str {
    let hash = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const ID_SHOWN_CHARS: usize = 7;

fn shorten(id: &str) -> &str {
    match id.char_indices().nth(ID_SHOWN_CHARS) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

fn tagged(prefix: &str, id: &str, colour: &str) -> String {
    let short = shorten(id);
    if colour_enabled() {
        format!("{colour}{prefix}-{short}{RESET}")
    } else {
        format!("{prefix}-{short}")
    }
}

/// `u-1a2b3c4`, coloured by id.
pub fn user_id(id: &str) -> String {
    tagged("u", id, colour_for(id))
}

/// `m-1a2b3c4`.
pub fn msg_id(id: &str) -> String {
    tagged("m", id, MSG_ID_COLOUR)
}

/// Local wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    chrono::Local::now().format("%Y%m%dT%H:%M:%S%.3f").to_string()
}

/// Used by [`hlog!`].
pub fn emit(file: &str, line: u32, msg: &str) {
    let stamp = format_timestamp();
    let text = if colour_enabled() {
        format!("{DIM}{stamp} {file}:{line}{RESET} {msg}")
    } else {
        format!("{stamp} - {file}:{line} - {msg}")
    };
    let mut sink = SINK.lock().unwrap_or_else(|e| e.into_inner());
    let _ = writeln!(*sink, "{text}");
}

/// Log a line with timestamp and source location.
///
/// ```ignore
/// hlog!("roster: {} user(s) loaded", users.len());
/// hlog!("presence: {} is now {}", logging::user_id(&id), status);
/// ```
#[macro_export]
macro_rules! hlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_shortened_and_prefixed() {
        assert_eq!(user_id("0123456789abcdef"), "u-0123456");
        assert_eq!(msg_id("abc"), "m-abc");
    }

    #[test]
    fn timestamp_has_compact_shape() {
        let stamp = format_timestamp();
        assert_eq!(stamp.len(), "20260101T00:00:00.000".len());
        assert_eq!(&stamp[8..9], "T");
    }
}
