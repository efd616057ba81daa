use std::{
    collections::HashSet,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Mutex,
};

use once_cell::sync::Lazy;
use tracing::{info, warn};

static SEEN_INFO: Lazy<Mutex<HashSet<u64>>> = Lazy::new(|| Mutex::new(HashSet::new()));
static SEEN_WARN: Lazy<Mutex<HashSet<u64>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Returns true the first time `msg` is seen in `seen`.
fn first_sighting(seen: &Mutex<HashSet<u64>>, msg: &str) -> bool {
    let mut hasher = DefaultHasher::new();
    msg.hash(&mut hasher);
    let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
    seen.insert(hasher.finish())
}

/// Log at info level, once per distinct message for the life of the process.
pub fn once_log_info<M: AsRef<str>>(msg: M) {
    let msg = msg.as_ref();
    if first_sighting(&SEEN_INFO, msg) {
        info!("{msg}");
    }
}

/// Log at warn level, once per distinct message for the life of the process.
pub fn once_log_warn<M: AsRef<str>>(msg: M) {
    let msg = msg.as_ref();
    if first_sighting(&SEEN_WARN, msg) {
        warn!("{msg}");
    }
}
