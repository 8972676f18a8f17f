use fnv::FnvHashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::{self, ThreadId};

static NAMES: Lazy<RwLock<FnvHashMap<ThreadId, Arc<str>>>> = Lazy::new(RwLock::default);

/// Register a display name for a thread, visible to log sinks.
pub fn set_thread_name(id: ThreadId, name: impl Into<Arc<str>>) {
    NAMES.write().insert(id, name.into());
}

/// Name the calling thread after its std thread name, when it has one.
pub fn adopt_current_thread_name() {
    let current = thread::current();
    if let Some(name) = current.name() {
        set_thread_name(current.id(), name);
    }
}

pub fn thread_name(id: ThreadId) -> Option<Arc<str>> {
    NAMES.read().get(&id).cloned()
}
