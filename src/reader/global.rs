//! The process-wide reader singleton.
//!
//! Most applications read one LDB from many call sites; the global reader
//! saves them the wiring. It is opt-in: nothing is opened until the first
//! [`global_reader`] call, which opens the default LDB path (honoring
//! `CTLSTORE_PATH`). Tests reset it between cases with
//! [`reset_global_reader`].

use std::sync::{Arc, Mutex, OnceLock};

use super::{LdbReader, ReaderError};
use crate::ldb::default_ldb_path;

fn slot() -> &'static Mutex<Option<Arc<LdbReader>>> {
    static SLOT: OnceLock<Mutex<Option<Arc<LdbReader>>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(None))
}

/// Returns the process-wide reader, opening it on first use.
pub fn global_reader() -> Result<Arc<LdbReader>, ReaderError> {
    let mut guard = slot().lock().expect("global reader lock poisoned");
    if let Some(reader) = guard.as_ref() {
        return Ok(Arc::clone(reader));
    }
    let reader = Arc::new(LdbReader::open(&default_ldb_path())?);
    *guard = Some(Arc::clone(&reader));
    Ok(reader)
}

/// Drops the process-wide reader so the next [`global_reader`] call opens a
/// fresh one. Intended for test harness teardown.
pub fn reset_global_reader() {
    slot().lock().expect("global reader lock poisoned").take();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazily_opens_and_resets() {
        // Point the default path somewhere writable for the duration.
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: test-local env mutation; no other test in this module
        // reads CTLSTORE_PATH concurrently.
        unsafe { std::env::set_var(crate::ldb::CTLSTORE_PATH_ENV, dir.path()) };
        reset_global_reader();

        let first = global_reader().unwrap();
        let second = global_reader().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        reset_global_reader();
        let third = global_reader().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));

        reset_global_reader();
        unsafe { std::env::remove_var(crate::ldb::CTLSTORE_PATH_ENV) };
    }
}
