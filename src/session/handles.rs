//! Integer-handle table for ephemeral debugger state.

use std::collections::HashMap;

const START_HANDLE: i64 = 1000;

/// Maps small positive integers to snapshot values (frames, variable
/// groups). Handles issued before a [`Handles::reset`] never resolve again:
/// the counter keeps growing across resets, so a stale handle from a
/// previous stop cannot alias a fresh one.
pub struct Handles<T> {
    next_handle: i64,
    values: HashMap<i64, T>,
}

impl<T> Default for Handles<T> {
    fn default() -> Self {
        Handles {
            next_handle: START_HANDLE,
            values: HashMap::new(),
        }
    }
}

impl<T> Handles<T> {
    pub fn new() -> Handles<T> {
        Handles::default()
    }

    /// Invalidate every previously issued handle. Called exactly once per
    /// stopped transition, before the new stop's scopes are computed.
    pub fn reset(&mut self) {
        self.values.clear();
    }

    pub fn create(&mut self, value: T) -> i64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.values.insert(handle, value);
        handle
    }

    pub fn get(&self, handle: i64) -> Option<&T> {
        self.values.get(&handle)
    }
}
