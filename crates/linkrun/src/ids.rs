//! # Correlation Id Pool
//!
//! Hands out short random strings for request/response correlation.
//! An id is never handed out twice while it is in use; freeing returns it to
//! the pool of candidates.

use std::collections::HashSet;
use std::sync::Mutex;

use rand::Rng;
use rand::distributions::Alphanumeric;

pub const DEFAULT_ID_LEN: usize = 10;

#[derive(Debug)]
pub struct IdPool {
    len: usize,
    in_use: Mutex<HashSet<String>>,
}

impl IdPool {
    pub fn new(len: usize) -> Self {
        Self {
            len: len.max(1),
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Draws a fresh id and marks it in use.
    pub fn next(&self) -> String {
        let mut in_use = self.lock();
        let mut rng = rand::thread_rng();
        loop {
            let id: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(self.len)
                .map(char::from)
                .collect();
            if in_use.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Returns `id` to the pool. Returns false if it was not in use.
    pub fn free(&self, id: &str) -> bool {
        self.lock().remove(id)
    }

    pub fn free_all(&self) {
        self.lock().clear();
    }

    pub fn in_use(&self) -> usize {
        self.lock().len()
    }

    pub fn is_in_use(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked.
        self.in_use.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new(DEFAULT_ID_LEN)
    }
}
