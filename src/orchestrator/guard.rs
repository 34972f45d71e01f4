// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Detection of a model stuck repeating the same tool batch.

use sha2::{Digest, Sha256};

use crate::types::ToolCall;

/// Identical consecutive batches allowed to run. One more aborts the turn.
pub const REPEAT_LIMIT: usize = 3;

/// Tracks the signature of the last tool batch and how often it repeated.
#[derive(Debug, Default)]
pub struct RepeatGuard {
    last_signature: Option<[u8; 32]>,
    repeats: usize,
}

impl RepeatGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch. Returns how many consecutive times it has now been seen.
    pub fn observe(&mut self, calls: &[ToolCall]) -> usize {
        let signature = batch_signature(calls);
        if self.last_signature == Some(signature) {
            self.repeats += 1;
        } else {
            self.last_signature = Some(signature);
            self.repeats = 1;
        }
        self.repeats
    }

    /// Whether the last observed batch went past the limit and must not run.
    pub fn exceeded(&self) -> bool {
        self.repeats > REPEAT_LIMIT
    }
}

/// SHA-256 over the ordered (name, input) pairs. Call ids are ignored.
pub fn batch_signature(calls: &[ToolCall]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for call in calls {
        hasher.update(call.name.as_bytes());
        hasher.update([0u8]);
        // serde_json objects are key-sorted, so equal inputs encode equally.
        hasher.update(call.input.to_string().as_bytes());
        hasher.update([0xffu8]);
    }
    hasher.finalize().into()
}
