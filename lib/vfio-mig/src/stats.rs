// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicU64, Ordering};

/// Device-state transfer accounting, shared by every migrating device in the
/// process and read back for migration progress reporting.
///
/// Readers tolerate a slightly stale total, so relaxed ordering is enough.
#[derive(Debug, Default)]
pub struct TransferStats {
    bytes: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes of device state transferred since the last reset.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Clear the total, as done when a migration is abandoned.
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn accumulates_across_threads() {
        let stats = Arc::new(TransferStats::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        stats.add(3);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(stats.bytes_transferred(), 1200);

        stats.reset();
        assert_eq!(stats.bytes_transferred(), 0);
    }
}
