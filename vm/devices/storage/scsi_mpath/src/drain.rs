// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use event_listener::Event;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Counts outstanding operations and wakes waiters when the count reaches
/// zero.
#[derive(Debug, Default)]
pub(crate) struct DrainCounter {
    count: AtomicUsize,
    event: Event,
}

impl DrainCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn exit(&self) {
        let old = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(old != 0, "drain counter underflow");
        if old == 1 {
            self.event.notify(usize::MAX);
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Waits until no operations are outstanding.
    pub async fn wait(&self) {
        loop {
            if self.count() == 0 {
                return;
            }
            let listener = self.event.listen();
            if self.count() == 0 {
                return;
            }
            listener.await;
        }
    }
}
