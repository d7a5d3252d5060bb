use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Counting semaphore bounding how many builds are `building` at once.
///
/// A slot is taken just before a build leaves `queued` and released when
/// the returned guard drops, after the build reached a terminal state.
#[derive(Debug)]
pub struct BuildSlots {
    capacity: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
}

pub struct SlotGuard<'a> {
    slots: &'a BuildSlots,
}

impl BuildSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_use: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    fn count(&self) -> MutexGuard<'_, usize> {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a slot is free.
    pub fn acquire(&self) -> SlotGuard<'_> {
        let mut in_use = self.count();
        while *in_use >= self.capacity {
            in_use = self
                .freed
                .wait(in_use)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *in_use += 1;
        SlotGuard { slots: self }
    }

    pub fn try_acquire(&self) -> Option<SlotGuard<'_>> {
        let mut in_use = self.count();
        if *in_use >= self.capacity {
            return None;
        }
        *in_use += 1;
        Some(SlotGuard { slots: self })
    }

    pub fn in_use(&self) -> usize {
        *self.count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut in_use = self.slots.count();
        *in_use = in_use.saturating_sub(1);
        self.slots.freed.notify_one();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C requests a cooperative stop; a second one exits.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\ncancellation requested, waiting for in-flight retrievals...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn try_acquire_respects_capacity() {
        let slots = BuildSlots::new(2);
        let a = slots.try_acquire();
        let b = slots.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(slots.try_acquire().is_none());
        drop(a);
        assert_eq!(slots.in_use(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(BuildSlots::new(0).capacity(), 1);
    }

    #[test]
    fn acquire_never_exceeds_capacity() {
        let slots = Arc::new(BuildSlots::new(2));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slots = Arc::clone(&slots);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    let _slot = slots.acquire();
                    peak.fetch_max(slots.in_use(), Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(slots.in_use(), 0);
    }
}
