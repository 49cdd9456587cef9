use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

/// Process-wide task id counter.
///
/// Ids are assigned lazily, on first observation, and are never zero; the
/// counter wraps around zero rather than through it.
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

fn next_id() -> u32 {
    loop {
        let id = NEXT_ID.fetch_add(1, Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// A lazily-assigned task id slot. Zero means "not yet assigned".
#[derive(Debug)]
pub(crate) struct IdSlot(AtomicU32);

impl IdSlot {
    pub(crate) fn new() -> IdSlot {
        IdSlot(AtomicU32::new(0))
    }

    /// Returns the task's id, assigning one on first call. Concurrent callers
    /// race to install an id; the loser observes the winner's value.
    pub(crate) fn get(&self) -> u32 {
        let cur = self.0.load(Relaxed);
        if cur != 0 {
            return cur;
        }

        let fresh = next_id();
        match self.0.compare_exchange(0, fresh, Relaxed, Relaxed) {
            Ok(_) => fresh,
            Err(actual) => actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigned_once() {
        let slot = IdSlot::new();
        let id = slot.get();
        assert_ne!(id, 0);
        assert_eq!(slot.get(), id);
    }

    #[test]
    fn distinct_across_slots() {
        let a = IdSlot::new();
        let b = IdSlot::new();
        assert_ne!(a.get(), b.get());
    }

    #[test]
    fn wrap_skips_zero() {
        NEXT_ID.store(u32::MAX, Relaxed);
        let a = next_id(); // u32::MAX
        let b = next_id(); // wraps to 0, skipped
        assert_eq!(a, u32::MAX);
        assert_ne!(b, 0);
    }
}
