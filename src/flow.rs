//! Flow control primitives.
//!
//! # Responsibilities
//! - Bound concurrent in-flight exchanges per tunnel socket (sliding window)
//! - Bound in-flight body bytes per exchange in the multiplexed protocol
//!   (byte credit replenished by window-update frames)

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Initial per-direction byte credit for a multiplexed exchange.
pub const INITIAL_STREAM_CREDIT: i64 = 1 << 20;

/// Sliding window of in-flight exchanges on one tunnel socket.
#[derive(Debug)]
pub struct Window {
    max: usize,
    in_flight: AtomicUsize,
}

impl Window {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Current number of occupied slots.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// True if at least one slot is free.
    pub fn has_capacity(&self) -> bool {
        self.in_flight.load(Ordering::Relaxed) < self.max
    }

    /// Try to occupy a slot. Acquisition is a compare-exchange loop so two
    /// concurrent callers can never push the count past the ceiling.
    pub fn try_acquire(self: &Arc<Self>) -> Option<WindowSlot> {
        let mut prev = self.in_flight.load(Ordering::Relaxed);
        loop {
            if prev >= self.max {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(WindowSlot {
            window: self.clone(),
        })
    }
}

/// RAII guard for one occupied window slot.
#[derive(Debug)]
pub struct WindowSlot {
    window: Arc<Window>,
}

impl Drop for WindowSlot {
    fn drop(&mut self) {
        self.window.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-stream byte credit for one direction of a multiplexed exchange.
///
/// Senders call [`Credit::consume`] before writing a body chunk and suspend
/// while the balance is exhausted. The receiving side replenishes via
/// window-update frames as it drains chunks. A chunk may overdraw the
/// balance by up to its own length, which keeps accounting simple and
/// bounds the overshoot by the transport chunk size.
#[derive(Debug)]
pub struct Credit {
    available: AtomicI64,
    notify: Notify,
}

impl Credit {
    pub fn new(initial: i64) -> Self {
        Self {
            available: AtomicI64::new(initial),
            notify: Notify::new(),
        }
    }

    /// Deduct `n` bytes, waiting until the balance is positive first.
    pub async fn consume(&self, n: usize) {
        loop {
            if self.available.load(Ordering::Acquire) > 0 {
                self.available.fetch_sub(n as i64, Ordering::AcqRel);
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Return `n` bytes to the balance and wake any waiting sender.
    pub fn replenish(&self, n: usize) {
        self.available.fetch_add(n as i64, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    pub fn available(&self) -> i64 {
        self.available.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_ceiling_is_never_exceeded() {
        let window = Arc::new(Window::new(2));
        let a = window.try_acquire().unwrap();
        let _b = window.try_acquire().unwrap();
        assert!(window.try_acquire().is_none());
        assert_eq!(window.in_flight(), 2);

        drop(a);
        assert!(window.try_acquire().is_some());
    }

    #[tokio::test]
    async fn window_of_one_is_exclusive_under_contention() {
        let window = Arc::new(Window::new(1));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let window = window.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    if let Some(slot) = window.try_acquire() {
                        let observed = window.in_flight();
                        peak.fetch_max(observed, Ordering::Relaxed);
                        tokio::task::yield_now().await;
                        drop(slot);
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn credit_blocks_sender_until_replenished() {
        let credit = Arc::new(Credit::new(8));
        credit.consume(8).await;
        assert!(credit.available() <= 0);

        let waiter = credit.clone();
        let handle = tokio::spawn(async move {
            waiter.consume(4).await;
        });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        credit.replenish(8);
        handle.await.unwrap();
    }
}
