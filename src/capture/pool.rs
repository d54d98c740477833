//! Bounded frame buffer pool and the lease guard handed out from it

use bytes::Bytes;
use log::debug;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use super::CaptureError;

/// Pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured number of buffers
    pub capacity: usize,

    /// Leases currently held
    pub outstanding: usize,

    /// Highest number of leases ever held at once
    pub high_water: usize,

    /// Total leases handed out
    pub acquired: u64,

    /// Total leases returned
    pub released: u64,
}

#[derive(Debug)]
struct PoolShared {
    capacity: usize,
    slots: Arc<Semaphore>,
    outstanding: AtomicUsize,
    high_water: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// A fixed set of frame buffer slots shared by every capture path.
///
/// Single-buffered (`capacity == 1`) and double-buffered (`capacity == 2`)
/// configurations are the usual ones. Checkout waits up to `timeout` for a
/// slot to come back and then fails; a zero timeout fails immediately.
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
    timeout: Duration,
}

impl FramePool {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(PoolShared {
                capacity,
                slots: Arc::new(Semaphore::new(capacity)),
                outstanding: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
            timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Reserves a free slot. The slot returns to the pool if it is dropped
    /// before being filled.
    pub async fn checkout(&self) -> Result<PoolSlot, CaptureError> {
        let slots = Arc::clone(&self.shared.slots);

        let permit = if self.timeout.is_zero() {
            slots.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::NoPermits => CaptureError::PoolExhausted {
                    capacity: self.shared.capacity,
                },
                TryAcquireError::Closed => CaptureError::Device("frame pool closed".to_string()),
            })?
        } else {
            match tokio::time::timeout(self.timeout, slots.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(CaptureError::Device("frame pool closed".to_string())),
                Err(_) => return Err(CaptureError::Timeout(self.timeout)),
            }
        };

        Ok(PoolSlot {
            permit,
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.shared.capacity,
            outstanding: self.shared.outstanding.load(Ordering::Acquire),
            high_water: self.shared.high_water.load(Ordering::Acquire),
            acquired: self.shared.acquired.load(Ordering::Relaxed),
            released: self.shared.released.load(Ordering::Relaxed),
        }
    }
}

/// A reserved but still empty pool slot
#[derive(Debug)]
pub struct PoolSlot {
    permit: OwnedSemaphorePermit,
    shared: Arc<PoolShared>,
}

impl PoolSlot {
    /// Stores captured bytes in the slot, turning it into a lease.
    pub fn fill(self, data: Bytes) -> FrameLease {
        let sequence = self.shared.acquired.fetch_add(1, Ordering::Relaxed);
        let outstanding = self.shared.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.high_water.fetch_max(outstanding, Ordering::AcqRel);

        FrameLease {
            data,
            acquired_at: Instant::now(),
            sequence,
            permit: Some(self.permit),
            shared: self.shared,
        }
    }
}

/// Exclusive ownership of one captured frame.
///
/// The slot goes back to the pool exactly once: either through
/// [`FrameLease::release`] or, on any path that forgets to, when the lease is
/// dropped. A lease cannot be cloned, and releasing consumes it, so its bytes
/// are unreachable after release.
pub struct FrameLease {
    data: Bytes,
    acquired_at: Instant,
    sequence: u64,
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<PoolShared>,
}

impl FrameLease {
    /// Encoded image bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// When the frame was filled and handed out
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Pool-wide acquisition order of this frame
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the buffer to its pool.
    pub fn release(mut self) {
        self.return_slot();
    }

    fn return_slot(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            self.shared.released.fetch_add(1, Ordering::Relaxed);
            drop(permit);
        }
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if self.permit.is_some() {
            debug!("Frame lease #{} dropped without explicit release", self.sequence);
            self.return_slot();
        }
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease")
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .field("held", &self.permit.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    async fn lease(pool: &FramePool, data: &'static [u8]) -> FrameLease {
        pool.checkout().await.unwrap().fill(Bytes::from_static(data))
    }

    #[tokio::test]
    async fn test_release_returns_slot() {
        let pool = FramePool::new(1, Duration::ZERO);

        let first = lease(&pool, b"one").await;
        assert_eq!(pool.stats().outstanding, 1);
        first.release();

        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);

        // Slot is usable again
        let second = lease(&pool, b"two").await;
        assert_eq!(second.sequence(), 1);
    }

    #[tokio::test]
    async fn test_single_buffer_refuses_second_checkout() {
        let pool = FramePool::new(1, Duration::ZERO);
        let _held = lease(&pool, b"held").await;

        let result = pool.checkout().await;
        assert_matches!(result, Err(CaptureError::PoolExhausted { capacity: 1 }));
        assert_eq!(pool.stats().outstanding, 1);
    }

    #[tokio::test]
    async fn test_double_buffer_allows_two_leases() {
        let pool = FramePool::new(2, Duration::ZERO);
        let a = lease(&pool, b"a").await;
        let b = lease(&pool, b"b").await;

        assert!(pool.checkout().await.is_err());
        assert_eq!(pool.stats().high_water, 2);

        a.release();
        b.release();
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_drop_releases_exactly_once() {
        let pool = FramePool::new(1, Duration::ZERO);
        {
            let _lease = lease(&pool, b"dropped").await;
        }
        let stats = pool.stats();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.outstanding, 0);

        // Explicit release followed by the implicit drop must not double count
        lease(&pool, b"explicit").await.release();
        assert_eq!(pool.stats().released, 2);
    }

    #[tokio::test]
    async fn test_unfilled_slot_is_not_counted() {
        let pool = FramePool::new(1, Duration::ZERO);
        drop(pool.checkout().await.unwrap());

        let stats = pool.stats();
        assert_eq!(stats.acquired, 0);
        assert_eq!(stats.released, 0);
        assert!(pool.checkout().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkout_times_out() {
        let pool = FramePool::new(1, Duration::from_millis(250));
        let _held = lease(&pool, b"held").await;

        let result = pool.checkout().await;
        assert_matches!(result, Err(CaptureError::Timeout(d)) if d == Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_checkout_gets_released_slot() {
        let pool = FramePool::new(1, Duration::from_secs(1));
        let held = lease(&pool, b"held").await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(|slot| slot.fill(Bytes::new())) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        held.release();

        let next = waiter.await.unwrap().unwrap();
        assert_eq!(next.sequence(), 1);
        assert_eq!(pool.stats().outstanding, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquired_at_tracks_hold_time() {
        let pool = FramePool::new(1, Duration::ZERO);
        let lease = pool.checkout().await.unwrap().fill(Bytes::from_static(b"frame"));

        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(lease.acquired_at().elapsed(), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_outstanding_never_exceeds_capacity() {
        let pool = FramePool::new(2, Duration::ZERO);
        let mut held = Vec::new();

        for round in 0..20 {
            match pool.checkout().await {
                Ok(slot) => held.push(slot.fill(Bytes::from_static(b"x"))),
                Err(_) => {
                    // Free the oldest lease whenever the pool is full
                    held.remove(0).release();
                }
            }
            if round % 3 == 0 {
                if let Some(lease) = held.pop() {
                    lease.release();
                }
            }
            assert!(pool.stats().outstanding <= pool.capacity());
        }

        let stats = pool.stats();
        assert!(stats.high_water <= 2);
        assert_eq!(stats.acquired - stats.released, held.len() as u64);
    }
}
