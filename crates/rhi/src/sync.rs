//! Synchronization primitives.
//!
//! This module provides RAII wrappers for Vulkan synchronization objects:
//! - [`Semaphore`] - GPU-to-GPU synchronization (between queue operations)
//! - [`Fence`] - GPU-to-CPU synchronization (for host waiting)
//! - [`SemaphorePool`] - free list of acquire semaphores with no pending GPU work
//!
//! # Overview
//!
//! - **Semaphores** order queue operations: image acquisition before
//!   rendering, rendering before presentation.
//! - **Fences** let the CPU learn that submitted work has completed, and are
//!   what keeps the CPU from running more than one submission ahead per image.
//!
//! Each wrapper owns exactly one handle and destroys it exactly once, when it
//! is dropped. Moving a wrapper moves the ownership.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use swapframe_rhi::context::DisplayContext;
//! use swapframe_rhi::sync::{Fence, Semaphore};
//!
//! # fn example(context: Arc<dyn DisplayContext>) -> swapframe_rhi::RhiResult<()> {
//! let image_available = Semaphore::new(context.clone())?;
//!
//! // Signaled so the first wait does not block
//! let in_flight = Fence::new(context, true)?;
//! in_flight.wait(u64::MAX)?;
//! in_flight.reset()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::context::DisplayContext;
use crate::error::RhiResult;

/// Owned binary semaphore.
pub struct Semaphore {
    /// Context the semaphore was created on.
    context: Arc<dyn DisplayContext>,
    /// Vulkan semaphore handle.
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new semaphore in the unsignaled state.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(context: Arc<dyn DisplayContext>) -> RhiResult<Self> {
        let semaphore = context.create_semaphore()?;
        debug!("Created semaphore {:?}", semaphore);
        Ok(Self { context, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Semaphore").field(&self.semaphore).finish()
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.context.destroy_semaphore(self.semaphore);
        debug!("Destroyed semaphore {:?}", self.semaphore);
    }
}

/// Owned fence.
///
/// The fence is only ever waited on and reset by its owner; the GPU signals
/// it when the submission it was attached to completes.
pub struct Fence {
    /// Context the fence was created on.
    context: Arc<dyn DisplayContext>,
    /// Vulkan fence handle.
    fence: vk::Fence,
}

impl Fence {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `context` - The display context
    /// * `signaled` - If true, creates the fence in the signaled state so the
    ///   first wait on it returns immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(context: Arc<dyn DisplayContext>, signaled: bool) -> RhiResult<Self> {
        let fence = context.create_fence(signaled)?;

        debug!(
            "Created fence {:?} ({})",
            fence,
            if signaled { "signaled" } else { "unsignaled" }
        );

        Ok(Self { context, fence })
    }

    /// Returns the Vulkan fence handle.
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Waits for the fence to become signaled.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout in nanoseconds. Use `u64::MAX` for infinite wait.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails or times out.
    pub fn wait(&self, timeout: u64) -> RhiResult<()> {
        self.context.wait_for_fence(self.fence, timeout)
    }

    /// Resets the fence to the unsignaled state.
    ///
    /// The fence must not be attached to a pending queue submission.
    pub fn reset(&self) -> RhiResult<()> {
        self.context.reset_fence(self.fence)
    }

    /// Checks, without blocking, whether the fence is signaled.
    pub fn is_signaled(&self) -> bool {
        matches!(self.context.fence_status(self.fence), Ok(true))
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fence").field(&self.fence).finish()
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.context.destroy_fence(self.fence);
        debug!("Destroyed fence {:?}", self.fence);
    }
}

/// Free list of acquire semaphores.
///
/// The presentation engine only tells us which image an acquire bound to
/// after the call returns, so the semaphore handed to the acquire cannot be
/// taken from the image slot. Every semaphore in the pool is unsignaled and
/// has no pending wait:
/// - a semaphore handed to a failed acquire comes back untouched;
/// - a semaphore retired from an image slot comes back only after that slot's
///   fence was waited on, i.e. after the submission that waited on it finished.
#[derive(Debug, Default)]
pub struct SemaphorePool {
    free: Vec<Semaphore>,
}

impl SemaphorePool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a spare semaphore, creating one when the pool is empty.
    pub fn take(&mut self, context: &Arc<dyn DisplayContext>) -> RhiResult<Semaphore> {
        match self.free.pop() {
            Some(semaphore) => Ok(semaphore),
            None => Semaphore::new(context.clone()),
        }
    }

    /// Returns a semaphore with no pending GPU work to the pool.
    pub fn recycle(&mut self, semaphore: Semaphore) {
        self.free.push(semaphore);
    }

    /// Destroys spare semaphores until at most `max` remain.
    pub fn trim(&mut self, max: usize) {
        if self.free.len() > max {
            debug!(
                "Trimming semaphore pool from {} to {}",
                self.free.len(),
                max
            );
            self.free.truncate(max);
        }
    }

    /// Number of spare semaphores.
    #[inline]
    pub fn len(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Whether `handle` is currently parked in the pool.
    pub fn contains(&self, handle: vk::Semaphore) -> bool {
        self.free.iter().any(|s| s.handle() == handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockContext;

    fn context() -> (Arc<MockContext>, Arc<dyn DisplayContext>) {
        let mock = Arc::new(MockContext::new());
        let context: Arc<dyn DisplayContext> = mock.clone();
        (mock, context)
    }

    #[test]
    fn test_semaphore_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
    }

    #[test]
    fn test_fence_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Fence>();
    }

    #[test]
    fn test_drop_destroys_handles_once() {
        let (mock, context) = context();
        {
            let _semaphore = Semaphore::new(context.clone()).unwrap();
            let _fence = Fence::new(context.clone(), false).unwrap();
            assert_eq!(mock.live_semaphore_count(), 1);
            assert_eq!(mock.live_fence_count(), 1);
        }
        assert_eq!(mock.live_semaphore_count(), 0);
        assert_eq!(mock.live_fence_count(), 0);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_signaled_fence_does_not_block() {
        let (_mock, context) = context();
        let fence = Fence::new(context, true).unwrap();
        assert!(fence.is_signaled());
        fence.wait(u64::MAX).unwrap();
        fence.reset().unwrap();
        assert!(!fence.is_signaled());
    }

    #[test]
    fn test_pool_reuses_before_creating() {
        let (mock, context) = context();
        let mut pool = SemaphorePool::new();

        let first = pool.take(&context).unwrap();
        let first_handle = first.handle();
        assert_eq!(mock.live_semaphore_count(), 1);

        pool.recycle(first);
        assert!(pool.contains(first_handle));

        let again = pool.take(&context).unwrap();
        assert_eq!(again.handle(), first_handle);
        assert!(pool.is_empty());
        assert_eq!(mock.live_semaphore_count(), 1);
    }

    #[test]
    fn test_pool_trim_destroys_extras() {
        let (mock, context) = context();
        let mut pool = SemaphorePool::new();
        for _ in 0..4 {
            pool.recycle(Semaphore::new(context.clone()).unwrap());
        }

        pool.trim(2);
        assert_eq!(pool.len(), 2);
        assert_eq!(mock.live_semaphore_count(), 2);
    }
}
