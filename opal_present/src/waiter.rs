/*! The waiter thread turns present IDs into frame latency releases.
 * The worker pushes an ID after each on-screen present; the waiter
 * blocks until the display has actually scanned it out and only then
 * returns a latency token to the application. This keeps application
 * pacing coupled to the display rather than to queue throughput.
 */

use std::{collections::VecDeque, sync::Arc, thread};

use ash::vk;
use parking_lot::{Condvar, Mutex};

use crate::{device::Device, sync::LatencySemaphore};

/// Present ID 0 is never handed to the GPU; pushing it tears the
/// waiter thread down.
pub(crate) const SHUTDOWN_PRESENT_ID: u64 = 0;

/// Ordered queue of `(present id, swapchain)` waits. The worker
/// produces, the waiter thread consumes from the front. An empty queue
/// is the condition swapchain destruction waits for, so every pop that
/// empties the queue signals.
pub(crate) struct WaitQueue {
    entries: Mutex<VecDeque<(u64, vk::SwapchainKHR)>>,
    cond: Condvar,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, present_id: u64, swapchain: vk::SwapchainKHR) {
        let mut entries = self.entries.lock();
        entries.push_back((present_id, swapchain));
        self.cond.notify_all();
    }

    /// Blocks until an entry is available and returns it without
    /// popping. The entry stays visible to [`Self::wait_empty`] until
    /// the wait it describes has completed.
    fn front_blocking(&self) -> (u64, vk::SwapchainKHR) {
        let mut entries = self.entries.lock();
        while entries.is_empty() {
            self.cond.wait(&mut entries);
        }
        *entries.front().unwrap()
    }

    fn pop_front(&self) {
        let mut entries = self.entries.lock();
        entries.pop_front();
        if entries.is_empty() {
            self.cond.notify_all();
        }
    }

    /// Blocks until the waiter has consumed every outstanding wait.
    pub(crate) fn wait_empty(&self) {
        let mut entries = self.entries.lock();
        while !entries.is_empty() {
            self.cond.wait(&mut entries);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub(crate) struct WaiterThread {
    queue: Arc<WaitQueue>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WaiterThread {
    /// Returns `None` when the device lacks present-wait support; the
    /// caller falls back to fence-paced latency signaling.
    pub(crate) fn spawn(
        device: Arc<Device>,
        latency_event: Arc<LatencySemaphore>,
    ) -> Option<Self> {
        if !device.supports_present_wait() {
            return None;
        }

        let queue = Arc::new(WaitQueue::new());
        let thread_queue = queue.clone();
        let spawned = thread::Builder::new()
            .name("opal-swapchain-wait".to_owned())
            .spawn(move || {
                let present_wait_fns = device.present_wait_fns.as_ref().unwrap();
                loop {
                    let (present_id, swapchain) = thread_queue.front_blocking();
                    if present_id == SHUTDOWN_PRESENT_ID {
                        break;
                    }

                    // Out-of-date and friends do not matter here, the
                    // present either hit the screen or never will.
                    let result = unsafe {
                        present_wait_fns.wait_for_present(swapchain, present_id, u64::MAX)
                    };
                    if let Err(e) = result {
                        log::debug!("wait_for_present returned {e:?}");
                    }
                    latency_event.release(1);

                    thread_queue.pop_front();
                }
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                log::error!("Failed to spawn waiter thread: {e}");
                return None;
            }
        };

        log::info!("Enabling present wait path for frame latency");
        Some(Self {
            queue,
            thread: Some(thread),
        })
    }

    pub(crate) fn push(&self, present_id: u64, swapchain: vk::SwapchainKHR) {
        self.queue.push(present_id, swapchain);
    }

    /// Required before destroying a swapchain: no wait may touch the
    /// handle afterwards.
    pub(crate) fn drain(&self) {
        self.queue.wait_empty();
    }

    pub(crate) fn shutdown(mut self) {
        self.queue.push(SHUTDOWN_PRESENT_ID, vk::SwapchainKHR::null());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[test]
    fn queue_is_fifo() {
        let queue = WaitQueue::new();
        queue.push(1, vk::SwapchainKHR::null());
        queue.push(2, vk::SwapchainKHR::null());
        queue.push(3, vk::SwapchainKHR::null());

        assert_eq!(queue.front_blocking().0, 1);
        queue.pop_front();
        assert_eq!(queue.front_blocking().0, 2);
        queue.pop_front();
        assert_eq!(queue.front_blocking().0, 3);
        queue.pop_front();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn wait_empty_blocks_until_drained() {
        let queue = StdArc::new(WaitQueue::new());
        queue.push(1, vk::SwapchainKHR::null());
        queue.push(2, vk::SwapchainKHR::null());

        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                while queue.len() != 0 {
                    queue.front_blocking();
                    queue.pop_front();
                }
            })
        };

        queue.wait_empty();
        consumer.join().unwrap();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn push_unblocks_consumer() {
        let queue = StdArc::new(WaitQueue::new());
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.front_blocking().0)
        };

        queue.push(42, vk::SwapchainKHR::null());
        assert_eq!(consumer.join().unwrap(), 42);
    }
}
