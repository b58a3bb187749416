/*! Frame latency pacing. Two signal paths exist per processed request:
 * the present-wait path (the waiter thread releases a token when the
 * display scans the frame out) and the fallback path implemented here,
 * which paces on a timeline fence signaled at the queue tail.
 */

use std::{sync::Arc, thread};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Sender};

use crate::{
    sync::{LatencySemaphore, Semaphore},
    types::SwapChainFlags,
};

pub(crate) const DEFAULT_FRAME_LATENCY: u32 = 3;

/// Latency the facade starts out with. Waitable swap chains begin at 1
/// and let the application raise it. On the default path the first
/// acquire is implicit in the first present, so one unit of the
/// default is already spent when the swap chain is created.
pub(crate) fn initial_frame_latency(flags: SwapChainFlags) -> u32 {
    if flags.contains(SwapChainFlags::FRAME_LATENCY_WAITABLE) {
        1
    } else {
        DEFAULT_FRAME_LATENCY - 1
    }
}

/// Raising the latency releases the difference immediately; lowering it
/// is the application's responsibility, so nothing is reclaimed.
pub(crate) fn frame_latency_release_units(requested: u32, current: u32) -> u32 {
    requested.saturating_sub(current)
}

/// Watches the latency fence on a dedicated thread and releases one
/// latency token per registered completion.
pub(crate) struct FenceEventWatcher {
    sender: Option<Sender<u64>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FenceEventWatcher {
    pub(crate) fn spawn(
        fence: Arc<Semaphore>,
        latency_event: Arc<LatencySemaphore>,
    ) -> Result<Self> {
        let (sender, receiver) = unbounded::<u64>();
        let thread = thread::Builder::new()
            .name("opal-latency-fence".to_owned())
            .spawn(move || {
                while let Ok(value) = receiver.recv() {
                    // Release even on a failed wait, the application
                    // must not be starved of tokens by a lost device.
                    if let Err(e) = fence.wait_value(value) {
                        log::error!("Latency fence wait failed: {e:#}");
                    }
                    latency_event.release(1);
                }
            })
            .context("Failed to spawn latency fence watcher")?;

        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    /// Returns false when the watcher cannot take the registration;
    /// the caller then has to release a token itself to stay live.
    pub(crate) fn register(&self, value: u64) -> bool {
        match &self.sender {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }
}

impl Drop for FenceEventWatcher {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_latency_reflects_implicit_first_acquire() {
        assert_eq!(initial_frame_latency(SwapChainFlags::empty()), 2);
        assert_eq!(
            initial_frame_latency(SwapChainFlags::FRAME_LATENCY_WAITABLE),
            1
        );
    }

    #[test]
    fn raising_latency_releases_difference() {
        assert_eq!(frame_latency_release_units(4, 1), 3);
        assert_eq!(frame_latency_release_units(4, 4), 0);
        assert_eq!(frame_latency_release_units(2, 4), 0);
    }
}
