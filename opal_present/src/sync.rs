use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use parking_lot::{Condvar, Mutex};

use crate::device::Device;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SemaphoreType {
    Binary,
    Timeline,
}

pub(crate) struct Semaphore {
    /// Required to destroy the semaphore inside destructor
    device: Arc<Device>,
    pub(crate) raw: vk::Semaphore,
    pub(crate) semaphore_type: SemaphoreType,
}

impl Semaphore {
    pub(crate) fn new(device: Arc<Device>, semaphore_type: SemaphoreType) -> Result<Self> {
        Self::new_with_value(device, semaphore_type, 0)
    }

    pub(crate) fn new_with_value(
        device: Arc<Device>,
        semaphore_type: SemaphoreType,
        initial_value: u64,
    ) -> Result<Self> {
        let mut semaphore_type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::BINARY)
            .initial_value(0);
        if semaphore_type == SemaphoreType::Timeline {
            semaphore_type_info = semaphore_type_info
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(initial_value);
        }
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut semaphore_type_info);

        let raw = unsafe { device.raw.create_semaphore(&semaphore_info, None)? };

        Ok(Self {
            device,
            raw,
            semaphore_type,
        })
    }

    /// Blocks until the timeline semaphore reaches `value`.
    pub(crate) fn wait_value(&self, value: u64) -> Result<()> {
        assert_eq!(self.semaphore_type, SemaphoreType::Timeline);

        let semaphores = [self.raw];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.raw.wait_semaphores(&wait_info, u64::MAX)? };

        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_semaphore(self.raw, None);
        }
    }
}

pub(crate) struct Fence {
    device: Arc<Device>,
    pub(crate) raw: vk::Fence,
}

impl Fence {
    pub(crate) fn new(device: Arc<Device>) -> Result<Self> {
        let fence_info = vk::FenceCreateInfo::default();
        let raw = unsafe { device.raw.create_fence(&fence_info, None)? };

        Ok(Self { device, raw })
    }

    pub(crate) fn wait_and_reset(&self) -> Result<()> {
        unsafe {
            self.device
                .raw
                .wait_for_fences(&[self.raw], true, u64::MAX)?;
            self.device.raw.reset_fences(&[self.raw])?;
        }

        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_fence(self.raw, None);
        }
    }
}

/// Counting semaphore handed to the application as the frame latency
/// waitable. Its count is the number of presents the application may
/// still submit without blocking; the present machinery releases one
/// unit per completed frame.
pub struct LatencySemaphore {
    count: Mutex<u32>,
    cond: Condvar,
    max_count: u32,
}

impl LatencySemaphore {
    pub(crate) fn new(initial_count: u32, max_count: u32) -> Self {
        Self {
            count: Mutex::new(initial_count.min(max_count)),
            cond: Condvar::new(),
            max_count,
        }
    }

    /// Blocks until a unit is available, then consumes it.
    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    pub(crate) fn release(&self, units: u32) {
        let mut count = self.count.lock();
        *count = (*count + units).min(self.max_count);
        self.cond.notify_all();
    }

    pub fn count(&self) -> u32 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[test]
    fn latency_semaphore_accounting() {
        let semaphore = LatencySemaphore::new(2, 16);
        assert_eq!(semaphore.count(), 2);

        semaphore.acquire();
        semaphore.acquire();
        assert_eq!(semaphore.count(), 0);

        semaphore.release(3);
        assert_eq!(semaphore.count(), 3);
    }

    #[test]
    fn latency_semaphore_clamps_to_max() {
        let semaphore = LatencySemaphore::new(20, 16);
        assert_eq!(semaphore.count(), 16);

        semaphore.release(5);
        assert_eq!(semaphore.count(), 16);
    }

    #[test]
    fn latency_semaphore_unblocks_waiter() {
        let semaphore = StdArc::new(LatencySemaphore::new(0, 16));
        let other = semaphore.clone();
        let waiter = std::thread::spawn(move || other.acquire());

        semaphore.release(1);
        waiter.join().unwrap();
        assert_eq!(semaphore.count(), 0);
    }
}
