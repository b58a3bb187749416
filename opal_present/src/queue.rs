use std::{sync::Arc, thread};

use anyhow::{Context, Result};
use ash::vk;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    device::Device,
    sync::{Semaphore, SemaphoreType},
};

type QueueCallback = Box<dyn FnOnce() + Send + 'static>;

/// Single consumer thread draining submitted callbacks in FIFO order.
/// The channel hand-off doubles as the release/acquire edge between the
/// submitting thread and the callback body.
pub(crate) struct CallbackWorker {
    sender: Option<Sender<QueueCallback>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CallbackWorker {
    pub(crate) fn new(name: &str) -> Result<Self> {
        let (sender, receiver) = unbounded::<QueueCallback>();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Ok(callback) = receiver.recv() {
                    callback();
                }
            })
            .context("Failed to spawn queue worker thread")?;

        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    pub(crate) fn enqueue(&self, callback: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            if sender.send(Box::new(callback)).is_err() {
                log::error!("Queue worker thread is gone, dropping callback");
            }
        }
    }
}

impl Drop for CallbackWorker {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub(crate) struct QueueSubmitSemaphoreDescriptor<'a> {
    pub(crate) semaphore: &'a Semaphore,
    pub(crate) stage_mask: vk::PipelineStageFlags2,
    /// Only necessary for timeline semaphores.
    pub(crate) value: Option<u64>,
}

fn semaphore_submit_infos<'a>(
    descriptors: &'a [QueueSubmitSemaphoreDescriptor<'a>],
) -> Vec<vk::SemaphoreSubmitInfo<'a>> {
    descriptors
        .iter()
        .map(|submit_info| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(submit_info.semaphore.raw)
                .stage_mask(submit_info.stage_mask)
                .value(
                    if submit_info.semaphore.semaphore_type == SemaphoreType::Timeline {
                        submit_info
                            .value
                            .expect("Timeline semaphore requires a value!")
                    } else {
                        0
                    },
                )
        })
        .collect()
}

/// The graphics+present submission queue. All presentation work funnels
/// through here: present callbacks are serialized on the worker thread,
/// and direct submissions take the queue lock for the duration of the
/// Vulkan call.
pub struct CommandQueue {
    raw: Mutex<vk::Queue>,
    pub(crate) family_index: u32,
    worker: CallbackWorker,
    device: Arc<Device>,
}

impl CommandQueue {
    pub fn new(device: Arc<Device>) -> Result<Arc<Self>> {
        // Always queue index 0, only one queue is used per family.
        let family_index = device.graphics_family_index;
        let raw = unsafe { device.raw.get_device_queue(family_index, 0) };
        let worker = CallbackWorker::new("opal-queue-worker")?;

        Ok(Arc::new(Self {
            raw: Mutex::new(raw),
            family_index,
            worker,
            device,
        }))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Scoped access to the underlying queue. Holding the guard keeps
    /// every other submission path out.
    pub(crate) fn lock(&self) -> MutexGuard<'_, vk::Queue> {
        self.raw.lock()
    }

    /// Schedules `callback` on the worker thread. Callbacks run in
    /// submission order.
    pub(crate) fn enqueue(&self, callback: impl FnOnce() + Send + 'static) {
        self.worker.enqueue(callback);
    }

    pub(crate) fn wait_idle(&self) -> Result<()> {
        let queue = self.lock();
        unsafe { self.device.raw.queue_wait_idle(*queue)? };
        Ok(())
    }

    /// `fence` may be null when completion does not need CPU-side
    /// tracking.
    pub(crate) fn submit_command_buffers(
        &self,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[QueueSubmitSemaphoreDescriptor],
        signal_semaphores: &[QueueSubmitSemaphoreDescriptor],
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores_info = semaphore_submit_infos(wait_semaphores);
        let signal_semaphores_info = semaphore_submit_infos(signal_semaphores);

        let command_buffer_submit_infos = command_buffers
            .iter()
            .map(|command_buffer| {
                vk::CommandBufferSubmitInfo::default().command_buffer(*command_buffer)
            })
            .collect::<Vec<_>>();

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_semaphores_info)
            .signal_semaphore_infos(&signal_semaphores_info)
            .command_buffer_infos(&command_buffer_submit_infos);

        let queue = self.lock();
        unsafe {
            self.device
                .raw
                .queue_submit2(*queue, std::slice::from_ref(&submit_info), fence)?
        };

        Ok(())
    }

    /// Appends a timeline signal to the queue tail without any command
    /// buffer work.
    pub(crate) fn signal_timeline(&self, semaphore: &Semaphore, value: u64) -> Result<()> {
        self.submit_command_buffers(
            &[],
            &[],
            &[QueueSubmitSemaphoreDescriptor {
                semaphore,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                value: Some(value),
            }],
            vk::Fence::null(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc as StdArc,
    };

    #[test]
    fn callbacks_run_in_submission_order() {
        let worker = CallbackWorker::new("test-worker").unwrap();
        let order = StdArc::new(Mutex::new(Vec::new()));

        for i in 0..64 {
            let order = order.clone();
            worker.enqueue(move || order.lock().push(i));
        }
        drop(worker);

        let order = order.lock();
        assert_eq!(order.len(), 64);
        assert!(order.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn dropping_worker_drains_pending_callbacks() {
        let worker = CallbackWorker::new("test-worker").unwrap();
        let counter = StdArc::new(AtomicUsize::new(0));

        for _ in 0..128 {
            let counter = counter.clone();
            worker.enqueue(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        drop(worker);

        assert_eq!(counter.load(Ordering::Relaxed), 128);
    }
}
