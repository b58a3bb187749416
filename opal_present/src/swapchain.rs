/*! The client-facing swap chain facade. All public operations run on
 * the application's thread; actual GPU work is handed to the command
 * queue's worker through the request ring.
 */

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::{
    device::Device,
    latency::{self, FenceEventWatcher},
    present::{PresentRequest, PresentState},
    queue::CommandQueue,
    resource::{self, BackBuffer, BackBufferImage},
    surface::{self, Surface},
    sync::{Fence, LatencySemaphore, Semaphore, SemaphoreType},
    types::{
        ColorSpace, HdrMetadata, PresentFlags, PresentStatus, SwapChainDesc, SwapChainFlags,
    },
    waiter::WaiterThread,
    SwapChainError, MAX_SWAP_CHAIN_BUFFERS,
};

/// Scaling alone never forces reallocation; the new descriptor is
/// still recorded so the next swapchain epoch picks the filter up.
fn desc_change_is_noop(old_desc: &SwapChainDesc, desc: &SwapChainDesc) -> bool {
    old_desc.width == desc.width
        && old_desc.height == desc.height
        && old_desc.buffer_count == desc.buffer_count
        && old_desc.format == desc.format
        && old_desc.flags == desc.flags
}

/// Client-owned state. The worker only touches it in two short, well
/// defined reads (back-buffer view and scaling during the blit), both
/// of which are ordered against mutation by the drain protocol.
pub(crate) struct UserState {
    pub(crate) desc: SwapChainDesc,
    pub(crate) backbuffers: Vec<Arc<BackBuffer>>,
    pub(crate) index: u32,
    pub(crate) present_count: u32,
    pub(crate) blit_count: u64,
    pub(crate) frame_latency: u32,
    pub(crate) color_space: ColorSpace,
    pub(crate) hdr_metadata: HdrMetadata,
    pub(crate) modifies_hdr_metadata: bool,
}

pub struct SwapChain {
    pub(crate) queue: Arc<CommandQueue>,
    pub(crate) surface: Surface,

    pub(crate) user: Mutex<UserState>,
    pub(crate) present: Mutex<PresentState>,
    pub(crate) request_ring: Vec<Mutex<PresentRequest>>,

    /// Worker-release / client-acquire mirror of the processed request
    /// count; equality with the user counter means the worker is idle.
    pub(crate) presented_count: AtomicU32,
    pub(crate) occluded: AtomicBool,

    pub(crate) latency_event: Arc<LatencySemaphore>,
    pub(crate) blit_timeline: Semaphore,
    pub(crate) latency_fence: Arc<Semaphore>,
    pub(crate) fence_watcher: FenceEventWatcher,
    pub(crate) waiter: Option<WaiterThread>,
}

impl SwapChain {
    pub fn new(
        queue: Arc<CommandQueue>,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        desc: SwapChainDesc,
    ) -> Result<Arc<Self>> {
        if desc.buffer_count == 0 || desc.buffer_count as usize > MAX_SWAP_CHAIN_BUFFERS {
            bail!("Invalid buffer count {}", desc.buffer_count);
        }

        let device = queue.device().clone();

        let mut backbuffers = Vec::new();
        resource::reallocate_user_buffers(&device, &desc, &mut backbuffers)?;

        let surface = Surface::new(device.clone(), display_handle, window_handle)?;

        let blit_timeline = Semaphore::new(device.clone(), SemaphoreType::Timeline)?;
        let latency_fence = Arc::new(Semaphore::new_with_value(
            device.clone(),
            SemaphoreType::Timeline,
            MAX_SWAP_CHAIN_BUFFERS as u64,
        )?);
        let acquire_fence = Fence::new(device.clone())?;

        let frame_latency = latency::initial_frame_latency(desc.flags);
        let latency_event = Arc::new(LatencySemaphore::new(
            frame_latency,
            MAX_SWAP_CHAIN_BUFFERS as u32,
        ));
        let fence_watcher = FenceEventWatcher::spawn(latency_fence.clone(), latency_event.clone())?;
        let waiter = WaiterThread::spawn(device.clone(), latency_event.clone());

        let request_ring = (0..MAX_SWAP_CHAIN_BUFFERS)
            .map(|_| Mutex::new(PresentRequest::default()))
            .collect();

        Ok(Arc::new(Self {
            queue,
            surface,
            user: Mutex::new(UserState {
                desc,
                backbuffers,
                index: 0,
                present_count: 0,
                blit_count: 0,
                frame_latency,
                color_space: ColorSpace::default(),
                hdr_metadata: HdrMetadata::default(),
                modifies_hdr_metadata: false,
            }),
            present: Mutex::new(PresentState::new(acquire_fence)),
            request_ring,
            presented_count: AtomicU32::new(0),
            occluded: AtomicBool::new(false),
            latency_event,
            blit_timeline,
            latency_fence,
            fence_watcher,
            waiter,
        }))
    }

    pub fn desc(&self) -> SwapChainDesc {
        self.user.lock().desc
    }

    pub fn device(&self) -> &Arc<Device> {
        self.queue.device()
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Returns a public reference to user slot `index`. Property
    /// changes are refused while any such reference is alive.
    pub fn image(&self, index: u32) -> Result<BackBufferImage, SwapChainError> {
        let user = self.user.lock();
        if index >= user.desc.buffer_count {
            return Err(SwapChainError::InvalidArgument);
        }
        Ok(BackBufferImage::new(user.backbuffers[index as usize].clone()))
    }

    /// The slot the application should render to next.
    pub fn image_index(&self) -> u32 {
        self.user.lock().index
    }

    pub fn frame_latency(&self) -> u32 {
        self.user.lock().frame_latency
    }

    /// The frame latency waitable. Every handle refers to the same
    /// semaphore; the application blocks on it to pace itself when the
    /// waitable flag is set.
    pub fn frame_latency_waitable(&self) -> Arc<LatencySemaphore> {
        self.latency_event.clone()
    }

    /// Only legal on waitable swap chains with `1 ..= MAX` requested.
    /// Raising the latency releases the difference immediately;
    /// lowering it leaves reclaiming the extra tokens to the
    /// application.
    pub fn set_frame_latency(&self, max_latency: u32) -> Result<(), SwapChainError> {
        if max_latency == 0 || max_latency as usize > MAX_SWAP_CHAIN_BUFFERS {
            log::warn!("Invalid maximum frame latency {max_latency}");
            return Err(SwapChainError::InvalidCall);
        }

        let mut user = self.user.lock();
        if !user.desc.flags.contains(SwapChainFlags::FRAME_LATENCY_WAITABLE) {
            log::warn!("Frame latency requires the latency waitable flag");
            return Err(SwapChainError::InvalidCall);
        }

        let release = latency::frame_latency_release_units(max_latency, user.frame_latency);
        if release > 0 {
            self.latency_event.release(release);
        }
        user.frame_latency = max_latency;
        Ok(())
    }

    fn present_worker_is_idle(&self) -> bool {
        let presented_count = self.presented_count.load(Ordering::Acquire);
        presented_count == self.user.lock().present_count
    }

    /// With the worker idle the surface can be queried directly and the
    /// cached state refreshed. With requests pending, touching the
    /// surface from this thread would race the worker, so report the
    /// worker's most recent observation instead.
    fn present_is_occluded(&self) -> bool {
        if self.present_worker_is_idle() {
            let occluded = self
                .surface
                .capabilities()
                .map(|capabilities| surface::max_extent_is_zero(&capabilities))
                .unwrap_or(false);
            self.occluded.store(occluded, Ordering::Relaxed);
            occluded
        } else {
            self.occluded.load(Ordering::Relaxed)
        }
    }

    /// Stamps a request into the ring and hands it to the worker. On
    /// the default-latency path this blocks until a latency token is
    /// available, which is what bounds the outstanding requests.
    pub fn present(self: &Arc<Self>, sync_interval: u32, flags: PresentFlags) -> PresentStatus {
        if self.present_is_occluded() {
            return PresentStatus::Occluded;
        }
        if flags.contains(PresentFlags::TEST) {
            return PresentStatus::Presented;
        }

        let wait_for_latency = {
            let mut user = self.user.lock();
            debug_assert!(user.index < user.desc.buffer_count);

            // The worker keeps a matching counter and picks the request
            // up from the same ring slot.
            user.present_count = user.present_count.wrapping_add(1);
            let slot = user.present_count as usize % MAX_SWAP_CHAIN_BUFFERS;
            *self.request_ring[slot].lock() = PresentRequest {
                user_index: user.index,
                format: user.desc.format,
                color_space: user.color_space,
                hdr_metadata: user.hdr_metadata,
                modifies_hdr_metadata: user.modifies_hdr_metadata,
                swap_interval: sync_interval,
            };
            user.modifies_hdr_metadata = false;

            user.blit_count += 1;

            !user.desc.flags.contains(SwapChainFlags::FRAME_LATENCY_WAITABLE)
        };

        let chain = self.clone();
        self.queue.enqueue(move || chain.present_callback());

        if wait_for_latency {
            self.latency_event.acquire();
        }

        let mut user = self.user.lock();
        let buffer_count = user.desc.buffer_count;
        user.index = (user.index + 1) % buffer_count;

        PresentStatus::Presented
    }

    /// Replaces the descriptor. Refused while the application holds
    /// back-buffer references. A change that leaves geometry, format,
    /// count and flags untouched records the new descriptor without
    /// reallocating. On allocation failure the old descriptor and
    /// buffers stay in place. Node masks are accepted for interface
    /// parity with multi-adapter clients and ignored.
    pub fn change_properties(
        &self,
        desc: &SwapChainDesc,
        _node_masks: Option<&[u32]>,
    ) -> Result<(), SwapChainError> {
        if desc.buffer_count == 0 || desc.buffer_count as usize > MAX_SWAP_CHAIN_BUFFERS {
            return Err(SwapChainError::InvalidArgument);
        }

        let (old_desc, drain_target) = {
            let mut user = self.user.lock();
            for backbuffer in &user.backbuffers {
                if backbuffer.has_public_refs() {
                    return Err(SwapChainError::InvalidCall);
                }
            }

            let old_desc = user.desc;
            user.desc = *desc;

            if desc_change_is_noop(&old_desc, desc) {
                return Ok(());
            }

            (old_desc, user.blit_count)
        };

        // Wait for every outstanding present, including the blit work,
        // before the buffers it may sample go away.
        if let Err(e) = self.blit_timeline.wait_value(drain_target) {
            log::error!("Failed to drain outstanding presents: {e:#}");
        }

        let device = self.queue.device().clone();
        let mut user = self.user.lock();
        let UserState {
            desc: user_desc,
            backbuffers,
            index,
            ..
        } = &mut *user;

        if let Err(e) = resource::reallocate_user_buffers(&device, desc, backbuffers) {
            *user_desc = old_desc;
            return Err(SwapChainError::Allocation(e));
        }

        if *index >= desc.buffer_count {
            // The buffer count may have been lowered. It is unclear if
            // resetting is always allowed; employ least surprise.
            *index = 0;
        }

        Ok(())
    }

    pub fn check_color_space_support(&self, color_space: ColorSpace) -> bool {
        self.surface.supports_color_space(color_space)
    }

    /// Records the color space on the client side; the swapchain picks
    /// it up with the next present. The descriptor is unaffected.
    pub fn set_color_space(&self, color_space: ColorSpace) -> Result<(), SwapChainError> {
        if !self.surface.supports_color_space(color_space) {
            return Err(SwapChainError::InvalidArgument);
        }

        let mut user = self.user.lock();
        user.color_space = color_space;
        user.modifies_hdr_metadata = true;
        Ok(())
    }

    pub fn set_hdr_metadata(&self, metadata: HdrMetadata) {
        let mut user = self.user.lock();
        user.hdr_metadata = metadata;
        user.modifies_hdr_metadata = true;
    }

    pub fn set_present_region(&self, _region: Option<&ash::vk::Rect2D>) -> Result<(), SwapChainError> {
        Err(SwapChainError::NotImplemented)
    }

    pub fn set_gamma_control(&self, _control_points: &[[f32; 3]]) -> Result<(), SwapChainError> {
        Err(SwapChainError::NotImplemented)
    }
}

impl Drop for SwapChain {
    /// Teardown order matters: quiesce the queue, stop the waiter with
    /// the sentinel, then destroy GPU objects. Worker callbacks hold
    /// strong references, so no callback can still be in flight here.
    fn drop(&mut self) {
        if let Err(e) = self.queue.wait_idle() {
            log::error!("Queue drain failed during teardown: {e:#}");
        }

        if let Some(waiter) = self.waiter.take() {
            waiter.shutdown();
        }

        let mut state = self.present.lock();
        self.destroy_swapchain(&mut state);

        let device = self.queue.device();
        if let Some(pool) = state.command_pool.take() {
            // Frees the per-image blit command buffers with it.
            for command_buffer in state.blit_command_buffers.iter_mut() {
                command_buffer.take();
            }
            unsafe {
                device.raw.destroy_command_pool(pool, None);
            }
        }

        log::trace!("Swap chain dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageFormat, ScalingMode};

    #[test]
    fn scaling_only_change_is_a_noop() {
        let old_desc = SwapChainDesc::new(1920, 1080, ImageFormat::Rgba8Unorm, 2);
        let new_desc = old_desc.scaling(ScalingMode::None);
        assert!(desc_change_is_noop(&old_desc, &new_desc));
    }

    #[test]
    fn geometry_format_count_and_flags_force_reallocation() {
        let base = SwapChainDesc::new(1920, 1080, ImageFormat::Rgba8Unorm, 2);

        let mut resized = base;
        resized.width = 1280;
        assert!(!desc_change_is_noop(&base, &resized));

        let mut reformatted = base;
        reformatted.format = ImageFormat::Rgba16Float;
        assert!(!desc_change_is_noop(&base, &reformatted));

        let mut recounted = base;
        recounted.buffer_count = 3;
        assert!(!desc_change_is_noop(&base, &recounted));

        let reflagged = base.flags(SwapChainFlags::FRAME_LATENCY_WAITABLE);
        assert!(!desc_change_is_noop(&base, &reflagged));
    }
}
