/*! Stable, application-visible back buffers. These outlive the GPU
 * swapchain images by design: the application renders into a back
 * buffer at its leisure, and each present blits it onto whatever
 * swapchain image the WSI hands out.
 */

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use anyhow::{bail, Result};
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};

use crate::{device::Device, format, types::SwapChainDesc, MAX_SWAP_CHAIN_BUFFERS};

/// One user back-buffer slot. The facade's `Arc` is the private
/// reference; `public_refs` counts the handles the application holds,
/// which is what gates property changes.
pub(crate) struct BackBuffer {
    pub(crate) raw: vk::Image,
    allocation: Option<Allocation>,
    pub(crate) view: vk::ImageView,
    pub(crate) format: vk::Format,
    pub(crate) extent: vk::Extent2D,
    public_refs: AtomicU32,
    needs_initial_transition: AtomicBool,
    device: Arc<Device>,
}

impl BackBuffer {
    pub(crate) fn has_public_refs(&self) -> bool {
        self.public_refs.load(Ordering::Acquire) != 0
    }

    /// True until the application reports its first render through
    /// [`BackBufferImage::mark_rendered`]. Presenting such a buffer is
    /// valid; the blit is replaced by a clear.
    pub(crate) fn never_rendered(&self) -> bool {
        self.needs_initial_transition.load(Ordering::Relaxed)
    }
}

impl Drop for BackBuffer {
    fn drop(&mut self) {
        let allocation = self.allocation.take().unwrap();
        unsafe {
            self.device.raw.destroy_image_view(self.view, None);
            self.device.raw.destroy_image(self.raw, None);
        }
        if let Err(e) = self.device.allocator.lock().free(allocation) {
            log::error!("Failed to free back buffer allocation: {e:#}");
        }
    }
}

/// Public handle to a back buffer. Cloning and dropping maintain the
/// public reference count that [`crate::SwapChain::change_properties`]
/// checks.
///
/// The presentation blit samples the image in
/// `SHADER_READ_ONLY_OPTIMAL`; the application must leave it in that
/// layout before presenting the slot.
pub struct BackBufferImage {
    buffer: Arc<BackBuffer>,
}

impl BackBufferImage {
    pub(crate) fn new(buffer: Arc<BackBuffer>) -> Self {
        buffer.public_refs.fetch_add(1, Ordering::AcqRel);
        Self { buffer }
    }

    pub fn raw(&self) -> vk::Image {
        self.buffer.raw
    }

    pub fn view(&self) -> vk::ImageView {
        self.buffer.view
    }

    pub fn format(&self) -> vk::Format {
        self.buffer.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.buffer.extent
    }

    /// Tells the presentation machinery that the buffer now holds
    /// defined contents. Before the first render, presents of this
    /// buffer clear the screen instead of sampling garbage.
    pub fn mark_rendered(&self) {
        self.buffer
            .needs_initial_transition
            .store(false, Ordering::Relaxed);
    }
}

impl Clone for BackBufferImage {
    fn clone(&self) -> Self {
        Self::new(self.buffer.clone())
    }
}

impl Drop for BackBufferImage {
    fn drop(&mut self) {
        self.buffer.public_refs.fetch_sub(1, Ordering::AcqRel);
    }
}

fn allocate_user_buffer(device: &Arc<Device>, desc: &SwapChainDesc) -> Result<Arc<BackBuffer>> {
    let vk_format = format::vk_format(desc.format);
    let extent = vk::Extent3D {
        width: desc.width,
        height: desc.height,
        depth: 1,
    };

    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk_format)
        .extent(extent)
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let raw = unsafe { device.raw.create_image(&create_info, None)? };
    let requirements = unsafe { device.raw.get_image_memory_requirements(raw) };

    let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
        name: "user backbuffer",
        requirements,
        location: MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.raw.destroy_image(raw, None) };
            return Err(e.into());
        }
    };

    unsafe {
        device
            .raw
            .bind_image_memory(raw, allocation.memory(), allocation.offset())?;
    }

    let subresource_range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1);
    let view_create_info = vk::ImageViewCreateInfo::default()
        .image(raw)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(vk_format)
        .subresource_range(subresource_range);
    let view = unsafe { device.raw.create_image_view(&view_create_info, None)? };

    Ok(Arc::new(BackBuffer {
        raw,
        allocation: Some(allocation),
        view,
        format: vk_format,
        extent: vk::Extent2D {
            width: desc.width,
            height: desc.height,
        },
        public_refs: AtomicU32::new(0),
        needs_initial_transition: AtomicBool::new(true),
        device: device.clone(),
    }))
}

/// Replaces `buffers` with freshly allocated slots matching `desc`.
/// On failure the old slots are kept untouched so the caller can roll
/// the descriptor back.
pub(crate) fn reallocate_user_buffers(
    device: &Arc<Device>,
    desc: &SwapChainDesc,
    buffers: &mut Vec<Arc<BackBuffer>>,
) -> Result<()> {
    if desc.buffer_count as usize > MAX_SWAP_CHAIN_BUFFERS || desc.buffer_count == 0 {
        bail!("Invalid buffer count {}", desc.buffer_count);
    }

    let new_buffers = (0..desc.buffer_count)
        .map(|_| allocate_user_buffer(device, desc))
        .collect::<Result<Vec<_>>>()?;

    *buffers = new_buffers;
    Ok(())
}
