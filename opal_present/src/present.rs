/*! Worker-side presentation state machine. Everything in this module
 * runs on the command queue's worker thread; errors are absorbed so the
 * client-facing completion signals (present counter, blit counter,
 * latency token) stay live even when the GPU side goes sideways.
 */

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use ash::vk;

use crate::{
    format,
    meta::SwapchainPipelineKey,
    queue::QueueSubmitSemaphoreDescriptor,
    surface,
    swapchain::SwapChain,
    sync::{Fence, Semaphore, SemaphoreType},
    types::{ColorSpace, HdrMetadata, HdrMetadataType, ImageFormat, ScalingMode},
    MAX_SWAP_CHAIN_BUFFERS,
};

/// One entry of the request ring. Stamped by the client thread, read by
/// the worker; the queue hand-off orders the two.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PresentRequest {
    pub(crate) user_index: u32,
    pub(crate) format: ImageFormat,
    pub(crate) color_space: ColorSpace,
    pub(crate) hdr_metadata: HdrMetadata,
    pub(crate) modifies_hdr_metadata: bool,
    pub(crate) swap_interval: u32,
}

impl Default for PresentRequest {
    fn default() -> Self {
        Self {
            user_index: 0,
            format: ImageFormat::default(),
            color_space: ColorSpace::default(),
            hdr_metadata: HdrMetadata::default(),
            modifies_hdr_metadata: false,
            swap_interval: 0,
        }
    }
}

/// Anything that changes what the GPU swapchain must look like forces a
/// recreate before the request is processed. Only the truth value of
/// the swap interval matters; FIFO with two repeats and FIFO with one
/// share a swapchain.
pub(crate) fn needs_swapchain_recreation(
    request: &PresentRequest,
    last_request: &PresentRequest,
) -> bool {
    request.color_space != last_request.color_space
        || request.format != last_request.format
        || (request.swap_interval != 0) != (last_request.swap_interval != 0)
}

/// Short-lived GPU swapchain state, recreated on resize, format change
/// or anything the WSI flags as out of date.
pub(crate) struct GpuSwapchain {
    pub(crate) raw: vk::SwapchainKHR,
    pub(crate) images: Vec<vk::Image>,
    pub(crate) views: Vec<vk::ImageView>,
    pub(crate) extent: vk::Extent2D,
    pub(crate) format: vk::Format,
    pub(crate) pipeline: crate::meta::SwapchainPipeline,
}

/// Worker-owned presentation state. The per-image command buffers and
/// blit fences outlive individual swapchains; release semaphores are
/// torn down with the swapchain they were last used with.
pub(crate) struct PresentState {
    pub(crate) request: PresentRequest,
    pub(crate) swapchain: Option<GpuSwapchain>,
    pub(crate) command_pool: Option<vk::CommandPool>,
    pub(crate) blit_command_buffers: Vec<Option<vk::CommandBuffer>>,
    pub(crate) blit_fences: Vec<Option<Fence>>,
    pub(crate) release_semaphores: Vec<Option<Semaphore>>,
    pub(crate) acquire_fence: Fence,

    pub(crate) blit_count: u64,
    pub(crate) frame_latency_count: u64,
    pub(crate) present_id: u64,
    pub(crate) present_id_valid: bool,
    pub(crate) present_count: u32,

    pub(crate) force_swapchain_recreation: bool,
    pub(crate) is_surface_lost: bool,
}

impl PresentState {
    pub(crate) fn new(acquire_fence: Fence) -> Self {
        Self {
            request: PresentRequest::default(),
            swapchain: None,
            command_pool: None,
            blit_command_buffers: (0..MAX_SWAP_CHAIN_BUFFERS).map(|_| None).collect(),
            blit_fences: (0..MAX_SWAP_CHAIN_BUFFERS).map(|_| None).collect(),
            release_semaphores: (0..MAX_SWAP_CHAIN_BUFFERS).map(|_| None).collect(),
            acquire_fence,
            blit_count: 0,
            frame_latency_count: 0,
            present_id: 0,
            present_id_valid: false,
            present_count: 0,
            force_swapchain_recreation: false,
            is_surface_lost: false,
        }
    }
}

enum IterationOutcome {
    Done,
    Retry,
}

fn report_breadcrumb(result: vk::Result) {
    if result == vk::Result::ERROR_DEVICE_LOST {
        log::error!("Device lost observed on the present worker");
    }
}

impl SwapChain {
    /// Entry point of every enqueued present. Pops the next request off
    /// the ring, runs the present iterations, then publishes the
    /// completion signals in a fixed order: blit counter first (drains
    /// depend on it), latency token second, present counter last.
    pub(crate) fn present_callback(&self) {
        let mut guard = self.present.lock();
        let state = &mut *guard;

        let next_present_count = state.present_count.wrapping_add(1);
        let next_request =
            *self.request_ring[next_present_count as usize % MAX_SWAP_CHAIN_BUFFERS].lock();
        if needs_swapchain_recreation(&next_request, &state.request) {
            state.force_swapchain_recreation = true;
        }
        state.request = next_request;

        if state.request.modifies_hdr_metadata {
            self.push_hdr_metadata(state);
        }

        /* If no queue present successfully commits a present ID, fall
         * back to a plain queue signal for this request. */
        state.present_id_valid = false;

        // No reliable present timing exists, a swap interval above one
        // simply duplicates the present. This runs on a worker thread,
        // the blocking is acceptable.
        let iterations = state.request.swap_interval.max(1);
        for _ in 0..iterations {
            self.present_iteration(state);
        }

        self.signal_blit_timeline(state);
        self.signal_waitable_handle(state);

        state.present_count = next_present_count;
        self.presented_count
            .store(next_present_count, Ordering::Release);
    }

    /// One present attempt with bounded recovery: every OUT_OF_DATE
    /// observed on acquire or present buys one recreate-then-retry,
    /// at most three per iteration. Anything that cannot make forward
    /// progress is abandoned until the next request.
    fn present_iteration(&self, state: &mut PresentState) {
        let mut retry_counter = 0;
        loop {
            match self.try_present_once(state) {
                IterationOutcome::Retry if retry_counter < 3 => retry_counter += 1,
                _ => break,
            }
        }
    }

    fn try_present_once(&self, state: &mut PresentState) -> IterationOutcome {
        if state.swapchain.is_none() || state.force_swapchain_recreation {
            self.recreate_swapchain(state);
        }
        let (raw_swapchain, swapchain_extent) = match &state.swapchain {
            Some(swapchain) => (swapchain.raw, swapchain.extent),
            None => return IterationOutcome::Done,
        };
        let device = self.queue.device();

        // Acquire signals a fence, never a semaphore. The worker wants
        // synchronous semantics, and binary acquire semaphores would
        // have to be retired with extra submits to stay valid across
        // resize and retry.
        let acquire = unsafe {
            device.swapchain_fns.acquire_next_image(
                raw_swapchain,
                u64::MAX,
                vk::Semaphore::null(),
                state.acquire_fence.raw,
            )
        };
        let (swapchain_index, acquire_result) = match acquire {
            Ok((index, false)) => (index, vk::Result::SUCCESS),
            Ok((index, true)) => (index, vk::Result::SUBOPTIMAL_KHR),
            Err(result) => (0, result),
        };
        report_breadcrumb(acquire_result);

        if acquire_result.as_raw() >= 0 {
            if let Err(e) = state.acquire_fence.wait_and_reset() {
                log::error!("Failed to wait for acquire fence: {e:#}");
            }
        }

        if let Some(outcome) = self.classify_wsi_result(state, acquire_result) {
            return outcome;
        }

        if let Err(e) = self.submit_blit(state, swapchain_index, swapchain_extent) {
            log::error!("Failed to submit swapchain blit: {e:#}");
            return IterationOutcome::Done;
        }

        let release_semaphore_raw = state.release_semaphores[swapchain_index as usize]
            .as_ref()
            .unwrap()
            .raw;
        let wait_semaphores = [release_semaphore_raw];
        let swapchains = [raw_swapchain];
        let image_indices = [swapchain_index];
        let present_ids;
        let mut present_id_info;
        let mut present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let attach_present_id = self.waiter.is_some() && !state.present_id_valid;
        if attach_present_id {
            state.present_id += 1;
            present_ids = [state.present_id];
            present_id_info = vk::PresentIdKHR::default().present_ids(&present_ids);
            present_info = present_info.push_next(&mut present_id_info);
        }

        let present_result = {
            let queue = self.queue.lock();
            unsafe { device.swapchain_fns.queue_present(*queue, &present_info) }
        };
        let present_result = match present_result {
            Ok(false) => vk::Result::SUCCESS,
            Ok(true) => vk::Result::SUBOPTIMAL_KHR,
            Err(result) => result,
        };
        report_breadcrumb(present_result);

        /* The present wait mechanism is only trusted for FIFO. Under
         * IMMEDIATE or MAILBOX present IDs have been observed to behave
         * unreliably, and precise latency signaling does not matter for
         * tearing modes anyway. */
        if attach_present_id
            && present_result.as_raw() >= 0
            && state.request.swap_interval >= 1
        {
            state.present_id_valid = true;
        }

        self.classify_wsi_result(state, present_result)
            .unwrap_or(IterationOutcome::Done)
    }

    /// Shared acquire/present result handling. `None` means the caller
    /// may continue with this image.
    fn classify_wsi_result(
        &self,
        state: &mut PresentState,
        result: vk::Result,
    ) -> Option<IterationOutcome> {
        if result == vk::Result::SUBOPTIMAL_KHR || result.as_raw() < 0 {
            state.force_swapchain_recreation = true;
        }
        if result.as_raw() < 0 {
            self.destroy_swapchain(state);
        }

        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Some(IterationOutcome::Retry),
            vk::Result::ERROR_SURFACE_LOST_KHR => {
                // No forward progress can be expected anymore. Keep
                // draining requests, just render to nothing.
                state.is_surface_lost = true;
                Some(IterationOutcome::Done)
            }
            result if result.as_raw() < 0 => Some(IterationOutcome::Done),
            _ => None,
        }
    }

    pub(crate) fn destroy_swapchain(&self, state: &mut PresentState) {
        let Some(swapchain) = state.swapchain.take() else {
            return;
        };

        // A blit submit may have signaled a release semaphore that no
        // present ever waited on, so a full wait-idle is required
        // before the semaphores can go away.
        if let Err(e) = self.queue.wait_idle() {
            log::error!("Queue wait-idle failed before swapchain destruction: {e:#}");
        }
        if let Some(waiter) = &self.waiter {
            waiter.drain();
        }

        let device = self.queue.device();
        unsafe {
            for view in swapchain.views {
                device.raw.destroy_image_view(view, None);
            }
        }
        for semaphore in state.release_semaphores.iter_mut() {
            semaphore.take();
        }
        unsafe {
            device.swapchain_fns.destroy_swapchain(swapchain.raw, None);
        }

        state.force_swapchain_recreation = false;
        state.present_id_valid = false;
        state.present_id = 0;
    }

    fn recreate_swapchain(&self, state: &mut PresentState) {
        self.destroy_swapchain(state);

        // Don't bother once the surface is gone.
        if state.is_surface_lost {
            return;
        }

        let device = self.queue.device();
        let capabilities = match self.surface.capabilities() {
            Ok(capabilities) => capabilities,
            Err(e) => {
                log::warn!("Failed to query surface capabilities: {e:#}");
                return;
            }
        };

        let occluded = surface::max_extent_is_zero(&capabilities);
        self.occluded.store(occluded, Ordering::Relaxed);

        // Nothing to create, presents become no-ops until the window
        // comes back.
        if occluded {
            return;
        }

        if surface::current_extent_is_unspecified(&capabilities) {
            return;
        }

        // No format to present to yet. Happens in HDR transition states
        // where the color space changed before the user buffer format.
        let Some(surface_format) = format::select_surface_format(
            &self.surface.formats,
            state.request.format,
            state.request.color_space,
        ) else {
            return;
        };

        let present_modes = match self.surface.present_modes() {
            Ok(present_modes) => present_modes,
            Err(e) => {
                log::warn!("Failed to query surface present modes: {e:#}");
                return;
            }
        };
        let Some(present_mode) =
            format::select_present_mode(&present_modes, state.request.swap_interval)
        else {
            return;
        };

        let extent = surface::clamp_extent(&capabilities);

        // Presents never block on acquire through a semaphore, so there
        // is no reason to go below three images even if the application
        // asked for fewer user buffers.
        let min_image_count = capabilities.min_image_count.max(3);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.raw)
            .min_image_count(min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .present_mode(present_mode)
            .clipped(true);

        let raw = match unsafe { device.swapchain_fns.create_swapchain(&create_info, None) } {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("Failed to create swapchain: {e:?}");
                return;
            }
        };

        let destroy_partial = |views: &[vk::ImageView]| unsafe {
            for view in views {
                device.raw.destroy_image_view(*view, None);
            }
            device.swapchain_fns.destroy_swapchain(raw, None);
        };

        let images = match unsafe { device.swapchain_fns.get_swapchain_images(raw) } {
            Ok(images) => images,
            Err(e) => {
                log::error!("Failed to query swapchain images: {e:?}");
                destroy_partial(&[]);
                return;
            }
        };
        if images.len() > state.release_semaphores.len() {
            state
                .release_semaphores
                .resize_with(images.len(), || None);
            state
                .blit_command_buffers
                .resize_with(images.len(), || None);
            state.blit_fences.resize_with(images.len(), || None);
        }

        let mut views = Vec::with_capacity(images.len());
        for image in &images {
            let subresource_range = vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1);
            let view_info = vk::ImageViewCreateInfo::default()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(subresource_range);
            match unsafe { device.raw.create_image_view(&view_info, None) } {
                Ok(view) => views.push(view),
                Err(e) => {
                    log::error!("Failed to create swapchain image view: {e:?}");
                    destroy_partial(&views);
                    return;
                }
            }
        }

        if state.command_pool.is_none() {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(self.queue.family_index)
                .flags(
                    vk::CommandPoolCreateFlags::TRANSIENT
                        | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                );
            match unsafe { device.raw.create_command_pool(&pool_info, None) } {
                Ok(pool) => state.command_pool = Some(pool),
                Err(e) => {
                    log::error!("Failed to create blit command pool: {e:?}");
                    destroy_partial(&views);
                    return;
                }
            }
        }

        let scaling = self.user.lock().desc.scaling;
        let filter = if scaling == ScalingMode::None {
            vk::Filter::NEAREST
        } else {
            vk::Filter::LINEAR
        };
        let pipeline = match device.meta.swapchain_pipeline(SwapchainPipelineKey {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            filter,
            format: surface_format.format,
        }) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                log::error!("Failed to initialize swapchain pipeline: {e:#}");
                destroy_partial(&views);
                return;
            }
        };

        log::debug!(
            "Created swapchain {}x{}, format {:?}, present mode {:?}",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );

        state.swapchain = Some(GpuSwapchain {
            raw,
            images,
            views,
            extent,
            format: surface_format.format,
            pipeline,
        });

        self.push_hdr_metadata(state);
    }

    /// Records and submits the blit for one acquired image, signaling
    /// the per-image release semaphore and blit fence. Per-image
    /// objects are created on first use of the slot; the fence bounds
    /// the slot to a single in-flight blit.
    fn submit_blit(
        &self,
        state: &mut PresentState,
        swapchain_index: u32,
        swapchain_extent: vk::Extent2D,
    ) -> Result<()> {
        let device = self.queue.device().clone();
        let index = swapchain_index as usize;

        if state.release_semaphores[index].is_none() {
            state.release_semaphores[index] =
                Some(Semaphore::new(device.clone(), SemaphoreType::Binary)?);
        }

        if state.blit_command_buffers[index].is_none() {
            let allocate_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(state.command_pool.context("No blit command pool")?)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let buffers = unsafe { device.raw.allocate_command_buffers(&allocate_info)? };
            state.blit_command_buffers[index] = Some(buffers[0]);
        }

        match &state.blit_fences[index] {
            Some(fence) => fence
                .wait_and_reset()
                .context("Failed to recycle blit fence")?,
            None => state.blit_fences[index] = Some(Fence::new(device.clone())?),
        }

        let cmd = state.blit_command_buffers[index].unwrap();
        let swapchain = state.swapchain.as_ref().unwrap();

        unsafe {
            device
                .raw
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.raw.begin_command_buffer(cmd, &begin_info)?;
        }

        self.record_blit(
            cmd,
            swapchain.images[index],
            swapchain.views[index],
            swapchain_extent,
            swapchain.pipeline,
            &state.request,
        );

        unsafe {
            device.raw.end_command_buffer(cmd)?;
        }

        self.queue.submit_command_buffers(
            &[cmd],
            &[],
            &[QueueSubmitSemaphoreDescriptor {
                semaphore: state.release_semaphores[index].as_ref().unwrap(),
                stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                value: None,
            }],
            state.blit_fences[index].as_ref().unwrap().raw,
        )?;

        Ok(())
    }

    fn record_blit(
        &self,
        cmd: vk::CommandBuffer,
        swapchain_image: vk::Image,
        swapchain_view: vk::ImageView,
        swapchain_extent: vk::Extent2D,
        pipeline: crate::meta::SwapchainPipeline,
        request: &PresentRequest,
    ) {
        let device = self.queue.device();

        let (user_view, blank_present, scaling, user_extent) = {
            let user = self.user.lock();
            let backbuffer = &user.backbuffers[request.user_index as usize];
            (
                backbuffer.view,
                backbuffer.never_rendered(),
                user.desc.scaling,
                vk::Extent2D {
                    width: user.desc.width,
                    height: user.desc.height,
                },
            )
        };

        // Presenting before ever rendering to the buffer is valid, the
        // blit is skipped and the screen cleared instead.
        if blank_present {
            log::warn!(
                "Presenting user buffer {} before it has ever been rendered to",
                request.user_index
            );
        }

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);

        // srcStage is NONE since acquire synchronized through a fence.
        let to_color_attachment = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::NONE)
            .src_access_mask(vk::AccessFlags2::NONE)
            .dst_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .image(swapchain_image)
            .subresource_range(subresource_range);
        let dependency_info = vk::DependencyInfo::default()
            .image_memory_barriers(std::slice::from_ref(&to_color_attachment));
        unsafe { device.raw.cmd_pipeline_barrier2(cmd, &dependency_info) };

        let load_op = if scaling == ScalingMode::None || blank_present {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        };
        let attachment_info = vk::RenderingAttachmentInfo::default()
            .image_view(swapchain_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue::default());
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: swapchain_extent,
        };
        let rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&attachment_info));
        unsafe { device.raw.cmd_begin_rendering(cmd, &rendering_info) };

        if !blank_present {
            let viewport_extent = if scaling == ScalingMode::None {
                user_extent
            } else {
                swapchain_extent
            };
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: viewport_extent.width as f32,
                height: viewport_extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            unsafe {
                device.raw.cmd_set_viewport(cmd, 0, &[viewport]);
                device.raw.cmd_set_scissor(cmd, 0, &[render_area]);
                device
                    .raw
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            }

            let image_info = vk::DescriptorImageInfo::default()
                .image_view(user_view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            let write_info = vk::WriteDescriptorSet::default()
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(&image_info));
            unsafe {
                device.push_descriptor_fns.cmd_push_descriptor_set(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout,
                    0,
                    std::slice::from_ref(&write_info),
                );
                device.raw.cmd_draw(cmd, 3, 1, 0, 0);
            }
        }

        unsafe { device.raw.cmd_end_rendering(cmd) };

        let to_present = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::NONE)
            .dst_access_mask(vk::AccessFlags2::NONE)
            .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .image(swapchain_image)
            .subresource_range(subresource_range);
        let dependency_info = vk::DependencyInfo::default()
            .image_memory_barriers(std::slice::from_ref(&to_present));
        unsafe { device.raw.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    pub(crate) fn push_hdr_metadata(&self, state: &PresentState) {
        let device = self.queue.device();
        let Some(hdr_fns) = &device.hdr_metadata_fns else {
            return;
        };
        let Some(swapchain) = &state.swapchain else {
            return;
        };
        if state.request.hdr_metadata.ty != HdrMetadataType::Hdr10 {
            return;
        }

        let metadata = format::convert_hdr_metadata_hdr10(&state.request.hdr_metadata.hdr10);
        unsafe {
            hdr_fns.set_hdr_metadata(&[swapchain.raw], &[metadata]);
        }
    }

    /// Signaled exactly once per request, after all iterations; drains
    /// of the user buffers wait on this value.
    fn signal_blit_timeline(&self, state: &mut PresentState) {
        state.blit_count += 1;
        if let Err(e) = self.queue.signal_timeline(&self.blit_timeline, state.blit_count) {
            log::error!("Failed to signal blit counter: {e:#}");
            if let Some(result) = e.downcast_ref::<vk::Result>() {
                report_breadcrumb(*result);
            }
        }
    }

    /// Per-request latency policy: a committed present ID goes to the
    /// waiter thread; otherwise the latency fence is signaled at the
    /// queue tail and the watcher releases the token on completion.
    fn signal_waitable_handle(&self, state: &mut PresentState) {
        if state.present_id_valid {
            let swapchain_raw = state
                .swapchain
                .as_ref()
                .map(|swapchain| swapchain.raw)
                .unwrap_or(vk::SwapchainKHR::null());
            debug_assert_ne!(swapchain_raw, vk::SwapchainKHR::null());
            self.waiter
                .as_ref()
                .expect("present_id_valid requires an active waiter")
                .push(state.present_id, swapchain_raw);
        } else {
            state.frame_latency_count += 1;
            let value = MAX_SWAP_CHAIN_BUFFERS as u64 + state.frame_latency_count;
            match self.queue.signal_timeline(&self.latency_fence, value) {
                Ok(()) => {
                    if !self.fence_watcher.register(value) {
                        log::error!("Failed to enqueue frame latency event");
                        self.latency_event.release(1);
                    }
                }
                Err(e) => {
                    // Without the fence signal the watcher would never
                    // fire; release directly to preserve liveness.
                    log::error!("Failed to signal frame latency fence: {e:#}");
                    self.latency_event.release(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        format: ImageFormat,
        color_space: ColorSpace,
        swap_interval: u32,
    ) -> PresentRequest {
        PresentRequest {
            user_index: 0,
            format,
            color_space,
            hdr_metadata: HdrMetadata::default(),
            modifies_hdr_metadata: false,
            swap_interval,
        }
    }

    #[test]
    fn recreation_predicate_tracks_format_and_color_space() {
        let base = request(ImageFormat::Rgba8Unorm, ColorSpace::SrgbNonlinear, 1);
        assert!(!needs_swapchain_recreation(&base, &base));

        let format_changed = request(ImageFormat::Rgba16Float, ColorSpace::SrgbNonlinear, 1);
        assert!(needs_swapchain_recreation(&format_changed, &base));

        let space_changed = request(ImageFormat::Rgba8Unorm, ColorSpace::Hdr10St2084, 1);
        assert!(needs_swapchain_recreation(&space_changed, &base));
    }

    #[test]
    fn recreation_predicate_only_cares_about_interval_truthiness() {
        let fifo_one = request(ImageFormat::Rgba8Unorm, ColorSpace::SrgbNonlinear, 1);
        let fifo_two = request(ImageFormat::Rgba8Unorm, ColorSpace::SrgbNonlinear, 2);
        let immediate = request(ImageFormat::Rgba8Unorm, ColorSpace::SrgbNonlinear, 0);

        assert!(!needs_swapchain_recreation(&fifo_two, &fifo_one));
        assert!(needs_swapchain_recreation(&immediate, &fifo_one));
        assert!(needs_swapchain_recreation(&fifo_one, &immediate));
    }

    #[test]
    fn ring_indexing_wraps_with_the_counter() {
        let mut seen = Vec::new();
        let mut count: u32 = u32::MAX - 2;
        for _ in 0..6 {
            count = count.wrapping_add(1);
            seen.push(count as usize % MAX_SWAP_CHAIN_BUFFERS);
        }
        // Wraparound never aliases two outstanding slots as long as at
        // most MAX_SWAP_CHAIN_BUFFERS requests are in flight.
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), seen.len());
    }
}
