/*! Factory for the swapchain blit pipelines. Pipelines are keyed by
 * `{bind point, filter, format}` and cached for the device lifetime;
 * shader modules and per-filter layout objects are built lazily on the
 * first request.
 */

use std::collections::HashMap;

use anyhow::{bail, Result};
use ash::vk;
use parking_lot::Mutex;

use crate::shader::{self, ShaderStage};

const FULLSCREEN_VERT: &str = include_str!("../shaders/fullscreen.vert");
const SWAPCHAIN_BLIT_FRAG: &str = include_str!("../shaders/swapchain_blit.frag");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SwapchainPipelineKey {
    pub(crate) bind_point: vk::PipelineBindPoint,
    pub(crate) filter: vk::Filter,
    pub(crate) format: vk::Format,
}

/// Raw handles only; ownership stays with [`MetaOps`].
#[derive(Clone, Copy)]
pub(crate) struct SwapchainPipeline {
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
}

struct FilterObjects {
    sampler: vk::Sampler,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
}

#[derive(Default)]
struct MetaState {
    shaders: Option<(vk::ShaderModule, vk::ShaderModule)>,
    filters: HashMap<vk::Filter, FilterObjects>,
    pipelines: HashMap<SwapchainPipelineKey, SwapchainPipeline>,
}

pub(crate) struct MetaOps {
    device: ash::Device,
    state: Mutex<MetaState>,
}

impl MetaOps {
    pub(crate) fn new(device: ash::Device) -> Result<Self> {
        Ok(Self {
            device,
            state: Mutex::new(MetaState::default()),
        })
    }

    pub(crate) fn swapchain_pipeline(
        &self,
        key: SwapchainPipelineKey,
    ) -> Result<SwapchainPipeline> {
        if key.bind_point != vk::PipelineBindPoint::GRAPHICS {
            bail!("Unsupported pipeline bind point {:?}", key.bind_point);
        }

        let mut state = self.state.lock();
        if let Some(pipeline) = state.pipelines.get(&key) {
            return Ok(*pipeline);
        }

        let (vert, frag) = self.ensure_shaders(&mut state)?;
        let pipeline_layout = self.ensure_filter_objects(&mut state, key.filter)?;
        let pipeline = self.create_pipeline(vert, frag, pipeline_layout, key.format)?;

        let pipeline = SwapchainPipeline {
            pipeline,
            layout: pipeline_layout,
        };
        state.pipelines.insert(key, pipeline);
        Ok(pipeline)
    }

    fn ensure_shaders(
        &self,
        state: &mut MetaState,
    ) -> Result<(vk::ShaderModule, vk::ShaderModule)> {
        if let Some(shaders) = state.shaders {
            return Ok(shaders);
        }

        let vert_code = shader::compile_shader_source(FULLSCREEN_VERT, ShaderStage::Vertex)?;
        let frag_code = shader::compile_shader_source(SWAPCHAIN_BLIT_FRAG, ShaderStage::Fragment)?;

        let vert = unsafe {
            self.device
                .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&vert_code), None)?
        };
        let frag = unsafe {
            self.device
                .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&frag_code), None)?
        };

        state.shaders = Some((vert, frag));
        Ok((vert, frag))
    }

    /// Sampler, push-descriptor set layout and pipeline layout are
    /// shared across formats for a given filter.
    fn ensure_filter_objects(
        &self,
        state: &mut MetaState,
        filter: vk::Filter,
    ) -> Result<vk::PipelineLayout> {
        if let Some(objects) = state.filters.get(&filter) {
            return Ok(objects.pipeline_layout);
        }

        let sampler_info = vk::SamplerCreateInfo::default()
            .min_filter(filter)
            .mag_filter(filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE);
        let sampler = unsafe { self.device.create_sampler(&sampler_info, None)? };

        let immutable_samplers = [sampler];
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .immutable_samplers(&immutable_samplers)];
        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&bindings);
        let set_layout = unsafe {
            self.device
                .create_descriptor_set_layout(&set_layout_info, None)?
        };

        let set_layouts = [set_layout];
        let pipeline_layout_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let pipeline_layout = unsafe {
            self.device
                .create_pipeline_layout(&pipeline_layout_info, None)?
        };

        state.filters.insert(
            filter,
            FilterObjects {
                sampler,
                set_layout,
                pipeline_layout,
            },
        );
        Ok(pipeline_layout)
    }

    fn create_pipeline(
        &self,
        vert: vk::ShaderModule,
        frag: vk::ShaderModule,
        layout: vk::PipelineLayout,
        format: vk::Format,
    ) -> Result<vk::Pipeline> {
        let shader_entry_point_name = c"main";
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(ShaderStage::Vertex.to_vulkan_shader_stage_flag())
                .module(vert)
                .name(shader_entry_point_name),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(ShaderStage::Fragment.to_vulkan_shader_stage_flag())
                .module(frag)
                .name(shader_entry_point_name),
        ];

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic, only the counts matter.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&color_blend_attachments);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_attachment_formats = [format];
        let mut pipeline_rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_attachment_formats);

        let pipeline_create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .color_blend_state(&color_blend_state)
            .multisample_state(&multisample_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut pipeline_rendering_info);

        let pipeline = unsafe {
            self.device
                .create_graphics_pipelines(
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&pipeline_create_info),
                    None,
                )
                .map_err(|e| e.1)?[0]
        };

        Ok(pipeline)
    }

    /// Destroys every cached object. Must run before the device itself
    /// is destroyed.
    pub(crate) fn destroy(self) {
        let state = self.state.into_inner();
        unsafe {
            for (_, pipeline) in state.pipelines {
                self.device.destroy_pipeline(pipeline.pipeline, None);
            }
            for (_, objects) in state.filters {
                self.device
                    .destroy_pipeline_layout(objects.pipeline_layout, None);
                self.device
                    .destroy_descriptor_set_layout(objects.set_layout, None);
                self.device.destroy_sampler(objects.sampler, None);
            }
            if let Some((vert, frag)) = state.shaders {
                self.device.destroy_shader_module(vert, None);
                self.device.destroy_shader_module(frag, None);
            }
        }
    }
}
