use std::collections::HashMap;
use std::ptr::NonNull;

use ash::vk;

use super::device::Device;
use super::error::{GPUError, Result};
use super::structs::{
    ClearValue, PipelineState, RenderTargetFormats, CullMode, FrontFace, PolygonMode,
    MAX_RENDER_TARGETS,
};

/// A compiled shader + fixed-function configuration, plus the render pass
/// and layout it was linked against.
pub struct Pipeline {
    pub(crate) raw: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) render_pass: vk::RenderPass,
    pub(crate) bind_point: vk::PipelineBindPoint,
    pub(crate) name: String,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_compute(&self) -> bool {
        self.bind_point == vk::PipelineBindPoint::COMPUTE
    }
}

/// Content-hash deduplicated pipeline objects. Entries are never evicted:
/// the distinct (shader, state) combinations a scene produces are assumed
/// small and stable, so the map is bounded in practice and only torn down
/// at device shutdown.
pub struct PipelineCache {
    device: NonNull<Device>,
    // Boxed for stable addresses; command lists hold raw pipeline pointers
    // across map growth.
    pipelines: HashMap<u64, Box<Pipeline>>,
}

impl PipelineCache {
    pub fn new(device: &mut Device) -> Self {
        Self {
            device: NonNull::from(device),
            pipelines: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    fn device(&self) -> &Device {
        unsafe { self.device.as_ref() }
    }

    /// Resolves attachment formats from the device's texture pool (and the
    /// target swapchain, if any) so hashing can stay pure.
    pub fn resolve_formats(&self, state: &PipelineState) -> Result<RenderTargetFormats> {
        let device = self.device();
        let mut formats = RenderTargetFormats::default();

        if let Some(sc) = state.swapchain {
            formats.colors[0] = Some(unsafe { sc.as_ref() }.format());
        }
        for (i, target) in state.render_targets.iter().enumerate() {
            if let Some(handle) = target {
                let tex = device
                    .texture(*handle)
                    .ok_or(GPUError::InvalidPipelineState("stale render target handle"))?;
                formats.colors[i] = Some(tex.format());
            }
        }
        if let Some(handle) = state.depth_target {
            let tex = device
                .texture(handle)
                .ok_or(GPUError::InvalidPipelineState("stale depth target handle"))?;
            formats.depth = Some(tex.format());
        }
        Ok(formats)
    }

    /// Finds or builds the pipeline for `state`. Transitions the state's
    /// render targets to attachment layouts first, recording barriers into
    /// `cmd`, so a fresh target is usable the first frame it appears.
    pub fn retrieve_pipeline(
        &mut self,
        cmd: vk::CommandBuffer,
        state: &PipelineState,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<NonNull<Pipeline>> {
        state.validate()?;

        let device = unsafe { self.device.as_mut() };
        for target in state.render_targets.iter().flatten() {
            device.transition_texture(cmd, *target, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;
        }
        if let Some(depth) = state.depth_target {
            device.transition_texture(
                cmd,
                depth,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )?;
        }

        let formats = self.resolve_formats(state)?;
        let hash = state.content_hash(&formats);

        if !self.pipelines.contains_key(&hash) {
            let pipeline = if state.is_compute() {
                self.make_compute_pipeline(state, set_layout)?
            } else {
                self.make_graphics_pipeline(state, &formats, set_layout)?
            };
            log::debug!("new pipeline '{}' ({:#x})", state.pass_name, hash);
            self.pipelines.insert(hash, Box::new(pipeline));
        }

        let pipeline = self.pipelines.get_mut(&hash).unwrap();
        Ok(NonNull::from(pipeline.as_mut()))
    }

    fn make_pipeline_layout(&self, set_layout: vk::DescriptorSetLayout) -> Result<vk::PipelineLayout> {
        let layouts = [set_layout];
        let info = if set_layout == vk::DescriptorSetLayout::null() {
            vk::PipelineLayoutCreateInfo::builder()
        } else {
            vk::PipelineLayoutCreateInfo::builder().set_layouts(&layouts)
        };
        let layout = unsafe { self.device().raw().create_pipeline_layout(&info, None)? };
        Ok(layout)
    }

    fn make_compute_pipeline(
        &self,
        state: &PipelineState,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<Pipeline> {
        let device = self.device();
        let shader = device
            .shader(state.compute_shader.unwrap())
            .ok_or(GPUError::InvalidPipelineState("stale compute shader handle"))?
            .clone();
        shader.wait_for_compilation()?;

        let layout = self.make_pipeline_layout(set_layout)?;
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module())
            .name(shader.entry_point())
            .build();
        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();

        let raw = unsafe {
            device
                .raw()
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| e)?
        }[0];

        device.set_name(raw, &state.pass_name);
        Ok(Pipeline {
            raw,
            layout,
            render_pass: vk::RenderPass::null(),
            bind_point: vk::PipelineBindPoint::COMPUTE,
            name: state.pass_name.clone(),
        })
    }

    fn make_render_pass(
        &self,
        state: &PipelineState,
        formats: &RenderTargetFormats,
    ) -> Result<vk::RenderPass> {
        let mut attachments = Vec::new();
        let mut color_refs = Vec::new();

        for i in 0..MAX_RENDER_TARGETS {
            let Some(format) = formats.colors[i] else { continue };
            let load_op = if state.clear_values[i].is_some() {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            };
            let final_layout = if i == 0 && state.targets_swapchain() {
                vk::ImageLayout::PRESENT_SRC_KHR
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            };
            color_refs.push(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            attachments.push(vk::AttachmentDescription {
                format: format.to_vk(),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: if load_op == vk::AttachmentLoadOp::CLEAR {
                    vk::ImageLayout::UNDEFINED
                } else {
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                },
                final_layout,
                ..Default::default()
            });
        }

        let depth_ref;
        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_format) = formats.depth {
            let load_op = if state.clear_depth.is_some() {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            };
            depth_ref = vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            };
            attachments.push(vk::AttachmentDescription {
                format: depth_format.to_vk(),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: if load_op == vk::AttachmentLoadOp::CLEAR {
                    vk::ImageLayout::UNDEFINED
                } else {
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                },
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            });
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }

        let subpasses = [subpass.build()];
        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses);
        let render_pass = unsafe { self.device().raw().create_render_pass(&info, None)? };
        Ok(render_pass)
    }

    fn make_graphics_pipeline(
        &self,
        state: &PipelineState,
        formats: &RenderTargetFormats,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<Pipeline> {
        let device = self.device();
        let vs = device
            .shader(state.vertex_shader.unwrap())
            .ok_or(GPUError::InvalidPipelineState("stale vertex shader handle"))?
            .clone();
        vs.wait_for_compilation()?;

        let mut stages = vec![vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vs.module())
            .name(vs.entry_point())
            .build()];

        let ps = match state.pixel_shader {
            Some(handle) => {
                let ps = device
                    .shader(handle)
                    .ok_or(GPUError::InvalidPipelineState("stale pixel shader handle"))?
                    .clone();
                ps.wait_for_compilation()?;
                Some(ps)
            }
            None => None,
        };
        if let Some(ps) = &ps {
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(ps.module())
                    .name(ps.entry_point())
                    .build(),
            );
        }

        let render_pass = self.make_render_pass(state, formats)?;
        let layout = self.make_pipeline_layout(set_layout)?;

        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: state.vertex_stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let vertex_input = if state.vertex_stride > 0 {
            vk::PipelineVertexInputStateCreateInfo::builder().vertex_binding_descriptions(&bindings)
        } else {
            vk::PipelineVertexInputStateCreateInfo::builder()
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(state.topology.to_vk());

        let viewports = [vk::Viewport {
            x: state.viewport.x,
            y: state.viewport.y,
            width: state.viewport.w,
            height: state.viewport.h,
            min_depth: state.viewport.min_depth,
            max_depth: state.viewport.max_depth,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D {
                x: state.scissor.x as i32,
                y: state.scissor.y as i32,
            },
            extent: vk::Extent2D {
                width: state.scissor.w,
                height: state.scissor.h,
            },
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        let raster = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(match state.rasterizer.polygon_mode {
                PolygonMode::Fill => vk::PolygonMode::FILL,
                PolygonMode::Line => vk::PolygonMode::LINE,
            })
            .cull_mode(match state.rasterizer.cull_mode {
                CullMode::None => vk::CullModeFlags::NONE,
                CullMode::Front => vk::CullModeFlags::FRONT,
                CullMode::Back => vk::CullModeFlags::BACK,
            })
            .front_face(match state.rasterizer.front_face {
                FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
                FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
            })
            .depth_clamp_enable(state.rasterizer.depth_clamp)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(state.depth_stencil.depth_test)
            .depth_write_enable(state.depth_stencil.depth_write)
            .depth_compare_op(state.depth_stencil.compare.to_vk());

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0..formats
            .color_count())
            .map(|_| vk::PipelineColorBlendAttachmentState {
                blend_enable: state.blend.enable as u32,
                src_color_blend_factor: state.blend.src_color.to_vk(),
                dst_color_blend_factor: state.blend.dst_color.to_vk(),
                color_blend_op: state.blend.color_op.to_vk(),
                src_alpha_blend_factor: state.blend.src_alpha.to_vk(),
                dst_alpha_blend_factor: state.blend.dst_alpha.to_vk(),
                alpha_blend_op: state.blend.alpha_op.to_vk(),
                color_write_mask: vk::ColorComponentFlags::RGBA,
            })
            .collect();
        let blend =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        // Viewport and scissor stay dynamic so a swapchain resize never
        // forces pipeline recreation.
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let raw = unsafe {
            device
                .raw()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| e)?
        }[0];

        device.set_name(raw, &state.pass_name);
        Ok(Pipeline {
            raw,
            layout,
            render_pass,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            name: state.pass_name.clone(),
        })
    }

    pub(crate) fn clear_values(state: &PipelineState, formats: &RenderTargetFormats) -> Vec<vk::ClearValue> {
        let mut out = Vec::new();
        for i in 0..MAX_RENDER_TARGETS {
            if formats.colors[i].is_none() {
                continue;
            }
            let color = match state.clear_values[i] {
                Some(ClearValue::Color(c)) => c,
                _ => [0.0; 4],
            };
            out.push(vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            });
        }
        if formats.depth.is_some() {
            let (depth, stencil) = match state.clear_depth {
                Some(ClearValue::DepthStencil { depth, stencil }) => (depth, stencil),
                _ => (1.0, 0),
            };
            out.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            });
        }
        out
    }

    pub fn destroy(mut self) {
        let device = unsafe { self.device.as_ref() };
        for (_, pipeline) in self.pipelines.drain() {
            unsafe {
                device.raw().destroy_pipeline(pipeline.raw, None);
                device.raw().destroy_pipeline_layout(pipeline.layout, None);
                if pipeline.render_pass != vk::RenderPass::null() {
                    device.raw().destroy_render_pass(pipeline.render_pass, None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::structs::Format;
    use crate::utils::Handle;

    #[test]
    fn clear_values_follow_attachment_order() {
        let mut state = PipelineState {
            vertex_shader: Some(Handle::from_raw(0, 0)),
            ..Default::default()
        };
        state.clear_values[0] = Some(ClearValue::Color([0.1, 0.2, 0.3, 1.0]));
        state.clear_depth = Some(ClearValue::DepthStencil {
            depth: 0.0,
            stencil: 1,
        });

        let formats = RenderTargetFormats {
            colors: [
                Some(Format::RGBA8Unorm),
                Some(Format::RGBA8Unorm),
                None,
                None,
                None,
                None,
                None,
                None,
            ],
            depth: Some(Format::D24S8),
        };

        let values = PipelineCache::clear_values(&state, &formats);
        assert_eq!(values.len(), 3);
        unsafe {
            assert_eq!(values[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            // Attachment 1 has no clear value configured; the placeholder is
            // ignored because its load op is LOAD.
            assert_eq!(values[1].color.float32, [0.0; 4]);
            assert_eq!(values[2].depth_stencil.depth, 0.0);
            assert_eq!(values[2].depth_stencil.stencil, 1);
        }
    }
}
