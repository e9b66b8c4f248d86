use std::ptr::NonNull;

use ash::vk;

use super::descriptor_cache::DescriptorSetLayoutCache;
use super::device::Device;
use super::error::{GPUError, Result};
use super::pipeline::{Pipeline, PipelineCache};
use super::structs::{PipelineState, QueueType, RenderTargetFormats};
use super::sync::{Fence, Semaphore, SyncState};
use crate::utils::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandListState {
    #[default]
    Idle,
    Recording,
    Ended,
    Submitted,
}

/// Transition guard. Pure so the rejection matrix is testable without a
/// device.
pub(crate) fn ensure_state(
    actual: CommandListState,
    expected: CommandListState,
    op: &'static str,
) -> Result<()> {
    if actual != expected {
        return Err(GPUError::InvalidCommandListState { op, state: actual });
    }
    Ok(())
}

/// One recordable, submittable unit of GPU work, 1:1 with a swapchain slot
/// or an off-screen execution context.
///
/// Lifecycle: `Idle -> Recording -> Ended -> Submitted -> (wait) -> Idle`.
pub struct CommandList {
    pub(crate) state: CommandListState,
    pub(crate) cmd_buf: vk::CommandBuffer,
    pub(crate) fence: Handle<Fence>,
    /// Signaled by our submission; the swapchain presents against it.
    pub(crate) processed: Handle<Semaphore>,

    device: NonNull<Device>,
    descriptors: NonNull<DescriptorSetLayoutCache>,
    pipelines: NonNull<PipelineCache>,

    pipeline: Option<NonNull<Pipeline>>,
    pipeline_state: Option<PipelineState>,
    formats: RenderTargetFormats,

    render_pass_active: bool,
    pipeline_bound: bool,
    /// Set by `flush`, cleared only by a fresh `begin`. While set, draws
    /// skip their lazy setup because flush already performed it eagerly.
    flushed: bool,

    vertex_buffer_id: u64,
    index_buffer_id: u64,
    name: String,
}

impl CommandList {
    pub fn new(
        device: &mut Device,
        descriptors: &mut DescriptorSetLayoutCache,
        pipelines: &mut PipelineCache,
        name: &str,
    ) -> Result<Self> {
        let cmd_buf = device.allocate_command_buffer()?;
        let fence = device.make_fence()?;
        let processed = device.make_semaphore()?;
        device.set_name(cmd_buf, name);
        Ok(Self {
            state: CommandListState::Idle,
            cmd_buf,
            fence,
            processed,
            device: NonNull::from(device),
            descriptors: NonNull::from(descriptors),
            pipelines: NonNull::from(pipelines),
            pipeline: None,
            pipeline_state: None,
            formats: RenderTargetFormats::default(),
            render_pass_active: false,
            pipeline_bound: false,
            flushed: false,
            vertex_buffer_id: 0,
            index_buffer_id: 0,
            name: name.to_string(),
        })
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn processed_semaphore(&self) -> Handle<Semaphore> {
        self.processed
    }

    fn device(&mut self) -> &mut Device {
        unsafe { self.device.as_mut() }
    }

    fn cache(&mut self) -> &mut DescriptorSetLayoutCache {
        unsafe { self.descriptors.as_mut() }
    }

    pub fn begin(&mut self) -> Result<()> {
        match self.state {
            CommandListState::Submitted => self.wait()?,
            CommandListState::Idle => {}
            other => {
                return Err(GPUError::InvalidCommandListState {
                    op: "begin",
                    state: other,
                })
            }
        }

        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            let raw = self.device().raw().clone();
            raw.reset_command_buffer(self.cmd_buf, vk::CommandBufferResetFlags::empty())?;
            raw.begin_command_buffer(self.cmd_buf, &info)?;
        }

        self.state = CommandListState::Recording;
        self.flushed = false;
        self.render_pass_active = false;
        self.pipeline_bound = false;
        self.pipeline = None;
        self.vertex_buffer_id = 0;
        self.index_buffer_id = 0;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        ensure_state(self.state, CommandListState::Recording, "end")?;
        debug_assert!(
            !self.render_pass_active,
            "end called with a render pass still open"
        );
        let cmd_buf = self.cmd_buf;
        unsafe { self.device().raw().end_command_buffer(cmd_buf)? };
        self.state = CommandListState::Ended;
        Ok(())
    }

    /// Queues the recorded work. When the target swapchain has presentation
    /// disabled (minimized window) the submit is skipped entirely and the
    /// work counts as trivially done.
    pub fn submit(&mut self) -> Result<()> {
        ensure_state(self.state, CommandListState::Ended, "submit")?;

        let swapchain = self
            .pipeline_state
            .as_ref()
            .and_then(|s| s.swapchain)
            .map(|mut sc| unsafe { sc.as_mut() });

        if let Some(sc) = &swapchain {
            if !sc.presentation_enabled() {
                self.state = CommandListState::Submitted;
                return Ok(());
            }
        }

        let device = unsafe { self.device.as_mut() };

        // The acquired-image semaphore is only a valid wait if the GPU will
        // actually signal it, which host-side tracking mirrors as Signaled.
        let mut waits = Vec::new();
        if let Some(sc) = &swapchain {
            let acquired = sc.current_acquire_semaphore();
            if let Some(sem) = device.semaphore_mut(acquired) {
                if sem.state == SyncState::Signaled {
                    waits.push(sem.raw);
                    sem.state = SyncState::Idle;
                }
            }
        }

        let mut signals = Vec::new();
        if swapchain.is_some() {
            if let Some(sem) = device.semaphore_mut(self.processed) {
                debug_assert!(
                    sem.state == SyncState::Idle,
                    "processed semaphore reused before present consumed it"
                );
                signals.push(sem.raw);
                sem.state = SyncState::Signaled;
            }
        }

        device.reset_fence(self.fence)?;
        device.submit_raw(QueueType::Graphics, self.cmd_buf, &waits, &signals, self.fence)?;
        self.state = CommandListState::Submitted;
        Ok(())
    }

    /// Blocks until the fence signals, then releases per-frame descriptor
    /// work: deferred clears run and the pool grows if the last frame hit
    /// capacity.
    pub fn wait(&mut self) -> Result<()> {
        ensure_state(self.state, CommandListState::Submitted, "wait")?;
        let fence = self.fence;
        self.device().wait_fence(fence, u64::MAX)?;
        self.cache().clear_if_pending()?;
        self.cache().grow_if_needed()?;
        self.state = CommandListState::Idle;
        Ok(())
    }

    /// Synchronously drains this list, then restores whatever recording
    /// state the caller was in so mid-frame flushes are transparent.
    pub fn flush(&mut self) -> Result<()> {
        match self.state {
            CommandListState::Idle => return Ok(()),
            CommandListState::Submitted => return self.wait(),
            CommandListState::Ended => {
                self.submit()?;
                return self.wait();
            }
            CommandListState::Recording => {}
        }

        let had_render_pass = self.render_pass_active;
        let state = self.pipeline_state.clone();

        self.end_render_pass()?;
        self.end()?;
        self.submit()?;
        self.wait()?;

        self.begin()?;
        if had_render_pass {
            let state = state.ok_or(GPUError::InvalidPipelineState(
                "render pass active without a pipeline state",
            ))?;
            self.begin_render_pass(&state)?;
            // Re-arm eagerly; draws recorded after a flush skip lazy setup.
            self.prepare_draw()?;
        }
        self.flushed = true;
        Ok(())
    }

    /// Feeds `state` through both caches. The actual render pass begin is
    /// deferred to the first draw so empty passes cost nothing.
    pub fn begin_render_pass(&mut self, state: &PipelineState) -> Result<()> {
        ensure_state(self.state, CommandListState::Recording, "begin_render_pass")?;

        // A new pipeline invalidates the binding-skip optimization.
        self.vertex_buffer_id = 0;
        self.index_buffer_id = 0;

        self.cache().set_pipeline_state(state)?;
        let set_layout = self
            .cache()
            .current_layout()
            .map(|l| l.raw)
            .unwrap_or(vk::DescriptorSetLayout::null());

        let cmd = self.cmd_buf;
        let pipelines = unsafe { self.pipelines.as_mut() };
        let pipeline = pipelines.retrieve_pipeline(cmd, state, set_layout)?;
        self.formats = pipelines.resolve_formats(state)?;
        self.pipeline = Some(pipeline);
        self.pipeline_state = Some(state.clone());
        self.pipeline_bound = false;
        Ok(())
    }

    /// Idempotent; closing an already-closed pass is a no-op.
    pub fn end_render_pass(&mut self) -> Result<()> {
        if self.render_pass_active {
            unsafe {
                let raw = self.device().raw().clone();
                raw.cmd_end_render_pass(self.cmd_buf);
            }
            self.render_pass_active = false;
        }
        Ok(())
    }

    fn attachment_views_and_extent(&mut self) -> Result<(Vec<vk::ImageView>, vk::Extent2D, u64)> {
        let state = self
            .pipeline_state
            .as_ref()
            .ok_or(GPUError::InvalidPipelineState("no pipeline state set"))?
            .clone();
        let mut views = Vec::new();
        let mut extent = vk::Extent2D::default();
        let mut object_id = 0u64;

        if let Some(sc) = state.swapchain {
            let sc = unsafe { sc.as_ref() };
            views.push(sc.current_view());
            extent = sc.extent();
            object_id = sc.object_id();
        }
        let device = unsafe { self.device.as_ref() };
        for target in state.render_targets.iter().flatten() {
            let tex = device
                .texture(*target)
                .ok_or(GPUError::InvalidPipelineState("stale render target handle"))?;
            views.push(tex.view);
            extent = vk::Extent2D {
                width: tex.dim[0],
                height: tex.dim[1],
            };
        }
        if let Some(depth) = state.depth_target {
            let tex = device
                .texture(depth)
                .ok_or(GPUError::InvalidPipelineState("stale depth target handle"))?;
            views.push(tex.view);
            if extent.width == 0 {
                extent = vk::Extent2D {
                    width: tex.dim[0],
                    height: tex.dim[1],
                };
            }
        }
        Ok((views, extent, object_id))
    }

    /// The three lazy steps: open the deferred render pass, bind the
    /// pipeline, and bind/update the descriptor set.
    fn prepare_draw(&mut self) -> Result<()> {
        let pipeline = unsafe {
            self.pipeline
                .ok_or(GPUError::InvalidPipelineState("draw without a render pass"))?
                .as_ref()
        };
        let raw_device = unsafe { self.device.as_ref() }.raw().clone();
        let compute = pipeline.is_compute();

        if !self.render_pass_active && !compute {
            let (views, extent, object_id) = self.attachment_views_and_extent()?;
            let framebuffer = self.device().framebuffer(
                pipeline.render_pass,
                &views,
                extent,
                object_id,
            )?;
            let state = self.pipeline_state.as_ref().unwrap();
            let clear_values = PipelineCache::clear_values(state, &self.formats);
            let begin = vk::RenderPassBeginInfo::builder()
                .render_pass(pipeline.render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                })
                .clear_values(&clear_values);
            unsafe {
                raw_device.cmd_begin_render_pass(self.cmd_buf, &begin, vk::SubpassContents::INLINE)
            };
            self.render_pass_active = true;
        }

        if !self.pipeline_bound {
            unsafe {
                raw_device.cmd_bind_pipeline(self.cmd_buf, pipeline.bind_point, pipeline.raw);
            }
            if !compute {
                let state = self.pipeline_state.as_ref().unwrap();
                let viewport = vk::Viewport {
                    x: state.viewport.x,
                    y: state.viewport.y,
                    width: state.viewport.w,
                    height: state.viewport.h,
                    min_depth: state.viewport.min_depth,
                    max_depth: state.viewport.max_depth,
                };
                let scissor = vk::Rect2D {
                    offset: vk::Offset2D {
                        x: state.scissor.x as i32,
                        y: state.scissor.y as i32,
                    },
                    extent: vk::Extent2D {
                        width: state.scissor.w,
                        height: state.scissor.h,
                    },
                };
                unsafe {
                    raw_device.cmd_set_viewport(self.cmd_buf, 0, &[viewport]);
                    raw_device.cmd_set_scissor(self.cmd_buf, 0, &[scissor]);
                }
            }
            self.pipeline_bound = true;
        }

        if let Some(resolved) = self.cache().retrieve_descriptor_set()? {
            unsafe {
                raw_device.cmd_bind_descriptor_sets(
                    self.cmd_buf,
                    pipeline.bind_point,
                    pipeline.layout,
                    0,
                    &[resolved.set],
                    &resolved.dynamic_offsets,
                );
            }
        }
        Ok(())
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        ensure_state(self.state, CommandListState::Recording, "draw")?;
        if !self.flushed {
            self.prepare_draw()?;
        }
        unsafe {
            self.device.as_ref().raw().cmd_draw(
                self.cmd_buf,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        ensure_state(self.state, CommandListState::Recording, "draw_indexed")?;
        if !self.flushed {
            self.prepare_draw()?;
        }
        unsafe {
            self.device.as_ref().raw().cmd_draw_indexed(
                self.cmd_buf,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        ensure_state(self.state, CommandListState::Recording, "dispatch")?;
        if !self.flushed {
            self.prepare_draw()?;
        }
        unsafe {
            self.device.as_ref().raw().cmd_dispatch(self.cmd_buf, x, y, z);
        }
        Ok(())
    }

    pub fn set_vertex_buffer(&mut self, buffer: Handle<super::resources::Buffer>) -> Result<()> {
        ensure_state(self.state, CommandListState::Recording, "set_vertex_buffer")?;
        let device = unsafe { self.device.as_ref() };
        let buf = device
            .buffer(buffer)
            .ok_or(GPUError::InvalidPipelineState("stale vertex buffer handle"))?;
        if buf.gpu_id() == self.vertex_buffer_id {
            return Ok(());
        }
        self.vertex_buffer_id = buf.gpu_id();
        unsafe {
            device
                .raw()
                .cmd_bind_vertex_buffers(self.cmd_buf, 0, &[buf.raw], &[buf.offset as u64]);
        }
        Ok(())
    }

    pub fn set_index_buffer(&mut self, buffer: Handle<super::resources::Buffer>) -> Result<()> {
        ensure_state(self.state, CommandListState::Recording, "set_index_buffer")?;
        let device = unsafe { self.device.as_ref() };
        let buf = device
            .buffer(buffer)
            .ok_or(GPUError::InvalidPipelineState("stale index buffer handle"))?;
        if buf.gpu_id() == self.index_buffer_id {
            return Ok(());
        }
        self.index_buffer_id = buf.gpu_id();
        unsafe {
            device.raw().cmd_bind_index_buffer(
                self.cmd_buf,
                buf.raw,
                buf.offset as u64,
                vk::IndexType::UINT32,
            );
        }
        Ok(())
    }

    pub fn destroy(self, device: &mut Device) {
        device.destroy_fence(self.fence);
        device.destroy_semaphore(self.processed);
        device.free_command_buffer(self.cmd_buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_reject_wrong_source_states() {
        use CommandListState::*;

        assert!(ensure_state(Idle, Recording, "draw").is_err());
        assert!(ensure_state(Recording, Recording, "draw").is_ok());
        assert!(ensure_state(Ended, Recording, "draw").is_err());
        assert!(ensure_state(Submitted, Recording, "draw").is_err());

        assert!(ensure_state(Recording, Ended, "submit").is_err());
        assert!(ensure_state(Idle, Ended, "submit").is_err());
        assert!(ensure_state(Ended, Ended, "submit").is_ok());

        assert!(ensure_state(Submitted, Submitted, "wait").is_ok());
        assert!(ensure_state(Idle, Submitted, "wait").is_err());
    }

    #[test]
    fn rejection_reports_operation_and_state() {
        let err = ensure_state(CommandListState::Idle, CommandListState::Ended, "submit")
            .unwrap_err();
        match err {
            GPUError::InvalidCommandListState { op, state } => {
                assert_eq!(op, "submit");
                assert_eq!(state, CommandListState::Idle);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
