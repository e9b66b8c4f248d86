use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use ash::vk;

use super::descriptor::{
    flag_dynamic_slots, merge_descriptors, shape_hash, Descriptor, DescriptorSetLayout,
    ResolvedSet,
};
use super::device::Device;
use super::error::{GPUError, Result};
use super::structs::PipelineState;

const CLEAR_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Cross-thread invalidation handshake. Texture destruction can run on a
/// loader thread while the render thread reads set counts; destruction only
/// raises `pending`, and the render thread performs the actual clear at its
/// next safe point with `clearing` held.
pub struct ClearSignal {
    pending: AtomicBool,
    clearing: Mutex<bool>,
    cond: Condvar,
}

impl ClearSignal {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            clearing: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Callable from any thread.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
    }

    fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    fn enter_clearing(&self) {
        *self.clearing.lock().expect("clear signal poisoned") = true;
    }

    fn exit_clearing(&self) {
        *self.clearing.lock().expect("clear signal poisoned") = false;
        self.cond.notify_all();
    }

    /// Blocks while a clear is in progress. Bounded: a stalled clearing
    /// thread surfaces as an error instead of a livelock.
    fn wait_not_clearing(&self, timeout: Duration) -> Result<()> {
        let clearing = self.clearing.lock().expect("clear signal poisoned");
        let (guard, result) = self
            .cond
            .wait_timeout_while(clearing, timeout, |c| *c)
            .expect("clear signal poisoned");
        drop(guard);
        if result.timed_out() {
            return Err(GPUError::ClearTimeout);
        }
        Ok(())
    }
}

struct GlobalBuffer {
    slot: u32,
    resource: u64,
    offset: u32,
    range: u32,
    dynamic_offset: u32,
}

/// Deduplicates descriptor set layouts by binding shape and owns the pool
/// their sets allocate from.
///
/// Not internally synchronized: pipeline-state and binding mutation happens
/// on the render thread only. The one cross-thread interaction is the
/// [`ClearSignal`] raised by resource destruction.
pub struct DescriptorSetLayoutCache {
    device: NonNull<Device>,
    pool: vk::DescriptorPool,
    capacity: u32,
    // Boxed so layout addresses stay stable across map growth; callers hold
    // on to `&DescriptorSetLayout` identity between frames.
    layouts: HashMap<u64, Box<DescriptorSetLayout>>,
    current: Option<u64>,
    global_samplers: Vec<(u32, u64)>,
    global_constant_buffers: Vec<GlobalBuffer>,
    signal: Arc<ClearSignal>,
}

impl DescriptorSetLayoutCache {
    pub fn new(device: &mut Device, capacity: u32) -> Result<Self> {
        let pool = Self::make_pool(device, capacity)?;
        let signal = Arc::new(ClearSignal::new());
        device.register_clear_signal(signal.clone());
        Ok(Self {
            device: NonNull::from(device),
            pool,
            capacity,
            layouts: HashMap::new(),
            current: None,
            global_samplers: Vec::new(),
            global_constant_buffers: Vec::new(),
            signal,
        })
    }

    fn make_pool(device: &Device, capacity: u32) -> Result<vk::DescriptorPool> {
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: capacity * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: capacity * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: capacity,
            },
        ];
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(capacity);
        let pool = unsafe { device.raw().create_descriptor_pool(&info, None)? };
        Ok(pool)
    }

    pub fn signal(&self) -> Arc<ClearSignal> {
        self.signal.clone()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn device(&self) -> &Device {
        unsafe { self.device.as_ref() }
    }

    fn live_sets(&self) -> u32 {
        self.layouts.values().map(|l| l.set_count() as u32).sum()
    }

    /// Live set count across all layouts. Waits out any in-flight clear
    /// first so the count never reflects a half-destroyed cache.
    pub fn descriptor_set_count(&self) -> Result<u32> {
        self.signal.wait_not_clearing(CLEAR_WAIT_TIMEOUT)?;
        Ok(self.live_sets())
    }

    /// Assembles the merged descriptor list for `state`, finds or creates
    /// the matching layout, and makes it current (marked for rebind).
    pub fn set_pipeline_state(&mut self, state: &PipelineState) -> Result<()> {
        state.validate()?;

        let device = self.device();
        let mut descriptors: Vec<Descriptor>;
        let name: String;

        if let Some(cs) = state.compute_shader {
            let shader = device
                .shader(cs)
                .ok_or(GPUError::InvalidPipelineState("stale compute shader handle"))?
                .clone();
            shader.wait_for_compilation()?;
            descriptors = shader.descriptors().to_vec();
            name = shader.name().to_string();
        } else {
            let vs = state
                .vertex_shader
                .and_then(|h| device.shader(h))
                .ok_or(GPUError::InvalidPipelineState("stale vertex shader handle"))?
                .clone();
            vs.wait_for_compilation()?;
            descriptors = vs.descriptors().to_vec();

            if let Some(ps_handle) = state.pixel_shader {
                let ps = device
                    .shader(ps_handle)
                    .ok_or(GPUError::InvalidPipelineState("stale pixel shader handle"))?
                    .clone();
                ps.wait_for_compilation()?;
                merge_descriptors(&mut descriptors, ps.descriptors());
                name = format!("{}+{}", vs.name(), ps.name());
            } else {
                name = vs.name().to_string();
            }
        }

        flag_dynamic_slots(&mut descriptors, &state.dynamic_constant_buffer_slots);
        let shape = shape_hash(&descriptors);

        if !self.layouts.contains_key(&shape) {
            let raw = self.make_vk_layout(&descriptors)?;
            log::debug!("new descriptor set layout '{}' (shape {:#x})", name, shape);
            self.layouts
                .insert(shape, Box::new(DescriptorSetLayout::new(raw, name, descriptors)));
        }

        self.current = Some(shape);
        let layout = self.layouts.get_mut(&shape).unwrap();
        layout.needs_rebind = true;

        // The API has no persistent binding state across pipeline changes,
        // so engine-global binds are re-applied to every layout made current.
        for (slot, resource) in &self.global_samplers {
            layout.set_sampler(*slot, *resource);
        }
        for g in &self.global_constant_buffers {
            layout.set_constant_buffer(g.slot, g.resource, g.offset, g.range, g.dynamic_offset);
        }
        Ok(())
    }

    fn make_vk_layout(&self, descriptors: &[Descriptor]) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = descriptors
            .iter()
            .map(|d| vk::DescriptorSetLayoutBinding {
                binding: d.slot,
                descriptor_type: d.kind.to_vk(),
                descriptor_count: 1,
                stage_flags: d.stages.to_vk(),
                ..Default::default()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let raw = unsafe { self.device().raw().create_descriptor_set_layout(&info, None)? };
        Ok(raw)
    }

    pub fn current_layout(&self) -> Option<&DescriptorSetLayout> {
        self.current.and_then(|shape| {
            self.layouts.get(&shape).map(|b| b.as_ref())
        })
    }

    fn current_layout_mut(&mut self) -> Option<&mut DescriptorSetLayout> {
        let shape = self.current?;
        self.layouts.get_mut(&shape).map(|b| b.as_mut())
    }

    pub fn set_constant_buffer(
        &mut self,
        slot: u32,
        resource: u64,
        offset: u32,
        range: u32,
        dynamic_offset: u32,
    ) {
        debug_assert!(self.current.is_some(), "no pipeline state set");
        if let Some(layout) = self.current_layout_mut() {
            layout.set_constant_buffer(slot, resource, offset, range, dynamic_offset);
        }
    }

    pub fn set_sampler(&mut self, slot: u32, resource: u64) {
        debug_assert!(self.current.is_some(), "no pipeline state set");
        if let Some(layout) = self.current_layout_mut() {
            layout.set_sampler(slot, resource);
        }
    }

    pub fn set_texture(&mut self, slot: u32, resource: u64, layout: vk::ImageLayout, storage: bool) {
        debug_assert!(self.current.is_some(), "no pipeline state set");
        if let Some(l) = self.current_layout_mut() {
            l.set_texture(slot, resource, layout, storage);
        }
    }

    /// Remembered and re-applied on every pipeline-state change.
    pub fn set_global_sampler(&mut self, slot: u32, resource: u64) {
        self.global_samplers.retain(|(s, _)| *s != slot);
        self.global_samplers.push((slot, resource));
        if let Some(layout) = self.current_layout_mut() {
            layout.set_sampler(slot, resource);
        }
    }

    pub fn set_global_constant_buffer(
        &mut self,
        slot: u32,
        resource: u64,
        offset: u32,
        range: u32,
        dynamic_offset: u32,
    ) {
        self.global_constant_buffers.retain(|g| g.slot != slot);
        self.global_constant_buffers.push(GlobalBuffer {
            slot,
            resource,
            offset,
            range,
            dynamic_offset,
        });
        if let Some(layout) = self.current_layout_mut() {
            layout.set_constant_buffer(slot, resource, offset, range, dynamic_offset);
        }
    }

    /// Resolves the current layout's bindings to a concrete set. Pool
    /// exhaustion is recoverable: the caller flushes, waits, and the next
    /// [`Self::grow_if_needed`] doubles the pool.
    pub fn retrieve_descriptor_set(&mut self) -> Result<Option<ResolvedSet>> {
        let live = self.live_sets();
        let pool = self.pool;
        let capacity = self.capacity;
        let device = self.device;
        let layout = self
            .current_layout_mut()
            .ok_or(GPUError::InvalidPipelineState("no pipeline state set"))?;
        layout.retrieve_descriptor_set(unsafe { device.as_ref() }.raw(), pool, capacity, live)
    }

    /// Re-creates the pool at a new capacity. Requesting the current
    /// capacity is a logged no-op; anything else invalidates every cached
    /// layout and set.
    pub fn set_capacity(&mut self, capacity: u32) -> Result<()> {
        if capacity == self.capacity {
            log::info!("descriptor pool already at capacity {}, skipping", capacity);
            return Ok(());
        }
        log::info!(
            "recreating descriptor pool: capacity {} -> {}",
            self.capacity,
            capacity
        );

        let device = unsafe { self.device.as_ref() };
        self.destroy_layouts();
        unsafe { device.raw().destroy_descriptor_pool(self.pool, None) };
        self.pool = Self::make_pool(device, capacity)?;
        self.capacity = capacity;
        self.current = None;
        Ok(())
    }

    /// Doubles the pool when one more allocation would not fit. Invoked
    /// after a command list's fence is observed signaled, so no GPU work
    /// still references the old pool.
    pub fn grow_if_needed(&mut self) -> Result<()> {
        if self.live_sets() + 1 > self.capacity {
            let next = self.capacity * 2;
            self.set_capacity(next)?;
        }
        Ok(())
    }

    /// Performs a deferred clear if one was raised. Render-thread only; the
    /// caller guarantees the GPU is done with the affected sets.
    pub fn clear_if_pending(&mut self) -> Result<()> {
        if !self.signal.take_pending() {
            return Ok(());
        }
        self.signal.enter_clearing();
        let res = unsafe {
            self.device
                .as_ref()
                .raw()
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())
        };
        for layout in self.layouts.values_mut() {
            layout.sets.clear();
            layout.needs_rebind = true;
        }
        self.signal.exit_clearing();
        res?;
        log::debug!("descriptor cache cleared after resource destruction");
        Ok(())
    }

    fn destroy_layouts(&mut self) {
        let device = unsafe { self.device.as_ref() };
        for (_, layout) in self.layouts.drain() {
            unsafe { device.raw().destroy_descriptor_set_layout(layout.raw, None) };
        }
    }

    pub fn destroy(mut self) {
        let device = unsafe { self.device.as_ref() };
        self.destroy_layouts();
        unsafe { device.raw().destroy_descriptor_pool(self.pool, None) };
    }
}
