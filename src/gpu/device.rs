use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::mem::ManuallyDrop;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle as VkHandle};
use ash::Entry;
use raw_window_handle::HasRawWindowHandle;
use vk_mem::Alloc;

use super::descriptor_cache::ClearSignal;
use super::device_selector::DeviceSelector;
use super::error::{check, GPUError, Result};
use super::resources::{Buffer, Sampler, Texture};
use super::shader::Shader;
use super::structs::{
    BufferInfo, DeviceInfo, Filter, MemoryVisibility, QueueType, SamplerAddressMode, SamplerInfo,
    ShaderInfo, TextureInfo,
};
use super::sync::{Fence, Semaphore, SyncState};
use crate::job::WorkerPool;
use crate::utils::{Handle, Pool};

const DEBUG_LAYER: *const c_char = b"VK_LAYER_KHRONOS_validation\0".as_ptr() as *const c_char;

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[{:?}] {}", message_type, message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[{:?}] {}", message_type, message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[{:?}] {}", message_type, message)
        }
        _ => log::trace!("[{:?}] {}", message_type, message),
    }
    vk::FALSE
}

#[derive(Default, Clone, Copy)]
pub(crate) struct Queue {
    pub(crate) queue: vk::Queue,
    pub(crate) family: u32,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct FramebufferKey {
    render_pass: u64,
    views: Vec<u64>,
    width: u32,
    height: u32,
    /// Swapchain generation; a resize invalidates entries bound to the old
    /// images.
    object_id: u64,
}

/// The GPU connection: instance, logical device, queues, allocator, and the
/// arenas every other object lives in. Everything downstream references
/// resources through [`Handle`]s into these pools.
pub struct Device {
    entry: Entry,
    instance: ash::Instance,
    pdevice: vk::PhysicalDevice,
    device: ash::Device,
    properties: vk::PhysicalDeviceProperties,
    allocator: ManuallyDrop<vk_mem::Allocator>,

    gfx_queue: Queue,
    compute_queue: Option<Queue>,
    transfer_queue: Option<Queue>,
    cmd_pool: vk::CommandPool,

    debug_utils: Option<ash::extensions::ext::DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    timeline_supported: bool,
    headless: bool,

    pub(crate) fences: Pool<Fence>,
    pub(crate) semaphores: Pool<Semaphore>,
    pub(crate) shaders: Pool<Shader>,
    pub(crate) textures: Pool<Texture>,
    pub(crate) buffers: Pool<Buffer>,
    pub(crate) samplers: Pool<Sampler>,

    framebuffers: HashMap<FramebufferKey, vk::Framebuffer>,
    clear_signals: Vec<Arc<ClearSignal>>,
    object_ids: AtomicU64,
    workers: WorkerPool,
}

impl Device {
    pub fn new(info: &DeviceInfo) -> Result<Self> {
        let selector = DeviceSelector::new()?;
        let selected = selector.select_primary()?;

        let app_info = vk::ApplicationInfo {
            api_version: vk::make_api_version(0, 1, 2, 0),
            ..Default::default()
        };

        let entry = unsafe { Entry::load() }?;
        let mut inst_exts = Vec::new();
        let mut inst_layers = Vec::new();
        if info.enable_validation {
            inst_exts.push(ash::extensions::ext::DebugUtils::name().as_ptr());
            let available = entry.enumerate_instance_layer_properties()?;
            let wanted = unsafe { CStr::from_ptr(DEBUG_LAYER) };
            if available
                .iter()
                .any(|prop| unsafe { CStr::from_ptr(prop.layer_name.as_ptr()) == wanted })
            {
                inst_layers.push(DEBUG_LAYER);
            }
        }
        if !info.headless {
            inst_exts.push(ash::extensions::khr::Surface::name().as_ptr());
            #[cfg(target_os = "linux")]
            {
                inst_exts.push(ash::extensions::khr::XlibSurface::name().as_ptr());
                inst_exts.push(ash::extensions::khr::WaylandSurface::name().as_ptr());
            }
            #[cfg(target_os = "windows")]
            inst_exts.push(ash::extensions::khr::Win32Surface::name().as_ptr());
        }

        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::builder()
                    .application_info(&app_info)
                    .enabled_extension_names(&inst_exts)
                    .enabled_layer_names(&inst_layers),
                None,
            )
        }?;

        let pdevice = unsafe { instance.enumerate_physical_devices()?[selected.device_id] };
        let properties = unsafe { instance.get_physical_device_properties(pdevice) };
        let queue_props = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };

        let mut gfx_family = None;
        let mut compute_family = None;
        let mut transfer_family = None;
        for (idx, prop) in queue_props.iter().enumerate() {
            if prop.queue_flags.contains(vk::QueueFlags::GRAPHICS) && gfx_family.is_none() {
                gfx_family = Some(idx as u32);
            }
            if prop.queue_flags.contains(vk::QueueFlags::COMPUTE) && compute_family.is_none() {
                compute_family = Some(idx as u32);
            }
            if prop.queue_flags.contains(vk::QueueFlags::TRANSFER) && transfer_family.is_none() {
                transfer_family = Some(idx as u32);
            }
        }
        let gfx_family = gfx_family.ok_or(GPUError::NoSuitableDevice)?;
        let compute_family = compute_family.unwrap_or(gfx_family);
        let transfer_family = transfer_family.unwrap_or(compute_family);

        let priorities = [1.0];
        let mut unique_families = vec![gfx_family];
        if compute_family != gfx_family {
            unique_families.push(compute_family);
        }
        if transfer_family != compute_family && transfer_family != gfx_family {
            unique_families.push(transfer_family);
        }
        let queue_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let mut timeline_query = vk::PhysicalDeviceTimelineSemaphoreFeatures::default();
        let mut feature_query =
            vk::PhysicalDeviceFeatures2::builder().push_next(&mut timeline_query);
        unsafe { instance.get_physical_device_features2(pdevice, &mut feature_query) };
        let timeline_supported = timeline_query.timeline_semaphore == vk::TRUE;

        let available_exts = unsafe { instance.enumerate_device_extension_properties(pdevice) }?;
        let mut device_exts: Vec<*const c_char> = Vec::new();
        if !info.headless {
            device_exts.push(ash::extensions::khr::Swapchain::name().as_ptr());
        }
        device_exts.retain(|&wanted| {
            available_exts.iter().any(|ext| unsafe {
                CStr::from_ptr(ext.extension_name.as_ptr()) == CStr::from_ptr(wanted)
            })
        });

        let features = vk::PhysicalDeviceFeatures::default();
        let mut timeline_features = vk::PhysicalDeviceTimelineSemaphoreFeatures::builder()
            .timeline_semaphore(timeline_supported)
            .build();
        let device_ci = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_exts)
            .enabled_features(&features)
            .push_next(&mut timeline_features);

        let device = unsafe { instance.create_device(pdevice, &device_ci, None) }?;

        let gfx_queue = Queue {
            queue: unsafe { device.get_device_queue(gfx_family, 0) },
            family: gfx_family,
        };
        let compute_queue = (compute_family != gfx_family).then(|| Queue {
            queue: unsafe { device.get_device_queue(compute_family, 0) },
            family: compute_family,
        });
        let transfer_queue = (transfer_family != compute_family
            && transfer_family != gfx_family)
            .then(|| Queue {
                queue: unsafe { device.get_device_queue(transfer_family, 0) },
                family: transfer_family,
            });

        let allocator = vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
            &instance, &device, pdevice,
        ))?;

        let cmd_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(gfx_family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                None,
            )
        }?;

        let (debug_utils, debug_messenger) = if info.enable_validation {
            let debug_utils = ash::extensions::ext::DebugUtils::new(&entry, &instance);
            let messenger_ci = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));
            let messenger =
                unsafe { debug_utils.create_debug_utils_messenger(&messenger_ci, None)? };
            (Some(debug_utils), Some(messenger))
        } else {
            (None, None)
        };

        log::info!("device '{}' ready on {}", info.debug_name, selected);

        Ok(Self {
            entry,
            instance,
            pdevice,
            device,
            properties,
            allocator: ManuallyDrop::new(allocator),
            gfx_queue,
            compute_queue,
            transfer_queue,
            cmd_pool,
            debug_utils,
            debug_messenger,
            timeline_supported,
            headless: info.headless,
            fences: Pool::new(64),
            semaphores: Pool::new(64),
            shaders: Pool::new(64),
            textures: Pool::new(256),
            buffers: Pool::new(256),
            samplers: Pool::new(16),
            framebuffers: HashMap::new(),
            clear_signals: Vec::new(),
            object_ids: AtomicU64::new(1),
            workers: WorkerPool::new(),
        })
    }

    /// Off-screen variant: no surface extensions, no presentation.
    pub fn headless() -> Result<Self> {
        Device::new(&DeviceInfo {
            headless: true,
            ..Default::default()
        })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub(crate) fn entry(&self) -> &Entry {
        &self.entry
    }

    pub(crate) fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub(crate) fn pdevice(&self) -> vk::PhysicalDevice {
        self.pdevice
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    pub fn timeline_supported(&self) -> bool {
        self.timeline_supported
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Fresh identity token. Swapchains take one per recreation so caches
    /// keyed on it can tell generations apart.
    pub fn next_object_id(&self) -> u64 {
        self.object_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_clear_signal(&mut self, signal: Arc<ClearSignal>) {
        self.clear_signals.push(signal);
    }

    /// Queue lookup with fallback: Compute falls back to Graphics, Transfer
    /// to Compute then Graphics.
    pub(crate) fn queue(&self, ty: QueueType) -> vk::Queue {
        match ty {
            QueueType::Graphics => self.gfx_queue.queue,
            QueueType::Compute => self.compute_queue.as_ref().unwrap_or(&self.gfx_queue).queue,
            QueueType::Transfer => {
                self.transfer_queue
                    .as_ref()
                    .or(self.compute_queue.as_ref())
                    .unwrap_or(&self.gfx_queue)
                    .queue
            }
        }
    }

    pub(crate) fn graphics_queue(&self) -> vk::Queue {
        self.gfx_queue.queue
    }

    pub(crate) fn set_name<T>(&self, obj: T, name: &str)
    where
        T: VkHandle + Copy,
    {
        if name.is_empty() {
            return;
        }
        if let Some(utils) = &self.debug_utils {
            let Ok(cname) = CString::new(name) else { return };
            let info = vk::DebugUtilsObjectNameInfoEXT::builder()
                .object_type(T::TYPE)
                .object_handle(obj.as_raw())
                .object_name(&cname);
            let res =
                unsafe { utils.set_debug_utils_object_name(self.device.handle(), &info) };
            if let Err(e) = res {
                log::warn!("failed to name object '{}': {}", name, e);
            }
        }
    }

    // ---- synchronization --------------------------------------------------

    pub fn make_fence(&mut self) -> Result<Handle<Fence>> {
        let raw = unsafe {
            self.device.create_fence(
                &vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED),
                None,
            )
        }?;
        self.fences.insert(Fence::new(raw)).ok_or(GPUError::SlotError())
    }

    pub fn destroy_fence(&mut self, handle: Handle<Fence>) {
        if let Some(fence) = self.fences.release(handle) {
            unsafe { self.device.destroy_fence(fence.raw, None) };
        }
    }

    pub(crate) fn reset_fence(&mut self, handle: Handle<Fence>) -> Result<()> {
        let fence = self.fences.get_mut_ref(handle).ok_or(GPUError::SlotError())?;
        unsafe { self.device.reset_fences(&[fence.raw])? };
        fence.state = SyncState::Idle;
        Ok(())
    }

    /// Blocks until `handle` signals, up to `timeout` nanoseconds.
    pub fn wait_fence(&mut self, handle: Handle<Fence>, timeout: u64) -> Result<()> {
        let fence = self.fences.get_mut_ref(handle).ok_or(GPUError::SlotError())?;
        let res = unsafe { self.device.wait_for_fences(&[fence.raw], true, timeout) };
        check(res.map_err(GPUError::from))?;
        fence.state = SyncState::Signaled;
        Ok(())
    }

    pub fn make_semaphore(&mut self) -> Result<Handle<Semaphore>> {
        let raw = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)
        }?;
        self.semaphores
            .insert(Semaphore::binary(raw))
            .ok_or(GPUError::SlotError())
    }

    pub fn make_timeline_semaphore(&mut self) -> Result<Handle<Semaphore>> {
        if !self.timeline_supported {
            return Err(GPUError::Unimplemented("timeline semaphores"));
        }
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let raw = unsafe {
            self.device.create_semaphore(
                &vk::SemaphoreCreateInfo::builder().push_next(&mut type_info),
                None,
            )
        }?;
        self.semaphores
            .insert(Semaphore::timeline(raw))
            .ok_or(GPUError::SlotError())
    }

    /// Host wait on a timeline semaphore reaching `value`.
    pub fn wait_timeline(&self, handle: Handle<Semaphore>, value: u64, timeout: u64) -> Result<()> {
        let sem = self.semaphores.get_ref(handle).ok_or(GPUError::SlotError())?;
        debug_assert!(sem.timeline, "host wait on a binary semaphore");
        let raws = [sem.raw];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&raws)
            .values(&values);
        unsafe { self.device.wait_semaphores(&info, timeout)? };
        Ok(())
    }

    /// Signals a timeline semaphore from the host, advancing its tracked
    /// value by one. Returns the value that was signaled.
    pub fn signal_timeline(&mut self, handle: Handle<Semaphore>) -> Result<u64> {
        let sem = self
            .semaphores
            .get_mut_ref(handle)
            .ok_or(GPUError::SlotError())?;
        debug_assert!(sem.timeline, "host signal on a binary semaphore");
        let value = sem.next_value();
        let raw = sem.raw;
        let info = vk::SemaphoreSignalInfo::builder()
            .semaphore(raw)
            .value(value);
        unsafe { self.device.signal_semaphore(&info)? };
        Ok(value)
    }

    pub fn destroy_semaphore(&mut self, handle: Handle<Semaphore>) {
        if let Some(sem) = self.semaphores.release(handle) {
            unsafe { self.device.destroy_semaphore(sem.raw, None) };
        }
    }

    pub fn semaphore(&self, handle: Handle<Semaphore>) -> Option<&Semaphore> {
        self.semaphores.get_ref(handle)
    }

    pub(crate) fn semaphore_mut(&mut self, handle: Handle<Semaphore>) -> Option<&mut Semaphore> {
        self.semaphores.get_mut_ref(handle)
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    pub(crate) fn submit_raw(
        &mut self,
        ty: QueueType,
        cmd_buf: vk::CommandBuffer,
        waits: &[vk::Semaphore],
        signals: &[vk::Semaphore],
        fence: Handle<Fence>,
    ) -> Result<()> {
        let raw_fence = self.fences.get_ref(fence).ok_or(GPUError::SlotError())?.raw;
        let stage_masks = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
        let cmd_bufs = [cmd_buf];
        let submit = vk::SubmitInfo::builder()
            .command_buffers(&cmd_bufs)
            .wait_semaphores(waits)
            .wait_dst_stage_mask(&stage_masks)
            .signal_semaphores(signals)
            .build();
        let res = unsafe { self.device.queue_submit(self.queue(ty), &[submit], raw_fence) };
        check(res.map_err(GPUError::from))?;
        Ok(())
    }

    // ---- command buffers --------------------------------------------------

    pub(crate) fn allocate_command_buffer(&mut self) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.cmd_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let bufs = unsafe { self.device.allocate_command_buffers(&info)? };
        Ok(bufs[0])
    }

    pub(crate) fn free_command_buffer(&mut self, cmd_buf: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(self.cmd_pool, &[cmd_buf]) };
    }

    // ---- shaders ----------------------------------------------------------

    /// Registers the shader immediately and finalizes its module on the
    /// worker pool. Consumers block in `wait_for_compilation` (or further
    /// down, in pipeline construction) until the worker settles it.
    pub fn make_shader(&mut self, info: &ShaderInfo) -> Result<Handle<Shader>> {
        let shader = Shader::new(
            info.debug_name,
            info.entry_point,
            info.stage,
            info.descriptors.to_vec(),
        );
        shader.begin_compiling();

        let handle = self
            .shaders
            .insert(shader.clone())
            .ok_or(GPUError::SlotError())?;

        let device = self.device.clone();
        let spirv: Vec<u32> = info.spirv.to_vec();
        let name = info.debug_name.to_string();
        self.workers.submit(move || {
            let create_info = vk::ShaderModuleCreateInfo::builder().code(&spirv);
            match unsafe { device.create_shader_module(&create_info, None) } {
                Ok(module) => shader.finish(module),
                Err(e) => {
                    log::error!("shader '{}' failed to finalize: {}", name, e);
                    shader.fail();
                }
            }
        });
        Ok(handle)
    }

    pub fn shader(&self, handle: Handle<Shader>) -> Option<&Shader> {
        self.shaders.get_ref(handle)
    }

    pub fn destroy_shader(&mut self, handle: Handle<Shader>) {
        if let Some(shader) = self.shaders.release(handle) {
            let _ = shader.wait_for_compilation();
            let module = shader.module();
            if module != vk::ShaderModule::null() {
                unsafe { self.device.destroy_shader_module(module, None) };
            }
        }
    }

    // ---- textures ---------------------------------------------------------

    pub fn make_texture(&mut self, info: &TextureInfo) -> Result<Handle<Texture>> {
        let mut usage =
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC;
        if info.render_target {
            usage |= if info.format.is_depth() {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            };
        }

        let (image, allocation) = unsafe {
            self.allocator.create_image(
                &vk::ImageCreateInfo::builder()
                    .image_type(vk::ImageType::TYPE_2D)
                    .extent(vk::Extent3D {
                        width: info.dim[0],
                        height: info.dim[1],
                        depth: 1,
                    })
                    .array_layers(info.layers)
                    .mip_levels(info.mip_levels)
                    .format(info.format.to_vk())
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .usage(usage)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::Auto,
                    ..Default::default()
                },
            )
        }?;
        self.set_name(image, info.debug_name);

        let view = unsafe {
            self.device.create_image_view(
                &vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(info.format.to_vk())
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: info.format.aspect(),
                        base_mip_level: 0,
                        level_count: info.mip_levels,
                        base_array_layer: 0,
                        layer_count: info.layers,
                    }),
                None,
            )
        }?;

        self.textures
            .insert(Texture {
                raw: image,
                view,
                allocation: Some(allocation),
                dim: info.dim,
                format: info.format,
                mip_levels: info.mip_levels,
                layers: info.layers,
                layout: vk::ImageLayout::UNDEFINED,
                render_target: info.render_target,
                name: info.debug_name.to_string(),
            })
            .ok_or(GPUError::SlotError())
    }

    pub fn texture(&self, handle: Handle<Texture>) -> Option<&Texture> {
        self.textures.get_ref(handle)
    }

    /// Safe from loader threads at the signal level: the descriptor caches
    /// learn about the destruction through their [`ClearSignal`]s and clear
    /// at their next safe point.
    pub fn destroy_texture(&mut self, handle: Handle<Texture>) {
        for signal in &self.clear_signals {
            signal.raise();
        }
        if let Some(mut texture) = self.textures.release(handle) {
            unsafe {
                self.device.destroy_image_view(texture.view, None);
                if let Some(alloc) = texture.allocation.as_mut() {
                    self.allocator.destroy_image(texture.raw, alloc);
                }
            }
        }
    }

    /// Records a layout transition into `cmd` and updates the host-side
    /// layout mirror.
    pub(crate) fn transition_texture(
        &mut self,
        cmd: vk::CommandBuffer,
        handle: Handle<Texture>,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        let texture = self.textures.get_mut_ref(handle).ok_or(GPUError::SlotError())?;
        if texture.layout == new_layout {
            return Ok(());
        }
        let (src_stage, src_access, dst_stage, dst_access) =
            barrier_masks_for_transition(texture.layout, new_layout);

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(texture.layout)
            .new_layout(new_layout)
            .image(texture.raw)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: texture.format.aspect(),
                base_mip_level: 0,
                level_count: texture.mip_levels,
                base_array_layer: 0,
                layer_count: texture.layers,
            })
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::default(),
                &[],
                &[],
                &[barrier],
            );
        }
        texture.layout = new_layout;
        Ok(())
    }

    // ---- buffers ----------------------------------------------------------

    pub fn make_buffer(&mut self, info: &BufferInfo) -> Result<Handle<Buffer>> {
        let usage = vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;

        let mappable = matches!(info.visibility, MemoryVisibility::CpuAndGpu);
        let create_info = vk_mem::AllocationCreateInfo {
            usage: if mappable {
                vk_mem::MemoryUsage::AutoPreferHost
            } else {
                vk_mem::MemoryUsage::Auto
            },
            flags: if mappable {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };

        let (buffer, allocation) = unsafe {
            self.allocator.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(info.byte_size as u64)
                    .usage(usage),
                &create_info,
            )
        }?;
        self.set_name(buffer, info.debug_name);

        let handle = self
            .buffers
            .insert(Buffer {
                raw: buffer,
                allocation,
                byte_size: info.byte_size,
                stride: info.stride,
                offset: 0,
                usage: info.usage,
                visibility: info.visibility,
                name: info.debug_name.to_string(),
            })
            .ok_or(GPUError::SlotError())?;

        if let Some(data) = info.initial_data {
            self.upload_buffer(handle, data, mappable)?;
        }
        Ok(handle)
    }

    fn upload_buffer(&mut self, handle: Handle<Buffer>, data: &[u8], mappable: bool) -> Result<()> {
        if mappable {
            let mapped = self.map_buffer_mut(handle)?;
            let len = data.len().min(mapped.len());
            mapped[..len].copy_from_slice(&data[..len]);
            self.unmap_buffer(handle)?;
            return Ok(());
        }

        // Device-local path: stage through a host-visible buffer and copy
        // with a one-shot submission.
        let staging = self.make_buffer(&BufferInfo {
            debug_name: "staging",
            byte_size: data.len() as u32,
            visibility: MemoryVisibility::CpuAndGpu,
            initial_data: Some(data),
            ..Default::default()
        })?;

        let cmd = self.allocate_command_buffer()?;
        let fence = self.make_fence()?;
        self.reset_fence(fence)?;
        unsafe {
            self.device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            let src = self.buffers.get_ref(staging).unwrap().raw;
            let dst = self.buffers.get_ref(handle).unwrap().raw;
            self.device.cmd_copy_buffer(
                cmd,
                src,
                dst,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: data.len() as u64,
                }],
            );
            self.device.end_command_buffer(cmd)?;
        }
        self.submit_raw(QueueType::Graphics, cmd, &[], &[], fence)?;
        self.wait_fence(fence, u64::MAX)?;

        self.destroy_fence(fence);
        self.free_command_buffer(cmd);
        self.destroy_buffer(staging);
        Ok(())
    }

    pub fn buffer(&self, handle: Handle<Buffer>) -> Option<&Buffer> {
        self.buffers.get_ref(handle)
    }

    pub fn destroy_buffer(&mut self, handle: Handle<Buffer>) {
        for signal in &self.clear_signals {
            signal.raise();
        }
        if let Some(mut buffer) = self.buffers.release(handle) {
            unsafe {
                self.allocator.destroy_buffer(buffer.raw, &mut buffer.allocation);
            }
        }
    }

    pub fn map_buffer_mut(&mut self, handle: Handle<Buffer>) -> Result<&mut [u8]> {
        let buffer = self.buffers.get_mut_ref(handle).ok_or(GPUError::SlotError())?;
        debug_assert!(
            matches!(buffer.visibility, MemoryVisibility::CpuAndGpu),
            "mapping a device-local buffer"
        );
        let size = buffer.byte_size as usize;
        let mapped = unsafe { self.allocator.map_memory(&mut buffer.allocation) }?;
        Ok(unsafe { std::slice::from_raw_parts_mut(mapped, size) })
    }

    pub fn unmap_buffer(&mut self, handle: Handle<Buffer>) -> Result<()> {
        let buffer = self.buffers.get_mut_ref(handle).ok_or(GPUError::SlotError())?;
        let info = self.allocator.get_allocation_info(&buffer.allocation);
        self.allocator
            .flush_allocation(&buffer.allocation, 0, info.size as usize)?;
        unsafe { self.allocator.unmap_memory(&mut buffer.allocation) };
        Ok(())
    }

    // ---- samplers ---------------------------------------------------------

    pub fn make_sampler(&mut self, info: &SamplerInfo) -> Result<Handle<Sampler>> {
        let filter = |f: Filter| match f {
            Filter::Nearest => vk::Filter::NEAREST,
            Filter::Linear => vk::Filter::LINEAR,
        };
        let address = match info.address_mode {
            SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            SamplerAddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            SamplerAddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        };
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter(info.mag_filter))
            .min_filter(filter(info.min_filter))
            .address_mode_u(address)
            .address_mode_v(address)
            .address_mode_w(address)
            .anisotropy_enable(info.anisotropy_enable)
            .max_anisotropy(info.max_anisotropy)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .max_lod(vk::LOD_CLAMP_NONE);
        let raw = unsafe { self.device.create_sampler(&create_info, None) }?;
        self.set_name(raw, info.debug_name);
        self.samplers
            .insert(Sampler {
                raw,
                name: info.debug_name.to_string(),
            })
            .ok_or(GPUError::SlotError())
    }

    pub fn sampler(&self, handle: Handle<Sampler>) -> Option<&Sampler> {
        self.samplers.get_ref(handle)
    }

    pub fn destroy_sampler(&mut self, handle: Handle<Sampler>) {
        if let Some(sampler) = self.samplers.release(handle) {
            unsafe { self.device.destroy_sampler(sampler.raw, None) };
        }
    }

    // ---- surfaces and framebuffers ----------------------------------------

    pub(crate) fn make_surface(&self, window: &dyn HasRawWindowHandle) -> Result<vk::SurfaceKHR> {
        if self.headless {
            return Err(GPUError::HeadlessDisplayNotSupported);
        }
        let surface =
            unsafe { ash_window::create_surface(&self.entry, &self.instance, window, None)? };
        Ok(surface)
    }

    /// Framebuffers are cached per (render pass, attachment set, extent,
    /// swapchain generation). Entries from older swapchain generations stay
    /// in the map but are unreachable and die at shutdown.
    pub(crate) fn framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
        object_id: u64,
    ) -> Result<vk::Framebuffer> {
        let key = FramebufferKey {
            render_pass: render_pass.as_raw(),
            views: views.iter().map(|v| v.as_raw()).collect(),
            width: extent.width,
            height: extent.height,
            object_id,
        };
        if let Some(fb) = self.framebuffers.get(&key) {
            return Ok(*fb);
        }
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let fb = unsafe { self.device.create_framebuffer(&info, None)? };
        self.framebuffers.insert(key, fb);
        Ok(fb)
    }

    // ---- teardown ---------------------------------------------------------

    /// Full teardown in dependency order. The device must outlive every
    /// cache and swapchain built on it; destroy those first.
    pub fn destroy(mut self) {
        let _ = self.wait_idle();
        self.workers.wait_idle();

        for (_, fb) in self.framebuffers.drain() {
            unsafe { self.device.destroy_framebuffer(fb, None) };
        }
        for shader in self.shaders.drain_occupied() {
            let _ = shader.wait_for_compilation();
            let module = shader.module();
            if module != vk::ShaderModule::null() {
                unsafe { self.device.destroy_shader_module(module, None) };
            }
        }
        for mut texture in self.textures.drain_occupied() {
            unsafe {
                self.device.destroy_image_view(texture.view, None);
                if let Some(alloc) = texture.allocation.as_mut() {
                    self.allocator.destroy_image(texture.raw, alloc);
                }
            }
        }
        for mut buffer in self.buffers.drain_occupied() {
            unsafe { self.allocator.destroy_buffer(buffer.raw, &mut buffer.allocation) };
        }
        for sampler in self.samplers.drain_occupied() {
            unsafe { self.device.destroy_sampler(sampler.raw, None) };
        }
        for fence in self.fences.drain_occupied() {
            unsafe { self.device.destroy_fence(fence.raw, None) };
        }
        for sem in self.semaphores.drain_occupied() {
            unsafe { self.device.destroy_semaphore(sem.raw, None) };
        }

        unsafe {
            self.device.destroy_command_pool(self.cmd_pool, None);
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            if let (Some(utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Stage/access selection for an image layout transition. Worst-case
/// all-commands masks for combinations outside the common paths.
pub(crate) fn barrier_masks_for_transition(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (
    vk::PipelineStageFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::AccessFlags,
) {
    use vk::{AccessFlags as AF, ImageLayout as L, PipelineStageFlags as PS};

    match (old_layout, new_layout) {
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => (
            PS::TOP_OF_PIPE,
            AF::empty(),
            PS::COLOR_ATTACHMENT_OUTPUT,
            AF::COLOR_ATTACHMENT_WRITE,
        ),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            PS::TOP_OF_PIPE,
            AF::empty(),
            PS::EARLY_FRAGMENT_TESTS,
            AF::DEPTH_STENCIL_ATTACHMENT_READ | AF::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => (
            PS::TOP_OF_PIPE,
            AF::empty(),
            PS::TRANSFER,
            AF::TRANSFER_WRITE,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            PS::TRANSFER,
            AF::TRANSFER_WRITE,
            PS::FRAGMENT_SHADER,
            AF::SHADER_READ,
        ),
        (L::SHADER_READ_ONLY_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL) => (
            PS::FRAGMENT_SHADER,
            AF::SHADER_READ,
            PS::COLOR_ATTACHMENT_OUTPUT,
            AF::COLOR_ATTACHMENT_WRITE,
        ),
        (L::COLOR_ATTACHMENT_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            PS::COLOR_ATTACHMENT_OUTPUT,
            AF::COLOR_ATTACHMENT_WRITE,
            PS::FRAGMENT_SHADER,
            AF::SHADER_READ,
        ),
        _ => (PS::ALL_COMMANDS, AF::empty(), PS::ALL_COMMANDS, AF::empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_transitions_start_at_top_of_pipe() {
        use vk::{ImageLayout as L, PipelineStageFlags as PS};
        let (src_stage, src_access, _, _) =
            barrier_masks_for_transition(L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(src_stage, PS::TOP_OF_PIPE);
        assert!(src_access.is_empty());
    }

    #[test]
    fn render_to_sample_hands_off_to_fragment_stage() {
        use vk::{AccessFlags as AF, ImageLayout as L, PipelineStageFlags as PS};
        let (src_stage, _, dst_stage, dst_access) = barrier_masks_for_transition(
            L::COLOR_ATTACHMENT_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src_stage, PS::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dst_stage, PS::FRAGMENT_SHADER);
        assert_eq!(dst_access, AF::SHADER_READ);
    }

    #[test]
    fn unknown_transitions_fall_back_to_all_commands() {
        use vk::{ImageLayout as L, PipelineStageFlags as PS};
        let (src_stage, _, dst_stage, _) =
            barrier_masks_for_transition(L::GENERAL, L::PRESENT_SRC_KHR);
        assert_eq!(src_stage, PS::ALL_COMMANDS);
        assert_eq!(dst_stage, PS::ALL_COMMANDS);
    }
}
