use std::ptr::NonNull;

use ash::vk;
use raw_window_handle::HasRawWindowHandle;

use super::command_list::CommandList;
use super::descriptor_cache::DescriptorSetLayoutCache;
use super::device::Device;
use super::error::Result;
use super::pipeline::PipelineCache;
use super::structs::{Format, SwapChainInfo};
use super::sync::{Semaphore, SyncState};
use crate::utils::Handle;

/// A zero-area surface (minimized window) is a valid steady state, not an
/// error. Presentation pauses until a real resize arrives.
pub(crate) fn is_degenerate(width: u32, height: u32) -> bool {
    width == 0 || height == 0
}

/// The presentable ring: N images, N views, N acquire semaphores, and one
/// command list per slot.
pub struct SwapChain {
    device: NonNull<Device>,

    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,
    loader: ash::extensions::khr::Swapchain,
    swapchain: vk::SwapchainKHR,

    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    acquire_semaphores: Vec<Handle<Semaphore>>,
    cmd_lists: Vec<CommandList>,

    buffer_count: u32,
    image_index: u32,
    semaphore_index: usize,
    width: u32,
    height: u32,
    format: Format,
    vsync: bool,
    present_enabled: bool,
    /// Regenerated on every recreation so framebuffer caches keyed on it
    /// drop entries bound to the old images.
    object_id: u64,
    name: String,
}

impl SwapChain {
    pub fn new(
        device: &mut Device,
        descriptors: &mut DescriptorSetLayoutCache,
        pipelines: &mut PipelineCache,
        info: &SwapChainInfo,
        window: &dyn HasRawWindowHandle,
    ) -> Result<Self> {
        let surface = device.make_surface(window)?;
        let surface_loader =
            ash::extensions::khr::Surface::new(device.entry(), device.instance());
        let loader = ash::extensions::khr::Swapchain::new(device.instance(), device.raw());

        let buffer_count = info.buffering.count();
        let mut acquire_semaphores = Vec::with_capacity(buffer_count as usize);
        let mut cmd_lists = Vec::with_capacity(buffer_count as usize);
        for i in 0..buffer_count {
            acquire_semaphores.push(device.make_semaphore()?);
            cmd_lists.push(CommandList::new(
                device,
                descriptors,
                pipelines,
                &format!("{} cmd {}", info.debug_name, i),
            )?);
        }

        let mut sc = Self {
            device: NonNull::from(device),
            surface,
            surface_loader,
            loader,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            acquire_semaphores,
            cmd_lists,
            buffer_count,
            image_index: 0,
            semaphore_index: 0,
            width: info.width,
            height: info.height,
            format: info.format,
            vsync: info.vsync,
            present_enabled: false,
            object_id: 0,
            name: info.debug_name.to_string(),
        };
        sc.resize(info.width, info.height, true)?;
        if sc.present_enabled {
            sc.acquire_next_image()?;
        }
        Ok(sc)
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    pub fn presentation_enabled(&self) -> bool {
        self.present_enabled
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub(crate) fn current_view(&self) -> vk::ImageView {
        self.views[self.image_index as usize]
    }

    pub(crate) fn current_acquire_semaphore(&self) -> Handle<Semaphore> {
        self.acquire_semaphores[self.semaphore_index]
    }

    pub fn current_command_list_mut(&mut self) -> &mut CommandList {
        &mut self.cmd_lists[self.image_index as usize]
    }

    /// Advances the ring. Out-of-date or suboptimal surfaces force a resize
    /// to the current dimensions and retry rather than failing the frame.
    pub fn acquire_next_image(&mut self) -> Result<()> {
        debug_assert!(self.present_enabled, "acquire with presentation disabled");

        let next = (self.semaphore_index + 1) % self.buffer_count as usize;
        let sem_handle = self.acquire_semaphores[next];
        let device = unsafe { self.device.as_mut() };
        let raw_sem = {
            let sem = device.semaphore_mut(sem_handle).expect("stale semaphore");
            debug_assert!(sem.state == SyncState::Idle, "acquire semaphore still pending");
            sem.raw
        };

        let acquired = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, raw_sem, vk::Fence::null())
        };

        match acquired {
            Ok((index, false)) => {
                self.image_index = index;
                self.semaphore_index = next;
                let device = unsafe { self.device.as_mut() };
                if let Some(sem) = device.semaphore_mut(sem_handle) {
                    sem.state = SyncState::Signaled;
                }
                Ok(())
            }
            Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::info!("swapchain '{}' out of date, recreating", self.name);
                self.resize(self.width, self.height, true)?;
                self.acquire_next_image()
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Recreates the ring at a new size. A degenerate size disables
    /// presentation and performs no device work at all.
    pub fn resize(&mut self, width: u32, height: u32, force: bool) -> Result<()> {
        if is_degenerate(width, height) {
            self.present_enabled = false;
            return Ok(());
        }
        if !force && width == self.width && height == self.height && self.present_enabled {
            return Ok(());
        }

        let device = unsafe { self.device.as_mut() };
        device.wait_idle()?;

        self.destroy_ring(device);

        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(device.pdevice(), self.surface)?
        };
        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D { width, height }
        };

        let present_mode = if self.vsync {
            vk::PresentModeKHR::FIFO
        } else {
            let modes = unsafe {
                self.surface_loader
                    .get_physical_device_surface_present_modes(device.pdevice(), self.surface)?
            };
            if modes.contains(&vk::PresentModeKHR::MAILBOX) {
                vk::PresentModeKHR::MAILBOX
            } else {
                vk::PresentModeKHR::IMMEDIATE
            }
        };

        let mut min_images = self.buffer_count.max(caps.min_image_count);
        if caps.max_image_count > 0 {
            min_images = min_images.min(caps.max_image_count);
        }

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(min_images)
            .image_format(self.format.to_vk())
            .image_color_space(vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        self.swapchain = unsafe { self.loader.create_swapchain(&info, None)? };
        self.images = unsafe { self.loader.get_swapchain_images(self.swapchain)? };
        self.views = self
            .images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(self.format.to_vk())
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe { device.raw().create_image_view(&view_info, None) }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Old acquire signals died with the old swapchain.
        for handle in &self.acquire_semaphores {
            if let Some(sem) = device.semaphore_mut(*handle) {
                sem.state = SyncState::Idle;
            }
        }

        self.width = extent.width;
        self.height = extent.height;
        self.object_id = device.next_object_id();
        self.present_enabled = true;
        log::debug!(
            "swapchain '{}' recreated at {}x{} (id {})",
            self.name,
            self.width,
            self.height,
            self.object_id
        );
        Ok(())
    }

    /// Presents the current image and immediately re-acquires to keep the
    /// ring primed.
    pub fn present(&mut self, wait: Handle<Semaphore>) -> Result<()> {
        debug_assert!(self.present_enabled, "present with presentation disabled");

        let device = unsafe { self.device.as_mut() };
        let raw_wait = {
            let sem = device.semaphore_mut(wait).expect("stale present semaphore");
            debug_assert!(
                sem.state == SyncState::Signaled,
                "present wait semaphore never signaled"
            );
            sem.state = SyncState::Idle;
            sem.raw
        };

        let waits = [raw_wait];
        let swapchains = [self.swapchain];
        let indices = [self.image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let res = unsafe { self.loader.queue_present(device.graphics_queue(), &info) };
        match res {
            Ok(_) => {}
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.resize(self.width, self.height, true)?;
            }
            Err(e) => return Err(e.into()),
        }
        self.acquire_next_image()
    }

    fn destroy_ring(&mut self, device: &Device) {
        for view in self.views.drain(..) {
            unsafe { device.raw().destroy_image_view(view, None) };
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }

    pub fn destroy(mut self) {
        let mut device = self.device;
        let device = unsafe { device.as_mut() };
        let _ = device.wait_idle();

        for cmd in self.cmd_lists.drain(..) {
            cmd.destroy(device);
        }
        for sem in self.acquire_semaphores.drain(..) {
            device.destroy_semaphore(sem);
        }
        self.destroy_ring(device);
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_sizes_disable_presentation() {
        assert!(is_degenerate(0, 0));
        assert!(is_degenerate(0, 720));
        assert!(is_degenerate(1280, 0));
        assert!(!is_degenerate(1, 1));
        assert!(!is_degenerate(1280, 720));
    }
}
