use ash::vk::{self, Handle as VkHandle};

use super::structs::{BufferUsage, Format, MemoryVisibility};

/// A sampled or renderable image plus its view. Swapchain images carry no
/// allocation; everything else is vk-mem backed.
pub struct Texture {
    pub(crate) raw: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) allocation: Option<vk_mem::Allocation>,
    pub(crate) dim: [u32; 2],
    pub(crate) format: Format,
    pub(crate) mip_levels: u32,
    pub(crate) layers: u32,
    /// Current image layout, tracked host-side so barriers can pick correct
    /// source masks.
    pub(crate) layout: vk::ImageLayout,
    pub(crate) render_target: bool,
    pub(crate) name: String,
}

impl Texture {
    /// Opaque identity used for descriptor value hashing.
    pub fn gpu_id(&self) -> u64 {
        self.view.as_raw()
    }

    pub fn dim(&self) -> [u32; 2] {
        self.dim
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct Buffer {
    pub(crate) raw: vk::Buffer,
    pub(crate) allocation: vk_mem::Allocation,
    pub(crate) byte_size: u32,
    pub(crate) stride: u32,
    pub(crate) offset: u32,
    pub(crate) usage: BufferUsage,
    pub(crate) visibility: MemoryVisibility,
    pub(crate) name: String,
}

impl Buffer {
    pub fn gpu_id(&self) -> u64 {
        self.raw.as_raw()
    }

    pub fn byte_size(&self) -> u32 {
        self.byte_size
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn visibility(&self) -> MemoryVisibility {
        self.visibility
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct Sampler {
    pub(crate) raw: vk::Sampler,
    pub(crate) name: String,
}

impl Sampler {
    pub fn gpu_id(&self) -> u64 {
        self.raw.as_raw()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
