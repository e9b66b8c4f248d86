pub mod command_list;
pub mod descriptor;
pub mod descriptor_cache;
pub mod device;
pub mod device_selector;
pub mod error;
pub mod pipeline;
pub mod resources;
pub mod shader;
pub mod structs;
pub mod swapchain;
pub mod sync;

#[cfg(feature = "opal-winit")]
pub mod winit_window;

pub use command_list::{CommandList, CommandListState};
pub use descriptor::{Descriptor, DescriptorKind};
pub use descriptor_cache::DescriptorSetLayoutCache;
pub use device::Device;
pub use device_selector::{AdapterInfo, DeviceSelector, DeviceType, SelectedDevice};
pub use error::{GPUError, Result};
pub use pipeline::PipelineCache;
pub use resources::{Buffer, Sampler, Texture};
pub use shader::{CompilationState, Shader};
pub use structs::*;
pub use swapchain::SwapChain;
pub use sync::{Fence, Semaphore, SyncState};
