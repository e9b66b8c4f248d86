use std::fmt;

use ash::vk;

use super::command_list::CommandListState;

#[derive(Debug)]
pub struct VulkanError {
    res: ash::vk::Result,
}

impl VulkanError {
    pub fn result(&self) -> vk::Result {
        self.res
    }
}

impl fmt::Display for VulkanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vulkan Error: {}", self.res)
    }
}

#[derive(Debug)]
pub enum GPUError {
    VulkanError(VulkanError),
    LoadingError(ash::LoadingError),
    SlotError(),
    /// A descriptor set was requested from a pool whose live-set count
    /// already equals its capacity. The caller is expected to flush, wait,
    /// and grow the pool before retrying.
    DescriptorPoolExhausted {
        capacity: u32,
    },
    InvalidPipelineState(&'static str),
    InvalidCommandListState {
        op: &'static str,
        state: CommandListState,
    },
    ShaderCompilationFailed(String),
    /// The descriptor cache's clearing guard did not lift within its
    /// timeout. Something is holding the cache in the clearing state.
    ClearTimeout,
    NoSuitableDevice,
    HeadlessDisplayNotSupported,
    WindowCreationFailed,
    Unimplemented(&'static str),
}

/// Convenient crate-wide result type.
pub type Result<T, E = GPUError> = std::result::Result<T, E>;

impl fmt::Display for GPUError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GPUError::VulkanError(e) => write!(f, "{}", e),
            GPUError::LoadingError(e) => write!(f, "Failed to load vulkan library: {}", e),
            GPUError::SlotError() => write!(f, "Ran out of slots!"),
            GPUError::DescriptorPoolExhausted { capacity } => {
                write!(f, "Descriptor pool exhausted at capacity {}", capacity)
            }
            GPUError::InvalidPipelineState(why) => {
                write!(f, "Invalid pipeline state: {}", why)
            }
            GPUError::InvalidCommandListState { op, state } => {
                write!(f, "Command list operation '{}' invalid in state {:?}", op, state)
            }
            GPUError::ShaderCompilationFailed(why) => {
                write!(f, "Shader compilation failed: {}", why)
            }
            GPUError::ClearTimeout => {
                write!(f, "Timed out waiting for descriptor cache clear to finish")
            }
            GPUError::NoSuitableDevice => write!(f, "No suitable physical device found"),
            GPUError::HeadlessDisplayNotSupported => {
                write!(f, "Display creation requested on a headless context")
            }
            GPUError::WindowCreationFailed => write!(f, "Failed to create a window"),
            GPUError::Unimplemented(what) => write!(f, "Unimplemented: {}", what),
        }
    }
}

impl std::error::Error for GPUError {}

impl From<ash::vk::Result> for GPUError {
    fn from(res: ash::vk::Result) -> Self {
        GPUError::VulkanError(VulkanError { res })
    }
}

impl From<ash::LoadingError> for GPUError {
    fn from(res: ash::LoadingError) -> Self {
        GPUError::LoadingError(res)
    }
}

/// Logs and forwards a device-level error. Applied on the submission and
/// fence-wait paths, where the failing call is far removed from the work
/// that caused it and the log line is the only trace. Creation-path errors
/// propagate directly; their callers hold enough context to report them.
pub fn check<T>(res: Result<T>) -> Result<T> {
    if let Err(e) = &res {
        log::error!("gpu: {}", e);
    }
    res
}
