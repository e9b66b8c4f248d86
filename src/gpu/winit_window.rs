use winit::dpi::PhysicalSize;
use winit::event_loop::EventLoop;
use winit::window::WindowBuilder;

use super::error::{GPUError, Result};

pub struct WindowInfo {
    pub title: String,
    pub size: [u32; 2],
    pub resizable: bool,
}

impl Default for WindowInfo {
    fn default() -> Self {
        Self {
            title: "opal".to_string(),
            size: [1280, 720],
            resizable: true,
        }
    }
}

/// Convenience window for tests and small tools. The returned window
/// implements `HasRawWindowHandle` and plugs straight into
/// [`SwapChain::new`](super::SwapChain::new).
pub fn create_window(info: &WindowInfo) -> Result<(EventLoop<()>, winit::window::Window)> {
    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title(info.title.clone())
        .with_inner_size(PhysicalSize::new(info.size[0], info.size[1]))
        .with_resizable(info.resizable)
        .build(&event_loop)
        .map_err(|_| GPUError::WindowCreationFailed)?;
    Ok((event_loop, window))
}
