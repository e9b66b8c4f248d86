use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

use ash::vk;
use bitflags::bitflags;

use super::descriptor::Descriptor;
use super::resources::Texture;
use super::shader::Shader;
use super::swapchain::SwapChain;
use crate::utils::Handle;

#[cfg(feature = "opal-serde")]
use serde::{Deserialize, Serialize};

pub const MAX_RENDER_TARGETS: usize = 8;

bitflags! {
    #[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
    pub struct ShaderStage: u32 {
        const VERTEX = 0b001;
        const FRAGMENT = 0b010;
        const COMPUTE = 0b100;
    }
}

impl ShaderStage {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        let mut out = vk::ShaderStageFlags::empty();
        if self.contains(ShaderStage::VERTEX) {
            out |= vk::ShaderStageFlags::VERTEX;
        }
        if self.contains(ShaderStage::FRAGMENT) {
            out |= vk::ShaderStageFlags::FRAGMENT;
        }
        if self.contains(ShaderStage::COMPUTE) {
            out |= vk::ShaderStageFlags::COMPUTE;
        }
        out
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum Format {
    R8Uint,
    RG8Unorm,
    BGRA8Unorm,
    #[default]
    RGBA8Unorm,
    RGBA16F,
    RGBA32F,
    D24S8,
    D32F,
}

impl Format {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Format::R8Uint => vk::Format::R8_UINT,
            Format::RG8Unorm => vk::Format::R8G8_UNORM,
            Format::BGRA8Unorm => vk::Format::B8G8R8A8_UNORM,
            Format::RGBA8Unorm => vk::Format::R8G8B8A8_UNORM,
            Format::RGBA16F => vk::Format::R16G16B16A16_SFLOAT,
            Format::RGBA32F => vk::Format::R32G32B32A32_SFLOAT,
            Format::D24S8 => vk::Format::D24_UNORM_S8_UINT,
            Format::D32F => vk::Format::D32_SFLOAT,
        }
    }

    pub fn from_vk(fmt: vk::Format) -> Option<Format> {
        match fmt {
            vk::Format::R8_UINT => Some(Format::R8Uint),
            vk::Format::R8G8_UNORM => Some(Format::RG8Unorm),
            vk::Format::B8G8R8A8_UNORM => Some(Format::BGRA8Unorm),
            vk::Format::R8G8B8A8_UNORM => Some(Format::RGBA8Unorm),
            vk::Format::R16G16B16A16_SFLOAT => Some(Format::RGBA16F),
            vk::Format::R32G32B32A32_SFLOAT => Some(Format::RGBA32F),
            vk::Format::D24_UNORM_S8_UINT => Some(Format::D24S8),
            vk::Format::D32_SFLOAT => Some(Format::D32F),
            _ => None,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D24S8 | Format::D32F)
    }

    pub fn aspect(self) -> vk::ImageAspectFlags {
        match self {
            Format::D24S8 => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            Format::D32F => vk::ImageAspectFlags::DEPTH,
            _ => vk::ImageAspectFlags::COLOR,
        }
    }
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub struct RasterizerState {
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub polygon_mode: PolygonMode,
    pub depth_clamp: bool,
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum BlendFactor {
    One,
    Zero,
    SrcColor,
    InvSrcColor,
    #[default]
    SrcAlpha,
    InvSrcAlpha,
    DstAlpha,
    InvDstAlpha,
}

impl BlendFactor {
    pub fn to_vk(self) -> vk::BlendFactor {
        match self {
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
            BlendFactor::InvSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::InvSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
            BlendFactor::InvDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        }
    }
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    InvSubtract,
    Min,
    Max,
}

impl BlendOp {
    pub fn to_vk(self) -> vk::BlendOp {
        match self {
            BlendOp::Add => vk::BlendOp::ADD,
            BlendOp::Subtract => vk::BlendOp::SUBTRACT,
            BlendOp::InvSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOp::Min => vk::BlendOp::MIN,
            BlendOp::Max => vk::BlendOp::MAX,
        }
    }
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub struct BlendState {
    pub enable: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enable: false,
            src_color: BlendFactor::SrcAlpha,
            dst_color: BlendFactor::InvSrcAlpha,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
        }
    }
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    #[default]
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    pub fn to_vk(self) -> vk::CompareOp {
        match self {
            CompareOp::Never => vk::CompareOp::NEVER,
            CompareOp::Less => vk::CompareOp::LESS,
            CompareOp::Equal => vk::CompareOp::EQUAL,
            CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareOp::Greater => vk::CompareOp::GREATER,
            CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
            CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareOp::Always => vk::CompareOp::ALWAYS,
        }
    }
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: CompareOp,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            compare: CompareOp::LessOrEqual,
        }
    }
}

#[derive(Hash, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum Topology {
    #[default]
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

impl Topology {
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
            Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
        }
    }
}

#[derive(Hash, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum QueueType {
    #[default]
    Graphics,
    Compute,
    Transfer,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum MemoryVisibility {
    Gpu,
    CpuAndGpu,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum BufferUsage {
    Vertex,
    Index,
    Constant,
    Storage,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum WindowBuffering {
    Double,
    #[default]
    Triple,
}

impl WindowBuffering {
    pub fn count(self) -> u32 {
        match self {
            WindowBuffering::Double => 2,
            WindowBuffering::Triple => 3,
        }
    }
}

#[derive(Debug, Hash, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub struct Rect2D {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            w: 1280.0,
            h: 1024.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

// Float state is hashed bitwise so identical values always collide.
impl Hash for Viewport {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.x.to_bits().hash(state);
        self.y.to_bits().hash(state);
        self.w.to_bits().hash(state);
        self.h.to_bits().hash(state);
        self.min_depth.to_bits().hash(state);
        self.max_depth.to_bits().hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl Hash for ClearValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ClearValue::Color(c) => {
                0u8.hash(state);
                for f in c {
                    f.to_bits().hash(state);
                }
            }
            ClearValue::DepthStencil { depth, stencil } => {
                1u8.hash(state);
                depth.to_bits().hash(state);
                stencil.hash(state);
            }
        }
    }
}

pub struct DeviceInfo<'a> {
    pub debug_name: &'a str,
    /// Skip surface extensions entirely. Off-screen rendering still works.
    pub headless: bool,
    pub enable_validation: bool,
}

impl<'a> Default for DeviceInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "opal device",
            headless: false,
            enable_validation: cfg!(debug_assertions),
        }
    }
}

pub struct TextureInfo<'a> {
    pub debug_name: &'a str,
    pub dim: [u32; 2],
    pub format: Format,
    pub mip_levels: u32,
    pub layers: u32,
    pub render_target: bool,
}

impl<'a> Default for TextureInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            dim: [1280, 1024],
            format: Format::RGBA8Unorm,
            mip_levels: 1,
            layers: 1,
            render_target: false,
        }
    }
}

pub struct BufferInfo<'a> {
    pub debug_name: &'a str,
    pub byte_size: u32,
    pub usage: BufferUsage,
    pub visibility: MemoryVisibility,
    pub stride: u32,
    pub initial_data: Option<&'a [u8]>,
}

impl<'a> Default for BufferInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            byte_size: 1024,
            usage: BufferUsage::Constant,
            visibility: MemoryVisibility::CpuAndGpu,
            stride: 0,
            initial_data: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "opal-serde", derive(Serialize, Deserialize))]
pub enum SamplerAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerInfo<'a> {
    pub debug_name: &'a str,
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub address_mode: SamplerAddressMode,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
}

impl<'a> Default for SamplerInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            address_mode: SamplerAddressMode::Repeat,
            anisotropy_enable: false,
            max_anisotropy: 1.0,
        }
    }
}

pub struct ShaderInfo<'a> {
    pub debug_name: &'a str,
    pub stage: ShaderStage,
    pub entry_point: &'a str,
    pub spirv: &'a [u32],
    /// Reflected binding shapes. Reflection runs outside this crate; the
    /// bindings arrive here already ordered by slot.
    pub descriptors: &'a [Descriptor],
}

impl<'a> Default for ShaderInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            stage: ShaderStage::VERTEX,
            entry_point: "main",
            spirv: &[],
            descriptors: &[],
        }
    }
}

pub struct SwapChainInfo<'a> {
    pub debug_name: &'a str,
    pub width: u32,
    pub height: u32,
    pub buffering: WindowBuffering,
    pub vsync: bool,
    pub format: Format,
}

impl<'a> Default for SwapChainInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "swapchain",
            width: 1280,
            height: 1024,
            buffering: WindowBuffering::Triple,
            vsync: true,
            format: Format::BGRA8Unorm,
        }
    }
}

/// The attachment formats a [`PipelineState`] resolves to. Resolution needs
/// the device's resource pools, but once resolved the struct is plain data
/// so pipeline hashing stays a pure computation.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Default)]
pub struct RenderTargetFormats {
    pub colors: [Option<Format>; MAX_RENDER_TARGETS],
    pub depth: Option<Format>,
}

impl RenderTargetFormats {
    pub fn color_count(&self) -> usize {
        self.colors.iter().filter(|c| c.is_some()).count()
    }
}

/// The full description of a draw configuration. Built by the caller each
/// frame and consumed as a cache key by the descriptor and pipeline caches.
#[derive(Clone)]
pub struct PipelineState {
    pub pass_name: String,
    pub vertex_shader: Option<Handle<Shader>>,
    pub pixel_shader: Option<Handle<Shader>>,
    pub compute_shader: Option<Handle<Shader>>,
    pub render_targets: [Option<Handle<Texture>>; MAX_RENDER_TARGETS],
    pub depth_target: Option<Handle<Texture>>,
    pub clear_values: [Option<ClearValue>; MAX_RENDER_TARGETS],
    pub clear_depth: Option<ClearValue>,
    pub rasterizer: RasterizerState,
    pub blend: BlendState,
    pub depth_stencil: DepthStencilState,
    pub topology: Topology,
    pub vertex_stride: u32,
    pub viewport: Viewport,
    pub scissor: Rect2D,
    pub dynamic_constant_buffer_slots: Vec<u32>,
    pub swapchain: Option<NonNull<SwapChain>>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            pass_name: String::new(),
            vertex_shader: None,
            pixel_shader: None,
            compute_shader: None,
            render_targets: [None; MAX_RENDER_TARGETS],
            depth_target: None,
            clear_values: [None; MAX_RENDER_TARGETS],
            clear_depth: None,
            rasterizer: RasterizerState::default(),
            blend: BlendState::default(),
            depth_stencil: DepthStencilState::default(),
            topology: Topology::default(),
            vertex_stride: 0,
            viewport: Viewport::default(),
            scissor: Rect2D::default(),
            dynamic_constant_buffer_slots: Vec::new(),
            swapchain: None,
        }
    }
}

impl PipelineState {
    pub fn is_compute(&self) -> bool {
        self.compute_shader.is_some()
    }

    pub fn targets_swapchain(&self) -> bool {
        self.swapchain.is_some()
    }

    /// Graphics XOR compute, and graphics always has a vertex stage.
    pub fn validate(&self) -> crate::gpu::error::Result<()> {
        use crate::gpu::error::GPUError;
        let graphics = self.vertex_shader.is_some() || self.pixel_shader.is_some();
        if graphics && self.compute_shader.is_some() {
            return Err(GPUError::InvalidPipelineState(
                "both graphics and compute shaders set",
            ));
        }
        if !graphics && self.compute_shader.is_none() {
            return Err(GPUError::InvalidPipelineState("no shaders set"));
        }
        if graphics && self.vertex_shader.is_none() {
            return Err(GPUError::InvalidPipelineState(
                "pixel shader without a vertex shader",
            ));
        }
        if self.compute_shader.is_some()
            && (self.depth_target.is_some() || self.render_targets.iter().any(|t| t.is_some()))
        {
            return Err(GPUError::InvalidPipelineState(
                "compute pipeline with render targets",
            ));
        }
        Ok(())
    }

    /// Content hash shared by the pipeline cache. Viewport and scissor are
    /// excluded: both are dynamic pipeline states and never force a distinct
    /// pipeline object.
    pub fn content_hash(&self, formats: &RenderTargetFormats) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.vertex_shader.hash(&mut hasher);
        self.pixel_shader.hash(&mut hasher);
        self.compute_shader.hash(&mut hasher);
        self.rasterizer.hash(&mut hasher);
        self.blend.hash(&mut hasher);
        self.depth_stencil.hash(&mut hasher);
        self.topology.hash(&mut hasher);
        self.vertex_stride.hash(&mut hasher);
        formats.hash(&mut hasher);
        // Load ops are baked into the render pass, so whether an attachment
        // clears on begin is part of pipeline identity.
        for clear in &self.clear_values {
            clear.is_some().hash(&mut hasher);
        }
        self.clear_depth.is_some().hash(&mut hasher);
        self.dynamic_constant_buffer_slots.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shader_handle(slot: u16) -> Handle<Shader> {
        Handle::from_raw(slot, 0)
    }

    fn graphics_state() -> PipelineState {
        PipelineState {
            pass_name: "test".into(),
            vertex_shader: Some(shader_handle(0)),
            pixel_shader: Some(shader_handle(1)),
            ..Default::default()
        }
    }

    #[test]
    fn validate_rejects_mixed_and_empty_states() {
        let mut state = graphics_state();
        assert!(state.validate().is_ok());

        state.compute_shader = Some(shader_handle(2));
        assert!(state.validate().is_err());

        let empty = PipelineState::default();
        assert!(empty.validate().is_err());

        let orphan_pixel = PipelineState {
            pixel_shader: Some(shader_handle(1)),
            ..Default::default()
        };
        assert!(orphan_pixel.validate().is_err());
    }

    #[test]
    fn validate_rejects_compute_with_render_targets() {
        let mut state = PipelineState {
            compute_shader: Some(shader_handle(0)),
            ..Default::default()
        };
        assert!(state.validate().is_ok());
        state.render_targets[0] = Some(Handle::from_raw(3, 0));
        assert!(state.validate().is_err());
    }

    #[test]
    fn hash_changes_when_cull_mode_flips() {
        let formats = RenderTargetFormats {
            colors: [Some(Format::RGBA8Unorm), None, None, None, None, None, None, None],
            depth: Some(Format::D24S8),
        };
        let a = graphics_state();
        let mut b = graphics_state();
        assert_eq!(a.content_hash(&formats), b.content_hash(&formats));

        b.rasterizer.cull_mode = CullMode::Front;
        assert_ne!(a.content_hash(&formats), b.content_hash(&formats));
    }

    #[test]
    fn hash_ignores_viewport_and_scissor() {
        let formats = RenderTargetFormats::default();
        let a = graphics_state();
        let mut b = graphics_state();
        b.viewport.w = 64.0;
        b.scissor.w = 64;
        assert_eq!(a.content_hash(&formats), b.content_hash(&formats));
    }

    #[test]
    fn hash_sees_formats_and_clear_ops() {
        let a = graphics_state();
        let plain = RenderTargetFormats {
            colors: [Some(Format::RGBA8Unorm), None, None, None, None, None, None, None],
            depth: None,
        };
        let other = RenderTargetFormats {
            colors: [Some(Format::RGBA32F), None, None, None, None, None, None, None],
            depth: None,
        };
        assert_ne!(a.content_hash(&plain), a.content_hash(&other));

        let mut clearing = graphics_state();
        clearing.clear_values[0] = Some(ClearValue::Color([0.0; 4]));
        assert_ne!(a.content_hash(&plain), clearing.content_hash(&plain));
    }
}
