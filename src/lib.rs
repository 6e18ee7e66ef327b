// The Tormenta rendering runtime
//
// A frame graph compiler and executor on top of Vulkan. Applications
// declare named passes consuming and producing named resources; the
// runtime resolves dependencies, allocates and aliases transient GPU
// memory, and records each frame in a valid order with the barriers
// needed between passes.
//
// Nothing unsafe/vulkan/ash should be exposed to upper layers.

#![allow(dead_code)]

mod cmdbuf;
mod device;
mod graph;
mod instance;
mod pool;
mod profiler;
mod renderer;
mod resources;
mod state;
mod strings;

pub use cmdbuf::CommandBuffer;
pub use graph::{
    FrameGraph, GraphBufferInfo, GraphNode, GraphResource, GraphResources, GraphTextureInfo,
    NodeHandle, ResourceInput, ResourceOutput, ResourceType, MAX_INPUTS, MAX_NODES, MAX_OUTPUTS,
};
pub use pool::{Handle, HandlePool};
pub use profiler::{Profiler, TimestampResult};
pub use renderer::{PassHandler, Renderer};
pub use resources::{
    BindingTarget, BlendState, BufferCreation, BufferHandle, BufferUsage, DepthStencilState,
    DescriptorSetHandle, PipelineState, RasterizationState, RenderPassOp, ResourceUsageType,
    SamplerCreation, SamplerHandle, ShaderStage, TechniqueHandle, TextureCreation, TextureFlags,
    TextureHandle, TextureInfo, TextureType, VertexAttribute, VertexStream,
};
pub use state::{has_depth, has_depth_or_stencil, has_stencil, QueueClass, ResourceState};
pub use strings::intern;

use thiserror::Error;

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES: usize = 2;

/// These are the errors that the Tormenta API can give you. The
/// caller matches against these to decide if the condition is fatal,
/// transient, or a usage bug on their side.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[allow(non_camel_case_types)]
pub enum TormentaError {
    #[error("The swapchain is no longer usable for this frame, skip it and retry")]
    SKIP_FRAME,
    #[error("Allocation failure")]
    OUT_OF_MEMORY,
    #[error("The device does not support a required feature")]
    FEATURE_NOT_SUPPORTED,
    #[error("Invalid argument")]
    INVALID_ARGUMENT,
    #[error("The renderer has shut down or was lost and must be recreated")]
    NOT_RUNNING,
    #[error("A pass callback reported failure")]
    FROM_CALLBACK,
    #[error("Validation layers were requested but are not present")]
    VALIDATION_NOT_PRESENT,
    #[error("This surface is not supported by the chosen physical device")]
    VK_SURF_NOT_SUPPORTED,
    #[error("Could not create a swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Presentation to the surface failed")]
    PRESENT_FAILED,
    #[error("Unsupported or mismatched format")]
    INVALID_FORMAT,
    #[error("The Vulkan device was lost")]
    DEVICE_LOST,
    #[error("This handle does not name a live resource")]
    INVALID_HANDLE,
    #[error("A name was added twice")]
    ALREADY_EXISTS,
    #[error("No resource, node or pass with this name")]
    NOT_FOUND,
    #[error("This command buffer is still recording")]
    RECORDING_IN_PROGRESS,
    #[error("Unknown error")]
    UNKNOWN,
}

pub type Result<T> = std::result::Result<T, TormentaError>;

bitflags::bitflags! {
    /// Optional device features the application can request. Each is
    /// enabled only if the physical device offers it; `Renderer::features`
    /// reports what was actually turned on.
    pub struct FeatureFlags: u32 {
        const DRAW_INDIRECT       = 1 << 0;
        const DRAW_INDIRECT_COUNT = 1 << 1;
        const STORAGE_8BIT        = 1 << 2;
        const STORAGE_16BIT       = 1 << 3;
        const BINDLESS            = 1 << 4;
        const MESH_SHADER         = 1 << 5;
    }
}

/// Parameters controlling renderer creation.
///
/// The runtime consumes only a raw surface handle and the pixel size of
/// the drawable area. Everything about windows, input and the main loop
/// stays with the caller.
pub struct CreateInfo<'a> {
    pub window: &'a dyn raw_window_handle::HasRawWindowHandle,
    pub display: &'a dyn raw_window_handle::HasRawDisplayHandle,
    pub width: u32,
    pub height: u32,
    pub app_version: u32,
    pub debug_mode: bool,
    pub features: FeatureFlags,
    /// Command buffers preallocated per frame and thread.
    pub command_buffers_per_frame: u32,
    /// Secondary recording threads the command pool partitions for.
    pub worker_threads: u32,
    pub descriptor_sets_pool_size: u32,
    pub descriptor_pool_elements: u32,
    /// Size of the per frame host visible ring for dynamic buffers.
    pub dynamic_ssbo_size: u64,
    pub profiler_enabled: bool,
}

impl<'a> CreateInfo<'a> {
    pub fn new(
        window: &'a dyn raw_window_handle::HasRawWindowHandle,
        display: &'a dyn raw_window_handle::HasRawDisplayHandle,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            window,
            display,
            width,
            height,
            app_version: 0,
            debug_mode: cfg!(debug_assertions),
            features: FeatureFlags::DRAW_INDIRECT,
            command_buffers_per_frame: 5,
            worker_threads: 0,
            descriptor_sets_pool_size: 128,
            descriptor_pool_elements: 128,
            dynamic_ssbo_size: 64 * 1024 * 1024,
            profiler_enabled: cfg!(debug_assertions),
        }
    }

    pub fn app_version(mut self, version: u32) -> Self {
        self.app_version = version;
        self
    }

    pub fn debug_mode(mut self, debug: bool) -> Self {
        self.debug_mode = debug;
        self
    }

    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    pub fn worker_threads(mut self, count: u32) -> Self {
        self.worker_threads = count;
        self
    }

    pub fn profiler_enabled(mut self, enabled: bool) -> Self {
        self.profiler_enabled = enabled;
        self
    }
}
