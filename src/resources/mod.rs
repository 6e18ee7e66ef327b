// GPU resource descriptions and pool entries
//
// Everything the device hands out is a 16 bit handle into one of the
// pools defined here. Creation goes through plain descriptor values
// with chainable setters; the pool entries own the Vulkan objects and
// the bookkeeping the rest of the runtime needs (current state,
// suballocation offsets, reflection tables).

pub mod buffer;
pub mod descriptor;
pub mod image;
pub mod pipeline;
pub mod program;

use crate::pool::Handle;
use crate::state::ResourceState;
use arrayvec::ArrayVec;
use ash::vk;
use gpu_allocator::vulkan::Allocation;

pub const MAX_IMAGE_OUTPUTS: usize = 8;
pub const MAX_DESCRIPTOR_SET_LAYOUTS: usize = 8;
pub const MAX_DESCRIPTORS_PER_SET: usize = 16;
pub const MAX_VERTEX_STREAMS: usize = 16;
pub const MAX_VERTEX_ATTRIBUTES: usize = 16;
pub const MAX_SHADER_STAGES: usize = 5;

pub type BufferHandle = Handle<Buffer>;
pub type TextureHandle = Handle<Texture>;
pub type SamplerHandle = Handle<Sampler>;
pub type RenderPassHandle = Handle<RenderPass>;
pub type FramebufferHandle = Handle<Framebuffer>;
pub type DescriptorSetHandle = Handle<DescriptorSet>;
pub type DescriptorSetLayoutHandle = Handle<DescriptorSetLayout>;
pub type ProgramHandle = Handle<Program>;
pub type PipelineHandle = Handle<Pipeline>;
pub type TechniqueHandle = Handle<Technique>;

bitflags::bitflags! {
    /// Buffer roles, mapped onto VkBufferUsageFlags at creation.
    pub struct BufferUsage: u32 {
        const VERTEX   = 1 << 0;
        const INDEX    = 1 << 1;
        const UNIFORM  = 1 << 2;
        const STORAGE  = 1 << 3;
        const INDIRECT = 1 << 4;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        BufferUsage::empty()
    }
}

impl BufferUsage {
    pub(crate) fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if self.contains(BufferUsage::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(BufferUsage::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(BufferUsage::UNIFORM) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(BufferUsage::STORAGE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(BufferUsage::INDIRECT) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        flags
    }
}

/// How a buffer's memory behaves over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceUsageType {
    /// Device local, uploaded once through staging.
    #[default]
    Immutable,
    /// Suballocated from the per frame host visible ring.
    Dynamic,
    /// Host visible scratch for uploads.
    Staging,
}

bitflags::bitflags! {
    /// What a texture will be used for. Sampled access is always
    /// granted on top of these.
    pub struct TextureFlags: u32 {
        const RENDER_TARGET = 1 << 0;
        const COMPUTE       = 1 << 1;
    }
}

impl Default for TextureFlags {
    fn default() -> Self {
        TextureFlags::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureType {
    D1,
    #[default]
    D2,
    D3,
    Cube,
}

impl TextureType {
    pub(crate) fn to_vk(self) -> vk::ImageType {
        match self {
            TextureType::D1 => vk::ImageType::TYPE_1D,
            TextureType::D2 | TextureType::Cube => vk::ImageType::TYPE_2D,
            TextureType::D3 => vk::ImageType::TYPE_3D,
        }
    }

    pub(crate) fn to_vk_view(self) -> vk::ImageViewType {
        match self {
            TextureType::D1 => vk::ImageViewType::TYPE_1D,
            TextureType::D2 => vk::ImageViewType::TYPE_2D,
            TextureType::D3 => vk::ImageViewType::TYPE_3D,
            TextureType::Cube => vk::ImageViewType::CUBE,
        }
    }
}

/// Load operation for an attachment at render pass begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderPassOp {
    #[default]
    DontCare,
    Load,
    Clear,
}

impl RenderPassOp {
    pub(crate) fn to_vk(self) -> vk::AttachmentLoadOp {
        match self {
            RenderPassOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
            RenderPassOp::Load => vk::AttachmentLoadOp::LOAD,
            RenderPassOp::Clear => vk::AttachmentLoadOp::CLEAR,
        }
    }
}

// ----------------------------------------------------------------------
// Creation descriptors
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct BufferCreation {
    pub usage: BufferUsage,
    pub usage_type: ResourceUsageType,
    pub size: u64,
    pub initial_data: Option<Vec<u8>>,
    pub fill_value: Option<u32>,
    pub name: &'static str,
}

impl BufferCreation {
    pub fn set(mut self, usage: BufferUsage, usage_type: ResourceUsageType, size: u64) -> Self {
        self.usage = usage;
        self.usage_type = usage_type;
        self.size = size;
        self
    }

    pub fn set_initial_data(mut self, data: Vec<u8>) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn set_fill_value(mut self, value: u32) -> Self {
        self.fill_value = Some(value);
        self
    }

    pub fn set_name(mut self, name: &str) -> Self {
        self.name = crate::strings::intern(name);
        self
    }
}

pub struct TextureCreation {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub flags: TextureFlags,
    pub format: vk::Format,
    pub texture_type: TextureType,
    /// Reuse the memory of this texture. Caller guarantees the two
    /// live intervals do not overlap.
    pub alias: TextureHandle,
    pub initial_data: Option<Vec<u8>>,
    pub name: &'static str,
}

impl Default for TextureCreation {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            flags: TextureFlags::empty(),
            format: vk::Format::R8G8B8A8_UNORM,
            texture_type: TextureType::D2,
            alias: TextureHandle::INVALID,
            initial_data: None,
            name: "",
        }
    }
}

impl TextureCreation {
    pub fn set_size(mut self, width: u32, height: u32, depth: u32) -> Self {
        self.width = width;
        self.height = height;
        self.depth = depth;
        self
    }

    pub fn set_flags(mut self, mip_levels: u32, render_target: bool, compute: bool) -> Self {
        self.mip_levels = mip_levels;
        if render_target {
            self.flags |= TextureFlags::RENDER_TARGET;
        }
        if compute {
            self.flags |= TextureFlags::COMPUTE;
        }
        self
    }

    pub fn set_format(mut self, format: vk::Format, texture_type: TextureType) -> Self {
        self.format = format;
        self.texture_type = texture_type;
        self
    }

    pub fn set_alias(mut self, alias: TextureHandle) -> Self {
        self.alias = alias;
        self
    }

    pub fn set_data(mut self, data: Vec<u8>) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn set_name(mut self, name: &str) -> Self {
        self.name = crate::strings::intern(name);
        self
    }
}

pub struct SamplerCreation {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mip_filter: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub reduction_mode: Option<vk::SamplerReductionMode>,
    pub name: &'static str,
}

impl Default for SamplerCreation {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::NEAREST,
            mag_filter: vk::Filter::NEAREST,
            mip_filter: vk::SamplerMipmapMode::NEAREST,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            reduction_mode: None,
            name: "",
        }
    }
}

impl SamplerCreation {
    pub fn set_min_mag_mip(
        mut self,
        min: vk::Filter,
        mag: vk::Filter,
        mip: vk::SamplerMipmapMode,
    ) -> Self {
        self.min_filter = min;
        self.mag_filter = mag;
        self.mip_filter = mip;
        self
    }

    pub fn set_address_mode_uvw(
        mut self,
        u: vk::SamplerAddressMode,
        v: vk::SamplerAddressMode,
        w: vk::SamplerAddressMode,
    ) -> Self {
        self.address_mode_u = u;
        self.address_mode_v = v;
        self.address_mode_w = w;
        self
    }

    pub fn set_reduction_mode(mut self, mode: vk::SamplerReductionMode) -> Self {
        self.reduction_mode = Some(mode);
        self
    }

    pub fn set_name(mut self, name: &str) -> Self {
        self.name = crate::strings::intern(name);
        self
    }
}

/// The attachment shape of a render pass: formats, final layouts and
/// load operations, color slots in declaration order plus at most one
/// depth stencil slot.
#[derive(Clone, Default)]
pub struct RenderPassOutput {
    pub color_formats: ArrayVec<vk::Format, MAX_IMAGE_OUTPUTS>,
    pub color_final_layouts: ArrayVec<vk::ImageLayout, MAX_IMAGE_OUTPUTS>,
    pub color_ops: ArrayVec<RenderPassOp, MAX_IMAGE_OUTPUTS>,
    pub depth_stencil_format: vk::Format,
    pub depth_stencil_final_layout: vk::ImageLayout,
    pub depth_op: RenderPassOp,
    pub stencil_op: RenderPassOp,
}

impl RenderPassOutput {
    pub fn color(mut self, format: vk::Format, layout: vk::ImageLayout, op: RenderPassOp) -> Self {
        self.color_formats.push(format);
        self.color_final_layouts.push(layout);
        self.color_ops.push(op);
        self
    }

    pub fn depth(mut self, format: vk::Format, layout: vk::ImageLayout) -> Self {
        self.depth_stencil_format = format;
        self.depth_stencil_final_layout = layout;
        self
    }

    pub fn set_depth_stencil_ops(mut self, depth: RenderPassOp, stencil: RenderPassOp) -> Self {
        self.depth_op = depth;
        self.stencil_op = stencil;
        self
    }
}

#[derive(Default)]
pub struct RenderPassCreation {
    pub output: RenderPassOutput,
    pub name: &'static str,
}

impl RenderPassCreation {
    pub fn set_name(mut self, name: &str) -> Self {
        self.name = crate::strings::intern(name);
        self
    }
}

#[derive(Default)]
pub struct FramebufferCreation {
    pub render_pass: RenderPassHandle,
    pub color_attachments: ArrayVec<TextureHandle, MAX_IMAGE_OUTPUTS>,
    pub depth_stencil_attachment: TextureHandle,
    pub width: u32,
    pub height: u32,
    pub name: &'static str,
}

impl FramebufferCreation {
    pub fn add_render_texture(mut self, texture: TextureHandle) -> Self {
        self.color_attachments.push(texture);
        self
    }

    pub fn set_depth_stencil_texture(mut self, texture: TextureHandle) -> Self {
        self.depth_stencil_attachment = texture;
        self
    }

    pub fn set_name(mut self, name: &str) -> Self {
        self.name = crate::strings::intern(name);
        self
    }
}

/// One SPIR-V stage of a program.
#[derive(Clone)]
pub struct ShaderStage {
    pub code: Vec<u32>,
    pub stage: vk::ShaderStageFlags,
    pub entry_point: String,
}

#[derive(Clone, Default)]
pub struct ProgramCreation {
    pub stages: ArrayVec<ShaderStage, MAX_SHADER_STAGES>,
    pub name: &'static str,
}

impl ProgramCreation {
    pub fn add_stage(mut self, code: &[u32], stage: vk::ShaderStageFlags) -> Self {
        self.stages.push(ShaderStage {
            code: code.to_vec(),
            stage,
            entry_point: "main".to_owned(),
        });
        self
    }

    pub fn set_name(mut self, name: &str) -> Self {
        self.name = crate::strings::intern(name);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RasterizationState {
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub polygon_mode: vk::PolygonMode,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            polygon_mode: vk::PolygonMode::FILL,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare: vk::CompareOp,
    pub stencil_enable: bool,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enable: false,
            depth_write_enable: false,
            depth_compare: vk::CompareOp::ALWAYS,
            stencil_enable: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlendState {
    pub blend_enabled: bool,
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
    pub color_write_mask: vk::ColorComponentFlags,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            blend_enabled: false,
            src_color: vk::BlendFactor::ONE,
            dst_color: vk::BlendFactor::ZERO,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ZERO,
            alpha_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VertexStream {
    pub binding: u32,
    pub stride: u32,
    pub instanced: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub offset: u32,
    pub format: vk::Format,
}

/// Everything needed to compile one pipeline of a technique.
#[derive(Default)]
pub struct PipelineState {
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub blend_states: ArrayVec<BlendState, MAX_IMAGE_OUTPUTS>,
    pub vertex_streams: ArrayVec<VertexStream, MAX_VERTEX_STREAMS>,
    pub vertex_attributes: ArrayVec<VertexAttribute, MAX_VERTEX_ATTRIBUTES>,
    pub program: ProgramCreation,
    /// Frame graph node this pipeline renders into. Empty targets the
    /// swapchain pass.
    pub node: &'static str,
}

impl PipelineState {
    pub fn new(node: &str) -> Self {
        Self {
            node: crate::strings::intern(node),
            ..Default::default()
        }
    }

    pub fn set_program(mut self, program: ProgramCreation) -> Self {
        self.program = program;
        self
    }

    pub fn set_rasterization(mut self, rasterization: RasterizationState) -> Self {
        self.rasterization = rasterization;
        self
    }

    pub fn set_depth_stencil(mut self, depth_stencil: DepthStencilState) -> Self {
        self.depth_stencil = depth_stencil;
        self
    }

    pub fn add_blend_state(mut self, blend: BlendState) -> Self {
        self.blend_states.push(blend);
        self
    }

    pub fn add_vertex_stream(mut self, stream: VertexStream) -> Self {
        self.vertex_streams.push(stream);
        self
    }

    pub fn add_vertex_attribute(mut self, attribute: VertexAttribute) -> Self {
        self.vertex_attributes.push(attribute);
        self
    }
}

// ----------------------------------------------------------------------
// Pool entries
// ----------------------------------------------------------------------

/// Info reported back through `get_texture_info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub format: vk::Format,
    pub texture_type: TextureType,
}

#[derive(Default)]
pub struct Buffer {
    pub vk_buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub usage: BufferUsage,
    pub usage_type: ResourceUsageType,
    pub size: u64,
    /// Offset of this suballocation inside `parent`, when dynamic.
    pub global_offset: u64,
    pub mapped_ptr: Option<std::ptr::NonNull<u8>>,
    pub parent: BufferHandle,
    pub state: ResourceState,
    pub name: &'static str,
}

// The mapped pointer targets memory owned by the allocator; moving the
// Buffer entry around does not move the mapping.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

#[derive(Default)]
pub struct Texture {
    pub vk_image: vk::Image,
    pub vk_view: vk::ImageView,
    pub vk_format: vk::Format,
    pub state: ResourceState,
    pub allocation: Option<Allocation>,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub flags: TextureFlags,
    pub texture_type: TextureType,
    pub sampler: SamplerHandle,
    /// Set when this image is bound to another texture's memory.
    pub alias_of: TextureHandle,
    pub name: &'static str,
}

#[derive(Default)]
pub struct Sampler {
    pub vk_sampler: vk::Sampler,
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mip_filter: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub name: &'static str,
}

#[derive(Default)]
pub struct RenderPass {
    pub vk_render_pass: vk::RenderPass,
    pub output: RenderPassOutput,
    pub name: &'static str,
}

#[derive(Default)]
pub struct Framebuffer {
    pub vk_framebuffer: vk::Framebuffer,
    pub render_pass: RenderPassHandle,
    pub width: u32,
    pub height: u32,
    pub color_attachments: ArrayVec<TextureHandle, MAX_IMAGE_OUTPUTS>,
    pub depth_stencil_attachment: TextureHandle,
    pub name: &'static str,
}

/// Reflection data for one descriptor set of a program.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutData {
    pub set_number: u32,
    pub bindings: Vec<DescriptorBinding>,
}

#[derive(Debug, Clone)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
    pub name: &'static str,
}

#[derive(Default)]
pub struct DescriptorSetLayout {
    pub vk_layout: vk::DescriptorSetLayout,
    pub data: DescriptorSetLayoutData,
}

/// What a descriptor set binding currently points at. Frame graph
/// names resolve to concrete handles at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingTarget {
    #[default]
    Empty,
    Buffer(BufferHandle),
    Texture(TextureHandle),
    /// A frame graph resource, resolved through the graph each frame.
    GraphResource(&'static str),
}

#[derive(Default)]
pub struct DescriptorSet {
    pub vk_set: vk::DescriptorSet,
    pub bindings: [BindingTarget; MAX_DESCRIPTORS_PER_SET],
    pub samplers: [SamplerHandle; MAX_DESCRIPTORS_PER_SET],
    /// What the last flush wrote per binding, to skip redundant
    /// vkUpdateDescriptorSets.
    pub cached: [BindingTarget; MAX_DESCRIPTORS_PER_SET],
    /// Frame number this set was last flushed in.
    pub last_frame: u64,
    pub layout: DescriptorSetLayoutHandle,
}

#[derive(Default)]
pub struct Program {
    pub stages: ArrayVec<ShaderStage, MAX_SHADER_STAGES>,
    pub modules: ArrayVec<vk::ShaderModule, MAX_SHADER_STAGES>,
    pub graphics: bool,
    /// Reflected set layouts keyed by set number.
    pub sets: Vec<DescriptorSetLayoutData>,
    pub push_constant_size: u32,
    pub name: &'static str,
}

#[derive(Default)]
pub struct Pipeline {
    pub vk_pipeline: vk::Pipeline,
    pub vk_layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub program: ProgramHandle,
    pub render_pass: RenderPassHandle,
    pub set_layouts: ArrayVec<DescriptorSetLayoutHandle, MAX_DESCRIPTOR_SET_LAYOUTS>,
    pub graphics: bool,
    pub name: &'static str,
}

/// A named group of pipelines, each targeting one frame graph node.
#[derive(Default)]
pub struct Technique {
    pub pipelines: Vec<PipelineHandle>,
    pub name: &'static str,
}

/// All the pools, together. The device owns one of these behind a
/// lock; command buffers and worker threads share it read-mostly.
pub struct ResourceStore {
    pub buffers: crate::pool::HandlePool<Buffer>,
    pub textures: crate::pool::HandlePool<Texture>,
    pub samplers: crate::pool::HandlePool<Sampler>,
    pub render_passes: crate::pool::HandlePool<RenderPass>,
    pub framebuffers: crate::pool::HandlePool<Framebuffer>,
    pub descriptor_sets: crate::pool::HandlePool<DescriptorSet>,
    pub descriptor_set_layouts: crate::pool::HandlePool<DescriptorSetLayout>,
    pub programs: crate::pool::HandlePool<Program>,
    pub pipelines: crate::pool::HandlePool<Pipeline>,
    pub techniques: crate::pool::HandlePool<Technique>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self {
            buffers: crate::pool::HandlePool::new(256),
            textures: crate::pool::HandlePool::new(256),
            samplers: crate::pool::HandlePool::new(32),
            render_passes: crate::pool::HandlePool::new(64),
            framebuffers: crate::pool::HandlePool::new(64),
            descriptor_sets: crate::pool::HandlePool::new(128),
            descriptor_set_layouts: crate::pool::HandlePool::new(64),
            programs: crate::pool::HandlePool::new(64),
            pipelines: crate::pool::HandlePool::new(64),
            techniques: crate::pool::HandlePool::new(32),
        }
    }
}
