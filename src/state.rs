// GPU resource states and barrier derivation
//
// Textures and buffers track the abstract state they were last left
// in. Transitions between states become the minimum
// vkCmdPipelineBarrier: the access masks come straight from the state
// bits, the image layout from a priority ordering of the bits, and
// the stage masks from the access masks plus the queue class that
// will execute the barrier.

use ash::vk;

bitflags::bitflags! {
    /// Abstract usage states a resource can be in. Combinations are
    /// legal for read states (e.g. shader resource + copy source).
    pub struct ResourceState: u32 {
        const UNDEFINED                  = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const INDEX_BUFFER               = 1 << 1;
        const RENDER_TARGET              = 1 << 2;
        const UNORDERED_ACCESS           = 1 << 3;
        const DEPTH_WRITE                = 1 << 4;
        const DEPTH_READ                 = 1 << 5;
        const SHADER_RESOURCE            = 1 << 6;
        const INDIRECT_ARGUMENT          = 1 << 7;
        const COPY_DEST                  = 1 << 8;
        const COPY_SOURCE                = 1 << 9;
        const PRESENT                    = 1 << 10;
        const COMMON                     = 1 << 11;
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        ResourceState::UNDEFINED
    }
}

/// The queue class a barrier will execute on. Stage derivation is
/// narrower on compute and transfer queues since most graphics stages
/// do not exist there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClass {
    Graphics,
    Compute,
    Transfer,
}

pub fn to_vk_access_flags(state: ResourceState) -> vk::AccessFlags {
    let mut ret = vk::AccessFlags::empty();
    if state.contains(ResourceState::COPY_SOURCE) {
        ret |= vk::AccessFlags::TRANSFER_READ;
    }
    if state.contains(ResourceState::COPY_DEST) {
        ret |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if state.contains(ResourceState::VERTEX_AND_CONSTANT_BUFFER) {
        ret |= vk::AccessFlags::UNIFORM_READ | vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
    }
    if state.contains(ResourceState::INDEX_BUFFER) {
        ret |= vk::AccessFlags::INDEX_READ;
    }
    if state.contains(ResourceState::UNORDERED_ACCESS) {
        ret |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    }
    if state.contains(ResourceState::INDIRECT_ARGUMENT) {
        ret |= vk::AccessFlags::INDIRECT_COMMAND_READ;
    }
    if state.contains(ResourceState::RENDER_TARGET) {
        ret |= vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if state.contains(ResourceState::DEPTH_WRITE) {
        ret |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }
    if state.contains(ResourceState::DEPTH_READ) {
        ret |= vk::AccessFlags::SHADER_READ;
    }
    if state.contains(ResourceState::SHADER_RESOURCE) {
        ret |= vk::AccessFlags::SHADER_READ;
    }
    if state.contains(ResourceState::PRESENT) {
        ret |= vk::AccessFlags::MEMORY_READ;
    }
    ret
}

pub fn to_vk_image_layout(state: ResourceState) -> vk::ImageLayout {
    if state.contains(ResourceState::COPY_SOURCE) {
        return vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
    }
    if state.contains(ResourceState::COPY_DEST) {
        return vk::ImageLayout::TRANSFER_DST_OPTIMAL;
    }
    if state.contains(ResourceState::RENDER_TARGET) {
        return vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
    }
    if state.contains(ResourceState::DEPTH_WRITE) {
        return vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
    }
    if state.contains(ResourceState::DEPTH_READ) {
        return vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL;
    }
    if state.contains(ResourceState::UNORDERED_ACCESS) {
        return vk::ImageLayout::GENERAL;
    }
    if state.contains(ResourceState::SHADER_RESOURCE) {
        return vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    }
    if state.contains(ResourceState::PRESENT) {
        return vk::ImageLayout::PRESENT_SRC_KHR;
    }
    if state == ResourceState::COMMON {
        return vk::ImageLayout::GENERAL;
    }
    vk::ImageLayout::UNDEFINED
}

/// Narrow an access mask down to the pipeline stages that can issue
/// it on the given queue class.
pub fn to_vk_pipeline_stage(access: vk::AccessFlags, queue: QueueClass) -> vk::PipelineStageFlags {
    let mut flags = vk::PipelineStageFlags::empty();

    match queue {
        QueueClass::Graphics => {
            if access
                .intersects(vk::AccessFlags::INDEX_READ | vk::AccessFlags::VERTEX_ATTRIBUTE_READ)
            {
                flags |= vk::PipelineStageFlags::VERTEX_INPUT;
            }
            if access.intersects(
                vk::AccessFlags::UNIFORM_READ
                    | vk::AccessFlags::SHADER_READ
                    | vk::AccessFlags::SHADER_WRITE,
            ) {
                flags |= vk::PipelineStageFlags::VERTEX_SHADER
                    | vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::COMPUTE_SHADER;
            }
            if access.intersects(vk::AccessFlags::INPUT_ATTACHMENT_READ) {
                flags |= vk::PipelineStageFlags::FRAGMENT_SHADER;
            }
            if access.intersects(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ) {
                flags |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
            }
            if access.intersects(
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ) {
                flags |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            }
        }
        QueueClass::Compute => {
            if access
                .intersects(vk::AccessFlags::INDEX_READ | vk::AccessFlags::VERTEX_ATTRIBUTE_READ)
                || access.intersects(vk::AccessFlags::INPUT_ATTACHMENT_READ)
                || access.intersects(
                    vk::AccessFlags::COLOR_ATTACHMENT_READ
                        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                )
                || access.intersects(
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )
            {
                return vk::PipelineStageFlags::ALL_COMMANDS;
            }
            if access.intersects(
                vk::AccessFlags::UNIFORM_READ
                    | vk::AccessFlags::SHADER_READ
                    | vk::AccessFlags::SHADER_WRITE,
            ) {
                flags |= vk::PipelineStageFlags::COMPUTE_SHADER;
            }
        }
        QueueClass::Transfer => return vk::PipelineStageFlags::ALL_COMMANDS,
    }

    if access.intersects(vk::AccessFlags::INDIRECT_COMMAND_READ) {
        flags |= vk::PipelineStageFlags::DRAW_INDIRECT;
    }
    if access.intersects(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE) {
        flags |= vk::PipelineStageFlags::TRANSFER;
    }
    if access.intersects(vk::AccessFlags::HOST_READ | vk::AccessFlags::HOST_WRITE) {
        flags |= vk::PipelineStageFlags::HOST;
    }

    if flags.is_empty() {
        flags = vk::PipelineStageFlags::TOP_OF_PIPE;
    }

    flags
}

pub fn has_depth_or_stencil(format: vk::Format) -> bool {
    format.as_raw() >= vk::Format::D16_UNORM.as_raw()
        && format.as_raw() <= vk::Format::D32_SFLOAT_S8_UINT.as_raw()
}

pub fn has_stencil(format: vk::Format) -> bool {
    format.as_raw() >= vk::Format::S8_UINT.as_raw()
        && format.as_raw() <= vk::Format::D32_SFLOAT_S8_UINT.as_raw()
}

pub fn has_depth(format: vk::Format) -> bool {
    (format.as_raw() >= vk::Format::D16_UNORM.as_raw()
        && format.as_raw() <= vk::Format::D32_SFLOAT.as_raw())
        || (format.as_raw() >= vk::Format::D16_UNORM_S8_UINT.as_raw()
            && format.as_raw() <= vk::Format::D32_SFLOAT_S8_UINT.as_raw())
}

pub fn to_vk_image_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if has_depth_or_stencil(format) {
        let mut aspect = vk::ImageAspectFlags::empty();
        if has_depth(format) {
            aspect |= vk::ImageAspectFlags::DEPTH;
        }
        if has_stencil(format) {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        aspect
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Bytes per texel block for the formats the runtime creates
/// attachments and textures in. Only used to size alias candidates, so
/// an estimate for exotic formats is fine as long as it never
/// undercounts.
fn block_size(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => {
            1
        }
        vk::Format::R8G8_UNORM
        | vk::Format::R16_SFLOAT
        | vk::Format::R16_UNORM
        | vk::Format::D16_UNORM => 2,
        vk::Format::D16_UNORM_S8_UINT => 3,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => 4,
        vk::Format::D32_SFLOAT_S8_UINT => 5,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => 16,
    }
}

/// Estimated allocation size of a texture, used when fitting a new
/// attachment into a freed one.
pub fn calc_texture_size(width: u32, height: u32, depth: u32, format: vk::Format) -> u64 {
    width as u64 * height as u64 * depth.max(1) as u64 * block_size(format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_stencil_classification_is_consistent() {
        let formats = [
            vk::Format::R8G8B8A8_UNORM,
            vk::Format::B8G8R8A8_SRGB,
            vk::Format::R16G16B16A16_SFLOAT,
            vk::Format::S8_UINT,
            vk::Format::D16_UNORM,
            vk::Format::D16_UNORM_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::X8_D24_UNORM_PACK32,
        ];
        for f in formats {
            assert_eq!(has_depth_or_stencil(f), has_depth(f) || has_stencil(f), "{:?}", f);
        }
        assert!(has_depth(vk::Format::D32_SFLOAT));
        assert!(!has_stencil(vk::Format::D32_SFLOAT));
        assert!(has_stencil(vk::Format::D24_UNORM_S8_UINT));
        assert!(!has_depth(vk::Format::S8_UINT));
    }

    #[test]
    fn layouts_follow_state_priority() {
        assert_eq!(
            to_vk_image_layout(ResourceState::RENDER_TARGET),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            to_vk_image_layout(ResourceState::SHADER_RESOURCE),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        // copy wins over shader read when both bits are set
        assert_eq!(
            to_vk_image_layout(ResourceState::SHADER_RESOURCE | ResourceState::COPY_SOURCE),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(
            to_vk_image_layout(ResourceState::UNDEFINED),
            vk::ImageLayout::UNDEFINED
        );
    }

    #[test]
    fn transfer_queue_always_waits_on_all_commands() {
        let access = to_vk_access_flags(ResourceState::COPY_DEST);
        assert_eq!(
            to_vk_pipeline_stage(access, QueueClass::Transfer),
            vk::PipelineStageFlags::ALL_COMMANDS
        );
    }

    #[test]
    fn empty_access_lands_on_top_of_pipe() {
        assert_eq!(
            to_vk_pipeline_stage(vk::AccessFlags::empty(), QueueClass::Graphics),
            vk::PipelineStageFlags::TOP_OF_PIPE
        );
    }

    #[test]
    fn texture_size_scales_with_format() {
        let rgba = calc_texture_size(128, 128, 1, vk::Format::R8G8B8A8_UNORM);
        let rgba16 = calc_texture_size(128, 128, 1, vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(rgba, 128 * 128 * 4);
        assert_eq!(rgba16, rgba * 2);
    }
}
