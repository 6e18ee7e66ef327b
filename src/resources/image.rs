// Texture and sampler factories
//
// Textures always come out sampled-capable; render target, storage
// and transfer usage are layered on from the creation flags. A
// texture created with an alias handle binds its image to the memory
// of the alias, which is how the frame graph reuses attachment
// memory across disjoint lifetimes.

use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use crate::device::{Device, Zombie};
use crate::resources::*;
use crate::state::{self, ResourceState};
use crate::{Result, TormentaError};

impl Device {
    fn image_usage_for(creation: &TextureCreation) -> vk::ImageUsageFlags {
        let mut usage = vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC;

        if creation.flags.contains(TextureFlags::RENDER_TARGET) {
            if state::has_depth_or_stencil(creation.format) {
                usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
            } else {
                usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
            }
        }
        if creation.flags.contains(TextureFlags::COMPUTE) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }

        usage
    }

    pub fn create_texture(&mut self, creation: TextureCreation) -> Result<TextureHandle> {
        if creation.width == 0 || creation.height == 0 {
            log::error!("refusing to create empty texture '{}'", creation.name);
            return Err(TormentaError::INVALID_ARGUMENT);
        }

        let usage = Self::image_usage_for(&creation);
        let layers = if creation.texture_type == TextureType::Cube {
            6
        } else {
            creation.array_layers.max(1)
        };
        let flags = if creation.texture_type == TextureType::Cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(creation.texture_type.to_vk())
            .format(creation.format)
            .extent(vk::Extent3D {
                width: creation.width,
                height: creation.height,
                depth: creation.depth.max(1),
            })
            .mip_levels(creation.mip_levels.max(1))
            .array_layers(layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let vk_image = unsafe {
            self.dev()
                .create_image(&info, None)
                .or(Err(TormentaError::OUT_OF_MEMORY))?
        };

        // Either bind to the alias texture's memory or make a new
        // allocation for the image.
        let mut allocation = None;
        let mut alias_of = TextureHandle::INVALID;
        if creation.alias.is_valid() {
            // chase aliases of aliases down to the texture that owns
            // the allocation
            let target = {
                let res = self.d_shared.sh_res.read().unwrap();
                let mut root = creation.alias;
                while res.textures.access(root).alias_of.is_valid() {
                    root = res.textures.access(root).alias_of;
                }
                res.textures
                    .access(root)
                    .allocation
                    .as_ref()
                    .map(|alloc| (unsafe { alloc.memory() }, alloc.offset(), root))
            };
            let (memory, offset, root) = match target {
                Some(target) => target,
                None => {
                    unsafe { self.dev().destroy_image(vk_image, None) };
                    return Err(TormentaError::INVALID_ARGUMENT);
                }
            };
            unsafe {
                self.dev()
                    .bind_image_memory(vk_image, memory, offset)
                    .or(Err(TormentaError::OUT_OF_MEMORY))?;
            }
            alias_of = root;
        } else {
            let requirements = unsafe { self.dev().get_image_memory_requirements(vk_image) };
            let alloc = self
                .d_allocator
                .as_ref()
                .unwrap()
                .lock()
                .unwrap()
                .allocate(&AllocationCreateDesc {
                    name: creation.name,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .or(Err(TormentaError::OUT_OF_MEMORY))?;
            unsafe {
                self.dev()
                    .bind_image_memory(vk_image, alloc.memory(), alloc.offset())
                    .or(Err(TormentaError::OUT_OF_MEMORY))?;
            }
            allocation = Some(alloc);
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .view_type(creation.texture_type.to_vk_view())
            .format(creation.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: state::to_vk_image_aspect(creation.format),
                base_mip_level: 0,
                level_count: creation.mip_levels.max(1),
                base_array_layer: 0,
                layer_count: layers,
            })
            .image(vk_image);
        let vk_view = unsafe {
            self.dev()
                .create_image_view(&view_info, None)
                .or(Err(TormentaError::OUT_OF_MEMORY))?
        };

        self.set_name(vk_image, creation.name);

        let default_sampler = self.d_default_sampler;
        let handle = {
            let mut res = self.d_shared.sh_res.write().unwrap();
            let (handle, texture) = res.textures.obtain_and_access()?;
            texture.vk_image = vk_image;
            texture.vk_view = vk_view;
            texture.vk_format = creation.format;
            texture.state = ResourceState::UNDEFINED;
            texture.allocation = allocation;
            texture.width = creation.width;
            texture.height = creation.height;
            texture.depth = creation.depth.max(1);
            texture.mip_levels = creation.mip_levels.max(1);
            texture.array_layers = layers;
            texture.flags = creation.flags;
            texture.texture_type = creation.texture_type;
            texture.sampler = default_sampler;
            texture.alias_of = alias_of;
            texture.name = creation.name;
            handle
        };

        if let Some(data) = creation.initial_data {
            self.upload_texture(handle, &data)?;
        }

        Ok(handle)
    }

    /// Synchronous texture upload: staging copy, then mip generation
    /// and the transition to shader readable, all on the graphics
    /// queue. The async path in the renderer uses the transfer queue.
    pub(crate) fn upload_texture(&mut self, handle: TextureHandle, data: &[u8]) -> Result<()> {
        let staging = self.create_buffer(
            BufferCreation::default()
                .set(
                    BufferUsage::empty(),
                    ResourceUsageType::Staging,
                    data.len() as u64,
                )
                .set_initial_data(data.to_vec())
                .set_name("texture-staging"),
        )?;

        let (src, image, format, extent, mip_levels) = {
            let res = self.d_shared.sh_res.read().unwrap();
            let texture = res.textures.access(handle);
            (
                res.buffers.access(staging).vk_buffer,
                texture.vk_image,
                texture.vk_format,
                vk::Extent3D {
                    width: texture.width,
                    height: texture.height,
                    depth: texture.depth,
                },
                texture.mip_levels,
            )
        };

        self.graphics_one_shot(|dev, cmd| unsafe {
            image_barrier(
                dev,
                cmd,
                image,
                format,
                ResourceState::UNDEFINED,
                ResourceState::COPY_DEST,
                0,
                1,
            );

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: state::to_vk_image_aspect(format),
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: extent,
            };
            dev.cmd_copy_buffer_to_image(
                cmd,
                src,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            if mip_levels > 1 {
                image_barrier(
                    dev,
                    cmd,
                    image,
                    format,
                    ResourceState::COPY_DEST,
                    ResourceState::COPY_SOURCE,
                    0,
                    1,
                );
                blit_mip_chain(dev, cmd, image, extent.width as i32, extent.height as i32, mip_levels);
                image_barrier(
                    dev,
                    cmd,
                    image,
                    format,
                    ResourceState::COPY_SOURCE,
                    ResourceState::SHADER_RESOURCE,
                    0,
                    mip_levels,
                );
            } else {
                image_barrier(
                    dev,
                    cmd,
                    image,
                    format,
                    ResourceState::COPY_DEST,
                    ResourceState::SHADER_RESOURCE,
                    0,
                    1,
                );
            }
        })?;

        {
            let mut res = self.d_shared.sh_res.write().unwrap();
            res.textures.access_mut(handle).state = ResourceState::SHADER_RESOURCE;
        }

        self.destroy_buffer_now(staging);
        Ok(())
    }

    pub fn get_texture_info(&self, handle: TextureHandle) -> Result<TextureInfo> {
        let res = self.d_shared.sh_res.read().unwrap();
        let texture = res
            .textures
            .try_access(handle)
            .ok_or(TormentaError::INVALID_HANDLE)?;
        Ok(TextureInfo {
            width: texture.width,
            height: texture.height,
            depth: texture.depth,
            mip_levels: texture.mip_levels,
            format: texture.vk_format,
            texture_type: texture.texture_type,
        })
    }

    pub(crate) fn destroy_texture_now(&mut self, handle: TextureHandle) {
        let mut res = self.d_shared.sh_res.write().unwrap();
        if res.textures.try_access(handle).is_none() {
            return;
        }

        let texture = res.textures.access_mut(handle);
        let vk_image = texture.vk_image;
        let vk_view = texture.vk_view;
        let allocation = texture.allocation.take();
        res.textures.release(handle);
        drop(res);

        unsafe {
            if vk_view != vk::ImageView::null() {
                self.dev().destroy_image_view(vk_view, None);
            }
            if vk_image != vk::Image::null() {
                self.dev().destroy_image(vk_image, None);
            }
        }
        if let Some(allocation) = allocation {
            let _ = self
                .d_allocator
                .as_ref()
                .unwrap()
                .lock()
                .unwrap()
                .free(allocation);
        }
    }

    pub(crate) fn destroy_texture_deferred(&mut self, handle: TextureHandle) {
        self.defer_destroy(Zombie::Texture(handle));
    }

    pub fn create_sampler(&mut self, creation: SamplerCreation) -> Result<SamplerHandle> {
        let mut reduction_info;
        let mut info = vk::SamplerCreateInfo::builder()
            .min_filter(creation.min_filter)
            .mag_filter(creation.mag_filter)
            .mipmap_mode(creation.mip_filter)
            .address_mode_u(creation.address_mode_u)
            .address_mode_v(creation.address_mode_v)
            .address_mode_w(creation.address_mode_w)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);

        if let Some(mode) = creation.reduction_mode {
            if !self.d_features.sampler_minmax {
                return Err(TormentaError::FEATURE_NOT_SUPPORTED);
            }
            reduction_info =
                vk::SamplerReductionModeCreateInfo::builder().reduction_mode(mode);
            info = info.push_next(&mut reduction_info);
        }

        let vk_sampler = unsafe {
            self.dev()
                .create_sampler(&info, None)
                .or(Err(TormentaError::OUT_OF_MEMORY))?
        };
        self.set_name(vk_sampler, creation.name);

        let mut res = self.d_shared.sh_res.write().unwrap();
        let (handle, sampler) = res.samplers.obtain_and_access()?;
        sampler.vk_sampler = vk_sampler;
        sampler.min_filter = creation.min_filter;
        sampler.mag_filter = creation.mag_filter;
        sampler.mip_filter = creation.mip_filter;
        sampler.address_mode_u = creation.address_mode_u;
        sampler.address_mode_v = creation.address_mode_v;
        sampler.address_mode_w = creation.address_mode_w;
        sampler.name = creation.name;
        Ok(handle)
    }

    pub(crate) fn destroy_sampler_now(&mut self, handle: SamplerHandle) {
        let mut res = self.d_shared.sh_res.write().unwrap();
        if res.samplers.try_access(handle).is_none() {
            return;
        }
        let vk_sampler = res.samplers.access(handle).vk_sampler;
        res.samplers.release(handle);
        drop(res);

        if vk_sampler != vk::Sampler::null() {
            unsafe {
                self.dev().destroy_sampler(vk_sampler, None);
            }
        }
    }
}

/// Emit the minimum image barrier for an abstract state transition.
/// Shared by the factories here and the upload worker.
pub(crate) unsafe fn image_barrier(
    dev: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    format: vk::Format,
    old: ResourceState,
    new: ResourceState,
    base_mip: u32,
    mip_count: u32,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(state::to_vk_access_flags(old))
        .dst_access_mask(state::to_vk_access_flags(new))
        .old_layout(state::to_vk_image_layout(old))
        .new_layout(state::to_vk_image_layout(new))
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: state::to_vk_image_aspect(format),
            base_mip_level: base_mip,
            level_count: mip_count,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        })
        .build();

    let src_stage =
        state::to_vk_pipeline_stage(barrier.src_access_mask, state::QueueClass::Graphics);
    let dst_stage =
        state::to_vk_pipeline_stage(barrier.dst_access_mask, state::QueueClass::Graphics);

    dev.cmd_pipeline_barrier(
        cmd,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

/// Blit each mip from the one above it. The image must have mip 0 in
/// TRANSFER_SRC and the rest undefined on entry; every level is left
/// in TRANSFER_SRC.
pub(crate) unsafe fn blit_mip_chain(
    dev: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    mut w: i32,
    mut h: i32,
    mip_levels: u32,
) {
    for mip in 1..mip_levels {
        let barrier_in = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: mip,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        dev.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier_in],
        );

        let next_w = (w / 2).max(1);
        let next_h = (h / 2).max(1);
        let blit = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: mip - 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D { x: w, y: h, z: 1 },
            ],
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: mip,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: next_w,
                    y: next_h,
                    z: 1,
                },
            ],
        };
        dev.cmd_blit_image(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[blit],
            vk::Filter::LINEAR,
        );
        w = next_w;
        h = next_h;

        let barrier_out = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: mip,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        dev.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier_out],
        );
    }
}
