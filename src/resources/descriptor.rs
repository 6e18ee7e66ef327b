// Descriptor sets and the update cache
//
// Descriptor sets record intent on the CPU: per binding, a buffer
// handle, a texture handle, or the name of a frame graph resource.
// The Vulkan set is allocated lazily with the layout of the pipeline
// it is first bound to, and vkUpdateDescriptorSets runs only for
// bindings whose resolved handle changed since the last flush.

use ash::vk;
use fxhash::FxHashMap;

use crate::device::{Device, GpuShared, Zombie};
use crate::resources::*;
use crate::{Result, TormentaError};

impl Device {
    pub(crate) fn create_descriptor_pool(
        dev: &ash::Device,
        pool_elements: u32,
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: pool_elements,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: pool_elements,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: pool_elements,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: pool_elements,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
                descriptor_count: pool_elements,
            },
        ];

        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            // sets are returned individually when destroyed
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets);

        unsafe {
            dev.create_descriptor_pool(&info, None)
                .or(Err(TormentaError::OUT_OF_MEMORY))
        }
    }

    pub fn create_descriptor_set_layout(
        &mut self,
        data: DescriptorSetLayoutData,
    ) -> Result<DescriptorSetLayoutHandle> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = data
            .bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stage_flags)
                    .build()
            })
            .collect();

        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let vk_layout = unsafe {
            self.dev()
                .create_descriptor_set_layout(&info, None)
                .or(Err(TormentaError::OUT_OF_MEMORY))?
        };

        let mut res = self.d_shared.sh_res.write().unwrap();
        let (handle, layout) = res.descriptor_set_layouts.obtain_and_access()?;
        layout.vk_layout = vk_layout;
        layout.data = data;
        Ok(handle)
    }

    pub(crate) fn destroy_descriptor_set_layout_now(&mut self, handle: DescriptorSetLayoutHandle) {
        let mut res = self.d_shared.sh_res.write().unwrap();
        if res.descriptor_set_layouts.try_access(handle).is_none() {
            return;
        }
        let vk_layout = res.descriptor_set_layouts.access(handle).vk_layout;
        res.descriptor_set_layouts.release(handle);
        drop(res);

        if vk_layout != vk::DescriptorSetLayout::null() {
            unsafe {
                self.dev().destroy_descriptor_set_layout(vk_layout, None);
            }
        }
    }

    /// Create an empty descriptor set. The Vulkan side allocates on
    /// first bind, once the pipeline's layout is known.
    pub fn create_descriptor_set(&mut self) -> Result<DescriptorSetHandle> {
        let mut res = self.d_shared.sh_res.write().unwrap();
        let (handle, _set) = res.descriptor_sets.obtain_and_access()?;
        Ok(handle)
    }

    pub(crate) fn destroy_descriptor_set_now(&mut self, handle: DescriptorSetHandle) {
        let mut res = self.d_shared.sh_res.write().unwrap();
        if res.descriptor_sets.try_access(handle).is_none() {
            return;
        }
        let vk_set = res.descriptor_sets.access(handle).vk_set;
        res.descriptor_sets.release(handle);
        drop(res);

        if vk_set != vk::DescriptorSet::null() {
            unsafe {
                let _ = self
                    .dev()
                    .free_descriptor_sets(self.d_shared.sh_descriptor_pool, &[vk_set]);
            }
        }
    }

    pub(crate) fn destroy_descriptor_set_deferred(&mut self, handle: DescriptorSetHandle) {
        self.defer_destroy(Zombie::DescriptorSet(handle));
    }

    /// Record what a binding should point at. The write happens at
    /// bind time.
    pub fn bind_to_descriptor_set(
        &mut self,
        handle: DescriptorSetHandle,
        binding: u16,
        target: BindingTarget,
    ) -> Result<()> {
        if binding as usize >= MAX_DESCRIPTORS_PER_SET {
            return Err(TormentaError::INVALID_ARGUMENT);
        }
        let mut res = self.d_shared.sh_res.write().unwrap();
        if res.descriptor_sets.try_access(handle).is_none() {
            return Err(TormentaError::INVALID_HANDLE);
        }
        let set = res.descriptor_sets.access_mut(handle);
        set.bindings[binding as usize] = target;
        Ok(())
    }

    /// Override the sampler used for a combined image binding.
    pub fn bind_sampler_to_descriptor_set(
        &mut self,
        handle: DescriptorSetHandle,
        binding: u16,
        sampler: SamplerHandle,
    ) -> Result<()> {
        if binding as usize >= MAX_DESCRIPTORS_PER_SET {
            return Err(TormentaError::INVALID_ARGUMENT);
        }
        let mut res = self.d_shared.sh_res.write().unwrap();
        if res.descriptor_sets.try_access(handle).is_none() {
            return Err(TormentaError::INVALID_HANDLE);
        }
        let set = res.descriptor_sets.access_mut(handle);
        set.samplers[binding as usize] = sampler;
        Ok(())
    }
}

/// Resolve a binding target against the frame graph snapshot the
/// executing node sees.
fn resolve_target(
    target: BindingTarget,
    graph_bindings: &FxHashMap<u64, BindingTarget>,
) -> BindingTarget {
    match target {
        BindingTarget::GraphResource(name) => graph_bindings
            .get(&crate::strings::hash_name(name))
            .copied()
            .unwrap_or(BindingTarget::Empty),
        other => other,
    }
}

/// Flush pending binding changes for a set and return the Vulkan set
/// ready for vkCmdBindDescriptorSets. At most one
/// vkUpdateDescriptorSets is issued no matter how many bindings
/// changed; binding the same resources twice in a frame issues none.
pub(crate) fn update_descriptor_set(
    shared: &GpuShared,
    handle: DescriptorSetHandle,
    layout_handle: DescriptorSetLayoutHandle,
    graph_bindings: &FxHashMap<u64, BindingTarget>,
) -> Result<vk::DescriptorSet> {
    let mut res = shared.sh_res.write().unwrap();

    // allocate the vk set on first use with the pipeline's layout
    let vk_layout = res.descriptor_set_layouts.access(layout_handle).vk_layout;
    let mut newly_allocated = false;
    if res.descriptor_sets.access(handle).vk_set == vk::DescriptorSet::null() {
        let layouts = [vk_layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(shared.sh_descriptor_pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            shared
                .sh_dev
                .allocate_descriptor_sets(&info)
                .or(Err(TormentaError::OUT_OF_MEMORY))?
        };
        res.descriptor_sets.access_mut(handle).vk_set = sets[0];
        res.descriptor_sets.access_mut(handle).layout = layout_handle;
        newly_allocated = true;
    }

    let vk_set = res.descriptor_sets.access(handle).vk_set;
    let layout_bindings = res
        .descriptor_set_layouts
        .access(layout_handle)
        .data
        .bindings
        .clone();

    // collect the bindings that changed since the last flush
    let mut image_infos = Vec::new();
    let mut buffer_infos = Vec::new();
    struct PendingWrite {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        image: Option<usize>,
        buffer: Option<usize>,
    }
    let mut pending = Vec::new();

    for layout_binding in &layout_bindings {
        let slot = layout_binding.binding as usize;
        if slot >= MAX_DESCRIPTORS_PER_SET {
            continue;
        }

        let (stored_target, stored_sampler, cached) = {
            let set = res.descriptor_sets.access(handle);
            (set.bindings[slot], set.samplers[slot], set.cached[slot])
        };
        let resolved = resolve_target(stored_target, graph_bindings);
        if resolved == BindingTarget::Empty {
            continue;
        }
        if !newly_allocated && cached == resolved {
            continue;
        }

        match (layout_binding.descriptor_type, resolved) {
            (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                | vk::DescriptorType::SAMPLED_IMAGE
                | vk::DescriptorType::STORAGE_IMAGE,
                BindingTarget::Texture(texture_handle),
            ) => {
                let texture = res
                    .textures
                    .try_access(texture_handle)
                    .ok_or(TormentaError::INVALID_HANDLE)?;
                let sampler_handle = if stored_sampler.is_valid() {
                    stored_sampler
                } else {
                    texture.sampler
                };
                let vk_sampler = res
                    .samplers
                    .try_access(sampler_handle)
                    .map(|sampler| sampler.vk_sampler)
                    .unwrap_or(vk::Sampler::null());

                let layout =
                    if layout_binding.descriptor_type == vk::DescriptorType::STORAGE_IMAGE {
                        vk::ImageLayout::GENERAL
                    } else {
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                    };
                image_infos.push(
                    vk::DescriptorImageInfo::builder()
                        .sampler(vk_sampler)
                        .image_view(texture.vk_view)
                        .image_layout(layout)
                        .build(),
                );
                pending.push(PendingWrite {
                    binding: layout_binding.binding,
                    descriptor_type: layout_binding.descriptor_type,
                    image: Some(image_infos.len() - 1),
                    buffer: None,
                });
            }
            (
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
                BindingTarget::Buffer(buffer_handle),
            ) => {
                let buffer = res
                    .buffers
                    .try_access(buffer_handle)
                    .ok_or(TormentaError::INVALID_HANDLE)?;
                // dynamic suballocations write the parent buffer; the
                // region offset arrives through pDynamicOffsets
                let (vk_buffer, range) = if buffer.parent.is_valid() {
                    (res.buffers.access(buffer.parent).vk_buffer, buffer.size)
                } else {
                    (buffer.vk_buffer, buffer.size)
                };
                buffer_infos.push(
                    vk::DescriptorBufferInfo::builder()
                        .buffer(vk_buffer)
                        .offset(0)
                        .range(range)
                        .build(),
                );
                pending.push(PendingWrite {
                    binding: layout_binding.binding,
                    descriptor_type: layout_binding.descriptor_type,
                    image: None,
                    buffer: Some(buffer_infos.len() - 1),
                });
            }
            (descriptor_type, resolved) => {
                log::error!(
                    "binding {} expects {:?} but was given {:?}",
                    layout_binding.binding,
                    descriptor_type,
                    resolved
                );
                return Err(TormentaError::INVALID_ARGUMENT);
            }
        }

        res.descriptor_sets.access_mut(handle).cached[slot] = resolved;
    }

    if !pending.is_empty() {
        let writes: Vec<vk::WriteDescriptorSet> = pending
            .iter()
            .map(|write| {
                let mut builder = vk::WriteDescriptorSet::builder()
                    .dst_set(vk_set)
                    .dst_binding(write.binding)
                    .descriptor_type(write.descriptor_type);
                if let Some(index) = write.image {
                    builder = builder.image_info(&image_infos[index..index + 1]);
                }
                if let Some(index) = write.buffer {
                    builder = builder.buffer_info(&buffer_infos[index..index + 1]);
                }
                builder.build()
            })
            .collect();

        unsafe {
            shared.sh_dev.update_descriptor_sets(&writes, &[]);
        }
    }

    Ok(vk_set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_names_resolve_through_the_snapshot() {
        let mut snapshot = FxHashMap::default();
        let texture = TextureHandle::new(4);
        snapshot.insert(
            crate::strings::hash_name("gbuffer-color"),
            BindingTarget::Texture(texture),
        );

        let resolved = resolve_target(
            BindingTarget::GraphResource(crate::strings::intern("gbuffer-color")),
            &snapshot,
        );
        assert_eq!(resolved, BindingTarget::Texture(texture));

        let missing = resolve_target(
            BindingTarget::GraphResource(crate::strings::intern("not-there")),
            &snapshot,
        );
        assert_eq!(missing, BindingTarget::Empty);
    }

    #[test]
    fn direct_targets_pass_through() {
        let snapshot = FxHashMap::default();
        let buffer = BufferHandle::new(2);
        assert_eq!(
            resolve_target(BindingTarget::Buffer(buffer), &snapshot),
            BindingTarget::Buffer(buffer)
        );
    }
}
