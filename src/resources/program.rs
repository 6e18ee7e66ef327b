// Shader programs and SPIR-V reflection
//
// A program is the set of stages that will become one pipeline. Each
// stage's SPIR-V is reflected for its descriptor bindings; bindings
// that appear in several stages merge their stage masks. Uniform and
// storage buffer bindings are reflected as their dynamic-offset
// variants since every buffer bind carries its ring offset through
// pDynamicOffsets.

use arrayvec::ArrayVec;
use ash::vk;
use spirv_reflect::types::ReflectDescriptorType;
use spirv_reflect::ShaderModule;

use crate::device::{Device, Zombie};
use crate::resources::*;
use crate::{Result, TormentaError};

fn to_vk_descriptor_type(ty: ReflectDescriptorType) -> Option<vk::DescriptorType> {
    Some(match ty {
        ReflectDescriptorType::Sampler => vk::DescriptorType::SAMPLER,
        ReflectDescriptorType::CombinedImageSampler => {
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        }
        ReflectDescriptorType::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        ReflectDescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        ReflectDescriptorType::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        ReflectDescriptorType::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        // buffers bind with a dynamic offset into the frame ring
        ReflectDescriptorType::UniformBuffer | ReflectDescriptorType::UniformBufferDynamic => {
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        }
        ReflectDescriptorType::StorageBuffer | ReflectDescriptorType::StorageBufferDynamic => {
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
        }
        ReflectDescriptorType::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
        _ => return None,
    })
}

/// Reflection output of a single stage.
struct StageReflection {
    sets: Vec<DescriptorSetLayoutData>,
    push_constant_size: u32,
    entry_point: String,
}

fn reflect_stage(code: &[u32], stage: vk::ShaderStageFlags) -> Result<StageReflection> {
    let bytes: &[u8] = unsafe {
        std::slice::from_raw_parts(code.as_ptr() as *const u8, code.len() * 4)
    };
    let module = ShaderModule::load_u8_data(bytes).map_err(|err| {
        log::error!("SPIR-V reflection failed: {}", err);
        TormentaError::INVALID_ARGUMENT
    })?;

    let entry_point = module.get_entry_point_name();

    let mut sets = Vec::new();
    for set in module.enumerate_descriptor_sets(None).map_err(|err| {
        log::error!("SPIR-V descriptor reflection failed: {}", err);
        TormentaError::INVALID_ARGUMENT
    })? {
        let mut data = DescriptorSetLayoutData {
            set_number: set.set,
            bindings: Vec::new(),
        };
        for binding in &set.bindings {
            let descriptor_type = match to_vk_descriptor_type(binding.descriptor_type) {
                Some(ty) => ty,
                None => continue,
            };
            data.bindings.push(DescriptorBinding {
                binding: binding.binding,
                descriptor_type,
                count: binding.count.max(1),
                stage_flags: stage,
                name: crate::strings::intern(&binding.name),
            });
        }
        sets.push(data);
    }

    let push_constant_size = module
        .enumerate_push_constant_blocks(None)
        .unwrap_or_default()
        .iter()
        .map(|block| block.size)
        .max()
        .unwrap_or(0);

    Ok(StageReflection {
        sets,
        push_constant_size,
        entry_point,
    })
}

/// Merge one stage's reflected sets into the program-wide table.
/// Duplicate bindings OR their stage masks; a type conflict on the
/// same (set, binding) slot is a broken shader pair.
fn merge_sets(
    merged: &mut Vec<DescriptorSetLayoutData>,
    stage_sets: Vec<DescriptorSetLayoutData>,
) -> Result<()> {
    for stage_set in stage_sets {
        let target = match merged
            .iter_mut()
            .find(|set| set.set_number == stage_set.set_number)
        {
            Some(target) => target,
            None => {
                merged.push(DescriptorSetLayoutData {
                    set_number: stage_set.set_number,
                    bindings: Vec::new(),
                });
                merged.last_mut().unwrap()
            }
        };

        for binding in stage_set.bindings {
            match target
                .bindings
                .iter_mut()
                .find(|existing| existing.binding == binding.binding)
            {
                Some(existing) => {
                    if existing.descriptor_type != binding.descriptor_type {
                        log::error!(
                            "binding {} reflected as {:?} and {:?} across stages",
                            binding.binding,
                            existing.descriptor_type,
                            binding.descriptor_type
                        );
                        return Err(TormentaError::INVALID_ARGUMENT);
                    }
                    existing.stage_flags |= binding.stage_flags;
                    existing.count = existing.count.max(binding.count);
                }
                None => target.bindings.push(binding),
            }
        }
    }
    Ok(())
}

impl Device {
    pub fn create_program(&mut self, creation: ProgramCreation) -> Result<ProgramHandle> {
        if creation.stages.is_empty() {
            return Err(TormentaError::INVALID_ARGUMENT);
        }

        let graphics = !creation
            .stages
            .iter()
            .any(|stage| stage.stage == vk::ShaderStageFlags::COMPUTE);

        let mut merged: Vec<DescriptorSetLayoutData> = Vec::new();
        let mut push_constant_size = 0;
        let mut stages: ArrayVec<ShaderStage, MAX_SHADER_STAGES> = ArrayVec::new();
        let mut modules: ArrayVec<vk::ShaderModule, MAX_SHADER_STAGES> = ArrayVec::new();

        for stage in creation.stages.into_iter() {
            let reflection = reflect_stage(&stage.code, stage.stage)?;
            merge_sets(&mut merged, reflection.sets)?;
            push_constant_size = push_constant_size.max(reflection.push_constant_size);

            let info = vk::ShaderModuleCreateInfo::builder().code(&stage.code);
            let module = unsafe {
                self.dev().create_shader_module(&info, None).map_err(|_| {
                    log::error!("could not create shader module for '{}'", creation.name);
                    TormentaError::INVALID_ARGUMENT
                })?
            };
            self.set_name(module, creation.name);
            modules.push(module);

            stages.push(ShaderStage {
                code: stage.code,
                stage: stage.stage,
                entry_point: reflection.entry_point,
            });
        }

        merged.sort_by_key(|set| set.set_number);

        let mut res = self.d_shared.sh_res.write().unwrap();
        let (handle, program) = res.programs.obtain_and_access()?;
        program.stages = stages;
        program.modules = modules;
        program.graphics = graphics;
        program.sets = merged;
        program.push_constant_size = push_constant_size;
        program.name = creation.name;
        Ok(handle)
    }

    pub(crate) fn destroy_program_now(&mut self, handle: ProgramHandle) {
        let mut res = self.d_shared.sh_res.write().unwrap();
        if res.programs.try_access(handle).is_none() {
            return;
        }
        let modules = std::mem::take(&mut res.programs.access_mut(handle).modules);
        res.programs.release(handle);
        drop(res);

        unsafe {
            for module in modules {
                self.dev().destroy_shader_module(module, None);
            }
        }
    }

    pub(crate) fn destroy_program_deferred(&mut self, handle: ProgramHandle) {
        self.defer_destroy(Zombie::Program(handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(slot: u32, ty: vk::DescriptorType, stage: vk::ShaderStageFlags) -> DescriptorBinding {
        DescriptorBinding {
            binding: slot,
            descriptor_type: ty,
            count: 1,
            stage_flags: stage,
            name: "",
        }
    }

    #[test]
    fn duplicate_bindings_merge_stage_masks() {
        let mut merged = vec![];
        merge_sets(
            &mut merged,
            vec![DescriptorSetLayoutData {
                set_number: 0,
                bindings: vec![binding(
                    0,
                    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                    vk::ShaderStageFlags::VERTEX,
                )],
            }],
        )
        .unwrap();
        merge_sets(
            &mut merged,
            vec![DescriptorSetLayoutData {
                set_number: 0,
                bindings: vec![binding(
                    0,
                    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                    vk::ShaderStageFlags::FRAGMENT,
                )],
            }],
        )
        .unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].bindings.len(), 1);
        assert_eq!(
            merged[0].bindings[0].stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn conflicting_binding_types_are_rejected() {
        let mut merged = vec![];
        merge_sets(
            &mut merged,
            vec![DescriptorSetLayoutData {
                set_number: 0,
                bindings: vec![binding(
                    1,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    vk::ShaderStageFlags::FRAGMENT,
                )],
            }],
        )
        .unwrap();
        let result = merge_sets(
            &mut merged,
            vec![DescriptorSetLayoutData {
                set_number: 0,
                bindings: vec![binding(
                    1,
                    vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
                    vk::ShaderStageFlags::COMPUTE,
                )],
            }],
        );
        assert_eq!(result.unwrap_err(), TormentaError::INVALID_ARGUMENT);
    }

    #[test]
    fn distinct_sets_stay_separate() {
        let mut merged = vec![];
        merge_sets(
            &mut merged,
            vec![
                DescriptorSetLayoutData {
                    set_number: 1,
                    bindings: vec![binding(
                        0,
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        vk::ShaderStageFlags::FRAGMENT,
                    )],
                },
                DescriptorSetLayoutData {
                    set_number: 0,
                    bindings: vec![binding(
                        0,
                        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                        vk::ShaderStageFlags::VERTEX,
                    )],
                },
            ],
        )
        .unwrap();
        assert_eq!(merged.len(), 2);
    }
}
