// Vulkan device representation
//
// This stores per-GPU state: the logical device, queues, swapchain,
// per-frame synchronization, the memory allocator and the pools of
// every resource the runtime hands out. The renderer drives it once
// per frame through new_frame/present and the factories in
// resources/ hang off of it.

use ash::extensions::khr;
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use crate::cmdbuf::CommandBufferManager;
use crate::instance::Instance;
use crate::profiler::Profiler;
use crate::resources::*;
use crate::{CreateInfo, FeatureFlags, Result, TormentaError, MAX_FRAMES};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// GPU timestamp queries reserved per frame. Each push/pop pair
/// consumes two.
pub const QUERIES_PER_FRAME: u32 = 32;

/// What the chosen physical device actually supports, probed once at
/// startup. Requested features missing from here are silently left
/// off and reported through `Renderer::features`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFeatures {
    pub bindless: bool,
    pub storage_8bit: bool,
    pub storage_16bit: bool,
    pub draw_indirect_count: bool,
    pub mesh_shader: bool,
    pub sampler_minmax: bool,
    pub timestamps: bool,
}

/// State shared between the device and every command buffer recorder.
/// Command buffers clone an Arc of this so pass callbacks can record
/// while the renderer itself is mutably borrowed.
pub(crate) struct GpuShared {
    pub(crate) sh_dev: ash::Device,
    pub(crate) sh_queue_graphics: vk::Queue,
    pub(crate) sh_queue_compute: vk::Queue,
    pub(crate) sh_queue_transfer: vk::Queue,
    pub(crate) sh_family_graphics: u32,
    pub(crate) sh_family_compute: u32,
    pub(crate) sh_family_transfer: u32,
    /// Loader for VK_EXT_mesh_shader entry points, present when the
    /// feature was enabled.
    pub(crate) sh_mesh: Option<ash::extensions::ext::MeshShader>,
    pub(crate) sh_query_pool: vk::QueryPool,
    pub(crate) sh_descriptor_pool: vk::DescriptorPool,
    /// Serializes submissions on the transfer queue between the
    /// render thread and the upload worker.
    pub(crate) sh_transfer_lock: Mutex<()>,
    pub(crate) sh_res: RwLock<ResourceStore>,
    pub(crate) sh_profiler: Mutex<Profiler>,
    pub(crate) sh_profiler_enabled: AtomicBool,
    /// Index of the in-flight frame slot being recorded.
    pub(crate) sh_current_frame: AtomicUsize,
}

impl GpuShared {
    pub(crate) fn current_frame(&self) -> usize {
        self.sh_current_frame.load(Ordering::Relaxed)
    }

    pub(crate) fn profiler_enabled(&self) -> bool {
        self.sh_profiler_enabled.load(Ordering::Relaxed)
    }
}

/// An entry scheduled for destruction once the GPU is done with the
/// frame that released it.
pub(crate) enum Zombie {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    Sampler(SamplerHandle),
    RenderPass(RenderPassHandle),
    Framebuffer(FramebufferHandle),
    DescriptorSet(DescriptorSetHandle),
    Pipeline(PipelineHandle),
    Program(ProgramHandle),
}

/// A queue of resources to destroy, keyed by the absolute frame that
/// released them. An entry is safe to destroy once the fence for
/// `frame + MAX_FRAMES` has been waited on.
struct DeletionQueue {
    dq_items: Vec<(u64, Zombie)>,
}

impl DeletionQueue {
    fn new() -> Self {
        Self {
            dq_items: Vec::new(),
        }
    }

    fn push(&mut self, frame: u64, zombie: Zombie) {
        self.dq_items.push((frame, zombie));
    }

    fn drain_completed(&mut self, completed_frame: u64) -> Vec<Zombie> {
        let mut ready = Vec::new();
        self.dq_items.retain_mut(|(frame, zombie)| {
            if *frame <= completed_frame {
                ready.push(std::mem::replace(
                    zombie,
                    Zombie::Buffer(BufferHandle::INVALID),
                ));
                false
            } else {
                true
            }
        });
        ready
    }
}

/// Per frame ring the dynamic buffers suballocate from. One backing
/// buffer holds MAX_FRAMES slices; the head resets when its frame
/// comes around again. Allocation only happens on the render thread.
pub(crate) struct DynamicRing {
    pub(crate) dr_buffer: BufferHandle,
    pub(crate) dr_size_per_frame: u64,
    pub(crate) dr_head: u64,
}

impl DynamicRing {
    /// Bump-allocate an aligned region of this frame's slice.
    fn bump(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(1);
        let head = (self.dr_head + align - 1) & !(align - 1);
        if head + size > self.dr_size_per_frame {
            return None;
        }
        self.dr_head = head + size;
        Some(head)
    }
}

/// Tormenta Device
///
/// This holds all of the Vulkan state for one GPU: swapchain, sync
/// primitives, allocator and resource pools.
pub struct Device {
    pub(crate) d_inst: Instance,
    pub(crate) d_pdev: vk::PhysicalDevice,
    pub(crate) d_pdev_props: vk::PhysicalDeviceProperties,
    pub(crate) d_features: DeviceFeatures,
    pub(crate) d_enabled: FeatureFlags,
    pub(crate) d_shared: Arc<GpuShared>,
    pub(crate) d_allocator: Option<Arc<Mutex<Allocator>>>,

    d_surface_loader: khr::Surface,
    d_surface: vk::SurfaceKHR,
    d_swapchain_loader: khr::Swapchain,
    d_swapchain: vk::SwapchainKHR,
    d_surface_format: vk::SurfaceFormatKHR,
    d_present_mode: vk::PresentModeKHR,
    pub(crate) d_resolution: vk::Extent2D,
    d_swap_images: Vec<vk::Image>,
    d_swap_views: Vec<vk::ImageView>,
    /// Render pass + one framebuffer per swapchain image for nodes
    /// that draw straight to the screen.
    pub(crate) d_swap_pass: RenderPassHandle,
    pub(crate) d_swap_framebuffers: Vec<FramebufferHandle>,
    d_image_index: u32,

    d_fences: [vk::Fence; MAX_FRAMES],
    d_image_available: [vk::Semaphore; MAX_FRAMES],
    d_render_finished: [vk::Semaphore; MAX_FRAMES],
    pub(crate) d_absolute_frame: u64,
    d_needs_resize: bool,
    /// (old_w, new_w, old_h, new_h) of a swapchain rebuild the frame
    /// graph has not been told about yet.
    pub(crate) d_pending_resize: Option<(u32, u32, u32, u32)>,

    pub(crate) d_timestamp_period: f32,
    pub(crate) d_dynamic: DynamicRing,
    d_deletion: DeletionQueue,
    pub(crate) d_cmds: CommandBufferManager,
    /// Default sampler attached to textures created without one.
    pub(crate) d_default_sampler: SamplerHandle,

    /// One-shot command buffers for synchronous uploads: one on the
    /// transfer queue, one on graphics for work transfer queues
    /// cannot do (blits, attachment layouts).
    d_copy_pool: vk::CommandPool,
    d_copy_cbuf: vk::CommandBuffer,
    d_gfx_copy_pool: vk::CommandPool,
    d_gfx_copy_cbuf: vk::CommandBuffer,
}

impl Device {
    /// Rank a physical device for selection. Higher wins.
    fn rank_pdev(props: &vk::PhysicalDeviceProperties) -> u32 {
        match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 3,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
            _ => 0,
        }
    }

    /// Find the graphics queue family that can present to `surface`.
    fn graphics_family(
        inst: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        pdev: vk::PhysicalDevice,
    ) -> Option<u32> {
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .find(|(index, info)| {
                info.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                    && unsafe {
                        surface_loader
                            .get_physical_device_surface_support(pdev, *index as u32, surface)
                            .unwrap_or(false)
                    }
            })
            .map(|(index, _)| index as u32)
    }

    /// Choose a vkPhysicalDevice
    ///
    /// Discrete beats integrated beats virtual; anything without a
    /// present-capable graphics queue is skipped.
    fn select_pdev(
        inst: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .or(Err(TormentaError::UNKNOWN))?
        };

        pdevices
            .iter()
            .filter_map(|&pdev| {
                let family = Self::graphics_family(inst, surface_loader, surface, pdev)?;
                let props = unsafe { inst.get_physical_device_properties(pdev) };
                Some((pdev, family, Self::rank_pdev(&props)))
            })
            .max_by_key(|(_, _, rank)| *rank)
            .map(|(pdev, family, _)| (pdev, family))
            .ok_or(TormentaError::VK_SURF_NOT_SUPPORTED)
    }

    /// Choose compute and transfer queue families.
    ///
    /// Compute prefers a family without graphics (async compute),
    /// transfer prefers a dedicated copy engine. Both fall back to
    /// the graphics family.
    fn select_async_families(inst: &ash::Instance, pdev: vk::PhysicalDevice, graphics: u32) -> (u32, u32) {
        let props = unsafe { inst.get_physical_device_queue_family_properties(pdev) };

        let compute = props
            .iter()
            .enumerate()
            .filter(|(i, info)| {
                *i as u32 != graphics
                    && info.queue_flags.contains(vk::QueueFlags::COMPUTE)
                    && !info.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|(i, _)| i as u32)
            .next()
            .unwrap_or(graphics);

        let transfer = props
            .iter()
            .enumerate()
            .filter(|(i, info)| {
                *i as u32 != graphics
                    && *i as u32 != compute
                    && info.queue_flags.contains(vk::QueueFlags::TRANSFER)
                    && !info.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                    && !info.queue_flags.contains(vk::QueueFlags::COMPUTE)
            })
            .map(|(i, _)| i as u32)
            .next()
            .unwrap_or(graphics);

        (compute, transfer)
    }

    /// Probe which of the requested optional features the device
    /// actually offers.
    fn probe_features(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        requested: FeatureFlags,
    ) -> DeviceFeatures {
        let mut vk11 = vk::PhysicalDeviceVulkan11Features::builder().build();
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::builder().build();
        let mut mesh = vk::PhysicalDeviceMeshShaderFeaturesEXT::builder().build();

        let mut features2 = vk::PhysicalDeviceFeatures2::builder().build();
        features2.p_next = &mut vk11 as *mut _ as *mut std::ffi::c_void;
        vk11.p_next = &mut vk12 as *mut _ as *mut std::ffi::c_void;
        vk12.p_next = &mut mesh as *mut _ as *mut std::ffi::c_void;

        unsafe { inst.get_physical_device_features2(pdev, &mut features2) };

        let props = unsafe { inst.get_physical_device_properties(pdev) };

        DeviceFeatures {
            bindless: requested.contains(FeatureFlags::BINDLESS)
                && vk12.descriptor_indexing != 0
                && vk12.descriptor_binding_partially_bound != 0
                && vk12.descriptor_binding_sampled_image_update_after_bind != 0,
            storage_8bit: requested.contains(FeatureFlags::STORAGE_8BIT)
                && vk12.storage_buffer8_bit_access != 0,
            storage_16bit: requested.contains(FeatureFlags::STORAGE_16BIT)
                && vk11.storage_buffer16_bit_access != 0,
            draw_indirect_count: requested.contains(FeatureFlags::DRAW_INDIRECT_COUNT)
                && vk12.draw_indirect_count != 0,
            mesh_shader: requested.contains(FeatureFlags::MESH_SHADER) && mesh.mesh_shader != 0,
            sampler_minmax: vk12.sampler_filter_minmax != 0,
            timestamps: props.limits.timestamp_compute_and_graphics != 0,
        }
    }

    /// Create the logical device with the probed feature set enabled.
    fn create_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        features: &DeviceFeatures,
        families: &[u32],
    ) -> Result<ash::Device> {
        let mut extensions = vec![khr::Swapchain::name().as_ptr()];
        if features.mesh_shader {
            extensions.push(ash::extensions::ext::MeshShader::name().as_ptr());
        }

        let core_features = vk::PhysicalDeviceFeatures::builder()
            .multi_draw_indirect(true)
            .fragment_stores_and_atomics(true)
            .vertex_pipeline_stores_and_atomics(true)
            .sampler_anisotropy(true)
            .build();

        let mut vk11 = vk::PhysicalDeviceVulkan11Features::builder()
            .storage_buffer16_bit_access(features.storage_16bit)
            .build();
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::builder()
            .draw_indirect_count(features.draw_indirect_count)
            .storage_buffer8_bit_access(features.storage_8bit)
            .descriptor_indexing(features.bindless)
            .shader_sampled_image_array_non_uniform_indexing(features.bindless)
            .runtime_descriptor_array(features.bindless)
            .descriptor_binding_partially_bound(features.bindless)
            .descriptor_binding_sampled_image_update_after_bind(features.bindless)
            .descriptor_binding_update_unused_while_pending(features.bindless)
            .sampler_filter_minmax(features.sampler_minmax)
            .build();
        let mut mesh = vk::PhysicalDeviceMeshShaderFeaturesEXT::builder()
            .mesh_shader(features.mesh_shader)
            .task_shader(features.mesh_shader)
            .build();

        // one queue per distinct family
        let mut unique = families.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let priorities = [1.0];
        let queue_infos: Vec<_> = unique
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let mut info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&core_features)
            .push_next(&mut vk11)
            .push_next(&mut vk12);
        if features.mesh_shader {
            info = info.push_next(&mut mesh);
        }

        unsafe {
            inst.create_device(pdev, &info, None)
                .or(Err(TormentaError::FEATURE_NOT_SUPPORTED))
        }
    }

    /// choose a vkSurfaceFormatKHR for the vkSurfaceKHR
    fn select_surface_format(
        surface_loader: &khr::Surface,
        pdev: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(pdev, surface)
                .or(Err(TormentaError::VK_SURF_NOT_SUPPORTED))?
        };

        formats
            .iter()
            .find(|fmt| {
                (fmt.format == vk::Format::B8G8R8A8_UNORM
                    || fmt.format == vk::Format::B8G8R8A8_SRGB)
                    && fmt.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or(TormentaError::INVALID_FORMAT)
    }

    pub fn new(info: &CreateInfo) -> Result<Self> {
        let instance = Instance::new(info)?;

        let surface = unsafe {
            ash_window::create_surface(
                &instance.i_loader,
                &instance.i_inst,
                info.display.raw_display_handle(),
                info.window.raw_window_handle(),
                None,
            )
            .or(Err(TormentaError::VK_SURF_NOT_SUPPORTED))?
        };
        let surface_loader = khr::Surface::new(&instance.i_loader, &instance.i_inst);

        let (pdev, family_graphics) =
            Self::select_pdev(&instance.i_inst, &surface_loader, surface)?;
        let (family_compute, family_transfer) =
            Self::select_async_families(&instance.i_inst, pdev, family_graphics);
        let pdev_props = unsafe { instance.i_inst.get_physical_device_properties(pdev) };

        let features = Self::probe_features(&instance.i_inst, pdev, info.features);
        let dev = Self::create_device(
            &instance.i_inst,
            pdev,
            &features,
            &[family_graphics, family_compute, family_transfer],
        )?;

        let queue_graphics = unsafe { dev.get_device_queue(family_graphics, 0) };
        let queue_compute = unsafe { dev.get_device_queue(family_compute, 0) };
        let queue_transfer = unsafe { dev.get_device_queue(family_transfer, 0) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.i_inst.clone(),
            device: dev.clone(),
            physical_device: pdev,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .or(Err(TormentaError::OUT_OF_MEMORY))?;

        // timestamp query pool: a start/end pair per query slot
        let profiler_enabled = info.profiler_enabled && features.timestamps;
        let query_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(QUERIES_PER_FRAME * MAX_FRAMES as u32 * 2);
        let query_pool = unsafe {
            dev.create_query_pool(&query_info, None)
                .or(Err(TormentaError::OUT_OF_MEMORY))?
        };

        let surface_format = Self::select_surface_format(&surface_loader, pdev, surface)?;

        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(pdev, surface)
                .or(Err(TormentaError::VK_SURF_NOT_SUPPORTED))?
        };
        let present_mode = present_modes
            .iter()
            .cloned()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            // fallback to FIFO, which is always available
            .unwrap_or(vk::PresentModeKHR::FIFO);

        let mut fences = [vk::Fence::null(); MAX_FRAMES];
        let mut image_available = [vk::Semaphore::null(); MAX_FRAMES];
        let mut render_finished = [vk::Semaphore::null(); MAX_FRAMES];
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let sema_info = vk::SemaphoreCreateInfo::builder();
        for i in 0..MAX_FRAMES {
            unsafe {
                fences[i] = dev
                    .create_fence(&fence_info, None)
                    .or(Err(TormentaError::OUT_OF_MEMORY))?;
                image_available[i] = dev
                    .create_semaphore(&sema_info, None)
                    .or(Err(TormentaError::OUT_OF_MEMORY))?;
                render_finished[i] = dev
                    .create_semaphore(&sema_info, None)
                    .or(Err(TormentaError::OUT_OF_MEMORY))?;
            }
        }

        let swapchain_loader = khr::Swapchain::new(&instance.i_inst, &dev);
        let mesh_loader = if features.mesh_shader {
            Some(ash::extensions::ext::MeshShader::new(&instance.i_inst, &dev))
        } else {
            None
        };

        let descriptor_pool = Self::create_descriptor_pool(
            &dev,
            info.descriptor_pool_elements,
            info.descriptor_sets_pool_size,
        )?;

        let shared = Arc::new(GpuShared {
            sh_dev: dev,
            sh_queue_graphics: queue_graphics,
            sh_queue_compute: queue_compute,
            sh_queue_transfer: queue_transfer,
            sh_family_graphics: family_graphics,
            sh_family_compute: family_compute,
            sh_family_transfer: family_transfer,
            sh_mesh: mesh_loader,
            sh_query_pool: query_pool,
            sh_descriptor_pool: descriptor_pool,
            sh_transfer_lock: Mutex::new(()),
            sh_res: RwLock::new(ResourceStore::new()),
            sh_profiler: Mutex::new(Profiler::new(
                QUERIES_PER_FRAME,
                MAX_FRAMES as u32,
                pdev_props.limits.timestamp_period,
            )),
            sh_profiler_enabled: AtomicBool::new(profiler_enabled),
            sh_current_frame: AtomicUsize::new(0),
        });

        let cmds = CommandBufferManager::new(
            shared.clone(),
            info.worker_threads,
            info.command_buffers_per_frame,
        )?;

        let mut device = Self {
            d_inst: instance,
            d_pdev: pdev,
            d_pdev_props: pdev_props,
            d_features: features,
            d_enabled: FeatureFlags::empty(),
            d_shared: shared,
            d_allocator: Some(Arc::new(Mutex::new(allocator))),
            d_surface_loader: surface_loader,
            d_swapchain_loader: swapchain_loader,
            d_surface: surface,
            d_swapchain: vk::SwapchainKHR::null(),
            d_surface_format: surface_format,
            d_present_mode: present_mode,
            d_resolution: vk::Extent2D {
                width: info.width,
                height: info.height,
            },
            d_swap_images: Vec::new(),
            d_swap_views: Vec::new(),
            d_swap_pass: RenderPassHandle::INVALID,
            d_swap_framebuffers: Vec::new(),
            d_image_index: 0,
            d_fences: fences,
            d_image_available: image_available,
            d_render_finished: render_finished,
            d_absolute_frame: 0,
            d_needs_resize: false,
            d_pending_resize: None,
            d_timestamp_period: pdev_props.limits.timestamp_period,
            d_dynamic: DynamicRing {
                dr_buffer: BufferHandle::INVALID,
                dr_size_per_frame: info.dynamic_ssbo_size,
                dr_head: 0,
            },
            d_deletion: DeletionQueue::new(),
            d_cmds: cmds,
            d_default_sampler: SamplerHandle::INVALID,
            d_copy_pool: vk::CommandPool::null(),
            d_copy_cbuf: vk::CommandBuffer::null(),
            d_gfx_copy_pool: vk::CommandPool::null(),
            d_gfx_copy_cbuf: vk::CommandBuffer::null(),
        };

        let (copy_pool, copy_cbuf) = device.create_one_shot_pool(family_transfer)?;
        let (gfx_pool, gfx_cbuf) = device.create_one_shot_pool(family_graphics)?;
        device.d_copy_pool = copy_pool;
        device.d_copy_cbuf = copy_cbuf;
        device.d_gfx_copy_pool = gfx_pool;
        device.d_gfx_copy_cbuf = gfx_cbuf;

        device.d_enabled = device.enabled_flags(info.features);
        device.create_swapchain(info.width, info.height)?;
        device.create_dynamic_ring(info.dynamic_ssbo_size)?;
        device.d_default_sampler = device.create_sampler(
            SamplerCreation::default()
                .set_min_mag_mip(
                    vk::Filter::LINEAR,
                    vk::Filter::LINEAR,
                    vk::SamplerMipmapMode::LINEAR,
                )
                .set_name("default-sampler"),
        )?;

        Ok(device)
    }

    fn enabled_flags(&self, requested: FeatureFlags) -> FeatureFlags {
        let mut flags = requested & FeatureFlags::DRAW_INDIRECT;
        if self.d_features.bindless {
            flags |= FeatureFlags::BINDLESS;
        }
        if self.d_features.storage_8bit {
            flags |= FeatureFlags::STORAGE_8BIT;
        }
        if self.d_features.storage_16bit {
            flags |= FeatureFlags::STORAGE_16BIT;
        }
        if self.d_features.draw_indirect_count {
            flags |= FeatureFlags::DRAW_INDIRECT_COUNT;
        }
        if self.d_features.mesh_shader {
            flags |= FeatureFlags::MESH_SHADER;
        }
        flags
    }

    pub(crate) fn dev(&self) -> &ash::Device {
        &self.d_shared.sh_dev
    }

    pub(crate) fn current_frame(&self) -> usize {
        (self.d_absolute_frame as usize) % MAX_FRAMES
    }

    pub fn swapchain_size(&self) -> (u32, u32) {
        (self.d_resolution.width, self.d_resolution.height)
    }

    pub(crate) fn set_name<H: vk::Handle>(&self, handle: H, name: &str) {
        self.d_inst
            .set_object_name(&self.d_shared.sh_dev, handle, name);
    }

    // ------------------------------------------------------------------
    // Swapchain
    // ------------------------------------------------------------------

    fn create_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        let caps = unsafe {
            self.d_surface_loader
                .get_physical_device_surface_capabilities(self.d_pdev, self.d_surface)
                .or(Err(TormentaError::VK_SURF_NOT_SUPPORTED))?
        };

        let mut extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D { width, height }
        };
        extent.width = extent
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width);
        extent.height = extent
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height);

        let mut desired_image_count = (MAX_FRAMES as u32).max(caps.min_image_count);
        if caps.max_image_count > 0 {
            desired_image_count = desired_image_count.min(caps.max_image_count);
        }

        let transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.d_surface)
            .min_image_count(desired_image_count)
            .image_color_space(self.d_surface_format.color_space)
            .image_format(self.d_surface_format.format)
            .image_extent(extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.d_present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(self.d_swapchain);

        let new_swapchain = unsafe {
            self.d_swapchain_loader
                .create_swapchain(&create_info, None)
                .or(Err(TormentaError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        self.destroy_swapchain_resources();
        self.d_swapchain = new_swapchain;
        self.d_resolution = extent;

        let images = unsafe {
            self.d_swapchain_loader
                .get_swapchain_images(self.d_swapchain)
                .or(Err(TormentaError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        let mut views = Vec::new();
        for image in images.iter() {
            let view_info = vk::ImageViewCreateInfo::builder()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.d_surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image(*image);
            views.push(unsafe {
                self.d_shared
                    .sh_dev
                    .create_image_view(&view_info, None)
                    .or(Err(TormentaError::COULD_NOT_CREATE_SWAPCHAIN))?
            });
        }

        self.d_swap_images = images;
        self.d_swap_views = views;
        self.create_swapchain_pass()?;

        Ok(())
    }

    /// Build the render pass + framebuffers used by nodes that draw
    /// directly to the screen.
    fn create_swapchain_pass(&mut self) -> Result<()> {
        let output = RenderPassOutput::default().color(
            self.d_surface_format.format,
            vk::ImageLayout::PRESENT_SRC_KHR,
            RenderPassOp::Clear,
        );
        let pass = self.create_render_pass(
            RenderPassCreation {
                output,
                ..Default::default()
            }
            .set_name("swapchain"),
        )?;

        let mut framebuffers = Vec::new();
        for (i, view) in self.d_swap_views.iter().enumerate() {
            let vk_pass = {
                let res = self.d_shared.sh_res.read().unwrap();
                res.render_passes.access(pass).vk_render_pass
            };
            let attachments = [*view];
            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(vk_pass)
                .attachments(&attachments)
                .width(self.d_resolution.width)
                .height(self.d_resolution.height)
                .layers(1);
            let vk_framebuffer = unsafe {
                self.d_shared
                    .sh_dev
                    .create_framebuffer(&info, None)
                    .or(Err(TormentaError::COULD_NOT_CREATE_SWAPCHAIN))?
            };
            self.set_name(vk_framebuffer, &format!("swapchain-fb-{}", i));

            let mut res = self.d_shared.sh_res.write().unwrap();
            let (handle, framebuffer) = res.framebuffers.obtain_and_access()?;
            framebuffer.vk_framebuffer = vk_framebuffer;
            framebuffer.render_pass = pass;
            framebuffer.width = self.d_resolution.width;
            framebuffer.height = self.d_resolution.height;
            framebuffer.name = crate::strings::intern("swapchain");
            framebuffers.push(handle);
        }

        self.d_swap_pass = pass;
        self.d_swap_framebuffers = framebuffers;
        Ok(())
    }

    fn destroy_swapchain_resources(&mut self) {
        if self.d_swap_views.is_empty() && !self.d_swap_pass.is_valid() {
            return;
        }

        self.wait_idle();

        for handle in std::mem::take(&mut self.d_swap_framebuffers) {
            self.destroy_framebuffer_now(handle);
        }
        if self.d_swap_pass.is_valid() {
            let pass = self.d_swap_pass;
            self.d_swap_pass = RenderPassHandle::INVALID;
            self.destroy_render_pass_now(pass);
        }
        unsafe {
            for view in self.d_swap_views.drain(..) {
                self.d_shared.sh_dev.destroy_image_view(view, None);
            }
        }
        self.d_swap_images.clear();
    }

    /// The framebuffer for the swapchain image acquired this frame.
    pub(crate) fn current_swap_framebuffer(&self) -> FramebufferHandle {
        self.d_swap_framebuffers[self.d_image_index as usize]
    }

    // ------------------------------------------------------------------
    // Frame loop
    // ------------------------------------------------------------------

    /// Begin a frame: wait until this slot's previous work finished
    /// on the GPU, then acquire a swapchain image. Returns SKIP_FRAME
    /// and schedules a rebuild when the swapchain is stale.
    pub fn new_frame(&mut self) -> Result<()> {
        // A rebuild scheduled last frame happens before the acquire.
        if self.d_needs_resize {
            self.rebuild_swapchain()?;
        }

        let frame = self.current_frame();
        let dev = &self.d_shared.sh_dev;

        unsafe {
            dev.wait_for_fences(&[self.d_fences[frame]], true, u64::MAX)
                .or(Err(TormentaError::DEVICE_LOST))?;
        }

        // This slot's commands are done, its transient state can go.
        if self.d_absolute_frame >= MAX_FRAMES as u64 {
            let completed = self.d_absolute_frame - MAX_FRAMES as u64;
            self.collect_garbage(completed);
        }

        let acquire = unsafe {
            self.d_swapchain_loader.acquire_next_image(
                self.d_swapchain,
                u64::MAX,
                self.d_image_available[frame],
                vk::Fence::null(),
            )
        };

        self.d_image_index = match acquire {
            Ok((index, false)) => index,
            // suboptimal still acquired the image, present it and
            // rebuild on the next tick
            Ok((index, true)) => {
                self.d_needs_resize = true;
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                self.d_needs_resize = true;
                return Err(TormentaError::SKIP_FRAME);
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => return Err(TormentaError::DEVICE_LOST),
            Err(_) => return Err(TormentaError::COULD_NOT_ACQUIRE_NEXT_IMAGE),
        };

        unsafe {
            self.d_shared
                .sh_dev
                .reset_fences(&[self.d_fences[frame]])
                .or(Err(TormentaError::DEVICE_LOST))?;
        }

        self.d_shared
            .sh_current_frame
            .store(frame, Ordering::Relaxed);

        // previous timestamps for this slot are complete now
        if self.d_shared.profiler_enabled() {
            let mut profiler = self.d_shared.sh_profiler.lock().unwrap();
            profiler.fetch_data_from_gpu(
                &self.d_shared.sh_dev,
                self.d_shared.sh_query_pool,
                frame as u32,
                self.d_absolute_frame,
            );
            profiler.reset_timestamps();
        }

        self.d_dynamic.dr_head = 0;
        self.d_cmds.reset_frame(frame)?;

        Ok(())
    }

    /// Submit the recorded primaries and present the acquired image.
    pub fn present(&mut self, cmd_bufs: &[vk::CommandBuffer]) -> Result<()> {
        let frame = self.current_frame();
        let dev = &self.d_shared.sh_dev;

        let wait_semas = [self.d_image_available[frame]];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semas = [self.d_render_finished[frame]];

        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semas)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(cmd_bufs)
            .signal_semaphores(&signal_semas)
            .build();

        unsafe {
            dev.queue_submit(
                self.d_shared.sh_queue_graphics,
                &[submit],
                self.d_fences[frame],
            )
            .or(Err(TormentaError::DEVICE_LOST))?;
        }

        let swapchains = [self.d_swapchain];
        let indices = [self.d_image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let result = unsafe {
            self.d_swapchain_loader
                .queue_present(self.d_shared.sh_queue_graphics, &present_info)
        };
        match result {
            Ok(false) => {}
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                self.d_needs_resize = true;
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => return Err(TormentaError::DEVICE_LOST),
            Err(_) => return Err(TormentaError::PRESENT_FAILED),
        }

        self.d_absolute_frame += 1;
        Ok(())
    }

    /// Tear the swapchain down and rebuild it at the surface's
    /// current size. The dimensions of the change are stashed for the
    /// frame graph to pick up.
    fn rebuild_swapchain(&mut self) -> Result<()> {
        self.wait_idle();

        let old_w = self.d_resolution.width;
        let old_h = self.d_resolution.height;

        self.create_swapchain(old_w, old_h)?;
        self.d_needs_resize = false;

        let new_w = self.d_resolution.width;
        let new_h = self.d_resolution.height;
        if old_w != new_w || old_h != new_h {
            // merge with an unconsumed earlier resize so the graph
            // scales from the size it last compiled at
            let (base_w, base_h) = match self.d_pending_resize {
                Some((w, _, h, _)) => (w, h),
                None => (old_w, old_h),
            };
            self.d_pending_resize = Some((base_w, new_w, base_h, new_h));
        }

        Ok(())
    }

    /// Explicit resize request from the application.
    pub fn schedule_resize(&mut self) {
        self.d_needs_resize = true;
    }

    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.d_shared.sh_dev.device_wait_idle();
        }
    }

    // ------------------------------------------------------------------
    // Dynamic buffer ring
    // ------------------------------------------------------------------

    fn create_dynamic_ring(&mut self, size_per_frame: u64) -> Result<()> {
        let total = size_per_frame * MAX_FRAMES as u64;
        let handle = self.create_buffer(
            BufferCreation::default()
                .set(
                    BufferUsage::UNIFORM | BufferUsage::STORAGE | BufferUsage::VERTEX
                        | BufferUsage::INDEX,
                    ResourceUsageType::Staging,
                    total,
                )
                .set_name("dynamic-ring"),
        )?;
        self.d_dynamic.dr_buffer = handle;
        Ok(())
    }

    /// Carve a region for the current frame out of the ring. Returns
    /// the global offset into the backing buffer.
    pub(crate) fn allocate_dynamic(&mut self, size: u64, align: u64) -> Result<u64> {
        let head = match self.d_dynamic.bump(size, align) {
            Some(head) => head,
            None => {
                log::error!(
                    "dynamic ring exhausted: {} more bytes do not fit in {}",
                    size,
                    self.d_dynamic.dr_size_per_frame
                );
                return Err(TormentaError::OUT_OF_MEMORY);
            }
        };

        let frame_base = self.current_frame() as u64 * self.d_dynamic.dr_size_per_frame;
        Ok(frame_base + head)
    }

    // ------------------------------------------------------------------
    // One-shot transfer work
    // ------------------------------------------------------------------

    fn create_one_shot_pool(&self, family: u32) -> Result<(vk::CommandPool, vk::CommandBuffer)> {
        let dev = self.dev();
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);
        let pool = unsafe {
            dev.create_command_pool(&pool_info, None)
                .or(Err(TormentaError::OUT_OF_MEMORY))?
        };
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cbuf = unsafe {
            dev.allocate_command_buffers(&alloc_info)
                .or(Err(TormentaError::OUT_OF_MEMORY))?[0]
        };
        Ok((pool, cbuf))
    }

    fn one_shot<F>(&self, cmd: vk::CommandBuffer, queue: vk::Queue, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let dev = &self.d_shared.sh_dev;

        unsafe {
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            dev.begin_command_buffer(cmd, &begin)
                .or(Err(TormentaError::UNKNOWN))?;

            record(dev, cmd);

            dev.end_command_buffer(cmd).or(Err(TormentaError::UNKNOWN))?;

            let cmds = [cmd];
            let submit = vk::SubmitInfo::builder().command_buffers(&cmds).build();
            dev.queue_submit(queue, &[submit], vk::Fence::null())
                .or(Err(TormentaError::DEVICE_LOST))?;
            dev.queue_wait_idle(queue)
                .or(Err(TormentaError::DEVICE_LOST))?;
        }

        Ok(())
    }

    /// Record and synchronously run transfer queue commands. Only
    /// used for load time uploads, never inside the frame loop.
    pub(crate) fn transfer_one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let _guard = self.d_shared.sh_transfer_lock.lock().unwrap();
        self.one_shot(self.d_copy_cbuf, self.d_shared.sh_queue_transfer, record)
    }

    /// Record and synchronously run graphics queue commands, for
    /// uploads that need blits or attachment layouts.
    pub(crate) fn graphics_one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        self.one_shot(
            self.d_gfx_copy_cbuf,
            self.d_shared.sh_queue_graphics,
            record,
        )
    }

    // ------------------------------------------------------------------
    // Deferred destruction
    // ------------------------------------------------------------------

    /// Queue a resource for destruction once the current frame's GPU
    /// work completes.
    pub(crate) fn defer_destroy(&mut self, zombie: Zombie) {
        self.d_deletion.push(self.d_absolute_frame, zombie);
    }

    fn collect_garbage(&mut self, completed_frame: u64) {
        for zombie in self.d_deletion.drain_completed(completed_frame) {
            self.destroy_zombie(zombie);
        }
    }

    /// Destroy every live pool entry. Teardown only; resources in
    /// flight must be drained first.
    fn release_all_resources(&mut self) {
        macro_rules! drain {
            ($pool:ident, $destroy:ident) => {
                let handles: Vec<_> = {
                    let res = self.d_shared.sh_res.read().unwrap();
                    res.$pool.iter_handles().collect()
                };
                for handle in handles {
                    self.$destroy(handle);
                }
            };
        }

        // dependents first, dependencies after
        let technique_handles: Vec<_> = {
            let res = self.d_shared.sh_res.read().unwrap();
            res.techniques.iter_handles().collect()
        };
        for handle in technique_handles {
            let pipelines = {
                let mut res = self.d_shared.sh_res.write().unwrap();
                let pipelines = std::mem::take(&mut res.techniques.access_mut(handle).pipelines);
                res.techniques.release(handle);
                pipelines
            };
            for pipeline in pipelines {
                self.destroy_pipeline_now(pipeline);
            }
        }

        drain!(pipelines, destroy_pipeline_now);
        drain!(programs, destroy_program_now);
        drain!(descriptor_sets, destroy_descriptor_set_now);
        drain!(descriptor_set_layouts, destroy_descriptor_set_layout_now);
        drain!(framebuffers, destroy_framebuffer_now);
        drain!(render_passes, destroy_render_pass_now);
        drain!(textures, destroy_texture_now);
        drain!(samplers, destroy_sampler_now);
        drain!(buffers, destroy_buffer_now);
    }

    pub(crate) fn destroy_zombie(&mut self, zombie: Zombie) {
        match zombie {
            Zombie::Buffer(h) => self.destroy_buffer_now(h),
            Zombie::Texture(h) => self.destroy_texture_now(h),
            Zombie::Sampler(h) => self.destroy_sampler_now(h),
            Zombie::RenderPass(h) => self.destroy_render_pass_now(h),
            Zombie::Framebuffer(h) => self.destroy_framebuffer_now(h),
            Zombie::DescriptorSet(h) => self.destroy_descriptor_set_now(h),
            Zombie::Pipeline(h) => self.destroy_pipeline_now(h),
            Zombie::Program(h) => self.destroy_program_now(h),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_queue_holds_until_frame_completes() {
        let mut queue = DeletionQueue::new();
        queue.push(3, Zombie::Buffer(BufferHandle::new(1)));
        queue.push(5, Zombie::Texture(TextureHandle::new(2)));

        assert!(queue.drain_completed(2).is_empty());

        let ready = queue.drain_completed(3);
        assert_eq!(ready.len(), 1);
        assert!(matches!(ready[0], Zombie::Buffer(handle) if handle.index() == 1));

        let rest = queue.drain_completed(u64::MAX);
        assert_eq!(rest.len(), 1);
        assert!(matches!(rest[0], Zombie::Texture(handle) if handle.index() == 2));
        assert!(queue.drain_completed(u64::MAX).is_empty());
    }

    #[test]
    fn dynamic_ring_offsets_are_aligned() {
        let mut ring = DynamicRing {
            dr_buffer: BufferHandle::INVALID,
            dr_size_per_frame: 1024,
            dr_head: 0,
        };

        assert_eq!(ring.bump(100, 256), Some(0));
        assert_eq!(ring.bump(100, 256), Some(256));
        assert_eq!(ring.bump(16, 64), Some(384));
        assert_eq!(ring.bump(1024, 256), None);

        // a new frame resets the head
        ring.dr_head = 0;
        assert_eq!(ring.bump(512, 256), Some(0));
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.wait_idle();

        // flush everything still queued
        let pending: Vec<Zombie> = self.d_deletion.drain_completed(u64::MAX);
        for zombie in pending {
            self.destroy_zombie(zombie);
        }

        if self.d_dynamic.dr_buffer.is_valid() {
            let handle = self.d_dynamic.dr_buffer;
            self.d_dynamic.dr_buffer = BufferHandle::INVALID;
            self.destroy_buffer_now(handle);
        }
        if self.d_default_sampler.is_valid() {
            let handle = self.d_default_sampler;
            self.d_default_sampler = SamplerHandle::INVALID;
            self.destroy_sampler_now(handle);
        }

        self.destroy_swapchain_resources();
        self.release_all_resources();
        self.d_cmds.destroy();

        // the allocator has to release its memory blocks before the
        // device goes away
        let allocator = self.d_allocator.take();

        unsafe {
            let dev = &self.d_shared.sh_dev;
            dev.destroy_command_pool(self.d_copy_pool, None);
            dev.destroy_command_pool(self.d_gfx_copy_pool, None);
            dev.destroy_descriptor_pool(self.d_shared.sh_descriptor_pool, None);
            dev.destroy_query_pool(self.d_shared.sh_query_pool, None);
            for i in 0..MAX_FRAMES {
                dev.destroy_fence(self.d_fences[i], None);
                dev.destroy_semaphore(self.d_image_available[i], None);
                dev.destroy_semaphore(self.d_render_finished[i], None);
            }
            if self.d_swapchain != vk::SwapchainKHR::null() {
                self.d_swapchain_loader
                    .destroy_swapchain(self.d_swapchain, None);
            }

            drop(allocator);

            dev.destroy_device(None);
            self.d_surface_loader.destroy_surface(self.d_surface, None);
        }
    }
}
