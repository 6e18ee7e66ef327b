// Buffer factory
//
// Three kinds of buffers come out of here. Immutable buffers are
// device local and filled once through a staging copy on the
// transfer queue. Dynamic buffers own no memory at all; they
// suballocate a fresh region of the per frame ring every time they
// are mapped. Staging buffers are host visible scratch.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use crate::device::{Device, Zombie};
use crate::resources::*;
use crate::state::ResourceState;
use crate::{Result, TormentaError};

impl Device {
    pub fn create_buffer(&mut self, creation: BufferCreation) -> Result<BufferHandle> {
        if creation.size == 0 {
            log::error!("refusing to create zero sized buffer '{}'", creation.name);
            return Err(TormentaError::INVALID_ARGUMENT);
        }

        match creation.usage_type {
            ResourceUsageType::Dynamic => self.create_dynamic_buffer(creation),
            ResourceUsageType::Immutable => self.create_immutable_buffer(creation),
            ResourceUsageType::Staging => self.create_staging_buffer(creation),
        }
    }

    /// Dynamic buffers are views into the frame ring; they get a new
    /// region on every map.
    fn create_dynamic_buffer(&mut self, creation: BufferCreation) -> Result<BufferHandle> {
        let parent = self.d_dynamic.dr_buffer;

        let mut res = self.d_shared.sh_res.write().unwrap();
        let (handle, buffer) = res.buffers.obtain_and_access()?;
        buffer.usage = creation.usage;
        buffer.usage_type = ResourceUsageType::Dynamic;
        buffer.size = creation.size;
        buffer.parent = parent;
        buffer.name = creation.name;
        Ok(handle)
    }

    fn allocate_backed_buffer(
        &mut self,
        size: u64,
        vk_usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<(vk::Buffer, Allocation)> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let vk_buffer = unsafe {
            self.dev()
                .create_buffer(&info, None)
                .or(Err(TormentaError::OUT_OF_MEMORY))?
        };
        let requirements = unsafe { self.dev().get_buffer_memory_requirements(vk_buffer) };

        let allocation = self
            .d_allocator
            .as_ref()
            .unwrap()
            .lock()
            .unwrap()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .or(Err(TormentaError::OUT_OF_MEMORY))?;

        unsafe {
            self.dev()
                .bind_buffer_memory(vk_buffer, allocation.memory(), allocation.offset())
                .or(Err(TormentaError::OUT_OF_MEMORY))?;
        }

        self.set_name(vk_buffer, name);
        Ok((vk_buffer, allocation))
    }

    fn create_immutable_buffer(&mut self, creation: BufferCreation) -> Result<BufferHandle> {
        let vk_usage =
            creation.usage.to_vk() | vk::BufferUsageFlags::TRANSFER_DST;
        let (vk_buffer, allocation) = self.allocate_backed_buffer(
            creation.size,
            vk_usage,
            MemoryLocation::GpuOnly,
            creation.name,
        )?;

        let handle = {
            let mut res = self.d_shared.sh_res.write().unwrap();
            let (handle, buffer) = res.buffers.obtain_and_access()?;
            buffer.vk_buffer = vk_buffer;
            buffer.allocation = Some(allocation);
            buffer.usage = creation.usage;
            buffer.usage_type = ResourceUsageType::Immutable;
            buffer.size = creation.size;
            buffer.parent = BufferHandle::INVALID;
            buffer.state = ResourceState::UNDEFINED;
            buffer.name = creation.name;
            handle
        };

        if let Some(data) = creation.initial_data {
            self.upload_buffer(handle, &data)?;
        } else if let Some(value) = creation.fill_value {
            let size = creation.size;
            self.transfer_one_shot(|dev, cmd| unsafe {
                dev.cmd_fill_buffer(cmd, vk_buffer, 0, size, value);
            })?;
        }

        Ok(handle)
    }

    fn create_staging_buffer(&mut self, creation: BufferCreation) -> Result<BufferHandle> {
        let vk_usage = creation.usage.to_vk()
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;
        let (vk_buffer, allocation) = self.allocate_backed_buffer(
            creation.size,
            vk_usage,
            MemoryLocation::CpuToGpu,
            creation.name,
        )?;

        let mapped = allocation
            .mapped_ptr()
            .map(|ptr| unsafe { std::ptr::NonNull::new_unchecked(ptr.as_ptr() as *mut u8) });

        if let Some(data) = &creation.initial_data {
            if let Some(ptr) = mapped {
                let len = data.len().min(creation.size as usize);
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), len);
                }
            }
        }

        let mut res = self.d_shared.sh_res.write().unwrap();
        let (handle, buffer) = res.buffers.obtain_and_access()?;
        buffer.vk_buffer = vk_buffer;
        buffer.allocation = Some(allocation);
        buffer.usage = creation.usage;
        buffer.usage_type = ResourceUsageType::Staging;
        buffer.size = creation.size;
        buffer.parent = BufferHandle::INVALID;
        buffer.mapped_ptr = mapped;
        buffer.name = creation.name;
        Ok(handle)
    }

    /// Copy `data` into a device local buffer through a staging
    /// buffer on the transfer queue. Synchronous; meant for load
    /// time and the upload worker, not the frame loop.
    pub(crate) fn upload_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let staging = self.create_buffer(
            BufferCreation::default()
                .set(
                    BufferUsage::empty(),
                    ResourceUsageType::Staging,
                    data.len() as u64,
                )
                .set_initial_data(data.to_vec())
                .set_name("upload-staging"),
        )?;

        let (src, dst, size) = {
            let res = self.d_shared.sh_res.read().unwrap();
            let src = res.buffers.access(staging).vk_buffer;
            let dst = res.buffers.access(handle).vk_buffer;
            (src, dst, data.len() as u64)
        };

        self.transfer_one_shot(|dev, cmd| unsafe {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            dev.cmd_copy_buffer(cmd, src, dst, &[region]);
        })?;

        self.destroy_buffer_now(staging);
        Ok(())
    }

    /// Map a dynamic or staging buffer.
    ///
    /// Dynamic buffers are given a fresh region of the frame ring
    /// here; recording then binds `parent` at `global_offset`.
    /// Mapping a device local buffer is refused.
    pub fn map_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        size: u64,
    ) -> Result<*mut u8> {
        let (usage_type, buf_size) = {
            let res = self.d_shared.sh_res.read().unwrap();
            let buffer = res
                .buffers
                .try_access(handle)
                .ok_or(TormentaError::INVALID_HANDLE)?;
            (buffer.usage_type, buffer.size)
        };

        let size = if size == 0 { buf_size } else { size };
        if offset + size > buf_size {
            return Err(TormentaError::INVALID_ARGUMENT);
        }

        match usage_type {
            ResourceUsageType::Dynamic => {
                let global_offset = self.allocate_dynamic(size, 256)?;
                let ring = self.d_dynamic.dr_buffer;

                let res = self.d_shared.sh_res.read().unwrap();
                let base = res
                    .buffers
                    .access(ring)
                    .mapped_ptr
                    .ok_or(TormentaError::UNKNOWN)?;
                let ptr = unsafe { base.as_ptr().add(global_offset as usize + offset as usize) };
                drop(res);

                let mut res = self.d_shared.sh_res.write().unwrap();
                let buffer = res.buffers.access_mut(handle);
                buffer.global_offset = global_offset;
                buffer.mapped_ptr = std::ptr::NonNull::new(ptr);
                Ok(ptr)
            }
            ResourceUsageType::Staging => {
                let res = self.d_shared.sh_res.read().unwrap();
                let buffer = res.buffers.access(handle);
                let base = buffer.mapped_ptr.ok_or(TormentaError::UNKNOWN)?;
                Ok(unsafe { base.as_ptr().add(offset as usize) })
            }
            ResourceUsageType::Immutable => {
                log::error!("cannot map device local buffer '{}'", handle.index());
                Err(TormentaError::INVALID_ARGUMENT)
            }
        }
    }

    pub fn unmap_buffer(&mut self, _handle: BufferHandle) {
        // the ring and staging memory stay persistently mapped; the
        // call exists so recording order reads explicitly in the app
    }

    /// Immediately destroy a buffer. Callers must know the GPU is
    /// done with it; the facade routes through the deletion queue.
    pub(crate) fn destroy_buffer_now(&mut self, handle: BufferHandle) {
        let mut res = self.d_shared.sh_res.write().unwrap();
        if res.buffers.try_access(handle).is_none() {
            return;
        }

        let buffer = res.buffers.access_mut(handle);
        let vk_buffer = buffer.vk_buffer;
        let allocation = buffer.allocation.take();
        res.buffers.release(handle);
        drop(res);

        if vk_buffer != vk::Buffer::null() {
            unsafe {
                self.dev().destroy_buffer(vk_buffer, None);
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

    pub(crate) fn destroy_buffer_deferred(&mut self, handle: BufferHandle) {
        self.defer_destroy(Zombie::Buffer(handle));
    }
}
