// Command recording
//
// A CommandBuffer wraps one vkCommandBuffer with the cached state the
// recording protocol needs: the bound pass, pipeline, clear values
// and the frame graph name snapshot descriptor binds resolve
// through. The recorder is self contained (it owns clones of the
// shared device state) so pass callbacks can record while the
// renderer itself is mutably borrowed.
//
// Buffers live in pools partitioned frame x thread: slot 0 of each
// frame holds primaries, slots 1..N the per-worker secondary pools.

use ash::vk;
use fxhash::FxHashMap;

use crate::device::GpuShared;
use crate::resources::*;
use crate::state::{self, QueueClass, ResourceState};
use crate::{Result, TormentaError, MAX_FRAMES};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct CommandBuffer {
    cb_shared: Arc<GpuShared>,
    cb_cmd: vk::CommandBuffer,
    /// Shared with the pool slot so reuse while recording is caught.
    cb_recording: Arc<AtomicBool>,
    cb_secondary: bool,

    cb_current_render_pass: RenderPassHandle,
    cb_current_framebuffer: FramebufferHandle,
    cb_current_pipeline: PipelineHandle,
    cb_fb_height: u32,

    cb_clear_colors: [vk::ClearValue; MAX_IMAGE_OUTPUTS],
    cb_clear_depth_stencil: vk::ClearValue,

    /// Resolved frame graph resources for the frame being recorded,
    /// keyed by name hash. Descriptor binds against graph names look
    /// up here.
    cb_graph_bindings: FxHashMap<u64, BindingTarget>,
}

impl CommandBuffer {
    fn dev(&self) -> &ash::Device {
        &self.cb_shared.sh_dev
    }

    pub(crate) fn vk_cmd(&self) -> vk::CommandBuffer {
        self.cb_cmd
    }

    pub fn is_recording(&self) -> bool {
        self.cb_recording.load(Ordering::Acquire)
    }

    pub(crate) fn set_graph_bindings(&mut self, bindings: FxHashMap<u64, BindingTarget>) {
        self.cb_graph_bindings = bindings;
    }

    pub(crate) fn set_framebuffer_height(&mut self, height: u32) {
        self.cb_fb_height = height;
    }

    fn begin(&mut self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.dev()
                .begin_command_buffer(self.cb_cmd, &begin_info)
                .or(Err(TormentaError::UNKNOWN))?;
        }
        self.cb_recording.store(true, Ordering::Release);
        Ok(())
    }

    fn begin_secondary(
        &mut self,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
    ) -> Result<()> {
        let (vk_pass, vk_framebuffer) = {
            let res = self.cb_shared.sh_res.read().unwrap();
            (
                res.render_passes.access(render_pass).vk_render_pass,
                res.framebuffers.access(framebuffer).vk_framebuffer,
            )
        };

        let inheritance = vk::CommandBufferInheritanceInfo::builder()
            .render_pass(vk_pass)
            .subpass(0)
            .framebuffer(vk_framebuffer);
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                    | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            )
            .inheritance_info(&inheritance);
        unsafe {
            self.dev()
                .begin_command_buffer(self.cb_cmd, &begin_info)
                .or(Err(TormentaError::UNKNOWN))?;
        }
        self.cb_current_render_pass = render_pass;
        self.cb_current_framebuffer = framebuffer;
        self.cb_recording.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn end(&mut self) -> Result<()> {
        self.end_current_render_pass();
        unsafe {
            self.dev()
                .end_command_buffer(self.cb_cmd)
                .or(Err(TormentaError::UNKNOWN))?;
        }
        self.cb_recording.store(false, Ordering::Release);
        Ok(())
    }

    pub(crate) fn end_current_render_pass(&mut self) {
        if self.cb_current_render_pass.is_valid() && !self.cb_secondary {
            unsafe {
                self.dev().cmd_end_render_pass(self.cb_cmd);
            }
            self.cb_current_render_pass = RenderPassHandle::INVALID;
            self.cb_current_framebuffer = FramebufferHandle::INVALID;
        }
    }

    // ------------------------------------------------------------------
    // Pass and state binding
    // ------------------------------------------------------------------

    pub fn clear_color(&mut self, index: usize, r: f32, g: f32, b: f32, a: f32) {
        self.cb_clear_colors[index] = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [r, g, b, a],
            },
        };
    }

    pub fn clear_depth_stencil(&mut self, depth: f32, stencil: u32) {
        self.cb_clear_depth_stencil = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        };
    }

    /// Begin the node's render pass on its framebuffer. No-op when
    /// the same pass is already open.
    pub(crate) fn bind_pass(
        &mut self,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        use_secondaries: bool,
    ) {
        if self.cb_current_render_pass == render_pass {
            return;
        }
        self.end_current_render_pass();

        let fb_height;
        {
            let res = self.cb_shared.sh_res.read().unwrap();
            let pass = res.render_passes.access(render_pass);
            let fb = res.framebuffers.access(framebuffer);
            fb_height = fb.height;

            let mut clear_values = Vec::new();
            for (i, op) in pass.output.color_ops.iter().enumerate() {
                if *op == RenderPassOp::Clear {
                    clear_values.push(self.cb_clear_colors[i]);
                }
            }
            if pass.output.depth_stencil_format != vk::Format::UNDEFINED
                && pass.output.depth_op == RenderPassOp::Clear
            {
                clear_values.push(self.cb_clear_depth_stencil);
            }

            let begin = vk::RenderPassBeginInfo::builder()
                .render_pass(pass.vk_render_pass)
                .framebuffer(fb.vk_framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: fb.width,
                        height: fb.height,
                    },
                })
                .clear_values(&clear_values);

            let contents = if use_secondaries {
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS
            } else {
                vk::SubpassContents::INLINE
            };
            unsafe {
                self.cb_shared
                    .sh_dev
                    .cmd_begin_render_pass(self.cb_cmd, &begin, contents);
            }
        }

        self.cb_fb_height = fb_height;
        self.cb_current_render_pass = render_pass;
        self.cb_current_framebuffer = framebuffer;
    }

    /// Viewport with the origin at the top left: Y is flipped so the
    /// framebuffer reads the way every other API does.
    pub fn set_viewport(&mut self, x: f32, y: f32, w: f32, h: f32, min_d: f32, max_d: f32) {
        let viewport = vk::Viewport {
            x,
            y: self.cb_fb_height as f32 - y,
            width: w,
            height: -h,
            min_depth: min_d,
            max_depth: max_d,
        };
        unsafe {
            self.dev().cmd_set_viewport(self.cb_cmd, 0, &[viewport]);
        }
    }

    pub fn set_scissor(&mut self, x: i32, y: i32, w: u32, h: u32) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x,
                y: (self.cb_fb_height as i32 - h as i32) - y,
            },
            extent: vk::Extent2D {
                width: w,
                height: h,
            },
        };
        unsafe {
            self.dev().cmd_set_scissor(self.cb_cmd, 0, &[scissor]);
        }
    }

    pub fn bind_pipeline(&mut self, handle: PipelineHandle) {
        if self.cb_current_pipeline == handle {
            return;
        }
        let res = self.cb_shared.sh_res.read().unwrap();
        let pipeline = res.pipelines.access(handle);
        unsafe {
            self.dev()
                .cmd_bind_pipeline(self.cb_cmd, pipeline.bind_point, pipeline.vk_pipeline);
        }
        drop(res);
        self.cb_current_pipeline = handle;
    }

    /// Bind the technique's pipeline for the pass currently open:
    /// the one compiled against this render pass, or the compute
    /// pipeline outside of one.
    pub fn bind_technique(&mut self, handle: TechniqueHandle) -> Result<()> {
        let pipeline = {
            let res = self.cb_shared.sh_res.read().unwrap();
            let technique = res
                .techniques
                .try_access(handle)
                .ok_or(TormentaError::INVALID_HANDLE)?;

            let current_pass = self.cb_current_render_pass;
            technique
                .pipelines
                .iter()
                .copied()
                .find(|&p| {
                    let pipeline = res.pipelines.access(p);
                    if current_pass.is_valid() {
                        pipeline.render_pass == current_pass
                    } else {
                        !pipeline.graphics
                    }
                })
                .or_else(|| technique.pipelines.first().copied())
                .ok_or(TormentaError::NOT_FOUND)?
        };
        self.bind_pipeline(pipeline);
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, handle: BufferHandle, binding: u32, offset: u64) {
        let res = self.cb_shared.sh_res.read().unwrap();
        let buffer = res.buffers.access(handle);

        let (vk_buffer, vk_offset) = if buffer.parent.is_valid() {
            (
                res.buffers.access(buffer.parent).vk_buffer,
                buffer.global_offset + offset,
            )
        } else {
            (buffer.vk_buffer, offset)
        };
        unsafe {
            self.dev()
                .cmd_bind_vertex_buffers(self.cb_cmd, binding, &[vk_buffer], &[vk_offset]);
        }
    }

    pub fn bind_index_buffer(&mut self, handle: BufferHandle, offset: u64, ty: vk::IndexType) {
        let res = self.cb_shared.sh_res.read().unwrap();
        let buffer = res.buffers.access(handle);

        let (vk_buffer, vk_offset) = if buffer.parent.is_valid() {
            (
                res.buffers.access(buffer.parent).vk_buffer,
                buffer.global_offset + offset,
            )
        } else {
            (buffer.vk_buffer, offset)
        };
        unsafe {
            self.dev()
                .cmd_bind_index_buffer(self.cb_cmd, vk_buffer, vk_offset, ty);
        }
    }

    /// Flush pending descriptor writes for the set and bind it, with
    /// one dynamic offset per dynamic buffer binding in layout
    /// declaration order.
    pub fn bind_descriptor_set(&mut self, handle: DescriptorSetHandle, set: u32) -> Result<()> {
        let (layout_handle, vk_pipeline_layout, bind_point) = {
            let res = self.cb_shared.sh_res.read().unwrap();
            let pipeline = res
                .pipelines
                .try_access(self.cb_current_pipeline)
                .ok_or(TormentaError::INVALID_ARGUMENT)?;
            let layout_handle = pipeline
                .set_layouts
                .iter()
                .copied()
                .find(|&layout| {
                    res.descriptor_set_layouts.access(layout).data.set_number == set
                })
                .ok_or(TormentaError::INVALID_ARGUMENT)?;
            (layout_handle, pipeline.vk_layout, pipeline.bind_point)
        };

        let vk_set = crate::resources::descriptor::update_descriptor_set(
            &self.cb_shared,
            handle,
            layout_handle,
            &self.cb_graph_bindings,
        )?;

        // dynamic offsets, in the order the layout declares them
        let mut offsets = Vec::new();
        {
            let res = self.cb_shared.sh_res.read().unwrap();
            let layout = res.descriptor_set_layouts.access(layout_handle);
            let ds = res.descriptor_sets.access(handle);
            for binding in &layout.data.bindings {
                if binding.descriptor_type == vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                    || binding.descriptor_type == vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
                {
                    let offset = match ds.cached[binding.binding as usize] {
                        BindingTarget::Buffer(buffer) => res
                            .buffers
                            .try_access(buffer)
                            .map(|b| b.global_offset as u32)
                            .unwrap_or(0),
                        _ => 0,
                    };
                    offsets.push(offset);
                }
            }
        }

        unsafe {
            self.dev().cmd_bind_descriptor_sets(
                self.cb_cmd,
                bind_point,
                vk_pipeline_layout,
                set,
                &[vk_set],
                &offsets,
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Draws and dispatch
    // ------------------------------------------------------------------

    pub fn draw(&mut self, first_vertex: u32, vertex_count: u32, first_instance: u32, instance_count: u32) {
        unsafe {
            self.dev().cmd_draw(
                self.cb_cmd,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    pub fn draw_indexed(
        &mut self,
        first_index: u32,
        index_count: u32,
        vertex_offset: i32,
        first_instance: u32,
        instance_count: u32,
    ) {
        unsafe {
            self.dev().cmd_draw_indexed(
                self.cb_cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    fn resolve_indirect(&self, handle: BufferHandle, offset: u64) -> (vk::Buffer, u64) {
        let res = self.cb_shared.sh_res.read().unwrap();
        let buffer = res.buffers.access(handle);
        if buffer.parent.is_valid() {
            (
                res.buffers.access(buffer.parent).vk_buffer,
                buffer.global_offset + offset,
            )
        } else {
            (buffer.vk_buffer, offset)
        }
    }

    pub fn draw_indirect(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        count_buffer: Option<(BufferHandle, u64)>,
        max_draws: u32,
        stride: u32,
    ) {
        let (vk_buffer, vk_offset) = self.resolve_indirect(buffer, offset);
        unsafe {
            match count_buffer {
                Some((count, count_offset)) => {
                    let (vk_count, vk_count_offset) = self.resolve_indirect(count, count_offset);
                    self.dev().cmd_draw_indirect_count(
                        self.cb_cmd,
                        vk_buffer,
                        vk_offset,
                        vk_count,
                        vk_count_offset,
                        max_draws,
                        stride,
                    );
                }
                None => {
                    self.dev()
                        .cmd_draw_indirect(self.cb_cmd, vk_buffer, vk_offset, max_draws, stride);
                }
            }
        }
    }

    pub fn draw_indexed_indirect(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        count_buffer: Option<(BufferHandle, u64)>,
        max_draws: u32,
        stride: u32,
    ) {
        let (vk_buffer, vk_offset) = self.resolve_indirect(buffer, offset);
        unsafe {
            match count_buffer {
                Some((count, count_offset)) => {
                    let (vk_count, vk_count_offset) = self.resolve_indirect(count, count_offset);
                    self.dev().cmd_draw_indexed_indirect_count(
                        self.cb_cmd,
                        vk_buffer,
                        vk_offset,
                        vk_count,
                        vk_count_offset,
                        max_draws,
                        stride,
                    );
                }
                None => {
                    self.dev().cmd_draw_indexed_indirect(
                        self.cb_cmd,
                        vk_buffer,
                        vk_offset,
                        max_draws,
                        stride,
                    );
                }
            }
        }
    }

    pub fn draw_mesh_tasks(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        let mesh = self
            .cb_shared
            .sh_mesh
            .as_ref()
            .ok_or(TormentaError::FEATURE_NOT_SUPPORTED)?;
        unsafe {
            mesh.cmd_draw_mesh_tasks(self.cb_cmd, x, y, z);
        }
        Ok(())
    }

    pub fn draw_mesh_tasks_indirect(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<()> {
        let (vk_buffer, vk_offset) = self.resolve_indirect(buffer, offset);
        let mesh = self
            .cb_shared
            .sh_mesh
            .as_ref()
            .ok_or(TormentaError::FEATURE_NOT_SUPPORTED)?;
        unsafe {
            mesh.cmd_draw_mesh_tasks_indirect(self.cb_cmd, vk_buffer, vk_offset, draw_count, stride);
        }
        Ok(())
    }

    pub fn dispatch(&mut self, group_x: u32, group_y: u32, group_z: u32) {
        unsafe {
            self.dev().cmd_dispatch(self.cb_cmd, group_x, group_y, group_z);
        }
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    pub fn fill_buffer(&mut self, handle: BufferHandle, offset: u64, size: u64, value: u32) {
        let (vk_buffer, vk_offset) = self.resolve_indirect(handle, offset);
        unsafe {
            self.dev()
                .cmd_fill_buffer(self.cb_cmd, vk_buffer, vk_offset, size, value);
        }
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle) {
        let (src_buffer, src_offset, size, dst_buffer) = {
            let res = self.cb_shared.sh_res.read().unwrap();
            let src_buf = res.buffers.access(src);
            let size = src_buf.size;
            let (vk_src, src_offset) = if src_buf.parent.is_valid() {
                (
                    res.buffers.access(src_buf.parent).vk_buffer,
                    src_buf.global_offset,
                )
            } else {
                (src_buf.vk_buffer, 0)
            };
            (vk_src, src_offset, size, res.buffers.access(dst).vk_buffer)
        };

        unsafe {
            let region = vk::BufferCopy {
                src_offset,
                dst_offset: 0,
                size,
            };
            self.dev()
                .cmd_copy_buffer(self.cb_cmd, src_buffer, dst_buffer, &[region]);

            let barrier = vk::BufferMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(dst_buffer)
                .offset(0)
                .size(size)
                .build();
            self.dev().cmd_pipeline_barrier(
                self.cb_cmd,
                vk::PipelineStageFlags::TRANSFER,
                state::to_vk_pipeline_stage(barrier.dst_access_mask, QueueClass::Graphics),
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }

    pub fn copy_buffer_to_texture(&mut self, src: BufferHandle, dst: TextureHandle, offset: u64) {
        let (vk_buffer, buffer_offset, image, format, extent) = {
            let res = self.cb_shared.sh_res.read().unwrap();
            let buffer = res.buffers.access(src);
            let texture = res.textures.access(dst);
            let (vk_buffer, base) = if buffer.parent.is_valid() {
                (
                    res.buffers.access(buffer.parent).vk_buffer,
                    buffer.global_offset,
                )
            } else {
                (buffer.vk_buffer, 0)
            };
            (
                vk_buffer,
                base + offset,
                texture.vk_image,
                texture.vk_format,
                vk::Extent3D {
                    width: texture.width,
                    height: texture.height,
                    depth: texture.depth,
                },
            )
        };

        self.texture_barrier(dst, ResourceState::COPY_DEST);
        unsafe {
            let region = vk::BufferImageCopy {
                buffer_offset,
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
            self.dev().cmd_copy_buffer_to_image(
                self.cb_cmd,
                vk_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    /// Regenerate the mip chain of a texture with repeated blits,
    /// leaving every level shader readable.
    pub fn generate_mipmaps(&mut self, handle: TextureHandle) {
        let (image, format, w, h, mip_levels, current) = {
            let res = self.cb_shared.sh_res.read().unwrap();
            let texture = res.textures.access(handle);
            (
                texture.vk_image,
                texture.vk_format,
                texture.width as i32,
                texture.height as i32,
                texture.mip_levels,
                texture.state,
            )
        };
        if mip_levels <= 1 {
            self.texture_barrier(handle, ResourceState::SHADER_RESOURCE);
            return;
        }

        unsafe {
            crate::resources::image::image_barrier(
                self.dev(),
                self.cb_cmd,
                image,
                format,
                current,
                ResourceState::COPY_SOURCE,
                0,
                1,
            );
            crate::resources::image::blit_mip_chain(self.dev(), self.cb_cmd, image, w, h, mip_levels);
            crate::resources::image::image_barrier(
                self.dev(),
                self.cb_cmd,
                image,
                format,
                ResourceState::COPY_SOURCE,
                ResourceState::SHADER_RESOURCE,
                0,
                mip_levels,
            );
        }

        let mut res = self.cb_shared.sh_res.write().unwrap();
        res.textures.access_mut(handle).state = ResourceState::SHADER_RESOURCE;
    }

    // ------------------------------------------------------------------
    // Barriers
    // ------------------------------------------------------------------

    /// Transition a texture to `new_state`, if it is not already
    /// there, tracking the change in the resource header.
    pub fn texture_barrier(&mut self, handle: TextureHandle, new_state: ResourceState) {
        let (image, format, mips, old_state) = {
            let res = self.cb_shared.sh_res.read().unwrap();
            let texture = res.textures.access(handle);
            (
                texture.vk_image,
                texture.vk_format,
                texture.mip_levels,
                texture.state,
            )
        };
        if old_state == new_state {
            return;
        }

        unsafe {
            crate::resources::image::image_barrier(
                self.dev(),
                self.cb_cmd,
                image,
                format,
                old_state,
                new_state,
                0,
                mips,
            );
        }

        let mut res = self.cb_shared.sh_res.write().unwrap();
        res.textures.access_mut(handle).state = new_state;
    }

    pub fn barrier_texture_read(&mut self, handle: TextureHandle) {
        let depth = {
            let res = self.cb_shared.sh_res.read().unwrap();
            state::has_depth_or_stencil(res.textures.access(handle).vk_format)
        };
        let target = if depth {
            ResourceState::DEPTH_READ | ResourceState::SHADER_RESOURCE
        } else {
            ResourceState::SHADER_RESOURCE
        };
        self.texture_barrier(handle, target);
    }

    pub fn barrier_texture_write(&mut self, handle: TextureHandle) {
        let depth = {
            let res = self.cb_shared.sh_res.read().unwrap();
            state::has_depth_or_stencil(res.textures.access(handle).vk_format)
        };
        let target = if depth {
            ResourceState::DEPTH_WRITE
        } else {
            ResourceState::RENDER_TARGET
        };
        self.texture_barrier(handle, target);
    }

    fn buffer_barrier(&mut self, handle: BufferHandle, new_state: ResourceState) {
        let (vk_buffer, size, old_state) = {
            let res = self.cb_shared.sh_res.read().unwrap();
            let buffer = res.buffers.access(handle);
            let vk_buffer = if buffer.parent.is_valid() {
                res.buffers.access(buffer.parent).vk_buffer
            } else {
                buffer.vk_buffer
            };
            (vk_buffer, buffer.size, buffer.state)
        };
        if old_state == new_state {
            return;
        }

        let src_access = state::to_vk_access_flags(old_state);
        let dst_access = state::to_vk_access_flags(new_state);
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(vk_buffer)
            .offset(0)
            .size(size)
            .build();
        unsafe {
            self.dev().cmd_pipeline_barrier(
                self.cb_cmd,
                state::to_vk_pipeline_stage(src_access, QueueClass::Graphics),
                state::to_vk_pipeline_stage(dst_access, QueueClass::Graphics),
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }

        let mut res = self.cb_shared.sh_res.write().unwrap();
        res.buffers.access_mut(handle).state = new_state;
    }

    pub fn barrier_buffer_read(&mut self, handle: BufferHandle) {
        self.buffer_barrier(handle, ResourceState::SHADER_RESOURCE);
    }

    pub fn barrier_buffer_write(&mut self, handle: BufferHandle) {
        self.buffer_barrier(handle, ResourceState::UNORDERED_ACCESS);
    }

    // ------------------------------------------------------------------
    // Profiling
    // ------------------------------------------------------------------

    pub fn push_marker(&mut self, name: &str) {
        if !self.cb_shared.profiler_enabled() {
            return;
        }
        let frame = self.cb_shared.current_frame() as u32;
        let query = self
            .cb_shared
            .sh_profiler
            .lock()
            .unwrap()
            .push_timestamp(frame, crate::strings::intern(name));
        unsafe {
            self.dev().cmd_write_timestamp(
                self.cb_cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                self.cb_shared.sh_query_pool,
                query,
            );
        }
    }

    pub fn pop_marker(&mut self) {
        if !self.cb_shared.profiler_enabled() {
            return;
        }
        let frame = self.cb_shared.current_frame() as u32;
        let query = self
            .cb_shared
            .sh_profiler
            .lock()
            .unwrap()
            .pop_timestamp(frame);
        unsafe {
            self.dev().cmd_write_timestamp(
                self.cb_cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                self.cb_shared.sh_query_pool,
                query,
            );
        }
    }

    /// GUI overlay hook. Headless builds have nothing to draw, the
    /// flag passes through untouched.
    pub fn draw_profiler(&mut self, _show: &mut bool) {}

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// End recording and submit on the chosen queue. `wait` blocks
    /// until the queue drains; only one-shot upload work does that.
    pub fn submit(&mut self, queue: QueueClass, wait: bool) -> Result<()> {
        self.end()?;

        let vk_queue = match queue {
            QueueClass::Graphics => self.cb_shared.sh_queue_graphics,
            QueueClass::Compute => self.cb_shared.sh_queue_compute,
            QueueClass::Transfer => self.cb_shared.sh_queue_transfer,
        };

        let cmds = [self.cb_cmd];
        let submit = vk::SubmitInfo::builder().command_buffers(&cmds).build();
        unsafe {
            self.dev()
                .queue_submit(vk_queue, &[submit], vk::Fence::null())
                .or(Err(TormentaError::DEVICE_LOST))?;
            if wait {
                self.dev()
                    .queue_wait_idle(vk_queue)
                    .or(Err(TormentaError::DEVICE_LOST))?;
            }
        }
        Ok(())
    }

    /// Inline recorded secondaries into the current render pass.
    pub fn execute(&mut self, secondaries: &mut [CommandBuffer]) -> Result<()> {
        let mut cmds = Vec::with_capacity(secondaries.len());
        for secondary in secondaries.iter_mut() {
            if secondary.is_recording() {
                secondary.end()?;
            }
            cmds.push(secondary.cb_cmd);
        }
        unsafe {
            self.dev().cmd_execute_commands(self.cb_cmd, &cmds);
        }
        Ok(())
    }
}

/// Preallocated command buffers for every frame x thread slot.
pub(crate) struct CommandBufferManager {
    cm_shared: Arc<GpuShared>,
    cm_pools: Vec<vk::CommandPool>,
    cm_buffers: Vec<vk::CommandBuffer>,
    cm_recording: Vec<Arc<AtomicBool>>,
    cm_indices: Vec<u32>,
    /// workers + 1; slot 0 is the primary pool
    cm_thread_count: u32,
    cm_buffers_per_frame: u32,
}

impl CommandBufferManager {
    pub fn new(
        shared: Arc<GpuShared>,
        worker_threads: u32,
        buffers_per_frame: u32,
    ) -> Result<Self> {
        let thread_count = worker_threads + 1;
        let buffers_per_frame = buffers_per_frame.max(1);
        let total_pools = thread_count as usize * MAX_FRAMES;

        let mut pools = Vec::with_capacity(total_pools);
        let mut buffers = Vec::with_capacity(total_pools * buffers_per_frame as usize);
        let mut recording = Vec::with_capacity(total_pools * buffers_per_frame as usize);

        for _frame in 0..MAX_FRAMES {
            for thread in 0..thread_count {
                let pool_info = vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(shared.sh_family_graphics);
                let pool = unsafe {
                    shared
                        .sh_dev
                        .create_command_pool(&pool_info, None)
                        .or(Err(TormentaError::OUT_OF_MEMORY))?
                };

                let level = if thread == 0 {
                    vk::CommandBufferLevel::PRIMARY
                } else {
                    vk::CommandBufferLevel::SECONDARY
                };
                let alloc_info = vk::CommandBufferAllocateInfo::builder()
                    .command_pool(pool)
                    .level(level)
                    .command_buffer_count(buffers_per_frame);
                let allocated = unsafe {
                    shared
                        .sh_dev
                        .allocate_command_buffers(&alloc_info)
                        .or(Err(TormentaError::OUT_OF_MEMORY))?
                };

                pools.push(pool);
                for cmd in allocated {
                    buffers.push(cmd);
                    recording.push(Arc::new(AtomicBool::new(false)));
                }
            }
        }

        Ok(Self {
            cm_shared: shared,
            cm_pools: pools,
            cm_buffers: buffers,
            cm_recording: recording,
            cm_indices: vec![0; total_pools],
            cm_thread_count: thread_count,
            cm_buffers_per_frame: buffers_per_frame,
        })
    }

    fn pool_index(&self, frame: usize, thread: u32) -> usize {
        frame * self.cm_thread_count as usize + thread as usize
    }

    /// Reset all of this frame's pools for reuse. Called once per
    /// frame after the frame's fence.
    pub fn reset_frame(&mut self, frame: usize) -> Result<()> {
        for thread in 0..self.cm_thread_count {
            let pool_index = self.pool_index(frame, thread);
            unsafe {
                self.cm_shared
                    .sh_dev
                    .reset_command_pool(
                        self.cm_pools[pool_index],
                        vk::CommandPoolResetFlags::empty(),
                    )
                    .or(Err(TormentaError::UNKNOWN))?;
            }
            self.cm_indices[pool_index] = 0;
        }
        Ok(())
    }

    fn make_recorder(&mut self, pool_index: usize) -> Result<(CommandBuffer, bool)> {
        let buffer_index = self.cm_indices[pool_index] as usize;
        let slot = pool_index * self.cm_buffers_per_frame as usize + buffer_index;

        if self.cm_recording[slot].load(Ordering::Acquire) {
            log::error!("command buffer slot {} handed out while recording", slot);
            return Err(TormentaError::RECORDING_IN_PROGRESS);
        }

        let first_of_frame = buffer_index == 0;
        self.cm_indices[pool_index] =
            (self.cm_indices[pool_index] + 1) % self.cm_buffers_per_frame;

        Ok((
            CommandBuffer {
                cb_shared: self.cm_shared.clone(),
                cb_cmd: self.cm_buffers[slot],
                cb_recording: self.cm_recording[slot].clone(),
                cb_secondary: false,
                cb_current_render_pass: RenderPassHandle::INVALID,
                cb_current_framebuffer: FramebufferHandle::INVALID,
                cb_current_pipeline: PipelineHandle::INVALID,
                cb_fb_height: 0,
                cb_clear_colors: [vk::ClearValue::default(); MAX_IMAGE_OUTPUTS],
                cb_clear_depth_stencil: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
                cb_graph_bindings: FxHashMap::default(),
            },
            first_of_frame,
        ))
    }

    /// Begin and hand out the next primary buffer of the frame. The
    /// first acquire of a frame also resets the frame's query range
    /// once the profiler has a closed tree to restart.
    pub fn get_primary(&mut self, frame: usize) -> Result<CommandBuffer> {
        let pool_index = self.pool_index(frame, 0);
        let (mut cmd, first) = self.make_recorder(pool_index)?;
        cmd.begin()?;

        if first && self.cm_shared.profiler_enabled() {
            let has_timestamps = self.cm_shared.sh_profiler.lock().unwrap().has_timestamps();
            if !has_timestamps {
                let queries_per_frame = crate::device::QUERIES_PER_FRAME;
                unsafe {
                    self.cm_shared.sh_dev.cmd_reset_query_pool(
                        cmd.cb_cmd,
                        self.cm_shared.sh_query_pool,
                        frame as u32 * queries_per_frame * 2,
                        queries_per_frame * 2,
                    );
                }
            }
        }

        Ok(cmd)
    }

    /// Begin a secondary buffer for a worker thread, inheriting the
    /// node's render pass.
    pub fn get_secondary(
        &mut self,
        frame: usize,
        thread: u32,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
    ) -> Result<CommandBuffer> {
        debug_assert!(thread + 1 < self.cm_thread_count, "no pool for this worker");
        let pool_index = self.pool_index(frame, thread + 1);
        let (mut cmd, _) = self.make_recorder(pool_index)?;
        cmd.cb_secondary = true;
        cmd.begin_secondary(render_pass, framebuffer)?;
        Ok(cmd)
    }

    pub fn destroy(&mut self) {
        unsafe {
            for pool in self.cm_pools.drain(..) {
                self.cm_shared.sh_dev.destroy_command_pool(pool, None);
            }
        }
        self.cm_buffers.clear();
        self.cm_recording.clear();
        self.cm_indices.clear();
    }
}
