// Render pass, framebuffer and pipeline factories
//
// Render passes here are single subpass: the frame graph expresses
// multi-pass effects as separate nodes with barriers between them,
// so subpass chains never show up.

use arrayvec::ArrayVec;
use ash::vk;

use crate::device::{Device, Zombie};
use crate::resources::*;
use crate::{Result, TormentaError};

impl Device {
    pub fn create_render_pass(&mut self, creation: RenderPassCreation) -> Result<RenderPassHandle> {
        let output = &creation.output;
        let mut attachments = Vec::new();
        let mut color_refs = Vec::new();

        for i in 0..output.color_formats.len() {
            let op = output.color_ops[i];
            // a loaded attachment arrives in the layout the producer
            // left it in; anything else starts undefined
            let initial_layout = match op {
                RenderPassOp::Load => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                _ => vk::ImageLayout::UNDEFINED,
            };
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(output.color_formats[i])
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(op.to_vk())
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(initial_layout)
                    .final_layout(output.color_final_layouts[i])
                    .build(),
            );
            color_refs.push(
                vk::AttachmentReference::builder()
                    .attachment(i as u32)
                    .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
        }

        let has_depth = output.depth_stencil_format != vk::Format::UNDEFINED;
        let depth_ref;
        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if has_depth {
            let initial_layout = match output.depth_op {
                RenderPassOp::Load => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                _ => vk::ImageLayout::UNDEFINED,
            };
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(output.depth_stencil_format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(output.depth_op.to_vk())
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(output.stencil_op.to_vk())
                    .stencil_store_op(vk::AttachmentStoreOp::STORE)
                    .initial_layout(initial_layout)
                    .final_layout(output.depth_stencil_final_layout)
                    .build(),
            );
            depth_ref = vk::AttachmentReference::builder()
                .attachment(attachments.len() as u32 - 1)
                .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build();
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build()];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let vk_render_pass = unsafe {
            self.dev()
                .create_render_pass(&info, None)
                .or(Err(TormentaError::OUT_OF_MEMORY))?
        };
        self.set_name(vk_render_pass, creation.name);

        let mut res = self.d_shared.sh_res.write().unwrap();
        let (handle, render_pass) = res.render_passes.obtain_and_access()?;
        render_pass.vk_render_pass = vk_render_pass;
        render_pass.output = creation.output;
        render_pass.name = creation.name;
        Ok(handle)
    }

    pub(crate) fn destroy_render_pass_now(&mut self, handle: RenderPassHandle) {
        let mut res = self.d_shared.sh_res.write().unwrap();
        if res.render_passes.try_access(handle).is_none() {
            return;
        }
        let vk_render_pass = res.render_passes.access(handle).vk_render_pass;
        res.render_passes.release(handle);
        drop(res);

        if vk_render_pass != vk::RenderPass::null() {
            unsafe {
                self.dev().destroy_render_pass(vk_render_pass, None);
            }
        }
    }

    pub(crate) fn destroy_render_pass_deferred(&mut self, handle: RenderPassHandle) {
        self.defer_destroy(Zombie::RenderPass(handle));
    }

    pub fn create_framebuffer(&mut self, creation: FramebufferCreation) -> Result<FramebufferHandle> {
        let (vk_pass, views) = {
            let res = self.d_shared.sh_res.read().unwrap();
            let vk_pass = res
                .render_passes
                .try_access(creation.render_pass)
                .ok_or(TormentaError::INVALID_HANDLE)?
                .vk_render_pass;

            let mut views = Vec::new();
            for &attachment in creation.color_attachments.iter() {
                views.push(
                    res.textures
                        .try_access(attachment)
                        .ok_or(TormentaError::INVALID_HANDLE)?
                        .vk_view,
                );
            }
            if creation.depth_stencil_attachment.is_valid() {
                views.push(
                    res.textures
                        .try_access(creation.depth_stencil_attachment)
                        .ok_or(TormentaError::INVALID_HANDLE)?
                        .vk_view,
                );
            }
            (vk_pass, views)
        };

        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(vk_pass)
            .attachments(&views)
            .width(creation.width)
            .height(creation.height)
            .layers(1);
        let vk_framebuffer = unsafe {
            self.dev()
                .create_framebuffer(&info, None)
                .or(Err(TormentaError::OUT_OF_MEMORY))?
        };
        self.set_name(vk_framebuffer, creation.name);

        let mut res = self.d_shared.sh_res.write().unwrap();
        let (handle, framebuffer) = res.framebuffers.obtain_and_access()?;
        framebuffer.vk_framebuffer = vk_framebuffer;
        framebuffer.render_pass = creation.render_pass;
        framebuffer.width = creation.width;
        framebuffer.height = creation.height;
        framebuffer.color_attachments = creation.color_attachments;
        framebuffer.depth_stencil_attachment = creation.depth_stencil_attachment;
        framebuffer.name = creation.name;
        Ok(handle)
    }

    pub(crate) fn destroy_framebuffer_now(&mut self, handle: FramebufferHandle) {
        let mut res = self.d_shared.sh_res.write().unwrap();
        if res.framebuffers.try_access(handle).is_none() {
            return;
        }
        let vk_framebuffer = res.framebuffers.access(handle).vk_framebuffer;
        res.framebuffers.release(handle);
        drop(res);

        if vk_framebuffer != vk::Framebuffer::null() {
            unsafe {
                self.dev().destroy_framebuffer(vk_framebuffer, None);
            }
        }
    }

    pub(crate) fn destroy_framebuffer_deferred(&mut self, handle: FramebufferHandle) {
        self.defer_destroy(Zombie::Framebuffer(handle));
    }

    /// Compile one pipeline of a technique against the render pass of
    /// the node it targets.
    pub(crate) fn create_pipeline(
        &mut self,
        pipeline_state: PipelineState,
        render_pass: RenderPassHandle,
        name: &'static str,
    ) -> Result<PipelineHandle> {
        let program = self.create_program(pipeline_state.program.clone())?;

        // one vk layout per reflected set
        let (set_datas, push_constant_size, graphics) = {
            let res = self.d_shared.sh_res.read().unwrap();
            let prog = res.programs.access(program);
            (prog.sets.clone(), prog.push_constant_size, prog.graphics)
        };

        let mut set_layouts: ArrayVec<DescriptorSetLayoutHandle, MAX_DESCRIPTOR_SET_LAYOUTS> =
            ArrayVec::new();
        let mut vk_set_layouts = Vec::new();
        for data in &set_datas {
            let layout = self.create_descriptor_set_layout(data.clone())?;
            vk_set_layouts.push({
                let res = self.d_shared.sh_res.read().unwrap();
                res.descriptor_set_layouts.access(layout).vk_layout
            });
            set_layouts.push(layout);
        }

        let push_ranges;
        let mut layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&vk_set_layouts);
        if push_constant_size > 0 {
            push_ranges = [vk::PushConstantRange::builder()
                .stage_flags(vk::ShaderStageFlags::ALL)
                .offset(0)
                .size(push_constant_size)
                .build()];
            layout_info = layout_info.push_constant_ranges(&push_ranges);
        }
        let vk_layout = unsafe {
            self.dev()
                .create_pipeline_layout(&layout_info, None)
                .or(Err(TormentaError::OUT_OF_MEMORY))?
        };

        let vk_pipeline = if graphics {
            self.create_graphics_pipeline(&pipeline_state, program, render_pass, vk_layout)?
        } else {
            self.create_compute_pipeline(program, vk_layout)?
        };
        self.set_name(vk_pipeline, name);

        let mut res = self.d_shared.sh_res.write().unwrap();
        let (handle, pipeline) = res.pipelines.obtain_and_access()?;
        pipeline.vk_pipeline = vk_pipeline;
        pipeline.vk_layout = vk_layout;
        pipeline.bind_point = if graphics {
            vk::PipelineBindPoint::GRAPHICS
        } else {
            vk::PipelineBindPoint::COMPUTE
        };
        pipeline.program = program;
        pipeline.render_pass = render_pass;
        pipeline.set_layouts = set_layouts;
        pipeline.graphics = graphics;
        pipeline.name = name;
        Ok(handle)
    }

    fn create_graphics_pipeline(
        &mut self,
        pipeline_state: &PipelineState,
        program: ProgramHandle,
        render_pass: RenderPassHandle,
        vk_layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let res = self.d_shared.sh_res.read().unwrap();
        let prog = res.programs.access(program);
        let pass = res
            .render_passes
            .try_access(render_pass)
            .ok_or(TormentaError::INVALID_HANDLE)?;

        let entry_names: Vec<std::ffi::CString> = prog
            .stages
            .iter()
            .map(|stage| std::ffi::CString::new(stage.entry_point.as_str()).unwrap())
            .collect();
        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo> = prog
            .stages
            .iter()
            .zip(prog.modules.iter())
            .zip(entry_names.iter())
            .map(|((stage, &module), entry)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.stage)
                    .module(module)
                    .name(entry)
                    .build()
            })
            .collect();

        let bindings: Vec<vk::VertexInputBindingDescription> = pipeline_state
            .vertex_streams
            .iter()
            .map(|stream| {
                vk::VertexInputBindingDescription::builder()
                    .binding(stream.binding)
                    .stride(stream.stride)
                    .input_rate(if stream.instanced {
                        vk::VertexInputRate::INSTANCE
                    } else {
                        vk::VertexInputRate::VERTEX
                    })
                    .build()
            })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = pipeline_state
            .vertex_attributes
            .iter()
            .map(|attr| {
                vk::VertexInputAttributeDescription::builder()
                    .location(attr.location)
                    .binding(attr.binding)
                    .offset(attr.offset)
                    .format(attr.format)
                    .build()
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let raster = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(pipeline_state.rasterization.polygon_mode)
            .cull_mode(pipeline_state.rasterization.cull_mode)
            .front_face(pipeline_state.rasterization.front_face)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let ds = &pipeline_state.depth_stencil;
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(ds.depth_test_enable)
            .depth_write_enable(ds.depth_write_enable)
            .depth_compare_op(ds.depth_compare)
            .stencil_test_enable(ds.stencil_enable);

        // one blend state per color attachment of the target pass;
        // missing entries fall back to opaque writes
        let color_count = pass.output.color_formats.len();
        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0..color_count)
            .map(|i| {
                let blend = pipeline_state
                    .blend_states
                    .get(i)
                    .copied()
                    .unwrap_or_default();
                vk::PipelineColorBlendAttachmentState::builder()
                    .blend_enable(blend.blend_enabled)
                    .src_color_blend_factor(blend.src_color)
                    .dst_color_blend_factor(blend.dst_color)
                    .color_blend_op(blend.color_op)
                    .src_alpha_blend_factor(blend.src_alpha)
                    .dst_alpha_blend_factor(blend.dst_alpha)
                    .alpha_blend_op(blend.alpha_op)
                    .color_write_mask(blend.color_write_mask)
                    .build()
            })
            .collect();
        let blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments);

        // the graph drives viewport and scissor every frame
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .layout(vk_layout)
            .render_pass(pass.vk_render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            self.dev()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|_| TormentaError::UNKNOWN)?
        };
        Ok(pipelines[0])
    }

    fn create_compute_pipeline(
        &mut self,
        program: ProgramHandle,
        vk_layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let res = self.d_shared.sh_res.read().unwrap();
        let prog = res.programs.access(program);

        let stage = prog
            .stages
            .iter()
            .zip(prog.modules.iter())
            .find(|(stage, _)| stage.stage == vk::ShaderStageFlags::COMPUTE)
            .ok_or(TormentaError::INVALID_ARGUMENT)?;
        let entry = std::ffi::CString::new(stage.0.entry_point.as_str()).unwrap();

        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(vk::ShaderStageFlags::COMPUTE)
                    .module(*stage.1)
                    .name(&entry)
                    .build(),
            )
            .layout(vk_layout)
            .build();

        let pipelines = unsafe {
            self.dev()
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|_| TormentaError::UNKNOWN)?
        };
        Ok(pipelines[0])
    }

    pub(crate) fn destroy_pipeline_now(&mut self, handle: PipelineHandle) {
        let (vk_pipeline, vk_layout, program, set_layouts) = {
            let mut res = self.d_shared.sh_res.write().unwrap();
            if res.pipelines.try_access(handle).is_none() {
                return;
            }
            let pipeline = res.pipelines.access_mut(handle);
            let out = (
                pipeline.vk_pipeline,
                pipeline.vk_layout,
                pipeline.program,
                std::mem::take(&mut pipeline.set_layouts),
            );
            res.pipelines.release(handle);
            out
        };

        unsafe {
            if vk_pipeline != vk::Pipeline::null() {
                self.dev().destroy_pipeline(vk_pipeline, None);
            }
            if vk_layout != vk::PipelineLayout::null() {
                self.dev().destroy_pipeline_layout(vk_layout, None);
            }
        }
        for layout in set_layouts {
            self.destroy_descriptor_set_layout_now(layout);
        }
        self.destroy_program_now(program);
    }

    pub(crate) fn destroy_pipeline_deferred(&mut self, handle: PipelineHandle) {
        self.defer_destroy(Zombie::Pipeline(handle));
    }
}
