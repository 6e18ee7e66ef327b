// The public renderer
//
// This is the facade the application talks to: resource creation
// with explicit reference counting, descriptor binding intents, the
// frame loop, and the per-frame walk over a compiled frame graph.
// Errors raised inside pass callbacks never unwind across the
// boundary; the frame is aborted and the stored error surfaces on
// the next top level call.

use ash::vk;
use fxhash::FxHashMap;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;

use crate::cmdbuf::CommandBuffer;
use crate::device::{Device, GpuShared, Zombie};
use crate::graph::{FrameGraph, GraphResources, ResourceType};
use crate::profiler::TimestampResult;
use crate::resources::*;
use crate::state::ResourceState;
use crate::strings::{hash_name, intern};
use crate::{CreateInfo, FeatureFlags, Result, TormentaError};

use std::sync::{Arc, Mutex};

/// The callbacks a render pass plugs into the frame graph.
///
/// `prepare` runs once per frame on the render thread and may touch
/// the renderer; `render` records commands and may run on worker
/// threads, so it only gets shared references.
pub trait PassHandler: Send + Sync {
    /// Called when the renderer first sees the pass.
    fn initialize(&mut self, _graph: &mut FrameGraph, _renderer: &mut Renderer) -> Result<()> {
        Ok(())
    }

    /// Called at teardown or when the pass is removed.
    fn uninitialize(&mut self, _graph: &mut FrameGraph, _renderer: &mut Renderer) {}

    /// Report how many secondary command buffers this pass wants to
    /// record this frame. 0 or 1 records inline on the primary.
    fn prepare(
        &mut self,
        _graph: &mut FrameGraph,
        _renderer: &mut Renderer,
        _max_workers: u32,
    ) -> u32 {
        1
    }

    /// The swapchain changed size. Must not record GPU work.
    fn resize(&mut self, _graph: &mut FrameGraph, _renderer: &mut Renderer) -> Result<()> {
        Ok(())
    }

    /// Record this pass's commands for one worker partition.
    fn render(
        &self,
        graph: &FrameGraph,
        renderer: &Renderer,
        cmd: &mut CommandBuffer,
        worker_index: u32,
        worker_count: u32,
    ) -> Result<()>;
}

/// A texture upload the async worker should run.
struct UploadRequest {
    handle: TextureHandle,
    data: Vec<u8>,
    callback: Option<Box<dyn FnOnce(TextureHandle) + Send>>,
}

/// What the worker hands back for the render thread to finish.
struct UploadDone {
    handle: TextureHandle,
    /// When the machine has no dedicated transfer queue the worker
    /// only stages; the render thread still owns the copy.
    staging: Option<(vk::Buffer, gpu_allocator::vulkan::Allocation)>,
    /// Set when the image needs the queue ownership acquire on the
    /// graphics queue.
    acquire_from_transfer: bool,
    callback: Option<Box<dyn FnOnce(TextureHandle) + Send>>,
}

struct UploadWorker {
    sender: crossbeam_channel::Sender<UploadRequest>,
    completions: crossbeam_channel::Receiver<UploadDone>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Per-kind reference counts for resources shared across passes.
/// `reference_*` bumps, `destroy_*` drops, zero enqueues the real
/// destruction behind the frame fence.
#[derive(Default)]
struct RefCounts {
    buffers: FxHashMap<u16, u32>,
    textures: FxHashMap<u16, u32>,
    samplers: FxHashMap<u16, u32>,
    techniques: FxHashMap<u16, u32>,
    descriptor_sets: FxHashMap<u16, u32>,
}

fn bump(map: &mut FxHashMap<u16, u32>, index: u16) {
    *map.entry(index).or_insert(0) += 1;
}

/// Returns true when the count hit zero and the resource should die.
fn drop_ref(map: &mut FxHashMap<u16, u32>, index: u16) -> bool {
    match map.get_mut(&index) {
        Some(count) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => {
            map.remove(&index);
            true
        }
        None => {
            log::error!("destroy of an untracked resource index {}", index);
            false
        }
    }
}

pub struct Renderer {
    r_device: Device,
    r_worker_threads: u32,
    r_refs: RefCounts,
    r_techniques: FxHashMap<u64, TechniqueHandle>,
    /// First error of the frame; surfaces on the next API call.
    r_pending_error: Option<TormentaError>,
    /// Primary command buffers recorded for the current frame.
    r_frame_cmds: Vec<vk::CommandBuffer>,
    r_upload: Option<UploadWorker>,
    r_running: bool,
}

impl Renderer {
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let device = Device::new(info)?;
        let upload = Self::spawn_upload_worker(&device);

        Ok(Self {
            r_worker_threads: info.worker_threads,
            r_device: device,
            r_refs: RefCounts::default(),
            r_techniques: FxHashMap::default(),
            r_pending_error: None,
            r_frame_cmds: Vec::new(),
            r_upload: Some(upload),
            r_running: true,
        })
    }

    fn check_running(&self) -> Result<()> {
        if self.r_running {
            Ok(())
        } else {
            Err(TormentaError::NOT_RUNNING)
        }
    }

    /// Features that survived device probing.
    pub fn features(&self) -> FeatureFlags {
        self.r_device.d_enabled
    }

    pub fn swapchain_size(&self) -> (u32, u32) {
        self.r_device.swapchain_size()
    }

    /// Absolute index of the frame being recorded.
    pub fn absolute_frame(&self) -> u64 {
        self.r_device.d_absolute_frame
    }

    // ------------------------------------------------------------------
    // Resource creation and reference counting
    // ------------------------------------------------------------------

    pub fn create_buffer(&mut self, creation: BufferCreation) -> Result<BufferHandle> {
        self.check_running()?;
        let handle = self.r_device.create_buffer(creation)?;
        bump(&mut self.r_refs.buffers, handle.index());
        Ok(handle)
    }

    pub fn create_texture(&mut self, creation: TextureCreation) -> Result<TextureHandle> {
        self.check_running()?;
        let handle = self.r_device.create_texture(creation)?;
        bump(&mut self.r_refs.textures, handle.index());
        Ok(handle)
    }

    pub fn create_sampler(&mut self, creation: SamplerCreation) -> Result<SamplerHandle> {
        self.check_running()?;
        let handle = self.r_device.create_sampler(creation)?;
        bump(&mut self.r_refs.samplers, handle.index());
        Ok(handle)
    }

    pub fn create_descriptor_set(&mut self) -> Result<DescriptorSetHandle> {
        self.check_running()?;
        let handle = self.r_device.create_descriptor_set()?;
        bump(&mut self.r_refs.descriptor_sets, handle.index());
        Ok(handle)
    }

    /// Build a technique: one pipeline per entry, each compiled
    /// against the render pass of the frame graph node it names (an
    /// empty node name targets the swapchain pass).
    pub fn create_technique(
        &mut self,
        graph: &FrameGraph,
        name: &str,
        pipelines: Vec<PipelineState>,
    ) -> Result<TechniqueHandle> {
        self.check_running()?;
        if pipelines.is_empty() {
            return Err(TormentaError::INVALID_ARGUMENT);
        }
        let key = hash_name(name);
        if self.r_techniques.contains_key(&key) {
            log::error!("technique '{}' already exists", name);
            return Err(TormentaError::ALREADY_EXISTS);
        }

        let name = intern(name);
        let mut compiled = Vec::with_capacity(pipelines.len());
        for state in pipelines {
            let render_pass = if state.node.is_empty() {
                self.r_device.d_swap_pass
            } else {
                match graph.get_node(state.node) {
                    Some(node) if node.render_pass.is_valid() => node.render_pass,
                    Some(node) if node.compute => RenderPassHandle::INVALID,
                    _ => {
                        log::error!(
                            "technique '{}' targets node '{}' which has no render pass; \
                             compile the graph first",
                            name,
                            state.node
                        );
                        return Err(TormentaError::NOT_FOUND);
                    }
                }
            };
            compiled.push(self.r_device.create_pipeline(state, render_pass, name)?);
        }

        let handle = {
            let mut res = self.r_device.d_shared.sh_res.write().unwrap();
            let (handle, technique) = res.techniques.obtain_and_access()?;
            technique.pipelines = compiled;
            technique.name = name;
            handle
        };
        self.r_techniques.insert(key, handle);
        bump(&mut self.r_refs.techniques, handle.index());
        Ok(handle)
    }

    pub fn get_technique(&self, name: &str) -> Option<TechniqueHandle> {
        self.r_techniques.get(&hash_name(name)).copied()
    }

    pub fn reference_buffer(&mut self, handle: BufferHandle) -> BufferHandle {
        bump(&mut self.r_refs.buffers, handle.index());
        handle
    }

    pub fn reference_texture(&mut self, handle: TextureHandle) -> TextureHandle {
        bump(&mut self.r_refs.textures, handle.index());
        handle
    }

    pub fn reference_sampler(&mut self, handle: SamplerHandle) -> SamplerHandle {
        bump(&mut self.r_refs.samplers, handle.index());
        handle
    }

    pub fn reference_technique(&mut self, handle: TechniqueHandle) -> TechniqueHandle {
        bump(&mut self.r_refs.techniques, handle.index());
        handle
    }

    pub fn reference_descriptor_set(&mut self, handle: DescriptorSetHandle) -> DescriptorSetHandle {
        bump(&mut self.r_refs.descriptor_sets, handle.index());
        handle
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        if drop_ref(&mut self.r_refs.buffers, handle.index()) {
            self.r_device.destroy_buffer_deferred(handle);
        }
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        if drop_ref(&mut self.r_refs.textures, handle.index()) {
            self.r_device.destroy_texture_deferred(handle);
        }
    }

    pub fn destroy_sampler(&mut self, handle: SamplerHandle) {
        if drop_ref(&mut self.r_refs.samplers, handle.index()) {
            self.r_device.defer_destroy(Zombie::Sampler(handle));
        }
    }

    pub fn destroy_technique(&mut self, handle: TechniqueHandle) {
        if drop_ref(&mut self.r_refs.techniques, handle.index()) {
            let (name, pipelines) = {
                let mut res = self.r_device.d_shared.sh_res.write().unwrap();
                let technique = res.techniques.access_mut(handle);
                let out = (technique.name, std::mem::take(&mut technique.pipelines));
                res.techniques.release(handle);
                out
            };
            self.r_techniques.remove(&hash_name(name));
            for pipeline in pipelines {
                self.r_device.destroy_pipeline_deferred(pipeline);
            }
        }
    }

    pub fn destroy_descriptor_set(&mut self, handle: DescriptorSetHandle) {
        if drop_ref(&mut self.r_refs.descriptor_sets, handle.index()) {
            self.r_device.destroy_descriptor_set_deferred(handle);
        }
    }

    // ------------------------------------------------------------------
    // Descriptor binding intents
    // ------------------------------------------------------------------

    pub fn bind_buffer(
        &mut self,
        set: DescriptorSetHandle,
        binding: u16,
        buffer: BufferHandle,
    ) -> Result<()> {
        self.r_device
            .bind_to_descriptor_set(set, binding, BindingTarget::Buffer(buffer))
    }

    pub fn bind_texture(
        &mut self,
        set: DescriptorSetHandle,
        binding: u16,
        texture: TextureHandle,
    ) -> Result<()> {
        self.r_device
            .bind_to_descriptor_set(set, binding, BindingTarget::Texture(texture))
    }

    /// Bind a frame graph resource by name; it resolves to the
    /// concrete per-frame handle at record time.
    pub fn bind_resource(
        &mut self,
        set: DescriptorSetHandle,
        binding: u16,
        resource: &str,
    ) -> Result<()> {
        self.r_device
            .bind_to_descriptor_set(set, binding, BindingTarget::GraphResource(intern(resource)))
    }

    pub fn bind_sampler(
        &mut self,
        set: DescriptorSetHandle,
        binding: u16,
        sampler: SamplerHandle,
    ) -> Result<()> {
        self.r_device
            .bind_sampler_to_descriptor_set(set, binding, sampler)
    }

    pub fn map_buffer(&mut self, handle: BufferHandle, offset: u64, size: u64) -> Result<*mut u8> {
        self.r_device.map_buffer(handle, offset, size)
    }

    pub fn unmap_buffer(&mut self, handle: BufferHandle) {
        self.r_device.unmap_buffer(handle)
    }

    pub fn get_texture_info(&self, handle: TextureHandle) -> Result<TextureInfo> {
        self.r_device.get_texture_info(handle)
    }

    // ------------------------------------------------------------------
    // Profiler
    // ------------------------------------------------------------------

    pub fn profiler_enabled(&self) -> bool {
        self.r_device.d_shared.profiler_enabled()
    }

    pub fn set_profiler_enabled(&mut self, enabled: bool) {
        let supported = self.r_device.d_features.timestamps;
        self.r_device
            .d_shared
            .sh_profiler_enabled
            .store(enabled && supported, std::sync::atomic::Ordering::Relaxed);
    }

    /// Resolved timestamp scopes of the most recently completed
    /// frame in this slot.
    pub fn profiler_results(&self) -> Vec<TimestampResult> {
        let frame = self.r_device.current_frame() as u32;
        self.r_device
            .d_shared
            .sh_profiler
            .lock()
            .unwrap()
            .results(frame)
    }

    // ------------------------------------------------------------------
    // Frame loop
    // ------------------------------------------------------------------

    /// Begin a frame. `SKIP_FRAME` means the swapchain went stale;
    /// retry next tick, the rebuild happens before the next acquire.
    pub fn new_frame(&mut self) -> Result<()> {
        self.check_running()?;
        if let Some(err) = self.r_pending_error.take() {
            return Err(err);
        }

        self.r_frame_cmds.clear();
        self.r_device.new_frame()?;
        self.drain_upload_completions()?;
        Ok(())
    }

    /// Compile (if dirty) and execute the frame graph for this
    /// frame.
    pub fn render(&mut self, graph: &mut FrameGraph) -> Result<()> {
        self.check_running()?;
        if let Some(err) = self.r_pending_error.take() {
            return Err(err);
        }

        // a swapchain rebuild invalidates compiled state first
        if let Some((old_w, new_w, old_h, new_h)) = self.r_device.d_pending_resize.take() {
            graph.resize(self, old_w, new_w, old_h, new_h)?;
            self.invoke_resize_callbacks(graph)?;
        }

        graph.compile(self)?;
        self.initialize_passes(graph)?;
        self.execute_graph(graph)
    }

    /// Submit the frame's primaries and present. A callback error
    /// recorded during `render` surfaces here; the semaphore and
    /// fence chain still runs so the frame loop stays consistent.
    pub fn present(&mut self) -> Result<()> {
        self.check_running()?;

        let cmds = std::mem::take(&mut self.r_frame_cmds);
        let result = self.r_device.present(&cmds);

        if let Some(err) = self.r_pending_error.take() {
            return Err(err);
        }
        result
    }

    /// Ask for a swapchain rebuild on the next frame (window system
    /// resize events land here).
    pub fn schedule_resize(&mut self) {
        self.r_device.schedule_resize();
    }

    /// Unregister a pass and run its uninitialize callback.
    pub fn remove_pass(&mut self, graph: &mut FrameGraph, name: &str) -> Result<()> {
        let mut handler = graph.remove_pass(name)?;
        handler.uninitialize(graph, self);
        Ok(())
    }

    /// Run uninitialize on every registered pass. Call before
    /// dropping the renderer while the graph is still alive.
    pub fn shutdown(&mut self, graph: &mut FrameGraph) {
        self.r_device.wait_idle();
        let passes: Vec<_> = graph.passes().collect();
        for pass in passes {
            let mut handler = graph.pass_mut(pass).handler.take();
            if let Some(h) = handler.as_mut() {
                h.uninitialize(graph, self);
            }
            graph.pass_mut(pass).handler = handler;
        }
        self.r_running = false;
    }

    fn initialize_passes(&mut self, graph: &mut FrameGraph) -> Result<()> {
        let passes: Vec<_> = graph.passes().collect();
        for pass in passes {
            if graph.pass_mut(pass).initialized {
                continue;
            }
            let mut handler = graph.pass_mut(pass).handler.take();
            let result = match handler.as_mut() {
                Some(h) => h.initialize(graph, self),
                None => Ok(()),
            };
            let slot = graph.pass_mut(pass);
            slot.handler = handler;
            slot.initialized = true;
            result.map_err(|_| TormentaError::FROM_CALLBACK)?;
        }
        Ok(())
    }

    fn invoke_resize_callbacks(&mut self, graph: &mut FrameGraph) -> Result<()> {
        let passes: Vec<_> = graph.passes().collect();
        for pass in passes {
            let mut handler = graph.pass_mut(pass).handler.take();
            let result = match handler.as_mut() {
                Some(h) => h.resize(graph, self),
                None => Ok(()),
            };
            graph.pass_mut(pass).handler = handler;
            if result.is_err() {
                return Err(TormentaError::FROM_CALLBACK);
            }
        }
        graph.mark_dirty();
        Ok(())
    }

    /// Walk the compiled execution order recording every enabled
    /// node into the frame's primary command buffer.
    fn execute_graph(&mut self, graph: &mut FrameGraph) -> Result<()> {
        let frame = self.r_device.current_frame();
        let parity = (self.r_device.d_absolute_frame % 2) as usize;
        let snapshot = graph.binding_snapshot(parity);

        let mut cmd = self.r_device.d_cmds.get_primary(frame)?;
        cmd.set_graph_bindings(snapshot.clone());
        cmd.push_marker("frame");

        let mut callback_failed = false;

        for i in 0..graph.node_count() {
            let node_handle = graph.node_handle_at(i);
            let (name, compute, pass_handle, render_pass, framebuffers, inputs, outputs) = {
                let node = graph.node(node_handle);
                (
                    node.name,
                    node.compute,
                    node.pass,
                    node.render_pass,
                    node.framebuffers,
                    node.inputs.clone(),
                    node.outputs.clone(),
                )
            };

            cmd.push_marker(name);

            // inputs sampled this node must leave their attachment
            // layout before the pass begins
            for input in inputs.iter() {
                let resource = graph.resource(*input);
                match resource.resource_type {
                    ResourceType::Texture | ResourceType::Attachment => {
                        let texture = if resource.save_for_next_frame {
                            resource.texture.handles[(parity ^ 1) & 1]
                        } else {
                            resource.texture.handles[0]
                        };
                        if texture.is_valid() {
                            cmd.barrier_texture_read(texture);
                        }
                    }
                    _ => {}
                }
            }

            // take the handler out so it can borrow the graph freely
            let mut handler = graph.pass_mut(pass_handle).handler.take();
            let handler_ref = match handler.as_mut() {
                Some(h) => h,
                None => {
                    cmd.pop_marker();
                    continue;
                }
            };

            let max_workers = self.r_worker_threads.max(1);
            let workers = handler_ref
                .prepare(graph, self, max_workers)
                .clamp(1, max_workers);

            let result = if compute {
                handler_ref.render(graph, self, &mut cmd, 0, 1)
            } else {
                // clear values come from the declared outputs
                let mut color_index = 0;
                for output in outputs.iter() {
                    let resource = graph.resource(*output);
                    if resource.resource_type != ResourceType::Attachment {
                        continue;
                    }
                    let texture = &resource.texture;
                    if crate::state::has_depth_or_stencil(texture.format) {
                        cmd.clear_depth_stencil(texture.clear_depth, texture.clear_stencil);
                    } else {
                        let c = texture.clear_color;
                        cmd.clear_color(color_index, c[0], c[1], c[2], c[3]);
                        color_index += 1;
                    }
                }

                // nodes without their own attachments draw straight
                // to the swapchain image
                let (pass, framebuffer) = if render_pass.is_valid() {
                    let slot = if framebuffers[1].is_valid() { parity } else { 0 };
                    (render_pass, framebuffers[slot])
                } else {
                    (
                        self.r_device.d_swap_pass,
                        self.r_device.current_swap_framebuffer(),
                    )
                };

                if workers > 1 && self.r_worker_threads > 0 {
                    self.record_with_workers(
                        graph,
                        &snapshot,
                        &mut cmd,
                        handler_ref,
                        pass,
                        framebuffer,
                        frame,
                        workers,
                    )
                } else {
                    cmd.bind_pass(pass, framebuffer, false);
                    let (fb_w, fb_h) = {
                        let res = self.r_device.d_shared.sh_res.read().unwrap();
                        let fb = res.framebuffers.access(framebuffer);
                        (fb.width, fb.height)
                    };
                    cmd.set_viewport(0.0, 0.0, fb_w as f32, fb_h as f32, 0.0, 1.0);
                    cmd.set_scissor(0, 0, fb_w, fb_h);
                    handler_ref.render(graph, self, &mut cmd, 0, 1)
                }
            };

            graph.pass_mut(pass_handle).handler = handler;
            cmd.pop_marker();

            if result.is_err() {
                log::error!("pass '{}' failed; aborting the frame", name);
                callback_failed = true;
                break;
            }
        }

        cmd.pop_marker();
        cmd.end()?;

        if callback_failed {
            // nothing of this frame gets submitted; present still
            // runs the sync chain and reports the stored error
            self.r_pending_error = Some(TormentaError::FROM_CALLBACK);
            self.r_frame_cmds.clear();
        } else {
            self.r_frame_cmds.push(cmd.vk_cmd());
        }
        Ok(())
    }

    /// Fan a pass out to worker threads recording secondaries, then
    /// inline them into the primary.
    #[allow(clippy::too_many_arguments)]
    fn record_with_workers(
        &mut self,
        graph: &FrameGraph,
        snapshot: &FxHashMap<u64, BindingTarget>,
        cmd: &mut CommandBuffer,
        handler: &mut Box<dyn PassHandler>,
        pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        frame: usize,
        workers: u32,
    ) -> Result<()> {
        cmd.bind_pass(pass, framebuffer, true);

        let (fb_w, fb_h) = {
            let res = self.r_device.d_shared.sh_res.read().unwrap();
            let fb = res.framebuffers.access(framebuffer);
            (fb.width, fb.height)
        };

        let mut secondaries = Vec::with_capacity(workers as usize);
        for w in 0..workers {
            let worker_slot = w % self.r_worker_threads;
            let mut secondary =
                self.r_device
                    .d_cmds
                    .get_secondary(frame, worker_slot, pass, framebuffer)?;
            secondary.set_graph_bindings(snapshot.clone());
            secondary.set_framebuffer_height(fb_h);
            secondary.set_viewport(0.0, 0.0, fb_w as f32, fb_h as f32, 0.0, 1.0);
            secondary.set_scissor(0, 0, fb_w, fb_h);
            secondaries.push(secondary);
        }

        let handler_ref: &dyn PassHandler = &**handler;
        let renderer_ref: &Renderer = self;
        let mut results: Vec<Result<()>> = Vec::with_capacity(workers as usize);

        std::thread::scope(|scope| {
            let mut joins = Vec::with_capacity(workers as usize);
            for (w, secondary) in secondaries.iter_mut().enumerate() {
                joins.push(scope.spawn(move || {
                    handler_ref.render(graph, renderer_ref, secondary, w as u32, workers)
                }));
            }
            for join in joins {
                results.push(join.join().unwrap_or(Err(TormentaError::UNKNOWN)));
            }
        });

        for result in results {
            result?;
        }
        cmd.execute(&mut secondaries)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Async texture uploads
    // ------------------------------------------------------------------

    /// Queue a texture upload on the worker thread. The callback
    /// fires on the render thread once the texture is shader
    /// readable.
    pub fn async_upload_texture_data(
        &mut self,
        handle: TextureHandle,
        data: Vec<u8>,
        callback: Option<Box<dyn FnOnce(TextureHandle) + Send>>,
    ) -> Result<()> {
        self.check_running()?;
        let worker = self.r_upload.as_ref().ok_or(TormentaError::NOT_RUNNING)?;
        worker
            .sender
            .send(UploadRequest {
                handle,
                data,
                callback,
            })
            .or(Err(TormentaError::NOT_RUNNING))
    }

    fn spawn_upload_worker(device: &Device) -> UploadWorker {
        let (req_tx, req_rx) = crossbeam_channel::unbounded::<UploadRequest>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<UploadDone>();

        let shared = device.d_shared.clone();
        let allocator = device.d_allocator.as_ref().unwrap().clone();
        let dedicated_transfer = shared.sh_family_transfer != shared.sh_family_graphics;
        let graphics_family = shared.sh_family_graphics;
        let transfer_family = shared.sh_family_transfer;

        let thread = std::thread::Builder::new()
            .name("tormenta-upload".to_owned())
            .spawn(move || {
                upload_worker_loop(
                    shared,
                    allocator,
                    req_rx,
                    done_tx,
                    dedicated_transfer,
                    transfer_family,
                    graphics_family,
                );
            })
            .expect("could not spawn upload thread");

        UploadWorker {
            sender: req_tx,
            completions: done_rx,
            thread: Some(thread),
        }
    }

    /// Finish uploads the worker completed: run the graphics side of
    /// the queue ownership transfer (or the whole copy when there is
    /// no transfer queue), then fire callbacks.
    fn drain_upload_completions(&mut self) -> Result<()> {
        let done: Vec<UploadDone> = match self.r_upload.as_ref() {
            Some(worker) => worker.completions.try_iter().collect(),
            None => return Ok(()),
        };

        for upload in done {
            let target = {
                let res = self.r_device.d_shared.sh_res.read().unwrap();
                res.textures.try_access(upload.handle).map(|texture| {
                    (
                        texture.vk_image,
                        texture.vk_format,
                        vk::Extent3D {
                            width: texture.width,
                            height: texture.height,
                            depth: texture.depth,
                        },
                        texture.mip_levels,
                    )
                })
            };
            let (image, format, extent, mips) = match target {
                Some(target) => target,
                None => {
                    // the texture died before its upload landed
                    if let Some((staging_buffer, allocation)) = upload.staging {
                        unsafe {
                            self.r_device.dev().destroy_buffer(staging_buffer, None);
                        }
                        let _ = self
                            .r_device
                            .d_allocator
                            .as_ref()
                            .unwrap()
                            .lock()
                            .unwrap()
                            .free(allocation);
                    }
                    continue;
                }
            };

            if let Some((staging_buffer, allocation)) = upload.staging {
                // no dedicated transfer queue: the worker only wrote
                // the staging memory, copy here
                self.r_device.graphics_one_shot(|dev, cmd| unsafe {
                    crate::resources::image::image_barrier(
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
                            aspect_mask: crate::state::to_vk_image_aspect(format),
                            mip_level: 0,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        image_offset: vk::Offset3D::default(),
                        image_extent: extent,
                    };
                    dev.cmd_copy_buffer_to_image(
                        cmd,
                        staging_buffer,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                    crate::resources::image::image_barrier(
                        dev,
                        cmd,
                        image,
                        format,
                        ResourceState::COPY_DEST,
                        ResourceState::SHADER_RESOURCE,
                        0,
                        mips,
                    );
                })?;

                unsafe {
                    self.r_device.dev().destroy_buffer(staging_buffer, None);
                }
                let _ = self
                    .r_device
                    .d_allocator
                    .as_ref()
                    .unwrap()
                    .lock()
                    .unwrap()
                    .free(allocation);
            } else if upload.acquire_from_transfer {
                // second half of the queue family ownership transfer
                let transfer_family = self.r_device.d_shared.sh_family_transfer;
                let graphics_family = self.r_device.d_shared.sh_family_graphics;
                self.r_device.graphics_one_shot(|dev, cmd| unsafe {
                    let barrier = vk::ImageMemoryBarrier::builder()
                        .src_access_mask(vk::AccessFlags::empty())
                        .dst_access_mask(vk::AccessFlags::SHADER_READ)
                        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        .src_queue_family_index(transfer_family)
                        .dst_queue_family_index(graphics_family)
                        .image(image)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: crate::state::to_vk_image_aspect(format),
                            base_mip_level: 0,
                            level_count: mips,
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                        .build();
                    dev.cmd_pipeline_barrier(
                        cmd,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::FRAGMENT_SHADER
                            | vk::PipelineStageFlags::COMPUTE_SHADER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                })?;
            }

            {
                let mut res = self.r_device.d_shared.sh_res.write().unwrap();
                res.textures.access_mut(upload.handle).state = ResourceState::SHADER_RESOURCE;
            }

            if let Some(callback) = upload.callback {
                callback(upload.handle);
            }
        }
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Some(mut worker) = self.r_upload.take() {
            drop(worker.sender);
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        self.r_device.wait_idle();
    }
}

// ----------------------------------------------------------------------
// The graph compiler's view of the renderer
// ----------------------------------------------------------------------

impl GraphResources for Renderer {
    fn swapchain_size(&self) -> (u32, u32) {
        self.r_device.swapchain_size()
    }

    fn create_graph_texture(&mut self, creation: TextureCreation) -> Result<TextureHandle> {
        self.r_device.create_texture(creation)
    }

    fn destroy_graph_texture(&mut self, handle: TextureHandle) {
        self.r_device.destroy_texture_deferred(handle);
    }

    fn graph_texture_info(&self, handle: TextureHandle) -> Result<TextureInfo> {
        self.r_device.get_texture_info(handle)
    }

    fn create_graph_buffer(&mut self, creation: BufferCreation) -> Result<BufferHandle> {
        self.r_device.create_buffer(creation)
    }

    fn destroy_graph_buffer(&mut self, handle: BufferHandle) {
        self.r_device.destroy_buffer_deferred(handle);
    }

    fn create_graph_render_pass(
        &mut self,
        creation: RenderPassCreation,
    ) -> Result<RenderPassHandle> {
        self.r_device.create_render_pass(creation)
    }

    fn destroy_graph_render_pass(&mut self, handle: RenderPassHandle) {
        self.r_device.destroy_render_pass_deferred(handle);
    }

    fn create_graph_framebuffer(
        &mut self,
        creation: FramebufferCreation,
    ) -> Result<FramebufferHandle> {
        self.r_device.create_framebuffer(creation)
    }

    fn destroy_graph_framebuffer(&mut self, handle: FramebufferHandle) {
        self.r_device.destroy_framebuffer_deferred(handle);
    }
}

// ----------------------------------------------------------------------
// Upload worker
// ----------------------------------------------------------------------

/// Body of the upload thread. With a dedicated transfer queue it
/// records the copy itself and releases image ownership to the
/// graphics family; otherwise it only fills staging memory and the
/// render thread performs the copy.
#[allow(clippy::too_many_arguments)]
fn upload_worker_loop(
    shared: Arc<GpuShared>,
    allocator: Arc<Mutex<Allocator>>,
    requests: crossbeam_channel::Receiver<UploadRequest>,
    completions: crossbeam_channel::Sender<UploadDone>,
    dedicated_transfer: bool,
    transfer_family: u32,
    graphics_family: u32,
) {
    let dev = shared.sh_dev.clone();

    // worker-private pool + fence for its submissions
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(transfer_family);
    let pool = match unsafe { dev.create_command_pool(&pool_info, None) } {
        Ok(pool) => pool,
        Err(_) => return,
    };
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let cmd = match unsafe { dev.allocate_command_buffers(&alloc_info) } {
        Ok(cmds) => cmds[0],
        Err(_) => {
            unsafe { dev.destroy_command_pool(pool, None) };
            return;
        }
    };
    let fence = unsafe {
        dev.create_fence(&vk::FenceCreateInfo::builder(), None)
            .unwrap_or(vk::Fence::null())
    };

    while let Ok(request) = requests.recv() {
        // skip uploads whose texture died while queued
        let target = {
            let res = shared.sh_res.read().unwrap();
            res.textures.try_access(request.handle).map(|texture| {
                (
                    texture.vk_image,
                    texture.vk_format,
                    vk::Extent3D {
                        width: texture.width,
                        height: texture.height,
                        depth: texture.depth,
                    },
                    texture.mip_levels,
                )
            })
        };
        let (image, format, extent, mips) = match target {
            Some(target) => target,
            None => continue,
        };

        let staged = stage_upload(&shared, &allocator, &request);
        let (staging_buffer, allocation) = match staged {
            Some(staged) => staged,
            None => continue,
        };

        if !dedicated_transfer {
            // hand the filled staging buffer to the render thread
            let _ = completions.send(UploadDone {
                handle: request.handle,
                staging: Some((staging_buffer, allocation)),
                acquire_from_transfer: false,
                callback: request.callback,
            });
            continue;
        }

        let submitted = unsafe {
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            if dev.begin_command_buffer(cmd, &begin).is_err() {
                false
            } else {
                crate::resources::image::image_barrier(
                    &dev,
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
                        aspect_mask: crate::state::to_vk_image_aspect(format),
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: extent,
                };
                dev.cmd_copy_buffer_to_image(
                    cmd,
                    staging_buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );

                // release ownership; the render thread acquires on
                // the graphics queue
                let release = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::empty())
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .src_queue_family_index(transfer_family)
                    .dst_queue_family_index(graphics_family)
                    .image(image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: crate::state::to_vk_image_aspect(format),
                        base_mip_level: 0,
                        level_count: mips,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .build();
                dev.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[release],
                );

                if dev.end_command_buffer(cmd).is_err() {
                    false
                } else {
                    let cmds = [cmd];
                    let submit = vk::SubmitInfo::builder().command_buffers(&cmds).build();
                    let _guard = shared.sh_transfer_lock.lock().unwrap();
                    dev.queue_submit(shared.sh_queue_transfer, &[submit], fence)
                        .is_ok()
                }
            }
        };

        if submitted {
            unsafe {
                let _ = dev.wait_for_fences(&[fence], true, u64::MAX);
                let _ = dev.reset_fences(&[fence]);
            }
        }

        unsafe {
            dev.destroy_buffer(staging_buffer, None);
        }
        let _ = allocator.lock().unwrap().free(allocation);

        let _ = completions.send(UploadDone {
            handle: request.handle,
            staging: None,
            acquire_from_transfer: submitted,
            callback: request.callback,
        });
    }

    unsafe {
        dev.destroy_fence(fence, None);
        dev.destroy_command_pool(pool, None);
    }
}

/// Create and fill a raw staging buffer for one upload.
fn stage_upload(
    shared: &GpuShared,
    allocator: &Mutex<Allocator>,
    request: &UploadRequest,
) -> Option<(vk::Buffer, gpu_allocator::vulkan::Allocation)> {
    let dev = &shared.sh_dev;

    let info = vk::BufferCreateInfo::builder()
        .size(request.data.len() as u64)
        .usage(vk::BufferUsageFlags::TRANSFER_SRC)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { dev.create_buffer(&info, None).ok()? };
    let requirements = unsafe { dev.get_buffer_memory_requirements(buffer) };

    let allocation = allocator
        .lock()
        .unwrap()
        .allocate(&AllocationCreateDesc {
            name: "async-upload-staging",
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .ok()?;

    unsafe {
        if dev
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            .is_err()
        {
            dev.destroy_buffer(buffer, None);
            let _ = allocator.lock().unwrap().free(allocation);
            return None;
        }
    }

    if let Some(ptr) = allocation.mapped_ptr() {
        unsafe {
            std::ptr::copy_nonoverlapping(
                request.data.as_ptr(),
                ptr.as_ptr() as *mut u8,
                request.data.len(),
            );
        }
    }

    Some((buffer, allocation))
}
