// The frame graph
//
// Applications describe a frame as named nodes producing and
// consuming named resources. Compiling the graph resolves producer
// to consumer edges, orders the nodes, reference-counts resource
// lifetimes, aliases attachment memory across disjoint live ranges
// and instantiates the render passes and framebuffers each graphic
// node needs. Allocation goes through the `GraphResources` seam so
// the whole compiler runs without a GPU in tests.

use arrayvec::ArrayVec;
use ash::vk;
use fxhash::FxHashMap;

use crate::pool::{Handle, HandlePool};
use crate::resources::{
    BufferCreation, BufferHandle, BufferUsage, FramebufferCreation, FramebufferHandle,
    RenderPassCreation, RenderPassHandle, RenderPassOp, RenderPassOutput, ResourceUsageType,
    TextureCreation, TextureHandle, TextureInfo, TextureType,
};
use crate::state::{calc_texture_size, has_depth_or_stencil};
use crate::strings::{hash_name, intern};
use crate::{renderer::PassHandler, Result, TormentaError};

pub const MAX_NODES: usize = 256;
pub const MAX_INPUTS: usize = 16;
pub const MAX_OUTPUTS: usize = 16;

pub type NodeHandle = Handle<GraphNode>;
pub type GraphResourceHandle = Handle<GraphResource>;
pub type PassHandle = Handle<GraphPass>;

/// Everything the compiler needs from the device side. `Renderer`
/// implements this; tests drive compilation with a stub.
pub trait GraphResources {
    fn swapchain_size(&self) -> (u32, u32);
    fn create_graph_texture(&mut self, creation: TextureCreation) -> Result<TextureHandle>;
    fn destroy_graph_texture(&mut self, handle: TextureHandle);
    fn graph_texture_info(&self, handle: TextureHandle) -> Result<TextureInfo>;
    fn create_graph_buffer(&mut self, creation: BufferCreation) -> Result<BufferHandle>;
    fn destroy_graph_buffer(&mut self, handle: BufferHandle);
    fn create_graph_render_pass(&mut self, creation: RenderPassCreation)
        -> Result<RenderPassHandle>;
    fn destroy_graph_render_pass(&mut self, handle: RenderPassHandle);
    fn create_graph_framebuffer(&mut self, creation: FramebufferCreation)
        -> Result<FramebufferHandle>;
    fn destroy_graph_framebuffer(&mut self, handle: FramebufferHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceType {
    /// A texture this node renders into.
    #[default]
    Attachment,
    /// A texture sampled by the node.
    Texture,
    Buffer,
    /// Consume-only alias that never allocates storage.
    Reference,
}

/// An input a node declares by name.
#[derive(Debug, Clone, Copy)]
pub struct ResourceInput {
    pub name: &'static str,
    pub resource_type: ResourceType,
    /// Read the slot the previous frame wrote (ping-pong).
    pub previous_frame: bool,
}

impl ResourceInput {
    pub fn new(name: &str, resource_type: ResourceType) -> Self {
        Self {
            name: intern(name),
            resource_type,
            previous_frame: false,
        }
    }

    pub fn previous_frame(mut self) -> Self {
        self.previous_frame = true;
        self
    }
}

/// An output a node declares. Texture fields matter for attachments,
/// buffer fields for buffers.
#[derive(Debug, Clone, Copy)]
pub struct ResourceOutput {
    pub name: &'static str,
    pub resource_type: ResourceType,
    pub external: bool,

    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    /// Fraction of the swapchain size; 0 means the explicit width
    /// and height above are authoritative and survive resizes.
    pub auto_scale: f32,
    pub op: RenderPassOp,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,

    pub size: u64,
    pub usage: BufferUsage,
    pub fill_value: Option<u32>,
}

impl ResourceOutput {
    pub fn attachment(name: &str, format: vk::Format) -> Self {
        Self {
            name: intern(name),
            resource_type: ResourceType::Attachment,
            external: false,
            format,
            width: 0,
            height: 0,
            auto_scale: 1.0,
            op: RenderPassOp::DontCare,
            clear_color: [0.0; 4],
            clear_depth: 1.0,
            clear_stencil: 0,
            size: 0,
            usage: BufferUsage::empty(),
            fill_value: None,
        }
    }

    pub fn buffer(name: &str, size: u64, usage: BufferUsage) -> Self {
        Self {
            name: intern(name),
            resource_type: ResourceType::Buffer,
            external: false,
            format: vk::Format::UNDEFINED,
            width: 0,
            height: 0,
            auto_scale: 0.0,
            op: RenderPassOp::DontCare,
            clear_color: [0.0; 4],
            clear_depth: 1.0,
            clear_stencil: 0,
            size,
            usage,
            fill_value: None,
        }
    }

    pub fn reference(name: &str) -> Self {
        Self {
            resource_type: ResourceType::Reference,
            ..Self::attachment(name, vk::Format::UNDEFINED)
        }
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self.auto_scale = 0.0;
        self
    }

    pub fn auto_scale(mut self, scale: f32) -> Self {
        self.auto_scale = scale;
        self
    }

    pub fn clear(mut self, color: [f32; 4]) -> Self {
        self.op = RenderPassOp::Clear;
        self.clear_color = color;
        self
    }

    pub fn clear_depth_stencil(mut self, depth: f32, stencil: u32) -> Self {
        self.op = RenderPassOp::Clear;
        self.clear_depth = depth;
        self.clear_stencil = stencil;
        self
    }

    pub fn fill(mut self, value: u32) -> Self {
        self.fill_value = Some(value);
        self
    }
}

/// Texture-shaped portion of a graph resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphTextureInfo {
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub auto_scale: f32,
    pub op: RenderPassOp,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
    /// Dimensions were made concrete (swapchain defaults and
    /// auto_scale applied). Happens once; resizes rescale in place.
    pub sized: bool,
    /// One handle normally, two when stored across frames.
    pub handles: [TextureHandle; 2],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GraphBufferInfo {
    pub size: u64,
    pub usage: BufferUsage,
    pub fill_value: Option<u32>,
    pub handle: BufferHandle,
}

#[derive(Default)]
pub struct GraphResource {
    pub name: &'static str,
    pub resource_type: ResourceType,
    pub external: bool,
    pub ref_count: u32,
    pub save_for_next_frame: bool,
    /// Node that produces this resource.
    pub producer: NodeHandle,
    /// The output resource an input entry resolved to.
    pub output: GraphResourceHandle,
    pub texture: GraphTextureInfo,
    pub buffer: GraphBufferInfo,
}

#[derive(Default)]
pub struct GraphNode {
    pub name: &'static str,
    pub enabled: bool,
    pub compute: bool,
    pub render_pass: RenderPassHandle,
    pub framebuffers: [FramebufferHandle; 2],
    pub pass: PassHandle,
    pub inputs: ArrayVec<GraphResourceHandle, MAX_INPUTS>,
    pub outputs: ArrayVec<GraphResourceHandle, MAX_OUTPUTS>,
    pub edges: Vec<NodeHandle>,
}

/// A registered pass: the callbacks one or more nodes execute with.
#[derive(Default)]
pub struct GraphPass {
    pub name: &'static str,
    pub(crate) handler: Option<Box<dyn PassHandler>>,
    /// The renderer ran `initialize` on this pass.
    pub(crate) initialized: bool,
}

pub struct FrameGraph {
    fg_nodes: HandlePool<GraphNode>,
    fg_resources: HandlePool<GraphResource>,
    fg_passes: HandlePool<GraphPass>,

    fg_node_cache: FxHashMap<u64, NodeHandle>,
    fg_resource_cache: FxHashMap<u64, GraphResourceHandle>,
    fg_pass_cache: FxHashMap<u64, PassHandle>,
    /// Externally supplied resources, by name hash.
    fg_external_buffers: FxHashMap<u64, BufferHandle>,
    fg_external_textures: FxHashMap<u64, TextureHandle>,

    /// Every node in declaration order. Never filtered, so nodes can
    /// be disabled and re-enabled between compiles.
    fg_node_graph: Vec<NodeHandle>,
    /// Enabled nodes in compiled execution order.
    fg_execution: Vec<NodeHandle>,
    fg_has_changes: bool,
}

impl FrameGraph {
    pub fn new() -> Self {
        Self {
            fg_nodes: HandlePool::new(64),
            fg_resources: HandlePool::new(128),
            fg_passes: HandlePool::new(32),
            fg_node_cache: FxHashMap::default(),
            fg_resource_cache: FxHashMap::default(),
            fg_pass_cache: FxHashMap::default(),
            fg_external_buffers: FxHashMap::default(),
            fg_external_textures: FxHashMap::default(),
            fg_node_graph: Vec::new(),
            fg_execution: Vec::new(),
            fg_has_changes: false,
        }
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Register the callbacks nodes with this name will run with.
    pub fn add_pass(&mut self, name: &str, handler: Box<dyn PassHandler>) -> Result<()> {
        let key = hash_name(name);
        if self.fg_pass_cache.contains_key(&key) {
            log::error!("render pass '{}' already exists in frame graph", name);
            return Err(TormentaError::ALREADY_EXISTS);
        }

        let (handle, pass) = self.fg_passes.obtain_and_access()?;
        pass.name = intern(name);
        pass.handler = Some(handler);
        self.fg_pass_cache.insert(key, handle);
        self.fg_has_changes = true;
        Ok(())
    }

    /// Unregister a pass. Returns the handler so the caller can run
    /// its uninitialize callback.
    pub fn remove_pass(&mut self, name: &str) -> Result<Box<dyn PassHandler>> {
        let key = hash_name(name);
        let handle = match self.fg_pass_cache.remove(&key) {
            Some(handle) => handle,
            None => {
                log::error!("render pass '{}' not found", name);
                return Err(TormentaError::NOT_FOUND);
            }
        };

        let handler = self.fg_passes.access_mut(handle).handler.take();
        self.fg_passes.release(handle);
        self.fg_has_changes = true;
        handler.ok_or(TormentaError::NOT_FOUND)
    }

    pub fn add_node(
        &mut self,
        name: &str,
        compute: bool,
        inputs: &[ResourceInput],
        outputs: &[ResourceOutput],
    ) -> Result<()> {
        let key = hash_name(name);
        if self.fg_node_cache.contains_key(&key) {
            log::error!("node '{}' already exists in frame graph", name);
            return Err(TormentaError::ALREADY_EXISTS);
        }
        if inputs.len() > MAX_INPUTS || outputs.len() > MAX_OUTPUTS {
            return Err(TormentaError::INVALID_ARGUMENT);
        }

        let (handle, _) = self.fg_nodes.obtain_and_access()?;

        let mut input_handles = ArrayVec::new();
        for input in inputs {
            input_handles.push(self.create_node_input(input)?);
        }
        let mut output_handles = ArrayVec::new();
        for output in outputs {
            output_handles.push(self.create_node_output(output, handle)?);
        }

        let node = self.fg_nodes.access_mut(handle);
        node.name = intern(name);
        node.enabled = true;
        node.compute = compute;
        node.render_pass = RenderPassHandle::INVALID;
        node.framebuffers = [FramebufferHandle::INVALID; 2];
        node.pass = PassHandle::INVALID;
        node.inputs = input_handles;
        node.outputs = output_handles;

        self.fg_node_graph.push(handle);
        self.fg_node_cache.insert(key, handle);
        self.fg_has_changes = true;
        Ok(())
    }

    fn create_node_output(
        &mut self,
        output: &ResourceOutput,
        producer: NodeHandle,
    ) -> Result<GraphResourceHandle> {
        let (handle, resource) = self.fg_resources.obtain_and_access()?;

        resource.name = output.name;
        resource.resource_type = output.resource_type;
        resource.external = output.external;
        resource.producer = NodeHandle::INVALID;
        resource.output = GraphResourceHandle::INVALID;

        match output.resource_type {
            ResourceType::Buffer => {
                resource.buffer = GraphBufferInfo {
                    size: output.size,
                    usage: output.usage,
                    fill_value: output.fill_value,
                    handle: BufferHandle::INVALID,
                };
            }
            _ => {
                resource.texture = GraphTextureInfo {
                    format: output.format,
                    width: output.width,
                    height: output.height,
                    depth: 1,
                    auto_scale: output.auto_scale,
                    op: output.op,
                    clear_color: output.clear_color,
                    clear_depth: output.clear_depth,
                    clear_stencil: output.clear_stencil,
                    sized: false,
                    handles: [TextureHandle::INVALID; 2],
                };
            }
        }

        if output.resource_type != ResourceType::Reference {
            resource.producer = producer;
            resource.output = handle;
            self.fg_resource_cache.insert(hash_name(output.name), handle);
        }

        Ok(handle)
    }

    fn create_node_input(&mut self, input: &ResourceInput) -> Result<GraphResourceHandle> {
        let (handle, resource) = self.fg_resources.obtain_and_access()?;
        resource.name = input.name;
        resource.resource_type = input.resource_type;
        resource.save_for_next_frame = input.previous_frame;
        resource.producer = NodeHandle::INVALID;
        resource.output = GraphResourceHandle::INVALID;
        Ok(handle)
    }

    pub fn enable_node(&mut self, name: &str, enable: bool) -> Result<()> {
        let key = hash_name(name);
        match self.fg_node_cache.get(&key) {
            Some(&handle) => {
                let node = self.fg_nodes.access_mut(handle);
                if node.enabled != enable {
                    node.enabled = enable;
                    self.fg_has_changes = true;
                }
                Ok(())
            }
            None => {
                log::error!("node '{}' not found in frame graph", name);
                Err(TormentaError::NOT_FOUND)
            }
        }
    }

    /// Bind an application owned buffer under a graph name.
    pub fn add_buffer(&mut self, name: &str, handle: BufferHandle) {
        let key = hash_name(name);
        if handle.is_valid() {
            self.fg_external_buffers.insert(key, handle);
        } else {
            self.fg_external_buffers.remove(&key);
        }
    }

    /// Bind an application owned texture under a graph name.
    pub fn add_texture(&mut self, name: &str, handle: TextureHandle) {
        let key = hash_name(name);
        if handle.is_valid() {
            self.fg_external_textures.insert(key, handle);
        } else {
            self.fg_external_textures.remove(&key);
        }
    }

    /// Drop every node, resource and pass, destroying what the graph
    /// allocated.
    pub fn clear(&mut self, res: &mut dyn GraphResources) {
        self.fg_has_changes = false;

        for i in 0..self.fg_node_graph.len() {
            let node_handle = self.fg_node_graph[i];
            self.destroy_node_gpu_objects(node_handle, res);

            let outputs = self.fg_nodes.access(node_handle).outputs.clone();
            for output in outputs {
                let resource = self.fg_resources.access_mut(output);
                if resource.external {
                    continue;
                }
                match resource.resource_type {
                    ResourceType::Attachment | ResourceType::Texture => {
                        let handles = resource.texture.handles;
                        resource.texture.handles = [TextureHandle::INVALID; 2];
                        for handle in handles {
                            if handle.is_valid() {
                                res.destroy_graph_texture(handle);
                            }
                        }
                    }
                    ResourceType::Buffer => {
                        let handle = resource.buffer.handle;
                        resource.buffer.handle = BufferHandle::INVALID;
                        if handle.is_valid() {
                            res.destroy_graph_buffer(handle);
                        }
                    }
                    ResourceType::Reference => {}
                }
            }
        }

        self.fg_node_graph.clear();
        self.fg_execution.clear();
        self.fg_node_cache.clear();
        self.fg_resource_cache.clear();
        self.fg_pass_cache.clear();
        self.fg_nodes.release_all();
        self.fg_resources.release_all();
        self.fg_passes.release_all();
    }

    fn destroy_node_gpu_objects(&mut self, handle: NodeHandle, res: &mut dyn GraphResources) {
        let node = self.fg_nodes.access_mut(handle);
        let framebuffers = std::mem::replace(&mut node.framebuffers, [FramebufferHandle::INVALID; 2]);
        let render_pass = std::mem::replace(&mut node.render_pass, RenderPassHandle::INVALID);

        for framebuffer in framebuffers {
            if framebuffer.is_valid() {
                res.destroy_graph_framebuffer(framebuffer);
            }
        }
        if render_pass.is_valid() {
            res.destroy_graph_render_pass(render_pass);
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Number of nodes in the compiled execution order.
    pub fn node_count(&self) -> usize {
        self.fg_execution.len()
    }

    /// Node at a position of the compiled execution order.
    pub fn node_at(&self, index: usize) -> &GraphNode {
        self.fg_nodes.access(self.fg_execution[index])
    }

    pub(crate) fn node_handle_at(&self, index: usize) -> NodeHandle {
        self.fg_execution[index]
    }

    pub fn get_node(&self, name: &str) -> Option<&GraphNode> {
        self.fg_node_cache
            .get(&hash_name(name))
            .map(|&handle| self.fg_nodes.access(handle))
    }

    pub(crate) fn node(&self, handle: NodeHandle) -> &GraphNode {
        self.fg_nodes.access(handle)
    }

    pub fn get_resource(&self, name: &str) -> Option<&GraphResource> {
        self.fg_resource_cache
            .get(&hash_name(name))
            .map(|&handle| self.fg_resources.access(handle))
    }

    pub(crate) fn resource(&self, handle: GraphResourceHandle) -> &GraphResource {
        self.fg_resources.access(handle)
    }

    pub(crate) fn pass_mut(&mut self, handle: PassHandle) -> &mut GraphPass {
        self.fg_passes.access_mut(handle)
    }

    pub(crate) fn passes(&self) -> impl Iterator<Item = PassHandle> + '_ {
        self.fg_passes.iter_handles()
    }

    pub fn has_changes(&self) -> bool {
        self.fg_has_changes
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.fg_has_changes = true;
    }

    /// The texture a by-name read resolves to this frame: stored
    /// resources hand out the slot the previous frame wrote.
    pub fn resource_texture(&self, name: &str, frame_parity: usize) -> Option<TextureHandle> {
        self.get_resource(name).map(|resource| {
            if resource.save_for_next_frame {
                resource.texture.handles[(frame_parity ^ 1) & 1]
            } else {
                resource.texture.handles[0]
            }
        })
    }

    /// Snapshot of every named resource for descriptor resolution,
    /// keyed by name hash.
    pub(crate) fn binding_snapshot(
        &self,
        frame_parity: usize,
    ) -> FxHashMap<u64, crate::resources::BindingTarget> {
        let mut map = FxHashMap::default();
        for (&key, &handle) in self.fg_resource_cache.iter() {
            let resource = self.fg_resources.access(handle);
            match resource.resource_type {
                ResourceType::Buffer => {
                    if resource.buffer.handle.is_valid() {
                        map.insert(
                            key,
                            crate::resources::BindingTarget::Buffer(resource.buffer.handle),
                        );
                    }
                }
                ResourceType::Reference => {}
                _ => {
                    let texture = if resource.save_for_next_frame {
                        resource.texture.handles[(frame_parity ^ 1) & 1]
                    } else {
                        resource.texture.handles[0]
                    };
                    if texture.is_valid() {
                        map.insert(key, crate::resources::BindingTarget::Texture(texture));
                    }
                }
            }
        }
        map
    }

    // ------------------------------------------------------------------
    // Compile
    // ------------------------------------------------------------------

    pub fn compile(&mut self, res: &mut dyn GraphResources) -> Result<()> {
        if !self.fg_has_changes {
            return Ok(());
        }

        self.resolve_external_resources(res)?;
        self.compute_edges()?;
        self.sort_nodes();

        let stored = self.collect_stored_resources();
        self.allocate_resources(res, &stored)?;
        self.propagate_input_handles()?;
        self.instantiate_passes(res, &stored)?;
        self.bind_pass_handles()?;

        self.fg_has_changes = false;
        Ok(())
    }

    /// Pull sizes and handles for externally bound resources.
    fn resolve_external_resources(&mut self, res: &mut dyn GraphResources) -> Result<()> {
        for i in 0..self.fg_node_graph.len() {
            let node_handle = self.fg_node_graph[i];
            if !self.fg_nodes.access(node_handle).enabled {
                continue;
            }
            let outputs = self.fg_nodes.access(node_handle).outputs.clone();

            for output in outputs {
                let (name, external, is_buffer, stored) = {
                    let resource = self.fg_resources.access(output);
                    (
                        resource.name,
                        resource.external,
                        resource.resource_type == ResourceType::Buffer,
                        resource.save_for_next_frame,
                    )
                };
                if !external {
                    continue;
                }
                if stored {
                    log::warn!(
                        "external resource '{}' cannot be kept for the next frame",
                        name
                    );
                }

                let key = hash_name(name);
                if is_buffer {
                    match self.fg_external_buffers.get(&key) {
                        Some(&handle) => {
                            self.fg_resources.access_mut(output).buffer.handle = handle;
                        }
                        None => {
                            log::error!("external buffer '{}' not bound", name);
                            return Err(TormentaError::NOT_FOUND);
                        }
                    }
                } else {
                    match self.fg_external_textures.get(&key) {
                        Some(&handle) => {
                            let info = res.graph_texture_info(handle)?;
                            let resource = self.fg_resources.access_mut(output);
                            resource.texture.format = info.format;
                            resource.texture.width = info.width;
                            resource.texture.height = info.height;
                            resource.texture.depth = info.depth;
                            resource.texture.handles[0] = handle;
                        }
                        None => {
                            log::error!("external texture '{}' not bound", name);
                            return Err(TormentaError::NOT_FOUND);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve each input against the output that produces it and
    /// append the consumer to the producer's edge list. Inputs read
    /// from the previous frame break the cycle on purpose.
    fn compute_edges(&mut self) -> Result<()> {
        for i in 0..self.fg_node_graph.len() {
            let handle = self.fg_node_graph[i];
            self.fg_nodes.access_mut(handle).edges.clear();
        }

        for i in 0..self.fg_node_graph.len() {
            let node_handle = self.fg_node_graph[i];
            let inputs = self.fg_nodes.access(node_handle).inputs.clone();

            for input in inputs {
                let (name, input_type, skip_edge) = {
                    let resource = self.fg_resources.access(input);
                    (resource.name, resource.resource_type, resource.save_for_next_frame)
                };

                let output_handle = match self.fg_resource_cache.get(&hash_name(name)) {
                    Some(&output) => output,
                    None => {
                        log::error!(
                            "no output produces '{}' consumed by node '{}'",
                            name,
                            self.fg_nodes.access(node_handle).name
                        );
                        return Err(TormentaError::NOT_FOUND);
                    }
                };

                let (external, producer, output, texture, buffer) = {
                    let output_resource = self.fg_resources.access(output_handle);
                    (
                        output_resource.external,
                        output_resource.producer,
                        output_resource.output,
                        output_resource.texture,
                        output_resource.buffer,
                    )
                };

                {
                    let input_resource = self.fg_resources.access_mut(input);
                    input_resource.external = external;
                    input_resource.producer = producer;
                    input_resource.output = output;
                    input_resource.texture = texture;
                    input_resource.buffer = buffer;
                    input_resource.resource_type = input_type;
                }

                if skip_edge || !producer.is_valid() {
                    continue;
                }

                let producer_node = self.fg_nodes.access_mut(producer);
                producer_node.edges.push(node_handle);
            }
        }
        Ok(())
    }

    /// Iterative depth-first topological sort. Disabled nodes do not
    /// take part; the execution order is the reverse post-order.
    fn sort_nodes(&mut self) {
        const UNSEEN: u8 = 0;
        const ON_STACK: u8 = 1;
        const DONE: u8 = 2;

        let mut visited = vec![UNSEEN; self.fg_nodes.capacity()];
        let mut sorted: Vec<NodeHandle> = Vec::with_capacity(self.fg_node_graph.len());
        let mut stack: Vec<NodeHandle> = Vec::new();

        for &seed in self.fg_node_graph.iter() {
            if !self.fg_nodes.access(seed).enabled {
                continue;
            }

            stack.push(seed);
            while let Some(&handle) = stack.last() {
                let mark = visited[handle.index() as usize];
                if mark == DONE {
                    stack.pop();
                    continue;
                }
                if mark == ON_STACK {
                    visited[handle.index() as usize] = DONE;
                    sorted.push(handle);
                    stack.pop();
                    continue;
                }

                visited[handle.index() as usize] = ON_STACK;

                let node = self.fg_nodes.access(handle);
                for &child in node.edges.iter() {
                    if visited[child.index() as usize] == UNSEEN
                        && self.fg_nodes.access(child).enabled
                    {
                        stack.push(child);
                    }
                }
            }
        }

        sorted.reverse();
        self.fg_execution = sorted;
    }

    /// Names of resources any consumer keeps for the next frame.
    /// These double-buffer and never alias.
    fn collect_stored_resources(&mut self) -> Vec<&'static str> {
        let mut stored = Vec::new();
        for i in 0..self.fg_execution.len() {
            let node_handle = self.fg_execution[i];
            let inputs = self.fg_nodes.access(node_handle).inputs.clone();

            for input in inputs {
                let (name, save, output) = {
                    let resource = self.fg_resources.access(input);
                    (resource.name, resource.save_for_next_frame, resource.output)
                };
                if save {
                    if !stored.contains(&name) {
                        stored.push(name);
                    }
                    if output.is_valid() {
                        self.fg_resources.access_mut(output).save_for_next_frame = true;
                    }
                }
                if output.is_valid() {
                    self.fg_resources.access_mut(output).ref_count += 1;
                }
            }
        }
        stored
    }

    /// Walk the execution order allocating outputs and releasing
    /// inputs whose last consumer passed, feeding the free list that
    /// aliases later attachments into earlier memory.
    fn allocate_resources(
        &mut self,
        res: &mut dyn GraphResources,
        stored: &[&'static str],
    ) -> Result<()> {
        let (swap_w, swap_h) = res.swapchain_size();
        let mut free_list: Vec<TextureHandle> = Vec::new();
        let mut allocated = vec![false; self.fg_resources.capacity()];

        for i in 0..self.fg_execution.len() {
            let node_handle = self.fg_execution[i];
            let (node_compute, outputs, inputs) = {
                let node = self.fg_nodes.access(node_handle);
                (node.compute, node.outputs.clone(), node.inputs.clone())
            };

            for output in outputs {
                let index = output.index() as usize;
                if allocated[index] {
                    continue;
                }
                allocated[index] = true;

                let (external, resource_type, name) = {
                    let resource = self.fg_resources.access(output);
                    (resource.external, resource.resource_type, resource.name)
                };
                if external {
                    continue;
                }

                match resource_type {
                    ResourceType::Attachment => {
                        // make the declared size concrete on first
                        // sight: unset dimensions follow the
                        // swapchain, then the scale factor applies
                        let (width, height) = {
                            let texture = &mut self.fg_resources.access_mut(output).texture;
                            if !texture.sized {
                                if texture.width == 0 {
                                    texture.width = swap_w;
                                }
                                if texture.height == 0 {
                                    texture.height = swap_h;
                                }
                                if texture.auto_scale != 0.0 {
                                    texture.width =
                                        (texture.width as f32 * texture.auto_scale) as u32;
                                    texture.height =
                                        (texture.height as f32 * texture.auto_scale) as u32;
                                }
                                texture.sized = true;
                            }
                            (texture.width, texture.height)
                        };

                        let (format, save) = {
                            let resource = self.fg_resources.access(output);
                            (resource.texture.format, resource.save_for_next_frame)
                        };

                        // fit into a freed attachment unless stored
                        let mut alias = TextureHandle::INVALID;
                        if !stored.contains(&name) {
                            let needed = calc_texture_size(width, height, 1, format);
                            if let Some(pos) = free_list.iter().position(|&candidate| {
                                res.graph_texture_info(candidate)
                                    .map(|info| {
                                        calc_texture_size(
                                            info.width,
                                            info.height,
                                            info.depth,
                                            info.format,
                                        ) >= needed
                                    })
                                    .unwrap_or(false)
                            }) {
                                alias = free_list.remove(pos);
                            }
                        }

                        let slots = if save { 2 } else { 1 };
                        for slot in 0..slots {
                            let existing = self.fg_resources.access(output).texture.handles[slot];
                            if existing.is_valid() {
                                continue;
                            }
                            let mut creation = TextureCreation::default()
                                .set_format(format, TextureType::D2)
                                .set_size(width, height, 1)
                                .set_flags(1, true, node_compute)
                                .set_name(&format!("{}-{}", name, slot));
                            if alias.is_valid() && slot == 0 {
                                creation = creation.set_alias(alias);
                            }
                            let handle = res.create_graph_texture(creation)?;
                            self.fg_resources.access_mut(output).texture.handles[slot] = handle;
                        }
                    }
                    ResourceType::Buffer => {
                        let existing = self.fg_resources.access(output).buffer.handle;
                        if !existing.is_valid() {
                            let buffer = self.fg_resources.access(output).buffer;
                            let mut creation = BufferCreation::default()
                                .set(buffer.usage, ResourceUsageType::Immutable, buffer.size)
                                .set_name(name);
                            if let Some(value) = buffer.fill_value {
                                creation = creation.set_fill_value(value);
                            }
                            let handle = res.create_graph_buffer(creation)?;
                            self.fg_resources.access_mut(output).buffer.handle = handle;
                        }
                    }
                    ResourceType::Texture | ResourceType::Reference => {}
                }
            }

            for input in inputs {
                let output = self.fg_resources.access(input).output;
                if !output.is_valid() {
                    continue;
                }

                let (ref_count, external, name, resource_type, first_handle) = {
                    let resource = self.fg_resources.access_mut(output);
                    resource.ref_count = resource.ref_count.saturating_sub(1);
                    (
                        resource.ref_count,
                        resource.external,
                        resource.name,
                        resource.resource_type,
                        resource.texture.handles[0],
                    )
                };

                if !external
                    && ref_count == 0
                    && !stored.contains(&name)
                    && matches!(resource_type, ResourceType::Attachment | ResourceType::Texture)
                    && first_handle.is_valid()
                {
                    free_list.push(first_handle);
                }
            }
        }
        Ok(())
    }

    /// Copy the concrete handles every output ended up with into the
    /// input entries that reference them.
    fn propagate_input_handles(&mut self) -> Result<()> {
        for i in 0..self.fg_execution.len() {
            let node_handle = self.fg_execution[i];
            let (node_name, inputs) = {
                let node = self.fg_nodes.access(node_handle);
                (node.name, node.inputs.clone())
            };

            for input in inputs {
                let (name, resource_type) = {
                    let resource = self.fg_resources.access(input);
                    (resource.name, resource.resource_type)
                };
                if resource_type == ResourceType::Reference {
                    continue;
                }

                let output_handle = match self.fg_resource_cache.get(&hash_name(name)) {
                    Some(&handle) => handle,
                    None => continue,
                };

                if resource_type == ResourceType::Buffer {
                    let handle = self.fg_resources.access(output_handle).buffer.handle;
                    if !handle.is_valid() {
                        log::error!(
                            "node '{}' reads '{}' which was never allocated; \
                             is its producer disabled?",
                            node_name,
                            name
                        );
                        return Err(TormentaError::NOT_FOUND);
                    }
                    self.fg_resources.access_mut(input).buffer.handle = handle;
                } else {
                    let handles = self.fg_resources.access(output_handle).texture.handles;
                    if !handles[0].is_valid() {
                        log::error!(
                            "node '{}' reads '{}' which was never allocated; \
                             is its producer disabled?",
                            node_name,
                            name
                        );
                        return Err(TormentaError::NOT_FOUND);
                    }
                    self.fg_resources.access_mut(input).texture.handles = handles;
                }
            }
        }
        Ok(())
    }

    /// Derive the render pass shape of a graphic node from its
    /// attachment outputs.
    fn node_render_pass_output(&self, node_handle: NodeHandle) -> RenderPassOutput {
        let node = self.fg_nodes.access(node_handle);
        let mut output = RenderPassOutput::default();

        for &out in node.outputs.iter() {
            let resource = self.fg_resources.access(out);
            if resource.resource_type != ResourceType::Attachment {
                continue;
            }

            let texture = &resource.texture;
            let op = match texture.op {
                RenderPassOp::Clear => RenderPassOp::Clear,
                // an attachment carried across frames reloads its
                // previous contents, fresh ones start undefined
                _ if resource.save_for_next_frame => RenderPassOp::Load,
                other => other,
            };

            if has_depth_or_stencil(texture.format) {
                output = output
                    .depth(
                        texture.format,
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    )
                    .set_depth_stencil_ops(op, op);
            } else {
                output = output.color(
                    texture.format,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    op,
                );
            }
        }

        output
    }

    /// Create render passes and framebuffers for graphic nodes.
    /// Nodes touching a stored resource get one framebuffer per
    /// ping-pong slot.
    fn instantiate_passes(
        &mut self,
        res: &mut dyn GraphResources,
        stored: &[&'static str],
    ) -> Result<()> {
        for i in 0..self.fg_execution.len() {
            let node_handle = self.fg_execution[i];
            let (compute, name, has_outputs) = {
                let node = self.fg_nodes.access(node_handle);
                (node.compute, node.name, !node.outputs.is_empty())
            };
            if compute || !has_outputs {
                continue;
            }

            if !self.fg_nodes.access(node_handle).render_pass.is_valid() {
                let output = self.node_render_pass_output(node_handle);
                let render_pass = res.create_graph_render_pass(
                    RenderPassCreation {
                        output,
                        ..Default::default()
                    }
                    .set_name(name),
                )?;
                self.fg_nodes.access_mut(node_handle).render_pass = render_pass;
            }

            // a node whose inputs or outputs ping-pong needs one
            // framebuffer per slot
            let mut max_framebuffers = 1;
            {
                let node = self.fg_nodes.access(node_handle);
                let touches_stored = node
                    .inputs
                    .iter()
                    .chain(node.outputs.iter())
                    .any(|&handle| {
                        let resource = self.fg_resources.access(handle);
                        resource.resource_type == ResourceType::Attachment
                            && stored.contains(&resource.name)
                    });
                if touches_stored {
                    max_framebuffers = 2;
                }
            }

            for slot in 0..max_framebuffers {
                if self.fg_nodes.access(node_handle).framebuffers[slot].is_valid() {
                    continue;
                }

                let render_pass = self.fg_nodes.access(node_handle).render_pass;
                let mut creation = FramebufferCreation::default().set_name(name);
                creation.render_pass = render_pass;

                let outputs = self.fg_nodes.access(node_handle).outputs.clone();
                for out in outputs {
                    let resource = self.fg_resources.access(out);
                    if resource.resource_type != ResourceType::Attachment {
                        continue;
                    }
                    let texture = &resource.texture;
                    let pick = if resource.save_for_next_frame { slot } else { 0 };
                    let handle = texture.handles[pick];

                    creation.width = texture.width;
                    creation.height = texture.height;
                    if has_depth_or_stencil(texture.format) {
                        creation.depth_stencil_attachment = handle;
                    } else {
                        creation.color_attachments.push(handle);
                    }
                }

                let framebuffer = res.create_graph_framebuffer(creation)?;
                self.fg_nodes.access_mut(node_handle).framebuffers[slot] = framebuffer;
            }
        }
        Ok(())
    }

    /// Connect each node to the registered pass with its name.
    fn bind_pass_handles(&mut self) -> Result<()> {
        for i in 0..self.fg_execution.len() {
            let node_handle = self.fg_execution[i];
            let name = self.fg_nodes.access(node_handle).name;

            match self.fg_pass_cache.get(&hash_name(name)) {
                Some(&pass) => {
                    self.fg_nodes.access_mut(node_handle).pass = pass;
                }
                None => {
                    log::error!("render pass '{}' not found", name);
                    return Err(TormentaError::NOT_FOUND);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resize
    // ------------------------------------------------------------------

    /// Propagate a swapchain size change: every node drops its
    /// framebuffers and render pass, auto-scaled attachments drop
    /// their textures when their dimensions change, and the next
    /// compile rebuilds everything.
    pub fn resize(
        &mut self,
        res: &mut dyn GraphResources,
        old_width: u32,
        new_width: u32,
        old_height: u32,
        new_height: u32,
    ) -> Result<()> {
        let scale_x = new_width as f64 / old_width as f64;
        let scale_y = new_height as f64 / old_height as f64;

        for i in 0..self.fg_node_graph.len() {
            let node_handle = self.fg_node_graph[i];

            self.destroy_node_gpu_objects(node_handle, res);
            self.fg_has_changes = true;

            let outputs = self.fg_nodes.access(node_handle).outputs.clone();
            for output in outputs {
                let (external, resource_type, auto_scale, width, height) = {
                    let resource = self.fg_resources.access(output);
                    (
                        resource.external,
                        resource.resource_type,
                        resource.texture.auto_scale,
                        resource.texture.width,
                        resource.texture.height,
                    )
                };
                if external
                    || resource_type == ResourceType::Buffer
                    || resource_type == ResourceType::Reference
                    || auto_scale == 0.0
                {
                    continue;
                }

                let new_w = ((width as f64 * scale_x + 0.5).floor() * auto_scale as f64) as u32;
                let new_h = ((height as f64 * scale_y + 0.5).floor() * auto_scale as f64) as u32;
                if new_w == width && new_h == height {
                    continue;
                }

                let resource = self.fg_resources.access_mut(output);
                resource.texture.width = new_w;
                resource.texture.height = new_h;
                let handles =
                    std::mem::replace(&mut resource.texture.handles, [TextureHandle::INVALID; 2]);
                for handle in handles {
                    if handle.is_valid() {
                        res.destroy_graph_texture(handle);
                    }
                }
            }
        }

        Ok(())
    }
}

impl Default for FrameGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::PassHandler;
    use crate::CommandBuffer;

    /// Headless stand-in for the device: hands out fake handles and
    /// remembers enough metadata to answer size queries.
    struct StubResources {
        swapchain: (u32, u32),
        textures: Vec<Option<TextureInfo>>,
        aliases: Vec<(u16, u16)>,
        buffers: u16,
        render_passes: u16,
        framebuffers: Vec<FramebufferCreation>,
        live_framebuffers: usize,
        live_render_passes: usize,
    }

    impl StubResources {
        fn new(w: u32, h: u32) -> Self {
            Self {
                swapchain: (w, h),
                textures: Vec::new(),
                aliases: Vec::new(),
                buffers: 0,
                render_passes: 0,
                framebuffers: Vec::new(),
                live_framebuffers: 0,
                live_render_passes: 0,
            }
        }
    }

    impl GraphResources for StubResources {
        fn swapchain_size(&self) -> (u32, u32) {
            self.swapchain
        }

        fn create_graph_texture(&mut self, creation: TextureCreation) -> Result<TextureHandle> {
            let index = self.textures.len() as u16;
            self.textures.push(Some(TextureInfo {
                width: creation.width,
                height: creation.height,
                depth: creation.depth,
                mip_levels: creation.mip_levels,
                format: creation.format,
                texture_type: creation.texture_type,
            }));
            if creation.alias.is_valid() {
                self.aliases.push((index, creation.alias.index()));
            }
            Ok(TextureHandle::new(index))
        }

        fn destroy_graph_texture(&mut self, handle: TextureHandle) {
            self.textures[handle.index() as usize] = None;
        }

        fn graph_texture_info(&self, handle: TextureHandle) -> Result<TextureInfo> {
            self.textures[handle.index() as usize]
                .ok_or(TormentaError::INVALID_HANDLE)
        }

        fn create_graph_buffer(&mut self, _creation: BufferCreation) -> Result<BufferHandle> {
            let index = self.buffers;
            self.buffers += 1;
            Ok(BufferHandle::new(index))
        }

        fn destroy_graph_buffer(&mut self, _handle: BufferHandle) {}

        fn create_graph_render_pass(
            &mut self,
            _creation: RenderPassCreation,
        ) -> Result<RenderPassHandle> {
            let index = self.render_passes;
            self.render_passes += 1;
            self.live_render_passes += 1;
            Ok(RenderPassHandle::new(index))
        }

        fn destroy_graph_render_pass(&mut self, _handle: RenderPassHandle) {
            self.live_render_passes -= 1;
        }

        fn create_graph_framebuffer(
            &mut self,
            creation: FramebufferCreation,
        ) -> Result<FramebufferHandle> {
            let index = self.framebuffers.len() as u16;
            self.framebuffers.push(creation);
            self.live_framebuffers += 1;
            Ok(FramebufferHandle::new(index))
        }

        fn destroy_graph_framebuffer(&mut self, _handle: FramebufferHandle) {
            self.live_framebuffers -= 1;
        }
    }

    struct NullPass;

    impl PassHandler for NullPass {
        fn render(
            &self,
            _graph: &FrameGraph,
            _renderer: &crate::Renderer,
            _cmd: &mut CommandBuffer,
            _worker: u32,
            _total: u32,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn color_attachment(name: &str) -> ResourceOutput {
        ResourceOutput::attachment(name, vk::Format::R8G8B8A8_UNORM)
    }

    #[test]
    fn single_pass_fullscreen_compiles_in_order() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(1280, 720);

        graph.add_pass("scene", Box::new(NullPass)).unwrap();
        graph.add_pass("present", Box::new(NullPass)).unwrap();

        graph
            .add_node(
                "scene",
                false,
                &[],
                &[color_attachment("color").clear([1.0, 0.0, 1.0, 1.0])],
            )
            .unwrap();
        graph
            .add_node(
                "present",
                false,
                &[ResourceInput::new("color", ResourceType::Texture)],
                &[],
            )
            .unwrap();

        graph.compile(&mut stub).unwrap();

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.node_at(0).name, "scene");
        assert_eq!(graph.node_at(1).name, "present");

        // scene got its framebuffer and present resolves the same
        // texture by name
        let scene = graph.get_node("scene").unwrap();
        assert!(scene.framebuffers[0].is_valid());
        assert!(!scene.framebuffers[1].is_valid());

        let color = graph.get_resource("color").unwrap();
        assert!(color.texture.handles[0].is_valid());
        assert_eq!(
            graph.resource_texture("color", 0),
            Some(color.texture.handles[0])
        );
        // auto_scale 1.0 follows the swapchain
        assert_eq!(color.texture.width, 1280);
        assert_eq!(color.texture.height, 720);
    }

    #[test]
    fn compile_is_idempotent_when_clean() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(640, 480);

        graph.add_pass("scene", Box::new(NullPass)).unwrap();
        graph
            .add_node("scene", false, &[], &[color_attachment("color")])
            .unwrap();

        graph.compile(&mut stub).unwrap();
        let textures_after_first = stub.textures.len();
        graph.compile(&mut stub).unwrap();
        assert_eq!(stub.textures.len(), textures_after_first);
    }

    #[test]
    fn ping_pong_history_gets_two_handles() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(800, 600);

        graph.add_pass("resolve", Box::new(NullPass)).unwrap();
        graph
            .add_node(
                "resolve",
                false,
                &[ResourceInput::new("history", ResourceType::Texture).previous_frame()],
                &[color_attachment("history")],
            )
            .unwrap();

        graph.compile(&mut stub).unwrap();

        let history = graph.get_resource("history").unwrap();
        assert!(history.save_for_next_frame);
        assert!(history.texture.handles[0].is_valid());
        assert!(history.texture.handles[1].is_valid());
        assert_ne!(history.texture.handles[0], history.texture.handles[1]);

        // frame F reads the slot frame F-1 wrote
        let write_0 = history.texture.handles[0];
        let write_1 = history.texture.handles[1];
        assert_eq!(graph.resource_texture("history", 0), Some(write_1));
        assert_eq!(graph.resource_texture("history", 1), Some(write_0));

        // the node ping-pongs framebuffers too
        let node = graph.get_node("resolve").unwrap();
        assert!(node.framebuffers[0].is_valid());
        assert!(node.framebuffers[1].is_valid());
    }

    #[test]
    fn disjoint_attachments_alias_memory() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(512, 512);

        for name in ["a", "b", "c", "d"] {
            graph.add_pass(name, Box::new(NullPass)).unwrap();
        }

        // tmp1 dies once b consumed it, so tmp3 (written by the
        // strictly later node c) can live in its memory. tmp2 is
        // still alive while c runs and must not be touched.
        graph
            .add_node("a", false, &[], &[color_attachment("tmp1")])
            .unwrap();
        graph
            .add_node(
                "b",
                false,
                &[ResourceInput::new("tmp1", ResourceType::Texture)],
                &[color_attachment("tmp2")],
            )
            .unwrap();
        graph
            .add_node(
                "c",
                false,
                &[ResourceInput::new("tmp2", ResourceType::Texture)],
                &[color_attachment("tmp3")],
            )
            .unwrap();
        graph
            .add_node(
                "d",
                false,
                &[ResourceInput::new("tmp3", ResourceType::Texture)],
                &[],
            )
            .unwrap();

        graph.compile(&mut stub).unwrap();

        let tmp1 = graph.get_resource("tmp1").unwrap().texture.handles[0];
        let tmp2 = graph.get_resource("tmp2").unwrap().texture.handles[0];
        let tmp3 = graph.get_resource("tmp3").unwrap().texture.handles[0];
        assert!(stub
            .aliases
            .iter()
            .any(|&(img, alias)| img == tmp3.index() && alias == tmp1.index()));
        assert!(stub.aliases.iter().all(|&(img, _)| img != tmp2.index()));
    }

    #[test]
    fn stored_resources_never_alias() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(256, 256);

        for name in ["a", "taa", "c"] {
            graph.add_pass(name, Box::new(NullPass)).unwrap();
        }

        graph
            .add_node("a", false, &[], &[color_attachment("tmp")])
            .unwrap();
        graph
            .add_node(
                "taa",
                false,
                &[
                    ResourceInput::new("tmp", ResourceType::Texture),
                    ResourceInput::new("history", ResourceType::Texture).previous_frame(),
                ],
                &[color_attachment("history")],
            )
            .unwrap();
        graph
            .add_node(
                "c",
                false,
                &[ResourceInput::new("history", ResourceType::Texture)],
                &[],
            )
            .unwrap();

        graph.compile(&mut stub).unwrap();

        // history must not reuse tmp's memory even though tmp died
        let history = graph.get_resource("history").unwrap();
        for handle in history.texture.handles {
            assert!(stub.aliases.iter().all(|&(img, _)| img != handle.index()));
        }
    }

    #[test]
    fn disabled_nodes_drop_out_of_the_order() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(64, 64);

        for name in ["scene", "debug", "present"] {
            graph.add_pass(name, Box::new(NullPass)).unwrap();
        }

        graph
            .add_node("scene", false, &[], &[color_attachment("color")])
            .unwrap();
        graph
            .add_node("debug", false, &[], &[color_attachment("overlay")])
            .unwrap();
        graph
            .add_node(
                "present",
                false,
                &[ResourceInput::new("color", ResourceType::Texture)],
                &[],
            )
            .unwrap();

        graph.compile(&mut stub).unwrap();
        assert_eq!(graph.node_count(), 3);

        graph.enable_node("debug", false).unwrap();
        assert!(graph.has_changes());
        graph.compile(&mut stub).unwrap();

        assert_eq!(graph.node_count(), 2);
        assert!((0..graph.node_count()).all(|i| graph.node_at(i).name != "debug"));
    }

    #[test]
    fn consumer_of_a_disabled_producer_fails_compile() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(64, 64);

        for name in ["debug", "view"] {
            graph.add_pass(name, Box::new(NullPass)).unwrap();
        }

        graph
            .add_node("debug", false, &[], &[color_attachment("overlay")])
            .unwrap();
        graph
            .add_node(
                "view",
                false,
                &[ResourceInput::new("overlay", ResourceType::Texture)],
                &[],
            )
            .unwrap();

        graph.enable_node("debug", false).unwrap();
        assert_eq!(
            graph.compile(&mut stub).unwrap_err(),
            TormentaError::NOT_FOUND
        );
    }

    #[test]
    fn resize_rescales_only_auto_scaled_attachments() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(800, 600);

        for name in ["scene", "shadow"] {
            graph.add_pass(name, Box::new(NullPass)).unwrap();
        }

        graph
            .add_node("scene", false, &[], &[color_attachment("color")])
            .unwrap();
        graph
            .add_node(
                "shadow",
                false,
                &[],
                &[color_attachment("shadow-map").size(800, 600)],
            )
            .unwrap();

        graph.compile(&mut stub).unwrap();
        assert_eq!(graph.get_resource("color").unwrap().texture.width, 800);
        assert_eq!(graph.get_resource("shadow-map").unwrap().texture.width, 800);

        stub.swapchain = (1600, 1200);
        graph.resize(&mut stub, 800, 1600, 600, 1200).unwrap();
        graph.compile(&mut stub).unwrap();

        let color = graph.get_resource("color").unwrap();
        assert_eq!((color.texture.width, color.texture.height), (1600, 1200));

        let shadow = graph.get_resource("shadow-map").unwrap();
        assert_eq!((shadow.texture.width, shadow.texture.height), (800, 600));
    }

    #[test]
    fn resize_destroys_passes_and_framebuffers() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(320, 200);

        graph.add_pass("scene", Box::new(NullPass)).unwrap();
        graph
            .add_node("scene", false, &[], &[color_attachment("color")])
            .unwrap();

        graph.compile(&mut stub).unwrap();
        assert_eq!(stub.live_render_passes, 1);
        assert_eq!(stub.live_framebuffers, 1);

        graph.resize(&mut stub, 320, 640, 200, 400).unwrap();
        assert_eq!(stub.live_render_passes, 0);
        assert_eq!(stub.live_framebuffers, 0);

        stub.swapchain = (640, 400);
        graph.compile(&mut stub).unwrap();
        assert_eq!(stub.live_render_passes, 1);
        assert_eq!(stub.live_framebuffers, 1);
    }

    #[test]
    fn external_resources_are_never_allocated() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(128, 128);

        graph.add_pass("blit", Box::new(NullPass)).unwrap();

        // the external texture is created outside the graph
        let external = stub
            .create_graph_texture(
                TextureCreation::default()
                    .set_size(128, 128, 1)
                    .set_format(vk::Format::R8G8B8A8_UNORM, TextureType::D2),
            )
            .unwrap();
        let baseline = stub.textures.len();

        graph.add_texture("blue-noise", external);
        graph
            .add_node(
                "blit",
                false,
                &[ResourceInput::new("blue-noise", ResourceType::Texture)],
                &[
                    color_attachment("out"),
                    ResourceOutput::attachment("blue-noise", vk::Format::R8G8B8A8_UNORM)
                        .external(),
                ],
            )
            .unwrap();

        graph.compile(&mut stub).unwrap();

        // only "out" allocated
        assert_eq!(stub.textures.len(), baseline + 1);
        let noise = graph.get_resource("blue-noise").unwrap();
        assert_eq!(noise.texture.handles[0], external);
    }

    #[test]
    fn buffers_allocate_with_declared_shape() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(64, 64);

        for name in ["cull", "draw"] {
            graph.add_pass(name, Box::new(NullPass)).unwrap();
        }

        graph
            .add_node(
                "cull",
                true,
                &[],
                &[ResourceOutput::buffer("draw-commands", 4096, BufferUsage::INDIRECT).fill(0)],
            )
            .unwrap();
        graph
            .add_node(
                "draw",
                false,
                &[ResourceInput::new("draw-commands", ResourceType::Buffer)],
                &[color_attachment("color")],
            )
            .unwrap();

        graph.compile(&mut stub).unwrap();

        assert_eq!(graph.node_at(0).name, "cull");
        assert!(graph.node_at(0).compute);
        // compute nodes never get render passes
        assert!(!graph.node_at(0).render_pass.is_valid());
        assert!(graph
            .get_resource("draw-commands")
            .unwrap()
            .buffer
            .handle
            .is_valid());
    }

    #[test]
    fn dependency_chain_orders_before_declaration() {
        let mut graph = FrameGraph::new();
        let mut stub = StubResources::new(64, 64);

        for name in ["late", "early"] {
            graph.add_pass(name, Box::new(NullPass)).unwrap();
        }

        // declared consumer-first; compile must still run early first
        graph
            .add_node(
                "late",
                false,
                &[ResourceInput::new("mid", ResourceType::Texture)],
                &[],
            )
            .unwrap();
        graph
            .add_node("early", false, &[], &[color_attachment("mid")])
            .unwrap();

        graph.compile(&mut stub).unwrap();
        assert_eq!(graph.node_at(0).name, "early");
        assert_eq!(graph.node_at(1).name, "late");
    }
}
