//! Vulkan backend using Ash (feature-gated).
//!
//! Vulkan 1.3 with dynamic rendering, a timeline semaphore as the queue
//! completion counter and the geometry stage enabled for fins. Back buffers
//! are offscreen images; `read_texture` copies a presented one to the host.

use super::command::{Command, CommandStream};
use super::state::ResourceState;
use super::{
    BlendMode, BufferDesc, BufferId, BufferUsage, CommandListId, Format, GpuDevice, ProgramDesc, ProgramId,
    TextureDesc, TextureId, Timeline, Topology,
};
use crate::error::{PelageError, Result};
use crate::geometry::Vertex;
use ash::vk;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::path::Path;
use std::time::Duration;

const MAX_DESCRIPTOR_SETS: u32 = 64;

/// SPIR-V compiled from `assets/shaders` at build time, keyed by file name.
const EMBEDDED_SHADERS: &[(&str, &[u8])] = &[
    ("shell.vert.spv", include_bytes!(concat!(env!("OUT_DIR"), "/shell.vert.spv"))),
    ("shell.frag.spv", include_bytes!(concat!(env!("OUT_DIR"), "/shell.frag.spv"))),
    ("fin.vert.spv", include_bytes!(concat!(env!("OUT_DIR"), "/fin.vert.spv"))),
    ("fin.geom.spv", include_bytes!(concat!(env!("OUT_DIR"), "/fin.geom.spv"))),
    ("osm.frag.spv", include_bytes!(concat!(env!("OUT_DIR"), "/osm.frag.spv"))),
];

fn init_err(what: &'static str) -> impl Fn(vk::Result) -> PelageError {
    move |e| PelageError::Init(format!("{}: {:?}", what, e))
}

fn submit_err(what: &'static str) -> impl Fn(vk::Result) -> PelageError {
    move |e| PelageError::Submission(format!("{}: {:?}", what, e))
}

fn vk_format(f: Format) -> vk::Format {
    match f {
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::R32Float => vk::Format::R32_SFLOAT,
    }
}

/// Image layout, access and pipeline stage implied by a resource state.
/// Presentable images are offscreen and stay readable for host readback.
fn state_access(s: ResourceState) -> (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags) {
    match s {
        ResourceState::Undefined => (vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        ResourceState::RenderTarget => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ResourceState::ShaderReadable => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        ResourceState::ResolveSource | ResourceState::Presentable => {
            (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        ResourceState::ResolveDestination | ResourceState::CopyDestination => {
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        ResourceState::GenericRead => {
            (vk::ImageLayout::GENERAL, vk::AccessFlags::MEMORY_READ, vk::PipelineStageFlags::ALL_COMMANDS)
        }
    }
}

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

const COLOR_LAYERS: vk::ImageSubresourceLayers =
    vk::ImageSubresourceLayers { aspect_mask: vk::ImageAspectFlags::COLOR, mip_level: 0, base_array_layer: 0, layer_count: 1 };

struct VkBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    mapped: *mut u8,
}

struct VkTexture {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    desc: TextureDesc,
}

struct VkProgram {
    pipeline: vk::Pipeline,
    topology: Topology,
}

#[derive(Default)]
struct RecordState {
    targets: Vec<TextureId>,
    extent: (u32, u32),
    rendering: bool,
    pending_clears: HashMap<TextureId, [f32; 4]>,
    program: Option<ProgramId>,
    topology: Option<Topology>,
    vertex_buffer: Option<BufferId>,
    index_buffer: Option<BufferId>,
    uniforms: [Option<BufferId>; 2],
    density: Option<TextureId>,
    shadows: Vec<TextureId>,
}

pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    pdevice: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    timeline: vk::Semaphore,
    command_pool: vk::CommandPool,
    command_lists: Vec<vk::CommandBuffer>,
    buffers: Vec<VkBuffer>,
    textures: Vec<VkTexture>,
    programs: Vec<VkProgram>,
    wrap_sampler: vk::Sampler,
    clamp_sampler: vk::Sampler,
    frame_layout: vk::DescriptorSetLayout,
    shadow_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    descriptor_pool: vk::DescriptorPool,
    frame_sets: HashMap<(BufferId, BufferId, TextureId), vk::DescriptorSet>,
    shadow_sets: HashMap<Vec<TextureId>, vk::DescriptorSet>,
    shadow_slots: u32,
}

impl VulkanDevice {
    /// `shadow_slots` is the length of the shadow-map array the shaders sample.
    pub fn new(app_name: &str, shadow_slots: u32) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| PelageError::Init(format!("loading Vulkan: {}", e)))?;

        let app_name_c = CString::new(app_name).map_err(|e| PelageError::Init(e.to_string()))?;
        let engine_name_c = CString::new("pelage").map_err(|e| PelageError::Init(e.to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_c)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name_c)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);
        let instance_ci = vk::InstanceCreateInfo::builder().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&instance_ci, None) }.map_err(init_err("create_instance"))?;

        let pdevices = unsafe { instance.enumerate_physical_devices() }.map_err(init_err("enumerate_physical_devices"))?;
        let (pdevice, queue_family) = pdevices
            .iter()
            .find_map(|pd| {
                let features = unsafe { instance.get_physical_device_features(*pd) };
                if features.geometry_shader == vk::FALSE {
                    return None;
                }
                let families = unsafe { instance.get_physical_device_queue_family_properties(*pd) };
                families
                    .iter()
                    .enumerate()
                    .find(|(_, f)| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                    .map(|(idx, _)| (*pd, idx as u32))
            })
            .ok_or_else(|| PelageError::Init("no physical device with a graphics queue and geometry shaders".into()))?;

        let priorities = [1.0f32];
        let queue_ci = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];
        let features = vk::PhysicalDeviceFeatures::builder().geometry_shader(true);
        let mut v12 = vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);
        let mut v13 = vk::PhysicalDeviceVulkan13Features::builder().dynamic_rendering(true);
        let device_ci = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_ci)
            .enabled_features(&features)
            .push_next(&mut v12)
            .push_next(&mut v13);
        let device = unsafe { instance.create_device(pdevice, &device_ci, None) }.map_err(init_err("create_device"))?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let mut type_ci = vk::SemaphoreTypeCreateInfo::builder().semaphore_type(vk::SemaphoreType::TIMELINE).initial_value(0);
        let sem_ci = vk::SemaphoreCreateInfo::builder().push_next(&mut type_ci);
        let timeline = unsafe { device.create_semaphore(&sem_ci, None) }.map_err(init_err("timeline semaphore"))?;

        let pool_ci = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_ci, None) }.map_err(init_err("command pool"))?;

        let sampler = |mode: vk::SamplerAddressMode| {
            let ci = vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .address_mode_u(mode)
                .address_mode_v(mode)
                .address_mode_w(mode);
            unsafe { device.create_sampler(&ci, None) }.map_err(init_err("sampler"))
        };
        let wrap_sampler = sampler(vk::SamplerAddressMode::REPEAT)?;
        let clamp_sampler = sampler(vk::SamplerAddressMode::CLAMP_TO_EDGE)?;

        // set 0: frame params, fur params, density; set 1: shadow maps
        let frame_bindings = [
            vk::DescriptorSetLayoutBinding::builder().binding(0).descriptor_type(vk::DescriptorType::UNIFORM_BUFFER).descriptor_count(1).stage_flags(vk::ShaderStageFlags::ALL_GRAPHICS).build(),
            vk::DescriptorSetLayoutBinding::builder().binding(1).descriptor_type(vk::DescriptorType::UNIFORM_BUFFER).descriptor_count(1).stage_flags(vk::ShaderStageFlags::ALL_GRAPHICS).build(),
            vk::DescriptorSetLayoutBinding::builder().binding(2).descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER).descriptor_count(1).stage_flags(vk::ShaderStageFlags::ALL_GRAPHICS).build(),
        ];
        let shadow_bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(shadow_slots)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build()];
        let frame_layout = unsafe {
            device.create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::builder().bindings(&frame_bindings), None)
        }
        .map_err(init_err("frame set layout"))?;
        let shadow_layout = unsafe {
            device.create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::builder().bindings(&shadow_bindings), None)
        }
        .map_err(init_err("shadow set layout"))?;
        let set_layouts = [frame_layout, shadow_layout];
        let pipeline_layout = unsafe {
            device.create_pipeline_layout(&vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts), None)
        }
        .map_err(init_err("pipeline layout"))?;

        let pool_sizes = [
            vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: MAX_DESCRIPTOR_SETS * 2 },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: MAX_DESCRIPTOR_SETS * (1 + shadow_slots),
            },
        ];
        let dp_ci = vk::DescriptorPoolCreateInfo::builder().max_sets(MAX_DESCRIPTOR_SETS).pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe { device.create_descriptor_pool(&dp_ci, None) }.map_err(init_err("descriptor pool"))?;

        let dev = Self {
            _entry: entry,
            instance,
            pdevice,
            device,
            queue,
            queue_family,
            timeline,
            command_pool,
            command_lists: Vec::new(),
            buffers: Vec::new(),
            textures: Vec::new(),
            programs: Vec::new(),
            wrap_sampler,
            clamp_sampler,
            frame_layout,
            shadow_layout,
            pipeline_layout,
            descriptor_pool,
            frame_sets: HashMap::new(),
            shadow_sets: HashMap::new(),
            shadow_slots,
        };
        log::info!("vulkan device: {}", dev.device_name());
        Ok(dev)
    }

    pub fn device_name(&self) -> String {
        let props = unsafe { self.instance.get_physical_device_properties(self.pdevice) };
        let raw = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
        raw.to_string_lossy().into_owned()
    }

    fn find_memory_type(&self, type_bits: u32, props: vk::MemoryPropertyFlags) -> Result<u32> {
        let mem_props = unsafe { self.instance.get_physical_device_memory_properties(self.pdevice) };
        (0..mem_props.memory_type_count)
            .find(|&i| {
                (type_bits & (1 << i)) != 0 && mem_props.memory_types[i as usize].property_flags.contains(props)
            })
            .ok_or_else(|| PelageError::Init(format!("no memory type with {:?}", props)))
    }

    fn host_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<VkBuffer> {
        let size = size.max(4);
        let ci = vk::BufferCreateInfo::builder().size(size).usage(usage).sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&ci, None) }.map_err(init_err("create_buffer"))?;
        let req = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let mt = self.find_memory_type(
            req.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let ai = vk::MemoryAllocateInfo::builder().allocation_size(req.size).memory_type_index(mt);
        let memory = unsafe { self.device.allocate_memory(&ai, None) }.map_err(init_err("allocate_memory"))?;
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }.map_err(init_err("bind_buffer_memory"))?;
        let mapped = unsafe { self.device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
            .map_err(init_err("map_memory"))? as *mut u8;
        Ok(VkBuffer { buffer, memory, size, mapped })
    }

    fn buffer(&self, id: BufferId) -> Result<&VkBuffer> {
        self.buffers.get(id.0 as usize).ok_or_else(|| PelageError::UnknownResource(format!("{:?}", id)))
    }

    fn texture(&self, id: TextureId) -> Result<&VkTexture> {
        self.textures.get(id.0 as usize).ok_or_else(|| PelageError::UnknownResource(format!("{:?}", id)))
    }

    /// Files on disk win; otherwise fall back to the embedded module of the same name.
    fn shader_module(&self, path: &Path) -> Result<vk::ShaderModule> {
        let bytes = if path.exists() {
            std::fs::read(path).map_err(|e| PelageError::Init(format!("reading {}: {}", path.display(), e)))?
        } else {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            EMBEDDED_SHADERS
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, spv)| spv.to_vec())
                .ok_or_else(|| PelageError::Init(format!("shader {} not found", path.display())))?
        };
        let code = ash::util::read_spv(&mut std::io::Cursor::new(bytes))
            .map_err(|e| PelageError::Init(format!("{} is not SPIR-V: {}", path.display(), e)))?;
        let info = vk::ShaderModuleCreateInfo::builder().code(&code);
        unsafe { self.device.create_shader_module(&info, None) }.map_err(init_err("create_shader_module"))
    }

    /// Run a one-off command buffer and wait for the queue to go idle.
    fn one_shot<F: FnOnce(vk::CommandBuffer)>(&self, record: F) -> Result<()> {
        let alloc_ci = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cb = unsafe { self.device.allocate_command_buffers(&alloc_ci) }.map_err(submit_err("allocate_command_buffers"))?[0];
        let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let result = unsafe {
            self.device
                .begin_command_buffer(cb, &begin)
                .and_then(|_| {
                    record(cb);
                    self.device.end_command_buffer(cb)
                })
                .and_then(|_| {
                    let submit = vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&cb));
                    self.device.queue_submit(self.queue, std::slice::from_ref(&submit), vk::Fence::null())
                })
                .and_then(|_| self.device.queue_wait_idle(self.queue))
        };
        unsafe { self.device.free_command_buffers(self.command_pool, std::slice::from_ref(&cb)) };
        result.map_err(submit_err("one-shot submit"))
    }

    /// Copy a single-sampled texture in the `Presentable` state to host memory
    /// (tightly packed rows).
    pub fn read_texture(&mut self, id: TextureId) -> Result<Vec<u8>> {
        let (image, width, height, bpp) = {
            let t = self.texture(id)?;
            (t.image, t.desc.width, t.desc.height, t.desc.format.bytes_per_texel())
        };
        let size = width as u64 * height as u64 * bpp as u64;
        let staging = self.host_buffer(size, vk::BufferUsageFlags::TRANSFER_DST)?;
        let region = vk::BufferImageCopy::builder()
            .image_subresource(COLOR_LAYERS)
            .image_extent(vk::Extent3D { width, height, depth: 1 })
            .build();
        let copied = self.one_shot(|cb| unsafe {
            self.device.cmd_copy_image_to_buffer(
                cb,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                staging.buffer,
                std::slice::from_ref(&region),
            );
        });
        let mut pixels = vec![0u8; size as usize];
        if copied.is_ok() {
            unsafe { std::ptr::copy_nonoverlapping(staging.mapped, pixels.as_mut_ptr(), pixels.len()) };
        }
        unsafe {
            self.device.unmap_memory(staging.memory);
            self.device.destroy_buffer(staging.buffer, None);
            self.device.free_memory(staging.memory, None);
        }
        copied.map(|_| pixels)
    }

    fn frame_set(&mut self, key: (BufferId, BufferId, TextureId)) -> Result<vk::DescriptorSet> {
        if let Some(set) = self.frame_sets.get(&key) {
            return Ok(*set);
        }
        let (frame, fur, density) = key;
        let frame_info =
            vk::DescriptorBufferInfo { buffer: self.buffer(frame)?.buffer, offset: 0, range: vk::WHOLE_SIZE };
        let fur_info = vk::DescriptorBufferInfo { buffer: self.buffer(fur)?.buffer, offset: 0, range: vk::WHOLE_SIZE };
        let density_info = vk::DescriptorImageInfo {
            sampler: self.wrap_sampler,
            image_view: self.texture(density)?.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let set = self.allocate_set(self.frame_layout)?;
        let writes = [
            vk::WriteDescriptorSet::builder().dst_set(set).dst_binding(0).descriptor_type(vk::DescriptorType::UNIFORM_BUFFER).buffer_info(std::slice::from_ref(&frame_info)).build(),
            vk::WriteDescriptorSet::builder().dst_set(set).dst_binding(1).descriptor_type(vk::DescriptorType::UNIFORM_BUFFER).buffer_info(std::slice::from_ref(&fur_info)).build(),
            vk::WriteDescriptorSet::builder().dst_set(set).dst_binding(2).descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER).image_info(std::slice::from_ref(&density_info)).build(),
        ];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
        self.frame_sets.insert(key, set);
        Ok(set)
    }

    fn shadow_set(&mut self, shadows: &[TextureId]) -> Result<vk::DescriptorSet> {
        if let Some(set) = self.shadow_sets.get(shadows) {
            return Ok(*set);
        }
        if shadows.len() != self.shadow_slots as usize {
            return Err(PelageError::Submission(format!(
                "{} shadow maps bound, layout expects {}",
                shadows.len(),
                self.shadow_slots
            )));
        }
        let infos = shadows
            .iter()
            .map(|&t| {
                Ok(vk::DescriptorImageInfo {
                    sampler: self.clamp_sampler,
                    image_view: self.texture(t)?.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let set = self.allocate_set(self.shadow_layout)?;
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&infos)
            .build();
        unsafe { self.device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
        self.shadow_sets.insert(shadows.to_vec(), set);
        Ok(set)
    }

    fn allocate_set(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let alloc_info =
            vk::DescriptorSetAllocateInfo::builder().descriptor_pool(self.descriptor_pool).set_layouts(std::slice::from_ref(&layout));
        Ok(unsafe { self.device.allocate_descriptor_sets(&alloc_info) }.map_err(submit_err("allocate_descriptor_sets"))?[0])
    }

    fn begin_pass(&self, cb: vk::CommandBuffer, st: &mut RecordState) -> Result<()> {
        let attachments = st
            .targets
            .iter()
            .map(|t| {
                let view = self.texture(*t)?.view;
                let info = vk::RenderingAttachmentInfo::builder()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .store_op(vk::AttachmentStoreOp::STORE);
                Ok(match st.pending_clears.remove(t) {
                    Some(color) => info
                        .load_op(vk::AttachmentLoadOp::CLEAR)
                        .clear_value(vk::ClearValue { color: vk::ClearColorValue { float32: color } })
                        .build(),
                    None => info.load_op(vk::AttachmentLoadOp::LOAD).build(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let (width, height) = st.extent;
        let area = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: vk::Extent2D { width, height } };
        let render_info = vk::RenderingInfo::builder().render_area(area).layer_count(1).color_attachments(&attachments);
        // Negative height keeps the y-up clip space of the projection matrices.
        let viewport = vk::Viewport {
            x: 0.0,
            y: height as f32,
            width: width as f32,
            height: -(height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device.cmd_begin_rendering(cb, &render_info);
            self.device.cmd_set_viewport(cb, 0, std::slice::from_ref(&viewport));
            self.device.cmd_set_scissor(cb, 0, std::slice::from_ref(&area));
        }
        st.rendering = true;
        Ok(())
    }

    /// Close the current pass. Clears that never saw a draw still get applied.
    fn end_pass(&self, cb: vk::CommandBuffer, st: &mut RecordState) -> Result<()> {
        if !st.rendering && st.targets.iter().any(|t| st.pending_clears.contains_key(t)) {
            self.begin_pass(cb, st)?;
        }
        if st.rendering {
            unsafe { self.device.cmd_end_rendering(cb) };
            st.rendering = false;
        }
        Ok(())
    }

    fn record_barrier(&self, cb: vk::CommandBuffer, transitions: &[super::Transition]) -> Result<()> {
        let mut src_stage = vk::PipelineStageFlags::empty();
        let mut dst_stage = vk::PipelineStageFlags::empty();
        let barriers = transitions
            .iter()
            .map(|t| {
                let (old_layout, src_access, src) = state_access(t.from);
                let (new_layout, dst_access, dst) = state_access(t.to);
                src_stage |= src;
                dst_stage |= dst;
                Ok(vk::ImageMemoryBarrier::builder()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .old_layout(old_layout)
                    .new_layout(new_layout)
                    .image(self.texture(t.texture)?.image)
                    .subresource_range(COLOR_RANGE)
                    .build())
            })
            .collect::<Result<Vec<_>>>()?;
        unsafe {
            self.device.cmd_pipeline_barrier(cb, src_stage, dst_stage, vk::DependencyFlags::empty(), &[], &[], &barriers);
        }
        Ok(())
    }

    fn record_draw(&mut self, cb: vk::CommandBuffer, st: &mut RecordState, index_count: u32, instance_count: u32) -> Result<()> {
        let program_id = st.program.ok_or_else(|| PelageError::Submission("draw without a program".into()))?;
        let program = self
            .programs
            .get(program_id.0 as usize)
            .ok_or_else(|| PelageError::UnknownResource(format!("{:?}", program_id)))?;
        let pipeline = program.pipeline;
        if st.topology != Some(program.topology) {
            return Err(PelageError::Submission(format!(
                "topology {:?} does not match program topology {:?}",
                st.topology, program.topology
            )));
        }
        let missing = || PelageError::Submission("draw with frame params, fur params or density unbound".into());
        let key = (st.uniforms[0].ok_or_else(missing)?, st.uniforms[1].ok_or_else(missing)?, st.density.ok_or_else(missing)?);
        let mut sets = vec![self.frame_set(key)?];
        if !st.shadows.is_empty() {
            let shadows = st.shadows.clone();
            sets.push(self.shadow_set(&shadows)?);
        }
        let vb = self.buffer(st.vertex_buffer.ok_or_else(|| PelageError::Submission("no vertex buffer".into()))?)?.buffer;
        let ib = self.buffer(st.index_buffer.ok_or_else(|| PelageError::Submission("no index buffer".into()))?)?.buffer;

        if !st.rendering {
            self.begin_pass(cb, st)?;
        }
        unsafe {
            self.device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline);
            self.device.cmd_bind_descriptor_sets(cb, vk::PipelineBindPoint::GRAPHICS, self.pipeline_layout, 0, &sets, &[]);
            self.device.cmd_bind_vertex_buffers(cb, 0, &[vb], &[0]);
            self.device.cmd_bind_index_buffer(cb, ib, 0, vk::IndexType::UINT32);
            self.device.cmd_draw_indexed(cb, index_count, instance_count, 0, 0, 0);
        }
        Ok(())
    }

    fn record_resolve(&self, cb: vk::CommandBuffer, src: TextureId, dst: TextureId) -> Result<()> {
        let s = self.texture(src)?;
        let d = self.texture(dst)?;
        let extent = vk::Extent3D { width: d.desc.width, height: d.desc.height, depth: 1 };
        let origin = vk::Offset3D { x: 0, y: 0, z: 0 };
        unsafe {
            if s.desc.samples > 1 {
                let region = vk::ImageResolve {
                    src_subresource: COLOR_LAYERS,
                    src_offset: origin,
                    dst_subresource: COLOR_LAYERS,
                    dst_offset: origin,
                    extent,
                };
                self.device.cmd_resolve_image(
                    cb,
                    s.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    d.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&region),
                );
            } else {
                let region = vk::ImageCopy {
                    src_subresource: COLOR_LAYERS,
                    src_offset: origin,
                    dst_subresource: COLOR_LAYERS,
                    dst_offset: origin,
                    extent,
                };
                self.device.cmd_copy_image(
                    cb,
                    s.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    d.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&region),
                );
            }
        }
        Ok(())
    }

    fn record_stream(&mut self, cb: vk::CommandBuffer, stream: &CommandStream) -> Result<()> {
        let mut st = RecordState::default();
        for cmd in &stream.commands {
            match cmd {
                Command::Barrier(ts) => {
                    self.end_pass(cb, &mut st)?;
                    self.record_barrier(cb, ts)?;
                }
                Command::ClearColor { target, color } => {
                    if st.rendering && st.targets.contains(target) {
                        self.end_pass(cb, &mut st)?;
                    }
                    st.pending_clears.insert(*target, *color);
                }
                Command::SetRenderTargets { targets, width, height } => {
                    self.end_pass(cb, &mut st)?;
                    st.targets = targets.clone();
                    st.extent = (*width, *height);
                }
                Command::BindProgram(p) => st.program = Some(*p),
                Command::SetTopology(t) => st.topology = Some(*t),
                Command::BindVertexBuffer(b) => st.vertex_buffer = Some(*b),
                Command::BindIndexBuffer(b) => st.index_buffer = Some(*b),
                Command::BindUniform { slot, buffer } => match st.uniforms.get_mut(*slot as usize) {
                    Some(u) => *u = Some(*buffer),
                    None => return Err(PelageError::Submission(format!("no uniform slot {}", slot))),
                },
                Command::BindTextures { slot, textures } => match slot {
                    2 => st.density = textures.first().copied(),
                    3 => st.shadows = textures.clone(),
                    _ => return Err(PelageError::Submission(format!("no texture slot {}", slot))),
                },
                Command::DrawIndexed { index_count, instance_count } => {
                    self.record_draw(cb, &mut st, *index_count, *instance_count)?
                }
                Command::Resolve { src, dst } => {
                    self.end_pass(cb, &mut st)?;
                    self.record_resolve(cb, *src, *dst)?;
                }
                Command::CopyBufferToTexture { src, dst } => {
                    self.end_pass(cb, &mut st)?;
                    let buffer = self.buffer(*src)?.buffer;
                    let t = self.texture(*dst)?;
                    let region = vk::BufferImageCopy::builder()
                        .image_subresource(COLOR_LAYERS)
                        .image_extent(vk::Extent3D { width: t.desc.width, height: t.desc.height, depth: 1 })
                        .build();
                    unsafe {
                        self.device.cmd_copy_buffer_to_image(
                            cb,
                            buffer,
                            t.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            std::slice::from_ref(&region),
                        );
                    }
                }
            }
        }
        self.end_pass(cb, &mut st)
    }
}

impl GpuDevice for VulkanDevice {
    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<BufferId> {
        let usage = match desc.usage {
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Upload => vk::BufferUsageFlags::TRANSFER_SRC,
        };
        let buf = self.host_buffer(desc.size, usage)?;
        if let Some(src) = contents {
            if src.len() as u64 > buf.size {
                return Err(PelageError::Init(format!("{}: contents larger than buffer", desc.label)));
            }
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), buf.mapped, src.len()) };
        }
        log::debug!("buffer {} ({} bytes, {:?})", desc.label, desc.size, desc.usage);
        self.buffers.push(buf);
        Ok(BufferId(self.buffers.len() as u32 - 1))
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let b = self.buffer(buffer)?;
        if offset + data.len() as u64 > b.size {
            return Err(PelageError::Submission(format!("write past the end of {:?}", buffer)));
        }
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), b.mapped.add(offset as usize), data.len()) };
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId> {
        let mut usage = vk::ImageUsageFlags::empty();
        if desc.usage.render_target {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if desc.usage.sampled {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if desc.usage.resolve_src {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if desc.usage.resolve_dst {
            // presented images are read back from the same layout
            usage |= vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if desc.usage.copy_dst {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        let format = vk_format(desc.format);
        let image_ci = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::from_raw(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_ci, None) }.map_err(init_err("create_image"))?;
        let req = unsafe { self.device.get_image_memory_requirements(image) };
        let mt = self.find_memory_type(req.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        let alloc = vk::MemoryAllocateInfo::builder().allocation_size(req.size).memory_type_index(mt);
        let memory = unsafe { self.device.allocate_memory(&alloc, None) }.map_err(init_err("allocate_memory"))?;
        unsafe { self.device.bind_image_memory(image, memory, 0) }.map_err(init_err("bind_image_memory"))?;
        let view_ci = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(COLOR_RANGE);
        let view = unsafe { self.device.create_image_view(&view_ci, None) }.map_err(init_err("create_image_view"))?;

        if desc.initial_state != ResourceState::Undefined {
            let (layout, access, stage) = state_access(desc.initial_state);
            let barrier = vk::ImageMemoryBarrier::builder()
                .dst_access_mask(access)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(layout)
                .image(image)
                .subresource_range(COLOR_RANGE)
                .build();
            self.one_shot(|cb| unsafe {
                self.device.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    std::slice::from_ref(&barrier),
                );
            })?;
        }

        log::debug!("texture {} {}x{} {:?} x{}", desc.label, desc.width, desc.height, desc.format, desc.samples);
        self.textures.push(VkTexture { image, memory, view, desc: desc.clone() });
        Ok(TextureId(self.textures.len() as u32 - 1))
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId> {
        let entry = CStr::from_bytes_with_nul(b"main\0").map_err(|e| PelageError::Init(e.to_string()))?;
        let mut modules = vec![(vk::ShaderStageFlags::VERTEX, self.shader_module(&desc.vertex_shader)?)];
        if let Some(gs) = &desc.geometry_shader {
            modules.push((vk::ShaderStageFlags::GEOMETRY, self.shader_module(gs)?));
        }
        modules.push((vk::ShaderStageFlags::FRAGMENT, self.shader_module(&desc.fragment_shader)?));
        let stages: Vec<_> = modules
            .iter()
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::builder().stage(*stage).module(*module).name(entry).build()
            })
            .collect();

        let vb_binding = vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(Vertex::STRIDE)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build();
        let attrs = [
            vk::VertexInputAttributeDescription::builder().location(0).binding(0).format(vk::Format::R32G32B32_SFLOAT).offset(0).build(),
            vk::VertexInputAttributeDescription::builder().location(1).binding(0).format(vk::Format::R32G32B32_SFLOAT).offset(Vertex::NORMAL_OFFSET).build(),
            vk::VertexInputAttributeDescription::builder().location(2).binding(0).format(vk::Format::R32G32_SFLOAT).offset(Vertex::UV_OFFSET).build(),
        ];
        let vi = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(std::slice::from_ref(&vb_binding))
            .vertex_attribute_descriptions(&attrs);
        let topology = match desc.topology {
            Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Topology::TriangleListAdjacency => vk::PrimitiveTopology::TRIANGLE_LIST_WITH_ADJACENCY,
        };
        let ia = vk::PipelineInputAssemblyStateCreateInfo::builder().topology(topology);
        let vp = vk::PipelineViewportStateCreateInfo::builder().viewport_count(1).scissor_count(1);
        let rs = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(if desc.cull_back { vk::CullModeFlags::BACK } else { vk::CullModeFlags::NONE })
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);
        let ms = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::from_raw(desc.sample_count))
            .alpha_to_coverage_enable(desc.alpha_to_coverage);
        let cb_mask = vk::ColorComponentFlags::R | vk::ColorComponentFlags::G | vk::ColorComponentFlags::B | vk::ColorComponentFlags::A;
        let blend = match desc.blend {
            BlendMode::Opaque => vk::PipelineColorBlendAttachmentState::builder().color_write_mask(cb_mask).blend_enable(false).build(),
            BlendMode::Additive => vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(cb_mask)
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
        };
        let blends = vec![blend; desc.color_formats.len()];
        let cb_state = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blends);
        let ds = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(false)
            .depth_write_enable(desc.depth_write);
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dyn_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dyn_states);
        let formats: Vec<vk::Format> = desc.color_formats.iter().map(|f| vk_format(*f)).collect();
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder().color_attachment_formats(&formats);

        let pci = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vi)
            .input_assembly_state(&ia)
            .viewport_state(&vp)
            .rasterization_state(&rs)
            .multisample_state(&ms)
            .depth_stencil_state(&ds)
            .color_blend_state(&cb_state)
            .dynamic_state(&dyn_state)
            .layout(self.pipeline_layout)
            .push_next(&mut rendering_info);
        let created = unsafe {
            self.device.create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&pci), None)
        };
        for (_, module) in &modules {
            unsafe { self.device.destroy_shader_module(*module, None) };
        }
        let pipeline = created.map_err(|(_, e)| PelageError::Init(format!("{} pipeline: {:?}", desc.label, e)))?[0];

        log::debug!("program {} ({:?}, x{} samples)", desc.label, desc.topology, desc.sample_count);
        self.programs.push(VkProgram { pipeline, topology: desc.topology });
        Ok(ProgramId(self.programs.len() as u32 - 1))
    }

    fn create_command_list(&mut self) -> Result<CommandListId> {
        let alloc_ci = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cb = unsafe { self.device.allocate_command_buffers(&alloc_ci) }.map_err(init_err("allocate_command_buffers"))?[0];
        self.command_lists.push(cb);
        Ok(CommandListId(self.command_lists.len() as u32 - 1))
    }

    fn submit(&mut self, list: CommandListId, stream: &CommandStream) -> Result<()> {
        let cb = *self
            .command_lists
            .get(list.0 as usize)
            .ok_or_else(|| PelageError::UnknownResource(format!("{:?}", list)))?;
        unsafe {
            self.device
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .map_err(submit_err("reset_command_buffer"))?;
            let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cb, &begin).map_err(submit_err("begin_command_buffer"))?;
        }
        let recorded = self.record_stream(cb, stream);
        unsafe { self.device.end_command_buffer(cb) }.map_err(submit_err("end_command_buffer"))?;
        recorded?;
        let submit = vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&cb));
        unsafe { self.device.queue_submit(self.queue, std::slice::from_ref(&submit), vk::Fence::null()) }
            .map_err(submit_err("queue_submit"))?;
        log::trace!("submitted {} ({} commands)", stream.label, stream.commands.len());
        Ok(())
    }

    fn present(&mut self, back_buffer: TextureId) -> Result<()> {
        // Offscreen: the image simply stays in its presentable layout.
        self.texture(back_buffer).map(|_| ())
    }
}

impl Timeline for VulkanDevice {
    fn signal(&mut self, value: u64) -> Result<()> {
        let values = [value];
        let semaphores = [self.timeline];
        let mut ts = vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::builder().signal_semaphores(&semaphores).push_next(&mut ts);
        unsafe { self.device.queue_submit(self.queue, std::slice::from_ref(&submit), vk::Fence::null()) }
            .map_err(submit_err("timeline signal"))
    }

    fn completed_value(&self) -> Result<u64> {
        unsafe { self.device.get_semaphore_counter_value(self.timeline) }.map_err(submit_err("timeline value"))
    }

    fn wait(&mut self, value: u64, timeout: Duration) -> Result<()> {
        let values = [value];
        let semaphores = [self.timeline];
        let info = vk::SemaphoreWaitInfo::builder().semaphores(&semaphores).values(&values);
        match unsafe { self.device.wait_semaphores(&info, timeout.as_nanos() as u64) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                Err(PelageError::SyncTimeout { value, completed: self.completed_value().unwrap_or(0) })
            }
            Err(e) => Err(PelageError::Submission(format!("timeline wait: {:?}", e))),
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            for p in &self.programs {
                self.device.destroy_pipeline(p.pipeline, None);
            }
            for t in &self.textures {
                self.device.destroy_image_view(t.view, None);
                self.device.destroy_image(t.image, None);
                self.device.free_memory(t.memory, None);
            }
            for b in &self.buffers {
                self.device.unmap_memory(b.memory);
                self.device.destroy_buffer(b.buffer, None);
                self.device.free_memory(b.memory, None);
            }
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device.destroy_descriptor_set_layout(self.frame_layout, None);
            self.device.destroy_descriptor_set_layout(self.shadow_layout, None);
            self.device.destroy_sampler(self.wrap_sampler, None);
            self.device.destroy_sampler(self.clamp_sampler, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_semaphore(self.timeline, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Names and API versions of every physical device.
pub fn enumerate_devices() -> Result<Vec<String>> {
    let entry = unsafe { ash::Entry::load() }.map_err(|e| PelageError::Init(format!("loading Vulkan: {}", e)))?;
    let app_name_c = CString::new("pelage-enum").map_err(|e| PelageError::Init(e.to_string()))?;
    let app_info = vk::ApplicationInfo::builder().application_name(&app_name_c).api_version(vk::API_VERSION_1_3);
    let instance_ci = vk::InstanceCreateInfo::builder().application_info(&app_info);
    let instance = unsafe { entry.create_instance(&instance_ci, None) }.map_err(init_err("create_instance"))?;
    let mut out = Vec::new();
    for pd in unsafe { instance.enumerate_physical_devices() }.map_err(init_err("enumerate_physical_devices"))? {
        let props = unsafe { instance.get_physical_device_properties(pd) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy().into_owned();
        out.push(format!(
            "{} (API {}.{}.{})",
            name,
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version),
            vk::api_version_patch(props.api_version)
        ));
    }
    unsafe { instance.destroy_instance(None) };
    Ok(out)
}
