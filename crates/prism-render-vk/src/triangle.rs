// SPDX-License-Identifier: CEPL-1.0
//! Fixed colored triangle drawn with a dynamic-rendering pipeline.

use std::io::Cursor;

use ash::util::read_spv;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{PresentError, PresentResult, VkResultExt};
use crate::instance::InstanceContext;
use crate::scene::{RecordContext, SceneRenderer};

const ENTRY: &std::ffi::CStr = c"main";

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Vertex {
    pos: [f32; 2],
    color: [f32; 3],
}

const VERTICES: [Vertex; 3] = [
    Vertex {
        pos: [0.0, -0.5],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        pos: [0.5, 0.5],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        pos: [-0.5, 0.5],
        color: [0.0, 0.0, 1.0],
    },
];

const INDICES: [u32; 3] = [0, 1, 2];

/// Vertices first, indices right after.
fn geometry_bytes() -> (Vec<u8>, vk::DeviceSize) {
    let mut bytes = bytemuck::cast_slice::<Vertex, u8>(&VERTICES).to_vec();
    let index_offset = bytes.len() as vk::DeviceSize;
    bytes.extend_from_slice(bytemuck::cast_slice(&INDICES));
    (bytes, index_offset)
}

fn find_memory_type(
    mem: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    req: vk::MemoryPropertyFlags,
) -> PresentResult<u32> {
    (0..mem.memory_type_count)
        .find(|&i| {
            (type_bits & (1 << i)) != 0 && mem.memory_types[i as usize].property_flags.contains(req)
        })
        .ok_or(PresentError::NoCompatibleMemoryType(req))
}

pub struct TriangleScene {
    device: ash::Device,
    cache: vk::PipelineCache,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    format: vk::Format,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    index_offset: vk::DeviceSize,
}

impl Drop for TriangleScene {
    fn drop(&mut self) {
        unsafe {
            let d = &self.device;
            if self.pipeline != vk::Pipeline::null() {
                d.destroy_pipeline(self.pipeline, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                d.destroy_pipeline_layout(self.layout, None);
            }
            if self.cache != vk::PipelineCache::null() {
                d.destroy_pipeline_cache(self.cache, None);
            }
            if self.buffer != vk::Buffer::null() {
                d.destroy_buffer(self.buffer, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                d.free_memory(self.memory, None);
            }
        }
    }
}

impl TriangleScene {
    pub unsafe fn new(
        ctx: &InstanceContext,
        device: &Device,
        format: vk::Format,
    ) -> PresentResult<Self> {
        let d = device.handle();
        // Null handles until each step succeeds; Drop skips them.
        let mut scene = Self {
            device: d.clone(),
            cache: vk::PipelineCache::null(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            format,
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            index_offset: 0,
        };

        let cache_ci = vk::PipelineCacheCreateInfo {
            s_type: vk::StructureType::PIPELINE_CACHE_CREATE_INFO,
            ..Default::default()
        };
        scene.cache = unsafe { d.create_pipeline_cache(&cache_ci, None) }
            .call("create_pipeline_cache")?;

        let layout_ci = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            ..Default::default()
        };
        scene.layout = unsafe { d.create_pipeline_layout(&layout_ci, None) }
            .call("create_pipeline_layout")?;

        let mem_props = unsafe {
            ctx.instance
                .get_physical_device_memory_properties(device.phys)
        };
        unsafe { scene.upload_geometry(&mem_props) }?;

        scene.pipeline = unsafe { create_pipeline(d, scene.cache, scene.layout, format) }?;
        info!("triangle: pipeline ready for {format:?}");
        Ok(scene)
    }

    unsafe fn upload_geometry(
        &mut self,
        mem_props: &vk::PhysicalDeviceMemoryProperties,
    ) -> PresentResult<()> {
        let d = &self.device;
        let (bytes, index_offset) = geometry_bytes();
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size: bytes.len() as vk::DeviceSize,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        self.buffer = unsafe { d.create_buffer(&bci, None) }.call("create_buffer")?;

        let req = unsafe { d.get_buffer_memory_requirements(self.buffer) };
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: find_memory_type(mem_props, req.memory_type_bits, wanted)?,
            ..Default::default()
        };
        self.memory = unsafe { d.allocate_memory(&mai, None) }.call("allocate_memory")?;
        unsafe { d.bind_buffer_memory(self.buffer, self.memory, 0) }.call("bind_buffer_memory")?;

        unsafe {
            let ptr = d
                .map_memory(self.memory, 0, req.size, vk::MemoryMapFlags::empty())
                .call("map_memory")?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            d.unmap_memory(self.memory);
        }
        self.index_offset = index_offset;
        debug!("triangle: {} bytes of geometry uploaded", bytes.len());
        Ok(())
    }
}

impl SceneRenderer for TriangleScene {
    fn name(&self) -> &'static str {
        "triangle"
    }

    fn record(&mut self, ctx: &RecordContext<'_>) -> PresentResult<()> {
        let d = ctx.device;
        unsafe {
            d.cmd_bind_pipeline(ctx.cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            d.cmd_bind_vertex_buffers(ctx.cmd, 0, &[self.buffer], &[0]);
            d.cmd_bind_index_buffer(ctx.cmd, self.buffer, self.index_offset, vk::IndexType::UINT32);
            d.cmd_draw_indexed(ctx.cmd, INDICES.len() as u32, 1, 0, 0, 0);
        }
        Ok(())
    }

    // The pipeline bakes in the attachment format; extent changes never
    // reach here.
    fn color_format_changed(&mut self, format: vk::Format) -> PresentResult<()> {
        if format == self.format {
            return Ok(());
        }
        let pipeline = unsafe { create_pipeline(&self.device, self.cache, self.layout, format) }?;
        unsafe { self.device.destroy_pipeline(self.pipeline, None) };
        self.pipeline = pipeline;
        self.format = format;
        info!("triangle: pipeline rebuilt for {format:?}");
        Ok(())
    }
}

unsafe fn shader_module(device: &ash::Device, spv: &[u8]) -> PresentResult<vk::ShaderModule> {
    let code = read_spv(&mut Cursor::new(spv)).map_err(PresentError::Spirv)?;
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    unsafe { device.create_shader_module(&ci, None) }.call("create_shader_module")
}

unsafe fn create_pipeline(
    device: &ash::Device,
    cache: vk::PipelineCache,
    layout: vk::PipelineLayout,
    color_format: vk::Format,
) -> PresentResult<vk::Pipeline> {
    let vs_bytes = include_bytes!(concat!(env!("OUT_DIR"), "/tri.vert.spv"));
    let fs_bytes = include_bytes!(concat!(env!("OUT_DIR"), "/tri.frag.spv"));
    let vs = unsafe { shader_module(device, vs_bytes) }?;
    let fs = match unsafe { shader_module(device, fs_bytes) } {
        Ok(fs) => fs,
        Err(e) => {
            unsafe { device.destroy_shader_module(vs, None) };
            return Err(e);
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: ENTRY.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: ENTRY.as_ptr(),
            ..Default::default()
        },
    ];

    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: std::mem::size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let attributes = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: 0,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: std::mem::offset_of!(Vertex, color) as u32,
        },
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &binding,
        vertex_attribute_description_count: attributes.len() as u32,
        p_vertex_attribute_descriptions: attributes.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::NONE,
        front_face: vk::FrontFace::CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::R
            | vk::ColorComponentFlags::G
            | vk::ColorComponentFlags::B
            | vk::ColorComponentFlags::A,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };
    let rendering = vk::PipelineRenderingCreateInfo {
        s_type: vk::StructureType::PIPELINE_RENDERING_CREATE_INFO,
        color_attachment_count: 1,
        p_color_attachment_formats: &color_format,
        ..Default::default()
    };
    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        p_next: (&rendering as *const vk::PipelineRenderingCreateInfo).cast(),
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        ..Default::default()
    };

    let created = unsafe {
        device.create_graphics_pipelines(cache, std::slice::from_ref(&pipeline_info), None)
    };
    unsafe {
        device.destroy_shader_module(vs, None);
        device.destroy_shader_module(fs, None);
    }
    match created {
        Ok(pipelines) => Ok(pipelines[0]),
        Err((_, result)) => Err(PresentError::Vulkan {
            call: "create_graphics_pipelines",
            result,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_is_three_vertices_then_three_indices() {
        let (bytes, index_offset) = geometry_bytes();
        assert_eq!(index_offset as usize, 3 * std::mem::size_of::<Vertex>());
        assert_eq!(bytes.len(), index_offset as usize + 3 * 4);
        let indices: &[u32] = bytemuck::cast_slice(&bytes[index_offset as usize..]);
        assert_eq!(indices, &[0, 1, 2]);
    }

    #[test]
    fn memory_type_must_match_bits_and_flags() {
        let mut mem = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            ..Default::default()
        };
        mem.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        mem.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(find_memory_type(&mem, 0b11, wanted).unwrap(), 1);
        assert!(matches!(
            find_memory_type(&mem, 0b01, wanted),
            Err(PresentError::NoCompatibleMemoryType(_))
        ));
    }
}
