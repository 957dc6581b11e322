use std::borrow::Cow;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use wgpu::naga::ShaderStage;
use wgpu::util::DeviceExt;

use crate::error::GpuError;
use crate::types::FramePixels;

use super::registry::Registry;
use super::{
    ContextHandle, GpuApi, GpuStats, NativeSurface, PresentedFrame, ProgramHandle, ProgramParams,
    ProgramVariant, QuadDraw, SurfaceHandle, TextureHandle,
};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Uniform block shared by the vertex and fragment stages. Layout must match
/// `FilterParams` in the GLSL below (std140).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FilterUniforms {
    tex_matrix: [f32; 16],
    kernel: [[f32; 4]; 3],
    tex_offset: [[f32; 4]; 5],
    color_adjust: [f32; 4],
}

impl FilterUniforms {
    fn new(matrix: &[f32; 16], params: &ProgramParams) -> Self {
        let mut kernel = [[0.0; 4]; 3];
        for (index, value) in params.kernel.iter().enumerate() {
            kernel[index / 4][index % 4] = *value;
        }
        let mut tex_offset = [[0.0; 4]; 5];
        for (index, value) in params.tex_offset.iter().enumerate() {
            tex_offset[index / 4][index % 4] = *value;
        }
        Self {
            tex_matrix: *matrix,
            kernel,
            tex_offset,
            color_adjust: [params.color_adjust, 0.0, 0.0, 0.0],
        }
    }
}

struct ExternalTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

struct RenderTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

type WgpuRegistry = Registry<ExternalTexture, wgpu::RenderPipeline, RenderTarget>;

/// Headless `wgpu` backend.
///
/// Every context shares the one logical device, so share groups are enforced
/// by the registry rather than by the driver. Surfaces are offscreen targets
/// read back to their consumer on swap.
pub struct WgpuGpu {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    vertex_module: wgpu::ShaderModule,
    sampler: wgpu::Sampler,
    registry: Mutex<WgpuRegistry>,
}

impl WgpuGpu {
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .context("failed to find a suitable GPU adapter")?;

        let info = adapter.get_info();
        tracing::debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            "selected GPU adapter"
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("camrec device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .context("failed to create GPU device")?;

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("filter layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("filter pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("full frame vertex"),
            source: wgpu::ShaderSource::Glsl {
                shader: Cow::Borrowed(VERTEX_SHADER_GLSL),
                stage: ShaderStage::Vertex,
                defines: &[],
            },
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("external texture sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Ok(Self {
            device,
            queue,
            bind_group_layout,
            pipeline_layout,
            vertex_module,
            sampler,
            registry: Mutex::new(Registry::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WgpuRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_target(&self, width: u32, height: u32) -> RenderTarget {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("surface target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        RenderTarget { texture, view }
    }

    fn create_external(&self, width: u32, height: u32) -> ExternalTexture {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("external texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        ExternalTexture {
            texture,
            view,
            width,
            height,
        }
    }

    fn upload(&self, target: &ExternalTexture, frame: &FramePixels) {
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &frame.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(frame.width * 4),
                rows_per_image: Some(frame.height),
            },
            wgpu::Extent3d {
                width: frame.width,
                height: frame.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn compile(&self, variant: ProgramVariant) -> wgpu::RenderPipeline {
        let fragment = fragment_source(variant);
        let fragment_module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("filter fragment"),
            source: wgpu::ShaderSource::Glsl {
                shader: Cow::Owned(fragment),
                stage: ShaderStage::Fragment,
                defines: &[],
            },
        });

        self.device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("filter pipeline"),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.vertex_module,
                    entry_point: Some("main"),
                    buffers: &[],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &fragment_module,
                    entry_point: Some("main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: TARGET_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                multiview: None,
                cache: None,
            })
    }

    fn read_back(&self, target: &RenderTarget, width: u32, height: u32) -> Result<Vec<u8>, GpuError> {
        let row_bytes = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row_bytes = row_bytes.div_ceil(align) * align;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("surface readback"),
            size: padded_row_bytes as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| GpuError::Backend(format!("wgpu poll failed: {err:?}")))?;
        rx.recv()
            .map_err(|_| GpuError::Backend("readback channel closed".into()))?
            .map_err(|err| GpuError::Backend(format!("readback map failed: {err:?}")))?;

        let mapped = slice.get_mapped_range();
        let mut out = Vec::with_capacity(row_bytes as usize * height as usize);
        for row in 0..height as usize {
            let start = row * padded_row_bytes as usize;
            out.extend_from_slice(&mapped[start..start + row_bytes as usize]);
        }
        drop(mapped);
        buffer.unmap();
        Ok(out)
    }
}

impl GpuApi for WgpuGpu {
    fn backend_name(&self) -> &'static str {
        "wgpu"
    }

    fn create_context(
        &self,
        share_with: Option<&ContextHandle>,
    ) -> Result<ContextHandle, GpuError> {
        self.lock().create_context(share_with)
    }

    fn destroy_context(&self, context: &ContextHandle) -> Result<(), GpuError> {
        let teardown = self.lock().destroy_context(context)?;
        for target in teardown.surfaces {
            target.texture.destroy();
        }
        for texture in teardown.textures {
            texture.texture.destroy();
        }
        Ok(())
    }

    fn create_surface(
        &self,
        context: &ContextHandle,
        native: NativeSurface,
    ) -> Result<SurfaceHandle, GpuError> {
        if native.width == 0 || native.height == 0 {
            return Err(GpuError::InvalidSurfaceSize {
                width: native.width,
                height: native.height,
            });
        }
        let target = self.create_target(native.width, native.height);
        self.lock().add_surface(context, native, target)
    }

    fn resize_surface(
        &self,
        surface: SurfaceHandle,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSurfaceSize { width, height });
        }
        let target = self.create_target(width, height);
        let mut registry = self.lock();
        let entry = registry.surface_mut(surface)?;
        let old = std::mem::replace(&mut entry.payload, target);
        entry.width = width;
        entry.height = height;
        old.texture.destroy();
        Ok(())
    }

    fn destroy_surface(&self, surface: SurfaceHandle) -> Result<(), GpuError> {
        let entry = self.lock().remove_surface(surface)?;
        entry.payload.texture.destroy();
        Ok(())
    }

    fn make_current(&self, surface: Option<SurfaceHandle>) -> Result<(), GpuError> {
        self.lock().bind(surface)
    }

    fn swap_buffers(&self, surface: SurfaceHandle) -> Result<(), GpuError> {
        let (consumer, frame) = {
            let mut registry = self.lock();
            registry.stats.swaps += 1;
            let entry = registry.surface_mut(surface)?;
            let data = self.read_back(&entry.payload, entry.width, entry.height)?;
            let frame = PresentedFrame {
                pixels: FramePixels::new(entry.width, entry.height, data),
                presentation_time_ns: entry.presentation_time_ns.take(),
            };
            (entry.native.consumer.clone(), frame)
        };
        consumer.present(frame);
        Ok(())
    }

    fn set_presentation_time(&self, surface: SurfaceHandle, nanos: i64) -> Result<(), GpuError> {
        self.lock().surface_mut(surface)?.presentation_time_ns = Some(nanos);
        Ok(())
    }

    fn create_external_texture(&self) -> Result<TextureHandle, GpuError> {
        let texture = self.create_external(1, 1);
        self.upload(&texture, &FramePixels::solid(1, 1, [0, 0, 0, 255]));
        self.lock().insert_texture(texture)
    }

    fn latch_frame(&self, texture: TextureHandle, frame: &FramePixels) -> Result<(), GpuError> {
        let expected = frame.width as usize * frame.height as usize * 4;
        if frame.data.len() != expected || expected == 0 {
            return Err(GpuError::FrameSize {
                width: frame.width,
                height: frame.height,
                actual: frame.data.len(),
            });
        }
        let mut registry = self.lock();
        let slot = registry.texture_mut(texture)?;
        if slot.width != frame.width || slot.height != frame.height {
            let replacement = self.create_external(frame.width, frame.height);
            let old = std::mem::replace(slot, replacement);
            old.texture.destroy();
        }
        self.upload(slot, frame);
        registry.stats.frames_latched += 1;
        Ok(())
    }

    fn delete_texture(&self, texture: TextureHandle) -> Result<(), GpuError> {
        let texture = self.lock().remove_texture(texture)?;
        texture.texture.destroy();
        Ok(())
    }

    fn create_program(&self, variant: ProgramVariant) -> Result<ProgramHandle, GpuError> {
        let pipeline = self.compile(variant);
        self.lock().insert_program(pipeline)
    }

    fn delete_program(&self, program: ProgramHandle) -> Result<(), GpuError> {
        self.lock().remove_program(program).map(|_| ())
    }

    fn draw_quad(&self, draw: &QuadDraw<'_>) -> Result<(), GpuError> {
        let mut registry = self.lock();
        let (pipeline, texture, surface) = registry.draw_target(draw.program, draw.texture)?;

        let uniforms = FilterUniforms::new(draw.matrix.as_array(), draw.params);
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("filter uniforms"),
                contents: bytemuck::bytes_of(&uniforms),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("filter bind group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&texture.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("full frame encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("full frame pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &surface.payload.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn stats(&self) -> GpuStats {
        self.lock().snapshot()
    }
}

const UNIFORM_BLOCK: &str = r"layout(std140, set = 0, binding = 0) uniform FilterParams {
    mat4 tex_matrix;
    vec4 kernel[3];
    vec4 tex_offset[5];
    vec4 color_adjust;
} params;
";

const VERTEX_SHADER_GLSL: &str = r"#version 450
layout(location = 0) out vec2 v_tex;

layout(std140, set = 0, binding = 0) uniform FilterParams {
    mat4 tex_matrix;
    vec4 kernel[3];
    vec4 tex_offset[5];
    vec4 color_adjust;
} params;

const vec2 positions[3] = vec2[3](
    vec2(-1.0, -3.0),
    vec2(3.0, 1.0),
    vec2(-1.0, 1.0)
);

void main() {
    uint vertex_index = uint(gl_VertexIndex);
    vec2 pos = positions[vertex_index];
    vec2 uv = pos * 0.5 + vec2(0.5, 0.5);
    v_tex = (params.tex_matrix * vec4(uv, 0.0, 1.0)).xy;
    gl_Position = vec4(pos, 0.0, 1.0);
}
";

/// Builds the fragment shader for `variant`. Texture rows are uploaded
/// top-down, so `t` is mirrored before sampling.
fn fragment_source(variant: ProgramVariant) -> String {
    let mut source = String::from(
        "#version 450\nlayout(location = 0) in vec2 v_tex;\nlayout(location = 0) out vec4 outColor;\n\n",
    );
    source.push_str(UNIFORM_BLOCK);
    source.push_str(
        r"layout(set = 0, binding = 1) uniform texture2D frame_texture;
layout(set = 0, binding = 2) uniform sampler frame_sampler;

vec4 fetch(vec2 tc) {
    return texture(sampler2D(frame_texture, frame_sampler), vec2(tc.x, 1.0 - tc.y));
}

void main() {
",
    );
    match variant {
        ProgramVariant::Passthrough => source.push_str("    outColor = fetch(v_tex);\n"),
        ProgramVariant::BlackWhite => source.push_str(
            "    vec4 tc = fetch(v_tex);\n    float luma = tc.r * 0.3 + tc.g * 0.59 + tc.b * 0.11;\n    outColor = vec4(luma, luma, luma, 1.0);\n",
        ),
        ProgramVariant::Convolution => {
            source.push_str("    vec4 sum = vec4(0.0);\n");
            for tap in 0..9 {
                let (ox, oy) = (tap * 2, tap * 2 + 1);
                source.push_str(&format!(
                    "    sum += fetch(v_tex + vec2(params.tex_offset[{}].{}, params.tex_offset[{}].{})) * params.kernel[{}].{};\n",
                    ox / 4,
                    component(ox % 4),
                    oy / 4,
                    component(oy % 4),
                    tap / 4,
                    component(tap % 4),
                ));
            }
            source.push_str(
                "    outColor = vec4(sum.rgb + vec3(params.color_adjust.x), 1.0);\n",
            );
        }
    }
    source.push_str("}\n");
    source
}

fn component(index: usize) -> char {
    ['x', 'y', 'z', 'w'][index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_is_std140_sized() {
        assert_eq!(std::mem::size_of::<FilterUniforms>(), 208);
    }

    #[test]
    fn convolution_shader_unrolls_nine_taps() {
        let source = fragment_source(ProgramVariant::Convolution);
        assert_eq!(source.matches("sum += fetch").count(), 9);
        assert!(source.contains("params.tex_offset[4].x, params.tex_offset[4].y"));
        assert!(source.contains("params.kernel[2].x"));
    }

    #[test]
    fn uniforms_pack_kernel_row_major() {
        let mut params = ProgramParams::default();
        params.kernel = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let uniforms = FilterUniforms::new(&[0.0; 16], &params);
        assert_eq!(uniforms.kernel[0], [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(uniforms.kernel[2][0], 9.0);
    }
}
