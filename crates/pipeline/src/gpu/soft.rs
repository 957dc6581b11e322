use std::sync::{Mutex, MutexGuard};

use crate::error::GpuError;
use crate::types::FramePixels;

use super::registry::Registry;
use super::{
    ContextHandle, GpuApi, GpuStats, NativeSurface, PresentedFrame, ProgramHandle, ProgramParams,
    ProgramVariant, QuadDraw, SurfaceHandle, TextureHandle,
};

type SoftRegistry = Registry<FramePixels, ProgramVariant, Vec<u8>>;

/// CPU rasteriser implementing the full [`GpuApi`] contract.
///
/// Sampling is nearest-neighbour with clamp-to-edge addressing, which keeps
/// filter output exact enough to assert on in tests.
pub struct SoftGpu {
    registry: Mutex<SoftRegistry>,
}

impl SoftGpu {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SoftRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SoftGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuApi for SoftGpu {
    fn backend_name(&self) -> &'static str {
        "soft"
    }

    fn create_context(
        &self,
        share_with: Option<&ContextHandle>,
    ) -> Result<ContextHandle, GpuError> {
        self.lock().create_context(share_with)
    }

    fn destroy_context(&self, context: &ContextHandle) -> Result<(), GpuError> {
        self.lock().destroy_context(context).map(|_| ())
    }

    fn create_surface(
        &self,
        context: &ContextHandle,
        native: NativeSurface,
    ) -> Result<SurfaceHandle, GpuError> {
        let buffer = vec![0u8; native.width as usize * native.height as usize * 4];
        self.lock().add_surface(context, native, buffer)
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
        let mut registry = self.lock();
        let entry = registry.surface_mut(surface)?;
        entry.width = width;
        entry.height = height;
        entry.payload = vec![0u8; width as usize * height as usize * 4];
        Ok(())
    }

    fn destroy_surface(&self, surface: SurfaceHandle) -> Result<(), GpuError> {
        self.lock().remove_surface(surface).map(|_| ())
    }

    fn make_current(&self, surface: Option<SurfaceHandle>) -> Result<(), GpuError> {
        self.lock().bind(surface)
    }

    fn swap_buffers(&self, surface: SurfaceHandle) -> Result<(), GpuError> {
        let (consumer, frame) = {
            let mut registry = self.lock();
            registry.stats.swaps += 1;
            let entry = registry.surface_mut(surface)?;
            let frame = PresentedFrame {
                pixels: FramePixels::new(entry.width, entry.height, entry.payload.clone()),
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
        self.lock()
            .insert_texture(FramePixels::solid(1, 1, [0, 0, 0, 255]))
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
        slot.width = frame.width;
        slot.height = frame.height;
        slot.data.clear();
        slot.data.extend_from_slice(&frame.data);
        registry.stats.frames_latched += 1;
        Ok(())
    }

    fn delete_texture(&self, texture: TextureHandle) -> Result<(), GpuError> {
        self.lock().remove_texture(texture).map(|_| ())
    }

    fn create_program(&self, variant: ProgramVariant) -> Result<ProgramHandle, GpuError> {
        self.lock().insert_program(variant)
    }

    fn delete_program(&self, program: ProgramHandle) -> Result<(), GpuError> {
        self.lock().remove_program(program).map(|_| ())
    }

    fn draw_quad(&self, draw: &QuadDraw<'_>) -> Result<(), GpuError> {
        let mut registry = self.lock();
        let (variant, texture, surface) = registry.draw_target(draw.program, draw.texture)?;
        let variant = *variant;
        let (width, height) = (surface.width, surface.height);
        for y in 0..height {
            // Quad space is bottom-up; framebuffer rows are stored top-down.
            let v = 1.0 - (y as f32 + 0.5) / height as f32;
            for x in 0..width {
                let u = (x as f32 + 0.5) / width as f32;
                let (s, t) = draw.matrix.transform(u, v);
                let color = shade(variant, draw.params, texture, s, t);
                let offset = (y as usize * width as usize + x as usize) * 4;
                surface.payload[offset..offset + 4].copy_from_slice(&to_rgba8(color));
            }
        }
        Ok(())
    }

    fn stats(&self) -> GpuStats {
        self.lock().snapshot()
    }
}

fn sample(texture: &FramePixels, s: f32, t: f32) -> [f32; 4] {
    let w = texture.width.max(1);
    let h = texture.height.max(1);
    let x = ((s * w as f32).floor() as i64).clamp(0, w as i64 - 1) as u32;
    let row_from_bottom = ((t * h as f32).floor() as i64).clamp(0, h as i64 - 1) as u32;
    let y = h - 1 - row_from_bottom;
    let px = texture.pixel(x, y);
    [
        px[0] as f32 / 255.0,
        px[1] as f32 / 255.0,
        px[2] as f32 / 255.0,
        px[3] as f32 / 255.0,
    ]
}

fn shade(
    variant: ProgramVariant,
    params: &ProgramParams,
    texture: &FramePixels,
    s: f32,
    t: f32,
) -> [f32; 4] {
    match variant {
        ProgramVariant::Passthrough => sample(texture, s, t),
        ProgramVariant::BlackWhite => {
            let c = sample(texture, s, t);
            let luma = c[0] * 0.3 + c[1] * 0.59 + c[2] * 0.11;
            [luma, luma, luma, 1.0]
        }
        ProgramVariant::Convolution => {
            let mut sum = [0.0f32; 3];
            for tap in 0..9 {
                let ds = params.tex_offset[tap * 2];
                let dt = params.tex_offset[tap * 2 + 1];
                let c = sample(texture, s + ds, t + dt);
                let weight = params.kernel[tap];
                sum[0] += c[0] * weight;
                sum[1] += c[1] * weight;
                sum[2] += c[2] * weight;
            }
            [
                sum[0] + params.color_adjust,
                sum[1] + params.color_adjust,
                sum[2] + params.color_adjust,
                1.0,
            ]
        }
    }
}

fn to_rgba8(color: [f32; 4]) -> [u8; 4] {
    color.map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8)
}
