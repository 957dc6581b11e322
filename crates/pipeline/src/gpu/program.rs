use crate::error::GpuError;

use super::{Gpu, ProgramHandle};

/// Shader families a [`FilterProgram`] can be compiled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramVariant {
    Passthrough,
    BlackWhite,
    Convolution,
}

/// Uniform values consumed by the convolution shader. The other variants
/// ignore the kernel but still receive the block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgramParams {
    pub kernel: [f32; 9],
    pub color_adjust: f32,
    /// Nine `(s, t)` tap offsets in texture space, row by row from the
    /// bottom-left neighbour.
    pub tex_offset: [f32; 18],
}

impl Default for ProgramParams {
    fn default() -> Self {
        Self {
            kernel: [0.0; 9],
            color_adjust: 0.0,
            tex_offset: [0.0; 18],
        }
    }
}

/// A compiled shader program plus the uniform state it is drawn with.
pub struct FilterProgram {
    gpu: Gpu,
    handle: ProgramHandle,
    variant: ProgramVariant,
    params: ProgramParams,
}

impl FilterProgram {
    /// Compiles `variant` in the calling thread's current context.
    pub fn new(gpu: Gpu, variant: ProgramVariant) -> Result<Self, GpuError> {
        let handle = gpu.create_program(variant)?;
        tracing::debug!(?variant, ?handle, "compiled filter program");
        Ok(Self {
            gpu,
            handle,
            variant,
            params: ProgramParams::default(),
        })
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    pub fn variant(&self) -> ProgramVariant {
        self.variant
    }

    pub fn params(&self) -> &ProgramParams {
        &self.params
    }

    pub fn set_kernel(&mut self, kernel: [f32; 9], color_adjust: f32) {
        self.params.kernel = kernel;
        self.params.color_adjust = color_adjust;
    }

    /// Recomputes the texel offsets for a `width` x `height` source.
    pub fn set_tex_size(&mut self, width: u32, height: u32) {
        let rw = 1.0 / width.max(1) as f32;
        let rh = 1.0 / height.max(1) as f32;
        self.params.tex_offset = [
            -rw, -rh, 0.0, -rh, rw, -rh, //
            -rw, 0.0, 0.0, 0.0, rw, 0.0, //
            -rw, rh, 0.0, rh, rw, rh,
        ];
    }

    /// Deletes the GPU program. Callers skip this when the owning context is
    /// being destroyed anyway.
    pub fn release(self) -> Result<(), GpuError> {
        self.gpu.delete_program(self.handle)
    }
}

impl std::fmt::Debug for FilterProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterProgram")
            .field("handle", &self.handle)
            .field("variant", &self.variant)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gpu::{FrameMonitor, GpuApi, NativeSurface, SoftGpu};

    fn current_gpu() -> Gpu {
        let gpu: Gpu = Arc::new(SoftGpu::new());
        let context = gpu.create_context(None).unwrap();
        let surface = gpu
            .create_surface(&context, NativeSurface::new(4, 4, FrameMonitor::new()))
            .unwrap();
        gpu.make_current(Some(surface)).unwrap();
        gpu
    }

    #[test]
    fn tex_offsets_follow_texel_grid() {
        let mut program = FilterProgram::new(current_gpu(), ProgramVariant::Convolution).unwrap();
        program.set_tex_size(4, 2);
        let offsets = program.params().tex_offset;
        assert_eq!(&offsets[0..2], &[-0.25, -0.5]);
        assert_eq!(&offsets[8..10], &[0.0, 0.0]);
        assert_eq!(&offsets[16..18], &[0.25, 0.5]);
    }

    #[test]
    fn release_deletes_program() {
        let gpu = current_gpu();
        let program = FilterProgram::new(gpu.clone(), ProgramVariant::Passthrough).unwrap();
        assert_eq!(gpu.stats().live_programs, 1);
        program.release().unwrap();
        assert_eq!(gpu.stats().live_programs, 0);
    }
}
