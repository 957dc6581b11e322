use crate::error::GpuError;
use crate::filter::{FilterConfig, FilterKind};
use crate::types::SamplingMatrix;

use super::{FilterProgram, Gpu, QuadDraw, TextureHandle};

/// Draws an external texture as a full-viewport quad through the active
/// [`FilterProgram`].
///
/// Must be created, used and released on the thread whose context owns it.
pub struct FullFrameCompositor {
    gpu: Gpu,
    program: Option<FilterProgram>,
    kind: FilterKind,
    textures: Vec<TextureHandle>,
}

impl FullFrameCompositor {
    pub fn new(gpu: Gpu, config: &FilterConfig) -> Result<Self, GpuError> {
        let mut program = FilterProgram::new(gpu.clone(), config.program_variant())?;
        program.set_kernel(config.kernel_values(), config.color_adjust());
        Ok(Self {
            gpu,
            program: Some(program),
            kind: config.kind(),
            textures: Vec::new(),
        })
    }

    pub fn active_kind(&self) -> FilterKind {
        self.kind
    }

    pub fn program(&self) -> Option<&FilterProgram> {
        self.program.as_ref()
    }

    /// Allocates an external texture owned by this compositor.
    pub fn create_texture_object(&mut self) -> Result<TextureHandle, GpuError> {
        let texture = self.gpu.create_external_texture()?;
        self.textures.push(texture);
        Ok(texture)
    }

    pub fn draw(&self, texture: TextureHandle, matrix: &SamplingMatrix) -> Result<(), GpuError> {
        let Some(program) = self.program.as_ref() else {
            return Ok(());
        };
        self.gpu.draw_quad(&QuadDraw {
            program: program.handle(),
            texture,
            matrix,
            params: program.params(),
        })
    }

    /// Switches to `config`. The program is only recompiled when the kind
    /// changes; kernel and bias are applied on every call. Returns whether a
    /// rebuild happened.
    pub fn change_program(&mut self, config: &FilterConfig) -> Result<bool, GpuError> {
        let rebuilt = if config.kind() != self.kind || self.program.is_none() {
            let replacement = FilterProgram::new(self.gpu.clone(), config.program_variant())?;
            if let Some(old) = self.program.replace(replacement) {
                old.release()?;
            }
            self.kind = config.kind();
            true
        } else {
            false
        };
        if let Some(program) = self.program.as_mut() {
            program.set_kernel(config.kernel_values(), config.color_adjust());
        }
        Ok(rebuilt)
    }

    pub fn set_tex_size(&mut self, width: u32, height: u32) {
        if let Some(program) = self.program.as_mut() {
            program.set_tex_size(width, height);
        }
    }

    /// Frees the program and owned textures. With `do_cleanup == false` the
    /// handles are only forgotten because the context is about to go away.
    pub fn release(&mut self, do_cleanup: bool) {
        let program = self.program.take();
        let textures = std::mem::take(&mut self.textures);
        if !do_cleanup {
            return;
        }
        if let Some(program) = program {
            if let Err(err) = program.release() {
                tracing::warn!(error = %err, "failed to delete filter program");
            }
        }
        for texture in textures {
            if let Err(err) = self.gpu.delete_texture(texture) {
                tracing::warn!(?texture, error = %err, "failed to delete texture");
            }
        }
    }
}
