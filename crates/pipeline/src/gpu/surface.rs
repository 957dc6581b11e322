use crate::error::GpuError;

use super::{ContextHandle, Gpu, NativeSurface, SurfaceHandle};

/// A drawing surface bound to one rendering context.
///
/// Sessions never outlive their context and are not reused across a context
/// teardown. After [`SurfaceSession::release`] every call is a no-op.
pub struct SurfaceSession {
    gpu: Gpu,
    context: ContextHandle,
    surface: Option<SurfaceHandle>,
    width: u32,
    height: u32,
}

impl SurfaceSession {
    pub fn new(gpu: Gpu, context: &ContextHandle, native: NativeSurface) -> Result<Self, GpuError> {
        let (width, height) = (native.width, native.height);
        let surface = gpu.create_surface(context, native)?;
        tracing::debug!(?context, ?surface, width, height, "created surface session");
        Ok(Self {
            gpu,
            context: context.clone(),
            surface: Some(surface),
            width,
            height,
        })
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn is_released(&self) -> bool {
        self.surface.is_none()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn make_current(&self) -> Result<(), GpuError> {
        match self.surface {
            Some(surface) => self.gpu.make_current(Some(surface)),
            None => Ok(()),
        }
    }

    pub fn swap_buffers(&self) -> Result<(), GpuError> {
        match self.surface {
            Some(surface) => self.gpu.swap_buffers(surface),
            None => Ok(()),
        }
    }

    pub fn set_presentation_time(&self, nanos: i64) -> Result<(), GpuError> {
        match self.surface {
            Some(surface) => self.gpu.set_presentation_time(surface, nanos),
            None => Ok(()),
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        let Some(surface) = self.surface else {
            return Ok(());
        };
        self.gpu.resize_surface(surface, width, height)?;
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Destroys the surface. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(surface) = self.surface.take() {
            if let Err(err) = self.gpu.destroy_surface(surface) {
                tracing::warn!(?surface, error = %err, "failed to destroy surface");
            }
        }
    }
}

impl Drop for SurfaceSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gpu::{FrameMonitor, GpuApi, SoftGpu};

    #[test]
    fn double_release_is_safe_and_silent() {
        let soft = Arc::new(SoftGpu::new());
        let gpu: Gpu = soft.clone();
        let context = gpu.create_context(None).unwrap();
        let monitor = FrameMonitor::new();
        let mut session =
            SurfaceSession::new(gpu.clone(), &context, NativeSurface::new(8, 8, monitor.clone()))
                .unwrap();
        session.make_current().unwrap();
        session.swap_buffers().unwrap();

        session.release();
        session.release();
        let before = soft.stats();

        session.make_current().unwrap();
        session.swap_buffers().unwrap();
        session.set_presentation_time(7).unwrap();
        session.resize(4, 4).unwrap();

        assert_eq!(soft.stats(), before);
        assert_eq!(before.surfaces_destroyed, 1);
        assert_eq!(monitor.presented(), 1);
    }
}
