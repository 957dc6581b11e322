use std::collections::{HashMap, HashSet};
use std::thread::ThreadId;

use crate::error::GpuError;

use super::{
    ContextHandle, GpuStats, NativeSurface, ProgramHandle, SurfaceHandle, TextureHandle,
};

/// Object namespace shared by every context created against it.
pub(crate) struct ShareGroup<T, P> {
    contexts: HashSet<u64>,
    pub textures: HashMap<u64, T>,
    pub programs: HashMap<u64, P>,
}

impl<T, P> ShareGroup<T, P> {
    fn new() -> Self {
        Self {
            contexts: HashSet::new(),
            textures: HashMap::new(),
            programs: HashMap::new(),
        }
    }
}

pub(crate) struct SurfaceEntry<S> {
    pub context: ContextHandle,
    pub native: NativeSurface,
    pub width: u32,
    pub height: u32,
    pub presentation_time_ns: Option<i64>,
    pub payload: S,
}

#[derive(Clone)]
struct Binding {
    context: ContextHandle,
    surface: u64,
}

/// Resources released by a context teardown, handed back so the backend can
/// free its native counterparts.
pub(crate) struct Teardown<T, P, S> {
    pub surfaces: Vec<S>,
    pub textures: Vec<T>,
    pub programs: Vec<P>,
}

/// Bookkeeping common to every backend: share groups, surfaces and the
/// per-thread current binding.
pub(crate) struct Registry<T, P, S> {
    next_id: u64,
    groups: HashMap<u64, ShareGroup<T, P>>,
    contexts: HashMap<u64, ContextHandle>,
    surfaces: HashMap<u64, SurfaceEntry<S>>,
    current: HashMap<ThreadId, Binding>,
    pub stats: GpuStats,
}

impl<T, P, S> Registry<T, P, S> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            groups: HashMap::new(),
            contexts: HashMap::new(),
            surfaces: HashMap::new(),
            current: HashMap::new(),
            stats: GpuStats::default(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn snapshot(&self) -> GpuStats {
        let mut stats = self.stats;
        stats.live_contexts = self.contexts.len();
        stats.live_surfaces = self.surfaces.len();
        stats.live_textures = self.groups.values().map(|g| g.textures.len()).sum();
        stats.live_programs = self.groups.values().map(|g| g.programs.len()).sum();
        stats
    }

    pub fn create_context(
        &mut self,
        share_with: Option<&ContextHandle>,
    ) -> Result<ContextHandle, GpuError> {
        let group = match share_with {
            Some(parent) => {
                if !self.contexts.contains_key(&parent.id) {
                    return Err(GpuError::UnknownContext(parent.clone()));
                }
                parent.share_group
            }
            None => {
                let group = self.allocate_id();
                self.groups.insert(group, ShareGroup::new());
                group
            }
        };
        let id = self.allocate_id();
        let handle = ContextHandle::new(id, group);
        if let Some(entry) = self.groups.get_mut(&group) {
            entry.contexts.insert(id);
        }
        self.contexts.insert(id, handle.clone());
        self.stats.contexts_created += 1;
        Ok(handle)
    }

    pub fn destroy_context(
        &mut self,
        context: &ContextHandle,
    ) -> Result<Teardown<T, P, S>, GpuError> {
        if !self.contexts.contains_key(&context.id) {
            return Err(GpuError::UnknownContext(context.clone()));
        }
        if context.owner != std::thread::current().id() {
            return Err(GpuError::NotOwner {
                context: context.clone(),
            });
        }
        self.contexts.remove(&context.id);
        self.current.retain(|_, binding| binding.context.id != context.id);

        let orphaned: Vec<u64> = self
            .surfaces
            .iter()
            .filter(|(_, entry)| entry.context.id == context.id)
            .map(|(id, _)| *id)
            .collect();
        let mut teardown = Teardown {
            surfaces: Vec::new(),
            textures: Vec::new(),
            programs: Vec::new(),
        };
        for id in orphaned {
            if let Some(entry) = self.surfaces.remove(&id) {
                tracing::warn!(surface = id, "destroying context with a live surface");
                self.stats.surfaces_destroyed += 1;
                teardown.surfaces.push(entry.payload);
            }
        }

        let group_empty = match self.groups.get_mut(&context.share_group) {
            Some(group) => {
                group.contexts.remove(&context.id);
                group.contexts.is_empty()
            }
            None => false,
        };
        if group_empty {
            if let Some(group) = self.groups.remove(&context.share_group) {
                self.stats.textures_deleted += group.textures.len() as u64;
                self.stats.programs_deleted += group.programs.len() as u64;
                teardown.textures.extend(group.textures.into_values());
                teardown.programs.extend(group.programs.into_values());
            }
        }
        self.stats.contexts_destroyed += 1;
        Ok(teardown)
    }

    pub fn add_surface(
        &mut self,
        context: &ContextHandle,
        native: NativeSurface,
        payload: S,
    ) -> Result<SurfaceHandle, GpuError> {
        if !self.contexts.contains_key(&context.id) {
            return Err(GpuError::UnknownContext(context.clone()));
        }
        if native.width == 0 || native.height == 0 {
            return Err(GpuError::InvalidSurfaceSize {
                width: native.width,
                height: native.height,
            });
        }
        let id = self.allocate_id();
        self.surfaces.insert(
            id,
            SurfaceEntry {
                context: context.clone(),
                width: native.width,
                height: native.height,
                native,
                presentation_time_ns: None,
                payload,
            },
        );
        self.stats.surfaces_created += 1;
        Ok(SurfaceHandle(id))
    }

    pub fn surface_mut(&mut self, handle: SurfaceHandle) -> Result<&mut SurfaceEntry<S>, GpuError> {
        self.surfaces
            .get_mut(&handle.0)
            .ok_or(GpuError::UnknownSurface(handle))
    }

    pub fn remove_surface(&mut self, handle: SurfaceHandle) -> Result<SurfaceEntry<S>, GpuError> {
        let entry = self
            .surfaces
            .remove(&handle.0)
            .ok_or(GpuError::UnknownSurface(handle))?;
        self.current.retain(|_, binding| binding.surface != handle.0);
        self.stats.surfaces_destroyed += 1;
        Ok(entry)
    }

    pub fn bind(&mut self, surface: Option<SurfaceHandle>) -> Result<(), GpuError> {
        let thread = std::thread::current().id();
        match surface {
            None => {
                self.current.remove(&thread);
            }
            Some(handle) => {
                let entry = self
                    .surfaces
                    .get(&handle.0)
                    .ok_or(GpuError::UnknownSurface(handle))?;
                let binding = Binding {
                    context: entry.context.clone(),
                    surface: handle.0,
                };
                self.current.insert(thread, binding);
            }
        }
        Ok(())
    }

    fn current_binding(&self) -> Result<&Binding, GpuError> {
        self.current
            .get(&std::thread::current().id())
            .ok_or(GpuError::NoCurrentContext)
    }

    fn current_group_id(&self) -> Result<u64, GpuError> {
        Ok(self.current_binding()?.context.share_group)
    }

    pub fn insert_texture(&mut self, payload: T) -> Result<TextureHandle, GpuError> {
        let group = self.current_group_id()?;
        let id = self.allocate_id();
        self.groups
            .get_mut(&group)
            .ok_or(GpuError::NoCurrentContext)?
            .textures
            .insert(id, payload);
        self.stats.textures_created += 1;
        Ok(TextureHandle(id))
    }

    pub fn insert_program(&mut self, payload: P) -> Result<ProgramHandle, GpuError> {
        let group = self.current_group_id()?;
        let id = self.allocate_id();
        self.groups
            .get_mut(&group)
            .ok_or(GpuError::NoCurrentContext)?
            .programs
            .insert(id, payload);
        self.stats.programs_compiled += 1;
        Ok(ProgramHandle(id))
    }

    fn texture_error(&self, handle: TextureHandle) -> GpuError {
        if self.groups.values().any(|g| g.textures.contains_key(&handle.0)) {
            GpuError::ForeignObject {
                object: format!("{handle:?}"),
            }
        } else {
            GpuError::UnknownTexture(handle)
        }
    }

    fn program_error(&self, handle: ProgramHandle) -> GpuError {
        if self.groups.values().any(|g| g.programs.contains_key(&handle.0)) {
            GpuError::ForeignObject {
                object: format!("{handle:?}"),
            }
        } else {
            GpuError::UnknownProgram(handle)
        }
    }

    pub fn texture_mut(&mut self, handle: TextureHandle) -> Result<&mut T, GpuError> {
        let group = self.current_group_id()?;
        let owned = self
            .groups
            .get(&group)
            .is_some_and(|g| g.textures.contains_key(&handle.0));
        if !owned {
            return Err(self.texture_error(handle));
        }
        self.groups
            .get_mut(&group)
            .and_then(|g| g.textures.get_mut(&handle.0))
            .ok_or(GpuError::UnknownTexture(handle))
    }

    pub fn remove_texture(&mut self, handle: TextureHandle) -> Result<T, GpuError> {
        let group = self.current_group_id()?;
        match self
            .groups
            .get_mut(&group)
            .and_then(|g| g.textures.remove(&handle.0))
        {
            Some(texture) => {
                self.stats.textures_deleted += 1;
                Ok(texture)
            }
            None => Err(self.texture_error(handle)),
        }
    }

    pub fn remove_program(&mut self, handle: ProgramHandle) -> Result<P, GpuError> {
        let group = self.current_group_id()?;
        match self
            .groups
            .get_mut(&group)
            .and_then(|g| g.programs.remove(&handle.0))
        {
            Some(program) => {
                self.stats.programs_deleted += 1;
                Ok(program)
            }
            None => Err(self.program_error(handle)),
        }
    }

    /// Resolves everything a draw needs from the current binding.
    pub fn draw_target(
        &mut self,
        program: ProgramHandle,
        texture: TextureHandle,
    ) -> Result<(&P, &T, &mut SurfaceEntry<S>), GpuError> {
        let binding = self.current_binding()?.clone();
        let Some(group) = self.groups.get(&binding.context.share_group) else {
            return Err(GpuError::NoCurrentContext);
        };
        if !group.programs.contains_key(&program.0) {
            return Err(self.program_error(program));
        }
        if !group.textures.contains_key(&texture.0) {
            return Err(self.texture_error(texture));
        }
        let surface = self
            .surfaces
            .get_mut(&binding.surface)
            .ok_or(GpuError::UnknownSurface(SurfaceHandle(binding.surface)))?;
        let group = self
            .groups
            .get(&binding.context.share_group)
            .ok_or(GpuError::NoCurrentContext)?;
        let program = group
            .programs
            .get(&program.0)
            .ok_or(GpuError::UnknownProgram(program))?;
        let texture = group
            .textures
            .get(&texture.0)
            .ok_or(GpuError::UnknownTexture(texture))?;
        self.stats.draw_calls += 1;
        Ok((program, texture, surface))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::FrameMonitor;

    type TestRegistry = Registry<&'static str, &'static str, ()>;

    fn bind_new_surface(registry: &mut TestRegistry, context: &ContextHandle) -> SurfaceHandle {
        let surface = registry
            .add_surface(context, NativeSurface::new(4, 4, FrameMonitor::new()), ())
            .unwrap();
        registry.bind(Some(surface)).unwrap();
        surface
    }

    #[test]
    fn group_objects_outlive_all_but_last_context() {
        let mut registry = TestRegistry::new();
        let display = registry.create_context(None).unwrap();
        let encoder = registry.create_context(Some(&display)).unwrap();
        assert!(encoder.shares_objects_with(&display));

        let surface = bind_new_surface(&mut registry, &display);
        let texture = registry.insert_texture("frame").unwrap();
        registry.remove_surface(surface).unwrap();

        let teardown = registry.destroy_context(&display).unwrap();
        assert!(teardown.textures.is_empty());

        bind_new_surface(&mut registry, &encoder);
        assert_eq!(*registry.texture_mut(texture).unwrap(), "frame");

        let teardown = registry.destroy_context(&encoder).unwrap();
        assert_eq!(teardown.textures, vec!["frame"]);
        assert_eq!(teardown.surfaces.len(), 1);
        let stats = registry.snapshot();
        assert_eq!(stats.live_contexts, 0);
        assert_eq!(stats.live_textures, 0);
    }

    #[test]
    fn objects_do_not_cross_share_groups() {
        let mut registry = TestRegistry::new();
        let first = registry.create_context(None).unwrap();
        let second = registry.create_context(None).unwrap();
        bind_new_surface(&mut registry, &first);
        let texture = registry.insert_texture("first").unwrap();

        bind_new_surface(&mut registry, &second);
        assert!(matches!(
            registry.texture_mut(texture),
            Err(GpuError::ForeignObject { .. })
        ));
    }

    #[test]
    fn only_the_creating_thread_destroys_a_context() {
        let mut registry = TestRegistry::new();
        let context = registry.create_context(None).unwrap();
        let handle = context.clone();
        let result = std::thread::spawn(move || registry.destroy_context(&handle).map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(result, Err(GpuError::NotOwner { .. })));
    }

    #[test]
    fn object_calls_need_a_current_context() {
        let mut registry = TestRegistry::new();
        registry.create_context(None).unwrap();
        assert!(matches!(
            registry.insert_program("passthrough"),
            Err(GpuError::NoCurrentContext)
        ));
    }
}
