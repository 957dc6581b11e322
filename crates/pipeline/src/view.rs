//! Render thread hosting a [`Renderer`] on its own rendering context.
//!
//! The view owns the display context and surface. It creates them when both a
//! native surface is available and the view is not paused, and destroys them
//! on pause or surface loss after the renderer has released its objects.
//! Frames are drawn only when requested, paced by a [`FrameScheduler`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::channel::{mailbox, Inbox, Port};
use crate::gpu::{ContextHandle, Gpu, NativeSurface, SurfaceSession};
use crate::runtime::FrameScheduler;

const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// What a renderer sees during a callback. Only valid on the render thread.
pub struct RenderContext<'a> {
    pub gpu: &'a Gpu,
    pub context: &'a ContextHandle,
    pub display: &'a SurfaceSession,
}

/// Callbacks driven by [`GlView`] on its render thread.
pub trait Renderer: Send + 'static {
    fn on_surface_created(&mut self, ctx: &RenderContext<'_>) -> Result<()>;

    fn on_surface_changed(&mut self, ctx: &RenderContext<'_>, width: u32, height: u32)
        -> Result<()>;

    fn on_draw_frame(&mut self, ctx: &RenderContext<'_>) -> Result<()>;

    /// The context is about to be destroyed; release everything created on it.
    fn on_surface_destroyed(&mut self);
}

type RenderEvent<R> = Box<dyn FnOnce(&mut R) + Send>;

enum ViewCommand {
    SurfaceCreated(NativeSurface),
    SurfaceChanged { width: u32, height: u32 },
    SurfaceDestroyed(Sender<()>),
    RequestRender,
    Wake,
    Pause(Sender<()>),
    Resume,
    Shutdown,
}

/// Coalescing redraw trigger, safe to call from any thread.
#[derive(Clone)]
pub struct RenderRequester {
    commands: Sender<ViewCommand>,
    pending: Arc<AtomicBool>,
}

impl RenderRequester {
    pub fn request(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            let _ = self.commands.send(ViewCommand::RequestRender);
        }
    }
}

pub struct GlView<R: Renderer> {
    commands: Sender<ViewCommand>,
    events: Port<RenderEvent<R>>,
    requester: RenderRequester,
    worker: Option<(JoinHandle<()>, Receiver<()>)>,
}

impl<R: Renderer> GlView<R> {
    pub fn spawn(gpu: Gpu, renderer: R, max_fps: Option<f32>) -> Result<Self> {
        let (command_tx, command_rx) = unbounded();
        let (events, inbox) = mailbox("render");
        let (ready_tx, ready_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let pending = Arc::new(AtomicBool::new(false));

        let state = ViewThread {
            gpu,
            renderer,
            inbox,
            native: None,
            egl: None,
            paused: false,
            scheduler: FrameScheduler::new(max_fps),
            pending: pending.clone(),
        };
        let handle = thread::Builder::new()
            .name("camrec-render".into())
            .spawn(move || {
                let _ = ready_tx.send(());
                state.run(command_rx);
                let _ = done_tx.send(());
            })
            .map_err(|err| anyhow!("failed to spawn render thread: {err}"))?;
        ready_rx
            .recv()
            .map_err(|err| anyhow!("render thread failed to initialise: {err}"))?;

        Ok(Self {
            requester: RenderRequester {
                commands: command_tx.clone(),
                pending,
            },
            commands: command_tx,
            events,
            worker: Some((handle, done_rx)),
        })
    }

    fn send(&self, command: ViewCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("render thread is gone"))
    }

    fn send_and_wait(&self, command: impl FnOnce(Sender<()>) -> ViewCommand, what: &str) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.send(command(ack_tx))?;
        ack_rx
            .recv_timeout(ACK_TIMEOUT)
            .map_err(|_| anyhow!("render thread did not acknowledge {what}"))
    }

    pub fn surface_created(&self, native: NativeSurface) -> Result<()> {
        self.send(ViewCommand::SurfaceCreated(native))
    }

    pub fn surface_changed(&self, width: u32, height: u32) -> Result<()> {
        self.send(ViewCommand::SurfaceChanged { width, height })
    }

    /// Returns once the render thread has released the surface.
    pub fn surface_destroyed(&self) -> Result<()> {
        self.send_and_wait(ViewCommand::SurfaceDestroyed, "surface loss")
    }

    pub fn request_render(&self) {
        self.requester.request();
    }

    pub fn requester(&self) -> RenderRequester {
        self.requester.clone()
    }

    /// Runs `event` on the render thread before the next frame. Returns
    /// `false` if the render mailbox is invalidated.
    pub fn queue_event<F>(&self, event: F) -> bool
    where
        F: FnOnce(&mut R) + Send + 'static,
    {
        if !self.events.post(Box::new(event)) {
            return false;
        }
        let _ = self.commands.send(ViewCommand::Wake);
        true
    }

    /// Drops queued and future events until [`GlView::revive_events`].
    pub fn invalidate_events(&self) {
        self.events.token().invalidate();
    }

    pub fn revive_events(&self) {
        self.events.token().revive();
    }

    /// Destroys the rendering context and waits for the render thread to
    /// confirm.
    pub fn pause(&self) -> Result<()> {
        self.send_and_wait(ViewCommand::Pause, "pause")
    }

    pub fn resume(&self) -> Result<()> {
        self.send(ViewCommand::Resume)
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.stop_thread()
    }

    fn stop_thread(&mut self) -> Result<()> {
        let Some((handle, done)) = self.worker.take() else {
            return Ok(());
        };
        let _ = self.commands.send(ViewCommand::Shutdown);
        done.recv_timeout(ACK_TIMEOUT)
            .map_err(|_| anyhow!("render thread did not stop in time"))?;
        handle
            .join()
            .map_err(|err| anyhow!("render thread panicked: {err:?}"))
    }
}

impl<R: Renderer> Drop for GlView<R> {
    fn drop(&mut self) {
        if let Err(err) = self.stop_thread() {
            tracing::warn!(error = %err, "render thread shutdown incomplete");
        }
    }
}

struct DisplayState {
    context: ContextHandle,
    display: SurfaceSession,
}

struct ViewThread<R: Renderer> {
    gpu: Gpu,
    renderer: R,
    inbox: Inbox<RenderEvent<R>>,
    native: Option<NativeSurface>,
    egl: Option<DisplayState>,
    paused: bool,
    scheduler: FrameScheduler,
    pending: Arc<AtomicBool>,
}

impl<R: Renderer> ViewThread<R> {
    fn run(mut self, commands: Receiver<ViewCommand>) {
        tracing::debug!("render thread running");
        'frames: loop {
            let command = match self.scheduler.next_deadline() {
                Some(deadline) => match commands.recv_deadline(deadline) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };
            if let Some(command) = command {
                if !self.handle(command) {
                    break;
                }
                while let Ok(command) = commands.try_recv() {
                    if !self.handle(command) {
                        break 'frames;
                    }
                }
            }
            self.run_events();
            let now = Instant::now();
            if self.scheduler.ready_for_frame(now) {
                self.draw();
                self.scheduler.mark_rendered(now);
            }
        }
        self.teardown_egl();
        tracing::debug!("render thread exiting");
    }

    /// Returns `false` when the thread should exit.
    fn handle(&mut self, command: ViewCommand) -> bool {
        match command {
            ViewCommand::SurfaceCreated(native) => {
                tracing::debug!(width = native.width, height = native.height, "surface created");
                self.native = Some(native);
                self.ensure_egl();
            }
            ViewCommand::SurfaceChanged { width, height } => {
                if let Some(native) = self.native.as_mut() {
                    native.width = width;
                    native.height = height;
                }
                self.surface_changed(width, height);
            }
            ViewCommand::SurfaceDestroyed(ack) => {
                self.teardown_egl();
                self.native = None;
                let _ = ack.send(());
            }
            ViewCommand::RequestRender => {
                self.pending.store(false, Ordering::Release);
                self.scheduler.request();
            }
            ViewCommand::Wake => {}
            ViewCommand::Pause(ack) => {
                tracing::debug!("render view pausing");
                self.paused = true;
                self.run_events();
                self.teardown_egl();
                self.scheduler.reset();
                let _ = ack.send(());
            }
            ViewCommand::Resume => {
                tracing::debug!("render view resuming");
                self.paused = false;
                self.ensure_egl();
            }
            ViewCommand::Shutdown => return false,
        }
        true
    }

    fn run_events(&mut self) {
        for event in self.inbox.drain() {
            event(&mut self.renderer);
        }
    }

    fn ensure_egl(&mut self) {
        if self.paused || self.egl.is_some() {
            return;
        }
        let Some(native) = self.native.clone() else {
            return;
        };
        match self.create_egl(native) {
            Ok(()) => self.scheduler.request(),
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "failed to create rendering context");
                self.teardown_egl();
            }
        }
    }

    fn create_egl(&mut self, native: NativeSurface) -> Result<()> {
        let (width, height) = (native.width, native.height);
        let context = self
            .gpu
            .create_context(None)
            .context("failed to create display context")?;
        let display = SurfaceSession::new(self.gpu.clone(), &context, native)
            .context("failed to create display surface")?;
        display.make_current()?;
        let egl = self.egl.insert(DisplayState { context, display });
        let ctx = RenderContext {
            gpu: &self.gpu,
            context: &egl.context,
            display: &egl.display,
        };
        self.renderer.on_surface_created(&ctx)?;
        self.renderer.on_surface_changed(&ctx, width, height)?;
        tracing::debug!(context = ?egl.context, width, height, "display context ready");
        Ok(())
    }

    fn surface_changed(&mut self, width: u32, height: u32) {
        let Some(egl) = self.egl.as_mut() else {
            return;
        };
        if let Err(err) = egl.display.resize(width, height) {
            tracing::error!(error = %err, width, height, "failed to resize display surface");
            return;
        }
        let ctx = RenderContext {
            gpu: &self.gpu,
            context: &egl.context,
            display: &egl.display,
        };
        if let Err(err) = self.renderer.on_surface_changed(&ctx, width, height) {
            tracing::error!(error = %format!("{err:#}"), "renderer rejected surface change");
        }
        self.scheduler.request();
    }

    fn draw(&mut self) {
        let Some(egl) = self.egl.as_ref() else {
            return;
        };
        if let Err(err) = egl.display.make_current() {
            tracing::error!(error = %err, "failed to bind display surface");
            return;
        }
        let ctx = RenderContext {
            gpu: &self.gpu,
            context: &egl.context,
            display: &egl.display,
        };
        if let Err(err) = self.renderer.on_draw_frame(&ctx) {
            tracing::warn!(error = %format!("{err:#}"), "draw cycle failed");
        }
        if let Err(err) = egl.display.swap_buffers() {
            tracing::warn!(error = %err, "swap failed");
        }
    }

    fn teardown_egl(&mut self) {
        let Some(mut egl) = self.egl.take() else {
            return;
        };
        self.renderer.on_surface_destroyed();
        egl.display.release();
        if let Err(err) = self.gpu.make_current(None) {
            tracing::warn!(error = %err, "failed to unbind display context");
        }
        if let Err(err) = self.gpu.destroy_context(&egl.context) {
            tracing::warn!(context = ?egl.context, error = %err, "failed to destroy display context");
        }
        tracing::debug!("display context destroyed");
    }
}
