use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use pipeline::gpu::FrameMonitor;
use pipeline::{
    build_controller, AspectRatio, ControllerKind, ControllerParts, DeviceInfo, Facing,
    GpuApi, MemoryRecording, NativeSurface, PipelineEvent, PipelineSettings, PreviewSizeListener,
    RecordController, SoftGpu, SyntheticCatalog, SyntheticPattern,
};

#[derive(Default)]
struct AspectProbe {
    seen: Mutex<Vec<AspectRatio>>,
}

impl PreviewSizeListener for AspectProbe {
    fn on_preview_size_changed(&self, aspect: AspectRatio) {
        self.seen.lock().unwrap().push(aspect);
    }
}

struct Rig {
    soft: Arc<SoftGpu>,
    recording: Arc<MemoryRecording>,
    controller: Box<dyn RecordController>,
    monitor: Arc<FrameMonitor>,
    events: Vec<PipelineEvent>,
}

impl Rig {
    fn new(kind: ControllerKind) -> Self {
        let soft = Arc::new(SoftGpu::new());
        let catalog = SyntheticCatalog::new().with_device(
            DeviceInfo {
                id: "front".into(),
                name: "Synthetic front".into(),
                facing: Facing::Front,
            },
            SyntheticPattern::TestPattern,
        );
        let recording = MemoryRecording::counting();
        let controller = build_controller(
            kind,
            ControllerParts {
                gpu: soft.clone(),
                catalog: Arc::new(catalog),
                sinks: recording.factory(),
                settings: PipelineSettings {
                    capture_width: 640,
                    capture_height: 480,
                    capture_fps: 30,
                    ..PipelineSettings::default()
                },
            },
        )
        .unwrap();
        Self {
            soft,
            recording,
            controller,
            monitor: FrameMonitor::new(),
            events: Vec::new(),
        }
    }

    fn start(&mut self) {
        self.controller.handle_resume().unwrap();
        self.controller
            .surface_created(NativeSurface::new(64, 48, self.monitor.clone()))
            .unwrap();
    }

    fn pump_until(&mut self, what: &str, mut done: impl FnMut(&Rig) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let events = self.controller.dispatch_ui_events().unwrap();
            self.events.extend(events);
            if done(self) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn stopped_events(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, PipelineEvent::RecordingStopped { .. }))
            .count()
    }
}

#[test]
fn shared_context_recording_survives_pause() {
    let mut rig = Rig::new(ControllerKind::SharedContext);
    let probe = Arc::new(AspectProbe::default());
    let weak: Weak<AspectProbe> = Arc::downgrade(&probe);
    rig.controller.set_preview_size_listener(weak);
    rig.start();
    rig.pump_until("preview frames", |rig| rig.monitor.presented() >= 3);
    assert_eq!(
        probe.seen.lock().unwrap().first().copied(),
        Some(AspectRatio {
            width: 640,
            height: 480
        })
    );

    let output = PathBuf::from("/tmp/shared-context.mp4");
    rig.controller.start_record_video(&output);
    rig.pump_until("encoded frames", |rig| rig.recording.frames() >= 5);
    assert!(rig.controller.is_recording());

    rig.controller.handle_pause().unwrap();
    assert!(rig.controller.is_recording());
    let before_resume = rig.recording.frames();

    rig.controller.handle_resume().unwrap();
    rig.pump_until("resumed recording", |rig| {
        rig.controller.renderer_stats().recording_resumes == 1
            && rig.recording.frames() >= before_resume + 3
    });

    rig.controller.stop_record_video();
    rig.pump_until("stop event", |rig| rig.stopped_events() == 1);

    let stats = rig.controller.renderer_stats();
    assert_eq!(stats.recording_starts, 1);
    assert_eq!(stats.recording_stops, 1);
    let log = rig.recording.snapshot();
    assert_eq!(log.sessions, 1);
    assert!(log.end_of_stream);
    assert_eq!(log.output.as_deref(), Some(output.as_path()));
    assert!(rig
        .events
        .contains(&PipelineEvent::RecordingStarted { output: output.clone() }));

    let soft = rig.soft.clone();
    rig.controller.shutdown().unwrap();
    assert_eq!(soft.stats().live_contexts, 0);
    assert_eq!(soft.stats().live_surfaces, 0);
}

#[test]
fn dual_surface_recording_stops_on_pause() {
    let mut rig = Rig::new(ControllerKind::DualSurface);
    rig.start();
    rig.pump_until("preview frames", |rig| rig.monitor.presented() >= 2);

    rig.controller
        .start_record_video(&PathBuf::from("/tmp/dual-surface.mp4"));
    rig.pump_until("encoded frames", |rig| rig.recording.frames() >= 3);

    rig.controller.handle_pause().unwrap();
    assert!(!rig.controller.is_recording());
    rig.pump_until("stop event", |rig| rig.stopped_events() == 1);

    rig.controller.handle_resume().unwrap();
    let presented = rig.monitor.presented();
    rig.pump_until("preview after resume", |rig| rig.monitor.presented() >= presented + 3);
    assert!(!rig.controller.is_recording());
    assert_eq!(rig.recording.snapshot().sessions, 1);

    let soft = rig.soft.clone();
    rig.controller.shutdown().unwrap();
    assert_eq!(soft.stats().live_contexts, 0);
}

#[test]
fn filter_switch_reaches_render_thread() {
    let mut rig = Rig::new(ControllerKind::SharedContext);
    rig.start();
    rig.pump_until("preview frames", |rig| rig.monitor.presented() >= 1);
    rig.controller.set_filter(pipeline::FilterKind::BlackWhite);
    rig.pump_until("filter rebuild", |rig| {
        rig.controller.renderer_stats().program_rebuilds == 1
    });
    rig.pump_until("filtered frame", |rig| {
        rig.monitor.last_frame().is_some_and(|frame| {
            frame
                .pixels
                .data
                .chunks_exact(4)
                .all(|px| px[0] == px[1] && px[1] == px[2])
        })
    });
    rig.controller.shutdown().unwrap();
}

#[test]
fn missing_camera_is_surfaced() {
    let soft = Arc::new(SoftGpu::new());
    let mut controller = build_controller(
        ControllerKind::SharedContext,
        ControllerParts {
            gpu: soft,
            catalog: Arc::new(SyntheticCatalog::new()),
            sinks: MemoryRecording::counting().factory(),
            settings: PipelineSettings::default(),
        },
    )
    .unwrap();
    let err = controller.handle_resume().unwrap_err();
    assert!(format!("{err:#}").contains("no capture device"));
    controller.shutdown().unwrap();
}
