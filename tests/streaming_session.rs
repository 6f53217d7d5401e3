//! End-to-end streaming over an in-memory duplex
//!
//! A host session captures from a scripted screen and a viewer session
//! paints the regions it receives. GPU frames come from a scripted
//! duplication API so partial updates travel the whole pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remote_desk_stream::capture::cursor::HiddenCursorSource;
use remote_desk_stream::capture::desktop::NoopInputDesktop;
use remote_desk_stream::capture::gpu::UnsupportedDuplication;
use remote_desk_stream::capture::{
    AcquireOutcome, Bitmap, CaptureOrchestrator, CursorCompositor, CursorKind, CursorShape,
    CursorSource, CursorState, DisplayInfo, DisplayRegistry, DisplaySource, DuplicatedOutput,
    DuplicationApi, FallbackBackend, FaultCache, FrameError, FrameStreamer, GpuBackend, RawFrame,
    Rect, Rotation, ScreenCopier, StaticDisplaySource,
};
use remote_desk_stream::config::CaptureSettings;
use remote_desk_stream::error::CaptureError;
use remote_desk_stream::session::HostSession;
use remote_desk_stream::transport::{FrameTransport, TransportOptions, TransportState};
use remote_desk_stream::viewer::{viewer_handlers, SharedRenderer, ViewerSession};
use tokio_util::sync::CancellationToken;

fn desktop_displays() -> Vec<DisplayInfo> {
    vec![
        DisplayInfo::new(PRIMARY, Rect::new(0, 0, 64, 48), true),
        DisplayInfo::new(LEFT, Rect::new(-32, 0, 32, 32), false),
    ]
}

fn streamer(screen: SharedScreen) -> FrameStreamer<UnsupportedDuplication> {
    streamer_over(Box::new(StaticDisplaySource::new(desktop_displays())), screen)
}

fn streamer_over(source: Box<dyn DisplaySource>, screen: SharedScreen) -> FrameStreamer<UnsupportedDuplication> {
    let registry = Arc::new(DisplayRegistry::new(source));
    let orchestrator = CaptureOrchestrator::new(
        registry,
        None,
        FallbackBackend::new(Box::new(screen)),
        CursorCompositor::new(Box::new(HiddenCursorSource)),
        Box::new(NoopInputDesktop),
    );
    let settings = CaptureSettings {
        capture_cursor: false,
        prefer_gpu: false,
        ..CaptureSettings::default()
    };
    FrameStreamer::new(orchestrator, settings)
}

/// True once every pixel of `area` on the surface matches the screen
fn surface_matches(renderer: &SharedRenderer, screen: &SharedScreen, area: Rect) -> bool {
    let renderer = renderer.lock().unwrap();
    let Some(surface) = renderer.snapshot() else {
        return false;
    };
    let origin = renderer.surface_bounds();
    (area.y..area.bottom()).all(|y| {
        (area.x..area.right()).all(|x| {
            surface.pixel((x - origin.x) as u32, (y - origin.y) as u32) == screen.pixel(x, y)
        })
    })
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_streams_regions_into_viewer_surface() {
    let screen = SharedScreen::new();
    let (host_io, viewer_io) = tokio::io::duplex(256 * 1024);

    let host = HostSession::from_stream(host_io, "viewer", TransportOptions::default());
    let session_id = host.session().session_id();
    let cancel = CancellationToken::new();
    let host_task = tokio::spawn(host.run(streamer(screen.clone()), cancel.clone()));

    let viewer = ViewerSession::from_stream(viewer_io, "host", TransportOptions::default())
        .await
        .unwrap();
    let renderer = Arc::clone(viewer.renderer());

    // Keyframe of the primary display lands at its offset in the union surface
    eventually(|| surface_matches(&renderer, &screen, Rect::new(0, 0, 64, 48))).await;
    {
        let renderer = renderer.lock().unwrap();
        assert_eq!(renderer.session_id(), Some(session_id));
        assert_eq!(renderer.surface_bounds(), DESKTOP);
        assert_eq!(renderer.selected_display().unwrap().device_name, PRIMARY);
        // The left display has not been streamed yet
        let surface = renderer.snapshot().unwrap();
        assert_eq!(surface.pixel(0, 0), Some([0, 0, 0, 255]));
    }

    // A small change on the host reaches the viewer
    screen.fill(Rect::new(10, 10, 5, 5), [0, 0, 255, 255]);
    eventually(|| surface_matches(&renderer, &screen, Rect::new(8, 8, 9, 9))).await;

    // Switching displays streams the left monitor
    viewer.change_display(LEFT).await.unwrap();
    eventually(|| surface_matches(&renderer, &screen, Rect::new(-32, 0, 32, 32))).await;

    cancel.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(10), host_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(stats.regions_sent >= 3);
    assert!(stats.display_updates >= 1);
    assert!(stats.commands_relayed >= 2);
    assert!(stats.capture.key_frames >= 2);

    tokio::time::timeout(Duration::from_secs(10), viewer.wait_for_close())
        .await
        .unwrap();
    assert_eq!(viewer.transport().state(), TransportState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewer_disconnect_stops_host() {
    let (host_io, viewer_io) = tokio::io::duplex(256 * 1024);

    let host = HostSession::from_stream(host_io, "viewer", TransportOptions::default());
    let host_task = tokio::spawn(host.run(streamer(SharedScreen::new()), CancellationToken::new()));

    let viewer = ViewerSession::from_stream(viewer_io, "host", TransportOptions::default())
        .await
        .unwrap();
    let renderer = Arc::clone(viewer.renderer());
    eventually(|| renderer.lock().unwrap().regions_applied() > 0).await;

    viewer.close("viewer done").await;

    let stats = tokio::time::timeout(Duration::from_secs(10), host_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(stats.batches_sent >= 1);
}

/// Reports no displays for the first `failures` enumerations
struct FlakyDisplays {
    failures: AtomicUsize,
    calls: Arc<AtomicUsize>,
}

impl DisplaySource for FlakyDisplays {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CaptureError::EnumerationFailed("display driver restarting".to_string()));
        }
        Ok(desktop_displays())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_enumeration_recovers_without_reconnect() {
    let screen = SharedScreen::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let source = FlakyDisplays {
        failures: AtomicUsize::new(3),
        calls: Arc::clone(&calls),
    };
    let (host_io, viewer_io) = tokio::io::duplex(256 * 1024);

    let host = HostSession::from_stream(host_io, "viewer", TransportOptions::default());
    let cancel = CancellationToken::new();
    let host_task = tokio::spawn(host.run(streamer_over(Box::new(source), screen.clone()), cancel.clone()));

    let viewer = ViewerSession::from_stream(viewer_io, "host", TransportOptions::default())
        .await
        .unwrap();
    let renderer = Arc::clone(viewer.renderer());

    eventually(|| surface_matches(&renderer, &screen, Rect::new(0, 0, 64, 48))).await;
    assert!(calls.load(Ordering::SeqCst) > 3);
    assert_eq!(renderer.lock().unwrap().displays().len(), 2);

    cancel.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(10), host_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.display_updates, 1);
    assert_eq!(stats.capture.failures, 0);
}

const FULL_HD: Rect = Rect::new(0, 0, 1920, 1080);
const GRAY: [u8; 4] = [128, 128, 128, 255];
const RED: [u8; 4] = [0, 0, 255, 255];
const BLUE: [u8; 4] = [255, 0, 0, 255];
const WHITE: [u8; 4] = [255, 255, 255, 255];

type FrameScript = Arc<Mutex<VecDeque<RawFrame>>>;

struct ScriptedOutput {
    frames: FrameScript,
}

impl DuplicatedOutput for ScriptedOutput {
    fn bounds(&self) -> Rect {
        FULL_HD
    }

    fn rotation(&self) -> Rotation {
        Rotation::Identity
    }

    fn acquire_frame(&mut self) -> Result<AcquireOutcome, FrameError> {
        let next = self.frames.lock().unwrap().pop_front();
        Ok(next.map_or(AcquireOutcome::NoChanges, AcquireOutcome::Frame))
    }

    fn release_frame(&mut self) {}
}

/// Duplication whose outputs replay frames pushed by the test
struct ScriptedDuplication {
    frames: FrameScript,
}

impl DuplicationApi for ScriptedDuplication {
    type Output = ScriptedOutput;

    fn open_output(&mut self, _device_name: &str) -> Result<ScriptedOutput, CaptureError> {
        Ok(ScriptedOutput {
            frames: Arc::clone(&self.frames),
        })
    }
}

/// Opaque 16x16 pointer parked at one spot
struct ParkedPointer {
    shape: Arc<CursorShape>,
}

impl CursorSource for ParkedPointer {
    fn query(&mut self) -> Option<CursorState> {
        Some(CursorState {
            visible: true,
            x: 120,
            y: 120,
            kind: CursorKind::Arrow,
            shape: Some(Arc::clone(&self.shape)),
        })
    }
}

struct GrayScreen;

impl ScreenCopier for GrayScreen {
    fn copy_area(&mut self, area: Rect) -> Result<Bitmap, CaptureError> {
        Ok(Bitmap::filled(area.width as u32, area.height as u32, GRAY))
    }
}

fn gpu_streamer(frames: FrameScript) -> FrameStreamer<ScriptedDuplication> {
    let registry = Arc::new(DisplayRegistry::new(Box::new(StaticDisplaySource::new(vec![
        DisplayInfo::new(PRIMARY, FULL_HD, true),
    ]))));
    let pointer = ParkedPointer {
        shape: Arc::new(CursorShape {
            image: Bitmap::filled(16, 16, WHITE),
            hotspot_x: 0,
            hotspot_y: 0,
        }),
    };
    let orchestrator = CaptureOrchestrator::new(
        registry,
        Some(GpuBackend::new(ScriptedDuplication { frames }, FaultCache::default())),
        FallbackBackend::new(Box::new(GrayScreen)),
        CursorCompositor::new(Box::new(pointer)),
        Box::new(NoopInputDesktop),
    );
    let settings = CaptureSettings {
        capture_cursor: true,
        ..CaptureSettings::default()
    };
    FrameStreamer::new(orchestrator, settings)
}

fn surface_pixel(renderer: &SharedRenderer, x: u32, y: u32) -> Option<[u8; 4]> {
    renderer.lock().unwrap().snapshot().and_then(|s| s.pixel(x, y))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gpu_dirty_rect_and_pointer_repaint_only_their_pixels() {
    let frames = FrameScript::default();
    let (host_io, viewer_io) = tokio::io::duplex(1024 * 1024);

    let host = HostSession::from_stream(host_io, "viewer", TransportOptions::default());
    let cancel = CancellationToken::new();
    let host_task = tokio::spawn(host.run(gpu_streamer(Arc::clone(&frames)), cancel.clone()));

    // A bare transport sends no keyframe request, so the host's initial
    // keyframe is the only full frame
    let renderer = SharedRenderer::default();
    let viewer = FrameTransport::from_stream(
        viewer_io,
        "host",
        TransportOptions::default().with_handlers(viewer_handlers(&renderer)),
    );

    // Idle duplication plus the initial keyframe goes through the software
    // copy, with the pointer composited at (120, 120)
    eventually(|| surface_pixel(&renderer, 125, 125) == Some(WHITE)).await;
    assert_eq!(surface_pixel(&renderer, 0, 0), Some(GRAY));
    let before = renderer.lock().unwrap().regions_applied();
    assert_eq!(before, 1);

    // Everything outside the dirty rect differs from the surface; none of
    // it may be sent
    let mut texture = Bitmap::filled(1920, 1080, BLUE);
    texture.fill_rect(Rect::new(100, 100, 50, 50), RED);
    frames.lock().unwrap().push_back(RawFrame {
        bitmap: texture,
        dirty_rects: vec![Rect::new(100, 100, 50, 50)],
    });

    eventually(|| renderer.lock().unwrap().regions_applied() >= before + 2).await;
    assert_eq!(surface_pixel(&renderer, 100, 100), Some(RED));
    assert_eq!(surface_pixel(&renderer, 149, 149), Some(RED));
    assert_eq!(surface_pixel(&renderer, 120, 120), Some(WHITE));
    assert_eq!(surface_pixel(&renderer, 135, 135), Some(WHITE));
    assert_eq!(surface_pixel(&renderer, 99, 100), Some(GRAY));
    assert_eq!(surface_pixel(&renderer, 150, 150), Some(GRAY));
    assert_eq!(surface_pixel(&renderer, 1000, 500), Some(GRAY));

    // Idle polls afterwards send nothing
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(renderer.lock().unwrap().regions_applied(), before + 2);

    cancel.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(10), host_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.capture.key_frames, 1);
    tokio::time::timeout(Duration::from_secs(10), viewer.wait_for_close())
        .await
        .unwrap();
}
