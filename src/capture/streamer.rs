//! Capture loop
//!
//! `FrameStreamer` runs on its own thread, one capture per frame interval,
//! and turns tagged capture results into encoded region batches. Batches go
//! to the async side through a channel of capacity 1, so the next capture
//! only starts once the previous batch has been taken.
//!
//! Keyframes (the whole display at the default quality) are sent when
//! requested, when the display or its area changes, after a failure, and
//! when adaptive quality has degraded but bandwidth has recovered.
//!
//! The display set is enumerated again every `display_poll_ms`. A changed
//! set is announced to the consumer, the selected display is looked up
//! again by name, and the GPU duplication is reopened on the next capture.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::capture::cursor::CursorKind;
use crate::capture::display::primary_of;
use crate::capture::failure_log::FailureLog;
use crate::capture::gpu::{DuplicationApi, SystemDuplication};
use crate::capture::orchestrator::CaptureOrchestrator;
use crate::capture::types::{Bitmap, CaptureResult, CapturedFrame, DirtyRects, DisplayInfo, Rect};
use crate::codec::RegionEncoder;
use crate::config::CaptureSettings;
use crate::error::CodecResult;

/// Frames between quality updates
const QUALITY_UPDATE_EVERY: u64 = 5;

/// Window of sent sizes used for the bandwidth estimate
const BANDWIDTH_WINDOW: Duration = Duration::from_secs(20);

/// Largest quality increase per update
const QUALITY_STEP_UP: u8 = 2;

/// Longest throttle pause
const MAX_THROTTLE: Duration = Duration::from_millis(100);

/// Control requests for the capture loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamerCommand {
    /// Stream the display with this device name
    ChangeDisplay(String),
    /// Send a keyframe next
    RequestKeyFrame,
}

/// One encoded region
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedRegion {
    /// Bounds in virtual-desktop coordinates
    pub area: Rect,
    /// PNG or JPEG bytes
    pub encoded_image: Vec<u8>,
}

impl std::fmt::Debug for EncodedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncodedRegion({}, {} bytes)", self.area, self.encoded_image.len())
    }
}

/// Regions produced by one capture
#[derive(Debug, Clone)]
pub struct FrameBatch {
    /// Display the regions belong to
    pub device_name: String,
    /// Disjoint changed regions
    pub regions: Vec<EncodedRegion>,
    /// Whether this batch covers the whole display
    pub is_key_frame: bool,
    /// Whether the GPU path produced the frame
    pub is_using_gpu: bool,
}

impl FrameBatch {
    /// Total encoded bytes
    pub fn encoded_len(&self) -> usize {
        self.regions.iter().map(|r| r.encoded_image.len()).sum()
    }
}

/// Output of the capture loop
#[derive(Debug, Clone)]
pub enum StreamerEvent {
    /// Display set, sent first and after every change
    Displays(Arc<[DisplayInfo]>),
    /// Encoded regions
    Regions(FrameBatch),
    /// Pointer shape changed
    CursorChanged(CursorKind),
}

/// Result of one loop iteration
#[derive(Debug, Default)]
pub struct StepOutcome {
    /// Events to hand to the consumer, in order
    pub events: Vec<StreamerEvent>,
    /// Minimum pause before the next iteration
    pub delay: Duration,
}

/// Counters kept by the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamerStats {
    /// Captures that produced a frame
    pub frames: u64,
    /// Keyframes sent
    pub key_frames: u64,
    /// Regions sent
    pub regions: u64,
    /// Encoded bytes sent
    pub bytes: u64,
    /// Failed captures
    pub failures: u64,
}

/// Bandwidth-driven JPEG quality
#[derive(Debug)]
pub struct AdaptiveQuality {
    default_quality: u8,
    min_quality: u8,
    target_mbps: f64,
    current: u8,
    needs_key_frame: bool,
    frames: u64,
    mbps: f64,
    sent: VecDeque<(Instant, usize)>,
}

impl AdaptiveQuality {
    /// Creates the controller at the default quality
    pub fn new(default_quality: u8, min_quality: u8, target_mbps: f64) -> Self {
        Self {
            default_quality,
            min_quality: min_quality.min(default_quality),
            target_mbps,
            current: default_quality,
            needs_key_frame: false,
            frames: 0,
            mbps: 0.0,
            sent: VecDeque::new(),
        }
    }

    /// Quality for the next non-key frame
    pub fn current(&self) -> u8 {
        self.current
    }

    /// Quality for keyframes
    pub fn default_quality(&self) -> u8 {
        self.default_quality
    }

    /// Latest bandwidth estimate
    pub fn mbps(&self) -> f64 {
        self.mbps
    }

    /// Records bytes handed to the transport
    pub fn record_sent(&mut self, bytes: usize, now: Instant) {
        self.sent.push_back((now, bytes));
    }

    fn measure(&mut self, now: Instant) -> f64 {
        while let Some((at, _)) = self.sent.front() {
            if now.duration_since(*at) > BANDWIDTH_WINDOW {
                self.sent.pop_front();
            } else {
                break;
            }
        }

        let bytes: usize = self.sent.iter().map(|(_, size)| size).sum();
        let span = self
            .sent
            .front()
            .map(|(at, _)| now.duration_since(*at))
            .unwrap_or_default()
            .max(Duration::from_secs(1));
        bytes as f64 * 8.0 / 1_000_000.0 / span.as_secs_f64()
    }

    /// Counts a frame; every few frames the quality is recomputed
    pub fn on_frame(&mut self, now: Instant) {
        self.frames += 1;
        if self.frames % QUALITY_UPDATE_EVERY != 0 {
            return;
        }

        self.mbps = self.measure(now);
        let wanted = if self.mbps > 0.0 {
            (self.target_mbps / self.mbps * self.default_quality as f64)
                .clamp(self.min_quality as f64, self.default_quality as f64) as u8
        } else {
            self.default_quality
        };

        if wanted < self.current {
            self.current = wanted;
        } else {
            self.current = self.current.saturating_add(QUALITY_STEP_UP).min(wanted);
        }

        if self.current < self.default_quality {
            self.needs_key_frame = true;
        }
        trace!("Bandwidth {:.2} Mbps, quality {}", self.mbps, self.current);
    }

    /// True when quality dropped earlier and bandwidth now has headroom
    pub fn wants_key_frame(&self) -> bool {
        self.needs_key_frame && self.mbps < self.target_mbps * 0.5
    }

    /// Notes that a full-quality keyframe went out
    pub fn key_frame_sent(&mut self) {
        self.needs_key_frame = false;
    }

    /// Pause to apply while far above the target bandwidth
    pub fn throttle(&self) -> Option<Duration> {
        if self.target_mbps <= 0.0 || self.mbps <= self.target_mbps * 2.0 {
            return None;
        }
        let millis = self.mbps / self.target_mbps * 10.0;
        Some(Duration::from_secs_f64(millis / 1000.0).min(MAX_THROTTLE))
    }
}

/// Handle to a running capture loop
pub struct StreamerHandle {
    /// Control channel into the loop
    pub commands: mpsc::UnboundedSender<StreamerCommand>,
    /// Output of the loop
    pub events: mpsc::Receiver<StreamerEvent>,
    thread: JoinHandle<StreamerStats>,
}

impl StreamerHandle {
    /// Waits for the loop thread to exit and returns its counters
    ///
    /// Cancel the loop's token (or drop `events`) first.
    pub fn join(self) -> StreamerStats {
        let StreamerHandle { events, thread, .. } = self;
        drop(events);
        thread.join().unwrap_or_else(|_| {
            error!("Capture thread panicked");
            StreamerStats::default()
        })
    }
}

/// Turns captures of the selected display into region batches
pub struct FrameStreamer<A: DuplicationApi = SystemDuplication> {
    orchestrator: CaptureOrchestrator<A>,
    settings: CaptureSettings,
    encoder: RegionEncoder,
    quality: AdaptiveQuality,
    selected: Option<DisplayInfo>,
    force_key_frame: bool,
    announce_displays: bool,
    last_key_frame: Option<(String, Rect)>,
    last_bitmap: Option<Bitmap>,
    next_display_poll: Option<Instant>,
    selection_log: FailureLog,
    stats: StreamerStats,
}

impl<A: DuplicationApi + 'static> FrameStreamer<A> {
    /// Creates a streamer for the primary display
    pub fn new(orchestrator: CaptureOrchestrator<A>, settings: CaptureSettings) -> Self {
        let encoder = RegionEncoder::new(settings.codec, settings.jpeg_quality);
        let quality = AdaptiveQuality::new(settings.jpeg_quality, settings.min_jpeg_quality, settings.target_mbps);
        let next_display_poll = settings.display_poll_interval().map(|every| Instant::now() + every);
        Self {
            orchestrator,
            settings,
            encoder,
            quality,
            selected: None,
            force_key_frame: true,
            announce_displays: true,
            last_key_frame: None,
            last_bitmap: None,
            next_display_poll,
            selection_log: FailureLog::with_default_interval("Display selection"),
            stats: StreamerStats::default(),
        }
    }

    /// Counters so far
    pub fn stats(&self) -> StreamerStats {
        self.stats
    }

    /// Display currently streamed
    pub fn selected_display(&self) -> Option<&DisplayInfo> {
        self.selected.as_ref()
    }

    /// Applies a control request
    pub fn handle_command(&mut self, command: StreamerCommand) {
        debug!("Capture loop command: {:?}", command);
        match command {
            StreamerCommand::ChangeDisplay(name) => {
                match self.orchestrator.registry().try_find_display(&name) {
                    Some(found) => {
                        info!("Switching capture to {}", found.device_name);
                        self.selected = Some(found);
                        self.last_bitmap = None;
                    }
                    None => warn!("Ignoring request for unknown display {}", name),
                }
            }
            StreamerCommand::RequestKeyFrame => self.force_key_frame = true,
        }
    }

    /// Enumerates the displays now; returns true if the set changed
    pub fn check_displays(&mut self) -> bool {
        match self.orchestrator.registry().refresh() {
            Some(displays) => {
                self.apply_display_set(&displays);
                true
            }
            None => false,
        }
    }

    fn poll_displays_if_due(&mut self, now: Instant) {
        let (Some(due), Some(every)) = (self.next_display_poll, self.settings.display_poll_interval()) else {
            return;
        };
        if now < due {
            return;
        }
        self.next_display_poll = Some(now + every);
        self.check_displays();
    }

    /// Restarts streaming on a new display set
    ///
    /// The selected display is kept if it is still attached (with its new
    /// bounds), otherwise the primary display takes over.
    fn apply_display_set(&mut self, displays: &[DisplayInfo]) {
        let previous = self.selected.take();
        self.selected = previous
            .as_ref()
            .and_then(|old| displays.iter().find(|d| d.device_name == old.device_name).cloned())
            .or_else(|| primary_of(displays));

        match (&previous, &self.selected) {
            (Some(old), Some(new)) if old.device_name != new.device_name => {
                info!("{} is gone, capturing {} instead", old.device_name, new.device_name)
            }
            (Some(old), Some(new)) if old.monitor_area != new.monitor_area => {
                info!("{} moved from {} to {}", new.device_name, old.monitor_area, new.monitor_area)
            }
            _ => {}
        }

        self.orchestrator.release_gpu();
        self.last_bitmap = None;
        self.force_key_frame = true;
        self.announce_displays = true;
    }

    fn should_send_key_frame(&self, target: &DisplayInfo) -> bool {
        if self.force_key_frame || self.quality.wants_key_frame() {
            return true;
        }
        match &self.last_key_frame {
            Some((name, area)) => *name != target.device_name || *area != target.monitor_area,
            None => true,
        }
    }

    fn encode(&self, bitmap: &Bitmap, local: Rect, origin: (i32, i32), quality: u8) -> CodecResult<EncodedRegion> {
        Ok(EncodedRegion {
            area: local.offset(origin.0, origin.1),
            encoded_image: self.encoder.encode_region(bitmap, local, quality)?,
        })
    }

    fn encode_frame(&self, target: &DisplayInfo, frame: &CapturedFrame, key_frame: bool) -> CodecResult<Vec<EncodedRegion>> {
        let bitmap = &frame.bitmap;
        let bounds = bitmap.bounds();
        let origin = (target.monitor_area.x, target.monitor_area.y);

        if key_frame {
            let quality = self.quality.default_quality();
            return Ok(vec![self.encode(bitmap, bounds, origin, quality)?]);
        }

        let quality = self.quality.current();
        match &frame.dirty_rects {
            DirtyRects::Partial(rects) => rects
                .iter()
                .map(|r| r.intersect(&bounds))
                .filter(|r| !r.is_empty())
                .map(|r| self.encode(bitmap, r, origin, quality))
                .collect(),
            DirtyRects::Full => {
                let changed = bitmap.changed_area(self.last_bitmap.as_ref());
                if changed.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![self.encode(bitmap, changed, origin, quality)?])
            }
        }
    }

    /// Runs one capture iteration
    pub fn step(&mut self) -> StepOutcome {
        let mut outcome = StepOutcome::default();
        self.poll_displays_if_due(Instant::now());

        // An empty set means enumeration is failing; announce once it recovers
        if self.announce_displays {
            let displays = self.orchestrator.registry().displays();
            if !displays.is_empty() {
                self.announce_displays = false;
                outcome.events.push(StreamerEvent::Displays(displays));
            }
        }

        if let Some(kind) = self.orchestrator.poll_cursor_kind() {
            outcome.events.push(StreamerEvent::CursorChanged(kind));
        }

        if self.selected.is_none() {
            self.selected = self.orchestrator.registry().primary_display();
        }
        let target = match self.selected.clone() {
            Some(target) => {
                self.selection_log.success();
                target
            }
            None => {
                self.selection_log.failure(&"no display is attached");
                outcome.delay = self.settings.after_failure_delay();
                return outcome;
            }
        };

        let key_frame = self.should_send_key_frame(&target);
        let result = self
            .orchestrator
            .capture_display(&target, self.settings.capture_cursor, key_frame);

        match result {
            CaptureResult::NoChanges => {
                outcome.delay = self.settings.no_change_delay();
            }
            CaptureResult::Failed(failure) => {
                self.stats.failures += 1;
                debug!("Capture of {} failed: {}", target.device_name, failure.reason);
                self.last_bitmap = None;
                self.force_key_frame = true;
                outcome.delay = self.settings.after_failure_delay();
            }
            CaptureResult::Frame(frame) => {
                self.stats.frames += 1;
                match self.encode_frame(&target, &frame, key_frame) {
                    Ok(regions) if regions.is_empty() => {
                        outcome.delay = self.settings.no_change_delay();
                    }
                    Ok(regions) => {
                        let batch = FrameBatch {
                            device_name: target.device_name.clone(),
                            regions,
                            is_key_frame: key_frame,
                            is_using_gpu: frame.is_using_gpu,
                        };
                        let now = Instant::now();
                        self.quality.record_sent(batch.encoded_len(), now);
                        self.stats.regions += batch.regions.len() as u64;
                        self.stats.bytes += batch.encoded_len() as u64;
                        outcome.events.push(StreamerEvent::Regions(batch));
                    }
                    Err(e) => {
                        error!("Failed to encode frame: {}", e);
                        self.force_key_frame = true;
                        outcome.delay = self.settings.after_failure_delay();
                        return outcome;
                    }
                }

                if key_frame {
                    self.stats.key_frames += 1;
                    self.force_key_frame = false;
                    self.quality.key_frame_sent();
                    self.last_key_frame = Some((target.device_name.clone(), target.monitor_area));
                }
                self.last_bitmap = Some(frame.bitmap);
            }
        }

        self.quality.on_frame(Instant::now());
        if let Some(pause) = self.quality.throttle() {
            trace!("Throttling capture for {:?}", pause);
            outcome.delay = outcome.delay.max(pause);
        }
        outcome
    }

    fn run(
        mut self,
        events: mpsc::Sender<StreamerEvent>,
        mut commands: mpsc::UnboundedReceiver<StreamerCommand>,
        cancel: CancellationToken,
    ) -> StreamerStats {
        let interval = self.settings.frame_interval();
        info!("Capture loop started at {} FPS", self.settings.fps);

        'capture: while !cancel.is_cancelled() {
            let started = Instant::now();

            while let Ok(command) = commands.try_recv() {
                self.handle_command(command);
            }

            let outcome = self.step();
            for event in outcome.events {
                if events.blocking_send(event).is_err() {
                    debug!("Event receiver closed, stopping capture");
                    break 'capture;
                }
            }

            let wait = outcome.delay.max(interval.saturating_sub(started.elapsed()));
            if !wait.is_zero() && !cancel.is_cancelled() {
                std::thread::sleep(wait);
            }
        }

        info!(
            "Capture loop stopped after {} frame(s), {} keyframe(s)",
            self.stats.frames, self.stats.key_frames
        );
        self.stats
    }

    /// Starts the loop on a dedicated thread
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn spawn(self, cancel: CancellationToken) -> std::io::Result<StreamerHandle> {
        let (event_tx, event_rx) = mpsc::channel(1);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name("screen-capture".to_string())
            .spawn(move || self.run(event_tx, command_rx, cancel))?;

        Ok(StreamerHandle {
            commands: command_tx,
            events: event_rx,
            thread,
        })
    }
}
