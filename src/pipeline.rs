//! The follower control loop.
//!
//! One iteration: take the freshest frame, run primary detection, apply at
//! most one operator command, select the target, evaluate the controller,
//! run the emergency latch, smooth and publish. Every piece of state that
//! crosses iterations lives in `ControlState` and is touched only here.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use crate::config::FollowerConfig;
use crate::control::{
    ControlOutput, EmergencyLatch, LatchReport, LatchState, MotionController, SmoothedCommand,
    Status, TargetSelector,
};
use crate::detect::{Detection, DetectorBackend};
use crate::frame::Frame;
use crate::notify::Notifier;
use crate::operator::{LockEvent, OperatorCommand, OperatorInput, TargetLock};
use crate::transport::{CommandPublisher, CommandRecord, FrameChannel, Receive};

pub const STARTUP_PHRASE: &str = "Follow robot targeting";
pub const EMERGENCY_PHRASE: &str = "Emergency signal detected";
pub const EMERGENCY_ALERT: &str = "Emergency: Hand raise detected from followed person.";

const LOCK_SPEECH_COOLDOWN: Duration = Duration::from_millis(100);
const CLEAR_SPEECH_COOLDOWN: Duration = Duration::from_millis(500);
const EMERGENCY_SPEECH_COOLDOWN: Duration = Duration::from_secs(3);
const EMERGENCY_ALERT_COOLDOWN: Duration = Duration::from_secs(30);
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// State owned by the loop across iterations.
pub struct ControlState {
    pub lock: TargetLock,
    pub emergency: EmergencyLatch,
    pub motion: MotionController,
}

pub struct Detectors {
    pub primary: Box<dyn DetectorBackend>,
    /// Hand-raise detector. Without it the emergency latch never engages.
    pub secondary: Option<Box<dyn DetectorBackend>>,
}

pub struct Notifications {
    pub speech: Notifier,
    pub alerts: Notifier,
}

/// Everything that happened in one iteration.
#[derive(Clone, Debug)]
pub struct IterationReport {
    pub seq: u64,
    pub detections: usize,
    pub seen_classes: Vec<String>,
    pub event: Option<LockEvent>,
    pub target: Option<Detection>,
    pub latch: LatchReport,
    /// Controller output after the emergency override, before smoothing.
    pub output: ControlOutput,
    /// `None` when the iteration ended on a quit command.
    pub published: Option<CommandRecord>,
}

impl IterationReport {
    pub fn quit(&self) -> bool {
        matches!(self.event, Some(LockEvent::Quit))
    }
}

/// Loop rate and timeout counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopStats {
    pub iterations: u64,
    pub timeouts: u64,
    /// Filtered iterations per second.
    pub fps: f64,
    last_tick: Option<Instant>,
}

impl LoopStats {
    fn tick(&mut self, now: Instant) {
        self.iterations += 1;
        if let Some(prev) = self.last_tick {
            let dt = now.saturating_duration_since(prev).as_secs_f64();
            let instant = if dt > 0.0 { 1.0 / dt } else { 0.0 };
            self.fps = 0.9 * self.fps + 0.1 * instant;
        }
        self.last_tick = Some(now);
    }
}

pub struct FollowerLoop {
    config: FollowerConfig,
    state: ControlState,
    selector: TargetSelector,
    detectors: Detectors,
    publisher: Box<dyn CommandPublisher>,
    notifications: Notifications,
    stats: LoopStats,
    last_status: Status,
    last_seen: Vec<String>,
}

impl FollowerLoop {
    pub fn new(
        config: &FollowerConfig,
        detectors: Detectors,
        publisher: Box<dyn CommandPublisher>,
        notifications: Notifications,
    ) -> Result<Self> {
        let state = ControlState {
            lock: TargetLock::new(),
            emergency: EmergencyLatch::new(config.emergency.clone())?,
            motion: MotionController::new(
                config.control.clone(),
                config.video.width,
                config.video.height,
            ),
        };
        if detectors.secondary.is_none() && config.emergency.enabled {
            log::warn!("no hand-raise detector configured; emergency stop is inactive");
        }
        Ok(Self {
            config: config.clone(),
            state,
            selector: TargetSelector::new(config.video.conf_draw_th),
            detectors,
            publisher,
            notifications,
            stats: LoopStats::default(),
            last_status: Status::Search,
            last_seen: Vec::new(),
        })
    }

    /// Start with `class` already locked.
    pub fn with_locked_class(mut self, class: impl Into<String>) -> Self {
        self.state.lock = TargetLock::locked(class);
        self
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn announce_startup(&self) {
        self.notifications
            .speech
            .notify(STARTUP_PHRASE, LOCK_SPEECH_COOLDOWN);
    }

    /// Run one control iteration on `frame`.
    pub fn step(
        &mut self,
        frame: Frame,
        command: Option<OperatorCommand>,
        now: Instant,
    ) -> IterationReport {
        let frame = frame.resized(self.config.video.width, self.config.video.height);
        self.stats.tick(now);

        let detections = match self
            .detectors
            .primary
            .infer(&frame, self.config.video.conf_detect_th)
        {
            Ok(detections) => detections,
            Err(e) => {
                log::warn!(
                    "detector '{}' failed on frame {}: {:#}",
                    self.detectors.primary.name(),
                    frame.seq(),
                    e
                );
                Vec::new()
            }
        };

        let seen = self.selector.candidates(&detections);
        let event = command.and_then(|command| self.apply_command(command, &seen));
        self.last_seen.clone_from(&seen);
        let mut report = IterationReport {
            seq: frame.seq(),
            detections: detections.len(),
            seen_classes: seen,
            event,
            target: None,
            latch: LatchReport {
                state: LatchState::Normal,
                hits: Vec::new(),
            },
            output: ControlOutput {
                linear: 0.0,
                angular: 0.0,
                status: Status::Search,
                diagnostics: None,
            },
            published: None,
        };
        if report.quit() {
            return report;
        }

        let locked_class = self.state.lock.locked_class().map(str::to_string);
        let target = self.selector.target(&detections, locked_class.as_deref());
        let output = self.state.motion.evaluate(target.as_ref());

        let latch = self.state.emergency.update(
            &frame,
            target.as_ref(),
            locked_class.as_deref(),
            self.detectors.secondary.as_deref_mut(),
            now,
        );
        let output = self.state.emergency.override_output(output, now);
        let latched = latch.state == LatchState::Latched;
        if latched {
            self.notifications
                .speech
                .notify(EMERGENCY_PHRASE, EMERGENCY_SPEECH_COOLDOWN);
            self.notifications
                .alerts
                .notify(EMERGENCY_ALERT, EMERGENCY_ALERT_COOLDOWN);
        }

        let smoothed = self.state.motion.smooth(output.linear, output.angular);
        // the filter keeps running while latched, but the robot sees a hard stop
        let command = if latched {
            SmoothedCommand::default()
        } else {
            smoothed
        };
        let record = CommandRecord::new(command, &output.status, SystemTime::now());
        if let Err(e) = self.publisher.publish(&record) {
            log::warn!("{} publish failed: {:#}", self.publisher.name(), e);
        }

        if output.status != self.last_status {
            log::info!("status: {} -> {}", self.last_status, output.status);
            self.last_status = output.status.clone();
        }

        report.target = target;
        report.latch = latch;
        report.output = output;
        report.published = Some(record);
        report
    }

    fn apply_command(&mut self, command: OperatorCommand, seen: &[String]) -> Option<LockEvent> {
        let event = self.state.lock.apply(command, seen)?;
        match &event {
            LockEvent::CandidateSelected(class) => log::info!("selected candidate: {}", class),
            LockEvent::CandidateCleared => log::info!("no classes seen; candidate cleared"),
            LockEvent::Locked(class) => {
                log::info!("target locked: {}", class);
                self.notifications.speech.notify(
                    &format!("Target locked is {}", class),
                    LOCK_SPEECH_COOLDOWN,
                );
            }
            LockEvent::Cleared => {
                log::info!("target cleared");
                self.notifications
                    .speech
                    .notify("Target cleared", CLEAR_SPEECH_COOLDOWN);
            }
            LockEvent::Quit => log::info!("quit requested by operator"),
        }
        Some(event)
    }

    /// Publish a zero-velocity record, used when the loop exits.
    pub fn publish_stop(&mut self) {
        let record = CommandRecord::new(SmoothedCommand::default(), &Status::Search, SystemTime::now());
        if let Err(e) = self.publisher.publish(&record) {
            log::warn!("{} final stop publish failed: {:#}", self.publisher.name(), e);
        }
    }

    /// Drive the loop until `stop` is raised or the operator quits.
    pub fn run(
        &mut self,
        frames: &FrameChannel,
        operator: &OperatorInput,
        stop: &AtomicBool,
    ) -> Result<()> {
        let timeout = self.config.transport.rcv_timeout();
        let mut last_health = Instant::now();
        log::info!(
            "control loop running at {}x{}; commands: c=cycle 1-9=select l=lock x=clear q=quit",
            self.config.video.width,
            self.config.video.height
        );

        while !stop.load(Ordering::SeqCst) {
            match frames.try_receive(timeout) {
                Receive::Fresh(frame) => {
                    let report = self.step(frame, operator.next(), Instant::now());
                    if report.quit() {
                        stop.store(true, Ordering::SeqCst);
                    }
                    if let Some(diag) = report.output.diagnostics {
                        log::debug!(
                            "frame {}: cx={:.1} err_x={:.3} area={:.3}",
                            report.seq,
                            diag.cx,
                            diag.err_x,
                            diag.area_frac
                        );
                    }
                }
                Receive::Timeout => {
                    self.stats.timeouts += 1;
                    log::warn!(
                        "no frames received in {} ms (timeout). Check publisher / firewall / IP.",
                        timeout.as_millis()
                    );
                }
            }

            if last_health.elapsed() >= HEALTH_INTERVAL {
                last_health = Instant::now();
                self.log_health(frames);
            }
        }

        self.publish_stop();
        log::info!("control loop stopped after {} iterations", self.stats.iterations);
        Ok(())
    }

    fn log_health(&self, frames: &FrameChannel) {
        let mailbox = frames.stats();
        log::info!(
            "health: {:.1} fps, iterations={}, timeouts={}, frames posted={} dropped_unread={}, status={}, seen=[{}], locked={}, candidate={}",
            self.stats.fps,
            self.stats.iterations,
            self.stats.timeouts,
            mailbox.posted,
            mailbox.conflated,
            self.last_status,
            self.last_seen.join(", "),
            self.state.lock.locked_class().unwrap_or("(none)"),
            self.state.lock.selected_candidate().unwrap_or("(none)")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_filter_blends_toward_instant_rate() {
        let mut stats = LoopStats::default();
        let t0 = Instant::now();
        stats.tick(t0);
        assert_eq!(stats.fps, 0.0);
        stats.tick(t0 + Duration::from_millis(100));
        assert!((stats.fps - 1.0).abs() < 1e-9);
        stats.tick(t0 + Duration::from_millis(200));
        assert!((stats.fps - 1.9).abs() < 1e-9);
        assert_eq!(stats.iterations, 3);
    }
}
