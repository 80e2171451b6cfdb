//! Hand-raise emergency latch.
//!
//! While following a person, every `hand_every_n`-th eligible iteration the
//! secondary detector inspects the target's box. A confident hand-raise hit
//! extends `hold_until` to at least `now + emergency_hold_s`; until that
//! instant passes, the controller output is replaced by a hard stop.
//!
//! Expiry has no event: `now < hold_until` is evaluated every iteration.

use anyhow::Result;
use std::time::{Duration, Instant};

use crate::config::EmergencySettings;
use crate::control::motion::{ControlOutput, Status};
use crate::detect::{Detection, DetectorBackend};
use crate::frame::{Frame, Roi};

/// Observable latch state for one iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatchState {
    Normal,
    /// A secondary check runs this iteration.
    Elevated,
    /// Hard stop is being forced.
    Latched,
}

/// Outcome of `EmergencyLatch::update`.
#[derive(Clone, Debug, PartialEq)]
pub struct LatchReport {
    pub state: LatchState,
    /// Hand-raise hits found this iteration, in frame coordinates.
    pub hits: Vec<Detection>,
}

pub struct EmergencyLatch {
    settings: EmergencySettings,
    hold: Duration,
    eligible_frames: u64,
    hold_until: Option<Instant>,
}

impl EmergencyLatch {
    pub fn new(settings: EmergencySettings) -> Result<Self> {
        let hold = settings.hold()?;
        Ok(Self {
            settings,
            hold,
            eligible_frames: 0,
            hold_until: None,
        })
    }

    pub fn settings(&self) -> &EmergencySettings {
        &self.settings
    }

    pub fn hold_until(&self) -> Option<Instant> {
        self.hold_until
    }

    pub fn is_latched(&self, now: Instant) -> bool {
        self.hold_until.is_some_and(|until| now < until)
    }

    /// Extend the hold to `now + hold`, never shortening an existing hold.
    ///
    /// If `now + hold` is not representable the existing hold is kept.
    pub fn extend(&mut self, now: Instant) {
        let Some(candidate) = now.checked_add(self.hold) else {
            log::error!(
                "emergency hold of {:.1}s overflows the clock; keeping {:?}",
                self.hold.as_secs_f64(),
                self.hold_until
            );
            return;
        };
        self.hold_until = Some(match self.hold_until {
            Some(existing) => existing.max(candidate),
            None => candidate,
        });
    }

    /// Advance the eligibility counter and report whether a check is due.
    ///
    /// Only iterations that follow a target of the person class count toward
    /// the stride.
    pub fn check_due(&mut self, target: Option<&Detection>, locked_class: Option<&str>) -> bool {
        if !self.settings.enabled || target.is_none() {
            return false;
        }
        if locked_class != Some(self.settings.person_class_name.as_str()) {
            return false;
        }
        self.eligible_frames += 1;
        self.eligible_frames % u64::from(self.settings.hand_every_n) == 0
    }

    /// Run the secondary detector on the target's region and return hits.
    ///
    /// A degenerate region skips the check. Detector errors are logged and
    /// treated as no hits.
    pub fn inspect(
        &self,
        frame: &Frame,
        target: &Detection,
        detector: &mut dyn DetectorBackend,
    ) -> Vec<Detection> {
        let Some(roi) = Roi::clamped(&target.bbox, frame.width(), frame.height()) else {
            log::debug!("hand check skipped: empty region for {:?}", target.bbox);
            return Vec::new();
        };
        let crop = frame.crop(roi);
        match detector.infer(&crop, self.settings.hand_conf_th) {
            Ok(detections) => hand_raise_hits(
                &detections,
                &self.settings.hand_class_name,
                self.settings.hand_conf_th,
                roi,
            ),
            Err(e) => {
                log::warn!("hand detector '{}' failed: {}", detector.name(), e);
                Vec::new()
            }
        }
    }

    /// One latch step: schedule, inspect, extend.
    pub fn update(
        &mut self,
        frame: &Frame,
        target: Option<&Detection>,
        locked_class: Option<&str>,
        detector: Option<&mut (dyn DetectorBackend + 'static)>,
        now: Instant,
    ) -> LatchReport {
        let mut hits = Vec::new();
        let mut checked = false;
        if let (Some(target), Some(detector)) = (target, detector) {
            if self.check_due(Some(target), locked_class) {
                checked = true;
                hits = self.inspect(frame, target, detector);
                if !hits.is_empty() {
                    self.extend(now);
                    log::warn!(
                        "hand raise detected ({} hit(s), best {:.2}); holding stop for {:.1}s",
                        hits.len(),
                        hits.iter().map(|h| h.confidence).fold(0.0f32, f32::max),
                        self.hold.as_secs_f64()
                    );
                }
            }
        }
        let state = if self.is_latched(now) {
            LatchState::Latched
        } else if checked {
            LatchState::Elevated
        } else {
            LatchState::Normal
        };
        LatchReport { state, hits }
    }

    /// Replace the controller output with a hard stop while latched.
    pub fn override_output(&self, output: ControlOutput, now: Instant) -> ControlOutput {
        if !self.is_latched(now) {
            return output;
        }
        ControlOutput {
            linear: 0.0,
            angular: 0.0,
            status: Status::Emergency,
            diagnostics: output.diagnostics,
        }
    }
}

/// Filter secondary detections to confident hand-raise hits and translate them
/// from ROI-local to frame coordinates.
pub fn hand_raise_hits(
    detections: &[Detection],
    hand_class: &str,
    threshold: f32,
    roi: Roi,
) -> Vec<Detection> {
    detections
        .iter()
        .filter(|d| d.class_name == hand_class && d.confidence >= threshold)
        .map(|d| Detection {
            bbox: d.bbox.translate(roi.x1 as f32, roi.y1 as f32),
            class_name: d.class_name.clone(),
            confidence: d.confidence,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, ScriptedBackend};

    fn settings() -> EmergencySettings {
        EmergencySettings {
            hand_every_n: 3,
            ..EmergencySettings::default()
        }
    }

    fn new_latch(settings: EmergencySettings) -> EmergencyLatch {
        EmergencyLatch::new(settings).unwrap()
    }

    fn person() -> Detection {
        Detection::new(BBox::new(100.0, 50.0, 300.0, 400.0), "person", 0.9)
    }

    fn hand(confidence: f32) -> Detection {
        Detection::new(BBox::new(10.0, 5.0, 40.0, 35.0), "Hand raise", confidence)
    }

    fn tracking_output() -> ControlOutput {
        ControlOutput {
            linear: 0.2,
            angular: -0.1,
            status: Status::Track {
                class: "person".into(),
                confidence: 0.9,
            },
            diagnostics: None,
        }
    }

    #[test]
    fn check_runs_every_nth_eligible_iteration() {
        let mut latch = new_latch(settings());
        let target = person();
        let due: Vec<bool> = (0..6)
            .map(|_| latch.check_due(Some(&target), Some("person")))
            .collect();
        assert_eq!(due, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn non_person_targets_are_never_checked() {
        let mut latch = new_latch(settings());
        let cup = Detection::new(BBox::new(0.0, 0.0, 10.0, 10.0), "cup", 0.9);
        for _ in 0..10 {
            assert!(!latch.check_due(Some(&cup), Some("cup")));
            assert!(!latch.check_due(None, Some("person")));
        }
    }

    #[test]
    fn disabled_latch_never_checks() {
        let mut latch = new_latch(EmergencySettings {
            enabled: false,
            hand_every_n: 1,
            ..EmergencySettings::default()
        });
        assert!(!latch.check_due(Some(&person()), Some("person")));
    }

    #[test]
    fn hold_only_extends_forward() {
        let mut latch = new_latch(settings());
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(2);
        latch.extend(t1);
        latch.extend(t0);
        assert_eq!(latch.hold_until(), Some(t1 + Duration::from_secs(5)));
        latch.extend(t0 + Duration::from_secs(4));
        assert_eq!(latch.hold_until(), Some(t0 + Duration::from_secs(9)));
    }

    #[test]
    fn latch_expires_by_time_alone() {
        let mut latch = new_latch(settings());
        let t0 = Instant::now();
        latch.extend(t0);
        assert!(latch.is_latched(t0));
        assert!(latch.is_latched(t0 + Duration::from_millis(4999)));
        assert!(!latch.is_latched(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn override_forces_zero_while_latched() {
        let mut latch = new_latch(settings());
        let t0 = Instant::now();
        assert_eq!(latch.override_output(tracking_output(), t0), tracking_output());
        latch.extend(t0);
        let out = latch.override_output(tracking_output(), t0 + Duration::from_secs(1));
        assert_eq!((out.linear, out.angular), (0.0, 0.0));
        assert_eq!(out.status, Status::Emergency);
    }

    #[test]
    fn hits_are_filtered_and_translated() {
        let roi = Roi {
            x1: 100,
            y1: 50,
            x2: 300,
            y2: 400,
        };
        let dets = vec![
            hand(0.9),
            hand(0.5),
            Detection::new(BBox::new(0.0, 0.0, 5.0, 5.0), "fist", 0.99),
        ];
        let hits = hand_raise_hits(&dets, "Hand raise", 0.65, roi);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].bbox, BBox::new(110.0, 55.0, 140.0, 85.0));
    }

    #[test]
    fn update_inspects_crop_and_latches_on_hit() {
        let mut latch = new_latch(EmergencySettings {
            hand_every_n: 1,
            ..EmergencySettings::default()
        });
        let hand_detector = ScriptedBackend::repeating(vec![hand(0.8)]);
        let mut detector: Box<dyn DetectorBackend> = Box::new(hand_detector.clone());
        let frame = Frame::solid(640, 480, [0, 0, 0]);
        let now = Instant::now();

        let report = latch.update(
            &frame,
            Some(&person()),
            Some("person"),
            Some(detector.as_mut()),
            now,
        );
        assert_eq!(report.state, LatchState::Latched);
        assert_eq!(report.hits.len(), 1);
        assert_eq!(hand_detector.last_frame_size(), Some((200, 350)));
        assert_eq!(latch.hold_until(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn update_with_degenerate_roi_skips_detector() {
        let mut latch = new_latch(EmergencySettings {
            hand_every_n: 1,
            ..EmergencySettings::default()
        });
        let hand_detector = ScriptedBackend::repeating(vec![hand(0.99)]);
        let mut detector: Box<dyn DetectorBackend> = Box::new(hand_detector.clone());
        let frame = Frame::solid(640, 480, [0, 0, 0]);
        let offscreen = Detection::new(BBox::new(700.0, 10.0, 900.0, 200.0), "person", 0.9);

        let report = latch.update(
            &frame,
            Some(&offscreen),
            Some("person"),
            Some(detector.as_mut()),
            Instant::now(),
        );
        assert_eq!(report.state, LatchState::Elevated);
        assert!(report.hits.is_empty());
        assert_eq!(hand_detector.calls(), 0);
        assert!(latch.hold_until().is_none());
    }

    #[test]
    fn out_of_range_hold_is_rejected() {
        for emergency_hold_s in [0.0, 1e19, 1e20, f64::NAN] {
            let settings = EmergencySettings {
                emergency_hold_s,
                ..EmergencySettings::default()
            };
            assert!(EmergencyLatch::new(settings).is_err(), "hold {}", emergency_hold_s);
        }
    }

    #[test]
    fn longest_hold_latches() {
        let mut latch = new_latch(EmergencySettings {
            emergency_hold_s: 3600.0,
            ..EmergencySettings::default()
        });
        let now = Instant::now();
        latch.extend(now);
        assert!(latch.is_latched(now + Duration::from_secs(3599)));
    }
}
