//! Proportional follower controller.
//!
//! Angular velocity steers the target's horizontal center toward the image
//! center; linear velocity drives the target's box area toward
//! `desired_area` of the frame. Both axes have a deadband, a symmetric clamp,
//! and share an exponential smoothing filter applied after any emergency
//! override.

use std::fmt;

use crate::config::ControlSettings;
use crate::detect::Detection;

/// What the controller is doing this iteration.
#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    /// No target: constant search velocity.
    Search,
    /// Following a target of `class` detected with `confidence`.
    Track { class: String, confidence: f32 },
    /// Emergency latch is forcing a stop.
    Emergency,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Search => write!(f, "SEARCH"),
            Status::Track { class, confidence } => {
                write!(f, "TRACK '{}' ({:.2})", class, confidence)
            }
            Status::Emergency => write!(f, "EMERGENCY: HAND RAISE"),
        }
    }
}

/// Per-target measurements, kept for logging.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackDiagnostics {
    pub cx: f64,
    pub err_x: f64,
    pub area_frac: f64,
}

/// Raw (pre-smoothing) controller output.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlOutput {
    pub linear: f64,
    pub angular: f64,
    pub status: Status,
    pub diagnostics: Option<TrackDiagnostics>,
}

/// Exponentially filtered command actually published.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SmoothedCommand {
    pub linear: f64,
    pub angular: f64,
}

pub struct MotionController {
    settings: ControlSettings,
    center_x: f64,
    frame_area: f64,
    smoothed: SmoothedCommand,
}

impl MotionController {
    pub fn new(settings: ControlSettings, width: u32, height: u32) -> Self {
        Self {
            settings,
            // integer midpoint, matching the pixel grid the detector reports on
            center_x: f64::from(width / 2),
            frame_area: f64::from(width) * f64::from(height),
            smoothed: SmoothedCommand::default(),
        }
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    /// Map the current target (or its absence) to a raw velocity pair.
    pub fn evaluate(&self, target: Option<&Detection>) -> ControlOutput {
        let s = &self.settings;
        let Some(target) = target else {
            return ControlOutput {
                linear: s.search_linear,
                angular: s.search_angular,
                status: Status::Search,
                diagnostics: None,
            };
        };

        let cx = f64::from(target.bbox.center_x());
        let err_x = if self.center_x > 0.0 {
            (self.center_x - cx) / self.center_x
        } else {
            0.0
        };
        let angular = if err_x.abs() < s.angular_deadzone {
            0.0
        } else {
            clamp_symmetric(s.kp_ang * err_x, s.max_angular)
        };

        let area_frac = if self.frame_area > 0.0 {
            f64::from(target.bbox.area()) / self.frame_area
        } else {
            0.0
        };
        let area_error = s.desired_area - area_frac;
        let linear = if area_error.abs() < s.area_deadband {
            0.0
        } else {
            let v = clamp_symmetric(s.kp_lin * area_error, s.max_linear);
            // TODO: the snap below jumps from 0 to min_move_linear at the
            // deadband edge; ramp it once the drive's dead zone is characterised.
            if v != 0.0 && v.abs() < s.min_move_linear {
                s.min_move_linear.copysign(v)
            } else {
                v
            }
        };

        ControlOutput {
            linear,
            angular,
            status: Status::Track {
                class: target.class_name.clone(),
                confidence: target.confidence,
            },
            diagnostics: Some(TrackDiagnostics {
                cx,
                err_x,
                area_frac,
            }),
        }
    }

    /// Feed one raw command through the exponential filter.
    ///
    /// The filter state persists across target loss and is never reset.
    pub fn smooth(&mut self, linear: f64, angular: f64) -> SmoothedCommand {
        let s = self.settings.smoothing;
        self.smoothed.linear = s * self.smoothed.linear + (1.0 - s) * linear;
        self.smoothed.angular = s * self.smoothed.angular + (1.0 - s) * angular;
        self.smoothed
    }

    pub fn smoothed(&self) -> SmoothedCommand {
        self.smoothed
    }
}

fn clamp_symmetric(value: f64, limit: f64) -> f64 {
    value.clamp(-limit, limit)
}
