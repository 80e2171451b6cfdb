//! Target selection, motion control and the emergency latch.

pub mod emergency;
pub mod motion;
pub mod selector;

pub use emergency::{hand_raise_hits, EmergencyLatch, LatchReport, LatchState};
pub use motion::{ControlOutput, MotionController, SmoothedCommand, Status, TrackDiagnostics};
pub use selector::{seen_classes, select_target, Selection, TargetSelector};
