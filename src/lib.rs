//! Teleop follower
//!
//! Real-time tracking and motion control for a follower robot. Video frames
//! arrive over the network, a detector reports objects in each frame, and the
//! loop steers the robot toward the operator's chosen class of object.
//!
//! # Pipeline
//!
//! 1. **Frames**: a single-slot conflating mailbox always holds the freshest
//!    frame; older unread frames are dropped, so inference latency never
//!    builds a backlog.
//! 2. **Selection**: the operator locks a class; each iteration follows the
//!    largest detection of that class.
//! 3. **Control**: proportional steering on horizontal error and proportional
//!    approach on box area, with deadbands, clamps and exponential smoothing.
//! 4. **Emergency latch**: while following a person, a secondary detector
//!    periodically looks for a raised hand inside the person's box. A hit
//!    forces a zero-velocity command for a fixed hold period.
//! 5. **Commands**: one JSON record per iteration, best effort.
//!
//! # Module Structure
//!
//! - `frame`: decoded frames and regions of interest
//! - `ingest`: frame sources (TCP subscriber, synthetic scene)
//! - `detect`: detector trait and backends
//! - `control`: target selector, motion controller, emergency latch
//! - `operator`: operator commands and the target lock
//! - `notify`: speech and SMS workers
//! - `transport`: frame mailbox and command publishers
//! - `pipeline`: the control loop

pub mod config;
pub mod control;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod operator;
pub mod pipeline;
pub mod transport;

pub use config::FollowerConfig;
pub use control::{ControlOutput, EmergencyLatch, MotionController, SmoothedCommand, Status};
pub use detect::{BBox, Detection, DetectorBackend};
pub use frame::{Frame, Roi};
pub use operator::{OperatorCommand, OperatorInput, TargetLock};
pub use pipeline::{Detectors, FollowerLoop, IterationReport, Notifications};
pub use transport::{CommandPublisher, CommandRecord, FrameChannel};
