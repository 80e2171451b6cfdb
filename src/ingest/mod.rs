//! Frame sources.
//!
//! Every source posts decoded frames into a `FrameChannel`; the control loop
//! only ever sees the freshest one.

pub mod synthetic;
pub mod tcp;

pub use synthetic::SyntheticScene;
pub use tcp::{encode_jpeg, write_frame_message, IngestStats, TcpFrameSubscriber, MAX_FRAME_BYTES};
