use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// Both the primary object detector and the secondary hand-raise detector sit
/// behind this trait. The control loop calls `infer` once per frame (primary)
/// or once per scheduled region of interest (secondary).
///
/// Implementations must tolerate frames of any size: the secondary detector
/// receives crops, not full frames. Returned boxes are in the pixel
/// coordinates of the frame that was passed in. An empty result is an
/// ordinary outcome, not an error.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Class labels this backend can emit, when known.
    fn class_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run detection, keeping only results with `confidence >= threshold`.
    fn infer(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
