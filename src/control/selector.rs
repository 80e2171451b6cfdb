use std::collections::BTreeSet;

use crate::detect::Detection;

/// Result of one selection pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selection {
    /// Largest detection of the locked class, if any.
    pub target: Option<Detection>,
    /// Sorted, deduplicated class names seen this iteration (for operator
    /// candidate cycling). Recomputed every iteration.
    pub seen_classes: Vec<String>,
}

/// Chooses the active target among detections of the locked class.
#[derive(Clone, Debug)]
pub struct TargetSelector {
    /// Minimum confidence for a class to be listed as a candidate.
    seen_threshold: f32,
}

impl TargetSelector {
    pub fn new(seen_threshold: f32) -> Self {
        Self { seen_threshold }
    }

    pub fn select(&self, detections: &[Detection], locked_class: Option<&str>) -> Selection {
        Selection {
            target: self.target(detections, locked_class),
            seen_classes: self.candidates(detections),
        }
    }

    /// Class names an operator can pick from.
    pub fn candidates(&self, detections: &[Detection]) -> Vec<String> {
        seen_classes(detections, self.seen_threshold)
    }

    pub fn target(&self, detections: &[Detection], locked_class: Option<&str>) -> Option<Detection> {
        select_target(detections, locked_class).cloned()
    }
}

/// Pick the largest-area detection whose class equals `locked_class`.
///
/// Ties keep the first detection encountered (stable but arbitrary). Boxes
/// with zero or negative area are never selected.
pub fn select_target<'a>(
    detections: &'a [Detection],
    locked_class: Option<&str>,
) -> Option<&'a Detection> {
    let locked = locked_class?;
    let mut best: Option<&Detection> = None;
    let mut best_area = 0.0f32;
    for det in detections.iter().filter(|d| d.class_name == locked) {
        let area = det.bbox.area();
        if area > best_area {
            best_area = area;
            best = Some(det);
        }
    }
    best
}

/// Sorted unique class names among detections with `confidence >= min_confidence`.
pub fn seen_classes(detections: &[Detection], min_confidence: f32) -> Vec<String> {
    detections
        .iter()
        .filter(|d| d.confidence >= min_confidence)
        .map(|d| d.class_name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
