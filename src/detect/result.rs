use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates of the frame it was detected on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from a center point and size (YOLO output layout).
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// `(x2 - x1) * (y2 - y1)`. Not clamped: inverted boxes yield a negative area.
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center_x(&self) -> f32 {
        (self.x1 + self.x2) / 2.0
    }

    pub fn center_y(&self) -> f32 {
        (self.y1 + self.y2) / 2.0
    }

    /// Shift the box by an offset, e.g. from ROI-local to frame coordinates.
    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area().max(0.0) + other.area().max(0.0) - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One detector output: box, class label and confidence in `[0, 1]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub class_name: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BBox, class_name: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            class_name: class_name.into(),
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_and_center() {
        let b = BBox::new(10.0, 20.0, 30.0, 60.0);
        assert_eq!(b.area(), 800.0);
        assert_eq!(b.center_x(), 20.0);
        assert_eq!(b.center_y(), 40.0);
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn from_center_matches_corners() {
        let b = BBox::from_center(50.0, 50.0, 20.0, 10.0);
        assert_eq!(b, BBox::new(40.0, 45.0, 60.0, 55.0));
    }
}
