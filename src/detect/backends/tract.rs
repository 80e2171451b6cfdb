#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BBox, Detection};
use crate::frame::Frame;

const CXYWH_OFFSET: usize = 4;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single output tensor shaped `[1, 4 + num_classes, num_anchors]`
/// (center x, center y, width, height, then per-class scores). Frames are
/// stretched to the model input size and boxes are scaled back to frame pixels.
pub struct TractYoloBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    class_names: Vec<String>,
    iou_threshold: f32,
}

impl TractYoloBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            class_names,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        })
    }

    /// Override the default NMS IoU threshold.
    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized = imageops::resize(frame.image(), self.width, self.height, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn class_name(&self, id: usize) -> String {
        self.class_names
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    fn decode(&self, output: &Tensor, frame: &Frame, threshold: f32) -> Result<Vec<Detection>> {
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape();
        if shape.len() != 3 || shape[1] <= CXYWH_OFFSET {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }
        let num_classes = shape[1] - CXYWH_OFFSET;
        let anchors = shape[2];
        let sx = frame.width() as f32 / self.width as f32;
        let sy = frame.height() as f32 / self.height as f32;
        let max_x = frame.width() as f32;
        let max_y = frame.height() as f32;

        let mut detections = Vec::new();
        for i in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for c in 0..num_classes {
                let score = preds[[0, CXYWH_OFFSET + c, i]];
                if score > best.1 {
                    best = (c, score);
                }
            }
            let (class_id, confidence) = best;
            if confidence < threshold {
                continue;
            }
            let bbox = BBox::from_center(
                preds[[0, 0, i]] * sx,
                preds[[0, 1, i]] * sy,
                preds[[0, 2, i]] * sx,
                preds[[0, 3, i]] * sy,
            );
            let bbox = BBox::new(
                bbox.x1.clamp(0.0, max_x),
                bbox.y1.clamp(0.0, max_y),
                bbox.x2.clamp(0.0, max_x),
                bbox.y2.clamp(0.0, max_y),
            );
            detections.push(Detection::new(bbox, self.class_name(class_id), confidence));
        }

        non_max_suppression(&mut detections, self.iou_threshold);
        Ok(detections)
    }
}

/// Greedy per-class NMS; keeps the highest-confidence box of each cluster.
/// Overlapping boxes of different classes are all kept.
fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept = 0;
    for index in 0..detections.len() {
        let candidate = &detections[index];
        let overlaps = detections[..kept].iter().any(|prev| {
            prev.class_name == candidate.class_name
                && prev.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}

impl DetectorBackend for TractYoloBackend {
    fn name(&self) -> &'static str {
        "tract-yolo"
    }

    fn class_names(&self) -> Vec<String> {
        self.class_names.clone()
    }

    fn infer(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<Detection>> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        self.decode(output, frame, threshold)
    }
}
