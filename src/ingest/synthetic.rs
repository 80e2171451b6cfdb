//! Synthetic scene for demos and tests.
//!
//! Renders a person-sized block that sweeps left and right across a grey
//! background and slowly approaches and recedes, together with the detection
//! a perfect detector would report for it.

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::detect::{BBox, Detection, ScriptedBackend};
use crate::frame::Frame;
use crate::transport::FrameChannel;

const BACKGROUND: [u8; 3] = [90, 90, 90];
const SUBJECT: [u8; 3] = [220, 60, 40];
const SWEEP_PERIOD: u64 = 120;
const DEPTH_PERIOD: u64 = 300;

pub struct SyntheticScene {
    width: u32,
    height: u32,
    class_name: String,
    frame_count: u64,
}

impl SyntheticScene {
    pub fn new(width: u32, height: u32, class_name: impl Into<String>) -> Self {
        Self {
            width,
            height,
            class_name: class_name.into(),
            frame_count: 0,
        }
    }

    /// Render the next frame and the detection for the subject in it.
    pub fn next_frame(&mut self) -> (Frame, Detection) {
        let seq = self.frame_count;
        self.frame_count += 1;

        let bbox = self.subject_box(seq);
        let mut image = RgbImage::from_pixel(self.width, self.height, Rgb(BACKGROUND));
        let x1 = bbox.x1.max(0.0) as u32;
        let y1 = bbox.y1.max(0.0) as u32;
        let x2 = (bbox.x2 as u32).min(self.width);
        let y2 = (bbox.y2 as u32).min(self.height);
        for y in y1..y2 {
            for x in x1..x2 {
                image.put_pixel(x, y, Rgb(SUBJECT));
            }
        }

        let detection = Detection::new(bbox, self.class_name.clone(), 0.9);
        (Frame::new(image, seq), detection)
    }

    fn subject_box(&self, seq: u64) -> BBox {
        let w = self.width as f32;
        let h = self.height as f32;
        let sweep = triangle_wave(seq, SWEEP_PERIOD);
        let depth = triangle_wave(seq, DEPTH_PERIOD);
        // 15%..35% of the frame width
        let box_w = w * (0.15 + 0.2 * depth);
        let box_h = (box_w * 2.2).min(h);
        let cx = box_w / 2.0 + (w - box_w) * sweep;
        let cy = h / 2.0;
        BBox::from_center(cx, cy, box_w, box_h)
    }

    /// Post frames into `channel` at `fps` until `stop` is raised.
    ///
    /// When `detector` is given its fallback batch is replaced with the
    /// subject's detection before each frame is posted.
    pub fn spawn(
        mut self,
        channel: FrameChannel,
        detector: Option<ScriptedBackend>,
        fps: u32,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
        std::thread::Builder::new()
            .name("synthetic-video".into())
            .spawn(move || {
                log::info!(
                    "synthetic video: {}x{} at {} fps",
                    self.width,
                    self.height,
                    fps
                );
                while !stop.load(Ordering::SeqCst) {
                    let (frame, detection) = self.next_frame();
                    if let Some(detector) = &detector {
                        detector.set_fallback(vec![detection]);
                    }
                    channel.post(frame);
                    std::thread::sleep(period);
                }
            })
            .context("spawn synthetic video thread")
    }
}

/// 0 → 1 → 0 over `period` frames.
fn triangle_wave(seq: u64, period: u64) -> f32 {
    let half = (period / 2).max(1);
    let phase = seq % (half * 2);
    let ramp = if phase < half { phase } else { half * 2 - phase };
    ramp as f32 / half as f32
}
