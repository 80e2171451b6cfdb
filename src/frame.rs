//! Video frames and regions of interest.
//!
//! - `Frame`: decoded RGB8 image owned by the control loop for one iteration.
//! - `Roi`: integer sub-rectangle clamped to frame bounds, used to crop the
//!   region handed to the secondary detector.
//!
//! Frames are replaced each iteration, never mutated in place.

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};

use crate::detect::BBox;

/// Decoded RGB8 video frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Monotonic sequence number assigned by the producer.
    seq: u64,
    received_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, seq: u64) -> Self {
        Self {
            image,
            seq,
            received_at: Instant::now(),
        }
    }

    /// Wrap raw interleaved RGB bytes.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, seq: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| anyhow!("invalid RGB buffer for {}x{}", width, height))?;
        Ok(Self::new(image, seq))
    }

    /// Decode an encoded image (JPEG/PNG) into a frame.
    pub fn decode(bytes: &[u8], seq: u64) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("decode frame")?;
        Ok(Self::new(image.into_rgb8(), seq))
    }

    /// Uniformly colored frame.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::new(RgbImage::from_pixel(width, height, Rgb(rgb)), 0)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Time since the frame entered the process.
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Resize to the configured working resolution. No-op when already sized.
    pub fn resized(self, width: u32, height: u32) -> Self {
        if self.width() == width && self.height() == height {
            return self;
        }
        let image = imageops::resize(&self.image, width, height, FilterType::Triangle);
        Self {
            image,
            seq: self.seq,
            received_at: self.received_at,
        }
    }

    /// Copy out a region of interest as a standalone frame.
    pub fn crop(&self, roi: Roi) -> Self {
        let image = imageops::crop_imm(&self.image, roi.x1, roi.y1, roi.width(), roi.height())
            .to_image();
        Self {
            image,
            seq: self.seq,
            received_at: self.received_at,
        }
    }
}

/// Integer region of interest, half-open on the right and bottom edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roi {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl Roi {
    /// Truncate a box to integer pixels and clamp it to
    /// `[0, width-1] x [0, height-1]`.
    ///
    /// Returns `None` when the clamped region is empty.
    pub fn clamped(bbox: &BBox, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let max_x = i64::from(width) - 1;
        let max_y = i64::from(height) - 1;
        let x1 = (bbox.x1 as i64).clamp(0, max_x);
        let x2 = (bbox.x2 as i64).clamp(0, max_x);
        let y1 = (bbox.y1 as i64).clamp(0, max_y);
        let y2 = (bbox.y2 as i64).clamp(0, max_y);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Self {
            x1: x1 as u32,
            y1: y1 as u32,
            x2: x2 as u32,
            y2: y2 as u32,
        })
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roi_is_clamped_to_frame() {
        let roi = Roi::clamped(&BBox::new(-20.0, 10.5, 700.0, 300.9), 640, 480).unwrap();
        assert_eq!(
            roi,
            Roi {
                x1: 0,
                y1: 10,
                x2: 639,
                y2: 300
            }
        );
    }

    #[test]
    fn degenerate_roi_is_rejected() {
        // entirely right of the frame collapses to a zero-width column
        assert!(Roi::clamped(&BBox::new(700.0, 10.0, 800.0, 50.0), 640, 480).is_none());
        // sub-pixel box truncates to nothing
        assert!(Roi::clamped(&BBox::new(10.2, 10.0, 10.9, 50.0), 640, 480).is_none());
    }

    #[test]
    fn crop_has_roi_dimensions() {
        let frame = Frame::solid(64, 48, [10, 20, 30]);
        let roi = Roi::clamped(&BBox::new(8.0, 4.0, 40.0, 20.0), 64, 48).unwrap();
        let crop = frame.crop(roi);
        assert_eq!((crop.width(), crop.height()), (32, 16));
        assert_eq!(crop.image().get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn from_rgb_checks_length() {
        assert!(Frame::from_rgb(vec![0; 10], 2, 2, 0).is_err());
        let frame = Frame::from_rgb(vec![0; 12], 2, 2, 7).unwrap();
        assert_eq!(frame.seq(), 7);
    }

    #[test]
    fn resize_to_working_resolution() {
        let frame = Frame::solid(320, 240, [1, 2, 3]).resized(640, 480);
        assert_eq!((frame.width(), frame.height()), (640, 480));
        assert_eq!(frame.pixels().len(), 640 * 480 * 3);
    }
}
