//! Box drawing and detection labels.
//!
//! Only rectangles are rasterised. Labels and overlay lines travel alongside
//! the pixels so a display layer can render text however it likes.

use crate::detect::{Detection, PixelBox};
use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub bbox: PixelBox,
    pub label: String,
}

#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub annotations: Vec<Annotation>,
    /// Frame-level text such as `Persons: 2` or `FPS: 29.8`.
    pub overlay: Vec<String>,
}

impl AnnotatedFrame {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            annotations: Vec::new(),
            overlay: Vec::new(),
        }
    }
}

/// `ID-<track>: <conf>` for tracked subjects, `Person: <conf>` otherwise.
pub fn label_for(detection: &Detection) -> String {
    match detection.track_id {
        Some(track) => format!("ID-{}: {:.2}", track, detection.confidence),
        None => format!("Person: {:.2}", detection.confidence),
    }
}

/// Draw the outline of `bbox` (inclusive corners), growing inwards for `thickness > 1`.
pub fn draw_box(frame: &mut Frame, bbox: &PixelBox, color: [u8; 3], thickness: u32) {
    if frame.validate().is_err() {
        return;
    }
    let x2 = bbox.x2.min(frame.width - 1);
    let y2 = bbox.y2.min(frame.height - 1);
    for ring in 0..thickness.max(1) {
        let (left, top) = (bbox.x1 + ring, bbox.y1 + ring);
        let (Some(right), Some(bottom)) = (x2.checked_sub(ring), y2.checked_sub(ring)) else {
            break;
        };
        if left > right || top > bottom {
            break;
        }
        for x in left..=right {
            put_pixel(frame, x, top, color);
            put_pixel(frame, x, bottom, color);
        }
        for y in top..=bottom {
            put_pixel(frame, left, y, color);
            put_pixel(frame, right, y, color);
        }
    }
}

fn put_pixel(frame: &mut Frame, x: u32, y: u32, color: [u8; 3]) {
    let channels = frame.channels as usize;
    let idx = (y as usize * frame.width as usize + x as usize) * channels;
    match channels {
        3 => {
            if let Some(px) = frame.data.get_mut(idx..idx + 3) {
                px.copy_from_slice(&color);
            }
        }
        1 => {
            let [r, g, b] = color.map(u32::from);
            let luma = ((299 * r + 587 * g + 114 * b) / 1000) as u8;
            if let Some(px) = frame.data.get_mut(idx) {
                *px = luma;
            }
        }
        _ => {}
    }
}
