/// COCO class id for "person".
pub const PERSON_CLASS_ID: u32 = 0;

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left, `(x2, y2)` bottom-right.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Integer box after clamping to frame bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelBox {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Clamp to a `width` x `height` frame. Returns `None` for boxes with no area left.
    ///
    /// Coordinates are truncated to integers, then limited to `[0, width-1]` and
    /// `[0, height-1]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<PixelBox> {
        if width == 0 || height == 0 || !self.is_finite() {
            return None;
        }
        let x1 = (self.x1 as i64).max(0);
        let y1 = (self.y1 as i64).max(0);
        let x2 = (self.x2 as i64).min(width as i64 - 1);
        let y2 = (self.y2 as i64).min(height as i64 - 1);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(PixelBox {
            x1: x1 as u32,
            y1: y1 as u32,
            x2: x2 as u32,
            y2: y2 as u32,
        })
    }

    fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }
}

/// One detection reported by a backend for a single frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Within `[0, 1]`.
    pub confidence: f32,
    pub class_id: u32,
    /// Tracker-assigned identity; `None` when the tracker has not assigned one.
    pub track_id: Option<u32>,
}

impl Detection {
    pub fn person(bbox: BoundingBox, confidence: f32, track_id: Option<u32>) -> Self {
        Self {
            bbox,
            confidence,
            class_id: PERSON_CLASS_ID,
            track_id,
        }
    }
}
