//! Per-frame detection, annotation and capture.
//!
//! `DetectionPipeline::process` never fails outward: invalid frames yield
//! `(None, 0)`, detector failures yield the last known person count together
//! with the unannotated copy, and capture failures are logged and retried on a
//! later frame.

mod annotate;
mod fps;
mod throttle;

pub use annotate::{draw_box, label_for, AnnotatedFrame, Annotation};
pub use fps::FpsTracker;
pub use throttle::CaptureThrottler;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, RgbImage};

use crate::config::{CaptureSettings, DetectionSettings};
use crate::detect::{Detection, DetectorBackend, PixelBox};
use crate::diag::Diagnostics;
use crate::frame::Frame;
use crate::storage::{CaptureMetadata, CaptureStore};

const JPEG_QUALITY: u8 = 90;

#[derive(Clone, Debug)]
pub struct Processed {
    pub frame: Option<AnnotatedFrame>,
    pub person_count: usize,
}

pub struct DetectionPipeline {
    detector: Box<dyn DetectorBackend>,
    store: Box<dyn CaptureStore>,
    throttler: CaptureThrottler,
    settings: DetectionSettings,
    diag: Diagnostics,
    frame_count: u64,
    last_person_count: usize,
    captures_stored: u64,
    last_reclaim: Instant,
    jpeg_scratch: Vec<u8>,
}

impl DetectionPipeline {
    pub fn new(
        detector: Box<dyn DetectorBackend>,
        store: Box<dyn CaptureStore>,
        detection: DetectionSettings,
        capture: &CaptureSettings,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            detector,
            store,
            throttler: CaptureThrottler::new(capture),
            settings: detection,
            diag: diagnostics.scoped("stream_sentinel::pipeline"),
            frame_count: 0,
            last_person_count: 0,
            captures_stored: 0,
            last_reclaim: Instant::now(),
            jpeg_scratch: Vec::new(),
        }
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn last_person_count(&self) -> usize {
        self.last_person_count
    }

    pub fn captures_stored(&self) -> u64 {
        self.captures_stored
    }

    pub fn throttler(&self) -> &CaptureThrottler {
        &self.throttler
    }

    pub fn process(&mut self, frame: &Frame) -> Processed {
        self.process_at(frame, Instant::now())
    }

    pub fn process_at(&mut self, frame: &Frame, now: Instant) -> Processed {
        if let Err(e) = frame.validate() {
            self.diag.error(format!("Invalid frame: {}", e));
            return Processed {
                frame: None,
                person_count: 0,
            };
        }

        let mut annotated = AnnotatedFrame::new(frame.clone());
        let detections = match self.run_detector(frame) {
            Ok(detections) => detections,
            Err(e) => {
                self.diag.error(format!("Error processing frame: {:#}", e));
                return Processed {
                    frame: Some(annotated),
                    person_count: self.last_person_count,
                };
            }
        };

        let mut person_count = 0;
        for detection in &detections {
            let Some(bbox) = self.accept(detection, frame) else {
                continue;
            };
            draw_box(
                &mut annotated.frame,
                &bbox,
                self.settings.box_color,
                self.settings.box_thickness,
            );
            annotated.annotations.push(Annotation {
                bbox,
                label: label_for(detection),
            });
            person_count += 1;

            if let Some(track_id) = detection.track_id {
                self.maybe_capture(frame, &bbox, track_id, detection.confidence, now);
            }
        }
        annotated.overlay.push(format!("Persons: {}", person_count));
        self.last_person_count = person_count;

        self.frame_count += 1;
        if now.saturating_duration_since(self.last_reclaim) >= self.settings.reclaim_interval {
            self.reclaim(now);
        }
        if self.frame_count % self.settings.log_every_frames.max(1) == 0 {
            self.diag
                .info(format!("Current person count: {}", person_count));
        }

        Processed {
            frame: Some(annotated),
            person_count,
        }
    }

    fn run_detector(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let detector = &mut self.detector;
        match catch_unwind(AssertUnwindSafe(|| detector.detect(frame))) {
            Ok(result) => result,
            Err(_) => Err(anyhow!("detector '{}' panicked", detector.name())),
        }
    }

    /// Person class, confident enough, and a box with area left after clamping.
    fn accept(&self, detection: &Detection, frame: &Frame) -> Option<PixelBox> {
        if detection.class_id != self.settings.person_class_id {
            return None;
        }
        if detection.confidence.is_nan() || detection.confidence < self.settings.min_confidence {
            return None;
        }
        detection.bbox.clamp_to(frame.width, frame.height)
    }

    fn maybe_capture(
        &mut self,
        frame: &Frame,
        bbox: &PixelBox,
        track_id: u32,
        confidence: f32,
        now: Instant,
    ) {
        if !self.throttler.should_capture(track_id, confidence, now) {
            return;
        }
        if let Err(e) = self.encode_crop(frame, bbox) {
            self.diag
                .error(format!("Error capturing person image: {:#}", e));
            return;
        }
        let meta = CaptureMetadata {
            track_id,
            confidence,
            timestamp: frame.wall_time,
        };
        match self.store.store(&self.jpeg_scratch, &meta) {
            Ok(uri) => {
                self.throttler.record(track_id, now);
                self.captures_stored += 1;
                self.diag.info(format!(
                    "Captured person with ID {} (confidence: {:.2})",
                    track_id, confidence
                ));
                log::debug!("capture stored at {}", uri);
            }
            Err(e) => {
                self.diag
                    .error(format!("Error capturing person image: {}", e));
            }
        }
    }

    /// JPEG-encode the unannotated region into the scratch buffer.
    fn encode_crop(&mut self, frame: &Frame, bbox: &PixelBox) -> Result<()> {
        let crop = frame.crop(bbox.x1, bbox.y1, bbox.x2, bbox.y2)?;
        let (width, height) = (crop.width, crop.height);
        self.jpeg_scratch.clear();
        let mut encoder = JpegEncoder::new_with_quality(&mut self.jpeg_scratch, JPEG_QUALITY);
        match crop.channels {
            3 => {
                let image = RgbImage::from_raw(width, height, crop.data)
                    .ok_or_else(|| anyhow!("crop does not fit an RGB image"))?;
                encoder.encode_image(&image)?;
            }
            1 => {
                let image = GrayImage::from_raw(width, height, crop.data)
                    .ok_or_else(|| anyhow!("crop does not fit a grayscale image"))?;
                encoder.encode_image(&image)?;
            }
            other => return Err(anyhow!("cannot encode {}-channel frame", other)),
        }
        Ok(())
    }

    /// Deferred reclamation: expire capture ids and release the encode buffer.
    fn reclaim(&mut self, now: Instant) {
        let pruned = self.throttler.prune(now);
        self.jpeg_scratch = Vec::new();
        self.last_reclaim = now;
        log::debug!(
            "pipeline reclamation: {} capture ids expired, {} retained",
            pruned,
            self.throttler.captured_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use crate::diag::{DiagnosticKind, RecordingSink};
    use crate::storage::InMemoryCaptureStore;
    use std::sync::Arc;
    use std::time::Duration;

    /// Replays a fixed list of detections for every frame.
    struct Scripted(Vec<Detection>);

    impl DetectorBackend for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl DetectorBackend for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            Err(anyhow!("model unavailable"))
        }
    }

    fn pipeline(
        detector: Box<dyn DetectorBackend>,
    ) -> (DetectionPipeline, Arc<InMemoryCaptureStore>, Arc<RecordingSink>) {
        let store = Arc::new(InMemoryCaptureStore::new());
        let sink = Arc::new(RecordingSink::new());
        let pipeline = DetectionPipeline::new(
            detector,
            Box::new(store.clone()),
            DetectionSettings::default(),
            &CaptureSettings::default(),
            Diagnostics::new(sink.clone()),
        );
        (pipeline, store, sink)
    }

    fn person(x1: f32, y1: f32, x2: f32, y2: f32, conf: f32, track: Option<u32>) -> Detection {
        Detection::person(BoundingBox::new(x1, y1, x2, y2), conf, track)
    }

    #[test]
    fn invalid_frame_yields_nothing() {
        let (mut p, _, sink) = pipeline(Box::new(Scripted(vec![])));
        let processed = p.process(&Frame::new(vec![], 0, 0, 3));
        assert!(processed.frame.is_none());
        assert_eq!(processed.person_count, 0);
        assert_eq!(sink.count_matching(DiagnosticKind::Error, "Invalid frame"), 1);
    }

    #[test]
    fn counts_and_annotates_people_above_threshold() {
        let (mut p, _, _) = pipeline(Box::new(Scripted(vec![
            person(1.0, 1.0, 8.0, 8.0, 0.6, None),
            person(2.0, 2.0, 6.0, 6.0, 0.4, None),
            Detection {
                class_id: 2,
                ..person(2.0, 2.0, 6.0, 6.0, 0.9, None)
            },
        ])));
        let input = Frame::filled(16, 16, [0, 0, 0]);
        let processed = p.process(&input);

        assert_eq!(processed.person_count, 1);
        let annotated = processed.frame.unwrap();
        assert_eq!(annotated.annotations.len(), 1);
        assert_eq!(annotated.annotations[0].label, "Person: 0.60");
        assert_eq!(annotated.overlay, vec!["Persons: 1".to_string()]);
        // The caller's frame is untouched.
        assert!(input.data.iter().all(|&b| b == 0));
        assert!(annotated.frame.data.iter().any(|&b| b == 255));
    }

    #[test]
    fn degenerate_box_is_neither_drawn_nor_captured() {
        let (mut p, store, _) = pipeline(Box::new(Scripted(vec![
            person(8.0, 2.0, 8.0, 9.0, 0.95, Some(1)),
            person(30.0, 30.0, 40.0, 40.0, 0.95, Some(2)),
        ])));
        let processed = p.process(&Frame::filled(16, 16, [0, 0, 0]));

        assert_eq!(processed.person_count, 0);
        let annotated = processed.frame.unwrap();
        assert!(annotated.annotations.is_empty());
        assert!(annotated.frame.data.iter().all(|&b| b == 0));
        assert!(store.is_empty());
    }

    #[test]
    fn tracked_person_is_captured_once() {
        let (mut p, store, sink) = pipeline(Box::new(Scripted(vec![person(
            2.0, 2.0, 12.0, 14.0, 0.9, Some(4),
        )])));
        let frame = Frame::filled(16, 16, [200, 10, 10]);
        let start = Instant::now();
        p.process_at(&frame, start);
        p.process_at(&frame, start + Duration::from_secs(30));

        let stored = store.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].meta.track_id, 4);
        // JPEG SOI marker.
        assert_eq!(&stored[0].jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(
            sink.count_matching(DiagnosticKind::Info, "Captured person with ID 4"),
            1
        );
    }

    #[test]
    fn failed_store_does_not_record_the_track() {
        let (mut p, store, _) = pipeline(Box::new(Scripted(vec![person(
            2.0, 2.0, 12.0, 14.0, 0.9, Some(4),
        )])));
        store.fail_next(1);
        let frame = Frame::filled(16, 16, [10, 10, 10]);
        let start = Instant::now();

        p.process_at(&frame, start);
        assert!(!p.throttler().is_captured(4));
        assert!(store.is_empty());

        p.process_at(&frame, start + Duration::from_millis(10));
        assert!(p.throttler().is_captured(4));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn low_confidence_person_is_counted_but_not_captured() {
        let (mut p, store, _) = pipeline(Box::new(Scripted(vec![person(
            2.0, 2.0, 12.0, 14.0, 0.6, Some(9),
        )])));
        let processed = p.process(&Frame::filled(16, 16, [0, 0, 0]));
        assert_eq!(processed.person_count, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn detector_failure_keeps_last_count() {
        let (mut p, _, sink) = pipeline(Box::new(Scripted(vec![person(
            1.0, 1.0, 8.0, 8.0, 0.9, None,
        )])));
        p.process(&Frame::filled(16, 16, [0, 0, 0]));
        p.detector = Box::new(Failing);

        let processed = p.process(&Frame::filled(16, 16, [0, 0, 0]));
        assert_eq!(processed.person_count, 1);
        assert!(processed.frame.is_some());
        assert_eq!(
            sink.count_matching(DiagnosticKind::Error, "Error processing frame"),
            1
        );
    }

    #[test]
    fn person_count_is_logged_every_thirty_frames() {
        let (mut p, _, sink) = pipeline(Box::new(Scripted(vec![])));
        let frame = Frame::filled(8, 8, [0, 0, 0]);
        for _ in 0..100 {
            p.process(&frame);
        }
        assert_eq!(p.frame_count(), 100);
        assert_eq!(
            sink.count_matching(DiagnosticKind::Info, "Current person count"),
            3
        );
    }
}
