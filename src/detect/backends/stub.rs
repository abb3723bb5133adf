use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const STUB_CONFIDENCE: f32 = 0.85;

/// Stub backend for running without a model. Uses pixel hashing to detect change.
///
/// A changed frame reports one centred person. Consecutive changed frames share a
/// track id; a static frame ends the track, and the next change starts a new one.
pub struct StubBackend {
    last_hash: Option<[u8; 32]>,
    next_track: u32,
    active_track: Option<u32>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            last_hash: None,
            next_track: 1,
            active_track: None,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let current_hash: [u8; 32] = Sha256::digest(&frame.data).into();
        let changed = self.last_hash.is_some_and(|prev| prev != current_hash);
        self.last_hash = Some(current_hash);

        if !changed {
            self.active_track = None;
            return Ok(vec![]);
        }

        let track = match self.active_track {
            Some(track) => track,
            None => {
                let track = self.next_track;
                self.next_track = self.next_track.wrapping_add(1);
                self.active_track = Some(track);
                track
            }
        };

        let (w, h) = (frame.width as f32, frame.height as f32);
        let bbox = BoundingBox::new(w / 3.0, h / 4.0, w * 2.0 / 3.0, h * 3.0 / 4.0);
        Ok(vec![Detection::person(bbox, STUB_CONFIDENCE, Some(track))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_backend_tracks_change_episodes() {
        let mut backend = StubBackend::new();
        let a = Frame::filled(30, 20, [1, 1, 1]);
        let b = Frame::filled(30, 20, [2, 2, 2]);
        let c = Frame::filled(30, 20, [3, 3, 3]);

        // First frame: nothing to compare against.
        assert!(backend.detect(&a).unwrap().is_empty());

        let d1 = backend.detect(&b).unwrap();
        assert_eq!(d1.len(), 1);
        assert_eq!(d1[0].track_id, Some(1));
        assert_eq!(d1[0].bbox, BoundingBox::new(10.0, 5.0, 20.0, 15.0));

        // Still changing: same track.
        assert_eq!(backend.detect(&c).unwrap()[0].track_id, Some(1));

        // Static frame ends the episode; the next change is a new track.
        assert!(backend.detect(&c).unwrap().is_empty());
        assert_eq!(backend.detect(&a).unwrap()[0].track_id, Some(2));
    }
}
