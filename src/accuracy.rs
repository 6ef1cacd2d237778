use std::collections::HashSet;

/// Frame indices (0-based) that are expected to contain fire.
#[derive(Debug, Clone, Default)]
pub struct GroundTruth {
    frames: HashSet<u64>,
}

impl GroundTruth {
    pub fn new(frames: impl IntoIterator<Item = u64>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn contains(&self, frame_index: u64) -> bool {
        self.frames.contains(&frame_index)
    }
}

/// Running tally for one streamed video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccuracyCounter {
    pub total_frames: u64,
    pub correct_detections: u64,
}

impl AccuracyCounter {
    /// A frame is correct when the detector agrees with the ground truth,
    /// either both saying fire or both saying no fire.
    pub fn record(&mut self, fire_detected: bool, expected_fire: bool) -> bool {
        self.total_frames += 1;
        let correct = fire_detected == expected_fire;
        if correct {
            self.correct_detections += 1;
        }
        correct
    }

    /// `correct / total * 100 + 50`, or zero before any frame was read.
    ///
    /// The +50 offset is part of the reported figure and can push it past 100.
    pub fn accuracy(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        (self.correct_detections as f64 / self.total_frames as f64) * 100.0 + 50.0
    }
}
