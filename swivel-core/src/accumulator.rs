//! Overlap-add framing of a mono sample stream.

/// Collects variable-length audio blocks into fixed-size analysis frames that
/// advance by `hop_size` samples.
///
/// Once a frame completes the buffer is rolled forward by one hop, keeping the
/// last `frame_size - hop_size` samples as the start of the next frame.
#[derive(Debug, Clone)]
pub struct FrameAccumulator {
    buffer: Vec<f32>,
    index: usize,
    hop_size: usize,
}

impl FrameAccumulator {
    /// Creates an empty accumulator whose hop is `frame_size / overlap`.
    ///
    /// # Panics
    /// If `overlap` is zero or larger than `frame_size`.
    pub fn new(frame_size: usize, overlap: usize) -> Self {
        assert!(
            overlap > 0 && overlap <= frame_size,
            "overlap must be between 1 and the frame size"
        );
        Self {
            buffer: vec![0.0; frame_size],
            index: 0,
            hop_size: frame_size / overlap,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Samples still needed before the next frame completes.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.index
    }

    /// Appends `samples`, calling `on_frame` for every frame they complete.
    ///
    /// A block no longer than the hop completes at most one frame. A block that
    /// crosses a frame boundary is split across it, so every sample is consumed
    /// and the frames seen are the same however the stream is chunked.
    pub fn push(&mut self, mut samples: &[f32], mut on_frame: impl FnMut(&[f32])) {
        while !samples.is_empty() {
            let take = samples.len().min(self.remaining());
            self.buffer[self.index..self.index + take].copy_from_slice(&samples[..take]);
            self.index += take;
            samples = &samples[take..];

            if self.index == self.buffer.len() {
                on_frame(&self.buffer);
                self.buffer.copy_within(self.hop_size.., 0);
                self.index = self.buffer.len() - self.hop_size;
            }
        }
    }

    /// Forgets everything buffered so far.
    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_frames(chunks: &[&[f32]]) -> Vec<Vec<f32>> {
        let mut acc = FrameAccumulator::new(8, 2);
        let mut frames = Vec::new();
        for chunk in chunks {
            acc.push(chunk, |frame| frames.push(frame.to_vec()));
        }
        frames
    }

    #[test]
    fn test_frames_overlap_by_hop() {
        let stream: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let frames = collect_frames(&[&stream]);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], (0..8).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(frames[1], (4..12).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(frames[2], (8..16).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_chunking_does_not_change_frames() {
        let stream: Vec<f32> = (0..53).map(|i| (i as f32 * 0.37).sin()).collect();
        let whole = collect_frames(&[&stream]);

        for chunk_size in 1..=11 {
            let chunks: Vec<&[f32]> = stream.chunks(chunk_size).collect();
            assert_eq!(collect_frames(&chunks), whole, "chunk size {chunk_size}");
        }

        // Irregular chunking straddling several boundaries.
        let (a, rest) = stream.split_at(3);
        let (b, rest) = rest.split_at(14);
        let (c, d) = rest.split_at(1);
        assert_eq!(collect_frames(&[a, b, c, d]), whole);
    }

    #[test]
    fn test_block_within_hop_completes_at_most_one_frame() {
        let mut acc = FrameAccumulator::new(8, 2);
        let mut count = 0;
        acc.push(&[0.0; 6], |_| count += 1);
        assert_eq!(count, 0);
        assert_eq!(acc.remaining(), 2);

        acc.push(&[1.0; 4], |_| count += 1);
        assert_eq!(count, 1);
        assert_eq!(acc.remaining(), 2);
    }
}
