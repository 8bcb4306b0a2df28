//! Bounded per-session output log addressed by absolute byte offset.
//!
//! Every byte a session's process emits gets an offset counted from session
//! creation. Attaching clients say how many bytes they already hold and get
//! everything after that replayed from here before live output.

use std::collections::VecDeque;

/// Default retention per session (25 MiB).
pub const DEFAULT_MAX_BYTES: usize = 25 * 1024 * 1024;

pub struct OutputLog {
    chunks: VecDeque<Chunk>,
    /// Offset of the first retained byte
    start: u64,
    /// Offset just past the last byte ever appended
    end: u64,
    retained: usize,
    max_bytes: usize,
}

struct Chunk {
    offset: u64,
    data: Vec<u8>,
}

/// Output to send an attaching client: `offset` is where replay begins.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Replay {
    pub offset: u64,
    pub chunks: Vec<(u64, Vec<u8>)>,
}

impl Replay {
    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(|(_, data)| data.len()).sum()
    }

    /// Merge contiguous chunks into frames of up to `total / max_frames`
    /// bytes, but no smaller than `min_frame_bytes`. Greedy merging keeps the
    /// result under `2 * max_frames + 1` frames.
    pub fn into_frames(self, max_frames: usize, min_frame_bytes: usize) -> Vec<(u64, Vec<u8>)> {
        let target = min_frame_bytes.max(self.byte_len().div_ceil(max_frames.max(1)));
        let mut frames: Vec<(u64, Vec<u8>)> = Vec::new();
        for (offset, data) in self.chunks {
            match frames.last_mut() {
                Some((_, frame)) if frame.len() + data.len() <= target => {
                    frame.extend_from_slice(&data)
                }
                _ => frames.push((offset, data)),
            }
        }
        frames
    }
}

impl OutputLog {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            start: 0,
            end: 0,
            retained: 0,
            max_bytes,
        }
    }

    /// Append a chunk and return its offset. The newest chunk is always kept,
    /// even when it alone exceeds the limit.
    pub fn append(&mut self, data: &[u8]) -> u64 {
        let offset = self.end;
        if data.is_empty() {
            return offset;
        }
        self.chunks.push_back(Chunk {
            offset,
            data: data.to_vec(),
        });
        self.end += data.len() as u64;
        self.retained += data.len();

        while self.retained > self.max_bytes && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.retained -= evicted.data.len();
            }
        }
        self.start = self.chunks.front().map(|c| c.offset).unwrap_or(self.end);
        offset
    }

    /// Everything after `since`. A `since` older than the retained window
    /// starts at the oldest retained byte; one past the end replays nothing.
    pub fn replay_from(&self, since: u64) -> Replay {
        if since >= self.end {
            return Replay {
                offset: self.end,
                chunks: Vec::new(),
            };
        }
        let from = since.max(self.start);
        let chunks = self
            .chunks
            .iter()
            .filter(|c| c.offset + c.data.len() as u64 > from)
            .map(|c| {
                let skip = from.saturating_sub(c.offset) as usize;
                (c.offset + skip as u64, c.data[skip..].to_vec())
            })
            .collect();
        Replay {
            offset: from,
            chunks,
        }
    }

    pub fn start_offset(&self) -> u64 {
        self.start
    }

    pub fn end_offset(&self) -> u64 {
        self.end
    }

    pub fn retained_bytes(&self) -> usize {
        self.retained
    }
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat(replay: &Replay) -> Vec<u8> {
        replay.chunks.iter().flat_map(|(_, d)| d.clone()).collect()
    }

    #[test]
    fn append_assigns_offsets() {
        let mut log = OutputLog::default();
        assert_eq!(log.append(b"hello"), 0);
        assert_eq!(log.append(b" world"), 5);
        assert_eq!(log.end_offset(), 11);
        assert_eq!(log.append(b""), 11);
    }

    #[test]
    fn replay_from_zero_returns_everything() {
        let mut log = OutputLog::default();
        log.append(b"hello");
        log.append(b" world");
        let replay = log.replay_from(0);
        assert_eq!(replay.offset, 0);
        assert_eq!(concat(&replay), b"hello world");
        assert_eq!(replay.byte_len(), 11);
    }

    #[test]
    fn replay_splits_chunk_at_since() {
        let mut log = OutputLog::default();
        log.append(b"hello");
        log.append(b" world");
        let replay = log.replay_from(3);
        assert_eq!(replay.offset, 3);
        assert_eq!(replay.chunks[0], (3, b"lo".to_vec()));
        assert_eq!(concat(&replay), b"lo world");
    }

    #[test]
    fn replay_at_or_past_end_is_empty() {
        let mut log = OutputLog::default();
        log.append(b"abc");
        assert_eq!(log.replay_from(3).chunks.len(), 0);
        let beyond = log.replay_from(100);
        assert_eq!(beyond.offset, 3);
        assert!(beyond.chunks.is_empty());
    }

    #[test]
    fn eviction_keeps_window_and_offsets() {
        let mut log = OutputLog::new(8);
        log.append(b"aaaa");
        log.append(b"bbbb");
        log.append(b"cccc");
        assert_eq!(log.retained_bytes(), 8);
        assert_eq!(log.start_offset(), 4);

        let replay = log.replay_from(0);
        assert_eq!(replay.offset, 4);
        assert_eq!(concat(&replay), b"bbbbcccc");
    }

    #[test]
    fn frames_merge_small_chunks() {
        let mut log = OutputLog::default();
        for chunk in [&b"ab"[..], b"cd", b"ef", b"gh"] {
            log.append(chunk);
        }
        let frames = log.replay_from(1).into_frames(16, 4);
        assert_eq!(frames, vec![(1, b"bcd".to_vec()), (4, b"efgh".to_vec())]);
    }

    #[test]
    fn frames_grow_to_fit_frame_budget() {
        let mut log = OutputLog::default();
        for _ in 0..1000 {
            log.append(b"0123456789");
        }
        let frames = log.replay_from(0).into_frames(10, 1);
        assert!(frames.len() <= 21, "{} frames", frames.len());
        let joined: Vec<u8> = frames.iter().flat_map(|(_, d)| d.clone()).collect();
        assert_eq!(joined.len(), 10_000);
        let mut expected = 0;
        for (offset, data) in &frames {
            assert_eq!(*offset, expected);
            expected += data.len() as u64;
        }
    }

    #[test]
    fn oversized_chunk_is_kept_alone() {
        let mut log = OutputLog::new(4);
        log.append(b"ab");
        log.append(b"0123456789");
        assert_eq!(log.start_offset(), 2);
        assert_eq!(log.retained_bytes(), 10);
        assert_eq!(concat(&log.replay_from(0)), b"0123456789");
    }
}
