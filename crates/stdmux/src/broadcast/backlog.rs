//! Replay buffer of everything a container has produced.

use std::collections::VecDeque;

use crate::mux::{Frame, StreamSelection};

/// Output chunks kept for late attachers, bounded by total payload bytes.
///
/// When the limit is exceeded the oldest bytes go first; a partially evicted
/// chunk keeps its newest bytes.
#[derive(Debug)]
pub(crate) struct Backlog {
    frames: VecDeque<Frame>,
    bytes: usize,
    limit: usize,
    evicted: u64,
}

impl Backlog {
    pub fn new(limit: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            bytes: 0,
            limit,
            evicted: 0,
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.bytes += frame.len();
        self.frames.push_back(frame);

        while self.bytes > self.limit {
            let excess = self.bytes - self.limit;
            let Some(front) = self.frames.front_mut() else {
                break;
            };
            if front.len() <= excess {
                let removed = front.len();
                self.frames.pop_front();
                self.bytes -= removed;
                self.evicted += removed as u64;
            } else {
                front.payload = front.payload.slice(excess..);
                self.bytes -= excess;
                self.evicted += excess as u64;
            }
        }
    }

    pub fn snapshot(&self, selection: StreamSelection) -> Vec<Frame> {
        self.frames
            .iter()
            .filter(|frame| selection.includes(frame.kind))
            .cloned()
            .collect()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
