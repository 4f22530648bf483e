use super::replacer::{Replacer, FrameId};
use std::collections::{BTreeMap, HashMap};

/// Least-recently-unpinned eviction.
///
/// Every unpin stamps the frame with a monotonically increasing tick; the
/// smallest tick is the eviction victim.
#[derive(Debug)]
pub struct LruReplacer {
    by_tick: BTreeMap<u64, FrameId>,
    ticks: HashMap<FrameId, u64>,
    next_tick: u64,
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            by_tick: BTreeMap::new(),
            ticks: HashMap::with_capacity(max_size),
            next_tick: 0,
            max_size,
        }
    }
}

impl Replacer for LruReplacer {
    fn victim(&mut self) -> Option<FrameId> {
        let (_, frame_id) = self.by_tick.pop_first()?;
        self.ticks.remove(&frame_id);
        Some(frame_id)
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if !evictable {
            if let Some(tick) = self.ticks.remove(&frame_id) {
                self.by_tick.remove(&tick);
            }
            return;
        }
        if self.ticks.contains_key(&frame_id) || self.ticks.len() >= self.max_size {
            return;
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.by_tick.insert(tick, frame_id);
        self.ticks.insert(frame_id, tick);
    }

    fn evictable_count(&self) -> usize {
        self.ticks.len()
    }
}
