use std::fmt::Debug;

pub type FrameId = u32;

/// Decides which unpinned frame the buffer pool gives up next.
pub trait Replacer: Send + Sync + Debug {
    /// Takes the next victim out of the policy. `None` when every frame is pinned.
    fn victim(&mut self) -> Option<FrameId>;

    /// Pinned frames are not evictable. Becoming evictable counts as an access.
    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool);

    fn evictable_count(&self) -> usize;
}
