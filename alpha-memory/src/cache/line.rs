//! A single cache line and its MESI state.

/// MESI coherence state of one cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MesiState {
    Invalid,
    Shared,
    Exclusive,
    Modified,
}

impl Default for MesiState {
    fn default() -> Self {
        MesiState::Invalid
    }
}

/// One way of a cache set.
#[derive(Debug, Clone)]
pub struct CacheLine {
    pub state: MesiState,
    pub tag: u64,
    pub data: Vec<u8>,
    /// Monotonic stamp from the owning cache's access counter, for LRU.
    pub last_access: u64,
    /// Reference bit for clock replacement.
    pub referenced: bool,
}

impl CacheLine {
    pub fn empty(line_size: usize) -> Self {
        Self {
            state: MesiState::Invalid,
            tag: 0,
            data: vec![0u8; line_size],
            last_access: 0,
            referenced: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state != MesiState::Invalid
    }

    pub fn is_dirty(&self) -> bool {
        self.state == MesiState::Modified
    }

    pub fn matches(&self, tag: u64) -> bool {
        self.is_valid() && self.tag == tag
    }

    pub fn fill(&mut self, tag: u64, data: &[u8], state: MesiState) {
        self.tag = tag;
        self.data.copy_from_slice(data);
        self.state = state;
        self.referenced = true;
    }

    pub fn invalidate(&mut self) {
        self.state = MesiState::Invalid;
        self.referenced = false;
    }
}
