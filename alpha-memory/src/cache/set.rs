//! One set of a cache level: its ways, the clock hand for clock replacement, and victim
//! selection, per §4.4.

use {
    crate::{cache::line::CacheLine, config::ReplacementPolicy},
    rand::Rng,
    std::sync::Mutex,
};

struct SetState {
    ways: Vec<CacheLine>,
    clock_hand: usize,
}

/// A fully-associative set of `assoc` ways, guarded by its own lock so that two sets in the same
/// cache level can be accessed concurrently (§5's per-set fine-grained locking policy).
pub(crate) struct CacheSet {
    state: Mutex<SetState>,
}

impl CacheSet {
    pub fn new(assoc: usize, line_size: usize) -> Self {
        Self {
            state: Mutex::new(SetState {
                ways: (0..assoc).map(|_| CacheLine::empty(line_size)).collect(),
                clock_hand: 0,
            }),
        }
    }

    /// Run `f` with exclusive access to this set's ways and clock hand.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut Vec<CacheLine>, &mut usize) -> R) -> R {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard.ways, &mut guard.clock_hand)
    }
}

/// Find the way holding `tag`, if any.
pub(crate) fn find(ways: &[CacheLine], tag: u64) -> Option<usize> {
    ways.iter().position(|line| line.matches(tag))
}

/// Pick a way to evict: an invalid way first (lowest index), else per `policy`.
pub(crate) fn select_victim(ways: &mut [CacheLine], clock_hand: &mut usize, policy: ReplacementPolicy) -> usize {
    if let Some(index) = ways.iter().position(|line| !line.is_valid()) {
        return index;
    }
    match policy {
        ReplacementPolicy::Lru => ways
            .iter()
            .enumerate()
            .min_by_key(|(index, line)| (line.last_access, *index))
            .map(|(index, _)| index)
            .expect("cache set has at least one way"),
        ReplacementPolicy::Clock => {
            let assoc = ways.len();
            loop {
                let candidate = *clock_hand % assoc;
                *clock_hand = candidate + 1;
                if ways[candidate].referenced {
                    ways[candidate].referenced = false;
                } else {
                    return candidate;
                }
            }
        }
        ReplacementPolicy::Random => rand::thread_rng().gen_range(0..ways.len()),
    }
}
