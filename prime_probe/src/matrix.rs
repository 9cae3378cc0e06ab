use cache_utils::cache_info::CacheGeometry;
use serde::{Deserialize, Serialize};

/// Probe latencies of one iteration, `set_count` rows of `ways` cycles each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyMatrix {
    set_count: usize,
    ways: usize,
    data: Vec<u32>,
}

impl LatencyMatrix {
    pub fn new(set_count: usize, ways: usize) -> LatencyMatrix {
        LatencyMatrix {
            set_count,
            ways,
            data: vec![0; set_count * ways],
        }
    }

    pub fn for_geometry(geometry: &CacheGeometry) -> LatencyMatrix {
        LatencyMatrix::new(geometry.set_count, geometry.ways)
    }

    pub fn set_count(&self) -> usize {
        self.set_count
    }

    pub fn ways(&self) -> usize {
        self.ways
    }

    #[inline(always)]
    fn index(&self, set: usize, way: usize) -> usize {
        debug_assert!(set < self.set_count && way < self.ways);
        set * self.ways + way
    }

    pub fn get(&self, set: usize, way: usize) -> u32 {
        self.data[self.index(set, way)]
    }

    pub fn row(&self, set: usize) -> &[u32] {
        &self.data[set * self.ways..(set + 1) * self.ways]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u32]> {
        self.data.chunks(self.ways.max(1))
    }

    /// Row major, `set * ways + way`.
    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }

    pub fn fill(&mut self, value: u32) {
        self.data.fill(value);
    }

    #[inline(always)]
    pub(crate) fn slot_ptr(&mut self, set: usize, way: usize) -> *mut u32 {
        let i = self.index(set, way);
        &mut self.data[i] as *mut u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_sets() {
        let mut m = LatencyMatrix::new(3, 2);
        for set in 0..3 {
            for way in 0..2 {
                unsafe { *m.slot_ptr(set, way) = (set * 10 + way) as u32 };
            }
        }
        assert_eq!(m.get(2, 1), 21);
        assert_eq!(m.row(1), &[10, 11]);
        assert_eq!(m.rows().count(), 3);
        assert_eq!(m.as_slice(), &[0, 1, 10, 11, 20, 21]);
    }
}
