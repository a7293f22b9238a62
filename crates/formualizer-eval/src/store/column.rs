//! Run-length compressed storage for one sheet column.
//!
//! Only non-empty spans are materialised as a `Run`; any row not covered by
//! a run is implicitly empty. A long stretch of empty cells therefore costs
//! nothing to store, and a lookup is a binary search over the (typically
//! few) runs actually present (`spec.md` §4.1 "Storage").

use super::cell::CellSlot;

#[derive(Clone)]
pub struct Run {
    pub start_row: u32,
    pub len: u32,
    pub slot: CellSlot,
}

impl Run {
    pub fn end_row(&self) -> u32 {
        self.start_row + self.len - 1
    }
}

#[derive(Default)]
pub struct Column {
    runs: Vec<Run>,
}

impl Column {
    pub fn new() -> Self {
        Self { runs: Vec::new() }
    }

    fn find(&self, row: u32) -> Option<usize> {
        let idx = self.runs.partition_point(|r| r.start_row + r.len <= row);
        if idx < self.runs.len() && self.runs[idx].start_row <= row {
            Some(idx)
        } else {
            None
        }
    }

    pub fn get(&self, row: u32) -> CellSlot {
        match self.find(row) {
            Some(i) => self.runs[i].slot.clone(),
            None => CellSlot::Empty,
        }
    }

    /// Remove/trim any run(s) that overlap `[lo, hi]` (inclusive), splitting
    /// a run that straddles the boundary into its surviving remainder(s).
    pub fn clear_range(&mut self, lo: u32, hi: u32) {
        if self.runs.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.runs.len());
        for r in self.runs.drain(..) {
            let r_end = r.end_row();
            if r_end < lo || r.start_row > hi {
                out.push(r);
                continue;
            }
            if r.start_row < lo {
                out.push(Run {
                    start_row: r.start_row,
                    len: lo - r.start_row,
                    slot: r.slot.clone(),
                });
            }
            if r_end > hi {
                out.push(Run {
                    start_row: hi + 1,
                    len: r_end - hi,
                    slot: r.slot.clone(),
                });
            }
        }
        self.runs = out;
    }

    pub fn set(&mut self, row: u32, slot: CellSlot) {
        self.set_run(row, 1, slot);
    }

    pub fn set_empty(&mut self, row: u32) {
        self.clear_range(row, row);
    }

    /// Install one run spanning `[start_row, start_row+len)`, e.g. a grouped
    /// formula's column span or a `fill_down` target.
    pub fn set_run(&mut self, start_row: u32, len: u32, slot: CellSlot) {
        self.clear_range(start_row, start_row + len - 1);
        if matches!(slot, CellSlot::Empty) {
            return;
        }
        let idx = self.runs.partition_point(|r| r.start_row < start_row);
        self.runs.insert(
            idx,
            Run {
                start_row,
                len,
                slot,
            },
        );
    }

    /// Runs overlapping `[lo, hi]`, in row order. O(log n + k).
    pub fn runs_in_range(&self, lo: u32, hi: u32) -> impl Iterator<Item = &Run> {
        let start_idx = self.runs.partition_point(|r| r.end_row() < lo);
        self.runs[start_idx..]
            .iter()
            .take_while(move |r| r.start_row <= hi)
    }

    pub fn bounding_rows(&self) -> Option<(u32, u32)> {
        if self.runs.is_empty() {
            return None;
        }
        let lo = self.runs.first().unwrap().start_row;
        let hi = self.runs.iter().map(|r| r.end_row()).max().unwrap();
        Some((lo, hi))
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip() {
        let mut col = Column::new();
        col.set(5, CellSlot::Numeric(42.0));
        assert!(matches!(col.get(5), CellSlot::Numeric(n) if n == 42.0));
        assert!(matches!(col.get(4), CellSlot::Empty));
    }

    #[test]
    fn overwrite_splits_surrounding_run() {
        let mut col = Column::new();
        col.set_run(0, 10, CellSlot::Numeric(1.0));
        col.set(5, CellSlot::Numeric(2.0));
        assert!(matches!(col.get(4), CellSlot::Numeric(n) if n == 1.0));
        assert!(matches!(col.get(5), CellSlot::Numeric(n) if n == 2.0));
        assert!(matches!(col.get(6), CellSlot::Numeric(n) if n == 1.0));
    }

    #[test]
    fn clear_removes_run_entirely() {
        let mut col = Column::new();
        col.set(5, CellSlot::Numeric(1.0));
        col.set_empty(5);
        assert!(col.is_empty());
        assert!(matches!(col.get(5), CellSlot::Empty));
    }

    #[test]
    fn runs_in_range_skips_disjoint_runs() {
        let mut col = Column::new();
        col.set(1, CellSlot::Numeric(1.0));
        col.set(100, CellSlot::Numeric(2.0));
        let hits: Vec<_> = col.runs_in_range(50, 200).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start_row, 100);
    }

    #[test]
    fn bounding_rows_tracks_extremes() {
        let mut col = Column::new();
        assert_eq!(col.bounding_rows(), None);
        col.set(10, CellSlot::Boolean(true));
        col.set(3, CellSlot::Boolean(false));
        assert_eq!(col.bounding_rows(), Some((3, 10)));
    }

    proptest::proptest! {
        /// A run-length column must agree with a plain per-row oracle no
        /// matter the interleaving of `set`/`set_empty` calls.
        #[test]
        fn agrees_with_a_per_row_oracle(
            ops in proptest::collection::vec(
                (0u32..32, proptest::option::of(0i32..100)),
                0..64,
            )
        ) {
            let mut col = Column::new();
            let mut oracle: std::collections::HashMap<u32, f64> = std::collections::HashMap::new();
            for (row, value) in ops {
                match value {
                    Some(v) => {
                        col.set(row, CellSlot::Numeric(v as f64));
                        oracle.insert(row, v as f64);
                    }
                    None => {
                        col.set_empty(row);
                        oracle.remove(&row);
                    }
                }
            }
            for row in 0..32u32 {
                match (col.get(row), oracle.get(&row)) {
                    (CellSlot::Empty, None) => {}
                    (CellSlot::Numeric(n), Some(v)) => assert_eq!(n, *v),
                    (CellSlot::Numeric(_), None) => panic!("row {row}: column had a value, oracle had none"),
                    (CellSlot::Empty, Some(_)) => panic!("row {row}: column was empty, oracle had a value"),
                    _ => unreachable!("test only ever writes Numeric or Empty slots"),
                }
            }
        }
    }
}
