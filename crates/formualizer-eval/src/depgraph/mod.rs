//! C4: the bidirectional mapping of formula cells to the ranges they
//! observe (`spec.md` §4.4).
//!
//! The broad phase keys listeners into the interval tree by row span only
//! (sheet/column are folded in); the narrow phase re-checks the exact
//! stored [`AbsCellRange`] so false-positive row overlaps never leak out
//! (`spec.md` §4.4 "segment tree or interval tree... sub-linear for narrow
//! mutation regions").

pub mod interval_tree;

use rustc_hash::FxHashMap;

use formualizer_common::cellref::AbsCellRange;
use formualizer_parse::token::RefList;

use crate::store::FormulaHandle;
use interval_tree::IntervalTree;

#[derive(Default)]
pub struct DependencyGraph {
    tree: IntervalTree<FormulaHandle>,
    forward: FxHashMap<FormulaHandle, RefList>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            tree: IntervalTree::new(),
            forward: FxHashMap::default(),
        }
    }

    pub fn is_registered(&self, handle: &FormulaHandle) -> bool {
        self.forward.contains_key(handle)
    }

    /// Register the ranges `handle`'s tokens observe. Registering an
    /// already-registered handle is a silent no-op (`spec.md` §9 Open
    /// Questions: duplicate registration).
    pub fn register(&mut self, handle: FormulaHandle) {
        if self.forward.contains_key(&handle) {
            return;
        }
        let ranges = handle.0.tokens.collect_refs_over(handle.0.range);
        for r in &ranges {
            self.tree.insert(r.first.row(), r.last.row(), handle.clone());
        }
        self.forward.insert(handle, ranges);
    }

    /// Unregister a handle's observations. Unregistering an unknown handle
    /// is an error the caller (C8) surfaces as `ModelError` (`spec.md` §9
    /// Open Questions: unregister-unknown).
    pub fn unregister(&mut self, handle: &FormulaHandle) -> Result<(), UnregisteredFormula> {
        let Some(ranges) = self.forward.remove(handle) else {
            return Err(UnregisteredFormula);
        };
        for r in &ranges {
            self.tree.remove(r.first.row(), r.last.row(), handle);
        }
        Ok(())
    }

    pub fn all_handles(&self) -> impl Iterator<Item = &FormulaHandle> {
        self.forward.keys()
    }

    pub fn observed_ranges(&self, handle: &FormulaHandle) -> &[AbsCellRange] {
        self.forward
            .get(handle)
            .map(|ranges| ranges.as_slice())
            .unwrap_or(&[])
    }

    /// Every registered formula whose observed footprint intersects
    /// `mutated` (`spec.md` §4.5 step 1, "dirty propagation").
    pub fn listeners_touching(&self, mutated: AbsCellRange) -> Vec<FormulaHandle> {
        let candidates = self.tree.query(mutated.first.row(), mutated.last.row());
        let mut seen = rustc_hash::FxHashSet::default();
        let mut out = Vec::new();
        for (_, _, handles) in candidates {
            for h in handles {
                if seen.contains(&h) {
                    continue;
                }
                if self
                    .forward
                    .get(&h)
                    .is_some_and(|ranges| ranges.iter().any(|r| r.intersects(&mutated)))
                {
                    seen.insert(h.clone());
                    out.push(h);
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisteredFormula;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::cell::FormulaCell;
    use formualizer_common::cellref::AbsCellAddr;
    use formualizer_common::coord::{Coord, RelativeCoord};
    use formualizer_parse::opcode::{Opcode, RefToken, SheetRef};
    use formualizer_parse::token::{Token, TokenStore};

    fn formula_observing(anchor: AbsCellAddr, target: AbsCellAddr) -> FormulaHandle {
        let tokens = TokenStore::new(
            vec![Token::new(Opcode::SingleRef(RefToken {
                sheet: SheetRef::Origin,
                coord: RelativeCoord::new(target.row(), target.col(), false, false),
            }))],
            anchor,
        );
        FormulaHandle(FormulaCell::new(tokens, AbsCellRange::single(anchor)))
    }

    #[test]
    fn register_then_mutation_finds_the_listener() {
        let mut graph = DependencyGraph::new();
        let a1 = AbsCellAddr::new(0, 0, 0);
        let b1 = AbsCellAddr::new(0, 0, 1);
        let handle = formula_observing(b1, a1);
        graph.register(handle.clone());
        let hits = graph.listeners_touching(AbsCellRange::single(a1));
        assert_eq!(hits, vec![handle]);
    }

    #[test]
    fn duplicate_registration_is_a_no_op() {
        let mut graph = DependencyGraph::new();
        let a1 = AbsCellAddr::new(0, 0, 0);
        let b1 = AbsCellAddr::new(0, 0, 1);
        let handle = formula_observing(b1, a1);
        graph.register(handle.clone());
        graph.register(handle.clone());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn unregistering_unknown_handle_errors() {
        let mut graph = DependencyGraph::new();
        let a1 = AbsCellAddr::new(0, 0, 0);
        let b1 = AbsCellAddr::new(0, 0, 1);
        let handle = formula_observing(b1, a1);
        assert_eq!(graph.unregister(&handle), Err(UnregisteredFormula));
    }

    #[test]
    fn unregister_removes_the_listener() {
        let mut graph = DependencyGraph::new();
        let a1 = AbsCellAddr::new(0, 0, 0);
        let b1 = AbsCellAddr::new(0, 0, 1);
        let handle = formula_observing(b1, a1);
        graph.register(handle.clone());
        graph.unregister(&handle).unwrap();
        assert!(graph.listeners_touching(AbsCellRange::single(a1)).is_empty());
    }

    #[test]
    fn row_span_false_positive_is_filtered_by_exact_intersects() {
        // Same row span, different column: the broad-phase tree will
        // surface it as a candidate, narrow-phase must reject it.
        let mut graph = DependencyGraph::new();
        let a1 = AbsCellAddr::new(0, 0, 0);
        let b1 = AbsCellAddr::new(0, 0, 1);
        let handle = formula_observing(b1, a1); // observes A1
        graph.register(handle);
        let unrelated_same_row = AbsCellAddr::new(0, 0, 5); // F1, same row as A1
        let hits = graph.listeners_touching(AbsCellRange::single(unrelated_same_row));
        assert!(hits.is_empty());
    }
}
