//! C5: turns a set of mutations into an ordered, cycle-annotated batch
//! (`spec.md` §4.5).
//!
//! Dirty-set propagation is a pure BFS over [`DependencyGraph`] listener
//! edges. Ordering is an explicit, non-recursive DFS over an explicit
//! White/Gray/Black colour map (`spec.md` §9 REDESIGN FLAGS: "recast
//! functor-heavy dependency traversal as explicit iterative DFS"), so a
//! pathologically deep prerequisite chain never threatens the call stack.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use formualizer_common::cellref::AbsCellRange;

use crate::depgraph::DependencyGraph;
use crate::store::{CellStore, FormulaHandle};

/// Transitive closure of everything that must recompute this run: formulas
/// reachable from `pending` by following "observes" edges, plus every
/// formula already marked dirty (e.g. just registered), every formula in
/// `explicit` (a caller-supplied dirty-formula set — e.g. a constant
/// formula with no refs to register, `spec.md` §8 scenario 4), and every
/// volatile formula, which is dirty on every run regardless of
/// reachability (`spec.md` §4.5 step 2).
pub fn collect_dirty(
    graph: &DependencyGraph,
    pending: &[AbsCellRange],
    explicit: &[FormulaHandle],
) -> FxHashSet<FormulaHandle> {
    let mut dirty = FxHashSet::default();
    let mut queue: VecDeque<AbsCellRange> = pending.iter().copied().collect();

    for handle in graph.all_handles() {
        if handle.0.is_dirty() || handle.0.volatile {
            if dirty.insert(handle.clone()) {
                queue.push_back(handle.0.range);
            }
        }
    }
    for handle in explicit {
        handle.0.mark_dirty();
        if dirty.insert(handle.clone()) {
            queue.push_back(handle.0.range);
        }
    }

    while let Some(r) = queue.pop_front() {
        for handle in graph.listeners_touching(r) {
            if dirty.insert(handle.clone()) {
                handle.0.mark_dirty();
                queue.push_back(handle.0.range);
            }
        }
    }
    dirty
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

pub struct ScheduleResult {
    /// Dependency-respecting evaluation order for every dirty formula.
    pub order: Vec<FormulaHandle>,
    /// Formulas participating in a circular reference. Still present in
    /// `order` — the executor resolves them to `#CIRC!` instead of skipping
    /// them (`spec.md` §4.5 step 5: "continuing traversal, never aborting").
    pub cycle_members: FxHashSet<FormulaHandle>,
}

struct Frame {
    node: FormulaHandle,
    prereqs: Vec<FormulaHandle>,
    idx: usize,
}

/// Other dirty formulas occupying a cell `handle` observes — the formulas
/// that must evaluate before `handle` can. A formula that observes its own
/// cell is its own prerequisite, which is exactly the self-reference case
/// the cycle detector below must catch, so `handle` is not excluded here.
fn prerequisites_of(
    store: &CellStore,
    graph: &DependencyGraph,
    dirty: &FxHashSet<FormulaHandle>,
    handle: &FormulaHandle,
) -> Vec<FormulaHandle> {
    let mut seen = FxHashSet::default();
    let mut out = Vec::new();
    for range in graph.observed_ranges(handle) {
        for other in store.formula_handles_in_range(*range) {
            if dirty.contains(&other) && seen.insert(other.clone()) {
                out.push(other);
            }
        }
    }
    out
}

/// Order `dirty` so every prerequisite precedes its dependents, tagging any
/// formula that sits on a circular reference.
pub fn topo_order(
    store: &CellStore,
    graph: &DependencyGraph,
    dirty: &FxHashSet<FormulaHandle>,
) -> ScheduleResult {
    let mut color: FxHashMap<FormulaHandle, Color> =
        dirty.iter().cloned().map(|h| (h, Color::White)).collect();
    let mut order = Vec::with_capacity(dirty.len());
    let mut cycle_members = FxHashSet::default();

    // Root order only affects which of several independent cells gets
    // visited first; the resulting `S` still respects every dependency
    // edge regardless (`spec.md` §4.5 "Ordering contract"). Sorting by
    // address just keeps that free choice stable run to run.
    let mut roots: Vec<FormulaHandle> = dirty.iter().cloned().collect();
    roots.sort_by(|a, b| a.0.range.first_addr().cmp(&b.0.range.first_addr()));

    for start in roots {
        if color.get(&start) != Some(&Color::White) {
            continue;
        }
        color.insert(start.clone(), Color::Gray);
        let prereqs = prerequisites_of(store, graph, dirty, &start);
        let mut stack = vec![Frame {
            node: start,
            prereqs,
            idx: 0,
        }];

        while let Some(frame) = stack.last_mut() {
            if frame.idx < frame.prereqs.len() {
                let next = frame.prereqs[frame.idx].clone();
                frame.idx += 1;
                match color.get(&next).copied().unwrap_or(Color::White) {
                    Color::White => {
                        color.insert(next.clone(), Color::Gray);
                        let next_prereqs = prerequisites_of(store, graph, dirty, &next);
                        stack.push(Frame {
                            node: next,
                            prereqs: next_prereqs,
                            idx: 0,
                        });
                    }
                    Color::Gray => {
                        if let Some(pos) = stack.iter().position(|f| f.node == next) {
                            for f in &stack[pos..] {
                                cycle_members.insert(f.node.clone());
                            }
                        }
                    }
                    Color::Black => {}
                }
            } else {
                color.insert(frame.node.clone(), Color::Black);
                order.push(frame.node.clone());
                stack.pop();
            }
        }
    }

    ScheduleResult {
        order,
        cycle_members,
    }
}

/// Forward dependency edges for the executor's ready queue: for every
/// dirty formula, who depends on it, and how many unresolved prerequisites
/// it currently has. Cycle members get their count forced to `0` — a true
/// cycle can never naturally reach zero, and the executor resolves them to
/// `#CIRC!` immediately rather than waiting (`spec.md` §4.5 step 5 / §5).
pub fn build_dependency_edges(
    store: &CellStore,
    graph: &DependencyGraph,
    dirty: &FxHashSet<FormulaHandle>,
    cycle_members: &FxHashSet<FormulaHandle>,
) -> (
    FxHashMap<FormulaHandle, Vec<FormulaHandle>>,
    FxHashMap<FormulaHandle, usize>,
) {
    let mut dependents: FxHashMap<FormulaHandle, Vec<FormulaHandle>> = FxHashMap::default();
    let mut remaining: FxHashMap<FormulaHandle, usize> = FxHashMap::default();

    for handle in dirty {
        dependents.entry(handle.clone()).or_default();
        if cycle_members.contains(handle) {
            remaining.insert(handle.clone(), 0);
            continue;
        }
        let prereqs = prerequisites_of(store, graph, dirty, handle);
        remaining.insert(handle.clone(), prereqs.len());
        for p in prereqs {
            dependents.entry(p).or_default().push(handle.clone());
        }
    }
    (dependents, remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::cell::FormulaCell;
    use formualizer_common::cellref::AbsCellAddr;
    use formualizer_common::coord::RelativeCoord;
    use formualizer_parse::opcode::{Opcode, RefToken, SheetRef};
    use formualizer_parse::token::{Token, TokenStore};
    use std::sync::Arc;

    fn addr(row: u32, col: u32) -> AbsCellAddr {
        AbsCellAddr::new(0, row, col)
    }

    fn formula_ref(anchor: AbsCellAddr, target: AbsCellAddr) -> FormulaHandle {
        let tokens = TokenStore::new(
            vec![Token::new(Opcode::SingleRef(RefToken {
                sheet: SheetRef::Origin,
                coord: RelativeCoord::new(target.row(), target.col(), false, false),
            }))],
            anchor,
        );
        FormulaHandle(FormulaCell::new(
            tokens,
            formualizer_common::cellref::AbsCellRange::single(anchor),
        ))
    }

    #[test]
    fn linear_chain_orders_prerequisites_first() {
        let store = CellStore::new(Arc::new(formualizer_common::intern::StringPool::new()));
        let mut graph = DependencyGraph::new();

        store.set_numeric(addr(0, 0), 1.0); // A1 = 1
        let b1 = formula_ref(addr(0, 1), addr(0, 0)); // B1 = A1
        store.install_formula(b1.clone());
        graph.register(b1.clone());

        let c1 = formula_ref(addr(0, 2), addr(0, 1)); // C1 = B1
        store.install_formula(c1.clone());
        graph.register(c1.clone());

        let dirty: FxHashSet<_> = [b1.clone(), c1.clone()].into_iter().collect();
        let result = topo_order(&store, &graph, &dirty);
        assert_eq!(result.order, vec![b1, c1]);
        assert!(result.cycle_members.is_empty());
    }

    #[test]
    fn self_reference_is_flagged_as_a_cycle_but_still_ordered() {
        let store = CellStore::new(Arc::new(formualizer_common::intern::StringPool::new()));
        let mut graph = DependencyGraph::new();

        let a1 = formula_ref(addr(0, 0), addr(0, 0)); // A1 = A1
        store.install_formula(a1.clone());
        graph.register(a1.clone());

        let dirty: FxHashSet<_> = [a1.clone()].into_iter().collect();
        let result = topo_order(&store, &graph, &dirty);
        assert_eq!(result.order, vec![a1.clone()]);
        assert!(result.cycle_members.contains(&a1));
    }

    #[test]
    fn mutual_cycle_marks_both_members() {
        let store = CellStore::new(Arc::new(formualizer_common::intern::StringPool::new()));
        let mut graph = DependencyGraph::new();

        let a1 = formula_ref(addr(0, 0), addr(0, 1)); // A1 = B1
        let b1 = formula_ref(addr(0, 1), addr(0, 0)); // B1 = A1
        store.install_formula(a1.clone());
        store.install_formula(b1.clone());
        graph.register(a1.clone());
        graph.register(b1.clone());

        let dirty: FxHashSet<_> = [a1.clone(), b1.clone()].into_iter().collect();
        let result = topo_order(&store, &graph, &dirty);
        assert_eq!(result.order.len(), 2);
        assert!(result.cycle_members.contains(&a1));
        assert!(result.cycle_members.contains(&b1));
    }
}
