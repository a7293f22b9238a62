//! The reference-counted, immutable token store (`spec.md` §3/§4.3).
//!
//! A token store is shared across every position of a grouped formula, so
//! it is always handed out behind an `Arc`; `TokenStore::new` returns the
//! `Arc` directly rather than a bare value.

use std::sync::Arc;

use smallvec::SmallVec;

use formualizer_common::cellref::{AbsCellAddr, AbsCellRange, SheetId};
use formualizer_common::coord::{Coord, RelativeCoord};

use crate::opcode::{FunctionId, Opcode, SheetRef};

/// Most formulas reference a handful of ranges at most; inline storage for
/// the common case avoids a heap allocation per `register_formula_cell`.
pub type RefList = SmallVec<[AbsCellRange; 4]>;

fn bounding_box(sheet: SheetId, a: Coord, b: Coord) -> AbsCellRange {
    let lo_row = a.row().min(b.row());
    let hi_row = a.row().max(b.row());
    let lo_col = a.col().min(b.col());
    let hi_col = a.col().max(b.col());
    AbsCellRange::new(sheet, Coord::new(lo_row, lo_col), Coord::new(hi_row, hi_col))
        .expect("min/max construction is always ordered")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub opcode: Opcode,
}

impl Token {
    pub fn new(opcode: Opcode) -> Self {
        Self { opcode }
    }
}

/// An immutable, reference-counted sequence of formula tokens plus the
/// origin address used to resolve relative references.
#[derive(Debug)]
pub struct TokenStore {
    tokens: Vec<Token>,
    origin: AbsCellAddr,
    volatile: bool,
}

pub type TokenStoreRef = Arc<TokenStore>;

impl TokenStore {
    pub fn new(tokens: Vec<Token>, origin: AbsCellAddr) -> TokenStoreRef {
        let volatile = tokens.iter().any(|t| {
            matches!(&t.opcode, Opcode::FunctionCall { id, .. } if id.is_volatile())
        });
        Arc::new(Self {
            tokens,
            origin,
            volatile,
        })
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn origin(&self) -> AbsCellAddr {
        self.origin
    }

    /// Computed once at construction by scanning for volatile function-ids
    /// (`spec.md` §4.5 "Volatile detection").
    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    /// Resolve a ref token's coordinate for a given evaluation position.
    ///
    /// For an ungrouped formula `at == self.origin` and this is a no-op
    /// translation. For a grouped formula evaluated as/observed at a
    /// member position other than the anchor, non-absolute components
    /// shift by the anchor -> member delta, matching Excel's fill-down
    /// semantics for relative references.
    pub fn resolve_coord(&self, rel: RelativeCoord, at: Coord) -> Coord {
        let origin_rel = RelativeCoord::new(self.origin.row(), self.origin.col(), false, false);
        let at_rel = RelativeCoord::new(at.row(), at.col(), false, false);
        rel.rebase(origin_rel, at_rel).into_absolute()
    }

    fn resolve_sheet(&self, sheet: SheetRef) -> SheetId {
        match sheet {
            SheetRef::Origin => self.origin.sheet,
            SheetRef::Fixed(id) => id,
        }
    }

    pub fn resolve_single_ref(&self, r: crate::opcode::RefToken, at: Coord) -> AbsCellAddr {
        AbsCellAddr::from_coord(self.resolve_sheet(r.sheet), self.resolve_coord(r.coord, at))
    }

    pub fn resolve_range_ref(&self, r: crate::opcode::RangeRefToken, at: Coord) -> AbsCellRange {
        let sheet = self.resolve_sheet(r.sheet);
        let first = self.resolve_coord(r.first, at);
        let last = self.resolve_coord(r.last, at);
        let (lo_row, hi_row) = (first.row().min(last.row()), first.row().max(last.row()));
        let (lo_col, hi_col) = (first.col().min(last.col()), first.col().max(last.col()));
        AbsCellRange::new(sheet, Coord::new(lo_row, lo_col), Coord::new(hi_row, hi_col))
            .expect("min/max construction is always ordered")
    }

    /// Enumerate the absolute ranges this formula observes, evaluated at
    /// its own anchor (`spec.md` §4.4 `register`). Single-cell refs widen
    /// to a one-cell range so the dependency graph has one payload shape.
    pub fn collect_refs(&self) -> RefList {
        let anchor = self.origin.coord;
        let mut out = RefList::new();
        for t in &self.tokens {
            match &t.opcode {
                Opcode::SingleRef(r) => {
                    out.push(AbsCellRange::single(self.resolve_single_ref(*r, anchor)))
                }
                Opcode::RangeRef(r) => out.push(self.resolve_range_ref(*r, anchor)),
                _ => {}
            }
        }
        out
    }

    /// Like [`Self::collect_refs`], but widened to cover every member of a
    /// grouped formula's `footprint`. A relative reference shifts by the
    /// same delta at every member, so the region it sweeps out over the
    /// whole group is exactly the bounding box of the reference resolved
    /// at the footprint's two opposite corners.
    pub fn collect_refs_over(&self, footprint: AbsCellRange) -> RefList {
        if footprint.is_single_cell() {
            return self.collect_refs();
        }
        let near = footprint.first;
        let far = footprint.last;
        let mut out = RefList::new();
        for t in &self.tokens {
            match &t.opcode {
                Opcode::SingleRef(r) => {
                    let a = self.resolve_single_ref(*r, near);
                    let b = self.resolve_single_ref(*r, far);
                    out.push(bounding_box(a.sheet, a.coord, b.coord));
                }
                Opcode::RangeRef(r) => {
                    let a = self.resolve_range_ref(*r, near);
                    let b = self.resolve_range_ref(*r, far);
                    let lo = bounding_box(a.sheet, a.first, b.first);
                    let hi = bounding_box(a.sheet, a.last, b.last);
                    out.push(bounding_box(a.sheet, lo.first, hi.last));
                }
                _ => {}
            }
        }
        out
    }

    pub fn function_ids(&self) -> impl Iterator<Item = FunctionId> + '_ {
        self.tokens.iter().filter_map(|t| match &t.opcode {
            Opcode::FunctionCall { id, .. } => Some(*id),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::RefToken;

    fn addr(sheet: SheetId, row: u32, col: u32) -> AbsCellAddr {
        AbsCellAddr::new(sheet, row, col)
    }

    #[test]
    fn ungrouped_resolution_is_identity_translation() {
        // A ref token always stores the coordinate already resolved against
        // its own origin, so evaluating at the anchor is a no-op shift.
        let origin = addr(0, 1, 1); // B2 (0-based row1,col1)
        let tokens = vec![Token::new(Opcode::SingleRef(RefToken {
            sheet: SheetRef::Origin,
            coord: RelativeCoord::new(0, 1, false, false),
        }))];
        let store = TokenStore::new(tokens, origin);
        let refs = store.collect_refs();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].first, Coord::new(0, 1));
    }

    #[test]
    fn volatile_flag_detected_from_function_ids() {
        let tokens = vec![Token::new(Opcode::FunctionCall {
            id: FunctionId::Now,
            arg_count: 0,
        })];
        let store = TokenStore::new(tokens, addr(0, 0, 0));
        assert!(store.is_volatile());
    }

    #[test]
    fn grouped_member_rebases_relative_ref() {
        // Anchor at A1, group member at A2 (one row down); a relative ref
        // to "one row up" from the anchor should shift down with the member.
        let origin = addr(0, 0, 0); // A1
        let tokens = vec![Token::new(Opcode::SingleRef(RefToken {
            sheet: SheetRef::Origin,
            coord: RelativeCoord::new(0, 1, false, false), // B1 relative to A1
        }))];
        let store = TokenStore::new(tokens, origin);
        let member = Coord::new(1, 0); // A2
        let resolved = store.resolve_coord(RelativeCoord::new(0, 1, false, false), member);
        assert_eq!(resolved, Coord::new(1, 1)); // B2
    }

    #[test]
    fn grouped_footprint_widens_observed_range_to_the_swept_bounding_box() {
        // =A1 filled down B1:B3 observes A1, A2, A3.
        let origin = addr(0, 0, 1); // B1
        let tokens = vec![Token::new(Opcode::SingleRef(RefToken {
            sheet: SheetRef::Origin,
            coord: RelativeCoord::new(0, 0, false, false), // A1, resolved at the anchor
        }))];
        let store = TokenStore::new(tokens, origin);
        let footprint = AbsCellRange::new(0, Coord::new(0, 1), Coord::new(2, 1)).unwrap(); // B1:B3
        let refs = store.collect_refs_over(footprint);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].first, Coord::new(0, 0));
        assert_eq!(refs[0].last, Coord::new(2, 0));
    }
}
