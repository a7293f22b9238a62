//! C3: the concurrently-readable cell store (`spec.md` §4.1).
//!
//! A sheet is a sparse grid of columns, each a run-length compressed
//! sequence of [`CellSlot`]s. All mutation goes through `CellStore`'s own
//! lock; readers (the interpreter pool) take the same lock for read only,
//! so a calculation run and a structural edit can never interleave, but
//! any number of interpreters can read concurrently.

pub mod cell;
pub mod column;

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::RwLock;

use formualizer_common::cellref::{AbsCellAddr, AbsCellRange, SheetId};
use formualizer_common::error::{ExcelError, ExcelErrorKind};
use formualizer_common::intern::{StringId, StringPool};
use formualizer_common::value::LiteralValue;

pub use cell::{CellAccess, CellSlot, CellValueType, FormulaCell, FormulaHandle, ResultSlot};
use column::Column;

#[derive(Default)]
struct SheetGrid {
    columns: FxHashMap<u32, Column>,
}

impl SheetGrid {
    fn column_mut(&mut self, col: u32) -> &mut Column {
        self.columns.entry(col).or_default()
    }

    fn bounding_range(&self) -> Option<(u32, u32, u32, u32)> {
        let mut acc: Option<(u32, u32, u32, u32)> = None;
        for (&col, column) in &self.columns {
            let Some((lo, hi)) = column.bounding_rows() else {
                continue;
            };
            acc = Some(match acc {
                None => (lo, hi, col, col),
                Some((r0, r1, c0, c1)) => (r0.min(lo), r1.max(hi), c0.min(col), c1.max(col)),
            });
        }
        acc
    }
}

pub struct CellStore {
    sheets: RwLock<FxHashMap<SheetId, SheetGrid>>,
    strings: Arc<StringPool>,
}

impl CellStore {
    pub fn new(strings: Arc<StringPool>) -> Self {
        Self {
            sheets: RwLock::new(FxHashMap::default()),
            strings,
        }
    }

    pub fn strings(&self) -> &Arc<StringPool> {
        &self.strings
    }

    fn with_column_mut<R>(&self, addr: AbsCellAddr, f: impl FnOnce(&mut Column) -> R) -> R {
        let mut sheets = self.sheets.write().unwrap();
        let grid = sheets.entry(addr.sheet).or_default();
        f(grid.column_mut(addr.col()))
    }

    pub fn set_numeric(&self, addr: AbsCellAddr, value: f64) -> Option<FormulaHandle> {
        self.replace(addr, CellSlot::Numeric(value))
    }

    pub fn set_boolean(&self, addr: AbsCellAddr, value: bool) -> Option<FormulaHandle> {
        self.replace(addr, CellSlot::Boolean(value))
    }

    pub fn set_string(&self, addr: AbsCellAddr, text: &str) -> Option<FormulaHandle> {
        let id = self.strings.intern(text);
        self.replace(addr, CellSlot::StringId(id))
    }

    pub fn set_empty(&self, addr: AbsCellAddr) -> Option<FormulaHandle> {
        self.replace(addr, CellSlot::Empty)
    }

    /// Raw slot replacement; returns the dislodged formula handle, if any,
    /// so the caller (C8) can verify it was already unregistered.
    fn replace(&self, addr: AbsCellAddr, slot: CellSlot) -> Option<FormulaHandle> {
        self.with_column_mut(addr, |col| {
            let prev = col.get(addr.row());
            col.set(addr.row(), slot);
            match prev {
                CellSlot::Formula(h) => Some(h),
                _ => None,
            }
        })
    }

    /// Install a (possibly grouped) formula across its whole `range`. Every
    /// position in the rectangle gets the same `FormulaHandle`
    /// (`spec.md` §3 grouped-formula invariant). Returns the displaced
    /// formula handle(s) previously occupying any position in `range`.
    pub fn install_formula(&self, handle: FormulaHandle) -> Vec<FormulaHandle> {
        let range = handle.0.range;
        let mut displaced = FxHashSet::default();
        let mut sheets = self.sheets.write().unwrap();
        let grid = sheets.entry(range.sheet).or_default();
        for col in range.first.col()..=range.last.col() {
            let column = grid.column_mut(col);
            for run in column.runs_in_range(range.first.row(), range.last.row()) {
                if let CellSlot::Formula(h) = &run.slot {
                    displaced.insert(h.clone());
                }
            }
            column.set_run(
                range.first.row(),
                range.height(),
                CellSlot::Formula(handle.clone()),
            );
        }
        displaced.into_iter().collect()
    }

    pub fn formula_handle_at(&self, addr: AbsCellAddr) -> Option<FormulaHandle> {
        let sheets = self.sheets.read().unwrap();
        let grid = sheets.get(&addr.sheet)?;
        let col = grid.columns.get(&addr.col())?;
        match col.get(addr.row()) {
            CellSlot::Formula(h) => Some(h),
            _ => None,
        }
    }

    fn literal_to_access(&self, lv: &LiteralValue) -> CellAccess {
        match lv {
            LiteralValue::Int(i) => CellAccess {
                value_type: CellValueType::Numeric,
                numeric: *i as f64,
                string_view: None,
                boolean: false,
                error: None,
            },
            LiteralValue::Number(n) => CellAccess {
                value_type: CellValueType::Numeric,
                numeric: *n,
                string_view: None,
                boolean: false,
                error: None,
            },
            LiteralValue::Boolean(b) => CellAccess {
                value_type: CellValueType::Boolean,
                numeric: 0.0,
                string_view: None,
                boolean: *b,
                error: None,
            },
            LiteralValue::Text(s) => CellAccess {
                value_type: CellValueType::String,
                numeric: 0.0,
                string_view: Some(Arc::from(s.as_str())),
                boolean: false,
                error: None,
            },
            LiteralValue::Error(e) => CellAccess {
                value_type: CellValueType::Error,
                numeric: 0.0,
                string_view: None,
                boolean: false,
                error: Some(e.clone()),
            },
            LiteralValue::Empty | LiteralValue::Pending => CellAccess::empty(),
            other => {
                // Dates/times/durations: expose through the numeric (serial)
                // view, matching the store's simplified value surface.
                match other.as_serial_number() {
                    Some(n) => CellAccess {
                        value_type: CellValueType::Numeric,
                        numeric: n,
                        string_view: None,
                        boolean: false,
                        error: None,
                    },
                    None => CellAccess::empty(),
                }
            }
        }
    }

    fn formula_access(&self, handle: &FormulaHandle, addr: AbsCellAddr) -> CellAccess {
        let Some(value) = handle.0.result.get() else {
            return CellAccess::empty();
        };
        if handle.0.is_grouped() {
            if let LiteralValue::Array(rows) = &value {
                let r = (addr.row() - handle.0.range.first.row()) as usize;
                let c = (addr.col() - handle.0.range.first.col()) as usize;
                return rows
                    .get(r)
                    .and_then(|row| row.get(c))
                    .map(|v| self.literal_to_access(v))
                    .unwrap_or_else(|| {
                        self.literal_to_access(&LiteralValue::Error(ExcelError::new(
                            ExcelErrorKind::Ref,
                        )))
                    });
            }
        }
        self.literal_to_access(&value)
    }

    pub fn get_cell_access(&self, addr: AbsCellAddr) -> CellAccess {
        let sheets = self.sheets.read().unwrap();
        let Some(grid) = sheets.get(&addr.sheet) else {
            return CellAccess::empty();
        };
        let Some(col) = grid.columns.get(&addr.col()) else {
            return CellAccess::empty();
        };
        match col.get(addr.row()) {
            CellSlot::Empty => CellAccess::empty(),
            CellSlot::Numeric(n) => CellAccess {
                value_type: CellValueType::Numeric,
                numeric: n,
                string_view: None,
                boolean: false,
                error: None,
            },
            CellSlot::Boolean(b) => CellAccess {
                value_type: CellValueType::Boolean,
                numeric: 0.0,
                string_view: None,
                boolean: b,
                error: None,
            },
            CellSlot::StringId(id) => CellAccess {
                value_type: CellValueType::String,
                numeric: 0.0,
                string_view: Some(self.strings.resolve(id)),
                boolean: false,
                error: None,
            },
            CellSlot::Formula(handle) => self.formula_access(&handle, addr),
        }
    }

    /// Every non-empty address in `range`, in row-major order, without
    /// visiting the empty gaps between runs (`spec.md` §4.1 "O(log n) to
    /// scan"). Used by aggregate functions and range-dirtying.
    pub fn non_empty_in_range(&self, range: AbsCellRange) -> Vec<AbsCellAddr> {
        let sheets = self.sheets.read().unwrap();
        let mut out = Vec::new();
        let Some(grid) = sheets.get(&range.sheet) else {
            return out;
        };
        for col in range.first.col()..=range.last.col() {
            let Some(column) = grid.columns.get(&col) else {
                continue;
            };
            for run in column.runs_in_range(range.first.row(), range.last.row()) {
                let lo = run.start_row.max(range.first.row());
                let hi = run.end_row().min(range.last.row());
                for row in lo..=hi {
                    out.push(AbsCellAddr::new(range.sheet, row, col));
                }
            }
        }
        out.sort();
        out
    }

    /// Distinct formula handles with any footprint inside `range`. A
    /// grouped formula spanning several columns is returned once
    /// (`spec.md` §4.4 "register").
    pub fn formula_handles_in_range(&self, range: AbsCellRange) -> Vec<FormulaHandle> {
        let sheets = self.sheets.read().unwrap();
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        let Some(grid) = sheets.get(&range.sheet) else {
            return out;
        };
        for col in range.first.col()..=range.last.col() {
            let Some(column) = grid.columns.get(&col) else {
                continue;
            };
            for run in column.runs_in_range(range.first.row(), range.last.row()) {
                if let CellSlot::Formula(h) = &run.slot {
                    if seen.insert(h.clone()) {
                        out.push(h.clone());
                    }
                }
            }
        }
        out
    }

    /// The smallest rectangle covering every non-empty cell on `sheet`, or
    /// `None` if the sheet is empty.
    pub fn get_data_range(&self, sheet: SheetId) -> Option<AbsCellRange> {
        let sheets = self.sheets.read().unwrap();
        let grid = sheets.get(&sheet)?;
        let (r0, r1, c0, c1) = grid.bounding_range()?;
        AbsCellRange::new(
            sheet,
            formualizer_common::coord::Coord::new(r0, c0),
            formualizer_common::coord::Coord::new(r1, c1),
        )
        .ok()
    }

    /// Visit every position in `range` in row-major order, including
    /// implicit empties, yielding the address and its resolved access view.
    pub fn model_iterator(&self, range: AbsCellRange) -> Vec<(AbsCellAddr, CellAccess)> {
        let mut out = Vec::with_capacity((range.width() as usize) * (range.height() as usize));
        for row in range.first.row()..=range.last.row() {
            for col in range.first.col()..=range.last.col() {
                let addr = AbsCellAddr::new(range.sheet, row, col);
                out.push((addr, self.get_cell_access(addr)));
            }
        }
        out
    }

    pub fn resolve_string(&self, id: StringId) -> Arc<str> {
        self.strings.resolve(id)
    }
}
