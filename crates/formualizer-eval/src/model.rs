//! C8: the public façade (`spec.md` §4.8). Thin, validating wrappers around
//! C3–C7 — this is the only module most callers ever touch directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;

use formualizer_common::cellref::{AbsCellAddr, AbsCellRange, SheetId, INVALID_SHEET};
use formualizer_common::error::ExcelError;
use formualizer_common::intern::StringPool;
use formualizer_parse::token::TokenStoreRef;

use crate::config::EvalConfig;
use crate::depgraph::DependencyGraph;
use crate::error::ModelError;
use crate::executor::Executor;
use crate::observer::CalcObserver;
use crate::schedule::{self, ScheduleResult};
use crate::store::cell::FormulaCell;
use crate::store::{CellAccess, CellStore, FormulaHandle};

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("static pattern is valid"));

/// Scope a named expression is visible in (`spec.md` §4.8
/// `set_named_expression`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedExpressionScope {
    Global,
    Sheet(SheetId),
}

#[derive(Debug, Clone)]
pub struct NamedExpression {
    pub name: String,
    pub origin: AbsCellAddr,
    pub tokens: TokenStoreRef,
}

fn validate_name(name: &str) -> Result<(), ModelError> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(ModelError::InvalidNamedExpression(name.to_string()))
    }
}

fn validate_addr(addr: AbsCellAddr) -> Result<(), ModelError> {
    if addr.is_valid() {
        Ok(())
    } else {
        Err(ModelError::InvalidAddress(addr.to_string()))
    }
}

/// Owns the cell store, dependency graph, and (lazily) the worker pool.
/// Every public method here is the validating boundary §7 calls for:
/// programmer-contract violations fail fast as a typed `ModelError`, cell
/// evaluation errors never surface here at all — they live in the cell's
/// own `CellAccess`/`ExcelError`.
pub struct Model {
    store: Arc<CellStore>,
    graph: RwLock<DependencyGraph>,
    config: EvalConfig,
    observer: Arc<dyn CalcObserver>,
    executor: Executor,
    cancel: Arc<AtomicBool>,
    sheets: RwLock<FxHashMap<String, SheetId>>,
    named: RwLock<FxHashMap<(Option<SheetId>, String), NamedExpression>>,
}

impl Model {
    pub fn new(config: EvalConfig) -> Self {
        Self::with_observer(config, Arc::new(()))
    }

    pub fn with_observer(config: EvalConfig, observer: Arc<dyn CalcObserver>) -> Self {
        Self {
            store: Arc::new(CellStore::new(Arc::new(StringPool::new()))),
            graph: RwLock::new(DependencyGraph::new()),
            config,
            observer,
            executor: Executor::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            sheets: RwLock::new(FxHashMap::default()),
            named: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    // --- Sheets --------------------------------------------------------

    pub fn append_sheet(&self, name: &str) -> Result<SheetId, ModelError> {
        let mut sheets = self.sheets.write().unwrap();
        if sheets.contains_key(name) {
            return Err(ModelError::SheetNameConflict(name.to_string()));
        }
        let id = sheets.len() as SheetId;
        sheets.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn sheet_id(&self, name: &str) -> Result<SheetId, ModelError> {
        self.sheets
            .read()
            .unwrap()
            .get(name)
            .copied()
            .ok_or(ModelError::UnknownSheet(INVALID_SHEET))
    }

    // --- Cell mutation ---------------------------------------------------

    /// A still-registered formula occupying `addr` blocks any overwrite
    /// (`spec.md` §4.8 "if a formula is overwritten the caller must have
    /// unregistered it first").
    fn guard_overwrite(&self, addr: AbsCellAddr) -> Result<(), ModelError> {
        if let Some(handle) = self.store.formula_handle_at(addr) {
            if self.graph.read().unwrap().is_registered(&handle) {
                return Err(ModelError::FormulaCellStillRegistered(addr));
            }
        }
        Ok(())
    }

    fn guard_overwrite_range(&self, range: AbsCellRange) -> Result<(), ModelError> {
        let graph = self.graph.read().unwrap();
        for handle in self.store.formula_handles_in_range(range) {
            if graph.is_registered(&handle) {
                return Err(ModelError::FormulaCellStillRegistered(
                    handle.0.range.first_addr(),
                ));
            }
        }
        Ok(())
    }

    pub fn set_numeric_cell(&self, addr: AbsCellAddr, value: f64) -> Result<(), ModelError> {
        validate_addr(addr)?;
        self.guard_overwrite(addr)?;
        self.store.set_numeric(addr, value);
        Ok(())
    }

    pub fn set_boolean_cell(&self, addr: AbsCellAddr, value: bool) -> Result<(), ModelError> {
        validate_addr(addr)?;
        self.guard_overwrite(addr)?;
        self.store.set_boolean(addr, value);
        Ok(())
    }

    pub fn set_string_cell(&self, addr: AbsCellAddr, value: &str) -> Result<(), ModelError> {
        validate_addr(addr)?;
        self.guard_overwrite(addr)?;
        self.store.set_string(addr, value);
        Ok(())
    }

    pub fn set_empty_cell(&self, addr: AbsCellAddr) -> Result<(), ModelError> {
        validate_addr(addr)?;
        self.guard_overwrite(addr)?;
        self.store.set_empty(addr);
        Ok(())
    }

    /// Installs a (possibly grouped) formula cell without registering it
    /// (`spec.md` §4.8 `set_formula_cell`). The caller decides separately
    /// whether it has refs worth registering (scenario 4: a constant
    /// formula with none).
    pub fn set_formula_cell(
        &self,
        tokens: TokenStoreRef,
        range: AbsCellRange,
    ) -> Result<FormulaHandle, ModelError> {
        validate_addr(range.first_addr())?;
        validate_addr(range.last_addr())?;
        self.guard_overwrite_range(range)?;
        let handle = FormulaHandle(FormulaCell::new(tokens, range));
        self.store.install_formula(handle.clone());
        Ok(handle)
    }

    // --- Dependency graph -------------------------------------------------

    pub fn register_formula_cell(&self, handle: FormulaHandle) {
        self.graph.write().unwrap().register(handle);
    }

    pub fn unregister_formula_cell(&self, handle: &FormulaHandle) -> Result<(), ModelError> {
        self.graph
            .write()
            .unwrap()
            .unregister(handle)
            .map_err(|_| ModelError::FormulaCellNotRegistered(handle.0.range.first_addr()))
    }

    /// Inverse lookup from a live handle back to its anchor address
    /// (`spec.md` §11, `get_cell_position`).
    pub fn cell_position(&self, handle: &FormulaHandle) -> Option<AbsCellAddr> {
        Some(handle.0.range.first_addr())
    }

    // --- Calculation ------------------------------------------------------

    /// `spec.md` §4.5: turn a set of mutated ranges (plus any caller-flagged
    /// dirty formulas that have no refs to trigger propagation on their
    /// own) into a cycle-annotated, dependency-respecting batch.
    pub fn query_and_sort_dirty_cells(
        &self,
        modified: &[AbsCellRange],
        dirty_formulas: &[FormulaHandle],
    ) -> ScheduleResult {
        let graph = self.graph.read().unwrap();
        let dirty = schedule::collect_dirty(&graph, modified, dirty_formulas);
        schedule::topo_order(&self.store, &graph, &dirty)
    }

    /// Runs the pool per §4.7; blocks until every cell in `schedule.order`
    /// has a result or an error. No partial batches.
    pub fn calculate_sorted_cells(&self, schedule: &ScheduleResult) {
        if !schedule.cycle_members.is_empty() {
            let members: Vec<FormulaHandle> = schedule.cycle_members.iter().cloned().collect();
            self.observer.on_cycle_detected(&members);
        }
        let dirty: rustc_hash::FxHashSet<FormulaHandle> = schedule.order.iter().cloned().collect();
        let graph = self.graph.read().unwrap();
        self.executor.run(
            &self.store,
            &graph,
            &dirty,
            schedule,
            &self.config,
            &self.observer,
            &self.cancel,
        );
    }

    /// Interrupts dispatch of the in-flight run: cells already dispatched
    /// still complete, no further cell is started (`spec.md` §5
    /// "Cancellation/timeout").
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn reset_cancellation(&self) {
        self.cancel.store(false, Ordering::Release);
    }

    // --- Reads --------------------------------------------------------

    pub fn get_cell_access(&self, addr: AbsCellAddr) -> CellAccess {
        self.store.get_cell_access(addr)
    }

    pub fn get_numeric_value(&self, addr: AbsCellAddr) -> f64 {
        self.store.get_cell_access(addr).numeric
    }

    pub fn get_string_value(&self, addr: AbsCellAddr) -> String {
        self.store
            .get_cell_access(addr)
            .string_view
            .map(|s| s.to_string())
            .unwrap_or_default()
    }

    pub fn get_boolean_value(&self, addr: AbsCellAddr) -> bool {
        self.store.get_cell_access(addr).boolean
    }

    pub fn get_error_value(&self, addr: AbsCellAddr) -> Option<ExcelError> {
        self.store.get_cell_access(addr).error
    }

    pub fn get_data_range(&self, sheet: SheetId) -> Option<AbsCellRange> {
        self.store.get_data_range(sheet)
    }

    /// Row-major only: `spec.md`'s abstract `direction` parameter is left
    /// unimplemented here, since nothing in this core produces a
    /// column-major consumer; see `DESIGN.md` for the Open Question
    /// resolution.
    pub fn get_model_iterator(&self, range: AbsCellRange) -> Vec<(AbsCellAddr, CellAccess)> {
        self.store.model_iterator(range)
    }

    // --- Named expressions -------------------------------------------------

    pub fn set_named_expression(
        &self,
        scope: NamedExpressionScope,
        name: &str,
        origin: AbsCellAddr,
        tokens: TokenStoreRef,
    ) -> Result<(), ModelError> {
        validate_name(name)?;
        let key_scope = match scope {
            NamedExpressionScope::Global => None,
            NamedExpressionScope::Sheet(id) => Some(id),
        };
        self.named.write().unwrap().insert(
            (key_scope, name.to_string()),
            NamedExpression {
                name: name.to_string(),
                origin,
                tokens,
            },
        );
        Ok(())
    }

    /// Lazy in the sense of "not recomputed until called, not restartable
    /// once consumed" (`spec.md` §4.8) — a snapshot `Vec`'s `into_iter` has
    /// exactly that contract without holding the lock open across calls.
    pub fn get_named_expressions_iterator(
        &self,
        scope: NamedExpressionScope,
    ) -> impl Iterator<Item = NamedExpression> {
        let key_scope = match scope {
            NamedExpressionScope::Global => None,
            NamedExpressionScope::Sheet(id) => Some(id),
        };
        let named = self.named.read().unwrap();
        named
            .iter()
            .filter(move |((s, _), _)| *s == key_scope)
            .map(|(_, v)| v.clone())
            .collect::<Vec<_>>()
            .into_iter()
    }
}
