//! Formula cells, grouped-formula handles, and the write-once result slot
//! (`spec.md` §3 "Formula cell" / §9 "Shared mutable formula results").

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use formualizer_common::cellref::AbsCellRange;
use formualizer_common::value::LiteralValue;
use formualizer_parse::token::TokenStoreRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    Unresolved,
    Resolving,
    Resolved,
}

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const RESOLVED: u8 = 2;

/// A write-once-per-run container. Exactly one worker publishes a value per
/// calculation pass; the publish takes the mutex and then releases the
/// state, so dependents reading through the ready queue observe it with an
/// acquire (`spec.md` §5 "Shared-resource policy"). [`reset`] rearms the
/// slot for the next run — formula cells outlive a single calculation pass
/// and are shared by `Arc`, so rearming has to go through `&self` rather
/// than requiring exclusive ownership.
#[derive(Debug, Default)]
pub struct ResultSlot {
    state: AtomicU8,
    value: Mutex<Option<LiteralValue>>,
}

impl ResultSlot {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UNRESOLVED),
            value: Mutex::new(None),
        }
    }

    /// Drop the previous run's outcome and rearm for a fresh resolution.
    /// Must be called before the handle is reintroduced to a ready queue;
    /// calling it while another thread is mid-`publish` races the slot.
    pub fn reset(&self) {
        *self.value.lock().unwrap() = None;
        self.state.store(UNRESOLVED, Ordering::Release);
    }

    pub fn state(&self) -> ResultState {
        match self.state.load(Ordering::Acquire) {
            UNRESOLVED => ResultState::Unresolved,
            RESOLVING => ResultState::Resolving,
            _ => ResultState::Resolved,
        }
    }

    /// Attempt to claim this cell for interpretation. Returns `true` if the
    /// caller is now the sole resolver; `false` means another caller already
    /// claimed it (or it was pre-resolved, e.g. a cycle member).
    pub fn try_begin_resolving(&self) -> bool {
        self.state
            .compare_exchange(
                UNRESOLVED,
                RESOLVING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn publish(&self, value: LiteralValue) {
        *self.value.lock().unwrap() = Some(value);
        self.state.store(RESOLVED, Ordering::Release);
    }

    pub fn get(&self) -> Option<LiteralValue> {
        self.value.lock().unwrap().clone()
    }
}

/// Strong handle to a formula cell, usable as a hash-map key by pointer
/// identity. Cheap to clone (one `Arc` bump).
#[derive(Clone)]
pub struct FormulaHandle(pub Arc<FormulaCell>);

impl PartialEq for FormulaHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for FormulaHandle {}
impl Hash for FormulaHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}
impl std::fmt::Debug for FormulaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FormulaHandle({:p})", Arc::as_ptr(&self.0))
    }
}

/// A formula cell. `range` is a single address for an ungrouped formula or
/// the shared rectangle for a grouped formula — every position in `range`
/// stores a `CellSlot::Formula` pointing at the same `FormulaCell`
/// (`spec.md` §3 "Grouped formula cells" invariant).
pub struct FormulaCell {
    pub tokens: TokenStoreRef,
    pub range: AbsCellRange,
    pub result: ResultSlot,
    pub dirty: std::sync::atomic::AtomicBool,
    pub interpreted: std::sync::atomic::AtomicBool,
    pub circular_safe: std::sync::atomic::AtomicBool,
    pub volatile: bool,
}

impl FormulaCell {
    pub fn new(tokens: TokenStoreRef, range: AbsCellRange) -> Arc<Self> {
        let volatile = tokens.is_volatile();
        Arc::new(Self {
            tokens,
            range,
            result: ResultSlot::new(),
            dirty: std::sync::atomic::AtomicBool::new(true),
            interpreted: std::sync::atomic::AtomicBool::new(false),
            circular_safe: std::sync::atomic::AtomicBool::new(true),
            volatile,
        })
    }

    pub fn is_grouped(&self) -> bool {
        !self.range.is_single_cell()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Observed value type from the caller's perspective (`spec.md` §3
/// `cell_value_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellValueType {
    Empty,
    Numeric,
    String,
    Boolean,
    Error,
}

/// What a grid position actually holds.
#[derive(Clone)]
pub enum CellSlot {
    Empty,
    Numeric(f64),
    Boolean(bool),
    StringId(formualizer_common::intern::StringId),
    Formula(FormulaHandle),
}

impl CellSlot {
    pub fn value_type(&self) -> CellValueType {
        match self {
            CellSlot::Empty => CellValueType::Empty,
            CellSlot::Numeric(_) => CellValueType::Numeric,
            CellSlot::Boolean(_) => CellValueType::Boolean,
            CellSlot::StringId(_) => CellValueType::String,
            // Resolved lazily by the store when building a CellAccess.
            CellSlot::Formula(_) => CellValueType::Empty,
        }
    }
}

/// Immutable read view over one cell, independent of how it's stored.
#[derive(Debug, Clone)]
pub struct CellAccess {
    pub value_type: CellValueType,
    pub numeric: f64,
    pub string_view: Option<Arc<str>>,
    pub boolean: bool,
    pub error: Option<formualizer_common::error::ExcelError>,
}

impl CellAccess {
    pub fn empty() -> Self {
        Self {
            value_type: CellValueType::Empty,
            numeric: 0.0,
            string_view: None,
            boolean: false,
            error: None,
        }
    }
}
