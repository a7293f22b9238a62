//! Programmer-facing API errors (`spec.md` §7.2), distinct from
//! [`formualizer_common::ExcelError`], which is the user-facing *cell*
//! error currency (§7.1). A `ModelError` means the caller broke a `Model`
//! API contract; an `ExcelError` means a formula evaluated to `#DIV/0!`
//! and so on.

use formualizer_common::cellref::{AbsCellAddr, SheetId};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("sheet name {0:?} is already in use")]
    SheetNameConflict(String),

    #[error("{0:?} is not a valid named expression")]
    InvalidNamedExpression(String),

    /// Returned by `unregister_formula_cell` for a cell with no
    /// registration on file (`spec.md` §9 Open Questions).
    #[error("formula cell at {0} is not registered")]
    FormulaCellNotRegistered(AbsCellAddr),

    /// A non-formula overwrite found a still-registered formula occupying
    /// the target cell; the caller must unregister it first.
    #[error("formula cell at {0} is still registered; unregister it before overwriting")]
    FormulaCellStillRegistered(AbsCellAddr),

    #[error("unknown sheet id {0}")]
    UnknownSheet(SheetId),

    #[error("address {0} is out of the supported range")]
    InvalidAddress(String),

    /// Catch-all for broken internal invariants that can be surfaced as a
    /// typed error instead of a panic (`spec.md` §11, `general_error`).
    #[error("internal error: {0}")]
    Internal(String),
}
