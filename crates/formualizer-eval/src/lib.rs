//! Dependency graph, dirty-set scheduler, and parallel formula evaluation
//! core (`spec.md` C3–C8): a cell store, a listener graph, an iterative
//! topological sort, a recursive-descent interpreter, a persistent
//! worker-pool executor, and the `Model` façade tying them together.

pub mod builtins;
pub mod config;
pub mod depgraph;
pub mod error;
pub mod executor;
pub mod interp;
pub mod model;
pub mod observer;
pub mod schedule;
pub mod store;

pub use config::EvalConfig;
pub use depgraph::DependencyGraph;
pub use error::ModelError;
pub use executor::Executor;
pub use model::{Model, NamedExpression, NamedExpressionScope};
pub use observer::CalcObserver;
pub use schedule::ScheduleResult;
pub use store::{CellAccess, CellStore, CellValueType, FormulaHandle};
