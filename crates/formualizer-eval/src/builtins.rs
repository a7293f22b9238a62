//! A minimal function set so the core is exercisable end-to-end without a
//! real function library, which is explicitly out of scope (`spec.md` §1
//! Non-goals). Grounded on the teacher's `builtins/` directory shape, but
//! trimmed to the handful of `FunctionId` variants this crate defines.

use formualizer_common::error::{ExcelError, ExcelErrorKind};
use formualizer_common::value::LiteralValue;

use formualizer_parse::opcode::FunctionId;

use crate::config::EvalConfig;
use crate::interp::{to_text, EvalNode};
use crate::store::CellStore;

/// Every numeric cell a `Scalar`/`Range` argument resolves to, in order.
/// Ranges skip non-numeric cells the way Excel's `SUM`/`AVERAGE` do;
/// a bare numeric scalar argument always counts.
fn numeric_terms(
    args: &[EvalNode],
    store: &CellStore,
) -> Result<Vec<f64>, ExcelError> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            EvalNode::Scalar(LiteralValue::Error(e)) => return Err(e.clone()),
            EvalNode::Scalar(v) => {
                if let Some(n) = v.as_serial_number() {
                    out.push(n);
                }
            }
            EvalNode::Range(r) => {
                for addr in store.non_empty_in_range(*r) {
                    let access = store.get_cell_access(addr);
                    if access.value_type == crate::store::CellValueType::Error {
                        return Err(access
                            .error
                            .unwrap_or_else(|| ExcelError::new(ExcelErrorKind::Error)));
                    }
                    if access.value_type == crate::store::CellValueType::Numeric {
                        out.push(access.numeric);
                    }
                }
            }
        }
    }
    Ok(out)
}

pub fn call(id: FunctionId, args: Vec<EvalNode>, store: &CellStore, config: &EvalConfig) -> LiteralValue {
    match id {
        FunctionId::Sum => match numeric_terms(&args, store) {
            Ok(terms) => LiteralValue::Number(terms.iter().sum()),
            Err(e) => LiteralValue::Error(e),
        },
        FunctionId::Average => match numeric_terms(&args, store) {
            Ok(terms) if terms.is_empty() => {
                LiteralValue::Error(ExcelError::new(ExcelErrorKind::Div))
            }
            Ok(terms) => LiteralValue::Number(terms.iter().sum::<f64>() / terms.len() as f64),
            Err(e) => LiteralValue::Error(e),
        },
        FunctionId::Count => match numeric_terms(&args, store) {
            Ok(terms) => LiteralValue::Number(terms.len() as f64),
            Err(e) => LiteralValue::Error(e),
        },
        FunctionId::Max => match numeric_terms(&args, store) {
            Ok(terms) => LiteralValue::Number(terms.into_iter().fold(f64::NEG_INFINITY, f64::max)),
            Err(e) => LiteralValue::Error(e),
        },
        FunctionId::Min => match numeric_terms(&args, store) {
            Ok(terms) => LiteralValue::Number(terms.into_iter().fold(f64::INFINITY, f64::min)),
            Err(e) => LiteralValue::Error(e),
        },
        FunctionId::If => {
            let mut iter = args.into_iter();
            let cond = iter.next();
            let then_branch = iter.next();
            let else_branch = iter.next();
            let cond_val = match cond {
                Some(EvalNode::Scalar(v)) => v,
                Some(EvalNode::Range(r)) if r.is_single_cell() => {
                    LiteralValue::from(store.get_cell_access(r.first_addr()))
                }
                _ => return LiteralValue::Error(ExcelError::new(ExcelErrorKind::Value)),
            };
            let branch = if cond_val.is_truthy() {
                then_branch
            } else {
                else_branch
            };
            match branch {
                Some(EvalNode::Scalar(v)) => v,
                Some(EvalNode::Range(r)) if r.is_single_cell() => {
                    LiteralValue::from(store.get_cell_access(r.first_addr()))
                }
                Some(EvalNode::Range(_)) => LiteralValue::Error(ExcelError::new(ExcelErrorKind::Value)),
                None => LiteralValue::Boolean(false),
            }
        }
        FunctionId::Concat => {
            let mut out = String::new();
            for arg in args {
                let v = match arg {
                    EvalNode::Scalar(v) => v,
                    EvalNode::Range(r) if r.is_single_cell() => {
                        LiteralValue::from(store.get_cell_access(r.first_addr()))
                    }
                    EvalNode::Range(_) => {
                        return LiteralValue::Error(ExcelError::new(ExcelErrorKind::Value))
                    }
                };
                match to_text(&v) {
                    Ok(s) => out.push_str(&s),
                    Err(e) => return LiteralValue::Error(e),
                }
            }
            LiteralValue::Text(out)
        }
        FunctionId::Now => now_value(config),
        FunctionId::Today => today_value(config),
        FunctionId::Rand => LiteralValue::Number(pseudo_rand(config, 0.0, 1.0)),
        FunctionId::RandBetween => {
            let lo = args
                .first()
                .and_then(|a| match a {
                    EvalNode::Scalar(v) => v.as_serial_number(),
                    _ => None,
                })
                .unwrap_or(0.0);
            let hi = args
                .get(1)
                .and_then(|a| match a {
                    EvalNode::Scalar(v) => v.as_serial_number(),
                    _ => None,
                })
                .unwrap_or(1.0);
            LiteralValue::Number(pseudo_rand(config, lo, hi).floor())
        }
        FunctionId::Other(_) => LiteralValue::Error(ExcelError::new(ExcelErrorKind::Name)),
    }
}

/// Fixed date `deterministic_mode` pins volatile date/time builtins to
/// (2000-01-01), so a deterministic run is reproducible without depending
/// on wall-clock precision.
#[cfg(feature = "system-clock")]
fn fixed_date() -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()
}

#[cfg(feature = "system-clock")]
fn now_value(config: &EvalConfig) -> LiteralValue {
    let now = if config.deterministic_mode {
        fixed_date().and_hms_opt(0, 0, 0).unwrap()
    } else {
        chrono::Local::now().naive_local()
    };
    LiteralValue::DateTime(now)
}

#[cfg(not(feature = "system-clock"))]
fn now_value(_config: &EvalConfig) -> LiteralValue {
    LiteralValue::Error(ExcelError::new(ExcelErrorKind::NImpl).with_message("NOW() requires the system-clock feature"))
}

#[cfg(feature = "system-clock")]
fn today_value(config: &EvalConfig) -> LiteralValue {
    let today = if config.deterministic_mode {
        fixed_date()
    } else {
        chrono::Local::now().date_naive()
    };
    LiteralValue::Date(today)
}

#[cfg(not(feature = "system-clock"))]
fn today_value(_config: &EvalConfig) -> LiteralValue {
    LiteralValue::Error(ExcelError::new(ExcelErrorKind::NImpl).with_message("TODAY() requires the system-clock feature"))
}

/// A small xorshift PRNG. Under `deterministic_mode` it runs from a fixed
/// seed so a replayed calculation produces the same values; otherwise it
/// reseeds from the wall clock every call, the way an ordinary volatile
/// `RAND()` must.
fn pseudo_rand(config: &EvalConfig, lo: f64, hi: f64) -> f64 {
    let seed = if config.deterministic_mode {
        0x2545F4914F6CDD1D
    } else {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0x9E3779B9)
    };
    let mut x = seed ^ 0x2545F4914F6CDD1D;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    let unit = (x as f64) / (u64::MAX as f64);
    lo + unit * (hi - lo)
}
