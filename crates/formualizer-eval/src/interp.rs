//! C6: the recursive-descent interpreter that turns one formula's token
//! stream into a value at one evaluation position (`spec.md` §4.6).
//!
//! A range reference stays a [`EvalNode::Range`] until something actually
//! consumes it: an aggregate function receives it whole, while a binary
//! operator forces it down to a scalar first (`spec.md` §4.6 "range
//! references resolve to a matrix only when consumed by an aggregate").

use formualizer_common::cellref::AbsCellRange;
use formualizer_common::coord::Coord;
use formualizer_common::error::{ExcelError, ExcelErrorKind};
use formualizer_common::value::LiteralValue;

use formualizer_parse::opcode::{CompareOp, Opcode};
use formualizer_parse::token::{Token, TokenStore};

use crate::builtins;
use crate::config::EvalConfig;
use crate::store::CellStore;

#[derive(Clone, Debug)]
pub enum EvalNode {
    Scalar(LiteralValue),
    Range(AbsCellRange),
}

pub struct EvalContext<'a> {
    pub store: &'a CellStore,
    pub config: &'a EvalConfig,
    pub at: Coord,
}

struct Cursor<'a, 'b> {
    tokens: &'a [Token],
    pos: usize,
    tokens_store: &'a TokenStore,
    ctx: &'a EvalContext<'b>,
}

type EvalResult = Result<EvalNode, ExcelError>;

pub fn evaluate(tokens: &TokenStore, ctx: &EvalContext<'_>) -> LiteralValue {
    let mut cur = Cursor {
        tokens: tokens.tokens(),
        pos: 0,
        tokens_store: tokens,
        ctx,
    };
    let result = match cur.parse_compare() {
        Ok(node) => cur.as_scalar(node),
        Err(e) => Err(e),
    };
    match result {
        Ok(v) => v,
        Err(e) => LiteralValue::Error(e),
    }
}

fn to_numeric(v: &LiteralValue) -> Result<f64, ExcelError> {
    match v {
        LiteralValue::Int(i) => Ok(*i as f64),
        LiteralValue::Number(n) => Ok(*n),
        LiteralValue::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        LiteralValue::Empty => Ok(0.0),
        LiteralValue::Error(e) => Err(e.clone()),
        LiteralValue::Text(_) => Err(ExcelError::new(ExcelErrorKind::Value)),
        other => other
            .as_serial_number()
            .ok_or_else(|| ExcelError::new(ExcelErrorKind::Value)),
    }
}

pub fn to_text(v: &LiteralValue) -> Result<String, ExcelError> {
    match v {
        LiteralValue::Text(s) => Ok(s.clone()),
        LiteralValue::Empty => Ok(String::new()),
        LiteralValue::Error(e) => Err(e.clone()),
        other => Ok(other.to_string()),
    }
}

impl<'a, 'b> Cursor<'a, 'b> {
    fn peek(&self) -> Option<&'a Opcode> {
        self.tokens.get(self.pos).map(|t| &t.opcode)
    }

    fn bump(&mut self) -> Option<&'a Opcode> {
        let op = self.tokens.get(self.pos).map(|t| &t.opcode);
        if op.is_some() {
            self.pos += 1;
        }
        op
    }

    fn expect(&mut self, expected: &Opcode) -> Result<(), ExcelError> {
        match self.bump() {
            Some(op) if op == expected => Ok(()),
            _ => Err(ExcelError::new(ExcelErrorKind::Error).with_message("malformed token stream")),
        }
    }

    fn as_scalar(&mut self, node: EvalNode) -> Result<LiteralValue, ExcelError> {
        match node {
            EvalNode::Scalar(v) => Ok(v),
            EvalNode::Range(r) => {
                if r.is_single_cell() {
                    Ok(self
                        .ctx
                        .store
                        .get_cell_access(r.first_addr())
                        .into())
                } else {
                    Err(ExcelError::new(ExcelErrorKind::Value))
                }
            }
        }
    }

    fn parse_compare(&mut self) -> EvalResult {
        let mut lhs = self.parse_concat()?;
        while let Some(Opcode::Compare(op)) = self.peek() {
            let op = *op;
            self.bump();
            let rhs = self.parse_concat()?;
            let lv = self.as_scalar(lhs)?;
            let rv = self.as_scalar(rhs)?;
            lhs = EvalNode::Scalar(compare(op, &lv, &rv)?);
        }
        Ok(lhs)
    }

    fn parse_concat(&mut self) -> EvalResult {
        let mut lhs = self.parse_add()?;
        while matches!(self.peek(), Some(Opcode::Concat)) {
            self.bump();
            let rhs = self.parse_add()?;
            let lv = self.as_scalar(lhs)?;
            let rv = self.as_scalar(rhs)?;
            let joined = match (to_text(&lv), to_text(&rv)) {
                (Ok(a), Ok(b)) => LiteralValue::Text(a + &b),
                (Err(e), _) | (_, Err(e)) => LiteralValue::Error(e),
            };
            lhs = EvalNode::Scalar(joined);
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> EvalResult {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Opcode::Add) => 1.0,
                Some(Opcode::Sub) => -1.0,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_mul()?;
            let lv = self.as_scalar(lhs)?;
            let rv = self.as_scalar(rhs)?;
            lhs = EvalNode::Scalar(arith(&lv, &rv, |a, b| a + op * b));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> EvalResult {
        let mut lhs = self.parse_unary()?;
        loop {
            let is_div = match self.peek() {
                Some(Opcode::Mul) => false,
                Some(Opcode::Div) => true,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            let lv = self.as_scalar(lhs)?;
            let rv = self.as_scalar(rhs)?;
            lhs = EvalNode::Scalar(if is_div {
                match (to_numeric(&lv), to_numeric(&rv)) {
                    (Ok(_), Ok(b)) if b == 0.0 => {
                        LiteralValue::Error(ExcelError::new(ExcelErrorKind::Div))
                    }
                    (Ok(a), Ok(b)) => LiteralValue::Number(a / b),
                    (Err(e), _) | (_, Err(e)) => LiteralValue::Error(e),
                }
            } else {
                arith(&lv, &rv, |a, b| a * b)
            });
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> EvalResult {
        if matches!(self.peek(), Some(Opcode::Neg)) {
            self.bump();
            let inner = self.parse_unary()?;
            let v = self.as_scalar(inner)?;
            return Ok(EvalNode::Scalar(match to_numeric(&v) {
                Ok(n) => LiteralValue::Number(-n),
                Err(e) => LiteralValue::Error(e),
            }));
        }
        self.parse_pow()
    }

    fn parse_pow(&mut self) -> EvalResult {
        let lhs = self.parse_primary()?;
        if matches!(self.peek(), Some(Opcode::Pow)) {
            self.bump();
            // Right-associative: bind as tightly to the next unary as `^` itself.
            let rhs = self.parse_unary()?;
            let lv = self.as_scalar(lhs)?;
            let rv = self.as_scalar(rhs)?;
            return Ok(EvalNode::Scalar(arith(&lv, &rv, f64::powf)));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> EvalResult {
        match self.bump().cloned() {
            Some(Opcode::NumberLiteral(n)) => Ok(EvalNode::Scalar(LiteralValue::Number(n))),
            Some(Opcode::BooleanLiteral(b)) => Ok(EvalNode::Scalar(LiteralValue::Boolean(b))),
            Some(Opcode::StringLiteral(id)) => Ok(EvalNode::Scalar(LiteralValue::Text(
                self.ctx.store.resolve_string(id).to_string(),
            ))),
            Some(Opcode::SingleRef(r)) => {
                let addr = self.tokens_store.resolve_single_ref(r, self.ctx.at);
                Ok(EvalNode::Range(AbsCellRange::single(addr)))
            }
            Some(Opcode::RangeRef(r)) => {
                let range = self.tokens_store.resolve_range_ref(r, self.ctx.at);
                Ok(EvalNode::Range(range))
            }
            Some(Opcode::LParen) => {
                let inner = self.parse_compare()?;
                self.expect(&Opcode::RParen)?;
                Ok(inner)
            }
            Some(Opcode::FunctionCall { id, arg_count }) => {
                self.expect(&Opcode::LParen)?;
                let mut args = Vec::with_capacity(arg_count as usize);
                for i in 0..arg_count {
                    if i > 0 {
                        self.expect(&Opcode::Comma)?;
                    }
                    args.push(self.parse_compare()?);
                }
                self.expect(&Opcode::RParen)?;
                Ok(EvalNode::Scalar(builtins::call(
                    id,
                    args,
                    self.ctx.store,
                    self.ctx.config,
                )))
            }
            Some(Opcode::Error { message, .. }) => Ok(EvalNode::Scalar(LiteralValue::Error(
                ExcelError::new(ExcelErrorKind::Error)
                    .with_message(self.ctx.store.resolve_string(message).to_string()),
            ))),
            Some(Opcode::NamedExprRef(_)) => {
                // Name resolution is out of scope for this core.
                Ok(EvalNode::Scalar(LiteralValue::Error(ExcelError::new(
                    ExcelErrorKind::Name,
                ))))
            }
            _ => Err(ExcelError::new(ExcelErrorKind::Error).with_message("unexpected token")),
        }
    }
}

fn arith(a: &LiteralValue, b: &LiteralValue, f: impl Fn(f64, f64) -> f64) -> LiteralValue {
    match (to_numeric(a), to_numeric(b)) {
        (Ok(x), Ok(y)) => LiteralValue::Number(f(x, y)),
        (Err(e), _) | (_, Err(e)) => LiteralValue::Error(e),
    }
}

/// Comparisons never error: a `#VALUE!` on either side still yields a
/// boolean, and `NaN` on either side always compares `false`
/// (`spec.md` §6 "comparisons with NaN always yield false").
fn compare(op: CompareOp, a: &LiteralValue, b: &LiteralValue) -> Result<LiteralValue, ExcelError> {
    let result = match (a, b) {
        (LiteralValue::Text(x), LiteralValue::Text(y)) => compare_ord(op, x.cmp(y)),
        (LiteralValue::Boolean(x), LiteralValue::Boolean(y)) => compare_ord(op, x.cmp(y)),
        _ => {
            let (x, y) = match (to_numeric(a), to_numeric(b)) {
                (Ok(x), Ok(y)) => (x, y),
                _ => return Ok(LiteralValue::Boolean(matches!(op, CompareOp::Ne))),
            };
            if x.is_nan() || y.is_nan() {
                matches!(op, CompareOp::Ne)
            } else {
                compare_ord(op, x.partial_cmp(&y).unwrap())
            }
        }
    };
    Ok(LiteralValue::Boolean(result))
}

fn compare_ord(op: CompareOp, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CompareOp::Eq => ord == Equal,
        CompareOp::Ne => ord != Equal,
        CompareOp::Lt => ord == Less,
        CompareOp::Le => ord != Greater,
        CompareOp::Gt => ord == Greater,
        CompareOp::Ge => ord != Less,
    }
}

impl From<crate::store::CellAccess> for LiteralValue {
    fn from(access: crate::store::CellAccess) -> Self {
        use crate::store::CellValueType;
        match access.value_type {
            CellValueType::Empty => LiteralValue::Empty,
            CellValueType::Numeric => LiteralValue::Number(access.numeric),
            CellValueType::Boolean => LiteralValue::Boolean(access.boolean),
            CellValueType::String => LiteralValue::Text(
                access
                    .string_view
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
            ),
            CellValueType::Error => {
                LiteralValue::Error(access.error.unwrap_or(ExcelError::new(ExcelErrorKind::Error)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formualizer_common::cellref::AbsCellAddr;
    use formualizer_common::intern::StringPool;
    use formualizer_parse::opcode::{FunctionId, RefToken, SheetRef};
    use std::sync::Arc;

    fn ctx<'a>(store: &'a CellStore, config: &'a EvalConfig) -> EvalContext<'a> {
        EvalContext {
            store,
            config,
            at: Coord::new(0, 0),
        }
    }

    #[test]
    fn arithmetic_precedence_and_parens() {
        let store = CellStore::new(Arc::new(StringPool::new()));
        let config = EvalConfig::default();
        // 2 + 3 * 4 = 14
        let tokens = TokenStore::new(
            vec![
                Token::new(Opcode::NumberLiteral(2.0)),
                Token::new(Opcode::Add),
                Token::new(Opcode::NumberLiteral(3.0)),
                Token::new(Opcode::Mul),
                Token::new(Opcode::NumberLiteral(4.0)),
            ],
            AbsCellAddr::new(0, 0, 0),
        );
        let out = evaluate(&tokens, &ctx(&store, &config));
        assert_eq!(out, LiteralValue::Number(14.0));
    }

    #[test]
    fn division_by_zero_yields_div_error() {
        let store = CellStore::new(Arc::new(StringPool::new()));
        let config = EvalConfig::default();
        let tokens = TokenStore::new(
            vec![
                Token::new(Opcode::NumberLiteral(1.0)),
                Token::new(Opcode::Div),
                Token::new(Opcode::NumberLiteral(0.0)),
            ],
            AbsCellAddr::new(0, 0, 0),
        );
        let out = evaluate(&tokens, &ctx(&store, &config));
        assert!(matches!(out, LiteralValue::Error(e) if e.kind == ExcelErrorKind::Div));
    }

    #[test]
    fn nan_comparison_is_always_false() {
        // No operator in this engine's builtin set actually produces NaN
        // (division by zero yields #DIV/0! instead), so this exercises
        // `compare` directly rather than through `evaluate`.
        let nan = LiteralValue::Number(f64::NAN);
        let one = LiteralValue::Number(1.0);
        assert_eq!(compare(CompareOp::Eq, &nan, &one).unwrap(), LiteralValue::Boolean(false));
        assert_eq!(compare(CompareOp::Lt, &nan, &one).unwrap(), LiteralValue::Boolean(false));
        assert_eq!(compare(CompareOp::Ne, &nan, &one).unwrap(), LiteralValue::Boolean(true));
    }

    #[test]
    fn empty_cell_coerces_to_zero_in_arithmetic() {
        let store = CellStore::new(Arc::new(StringPool::new()));
        let config = EvalConfig::default();
        let tokens = TokenStore::new(
            vec![
                Token::new(Opcode::SingleRef(RefToken {
                    sheet: SheetRef::Origin,
                    coord: formualizer_common::coord::RelativeCoord::new(5, 5, false, false),
                })),
                Token::new(Opcode::Add),
                Token::new(Opcode::NumberLiteral(1.0)),
            ],
            AbsCellAddr::new(0, 0, 0),
        );
        let out = evaluate(&tokens, &ctx(&store, &config));
        assert_eq!(out, LiteralValue::Number(1.0));
    }

    #[test]
    fn sum_over_a_range_skips_empties() {
        let store = CellStore::new(Arc::new(StringPool::new()));
        store.set_numeric(AbsCellAddr::new(0, 0, 0), 1.0);
        store.set_numeric(AbsCellAddr::new(0, 2, 0), 3.0);
        let config = EvalConfig::default();
        let tokens = TokenStore::new(
            vec![Token::new(Opcode::FunctionCall {
                id: FunctionId::Sum,
                arg_count: 1,
            }), Token::new(Opcode::LParen), Token::new(Opcode::RangeRef(
                formualizer_parse::opcode::RangeRefToken {
                    sheet: SheetRef::Origin,
                    first: formualizer_common::coord::RelativeCoord::new(0, 0, false, false),
                    last: formualizer_common::coord::RelativeCoord::new(2, 0, false, false),
                },
            )), Token::new(Opcode::RParen)],
            AbsCellAddr::new(0, 5, 5),
        );
        let out = evaluate(&tokens, &ctx(&store, &config));
        assert_eq!(out, LiteralValue::Number(4.0));
    }
}
