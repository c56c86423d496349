use crate::value::{value_cmp, value_eq};
use crate::{builtins, Row, Value};
use bigdecimal::{BigDecimal, FromPrimitive, Zero};
use sparql::{unescape, Expr, LogicalPlan, Term, BinaryOp};
use std::cmp::Ordering;
use time::OffsetDateTime;

/// Per-query evaluation context: the plan (for span resolution) and the
/// query-stable NOW() instant.
pub struct EvalContext<'a> {
    pub plan: &'a LogicalPlan,
    pub now: OffsetDateTime,
}

impl<'a> EvalContext<'a> {
    pub fn new(plan: &'a LogicalPlan) -> Self {
        Self {
            plan,
            now: OffsetDateTime::now_utc(),
        }
    }

    /// Decode a constant term of the plan into a value. Variables
    /// resolve against the row; unbound variables yield `Unbound`.
    pub fn term_value(&self, row: &Row, term: &Term) -> Value {
        match term {
            Term::Var(name) => {
                let name = self.plan.text(*name);
                match row.get_by_name(name) {
                    Some(binding) => row.value_of(binding),
                    None => Value::Unbound,
                }
            }
            Term::Iri(iri) => Value::Iri(self.plan.text(*iri).to_string()),
            Term::Blank(label) => Value::Blank(self.plan.text(*label).to_string()),
            Term::Literal {
                lexical,
                datatype,
                lang,
            } => {
                let body = unescape(self.plan.text(*lexical));
                if let Some(tag) = lang {
                    return Value::LangString {
                        value: body,
                        lang: self.plan.text(*tag).to_string(),
                    };
                }
                match datatype {
                    Some(dt) => Value::typed_literal(body, self.plan.text(*dt)),
                    None => Value::String(body),
                }
            }
        }
    }

    /// The canonical atom-store text of a constant term, used to probe
    /// the atom store for pattern constants.
    pub fn term_atom_text(&self, term: &Term) -> Option<String> {
        match term {
            Term::Var(_) => None,
            other => self.term_value(&Row::new(), other).to_term_text(),
        }
    }
}

/// Evaluate an expression against a row, with SPARQL three-valued
/// semantics: type failures produce `Value::Error`, which a filter
/// treats as false and COALESCE skips.
pub fn eval(ctx: &EvalContext<'_>, row: &Row, expr: &Expr) -> Value {
    match expr {
        Expr::Term(term) => ctx.term_value(row, term),
        Expr::Not(inner) => match eval(ctx, row, inner).ebv() {
            Value::Boolean(b) => Value::Boolean(!b),
            _ => Value::Error,
        },
        Expr::Neg(inner) => match eval(ctx, row, inner) {
            Value::Integer(n) => Value::Integer(-n),
            Value::Decimal(d) => Value::Decimal(-d),
            Value::Double(d) => Value::Double(-d),
            _ => Value::Error,
        },
        Expr::Binary { op, lhs, rhs } => binary(ctx, row, *op, lhs, rhs),
        Expr::In {
            needle,
            haystack,
            negated,
        } => {
            let needle = eval(ctx, row, needle);
            let mut saw_error = false;
            for item in haystack {
                let item = eval(ctx, row, item);
                match value_eq(&needle, &item) {
                    Some(true) => return Value::Boolean(!negated),
                    Some(false) => {}
                    None => saw_error = true,
                }
            }
            if saw_error {
                Value::Error
            } else {
                Value::Boolean(*negated)
            }
        }
        Expr::Call { func, args } => builtins::call(ctx, row, *func, args),
        // Aggregates are computed by the executor's grouping stage; a
        // bare aggregate in row context has no value.
        Expr::Aggregate { .. } => Value::Error,
    }
}

/// Evaluate as a filter predicate: the effective boolean value, with
/// errors excluding the row.
pub fn filter_passes(ctx: &EvalContext<'_>, row: &Row, expr: &Expr) -> bool {
    matches!(eval(ctx, row, expr).ebv(), Value::Boolean(true))
}

fn binary(ctx: &EvalContext<'_>, row: &Row, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Value {
    match op {
        BinaryOp::Or => {
            let l = eval(ctx, row, lhs).ebv();
            let r = eval(ctx, row, rhs).ebv();
            match (l, r) {
                (Value::Boolean(true), _) | (_, Value::Boolean(true)) => Value::Boolean(true),
                (Value::Boolean(false), Value::Boolean(false)) => Value::Boolean(false),
                _ => Value::Error,
            }
        }
        BinaryOp::And => {
            let l = eval(ctx, row, lhs).ebv();
            let r = eval(ctx, row, rhs).ebv();
            match (l, r) {
                (Value::Boolean(false), _) | (_, Value::Boolean(false)) => Value::Boolean(false),
                (Value::Boolean(true), Value::Boolean(true)) => Value::Boolean(true),
                _ => Value::Error,
            }
        }
        _ => apply_binary(op, eval(ctx, row, lhs), eval(ctx, row, rhs)),
    }
}

/// Apply a non-logical binary operator to already-evaluated operands.
/// (`&&`/`||` need lazy three-valued handling and stay in `binary`;
/// here they degrade to their effective boolean values.)
pub fn apply_binary(op: BinaryOp, l: Value, r: Value) -> Value {
    match op {
        BinaryOp::Or => match (l.ebv(), r.ebv()) {
            (Value::Boolean(true), _) | (_, Value::Boolean(true)) => Value::Boolean(true),
            (Value::Boolean(false), Value::Boolean(false)) => Value::Boolean(false),
            _ => Value::Error,
        },
        BinaryOp::And => match (l.ebv(), r.ebv()) {
            (Value::Boolean(false), _) | (_, Value::Boolean(false)) => Value::Boolean(false),
            (Value::Boolean(true), Value::Boolean(true)) => Value::Boolean(true),
            _ => Value::Error,
        },
        BinaryOp::Eq | BinaryOp::Ne => match value_eq(&l, &r) {
            Some(eq) => Value::Boolean(if op == BinaryOp::Eq { eq } else { !eq }),
            None => Value::Error,
        },
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => match value_cmp(&l, &r) {
            Some(ord) => Value::Boolean(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                BinaryOp::Ge => ord != Ordering::Less,
                _ => unreachable!(),
            }),
            None => Value::Error,
        },
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => arithmetic(op, l, r),
    }
}

/// Numeric arithmetic with type promotion integer → decimal → double.
/// Integer division produces a decimal, per the operator mapping.
pub fn arithmetic(op: BinaryOp, l: Value, r: Value) -> Value {
    if !l.is_numeric() || !r.is_numeric() {
        return Value::Error;
    }

    // Double if either side is; decimal if either side is (or for any
    // division); integer otherwise.
    if matches!(l, Value::Double(_)) || matches!(r, Value::Double(_)) {
        let (Some(x), Some(y)) = (l.as_double(), r.as_double()) else {
            return Value::Error;
        };
        return Value::Double(match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            _ => return Value::Error,
        });
    }

    if let (Value::Integer(x), Value::Integer(y)) = (&l, &r) {
        match op {
            BinaryOp::Add => {
                if let Some(n) = x.checked_add(*y) {
                    return Value::Integer(n);
                }
            }
            BinaryOp::Sub => {
                if let Some(n) = x.checked_sub(*y) {
                    return Value::Integer(n);
                }
            }
            BinaryOp::Mul => {
                if let Some(n) = x.checked_mul(*y) {
                    return Value::Integer(n);
                }
            }
            BinaryOp::Div => {}
            _ => return Value::Error,
        }
        // Integer division, and overflow, promote to decimal.
    }

    let (Some(x), Some(y)) = (l.as_decimal(), r.as_decimal()) else {
        return Value::Error;
    };
    match op {
        BinaryOp::Add => Value::Decimal(x + y),
        BinaryOp::Sub => Value::Decimal(x - y),
        BinaryOp::Mul => Value::Decimal(x * y),
        BinaryOp::Div => {
            if y.is_zero() {
                Value::Error
            } else {
                Value::Decimal(x / y)
            }
        }
        _ => Value::Error,
    }
}

/// Fold an aggregate over a set of per-row values.
pub fn aggregate(
    func: sparql::AggFunc,
    distinct: bool,
    mut values: Vec<Value>,
    separator: &str,
) -> Value {
    use sparql::AggFunc;

    if distinct {
        let mut seen: Vec<Value> = Vec::new();
        values.retain(|v| {
            if seen.contains(v) {
                false
            } else {
                seen.push(v.clone());
                true
            }
        });
    }

    match func {
        AggFunc::Count => Value::Integer(
            values
                .iter()
                .filter(|v| !matches!(v, Value::Unbound | Value::Error))
                .count() as i64,
        ),
        AggFunc::Sum => {
            let mut acc = Value::Integer(0);
            for v in values {
                acc = arithmetic(BinaryOp::Add, acc, v);
            }
            acc
        }
        AggFunc::Avg => {
            let count = values.len();
            if count == 0 {
                return Value::Integer(0);
            }
            let mut acc = Value::Integer(0);
            for v in values {
                acc = arithmetic(BinaryOp::Add, acc, v);
            }
            arithmetic(
                BinaryOp::Div,
                acc,
                Value::Decimal(BigDecimal::from_usize(count).unwrap_or_else(BigDecimal::zero)),
            )
        }
        AggFunc::Min => values
            .into_iter()
            .filter(|v| !matches!(v, Value::Unbound | Value::Error))
            .min_by(|a, b| crate::value::order_cmp(a, b))
            .unwrap_or(Value::Unbound),
        AggFunc::Max => values
            .into_iter()
            .filter(|v| !matches!(v, Value::Unbound | Value::Error))
            .max_by(|a, b| crate::value::order_cmp(a, b))
            .unwrap_or(Value::Unbound),
        AggFunc::Sample => values
            .into_iter()
            .find(|v| !matches!(v, Value::Unbound | Value::Error))
            .unwrap_or(Value::Unbound),
        AggFunc::GroupConcat => {
            let parts: Vec<String> = values
                .iter()
                .filter(|v| !matches!(v, Value::Unbound | Value::Error))
                .map(Value::lexical_form)
                .collect();
            Value::String(parts.join(separator))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sparql::parse;

    fn eval_filter(filter_body: &str, bindings: &[(&str, &str)]) -> Value {
        let src = format!("ASK {{ ?s ?p ?o FILTER({filter_body}) }}");
        let plan = parse(&src).unwrap();
        let sparql::Query::Ask(ask) = &plan.query else {
            panic!("expected ASK");
        };
        let sparql::Pattern::Filter(expr) = &ask.patterns[1] else {
            panic!("expected filter");
        };
        let mut row = Row::new();
        for (name, term) in bindings {
            row.bind(name, term, None);
        }
        let ctx = EvalContext::new(&plan);
        eval(&ctx, &row, expr)
    }

    const XSD_INT: &str = "^^<http://www.w3.org/2001/XMLSchema#integer>";

    #[test]
    fn test_comparison_and_promotion() {
        assert_eq!(
            eval_filter("?age > 40", &[("age", &format!("\"42\"{XSD_INT}"))]),
            Value::Boolean(true)
        );
        assert_eq!(
            eval_filter("?age > 40.5", &[("age", &format!("\"40\"{XSD_INT}"))]),
            Value::Boolean(false)
        );
    }

    #[test]
    fn test_three_valued_logic() {
        // Unbound comparison errors, || recovers when the other side is
        // true, && does not mask a false.
        assert_eq!(eval_filter("?missing > 1", &[]), Value::Error);
        assert_eq!(eval_filter("?missing > 1 || 1 < 2", &[]), Value::Boolean(true));
        assert_eq!(eval_filter("?missing > 1 && 1 < 2", &[]), Value::Error);
        assert_eq!(eval_filter("?missing > 1 && 1 > 2", &[]), Value::Boolean(false));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_filter("2 + 3 = 5", &[]), Value::Boolean(true));
        assert_eq!(eval_filter("7 / 2 = 3.5", &[]), Value::Boolean(true));
        assert_eq!(eval_filter("2 * 3.5 = 7", &[]), Value::Boolean(true));
        assert_eq!(eval_filter("1 / 0 = 1", &[]), Value::Error);
    }

    #[test]
    fn test_in_membership() {
        assert_eq!(eval_filter("2 IN (1, 2, 3)", &[]), Value::Boolean(true));
        assert_eq!(eval_filter("5 NOT IN (1, 2, 3)", &[]), Value::Boolean(true));
        assert_eq!(eval_filter("5 IN ()", &[]), Value::Boolean(false));
    }

    #[test]
    fn test_aggregate_folds() {
        use sparql::AggFunc;
        let nums = vec![Value::Integer(1), Value::Integer(2), Value::Integer(2)];
        assert_eq!(aggregate(AggFunc::Count, false, nums.clone(), ""), Value::Integer(3));
        assert_eq!(aggregate(AggFunc::Count, true, nums.clone(), ""), Value::Integer(2));
        assert_eq!(aggregate(AggFunc::Sum, false, nums.clone(), ""), Value::Integer(5));
        assert_eq!(aggregate(AggFunc::Max, false, nums.clone(), ""), Value::Integer(2));
        let avg = aggregate(AggFunc::Avg, false, nums, "");
        assert_eq!(
            crate::value::value_eq(&avg, &Value::Decimal("1.6666666666666666".parse().unwrap()))
                .is_some(),
            true
        );
    }
}
