use std::cmp::Ordering;

use quiver_types::Value;

/// Comparison operator of a pushed-down column predicate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// A single `column <op> constant` predicate.
#[derive(Clone, Debug)]
pub struct ColumnPredicate {
    pub op: CompareOp,
    pub value: Value,
}

impl ColumnPredicate {
    pub fn new(op: CompareOp, value: Value) -> Self {
        Self { op, value }
    }

    /// Nulls never satisfy a comparison; values of mismatched kinds neither.
    pub fn eval(&self, value: &Value) -> bool {
        let Some(ordering) = compare_values(value, &self.value) else {
            return false;
        };
        match self.op {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::GtEq => ordering != Ordering::Less,
        }
    }
}

/// A conjunction of predicates over one column, evaluated before a scan
/// materialises the row.
#[derive(Clone, Debug, Default)]
pub struct ColumnPredicateSet {
    predicates: Vec<ColumnPredicate>,
}

impl ColumnPredicateSet {
    pub fn new(predicates: Vec<ColumnPredicate>) -> Self {
        Self { predicates }
    }

    pub fn single(op: CompareOp, value: Value) -> Self {
        Self {
            predicates: vec![ColumnPredicate::new(op, value)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn eval(&self, value: &Value) -> bool {
        self.predicates.iter().all(|p| p.eval(value))
    }
}

/// Total order within one value kind; `None` across kinds or against nulls.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Int8(x), Value::Int8(y)) => Some(x.cmp(y)),
        (Value::Int16(x), Value::Int16(y)) => Some(x.cmp(y)),
        (Value::Int32(x), Value::Int32(y)) => Some(x.cmp(y)),
        (Value::Int64(x), Value::Int64(y)) => Some(x.cmp(y)),
        (Value::Int128(x), Value::Int128(y)) => Some(x.cmp(y)),
        (Value::UInt8(x), Value::UInt8(y)) => Some(x.cmp(y)),
        (Value::UInt16(x), Value::UInt16(y)) => Some(x.cmp(y)),
        (Value::UInt32(x), Value::UInt32(y)) => Some(x.cmp(y)),
        (Value::UInt64(x), Value::UInt64(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Double(x), Value::Double(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        (Value::Interval(x), Value::Interval(y)) => Some(x.cmp(y)),
        (Value::InternalId(x), Value::InternalId(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conjunction() {
        let set = ColumnPredicateSet::new(vec![
            ColumnPredicate::new(CompareOp::GtEq, Value::Int64(10)),
            ColumnPredicate::new(CompareOp::Lt, Value::Int64(20)),
        ]);
        assert!(set.eval(&Value::Int64(10)));
        assert!(set.eval(&Value::Int64(19)));
        assert!(!set.eval(&Value::Int64(20)));
        assert!(!set.eval(&Value::Int64(9)));
    }

    #[test]
    fn null_and_mismatched_kinds_fail() {
        let set = ColumnPredicateSet::single(CompareOp::Eq, Value::Int64(1));
        assert!(!set.eval(&Value::Null));
        assert!(!set.eval(&Value::String("1".into())));
    }
}
