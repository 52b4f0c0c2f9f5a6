use std::cmp::Ordering;

use pc_types::{Payload, ScalarValue, Status};
use serde::{Deserialize, Serialize};

use crate::ExprError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Lt,
    LtEq,
    Gt,
    GtEq,
    Eq,
    Ne,
    BeginsWith,
    EndsWith,
    Contains,
    NotContains,
    In,
    NotIn,
    InAny,
    InAll,
    IsNan,
    IsNotNan,
    IsValid,
    IsNotValid,
    IsEmpty,
    IsNotEmpty,
    IsTrue,
    IsFalse,
    Between,
    After,
    Before,
    /// Per-element comparisons against a list cell.
    ElementEq,
    ElementNe,
    ElementGt,
    ElementGtEq,
    ElementLt,
    ElementLtEq,
    /// Matches nothing.
    IgnoreAll,
}

impl FilterOp {
    /// Number of operands required, `None` for one or more.
    #[must_use]
    pub fn operand_count(self) -> Option<usize> {
        match self {
            Self::IsNan
            | Self::IsNotNan
            | Self::IsValid
            | Self::IsNotValid
            | Self::IsEmpty
            | Self::IsNotEmpty
            | Self::IsTrue
            | Self::IsFalse
            | Self::IgnoreAll => Some(0),
            Self::Between => Some(2),
            Self::In | Self::NotIn | Self::InAny | Self::InAll => None,
            _ => Some(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combiner {
    #[default]
    And,
    Or,
}

impl Combiner {
    /// Folds term results; an empty set of terms matches.
    pub fn combine(self, mut results: impl Iterator<Item = bool>) -> bool {
        match self {
            Self::And => results.all(|r| r),
            Self::Or => {
                let mut any_term = false;
                for r in results {
                    if r {
                        return true;
                    }
                    any_term = true;
                }
                !any_term
            }
        }
    }
}

/// One `(column, op, operands)` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterTerm {
    pub column: String,
    pub op: FilterOp,
    #[serde(default)]
    pub operands: Vec<ScalarValue>,
}

impl FilterTerm {
    #[must_use]
    pub fn new(column: impl Into<String>, op: FilterOp, operands: Vec<ScalarValue>) -> Self {
        Self {
            column: column.into(),
            op,
            operands,
        }
    }

    /// Operand shape check; a malformed term is skipped by callers rather
    /// than failing the update.
    pub fn validate(&self) -> Result<(), ExprError> {
        let invalid = |reason: String| ExprError::InvalidOperand {
            op: format!("{:?}", self.op),
            reason,
        };
        match self.op.operand_count() {
            Some(n) if self.operands.len() < n => Err(invalid(format!(
                "expected {n} operand(s), got {}",
                self.operands.len()
            ))),
            None if self.operands.is_empty() => Err(invalid("expected at least one operand".into())),
            _ => Ok(()),
        }
    }

    fn first(&self) -> Option<&ScalarValue> {
        self.operands.first()
    }

    fn compare_first(&self, cell: &ScalarValue) -> Option<Ordering> {
        self.first().and_then(|operand| cell.compare(operand))
    }

    /// Evaluates the predicate against one cell.
    #[must_use]
    pub fn matches(&self, cell: &ScalarValue) -> bool {
        match self.op {
            FilterOp::IsValid => return cell.is_valid(),
            FilterOp::IsNotValid => return !cell.is_valid(),
            FilterOp::IsEmpty => return is_empty(cell),
            FilterOp::IsNotEmpty => return !is_empty(cell),
            FilterOp::IgnoreAll => return false,
            _ => {}
        }
        if !cell.is_valid() {
            return false;
        }
        match self.op {
            FilterOp::Lt | FilterOp::Before => self.compare_first(cell) == Some(Ordering::Less),
            FilterOp::LtEq => matches!(
                self.compare_first(cell),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt | FilterOp::After => self.compare_first(cell) == Some(Ordering::Greater),
            FilterOp::GtEq => matches!(
                self.compare_first(cell),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Eq => self.compare_first(cell) == Some(Ordering::Equal),
            FilterOp::Ne => self.compare_first(cell) != Some(Ordering::Equal),
            FilterOp::BeginsWith => self.first().is_some_and(|n| cell.begins_with(n)),
            FilterOp::EndsWith => self.first().is_some_and(|n| cell.ends_with(n)),
            FilterOp::Contains => self.first().is_some_and(|n| cell.contains(n)),
            FilterOp::NotContains => self.first().is_some_and(|n| cell.not_contains(n)),
            FilterOp::In => self.member(cell),
            FilterOp::NotIn => !self.member(cell),
            FilterOp::InAny => match cell.as_list() {
                Some(items) => items.iter().any(|item| self.operands.contains(item)),
                None => self.operands.contains(cell),
            },
            FilterOp::InAll => match cell.as_list() {
                Some(items) => self.operands.iter().all(|op| items.contains(op)),
                None => self.operands.iter().all(|op| op == cell),
            },
            FilterOp::IsNan => cell.is_nan(),
            FilterOp::IsNotNan => !cell.is_nan(),
            FilterOp::IsTrue => cell.as_bool() == Some(true),
            FilterOp::IsFalse => cell.as_bool() == Some(false),
            FilterOp::Between => self.between(cell),
            FilterOp::ElementEq => self.any_element(cell, |o| o == Ordering::Equal),
            FilterOp::ElementNe => self.any_element(cell, |o| o != Ordering::Equal),
            FilterOp::ElementGt => self.any_element(cell, |o| o == Ordering::Greater),
            FilterOp::ElementGtEq => self.any_element(cell, |o| o != Ordering::Less),
            FilterOp::ElementLt => self.any_element(cell, |o| o == Ordering::Less),
            FilterOp::ElementLtEq => self.any_element(cell, |o| o != Ordering::Greater),
            FilterOp::IsValid
            | FilterOp::IsNotValid
            | FilterOp::IsEmpty
            | FilterOp::IsNotEmpty
            | FilterOp::IgnoreAll => false,
        }
    }

    /// List cells match when any element is a member; an empty list matches
    /// an empty-string operand.
    fn member(&self, cell: &ScalarValue) -> bool {
        match cell.as_list() {
            Some([]) => self
                .operands
                .iter()
                .any(|op| op.as_str().is_some_and(str::is_empty)),
            Some(items) => items.iter().any(|item| self.operands.contains(item)),
            None => self.operands.contains(cell),
        }
    }

    /// Half-open range between the two operands in either order.
    fn between(&self, cell: &ScalarValue) -> bool {
        let (Some(first), Some(second)) = (self.operands.first(), self.operands.get(1)) else {
            return false;
        };
        let (low, high) = if first.lt(second) {
            (first, second)
        } else {
            (second, first)
        };
        cell.ge(low) && cell.lt(high)
    }

    fn any_element(&self, cell: &ScalarValue, accept: impl Fn(Ordering) -> bool) -> bool {
        let Some(operand) = self.first() else {
            return false;
        };
        let items = cell
            .as_list()
            .unwrap_or(std::slice::from_ref(cell));
        items
            .iter()
            .filter_map(|item| item.compare(operand))
            .any(accept)
    }
}

fn is_empty(cell: &ScalarValue) -> bool {
    match cell.status() {
        Status::Empty => true,
        Status::Valid => match cell.payload() {
            Payload::Str(s) => s.is_empty(),
            Payload::List(items) => items.is_empty(),
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use pc_types::{DType, ScalarValue};

    use super::{Combiner, FilterOp, FilterTerm};

    fn term(op: FilterOp, operands: Vec<ScalarValue>) -> FilterTerm {
        FilterTerm::new("c", op, operands)
    }

    #[test]
    fn comparisons_reject_invalid_cells() {
        let gt = term(FilterOp::Gt, vec![ScalarValue::int64(10)]);
        assert!(gt.matches(&ScalarValue::float64(10.5)));
        assert!(!gt.matches(&ScalarValue::int64(10)));
        assert!(!gt.matches(&ScalarValue::null(DType::Int64)));
        assert!(!term(FilterOp::Ne, vec![ScalarValue::int64(1)]).matches(&ScalarValue::null(DType::Int64)));
    }

    #[test]
    fn between_accepts_reversed_bounds() {
        let forward = term(FilterOp::Between, vec![ScalarValue::int64(1), ScalarValue::int64(5)]);
        let reversed = term(FilterOp::Between, vec![ScalarValue::int64(5), ScalarValue::int64(1)]);
        for probe in [0, 1, 4, 5] {
            let cell = ScalarValue::int64(probe);
            assert_eq!(forward.matches(&cell), reversed.matches(&cell));
        }
        assert!(forward.matches(&ScalarValue::int64(1)));
        assert!(!forward.matches(&ScalarValue::int64(5)));
    }

    #[test]
    fn membership_over_lists() {
        let list = ScalarValue::list(
            DType::ListStr,
            vec![ScalarValue::string("red"), ScalarValue::string("blue")],
        )
        .expect("list");
        let empty = ScalarValue::list(DType::ListStr, Vec::new()).expect("empty list");
        let in_term = term(FilterOp::In, vec![ScalarValue::string("blue")]);
        assert!(in_term.matches(&list));
        assert!(!term(FilterOp::NotIn, vec![ScalarValue::string("blue")]).matches(&list));
        assert!(term(FilterOp::In, vec![ScalarValue::string("")]).matches(&empty));
        assert!(!term(FilterOp::InAll, vec![ScalarValue::string("red"), ScalarValue::string("green")]).matches(&list));
        assert!(term(FilterOp::IsEmpty, Vec::new()).matches(&empty));
    }

    #[test]
    fn validate_flags_missing_operands() {
        assert!(term(FilterOp::Between, vec![ScalarValue::int64(1)]).validate().is_err());
        assert!(term(FilterOp::In, Vec::new()).validate().is_err());
        assert!(term(FilterOp::IsNan, Vec::new()).validate().is_ok());
    }

    #[test]
    fn term_deserializes_from_host_json() {
        let json = r#"{"column":"region","op":"begins_with","operands":[{"dtype":"str","status":"valid","payload":{"kind":"str","value":"No"}}]}"#;
        let parsed: FilterTerm = serde_json::from_str(json).expect("deserialize");
        assert_eq!(parsed.op, FilterOp::BeginsWith);
        assert!(parsed.matches(&ScalarValue::string("north")));
    }

    #[test]
    fn combiners() {
        assert!(Combiner::And.combine([true, true].into_iter()));
        assert!(!Combiner::And.combine([true, false].into_iter()));
        assert!(Combiner::Or.combine([false, true].into_iter()));
        assert!(!Combiner::Or.combine([false, false].into_iter()));
        assert!(Combiner::Or.combine(std::iter::empty()));
    }
}
