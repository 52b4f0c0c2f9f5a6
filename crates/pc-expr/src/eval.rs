use std::cmp::Ordering;

use pc_types::{DType, ScalarValue};

use crate::{BinaryOp, CompareOp, Expr, ExprError};

/// Name and accepted argument count of a formula function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionSpec {
    pub name: &'static str,
    pub min_args: usize,
    /// `None` for variadic functions.
    pub max_args: Option<usize>,
}

impl FunctionSpec {
    const fn fixed(name: &'static str, n: usize) -> Self {
        Self {
            name,
            min_args: n,
            max_args: Some(n),
        }
    }

    const fn variadic(name: &'static str, min_args: usize) -> Self {
        Self {
            name,
            min_args,
            max_args: None,
        }
    }

    pub(crate) fn check_arity(&self, found: usize) -> Result<(), ExprError> {
        let ok = found >= self.min_args && self.max_args.is_none_or(|max| found <= max);
        if ok {
            return Ok(());
        }
        let expected = match self.max_args {
            Some(max) if max == self.min_args => max.to_string(),
            Some(max) => format!("{}..={max}", self.min_args),
            None => format!("at least {}", self.min_args),
        };
        Err(ExprError::Arity {
            function: self.name.to_owned(),
            expected,
            found,
        })
    }
}

pub const FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec::fixed("abs", 1),
    FunctionSpec::fixed("sqrt", 1),
    FunctionSpec::fixed("pow", 2),
    FunctionSpec::fixed("exp", 1),
    FunctionSpec::fixed("ln", 1),
    FunctionSpec::fixed("log10", 1),
    FunctionSpec::fixed("floor", 1),
    FunctionSpec::fixed("ceil", 1),
    FunctionSpec {
        name: "round",
        min_args: 1,
        max_args: Some(2),
    },
    FunctionSpec::variadic("min", 1),
    FunctionSpec::variadic("max", 1),
    FunctionSpec::variadic("coalesce", 1),
    FunctionSpec::fixed("if", 3),
    FunctionSpec::variadic("concat", 1),
    FunctionSpec::fixed("upper", 1),
    FunctionSpec::fixed("lower", 1),
    FunctionSpec::fixed("len", 1),
    FunctionSpec::fixed("is_valid", 1),
];

pub(crate) fn lookup(name: &str) -> Option<&'static FunctionSpec> {
    FUNCTIONS.iter().find(|spec| spec.name == name)
}

pub(crate) fn evaluate<F>(expr: &Expr, resolve: &F) -> Result<ScalarValue, ExprError>
where
    F: Fn(&str) -> Option<ScalarValue>,
{
    match expr {
        Expr::Column { name } => resolve(name).ok_or_else(|| ExprError::UnknownColumn(name.clone())),
        Expr::Literal { value } => Ok(value.clone()),
        Expr::Neg { expr } => {
            let value = evaluate(expr, resolve)?;
            Ok(if value.is_numeric() {
                value.negate()
            } else {
                ScalarValue::null(DType::Float64)
            })
        }
        Expr::Binary { op, left, right } => {
            let left = evaluate(left, resolve)?;
            let right = evaluate(right, resolve)?;
            Ok(arithmetic(*op, &left, &right))
        }
        Expr::Compare { op, left, right } => {
            let left = evaluate(left, resolve)?;
            let right = evaluate(right, resolve)?;
            Ok(compare(*op, &left, &right))
        }
        Expr::And { left, right } => {
            let left = evaluate(left, resolve)?;
            if !left.truthy() {
                return Ok(ScalarValue::boolean(false));
            }
            Ok(ScalarValue::boolean(evaluate(right, resolve)?.truthy()))
        }
        Expr::Or { left, right } => {
            let left = evaluate(left, resolve)?;
            if left.truthy() {
                return Ok(ScalarValue::boolean(true));
            }
            Ok(ScalarValue::boolean(evaluate(right, resolve)?.truthy()))
        }
        Expr::Not { expr } => {
            let value = evaluate(expr, resolve)?;
            Ok(if value.is_valid() {
                ScalarValue::boolean(!value.truthy())
            } else {
                ScalarValue::null(DType::Bool)
            })
        }
        Expr::Call { function, args } => call(function, args, resolve),
    }
}

fn arithmetic(op: BinaryOp, left: &ScalarValue, right: &ScalarValue) -> ScalarValue {
    let null = ScalarValue::null(DType::Float64);
    if !left.is_valid() || !right.is_valid() {
        return null;
    }
    if op == BinaryOp::Add && left.is_str() && right.is_str() {
        return ScalarValue::string(format!("{left}{right}"));
    }
    if !left.is_numeric() || !right.is_numeric() {
        return null;
    }
    if left.dtype().is_integer() && right.dtype().is_integer() {
        if let (Ok(a), Ok(b)) = (left.to_i64(), right.to_i64()) {
            let exact = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Rem => a.checked_rem(b),
                BinaryOp::Div | BinaryOp::Pow => None,
            };
            if let Some(v) = exact {
                return ScalarValue::int64(v);
            }
        }
    }
    let (Ok(a), Ok(b)) = (left.to_f64(), right.to_f64()) else {
        return null;
    };
    let out = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return null,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        BinaryOp::Pow => a.powf(b),
    };
    ScalarValue::float64(out)
}

fn compare(op: CompareOp, left: &ScalarValue, right: &ScalarValue) -> ScalarValue {
    if !left.is_valid() || !right.is_valid() {
        return ScalarValue::null(DType::Bool);
    }
    let ordering = left.compare(right);
    let out = match op {
        CompareOp::Eq => ordering == Some(Ordering::Equal),
        CompareOp::Ne => ordering != Some(Ordering::Equal),
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    };
    ScalarValue::boolean(out)
}

fn unary_float(value: &ScalarValue, f: fn(f64) -> f64) -> ScalarValue {
    match value.to_f64() {
        Ok(v) if value.is_numeric() => {
            let out = f(v);
            if out.is_finite() {
                ScalarValue::float64(out)
            } else {
                ScalarValue::null(DType::Float64)
            }
        }
        _ => ScalarValue::null(DType::Float64),
    }
}

fn call<F>(function: &str, args: &[Expr], resolve: &F) -> Result<ScalarValue, ExprError>
where
    F: Fn(&str) -> Option<ScalarValue>,
{
    let spec = lookup(function).ok_or_else(|| {
        ExprError::InvariantViolation(format!("formula calls undefined function {function}"))
    })?;
    spec.check_arity(args.len())?;

    // `if` and `coalesce` evaluate lazily.
    match function {
        "if" => {
            let branch = if evaluate(&args[0], resolve)?.truthy() {
                &args[1]
            } else {
                &args[2]
            };
            return evaluate(branch, resolve);
        }
        "coalesce" => {
            let mut last = ScalarValue::none();
            for arg in args {
                last = evaluate(arg, resolve)?;
                if last.is_valid() {
                    break;
                }
            }
            return Ok(last);
        }
        _ => {}
    }

    let values = args
        .iter()
        .map(|arg| evaluate(arg, resolve))
        .collect::<Result<Vec<_>, _>>()?;
    let first = &values[0];
    let out = match function {
        "abs" => {
            if first.is_numeric() {
                first.abs()
            } else {
                ScalarValue::null(DType::Float64)
            }
        }
        "sqrt" => unary_float(first, f64::sqrt),
        "exp" => unary_float(first, f64::exp),
        "ln" => unary_float(first, f64::ln),
        "log10" => unary_float(first, f64::log10),
        "floor" => unary_float(first, f64::floor),
        "ceil" => unary_float(first, f64::ceil),
        "pow" => arithmetic(BinaryOp::Pow, first, &values[1]),
        "round" => {
            let digits = values.get(1).and_then(|d| d.to_i64().ok()).unwrap_or(0);
            let scale = 10f64.powi(digits.clamp(-15, 15) as i32);
            match first.to_f64() {
                Ok(v) if first.is_numeric() => ScalarValue::float64((v * scale).round() / scale),
                _ => ScalarValue::null(DType::Float64),
            }
        }
        "min" | "max" => {
            let want = if function == "min" {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            values
                .iter()
                .filter(|v| v.is_valid())
                .fold(None::<&ScalarValue>, |best, v| match best {
                    Some(b) if v.compare(b) != Some(want) => Some(b),
                    _ => Some(v),
                })
                .cloned()
                .unwrap_or_else(|| ScalarValue::null(first.dtype()))
        }
        "concat" => ScalarValue::string(
            values
                .iter()
                .filter(|v| v.is_valid())
                .map(ToString::to_string)
                .collect::<String>(),
        ),
        "upper" => match first.as_str() {
            Some(s) => ScalarValue::string(s.to_uppercase()),
            None => ScalarValue::null(DType::Str),
        },
        "lower" => match first.as_str() {
            Some(s) => ScalarValue::string(s.to_lowercase()),
            None => ScalarValue::null(DType::Str),
        },
        "len" => match (first.as_str(), first.as_list()) {
            (Some(s), _) => ScalarValue::int64(s.chars().count() as i64),
            (_, Some(items)) => ScalarValue::int64(items.len() as i64),
            _ => ScalarValue::null(DType::Int64),
        },
        "is_valid" => ScalarValue::boolean(first.is_valid()),
        other => {
            return Err(ExprError::InvariantViolation(format!(
                "function {other} is registered but has no evaluator"
            )));
        }
    };
    Ok(out)
}
