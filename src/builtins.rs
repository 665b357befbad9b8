use crate::error::EngineError;
use datalog_syntax::{AggOp, CompOp, TypedValue};
use regex::Regex;

fn type_error(name: &str, details: impl Into<String>) -> EngineError {
    EngineError::BuiltinTypeError {
        name: name.to_string(),
        details: details.into(),
    }
}

/// Numeric promotion: int-int stays int, any float promotes both sides to float.
enum Numeric {
    Int(i64),
    Float(f64),
}

fn promote(left: &TypedValue, right: &TypedValue, name: &str) -> Result<(Numeric, Numeric), EngineError> {
    match (left, right) {
        (TypedValue::Int(a), TypedValue::Int(b)) => Ok((Numeric::Int(*a), Numeric::Int(*b))),
        (a, b) if a.is_numeric() && b.is_numeric() => Ok((
            Numeric::Float(a.as_f64().unwrap()),
            Numeric::Float(b.as_f64().unwrap()),
        )),
        _ => Err(type_error(
            name,
            format!("expected numeric operands, got {} and {}", left.kind_name(), right.kind_name()),
        )),
    }
}

/// Evaluates a comparison. Comparisons that type-check but are false are a normal Datalog
/// "literal doesn't hold" result (`Ok(false)`), distinct from a type mismatch which surfaces
/// as `BuiltinTypeError` to the evaluator.
pub fn compare(op: CompOp, left: &TypedValue, right: &TypedValue) -> Result<bool, EngineError> {
    if op == CompOp::Eq {
        return Ok(left == right);
    }
    if op == CompOp::Ne {
        return Ok(left != right);
    }

    if left.kind_name() == right.kind_name() && !left.is_numeric() {
        // Same-kind non-numeric ordering (e.g. string/atom/bool/bytes comparison).
        let ordering = left.cmp(right);
        return Ok(match op {
            CompOp::Lt => ordering.is_lt(),
            CompOp::Le => ordering.is_le(),
            CompOp::Gt => ordering.is_gt(),
            CompOp::Ge => ordering.is_ge(),
            CompOp::Eq | CompOp::Ne => unreachable!(),
        });
    }

    let (a, b) = promote(left, right, "compare")?;
    let ordering = match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => x.cmp(&y),
        (Numeric::Float(x), Numeric::Float(y)) => {
            x.partial_cmp(&y).ok_or_else(|| type_error("compare", "NaN is not orderable"))?
        }
        _ => unreachable!("promote always returns same-kind pairs"),
    };

    Ok(match op {
        CompOp::Lt => ordering.is_lt(),
        CompOp::Le => ordering.is_le(),
        CompOp::Gt => ordering.is_gt(),
        CompOp::Ge => ordering.is_gt() || ordering.is_eq(),
        CompOp::Eq | CompOp::Ne => unreachable!(),
    })
}

pub fn plus(a: &TypedValue, b: &TypedValue) -> Result<TypedValue, EngineError> {
    match promote(a, b, "plus")? {
        (Numeric::Int(x), Numeric::Int(y)) => Ok(TypedValue::Int(x + y)),
        (Numeric::Float(x), Numeric::Float(y)) => Ok(TypedValue::Float(x + y)),
        _ => unreachable!(),
    }
}

pub fn minus(a: &TypedValue, b: &TypedValue) -> Result<TypedValue, EngineError> {
    match promote(a, b, "minus")? {
        (Numeric::Int(x), Numeric::Int(y)) => Ok(TypedValue::Int(x - y)),
        (Numeric::Float(x), Numeric::Float(y)) => Ok(TypedValue::Float(x - y)),
        _ => unreachable!(),
    }
}

pub fn mult(a: &TypedValue, b: &TypedValue) -> Result<TypedValue, EngineError> {
    match promote(a, b, "mult")? {
        (Numeric::Int(x), Numeric::Int(y)) => Ok(TypedValue::Int(x * y)),
        (Numeric::Float(x), Numeric::Float(y)) => Ok(TypedValue::Float(x * y)),
        _ => unreachable!(),
    }
}

pub fn div(a: &TypedValue, b: &TypedValue) -> Result<TypedValue, EngineError> {
    match promote(a, b, "div")? {
        (Numeric::Int(x), Numeric::Int(y)) => {
            if y == 0 {
                return Err(type_error("div", "division by zero"));
            }
            Ok(TypedValue::Int(x / y))
        }
        (Numeric::Float(x), Numeric::Float(y)) => {
            if y == 0.0 {
                return Err(type_error("div", "division by zero"));
            }
            Ok(TypedValue::Float(x / y))
        }
        _ => unreachable!(),
    }
}

pub fn modulo(a: &TypedValue, b: &TypedValue) -> Result<TypedValue, EngineError> {
    match (a, b) {
        (TypedValue::Int(x), TypedValue::Int(y)) => {
            if *y == 0 {
                return Err(type_error("mod", "division by zero"));
            }
            Ok(TypedValue::Int(x % y))
        }
        _ => Err(type_error("mod", "mod is only defined for integers")),
    }
}

pub fn negate(a: &TypedValue) -> Result<TypedValue, EngineError> {
    match a {
        TypedValue::Int(x) => Ok(TypedValue::Int(-x)),
        TypedValue::Float(x) => Ok(TypedValue::Float(-x)),
        _ => Err(type_error("negate", format!("expected a numeric operand, got {}", a.kind_name()))),
    }
}

pub fn concat(a: &TypedValue, b: &TypedValue) -> Result<TypedValue, EngineError> {
    match (a, b) {
        (TypedValue::Str(x), TypedValue::Str(y)) => Ok(TypedValue::Str(format!("{x}{y}"))),
        _ => Err(type_error("concat", "expected two strings")),
    }
}

pub fn contains(haystack: &TypedValue, needle: &TypedValue) -> Result<TypedValue, EngineError> {
    match (haystack, needle) {
        (TypedValue::Str(h), TypedValue::Str(n)) => Ok(TypedValue::Bool(h.contains(n.as_str()))),
        _ => Err(type_error("contains", "expected two strings")),
    }
}

pub fn matches(haystack: &TypedValue, pattern: &TypedValue) -> Result<TypedValue, EngineError> {
    match (haystack, pattern) {
        (TypedValue::Str(h), TypedValue::Str(p)) => {
            let re = Regex::new(p).map_err(|e| type_error("matches", e.to_string()))?;
            Ok(TypedValue::Bool(re.is_match(h)))
        }
        _ => Err(type_error("matches", "expected two strings")),
    }
}

/// Applies one `AggOp` to a group of bound values. An empty group never produces a row --
/// callers are expected to skip emitting a head atom entirely when `values` is empty (per the
/// Open Question resolution: no implicit identity row).
pub fn aggregate(op: AggOp, values: &[TypedValue]) -> Result<TypedValue, EngineError> {
    match op {
        AggOp::Count => Ok(TypedValue::Int(values.len() as i64)),
        AggOp::Sum => {
            let mut all_int = true;
            let mut total = 0.0_f64;
            for value in values {
                let n = value
                    .as_f64()
                    .ok_or_else(|| type_error("sum", format!("expected numeric, got {}", value.kind_name())))?;
                total += n;
                all_int &= matches!(value, TypedValue::Int(_));
            }
            if all_int {
                Ok(TypedValue::Int(total as i64))
            } else {
                Ok(TypedValue::Float(total))
            }
        }
        AggOp::Min => values
            .iter()
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .cloned()
            .ok_or_else(|| type_error("min", "empty group")),
        AggOp::Max => values
            .iter()
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .cloned()
            .ok_or_else(|| type_error("max", "empty group")),
        // Renders the group as a bracketed, comma-joined list of each value's `Debug` form,
        // e.g. `[1, 2, "x"]`. This is an intentional, human-inspectable representation -- there
        // is no dedicated list `TypedValue` kind (see DESIGN.md), and a `Str` a caller can read
        // directly is preferable to packing opaque bytes. Not meant to round-trip back into
        // individual `TypedValue`s.
        AggOp::Collect => {
            let rendered: Vec<String> = values.iter().map(|v| format!("{v:?}")).collect();
            Ok(TypedValue::Str(format!("[{}]", rendered.join(", "))))
        }
    }
}
