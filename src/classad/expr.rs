//! Expression AST and three-valued evaluation
//!
//! ClassAd logic is three-valued: any operation touching an undefined
//! attribute yields `Undefined` unless short-circuiting resolves it first
//! (`false && undefined` is `false`, `true || undefined` is `true`).

/// Attribute scope prefix of a reference (`my.cpus`, `target.cpus`, `cpus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrScope {
    My,
    Target,
    Bare,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

/// Binary operators in increasing precedence groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    Str(String),
    Undefined,
    Attr(AttrScope, String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Evaluation result.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Value {
    /// Numeric view; booleans coerce to 0/1, strings and undefined do not.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(true) => Some(1.0),
            Value::Bool(false) => Some(0.0),
            _ => None,
        }
    }

    /// Strict truth: only `true` and non-zero numbers count.
    pub fn is_true(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            _ => false,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }
}

/// Source of attribute values for one side of a match.
pub trait AttributeSource {
    fn attribute(&self, name: &str) -> Option<Value>;
}

/// Evaluate `expr` with `my` as the primary scope and `target` as the
/// opposite side of the match. Bare attribute references resolve against
/// `my` first, then `target`.
pub fn evaluate(
    expr: &Expr,
    my: &dyn AttributeSource,
    target: Option<&dyn AttributeSource>,
) -> Value {
    match expr {
        Expr::Number(n) => Value::Number(*n),
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Str(s) => Value::Str(s.clone()),
        Expr::Undefined => Value::Undefined,
        Expr::Attr(scope, name) => {
            let resolved = match scope {
                AttrScope::My => my.attribute(name),
                AttrScope::Target => target.and_then(|t| t.attribute(name)),
                AttrScope::Bare => my
                    .attribute(name)
                    .or_else(|| target.and_then(|t| t.attribute(name))),
            };
            resolved.unwrap_or(Value::Undefined)
        }
        Expr::Unary(op, inner) => {
            let value = evaluate(inner, my, target);
            match op {
                UnOp::Not => match value {
                    Value::Undefined => Value::Undefined,
                    other => Value::Bool(!other.is_true()),
                },
                UnOp::Neg => match value.as_number() {
                    Some(n) => Value::Number(-n),
                    None => Value::Undefined,
                },
            }
        }
        Expr::Binary(op, lhs, rhs) => match op {
            BinOp::And => {
                let left = evaluate(lhs, my, target);
                if !left.is_undefined() && !left.is_true() {
                    return Value::Bool(false);
                }
                let right = evaluate(rhs, my, target);
                match (left.is_undefined(), right.is_undefined()) {
                    (false, false) => Value::Bool(right.is_true()),
                    _ => {
                        if !right.is_undefined() && !right.is_true() {
                            Value::Bool(false)
                        } else {
                            Value::Undefined
                        }
                    }
                }
            }
            BinOp::Or => {
                let left = evaluate(lhs, my, target);
                if left.is_true() {
                    return Value::Bool(true);
                }
                let right = evaluate(rhs, my, target);
                if right.is_true() {
                    return Value::Bool(true);
                }
                if left.is_undefined() || right.is_undefined() {
                    Value::Undefined
                } else {
                    Value::Bool(false)
                }
            }
            BinOp::Eq | BinOp::Ne => {
                let left = evaluate(lhs, my, target);
                let right = evaluate(rhs, my, target);
                let equal = match (&left, &right) {
                    (Value::Undefined, _) | (_, Value::Undefined) => {
                        return Value::Undefined
                    }
                    (Value::Str(a), Value::Str(b)) => a.eq_ignore_ascii_case(b),
                    _ => match (left.as_number(), right.as_number()) {
                        (Some(a), Some(b)) => a == b,
                        _ => return Value::Undefined,
                    },
                };
                Value::Bool(if *op == BinOp::Eq { equal } else { !equal })
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let left = evaluate(lhs, my, target);
                let right = evaluate(rhs, my, target);
                match (left.as_number(), right.as_number()) {
                    (Some(a), Some(b)) => Value::Bool(match op {
                        BinOp::Lt => a < b,
                        BinOp::Le => a <= b,
                        BinOp::Gt => a > b,
                        _ => a >= b,
                    }),
                    _ => Value::Undefined,
                }
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                let left = evaluate(lhs, my, target);
                let right = evaluate(rhs, my, target);
                match (left.as_number(), right.as_number()) {
                    (Some(a), Some(b)) => match op {
                        BinOp::Add => Value::Number(a + b),
                        BinOp::Sub => Value::Number(a - b),
                        BinOp::Mul => Value::Number(a * b),
                        _ => {
                            if b == 0.0 {
                                Value::Undefined
                            } else {
                                Value::Number(a / b)
                            }
                        }
                    },
                    _ => Value::Undefined,
                }
            }
        },
    }
}

/// Round `value` up to the next multiple of `quantum` (HTCondor `quantize`).
pub fn quantize(value: f64, quantum: f64) -> f64 {
    if quantum <= 0.0 {
        return value;
    }
    (value / quantum).ceil() * quantum
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct MapSource(BTreeMap<String, Value>);

    impl AttributeSource for MapSource {
        fn attribute(&self, name: &str) -> Option<Value> {
            self.0.get(name).cloned()
        }
    }

    fn source(pairs: &[(&str, f64)]) -> MapSource {
        MapSource(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), Value::Number(*v)))
                .collect(),
        )
    }

    #[test]
    fn test_scoped_lookup() {
        let my = source(&[("requestcpus", 2.0)]);
        let target = source(&[("cpus", 4.0)]);
        let expr = Expr::Binary(
            BinOp::Le,
            Box::new(Expr::Attr(AttrScope::My, "requestcpus".into())),
            Box::new(Expr::Attr(AttrScope::Target, "cpus".into())),
        );
        assert!(evaluate(&expr, &my, Some(&target as &dyn AttributeSource)).is_true());
    }

    #[test]
    fn test_undefined_propagates_through_comparison() {
        let my = source(&[]);
        let expr = Expr::Binary(
            BinOp::Le,
            Box::new(Expr::Attr(AttrScope::My, "missing".into())),
            Box::new(Expr::Number(1.0)),
        );
        assert!(evaluate(&expr, &my, None).is_undefined());
    }

    #[test]
    fn test_false_and_undefined_is_false() {
        let my = source(&[]);
        let expr = Expr::Binary(
            BinOp::And,
            Box::new(Expr::Bool(false)),
            Box::new(Expr::Attr(AttrScope::My, "missing".into())),
        );
        assert_eq!(evaluate(&expr, &my, None), Value::Bool(false));
    }

    #[test]
    fn test_true_or_undefined_is_true() {
        let my = source(&[]);
        let expr = Expr::Binary(
            BinOp::Or,
            Box::new(Expr::Bool(true)),
            Box::new(Expr::Attr(AttrScope::My, "missing".into())),
        );
        assert_eq!(evaluate(&expr, &my, None), Value::Bool(true));
    }

    #[test]
    fn test_quantize_rounds_up() {
        assert_eq!(quantize(3.0, 8.0), 8.0);
        assert_eq!(quantize(8.0, 8.0), 8.0);
        assert_eq!(quantize(9.0, 8.0), 16.0);
        assert_eq!(quantize(5.0, 0.0), 5.0);
    }

    proptest::proptest! {
        #[test]
        fn prop_quantize_covers_value(
            value in 0.0..1e12f64,
            quantum in 1.0..1e9f64,
        ) {
            let quantized = quantize(value, quantum);
            // covers the value and overshoots by less than one quantum,
            // up to floating point noise
            proptest::prop_assert!(quantized + quantum * 1e-9 >= value);
            proptest::prop_assert!(quantized < value + quantum * (1.0 + 1e-6));
        }
    }
}
