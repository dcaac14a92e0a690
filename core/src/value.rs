//! The dynamically-typed `Value`: a tagged sum of number, boolean, nil, or a
//! reference to a heap object.
//!
//! An implementation may NaN-box this into a single `u64`; here it is a
//! discriminated enum, which is behaviorally identical and keeps the object
//! model exhaustive-match-checked (see `object.rs`).

use std::fmt;

use crate::object::{Obj, ObjKind};

#[derive(Clone, Copy)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Nil,
    Obj(Obj),
}

impl Value {
    /// `nil` and `false` are falsey; everything else, including `0` and the
    /// empty string, is truthy.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<Obj> {
        match self {
            Value::Obj(o) => Some(*o),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::Obj(o) if o.is_string())
    }
}

impl PartialEq for Value {
    /// Primitives compare by contents (NaN is unequal to everything,
    /// including itself). Object references compare by identity; strings
    /// are interned, so content-equal strings are also identity-equal.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Obj(o) => fmt_obj(o, f),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn fmt_function_name(name: &Option<Obj>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match name {
        Some(name) => write!(f, "<fn {}>", name.as_string().unwrap().as_str()),
        None => write!(f, "<script>"),
    }
}

fn fmt_obj(obj: &Obj, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match obj.kind() {
        ObjKind::String(s) => write!(f, "{}", s.as_str()),
        ObjKind::Function(func) => fmt_function_name(&func.name, f),
        ObjKind::Closure(c) => fmt_function_name(&c.function.as_function().unwrap().name, f),
        ObjKind::Native(_) => write!(f, "<native fn>"),
        ObjKind::Class(class) => write!(f, "{}", class.borrow().name.as_string().unwrap().as_str()),
        ObjKind::Instance(inst) => write!(f, "{} instance", inst.borrow().class.kind_name()),
        ObjKind::BoundMethod(bm) => {
            fmt_function_name(&bm.method.as_closure().unwrap().function.as_function().unwrap().name, f)
        }
        ObjKind::Upvalue(_) => write!(f, "upvalue"),
    }
}

/// Mimics C's `%g` with the default precision of 6 significant digits: fixed
/// notation when the decimal exponent is in `[-4, precision)`, scientific
/// notation (`d.ddde±XX`) otherwise, with trailing fractional zeros (and a
/// bare trailing `.`) stripped in both cases.
pub fn format_number(n: f64) -> String {
    const PRECISION: i32 = 6;

    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }

    let neg = n.is_sign_negative();
    let abs = n.abs();

    // `{:.5e}` gives the 6-significant-digit scientific form (correctly
    // rounded and renormalized), from which both the exponent and the
    // fixed-notation digits are derived.
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, abs);
    let (mantissa, exp_str) = sci.split_once('e').expect("LowerExp always emits 'e'");
    let exponent: i32 = exp_str.parse().expect("exponent is always a valid integer");

    let body = if exponent >= -4 && exponent < PRECISION {
        let frac_digits = (PRECISION - 1 - exponent).max(0) as usize;
        strip_trailing_zeros(format!("{:.*}", frac_digits, abs))
    } else {
        let mantissa = strip_trailing_zeros(mantissa.to_string());
        let sign = if exponent < 0 { "-" } else { "+" };
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    };

    if neg {
        format!("-{}", body)
    } else {
        body
    }
}

fn strip_trailing_zeros(mut s: String) -> String {
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_not_equal_to_itself() {
        let nan = Value::Number(f64::NAN);
        assert!(nan != nan);
    }

    #[test]
    fn falsiness() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
    }

    #[test]
    fn number_formatting_drops_trailing_zero() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(1.5), "1.5");
    }
}
