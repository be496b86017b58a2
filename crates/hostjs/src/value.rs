//! Host-side values and their conversion to and from guest values
//!
//! Scalars, strings and booleans convert deterministically in both
//! directions; whole numbers come back as `Int` up to 2^53. Arrays and plain
//! objects are copied structurally, with limits on depth and total size.
//! Anything without a host representation (functions, symbols, reference
//! cycles) is a type mismatch.

use rquickjs::{Array, Ctx, FromJs, IntoJs, Object, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Nesting limit when copying guest structures.
pub const MAX_MARSHAL_DEPTH: usize = 64;

/// Limit on the number of values copied out of one guest structure.
pub const MAX_MARSHAL_NODES: usize = 100_000;

/// A value owned by the host, independent of any runtime instance.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<HostValue>),
    Object(BTreeMap<String, HostValue>),
}

impl HostValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; integral floats qualify since the guest has one number type.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            HostValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Int(i) => Some(*i as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Short type label used in mismatch messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) | HostValue::Float(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Array(_) => "array",
            HostValue::Object(_) => "object",
        }
    }

    /// Like `FromJs`, but never fails: unrepresentable parts become `Undefined`.
    /// A structure too deep or too large to copy still yields `Undefined`.
    pub(crate) fn from_guest_lossy(value: Value<'_>) -> Self {
        Marshal::new(true).copy(value).unwrap_or_default()
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => write!(f, "undefined"),
            HostValue::Null => write!(f, "null"),
            HostValue::Bool(b) => write!(f, "{b}"),
            HostValue::Int(i) => write!(f, "{i}"),
            HostValue::Float(x) => write!(f, "{x}"),
            HostValue::String(s) => write!(f, "{s}"),
            other => write!(f, "{}", serde_json::Value::from(other.clone())),
        }
    }
}

/// Static name of a guest value's type, for diagnostics.
pub(crate) fn guest_type_name(value: &Value<'_>) -> &'static str {
    if value.is_undefined() {
        "undefined"
    } else if value.is_null() {
        "null"
    } else if value.is_bool() {
        "boolean"
    } else if value.is_number() {
        "number"
    } else if value.is_string() {
        "string"
    } else if value.is_symbol() {
        "symbol"
    } else if value.is_function() {
        "function"
    } else if value.is_array() {
        "array"
    } else if value.is_object() {
        "object"
    } else {
        "unknown"
    }
}

/// Largest whole number the guest's number type holds exactly (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Walks a guest value graph, copying it into a [`HostValue`].
///
/// Containers on the current path are tracked by identity so a reference
/// cycle is caught at its first repeat. Shared subobjects are copied once
/// per path, so the total number of copied values is capped as well.
struct Marshal<'js> {
    lossy: bool,
    path: Vec<Value<'js>>,
    remaining: usize,
}

impl<'js> Marshal<'js> {
    fn new(lossy: bool) -> Self {
        Self {
            lossy,
            path: Vec::new(),
            remaining: MAX_MARSHAL_NODES,
        }
    }

    fn copy(&mut self, value: Value<'js>) -> rquickjs::Result<HostValue> {
        if self.remaining == 0 {
            return Err(rquickjs::Error::new_from_js_message(
                guest_type_name(&value),
                "HostValue",
                "structure too large",
            ));
        }
        self.remaining -= 1;

        if value.is_undefined() {
            return Ok(HostValue::Undefined);
        }
        if value.is_null() {
            return Ok(HostValue::Null);
        }
        if let Some(b) = value.as_bool() {
            return Ok(HostValue::Bool(b));
        }
        if let Some(i) = value.as_int() {
            return Ok(HostValue::Int(i as i64));
        }
        if let Some(f) = value.as_float() {
            return Ok(number(f));
        }
        if let Some(s) = value.as_string() {
            return Ok(HostValue::String(s.to_string()?));
        }
        if value.is_function() || value.is_symbol() {
            return self.mismatch(&value, None);
        }
        if !value.is_object() {
            return self.mismatch(&value, None);
        }

        if self.path.contains(&value) {
            return self.mismatch(&value, Some("reference cycle"));
        }
        if self.path.len() >= MAX_MARSHAL_DEPTH {
            return Err(rquickjs::Error::new_from_js_message(
                guest_type_name(&value),
                "HostValue",
                "nesting too deep",
            ));
        }

        self.path.push(value.clone());
        let copied = self.copy_container(&value);
        self.path.pop();
        copied
    }

    fn copy_container(&mut self, value: &Value<'js>) -> rquickjs::Result<HostValue> {
        if let Some(array) = value.as_array() {
            let mut items = Vec::with_capacity(array.len());
            for item in array.iter::<Value>() {
                items.push(self.copy(item?)?);
            }
            return Ok(HostValue::Array(items));
        }

        let mut map = BTreeMap::new();
        if let Some(object) = value.as_object() {
            for prop in object.props::<String, Value>() {
                let (key, item) = prop?;
                if item.is_function() && self.lossy {
                    continue;
                }
                map.insert(key, self.copy(item)?);
            }
        }
        Ok(HostValue::Object(map))
    }

    fn mismatch(&self, value: &Value<'js>, reason: Option<&str>) -> rquickjs::Result<HostValue> {
        match (self.lossy, reason) {
            (true, _) => Ok(HostValue::Undefined),
            (false, Some(reason)) => Err(rquickjs::Error::new_from_js_message(
                guest_type_name(value),
                "HostValue",
                reason,
            )),
            (false, None) => Err(rquickjs::Error::new_from_js(guest_type_name(value), "HostValue")),
        }
    }
}

/// Whole numbers within the exact range read as `Int`, whatever the engine's
/// internal representation.
fn number(f: f64) -> HostValue {
    let whole = f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER;
    if whole && !(f == 0.0 && f.is_sign_negative()) {
        HostValue::Int(f as i64)
    } else {
        HostValue::Float(f)
    }
}

impl<'js> FromJs<'js> for HostValue {
    fn from_js(_ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Self> {
        Marshal::new(false).copy(value)
    }
}

impl<'js> IntoJs<'js> for HostValue {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        Ok(match self {
            HostValue::Undefined => Value::new_undefined(ctx.clone()),
            HostValue::Null => Value::new_null(ctx.clone()),
            HostValue::Bool(b) => Value::new_bool(ctx.clone(), b),
            HostValue::Int(i) => match i32::try_from(i) {
                Ok(small) => Value::new_int(ctx.clone(), small),
                Err(_) => Value::new_float(ctx.clone(), i as f64),
            },
            HostValue::Float(f) => Value::new_float(ctx.clone(), f),
            HostValue::String(s) => s.into_js(ctx)?,
            HostValue::Array(items) => {
                let array = Array::new(ctx.clone())?;
                for (index, item) in items.into_iter().enumerate() {
                    array.set(index, item)?;
                }
                array.into_value()
            }
            HostValue::Object(map) => {
                let object = Object::new(ctx.clone())?;
                for (key, item) in map {
                    object.set(key, item)?;
                }
                object.into_value()
            }
        })
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        HostValue::Int(value as i64)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        HostValue::Int(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(values: Vec<T>) -> Self {
        HostValue::Array(values.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => HostValue::Int(i),
                None => HostValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => HostValue::String(s),
            serde_json::Value::Array(items) => {
                HostValue::Array(items.into_iter().map(HostValue::from).collect())
            }
            serde_json::Value::Object(map) => HostValue::Object(
                map.into_iter().map(|(k, v)| (k, HostValue::from(v))).collect(),
            ),
        }
    }
}

/// JSON has no `undefined`; it maps to `null`, as does a non-finite float.
impl From<HostValue> for serde_json::Value {
    fn from(value: HostValue) -> Self {
        match value {
            HostValue::Undefined | HostValue::Null => serde_json::Value::Null,
            HostValue::Bool(b) => serde_json::Value::Bool(b),
            HostValue::Int(i) => serde_json::Value::from(i),
            HostValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            HostValue::String(s) => serde_json::Value::String(s),
            HostValue::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            HostValue::Object(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    fn with_ctx<R>(f: impl for<'js> FnOnce(Ctx<'js>) -> R) -> R {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(f)
    }

    #[test]
    fn test_scalars_from_guest() {
        with_ctx(|ctx| {
            let int: HostValue = ctx.eval("1 + 1").unwrap();
            assert_eq!(int, HostValue::Int(2));
            let text: HostValue = ctx.eval("'a' + 'b'").unwrap();
            assert_eq!(text, HostValue::from("ab"));
            let flag: HostValue = ctx.eval("3 > 2").unwrap();
            assert_eq!(flag, HostValue::Bool(true));
            let half: HostValue = ctx.eval("1 / 2").unwrap();
            assert_eq!(half, HostValue::Float(0.5));
            let nothing: HostValue = ctx.eval("undefined").unwrap();
            assert!(nothing.is_undefined());
        });
    }

    #[test]
    fn test_structures_from_guest() {
        with_ctx(|ctx| {
            let value: HostValue = ctx
                .eval("({ list: [1, 'two', null], nested: { ok: true } })")
                .unwrap();
            let expected = HostValue::from(json!({
                "list": [1, "two", null],
                "nested": { "ok": true }
            }));
            assert_eq!(value, expected);
        });
    }

    #[test]
    fn test_function_is_type_mismatch() {
        with_ctx(|ctx| {
            let result: rquickjs::Result<HostValue> = ctx.eval("(function () {})");
            assert!(matches!(result, Err(rquickjs::Error::FromJs { from: "function", .. })));
        });
    }

    #[test]
    fn test_cycle_is_rejected() {
        with_ctx(|ctx| {
            let result: rquickjs::Result<HostValue> = ctx.eval("const a = {}; a.self = a; a");
            assert!(matches!(result, Err(rquickjs::Error::FromJs { .. })));
        });
    }

    #[test]
    fn test_into_guest_and_back() {
        with_ctx(|ctx| {
            let host = HostValue::from(json!({ "n": 7, "big": 5_000_000_000i64, "s": "x" }));
            let guest = host.clone().into_js(&ctx).unwrap();
            ctx.globals().set("input", guest).unwrap();
            let sum: i64 = ctx.eval("input.n + 1").unwrap();
            assert_eq!(sum, 8);
            let back: HostValue = ctx.eval("input").unwrap();
            let HostValue::Object(fields) = back else {
                panic!("expected object");
            };
            assert_eq!(fields["n"], HostValue::Int(7));
            assert_eq!(fields["big"].as_i64(), Some(5_000_000_000));
            assert_eq!(fields["s"].as_str(), Some("x"));
        });
    }

    #[test]
    fn test_shared_subtrees_are_capped() {
        with_ctx(|ctx| {
            let started = std::time::Instant::now();
            let result: rquickjs::Result<HostValue> =
                ctx.eval("let a = [1]; for (let i = 0; i < 40; i++) a = [a, a]; a");
            assert!(matches!(result, Err(rquickjs::Error::FromJs { .. })));
            assert!(started.elapsed() < std::time::Duration::from_secs(5));
        });
    }

    #[test]
    fn test_shared_subtree_within_budget_is_copied_per_path() {
        with_ctx(|ctx| {
            let value: HostValue = ctx.eval("const leaf = { v: 1 }; [leaf, leaf]").unwrap();
            let expected = HostValue::from(json!([{ "v": 1 }, { "v": 1 }]));
            assert_eq!(value, expected);
        });
    }

    #[test]
    fn test_lossy_copy_drops_functions_and_cycles() {
        with_ctx(|ctx| {
            let value: Value = ctx
                .eval("const o = { n: 1, f() {}, list: [() => 2, 3] }; o.self = o; o")
                .unwrap();
            let HostValue::Object(mut fields) = HostValue::from_guest_lossy(value) else {
                panic!("expected object");
            };
            assert_eq!(fields.remove("self"), Some(HostValue::Undefined));
            let HostValue::Array(list) = &fields["list"] else {
                panic!("expected array");
            };
            assert_eq!(list[0], HostValue::Undefined);
            assert_eq!(fields["n"], HostValue::Int(1));
            assert!(!fields.contains_key("f"));
            assert_eq!(list[1], HostValue::Int(3));
        });
    }

    #[test]
    fn test_whole_numbers_read_as_int() {
        with_ctx(|ctx| {
            let big: HostValue = ctx.eval("2 ** 31").unwrap();
            assert_eq!(big, HostValue::Int(2_147_483_648));
            let safe: HostValue = ctx.eval("Number.MAX_SAFE_INTEGER").unwrap();
            assert_eq!(safe, HostValue::Int(9_007_199_254_740_991));
            let huge: HostValue = ctx.eval("2 ** 60").unwrap();
            assert!(matches!(huge, HostValue::Float(_)));
            let negative_zero: HostValue = ctx.eval("-0").unwrap();
            assert!(matches!(negative_zero, HostValue::Float(_)));
            let fraction: HostValue = ctx.eval("2.5").unwrap();
            assert_eq!(fraction, HostValue::Float(2.5));
        });
    }

    #[test]
    fn test_integral_float_reads_as_integer() {
        assert_eq!(HostValue::Float(16.0).as_i64(), Some(16));
        assert_eq!(HostValue::Float(16.5).as_i64(), None);
        assert_eq!(HostValue::from("x").as_i64(), None);
    }

    #[test]
    fn test_json_undefined_becomes_null() {
        let json: serde_json::Value = HostValue::Array(vec![HostValue::Undefined]).into();
        assert_eq!(json, json!([null]));
    }
}
