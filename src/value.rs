//! Parameter values bound into entity, block, source, and template scopes.
//!
//! [`Value`] is the tagged union every scope stores. Two variants carry the
//! engine's late-binding semantics: [`Value::Ref`] holds a shared [`ValueCell`]
//! that is dereferenced at lookup time (so mutations through the cell stay
//! visible), and [`Value::Transform`] holds a closure that is applied to the
//! current binding at assign time and never stored.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// Insertion-ordered mapping used for container values and parameter bags.
pub type ValueMap = IndexMap<String, Value>;

/// A value bindable in any scope.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Ordered sequence, indexable by integer path segments.
    Seq(Vec<Value>),
    /// Keyed mapping, indexable by name path segments.
    Map(ValueMap),
    /// Reference to an external storage cell; dereferenced lazily at lookup.
    Ref(ValueCell),
    /// Applied to the current binding at assign time; never stored.
    Transform(Rc<dyn Fn(Value) -> Value>),
}

/// Shared storage cell backing `bind` semantics.
///
/// Cloning the cell clones the handle, not the value; all clones observe
/// mutations made through any of them.
#[derive(Clone, Default)]
pub struct ValueCell(Rc<RefCell<Value>>);

impl ValueCell {
    pub fn new(value: Value) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    /// Current value stored in the cell.
    pub fn get(&self) -> Value {
        self.0.borrow().clone()
    }

    /// Replaces the stored value.
    pub fn set(&self, value: Value) {
        *self.0.borrow_mut() = value;
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ValueCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueCell({:?})", self.0.borrow())
    }
}

impl Value {
    /// Follows `Ref` cells until a concrete value is reached.
    pub fn deref(&self) -> Value {
        let mut current = self.clone();
        while let Value::Ref(cell) = current {
            current = cell.get();
        }
        current
    }

    /// True for scalars and strings, which render directly into output.
    pub fn is_stringable(&self) -> bool {
        matches!(
            self,
            Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
        )
    }

    /// Converts this value to its output string form.
    ///
    /// Containers, references, and transforms stringify to the empty string;
    /// variable alternatives reject them via [`Value::is_stringable`] first.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            _ => String::new(),
        }
    }

    /// Evaluates this value as a boolean.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Seq(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Ref(cell) => cell.get().is_truthy(),
            Value::Transform(_) => true,
        }
    }

    /// Resolves one dotted path segment on this value.
    ///
    /// Maps index by key, sequences by parsed integer; anything else (and any
    /// miss) yields `Null`.
    pub fn index(&self, segment: &str) -> Value {
        match self.deref() {
            Value::Map(map) => map.get(segment).cloned().unwrap_or(Value::Null),
            Value::Seq(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Resolves a full dotted path (e.g. `["user", "name"]`).
    pub fn resolve_path(&self, path: &[String]) -> Value {
        let mut current = self.deref();
        for segment in path {
            current = current.index(segment);
            if matches!(current, Value::Null) {
                return Value::Null;
            }
        }
        current
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Seq(items) => f.debug_tuple("Seq").field(items).finish(),
            Value::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Value::Ref(cell) => write!(f, "Ref({:?})", cell.get()),
            Value::Transform(_) => write!(f, "Transform(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null | Value::Transform(_) => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
            Value::Ref(cell) => cell.get().serialize(serializer),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Seq(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Seq(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}
