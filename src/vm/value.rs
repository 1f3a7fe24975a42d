use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Upper bound on the element count of one array.
pub const MAX_ARRAY_ELEMENTS: usize = 1 << 24;

/// A fixed-size, row-major, multi-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayData {
    pub dims: Vec<usize>,
    pub elements: Vec<Value>,
}

impl ArrayData {
    /// Element count for `dims`, or None when the product overflows or
    /// exceeds [`MAX_ARRAY_ELEMENTS`].
    pub fn checked_len(dims: &[usize]) -> Option<usize> {
        dims.iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .filter(|&len| len <= MAX_ARRAY_ELEMENTS)
    }

    /// Create an array with every element set to `fill`, or None when the
    /// dimensions are too large.
    pub fn new(dims: Vec<usize>, fill: Value) -> Option<Self> {
        let size = Self::checked_len(&dims)?;
        Some(Self {
            dims,
            elements: vec![fill; size],
        })
    }

    /// Compute the flat offset for a set of indices, or None when any index
    /// is outside its dimension.
    pub fn offset(&self, indices: &[i64]) -> Option<usize> {
        if indices.len() != self.dims.len() {
            return None;
        }
        let mut offset = 0usize;
        for (index, dim) in indices.iter().zip(&self.dims) {
            if *index < 0 || *index as usize >= *dim {
                return None;
            }
            offset = offset * dim + *index as usize;
        }
        Some(offset)
    }
}

/// An insertion-ordered string-keyed map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DictData {
    entries: Vec<(String, Value)>,
}

impl DictData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: String, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A runtime value.
///
/// Scalars are stored inline. Arrays and dicts are shared by reference, so
/// copying a value aliases the same storage. Handles are opaque ids owned by
/// the host or the file table.
#[derive(Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Rc<str>),
    Nil,
    Array(Rc<RefCell<ArrayData>>),
    Dict(Rc<RefCell<DictData>>),
    Handle(u64),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn array(data: ArrayData) -> Self {
        Value::Array(Rc::new(RefCell::new(data)))
    }

    pub fn dict(data: DictData) -> Self {
        Value::Dict(Rc::new(RefCell::new(data)))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(if *b { 1 } else { 0 }),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Nil => false,
            Value::Array(_) | Value::Dict(_) | Value::Handle(_) => true,
        }
    }

    /// Get the type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Nil => "nil",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::Handle(_) => "handle",
        }
    }

    /// Constant-pool identity: same variant and same payload. Floats compare
    /// by bit pattern so `0.0` and `-0.0` stay distinct.
    pub fn same_constant(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            _ => false,
        }
    }

    /// Check if two values are equal.
    pub fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Handle(a), Value::Handle(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Value::eq(self, other)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Float(n) => write!(f, "Float({})", n),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Nil => write!(f, "Nil"),
            Value::Array(a) => write!(f, "Array({:?})", a.borrow().dims),
            Value::Dict(d) => write!(f, "Dict({})", d.borrow().len()),
            Value::Handle(h) => write!(f, "Handle({})", h),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{}.0", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
            Value::Nil => write!(f, "nil"),
            Value::Array(a) => {
                let a = a.borrow();
                let parts: Vec<String> = a.elements.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Dict(d) => {
                let d = d.borrow();
                let parts: Vec<String> = d.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Value::Handle(h) => write!(f, "<handle {}>", h),
        }
    }
}
