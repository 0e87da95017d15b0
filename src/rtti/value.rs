use std::cell::{Ref, RefCell, RefMut};
use std::fmt::{self, Debug, Formatter};
use std::rc::Rc;
use std::sync::Arc;

use itertools::Itertools;
use rustc_hash::FxHashMap;

use crate::errors::{RttiResult, TypeViolation};
use crate::types::{Name, Primitive, Type, CALL};

/// Host implementation of a function or method. Receives `this` (undefined
/// for plain function calls) and the already coerced arguments.
pub type NativeFn = Arc<dyn Fn(&Value, &[Value]) -> RttiResult<Value> + Send + Sync>;

pub fn native<F>(f: F) -> NativeFn
where
    F: Fn(&Value, &[Value]) -> RttiResult<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Backing constructor of an instance type. Instance method implementations
/// live here, and the parent chain answers native instance-of checks.
pub struct Prototype {
    pub name: Name,
    pub methods: FxHashMap<Name, NativeFn>,
    pub parent: Option<Arc<Prototype>>,
}

impl Prototype {
    pub fn new(name: &str) -> Prototype {
        Prototype {
            name: name.into(),
            methods: FxHashMap::default(),
            parent: None,
        }
    }

    pub fn with_method(mut self, name: &str, f: NativeFn) -> Prototype {
        self.methods.insert(name.into(), f);
        self
    }

    pub fn extending(mut self, parent: Arc<Prototype>) -> Prototype {
        self.parent = Some(parent);
        self
    }

    pub fn find_method(&self, name: &str) -> Option<NativeFn> {
        match self.methods.get(name) {
            Some(f) => Some(f.clone()),
            None => self.parent.as_ref().and_then(|p| p.find_method(name)),
        }
    }
}

impl Debug for Prototype {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Prototype({}; {})", self.name, self.methods.keys().sorted().join(", "))
    }
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Object(ObjRef),
}

/// Shared handle to a heap object; cloning aliases it.
#[derive(Clone)]
pub struct ObjRef(Rc<RefCell<Object>>);

pub struct Object {
    /// The `__rtti__` back-reference. Absent means untagged, read as `any`.
    pub tag: Option<Type>,
    pub proto: Option<Arc<Prototype>>,
    pub storage: Storage,
}

/// How far past the end of an array a write may land.
pub const MAX_ARRAY_GAP: usize = 1 << 16;

pub enum Storage {
    Record(FxHashMap<Name, Value>),
    /// Arrays and tuples.
    Array(Vec<Value>),
    Map(FxHashMap<String, Value>),
    Function(NativeFn),
}

impl ObjRef {
    pub fn new(storage: Storage, tag: Option<Type>, proto: Option<Arc<Prototype>>) -> ObjRef {
        ObjRef(Rc::new(RefCell::new(Object { tag, proto, storage })))
    }

    pub fn borrow(&self) -> Ref<'_, Object> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Object> {
        self.0.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &ObjRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A property key after JS-style normalization: integral non-negative numbers
/// and their canonical strings index, everything else names.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Index(usize),
    Name(Name),
}

impl Key {
    pub fn from_value(v: &Value) -> Key {
        match v {
            Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n <= u32::MAX as f64 => {
                Key::Index(*n as usize)
            }
            Value::Str(s) => Key::from_name(s),
            other => Key::Name(other.to_js_string().into()),
        }
    }

    pub fn from_name(s: &str) -> Key {
        match s.parse::<usize>() {
            Ok(i) if i.to_string() == s => Key::Index(i),
            _ => Key::Name(s.into()),
        }
    }

    /// The member name this key is looked up under in a field table.
    pub fn name(&self) -> Name {
        match self {
            Key::Index(i) => i.to_string().into(),
            Key::Name(n) => n.clone(),
        }
    }
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(s.into())
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_object(&self) -> Option<&ObjRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// The value's runtime tag: fixed for primitives, the back-reference for
    /// objects, `None` for untagged objects and nullish values.
    pub fn tag(&self) -> Option<Type> {
        match self {
            Value::Undefined | Value::Null => None,
            Value::Bool(_) => Some(Type::Primitive(Primitive::Boolean)),
            Value::Number(_) => Some(Type::Primitive(Primitive::Number)),
            Value::Str(_) => Some(Type::Primitive(Primitive::String)),
            Value::Object(o) => o.borrow().tag.clone(),
        }
    }

    /// [`Value::tag`] with untagged read as `any`.
    pub fn rtti(&self) -> Type {
        self.tag().unwrap_or(Type::Any)
    }

    /// Overwrites the tag of an object. Primitive tags are fixed and nullish
    /// values carry none, so for those this does nothing.
    pub fn set_tag(&self, t: Type) {
        if let Value::Object(o) = self {
            o.borrow_mut().tag = Some(t);
        }
    }

    pub fn proto(&self) -> Option<Arc<Prototype>> {
        self.as_object().and_then(|o| o.borrow().proto.clone())
    }

    pub fn callable(&self) -> Option<NativeFn> {
        match self.as_object().map(|o| o.borrow()) {
            Some(obj) => match &obj.storage {
                Storage::Function(f) => Some(f.clone()),
                _ => None,
            },
            None => None,
        }
    }

    /// Own function-valued property, then the prototype chain.
    pub fn method_impl(&self, name: &str) -> Option<NativeFn> {
        if name == CALL {
            return self.callable();
        }

        let obj = self.as_object()?.borrow();
        if let Storage::Record(props) = &obj.storage {
            if let Some(f) = props.get(name).and_then(|v| v.callable()) {
                return Some(f);
            }
        }
        obj.proto.as_ref().and_then(|p| p.find_method(name))
    }

    /// Raw property read with no checks.
    pub fn get(&self, key: &Key) -> Value {
        match self {
            Value::Str(s) => match key {
                Key::Name(n) if &**n == "length" => Value::Number(s.encode_utf16().count() as f64),
                Key::Index(i) => s
                    .chars()
                    .nth(*i)
                    .map(|c| Value::Str(c.to_string().into()))
                    .unwrap_or(Value::Undefined),
                _ => Value::Undefined,
            },
            Value::Object(o) => {
                let found = match (&o.borrow().storage, key) {
                    (Storage::Record(props), key) => props.get(&key.name()).cloned(),
                    (Storage::Array(elems), Key::Index(i)) => elems.get(*i).cloned(),
                    (Storage::Array(elems), Key::Name(n)) if &**n == "length" => {
                        Some(Value::Number(elems.len() as f64))
                    }
                    (Storage::Map(entries), key) => entries.get(&*key.name()).cloned(),
                    _ => None,
                };
                found.unwrap_or(Value::Undefined)
            }
            _ => Value::Undefined,
        }
    }

    /// Raw property write with no type checks. Arrays are dense, so a write
    /// more than [`MAX_ARRAY_GAP`] slots past the end is refused.
    pub fn put(&self, key: &Key, v: Value) -> RttiResult<()> {
        let obj = match self {
            Value::Object(o) => o,
            other => {
                return Err(TypeViolation::UnknownField {
                    field: key.name(),
                    ty: other.rtti().to_string(),
                }
                .into())
            }
        };

        let mut obj = obj.borrow_mut();
        let Object { tag, storage, .. } = &mut *obj;
        match (storage, key) {
            (Storage::Record(props), key) => {
                props.insert(key.name(), v);
            }
            (Storage::Array(elems), Key::Index(i)) => {
                if *i > elems.len() + MAX_ARRAY_GAP {
                    let ty = describe(tag.as_ref(), "any");
                    return Err(TypeViolation::IndexOutOfRange {
                        index: *i,
                        len: elems.len(),
                        ty,
                    }
                    .into());
                }
                if *i >= elems.len() {
                    elems.resize(*i + 1, Value::Undefined);
                }
                elems[*i] = v;
            }
            (Storage::Map(entries), key) => {
                entries.insert(key.name().to_string(), v);
            }
            (_, key) => {
                let ty = describe(tag.as_ref(), "any");
                return Err(TypeViolation::UnknownField { field: key.name(), ty }.into());
            }
        }
        Ok(())
    }

    /// JS `ToNumber`.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::Str(s) => {
                let t = s.trim();
                if t.is_empty() {
                    0.0
                } else {
                    t.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            Value::Object(_) => f64::NAN,
        }
    }

    /// JS `ToString`.
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_owned(),
            Value::Null => "null".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.to_string(),
            Value::Object(o) => match &o.borrow().storage {
                Storage::Array(elems) => elems.iter().map(|e| e.to_js_string()).join(","),
                Storage::Function(_) => "function".to_owned(),
                _ => "[object Object]".to_owned(),
            },
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_owned()
    } else if n.is_infinite() {
        let s = if n > 0.0 { "Infinity" } else { "-Infinity" };
        s.to_owned()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Strict equality (`===`): primitives by value, objects by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

fn describe(tag: Option<&Type>, absent: &str) -> String {
    tag.map(|t| t.to_string()).unwrap_or_else(|| absent.to_owned())
}

/// Nested objects print as `<tag> {..}` so cyclic values stay finite.
fn shallow(v: &Value) -> String {
    match v {
        Value::Object(o) => match o.0.try_borrow() {
            Ok(obj) => {
                let tag = describe(obj.tag.as_ref(), "untagged");
                match obj.storage {
                    Storage::Record(_) => format!("<{tag}> {{..}}"),
                    Storage::Array(_) => format!("<{tag}> [..]"),
                    Storage::Map(_) => format!("<{tag}> map{{..}}"),
                    Storage::Function(_) => format!("<{tag}> function"),
                }
            }
            Err(_) => "<borrowed>".to_owned(),
        },
        other => format!("{other:?}"),
    }
}

fn sorted_entries<'a>(entries: impl Iterator<Item = (String, &'a Value)>) -> String {
    entries
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .map(|(k, v)| format!("{k}: {}", shallow(v)))
        .join(", ")
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Object(o) => {
                let obj = match o.0.try_borrow() {
                    Ok(obj) => obj,
                    Err(_) => return write!(f, "<borrowed>"),
                };
                let tag = describe(obj.tag.as_ref(), "untagged");
                match &obj.storage {
                    Storage::Record(props) => {
                        let entries = props.iter().map(|(k, v)| (k.to_string(), v));
                        write!(f, "<{tag}> {{{}}}", sorted_entries(entries))
                    }
                    Storage::Array(elems) => {
                        write!(f, "<{tag}> [{}]", elems.iter().map(shallow).join(", "))
                    }
                    Storage::Map(entries) => {
                        let entries = entries.iter().map(|(k, v)| (k.clone(), v));
                        write!(f, "<{tag}> map{{{}}}", sorted_entries(entries))
                    }
                    Storage::Function(_) => write!(f, "<{tag}> function"),
                }
            }
            other => write!(f, "{}", other.to_js_string()),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RttiError;

    #[test]
    fn keys_normalize_like_js() {
        assert_eq!(Key::from_value(&Value::Number(2.0)), Key::Index(2));
        assert_eq!(Key::from_value(&Value::str("2")), Key::Index(2));
        assert_eq!(Key::from_value(&Value::str("02")), Key::Name("02".into()));
        assert_eq!(Key::from_value(&Value::Number(1.5)), Key::Name("1.5".into()));
        assert_eq!(Key::Index(3).name().as_ref(), "3");
    }

    #[test]
    fn primitive_tags_are_fixed() {
        let n = Value::Number(1.0);
        n.set_tag(Type::string());
        assert_eq!(n.tag(), Some(Type::number()));
        assert_eq!(Value::Undefined.tag(), None);
        assert_eq!(Value::Undefined.rtti(), Type::Any);
    }

    #[test]
    fn array_storage_grows_on_write() {
        let arr = Value::Object(ObjRef::new(Storage::Array(vec![Value::Number(1.0)]), None, None));
        arr.put(&Key::Index(2), Value::Bool(true)).unwrap();
        assert_eq!(arr.get(&Key::Name("length".into())), Value::Number(3.0));
        assert_eq!(arr.get(&Key::Index(1)), Value::Undefined);
        assert_eq!(arr.to_js_string(), "1,undefined,true");
    }

    #[test]
    fn far_array_writes_are_refused() {
        let tag = Some(Type::array(Type::number()));
        let arr = Value::Object(ObjRef::new(Storage::Array(vec![]), tag, None));
        let err = arr.put(&Key::Index(u32::MAX as usize), Value::Number(1.0)).unwrap_err();
        assert!(matches!(
            err,
            RttiError::User(TypeViolation::IndexOutOfRange { len: 0, .. })
        ));
        assert_eq!(arr.get(&Key::Name("length".into())), Value::Number(0.0));

        arr.put(&Key::Index(MAX_ARRAY_GAP), Value::Number(1.0)).unwrap();
        let length = arr.get(&Key::Name("length".into()));
        assert_eq!(length, Value::Number((MAX_ARRAY_GAP + 1) as f64));
    }

    #[test]
    fn cyclic_values_print_shallowly() {
        let rec = Value::Object(ObjRef::new(Storage::Record(FxHashMap::default()), None, None));
        rec.put(&Key::from_name("self"), rec.clone()).unwrap();
        rec.put(&Key::from_name("n"), Value::Number(1.0)).unwrap();
        assert_eq!(format!("{rec:?}"), "<untagged> {n: 1, self: <untagged> {..}}");

        let arr = Value::Object(ObjRef::new(Storage::Array(vec![rec]), None, None));
        assert_eq!(format!("{arr:?}"), "<untagged> [<untagged> {..}]");
    }

    #[test]
    fn string_length_counts_utf16_units() {
        assert_eq!(Value::str("h\u{1F600}").get(&Key::Name("length".into())), Value::Number(3.0));
    }

    #[test]
    fn to_number_follows_js() {
        assert_eq!(Value::str(" 8 ").to_number(), 8.0);
        assert_eq!(Value::str("").to_number(), 0.0);
        assert!(Value::str("x").to_number().is_nan());
        assert_eq!(Value::Null.to_number(), 0.0);
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(0.5), "0.5");
    }

    #[test]
    fn methods_resolve_through_prototype_chain() {
        let hello = native(|_, _| Ok(Value::str("hi")));
        let base = Arc::new(Prototype::new("Base").with_method("hello", hello));
        let derived = Arc::new(Prototype::new("Derived").extending(base.clone()));
        assert!(derived.derives_from(&base));
        assert!(!base.derives_from(&derived));

        let storage = Storage::Record(FxHashMap::default());
        let obj = Value::Object(ObjRef::new(storage, None, Some(derived)));
        let f = obj.method_impl("hello").unwrap();
        assert_eq!(f(&obj, &[]).unwrap(), Value::str("hi"));
    }
}
