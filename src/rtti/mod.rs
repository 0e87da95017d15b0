pub mod value;
pub mod coerce;
pub mod access;
pub mod call;
pub mod ops;


pub use access::*;
pub use call::*;
pub use ops::*;
pub use value::*;

use rustc_hash::FxHashMap;

use crate::config::EngineConfig;
use crate::errors::{InvariantViolation, RttiResult};
use crate::types::*;

/// One checked-program session: owns the type registry that generated
/// registration calls fill in, and the host natives behind primitive
/// receiver methods.
pub struct Runtime {
    registry: TypeRegistry,
    config: EngineConfig,
    natives: FxHashMap<(Wrapper, Name), NativeFn>,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new(EngineConfig::default())
    }
}

impl Runtime {
    pub fn new(config: EngineConfig) -> Runtime {
        Runtime {
            registry: TypeRegistry::new(),
            config,
            natives: FxHashMap::default(),
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Implementation of a method answered by every value of a primitive
    /// wrapper (`Wrapper::Object` for all values).
    pub fn define_native(&mut self, wrapper: Wrapper, name: &str, f: NativeFn) {
        self.natives.insert((wrapper, name.into()), f);
    }

    pub(crate) fn native_for(&self, receiver: &Value, name: &str) -> Option<NativeFn> {
        let key: Name = name.into();
        let own = Wrapper::of(&receiver.rtti());
        self.natives
            .get(&(own, key.clone()))
            .or_else(|| self.natives.get(&(Wrapper::Object, key)))
            .cloned()
    }

    /// A record; tagged with `shape` when given, untagged otherwise.
    pub fn new_record<'a>(
        &self,
        shape: Option<Structured>,
        props: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Value {
        let props = props.into_iter().map(|(k, v)| (Name::from(k), v)).collect();
        Value::Object(ObjRef::new(Storage::Record(props), shape.map(Type::record), None))
    }

    pub fn new_array(&self, element: Type, elems: Vec<Value>) -> Value {
        Value::Object(ObjRef::new(Storage::Array(elems), Some(Type::array(element)), None))
    }

    /// A tuple is array-backed and tagged with its positional record type.
    pub fn new_tuple(&self, shape: Type, elems: Vec<Value>) -> Value {
        Value::Object(ObjRef::new(Storage::Array(elems), Some(shape), None))
    }

    pub fn new_map(&self, key: Type, value: Type, entries: Vec<(String, Value)>) -> Value {
        Value::Object(ObjRef::new(
            Storage::Map(entries.into_iter().collect()),
            Some(Type::index_map(key, value)),
            None,
        ))
    }

    pub fn new_function(&self, signature: Arrow, f: NativeFn) -> Value {
        Value::Object(ObjRef::new(Storage::Function(f), Some(Type::function(signature)), None))
    }

    /// `new C(...)`: an object tagged with the instance type `class` and
    /// linked to its backing prototype.
    pub fn new_instance<'a>(
        &self,
        class: &Type,
        props: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> RttiResult<Value> {
        let named = match class {
            Type::Instance(n) => n,
            other => {
                let reason = format!("cannot instantiate {other}");
                return Err(InvariantViolation::Impossible(reason).into());
            }
        };

        let proto = named
            .body()
            .ok_or_else(|| InvariantViolation::UnresolvedNamedType {
                name: named.name().clone(),
            })?
            .prototype
            .clone();

        let props = props.into_iter().map(|(k, v)| (Name::from(k), v)).collect();
        Ok(Value::Object(ObjRef::new(
            Storage::Record(props),
            Some(class.clone()),
            proto,
        )))
    }
}
