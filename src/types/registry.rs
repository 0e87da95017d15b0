use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use smallvec::SmallVec;
use static_assertions::assert_impl_all;

use super::descriptor::*;
use crate::errors::{InvariantViolation, RttiResult};
use crate::rtti::value::Prototype;

/// The shared method tables of the primitive wrappers. Registering a type
/// named after one of these contributes methods instead of a new type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum Wrapper {
    String,
    Number,
    Boolean,
    /// Methods every value answers to (the method table of `any`).
    Object,
}

impl Wrapper {
    pub fn for_name(name: &str) -> Option<Wrapper> {
        match name {
            "String" => Some(Wrapper::String),
            "Number" => Some(Wrapper::Number),
            "Object" => Some(Wrapper::Object),
            _ => None,
        }
    }

    pub fn of(t: &Type) -> Wrapper {
        match t {
            Type::Primitive(Primitive::String) => Wrapper::String,
            Type::Primitive(Primitive::Number) => Wrapper::Number,
            Type::Primitive(Primitive::Boolean) => Wrapper::Boolean,
            _ => Wrapper::Object,
        }
    }

    fn as_type(&self) -> Type {
        match self {
            Wrapper::String => Type::string(),
            Wrapper::Number => Type::number(),
            Wrapper::Boolean => Type::boolean(),
            Wrapper::Object => Type::Any,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelationKind {
    Subtype,
    Equal,
}

/// Memo and cycle-guard key for a relation between two named types.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RelationKey {
    pub lhs: Name,
    pub rhs: Name,
    pub kind: RelationKind,
}

impl RelationKey {
    pub fn subtype(lhs: &Named, rhs: &Named) -> RelationKey {
        RelationKey {
            lhs: lhs.name().clone(),
            rhs: rhs.name().clone(),
            kind: RelationKind::Subtype,
        }
    }

    pub fn equal(lhs: &Named, rhs: &Named) -> RelationKey {
        RelationKey {
            lhs: lhs.name().clone(),
            rhs: rhs.name().clone(),
            kind: RelationKind::Equal,
        }
    }
}

/// Everything needed to define one named type.
#[derive(Clone, Debug)]
pub struct NamedDef {
    pub name: Name,
    pub kind: NamedKind,
    pub members: Structured,
    pub extends: SmallVec<[Name; 2]>,
    pub implements: SmallVec<[Name; 2]>,
    pub prototype: Option<Arc<Prototype>>,
    pub ctor_type: Option<Type>,
}

impl NamedDef {
    pub fn interface(name: &str, members: Structured) -> NamedDef {
        NamedDef {
            name: name.into(),
            kind: NamedKind::Interface,
            members,
            extends: SmallVec::new(),
            implements: SmallVec::new(),
            prototype: None,
            ctor_type: None,
        }
    }

    pub fn extending(mut self, base: &str) -> NamedDef {
        self.extends.push(base.into());
        self
    }
}

/// Inputs of [`TypeRegistry::register_class`]: one instance type and its
/// companion class (static side) type named `{name}Class`.
#[derive(Clone, Debug)]
pub struct ClassDef {
    pub name: Name,
    pub fields: Structured,
    pub methods: Structured,
    pub base: Option<Name>,
    pub implements: SmallVec<[Name; 2]>,
    pub static_fields: Structured,
    pub static_methods: Structured,
    pub ctor_type: Type,
    pub prototype: Arc<Prototype>,
}

impl ClassDef {
    pub fn new(name: &str, prototype: Arc<Prototype>) -> ClassDef {
        ClassDef {
            name: name.into(),
            fields: Structured::new(),
            methods: Structured::new(),
            base: None,
            implements: SmallVec::new(),
            static_fields: Structured::new(),
            static_methods: Structured::new(),
            ctor_type: Type::arrow(Arrow::new([], Type::void())),
            prototype,
        }
    }
}

/// Table of named types, filled during a single startup phase and frozen
/// afterwards. The relation memo is the only part that keeps growing, and it
/// only ever gains entries.
pub struct TypeRegistry {
    named: DashMap<Name, Named>,
    registered: DashSet<Name>,
    relations: DashMap<RelationKey, Delta>,
    wrappers: DashMap<Wrapper, Arc<Structured>>,
    frozen: AtomicBool,
}

assert_impl_all!(TypeRegistry: Send, Sync);

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry {
            named: DashMap::new(),
            registered: DashSet::new(),
            relations: DashMap::new(),
            wrappers: DashMap::new(),
            frozen: AtomicBool::new(false),
        }
    }

    /// Returns the shared handle for `name`, creating an empty placeholder on
    /// first reference.
    pub fn named_type(&self, name: &str, kind: NamedKind) -> RttiResult<Named> {
        if let Some(existing) = self.named.get(name) {
            let existing = existing.value().clone();
            if existing.kind() != kind {
                return Err(InvariantViolation::KindMismatch {
                    name: name.into(),
                    known: existing.kind().to_string(),
                    requested: kind.to_string(),
                }
                .into());
            }
            return Ok(existing);
        }

        if self.is_frozen() {
            tracing::warn!("placeholder for {name} created after freeze, it can never be defined");
        }

        let named = self
            .named
            .entry(name.into())
            .or_insert_with(|| Arc::new(NamedType::placeholder(name.into(), kind)))
            .value()
            .clone();

        Ok(named)
    }

    pub fn lookup(&self, name: &str) -> Option<Named> {
        self.named.get(name).map(|r| r.value().clone())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registered.contains(name)
    }

    /// Defines a named type. `String`, `Number` and `Object` patch the shared
    /// wrapper method tables and yield the corresponding builtin type.
    pub fn register_type(&self, def: NamedDef) -> RttiResult<Type> {
        if self.is_frozen() {
            return Err(InvariantViolation::RegistryFrozen { name: def.name }.into());
        }

        if let Some(wrapper) = Wrapper::for_name(&def.name) {
            tracing::debug!(
                "patching {wrapper} wrapper with {} methods",
                def.members.methods.len()
            );
            let mut table = self
                .wrappers
                .entry(wrapper)
                .or_insert_with(|| Arc::new(Structured::new()));
            Arc::make_mut(table.value_mut()).absorb(&def.members);
            return Ok(wrapper.as_type());
        }

        if self.registered.contains(&def.name) {
            return Err(InvariantViolation::DuplicateRegistration { name: def.name }.into());
        }

        // resolve every handle before claiming the name, so a failed lookup
        // leaves the registry as it was
        let named = self.named_type(&def.name, def.kind)?;
        let bases = def
            .extends
            .iter()
            .map(|base| self.named_type(base, def.kind))
            .collect::<RttiResult<SmallVec<[Named; 2]>>>()?;

        if !self.registered.insert(def.name.clone()) {
            return Err(InvariantViolation::DuplicateRegistration { name: def.name }.into());
        }

        for base in bases.iter().filter(|b| !b.is_defined()) {
            tracing::debug!("{} extends {}, which is not registered yet", def.name, base.name());
        }

        let body = NamedBody {
            members: Arc::new(def.members),
            extends: def.extends,
            bases,
            implements: def.implements,
            prototype: def.prototype,
            ctor_type: def.ctor_type,
        };

        if named.define(body).is_err() {
            return Err(InvariantViolation::DuplicateRegistration { name: def.name }.into());
        }

        tracing::debug!("registered {} {}", def.kind, def.name);

        Ok(match def.kind {
            NamedKind::Instance => Type::Instance(named),
            NamedKind::Class => Type::Class(named),
            NamedKind::Interface => Type::Interface(named),
        })
    }

    /// Registers the instance type `def.name` and the class type
    /// `{def.name}Class`, returning the latter.
    pub fn register_class(&self, def: ClassDef) -> RttiResult<Type> {
        let mut instance_members = def.fields;
        instance_members.absorb(&def.methods);

        let mut static_members = def.static_fields;
        static_members.absorb(&def.static_methods);

        // the companion must be registrable before the instance half is
        let class_name: Name = format!("{}Class", def.name).into();
        if self.registered.contains(&class_name) {
            return Err(InvariantViolation::DuplicateRegistration { name: class_name }.into());
        }
        if let Some(known) = self.lookup(&class_name).filter(|n| n.kind() != NamedKind::Class) {
            return Err(InvariantViolation::KindMismatch {
                name: class_name,
                known: known.kind().to_string(),
                requested: NamedKind::Class.to_string(),
            }
            .into());
        }

        self.register_type(NamedDef {
            name: def.name.clone(),
            kind: NamedKind::Instance,
            members: instance_members,
            extends: def.base.into_iter().collect(),
            implements: def.implements,
            prototype: Some(def.prototype),
            ctor_type: None,
        })?;

        self.register_type(NamedDef {
            name: class_name,
            kind: NamedKind::Class,
            members: static_members,
            extends: SmallVec::new(),
            implements: SmallVec::new(),
            prototype: None,
            ctor_type: Some(def.ctor_type),
        })
    }

    /// Ends the registration phase.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
        tracing::info!("type registry frozen with {} named types", self.registered.len());
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Structural view of a named type, which must be defined by now.
    pub fn view(&self, named: &Named) -> RttiResult<Arc<Structured>> {
        named.view().ok_or_else(|| {
            InvariantViolation::UnresolvedNamedType {
                name: named.name().clone(),
            }
            .into()
        })
    }

    pub fn wrapper_methods(&self, wrapper: Wrapper) -> Arc<Structured> {
        self.wrappers
            .get(&wrapper)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub(crate) fn recall(&self, key: &RelationKey) -> Option<Delta> {
        self.relations.get(key).map(|r| r.value().clone())
    }

    /// Proven relations never change, so a racing insert of the same key
    /// always writes an equal value.
    pub(crate) fn remember(&self, key: RelationKey, delta: Delta) {
        tracing::trace!("memoizing {:?} {} <: {}", key.kind, key.lhs, key.rhs);
        self.relations.insert(key, delta);
    }

    pub fn memo_len(&self) -> usize {
        self.relations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RttiError;

    fn b_members() -> Structured {
        Structured::new()
            .with_field("bar", Field::new(Type::string()))
            .with_method("foo", Arrow::new([], Type::void()))
    }

    fn a_extending_b() -> NamedDef {
        let baz = Structured::new().with_method("baz", Arrow::new([], Type::void()));
        NamedDef::interface("A", baz).extending("B")
    }

    #[test]
    fn duplicate_registration_is_internal() {
        let reg = TypeRegistry::new();
        reg.register_type(NamedDef::interface("B", b_members())).unwrap();

        let err = reg.register_type(NamedDef::interface("B", b_members())).unwrap_err();
        assert!(err.is_internal());
        assert!(matches!(
            err,
            RttiError::Internal(InvariantViolation::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn forward_references_share_identity() {
        let reg = TypeRegistry::new();
        let early = reg.named_type("B", NamedKind::Interface).unwrap();
        assert!(!early.is_defined());

        let registered = reg.register_type(NamedDef::interface("B", b_members())).unwrap();

        assert!(early.is_defined());
        assert!(early.view().unwrap().fields.contains_key("bar"));
        assert!(Arc::ptr_eq(&early, registered.named().unwrap()));
    }

    #[test]
    fn kind_mismatch_on_lookup() {
        let reg = TypeRegistry::new();
        reg.named_type("C", NamedKind::Interface).unwrap();
        assert!(reg.named_type("C", NamedKind::Instance).unwrap_err().is_internal());
    }

    #[test]
    fn inherited_members_are_folded() {
        let reg = TypeRegistry::new();
        reg.register_type(NamedDef::interface("B", b_members())).unwrap();
        let a = reg
            .register_type(a_extending_b())
            .unwrap();

        let view = reg.view(a.named().unwrap()).unwrap();
        assert!(view.fields.contains_key("bar"));
        assert!(view.methods.contains_key("foo"));
        assert!(view.methods.contains_key("baz"));
        assert!(a.named().unwrap().extends("B"));
    }

    #[test]
    fn bases_registered_later_are_inherited() {
        let reg = TypeRegistry::new();
        let a = reg
            .register_type(a_extending_b())
            .unwrap();

        let early = reg.view(a.named().unwrap()).unwrap();
        assert!(!early.fields.contains_key("bar"));

        reg.register_type(NamedDef::interface("B", b_members())).unwrap();

        let view = reg.view(a.named().unwrap()).unwrap();
        assert!(view.fields.contains_key("bar"));
        assert!(view.methods.contains_key("foo"));
        assert!(view.methods.contains_key("baz"));
        assert!(Arc::ptr_eq(&view, &reg.view(a.named().unwrap()).unwrap()));
    }

    #[test]
    fn inheritance_cycles_terminate() {
        let reg = TypeRegistry::new();
        let p_members = Structured::new().with_field("p", Field::new(Type::number()));
        let q_members = Structured::new().with_field("q", Field::new(Type::string()));
        let p = reg
            .register_type(NamedDef::interface("P", p_members).extending("Q"))
            .unwrap();
        reg.register_type(NamedDef::interface("Q", q_members).extending("P"))
            .unwrap();

        let view = reg.view(p.named().unwrap()).unwrap();
        assert!(view.fields.contains_key("p"));
        assert!(view.fields.contains_key("q"));
    }

    #[test]
    fn failed_registration_leaves_name_free() {
        let reg = TypeRegistry::new();
        reg.named_type("C", NamedKind::Interface).unwrap();

        let mut wrong = NamedDef::interface("C", b_members());
        wrong.kind = NamedKind::Instance;
        let err = reg.register_type(wrong).unwrap_err();
        assert!(matches!(err, RttiError::Internal(InvariantViolation::KindMismatch { .. })));
        assert!(!reg.is_registered("C"));

        reg.register_type(NamedDef::interface("C", b_members())).unwrap();
        assert!(reg.is_registered("C"));
    }

    #[test]
    fn class_with_taken_companion_registers_nothing() {
        let reg = TypeRegistry::new();
        reg.register_type(NamedDef::interface("PointClass", b_members())).unwrap();

        let err = reg.register_class(ClassDef::new("Point", Arc::new(Prototype::new("Point"))));
        assert!(err.unwrap_err().is_internal());
        assert!(!reg.is_registered("Point"));
        assert!(reg.lookup("Point").is_none());

        reg.named_type("LineClass", NamedKind::Interface).unwrap();
        let err = reg.register_class(ClassDef::new("Line", Arc::new(Prototype::new("Line"))));
        assert!(matches!(
            err.unwrap_err(),
            RttiError::Internal(InvariantViolation::KindMismatch { .. })
        ));
        assert!(!reg.is_registered("Line"));
    }

    #[test]
    fn wrapper_names_patch_method_tables() {
        let reg = TypeRegistry::new();
        let s = Structured::new()
            .with_method("charAt", Arrow::new([Type::number()], Type::string()));
        let t = reg.register_type(NamedDef::interface("String", s.clone())).unwrap();
        assert_eq!(t, Type::string());
        // patching twice is allowed, these are contributions
        reg.register_type(NamedDef::interface("String", s)).unwrap();

        assert!(reg.wrapper_methods(Wrapper::String).methods.contains_key("charAt"));
        assert!(reg.lookup("String").is_none());
    }

    #[test]
    fn class_registers_companion() {
        let reg = TypeRegistry::new();
        let proto = Arc::new(Prototype::new("Point"));
        let mut def = ClassDef::new("Point", proto);
        def.fields = Structured::new().with_field("x", Field::new(Type::number()));
        def.static_fields = Structured::new().with_field("origin", Field::new(Type::number()));

        let class = reg.register_class(def).unwrap();
        assert_eq!(class.to_string(), "typeof PointClass");

        let instance = reg.lookup("Point").unwrap();
        assert_eq!(instance.kind(), NamedKind::Instance);
        assert!(instance.body().unwrap().prototype.is_some());
        assert!(reg.view(class.named().unwrap()).unwrap().fields.contains_key("origin"));
    }

    #[test]
    fn frozen_registry_rejects_registration() {
        let reg = TypeRegistry::new();
        reg.freeze();
        let err = reg.register_type(NamedDef::interface("B", b_members())).unwrap_err();
        assert!(matches!(err, RttiError::Internal(InvariantViolation::RegistryFrozen { .. })));
    }
}
