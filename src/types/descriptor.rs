use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use itertools::Itertools;
use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use strum::EnumDiscriminants;

use crate::rtti::value::Prototype;

/// Type and member names are shared, never interned per-registry, so that
/// descriptors can be printed and compared without a registry at hand.
pub type Name = Arc<str>;

/// The method name under which a callable value records its signature.
pub const CALL: &str = "<call>";

/// Residue a tag must carry beyond what the static type proves. `None` is zero.
pub type Delta = Option<Type>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum Primitive {
    #[strum(serialize = "number")]
    Number,
    #[strum(serialize = "string")]
    String,
    #[strum(serialize = "boolean")]
    Boolean,
    #[strum(serialize = "void")]
    Void,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum NamedKind {
    #[strum(serialize = "instance")]
    Instance,
    #[strum(serialize = "class")]
    Class,
    #[strum(serialize = "interface")]
    Interface,
}

/// Runtime type descriptor.
///
/// Everything that is shared between values lives behind an `Arc`: named
/// descriptors are only ever reachable through `&`, and ad hoc records are
/// copied on write (`Arc::make_mut`) before a coercion merges into them.
#[derive(Clone, PartialEq, EnumDiscriminants)]
#[strum_discriminants(name(TypeKind), derive(Hash, strum::Display))]
pub enum Type {
    Any,
    /// Sentinel base of dotted types, never a valid target.
    Un,
    Primitive(Primitive),
    Array(Arc<Type>),
    IndexMap(Arc<Type>, Arc<Type>),
    Instance(Named),
    Class(Named),
    Interface(Named),
    Structured(Arc<Structured>),
    Arrow(Arc<Arrow>),
    Just(Arc<Type>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub ty: Type,
    pub optional: bool,
    pub mutable: bool,
    /// Tuple rest element; may be absent on a subtype.
    pub rest: bool,
}

impl Field {
    pub fn new(ty: Type) -> Field {
        Field {
            ty,
            optional: false,
            mutable: true,
            rest: false,
        }
    }

    pub fn optional(mut self) -> Field {
        self.optional = true;
        self
    }

    pub fn readonly(mut self) -> Field {
        self.mutable = false;
        self
    }

    pub fn rest(mut self) -> Field {
        self.rest = true;
        self
    }
}

/// Anonymous record: object literals, tuples (fields `"0"`, `"1"`, ...) and
/// function values (a single [`CALL`] method).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Structured {
    pub fields: FxHashMap<Name, Field>,
    pub methods: FxHashMap<Name, Type>,
}

pub enum Member<'a> {
    Field(&'a Field),
    Method(&'a Type),
}

impl Structured {
    pub fn new() -> Structured {
        Structured::default()
    }

    pub fn with_field(mut self, name: &str, field: Field) -> Structured {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn with_method(mut self, name: &str, signature: Arrow) -> Structured {
        self.methods.insert(name.into(), Type::Arrow(Arc::new(signature)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.methods.is_empty()
    }

    pub fn member(&self, name: &str) -> Option<Member<'_>> {
        if let Some(f) = self.fields.get(name) {
            Some(Member::Field(f))
        } else {
            self.methods.get(name).map(Member::Method)
        }
    }

    /// Copies every member of `other` into `self`, overwriting same-named ones.
    pub fn absorb(&mut self, other: &Structured) {
        for (name, field) in other.fields.iter() {
            self.fields.insert(name.clone(), field.clone());
        }
        for (name, method) in other.methods.iter() {
            self.methods.insert(name.clone(), method.clone());
        }
    }

    /// Copies members of `other` that `self` does not already declare.
    pub fn inherit(&mut self, other: &Structured) {
        for (name, field) in other.fields.iter() {
            if !self.fields.contains_key(name) && !self.methods.contains_key(name) {
                self.fields.insert(name.clone(), field.clone());
            }
        }
        for (name, method) in other.methods.iter() {
            if !self.fields.contains_key(name) && !self.methods.contains_key(name) {
                self.methods.insert(name.clone(), method.clone());
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Arrow {
    pub params: SmallVec<[Type; 4]>,
    pub result: Type,
    pub varargs: Option<Type>,
    pub mandatory: usize,
}

impl Arrow {
    /// All parameters mandatory, no varargs.
    pub fn new(params: impl IntoIterator<Item = Type>, result: Type) -> Arrow {
        let params: SmallVec<[Type; 4]> = params.into_iter().collect();
        let mandatory = params.len();
        Arrow {
            params,
            result,
            varargs: None,
            mandatory,
        }
    }

    pub fn with_mandatory(mut self, mandatory: usize) -> Arrow {
        self.mandatory = mandatory.min(self.params.len());
        self
    }

    pub fn with_varargs(mut self, element: Type) -> Arrow {
        self.varargs = Some(element);
        self
    }
}

pub type Named = Arc<NamedType>;

/// A nominal descriptor.
///
/// Created empty on first reference by name and filled exactly once when its
/// registration runs, so handles obtained before registration observe the
/// completed definition.
pub struct NamedType {
    name: Name,
    kind: NamedKind,
    body: OnceCell<NamedBody>,
    /// Own members plus every inherited one, set once all bases are defined.
    folded: OnceCell<Arc<Structured>>,
}

#[derive(Clone, Debug)]
pub struct NamedBody {
    /// Declared fields and methods. For a class this is the static side.
    pub members: Arc<Structured>,
    pub extends: SmallVec<[Name; 2]>,
    /// Handles of `extends`, possibly still placeholders.
    pub bases: SmallVec<[Named; 2]>,
    pub implements: SmallVec<[Name; 2]>,
    pub prototype: Option<Arc<Prototype>>,
    pub ctor_type: Option<Type>,
}

impl NamedType {
    pub(crate) fn placeholder(name: Name, kind: NamedKind) -> NamedType {
        NamedType {
            name,
            kind,
            body: OnceCell::new(),
            folded: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn kind(&self) -> NamedKind {
        self.kind
    }

    pub fn body(&self) -> Option<&NamedBody> {
        self.body.get()
    }

    pub fn is_defined(&self) -> bool {
        self.body.get().is_some()
    }

    /// Fails (returning the rejected body) if this type was already defined.
    pub(crate) fn define(&self, body: NamedBody) -> Result<(), NamedBody> {
        self.body.set(body)
    }

    /// Members including inherited ones, nearest declaration first.
    ///
    /// Bases may be defined after this type. Until every base is, the view
    /// holds what is known so far and is rebuilt on the next call.
    pub fn view(&self) -> Option<Arc<Structured>> {
        if let Some(folded) = self.folded.get() {
            return Some(folded.clone());
        }

        let body = self.body()?;
        if body.bases.is_empty() {
            return Some(body.members.clone());
        }

        let mut members = (*body.members).clone();
        let mut complete = true;
        let mut seen: SmallVec<[Name; 4]> = SmallVec::new();
        seen.push(self.name.clone());

        let mut pending: Vec<Named> = body.bases.iter().cloned().collect();
        let mut at = 0;
        while at < pending.len() {
            let base = pending[at].clone();
            at += 1;
            if seen.contains(base.name()) {
                continue;
            }
            seen.push(base.name().clone());

            match base.body() {
                Some(b) => {
                    members.inherit(&b.members);
                    pending.extend(b.bases.iter().cloned());
                }
                None => complete = false,
            }
        }

        let members = Arc::new(members);
        if complete {
            Some(self.folded.get_or_init(|| members).clone())
        } else {
            Some(members)
        }
    }

    pub fn extends(&self, other: &str) -> bool {
        self.body()
            .map(|b| b.extends.iter().any(|e| &**e == other))
            .unwrap_or(false)
    }

    pub fn implements(&self, other: &str) -> bool {
        self.body()
            .map(|b| b.implements.iter().any(|e| &**e == other))
            .unwrap_or(false)
    }
}

impl PartialEq for NamedType {
    fn eq(&self, other: &NamedType) -> bool {
        self.kind == other.kind && self.name == other.name
    }
}

impl Debug for NamedType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // bodies may refer back to this type, so never descend
        write!(f, "{}({})", self.kind, self.name)
    }
}

impl Type {
    pub fn number() -> Type {
        Type::Primitive(Primitive::Number)
    }

    pub fn string() -> Type {
        Type::Primitive(Primitive::String)
    }

    pub fn boolean() -> Type {
        Type::Primitive(Primitive::Boolean)
    }

    pub fn void() -> Type {
        Type::Primitive(Primitive::Void)
    }

    pub fn array(element: Type) -> Type {
        Type::Array(Arc::new(element))
    }

    pub fn index_map(key: Type, value: Type) -> Type {
        Type::IndexMap(Arc::new(key), Arc::new(value))
    }

    pub fn record(s: Structured) -> Type {
        Type::Structured(Arc::new(s))
    }

    pub fn arrow(a: Arrow) -> Type {
        Type::Arrow(Arc::new(a))
    }

    /// The structural type of a function value with signature `a`.
    pub fn function(a: Arrow) -> Type {
        Type::record(Structured::new().with_method(CALL, a))
    }

    pub fn just(base: Type) -> Type {
        Type::Just(Arc::new(base))
    }

    pub fn kind(&self) -> TypeKind {
        TypeKind::from(self)
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Type::Any)
    }

    pub fn is_primitive(&self, p: Primitive) -> bool {
        matches!(self, Type::Primitive(q) if *q == p)
    }

    /// `Just`/`Un`: never a runtime tag, never a coercion target.
    pub fn is_dotted(&self) -> bool {
        matches!(self, Type::Just(_) | Type::Un)
    }

    pub fn named(&self) -> Option<&Named> {
        match self {
            Type::Instance(n) | Type::Class(n) | Type::Interface(n) => Some(n),
            _ => None,
        }
    }

    /// Kinds whose tag can never be widened by merging in more members.
    pub fn is_fixed(&self) -> bool {
        matches!(
            self,
            Type::Primitive(_)
                | Type::Instance(_)
                | Type::Class(_)
                | Type::Array(_)
                | Type::IndexMap(_, _)
        )
    }

    /// Object identity, the `===` short-circuit of every relation.
    pub fn same(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Any, Type::Any) | (Type::Un, Type::Un) => true,
            (Type::Primitive(a), Type::Primitive(b)) => a == b,
            (Type::Instance(a), Type::Instance(b))
            | (Type::Class(a), Type::Class(b))
            | (Type::Interface(a), Type::Interface(b)) => Arc::ptr_eq(a, b),
            (Type::Structured(a), Type::Structured(b)) => Arc::ptr_eq(a, b),
            (Type::Arrow(a), Type::Arrow(b)) => Arc::ptr_eq(a, b),
            (Type::Array(a), Type::Array(b)) | (Type::Just(a), Type::Just(b)) => Arc::ptr_eq(a, b),
            (Type::IndexMap(ka, va), Type::IndexMap(kb, vb)) => {
                Arc::ptr_eq(ka, kb) && Arc::ptr_eq(va, vb)
            }
            _ => false,
        }
    }
}

impl Debug for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Type::Any => write!(f, "any"),
            Type::Un => write!(f, "Un"),
            Type::Primitive(p) => write!(f, "{}", p),
            Type::Array(e) => write!(f, "{}[]", e),
            Type::IndexMap(k, v) => write!(f, "{{[key: {}]: {}}}", k, v),
            Type::Instance(n) | Type::Interface(n) => write!(f, "{}", n.name()),
            Type::Class(n) => write!(f, "typeof {}", n.name()),
            Type::Structured(s) => write!(f, "{}", s),
            Type::Arrow(a) => write!(f, "{}", a),
            Type::Just(b) => write!(f, "Just<{}>", b),
        }
    }
}

impl Display for Structured {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "{{}}");
        }

        let fields = self.fields.iter().sorted_by(|a, b| a.0.cmp(b.0)).map(|(name, field)| {
            let rest = if field.rest { "..." } else { "" };
            let opt = if field.optional { "?" } else { "" };
            let ro = if field.mutable { "" } else { "readonly " };
            format!("{ro}{rest}{name}{opt}: {}", field.ty)
        });

        let methods = self
            .methods
            .iter()
            .sorted_by(|a, b| a.0.cmp(b.0))
            .map(|(name, sig)| match sig {
                Type::Arrow(a) => format!("{name}{}", a.signature()),
                other => format!("{name}: {other}"),
            });

        write!(f, "{{ {} }}", fields.chain(methods).join("; "))
    }
}

impl Arrow {
    fn signature(&self) -> String {
        let params = self.params.iter().enumerate().map(|(i, p)| {
            if i >= self.mandatory {
                format!("{p}?")
            } else {
                format!("{p}")
            }
        });
        let varargs = self.varargs.iter().map(|v| format!("...{v}[]"));

        format!("({}): {}", params.chain(varargs).join(", "), self.result)
    }
}

impl Display for Arrow {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let params = self.params.iter().map(|p| p.to_string());
        let varargs = self.varargs.iter().map(|v| format!("...{v}[]"));
        write!(f, "({}) => {}", params.chain(varargs).join(", "), self.result)
    }
}
