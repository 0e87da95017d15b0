//! Subtyping and type equality over runtime descriptors.
//!
//! Relations between named types are cycle-guarded by a [`RelationCtx`] that
//! lives for one top-level query, and proven results are memoized in the
//! registry, where they stay valid for the rest of the process.

use std::sync::Arc;

use super::descriptor::*;
use super::registry::{RelationKey, TypeRegistry};
use crate::rtti::value::Prototype;

/// Outcome of `t1 <: t2`.
#[derive(Clone, Debug, PartialEq)]
pub struct Subsumption {
    pub holds: bool,
    pub delta: Delta,
}

impl Subsumption {
    pub fn no() -> Subsumption {
        Subsumption {
            holds: false,
            delta: None,
        }
    }

    pub fn zero() -> Subsumption {
        Subsumption {
            holds: true,
            delta: None,
        }
    }

    pub fn with(delta: Type) -> Subsumption {
        Subsumption {
            holds: true,
            delta: Some(delta),
        }
    }

    fn from_bool(holds: bool) -> Subsumption {
        Subsumption { holds, delta: None }
    }

    /// Holds, and the static type alone already implies the target.
    pub fn is_zero(&self) -> bool {
        self.holds && self.delta.is_none()
    }
}

/// Relation pairs assumed to hold while they are being proven.
///
/// A persistent list: extending it borrows the parent, so sibling branches of
/// one query can never observe each other's assumptions.
#[derive(Default)]
pub struct RelationCtx<'a> {
    head: Option<RelationKey>,
    parent: Option<&'a RelationCtx<'a>>,
}

impl<'a> RelationCtx<'a> {
    pub fn root() -> RelationCtx<'static> {
        RelationCtx {
            head: None,
            parent: None,
        }
    }

    pub fn assuming(&self, key: RelationKey) -> RelationCtx<'_> {
        RelationCtx {
            head: Some(key),
            parent: Some(self),
        }
    }

    pub fn assumes(&self, key: &RelationKey) -> bool {
        let mut at = Some(self);
        while let Some(ctx) = at {
            if ctx.head.as_ref() == Some(key) {
                return true;
            }
            at = ctx.parent;
        }
        false
    }

    /// No pair is assumed, so a result proven here depends on nothing
    /// beyond itself.
    pub fn is_root(&self) -> bool {
        self.head.is_none() && self.parent.is_none()
    }
}

impl TypeRegistry {
    pub fn is_subtype(&self, t1: &Type, t2: &Type) -> bool {
        self.subtype(t1, t2).holds
    }

    pub fn subtype(&self, t1: &Type, t2: &Type) -> Subsumption {
        self.subtype_in(t1, t2, &RelationCtx::root())
    }

    pub fn subtype_in(&self, t1: &Type, t2: &Type, ctx: &RelationCtx<'_>) -> Subsumption {
        if t1.same(t2) {
            return Subsumption::zero();
        }

        if let Type::Just(base) = t1 {
            if !matches!(t2, Type::Just(_)) {
                return self.subtype_in(base, t2, ctx);
            }
        }

        match t2 {
            Type::Any => match t1 {
                Type::Un => Subsumption::no(),
                Type::Any | Type::Primitive(_) | Type::Instance(_) | Type::Arrow(_) => {
                    Subsumption::zero()
                }
                Type::Interface(_)
                | Type::Structured(_)
                | Type::Array(_)
                | Type::IndexMap(_, _)
                | Type::Class(_) => Subsumption::with(t1.clone()),
                Type::Just(_) => unreachable!("unwrapped above"),
            },

            Type::Primitive(Primitive::Void) => Subsumption::zero(),

            Type::Primitive(p) => Subsumption::from_bool(t1.is_primitive(*p)),

            Type::Instance(n2) => match t1 {
                Type::Instance(n1) => Subsumption::from_bool(self.instance_derives(n1, n2)),
                _ => Subsumption::no(),
            },

            Type::Interface(n2) => match t1 {
                Type::Interface(n1) => self.interface_subtype(n1, n2, ctx),
                Type::Instance(n1) => self.instance_implements(n1, n2, ctx),
                _ => Subsumption::no(),
            },

            Type::Structured(s2) => match t1 {
                Type::Structured(s1) => self.structured_subtype(s1, s2, ctx),
                Type::Interface(n1) => match n1.view() {
                    Some(v1) => self.structured_subtype(&v1, s2, ctx),
                    None => Subsumption::no(),
                },
                // nominal tags already retain every member, nothing to remember
                Type::Instance(n1) | Type::Class(n1) => match n1.view() {
                    Some(v1) => Subsumption::from_bool(self.structured_subtype(&v1, s2, ctx).holds),
                    None => Subsumption::no(),
                },
                _ => Subsumption::no(),
            },

            Type::Array(e2) => match t1 {
                Type::Array(e1) => Subsumption::from_bool(self.equal_in(e1, e2, ctx)),
                _ => Subsumption::no(),
            },

            Type::IndexMap(k2, v2) => match t1 {
                Type::IndexMap(k1, v1) => {
                    Subsumption::from_bool(self.equal_in(k1, k2, ctx) && self.equal_in(v1, v2, ctx))
                }
                _ => Subsumption::no(),
            },

            Type::Class(n2) => match t1 {
                Type::Class(n1) => Subsumption::from_bool(n1 == n2),
                _ => Subsumption::no(),
            },

            Type::Arrow(_) => Subsumption::from_bool(self.arrow_subtype(t1, t2, ctx)),

            Type::Just(b2) => match t1 {
                Type::Just(b1) => self.subtype_in(b1, b2, ctx),
                _ => self.subtype_in(t1, b2, ctx),
            },

            Type::Un => Subsumption::no(),
        }
    }

    /// `t1`'s prototype is on `t2`'s prototype chain.
    fn instance_derives(&self, n1: &Named, n2: &Named) -> bool {
        if n1 == n2 {
            return true;
        }

        let proto_of = |n: &Named| n.body().and_then(|b| b.prototype.clone());
        if let (Some(p1), Some(p2)) = (proto_of(n1), proto_of(n2)) {
            return p1.derives_from(&p2);
        }

        // no backing constructors, fall back to declared bases
        let mut seen = smallvec::SmallVec::<[Name; 4]>::new();
        let mut at = n1.clone();
        loop {
            let next = at.body().and_then(|b| b.extends.first().cloned());
            match next {
                Some(base) if &base == n2.name() => return true,
                Some(base) if !seen.contains(&base) => {
                    seen.push(base.clone());
                    match self.lookup(&base) {
                        Some(n) => at = n,
                        None => return false,
                    }
                }
                _ => return false,
            }
        }
    }

    fn interface_subtype(&self, n1: &Named, n2: &Named, ctx: &RelationCtx<'_>) -> Subsumption {
        if n1.extends(n2.name()) || n1 == n2 {
            return Subsumption::zero();
        }

        let key = RelationKey::subtype(n1, n2);
        if let Some(delta) = self.recall(&key) {
            return Subsumption { holds: true, delta };
        }
        if ctx.assumes(&key) {
            return Subsumption::zero();
        }

        let (Some(v1), Some(v2)) = (n1.view(), n2.view()) else {
            return Subsumption::no();
        };

        // a proof that leaned on an outer assumption is only as good as
        // that assumption, so only top-level results are kept
        let inner = ctx.assuming(key.clone());
        let r = self.structured_subtype(&v1, &v2, &inner);
        if r.holds && ctx.is_root() {
            self.remember(key, r.delta.clone());
        }
        r
    }

    fn instance_implements(&self, n1: &Named, n2: &Named, ctx: &RelationCtx<'_>) -> Subsumption {
        if n1.implements(n2.name()) {
            return Subsumption::zero();
        }

        let key = RelationKey::subtype(n1, n2);
        if self.recall(&key).is_some() || ctx.assumes(&key) {
            return Subsumption::zero();
        }

        let (Some(v1), Some(v2)) = (n1.view(), n2.view()) else {
            return Subsumption::no();
        };

        let inner = ctx.assuming(key.clone());
        if self.structured_subtype(&v1, &v2, &inner).holds {
            if ctx.is_root() {
                self.remember(key, None);
            }
            Subsumption::zero()
        } else {
            Subsumption::no()
        }
    }

    /// Width subtyping with invariant fields. Any member of `s1` that `s2`
    /// does not mention is forgotten and becomes the delta.
    pub fn structured_subtype(
        &self,
        s1: &Structured,
        s2: &Structured,
        ctx: &RelationCtx<'_>,
    ) -> Subsumption {
        for (name, f2) in s2.fields.iter() {
            match s1.fields.get(name) {
                Some(f1) => {
                    if !self.equal_in(&f1.ty, &f2.ty, ctx) {
                        return Subsumption::no();
                    }
                }
                None if f2.optional || f2.rest => continue,
                None => return Subsumption::no(),
            }
        }

        for (name, m2) in s2.methods.iter() {
            match s1.methods.get(name) {
                Some(m1) if self.arrow_subtype(m1, m2, ctx) => (),
                _ => return Subsumption::no(),
            }
        }

        let mut forgotten = Structured::new();
        for (name, f1) in s1.fields.iter() {
            if !s2.fields.contains_key(name) {
                forgotten.fields.insert(name.clone(), f1.clone());
            }
        }
        for (name, m1) in s1.methods.iter() {
            if !s2.methods.contains_key(name) {
                forgotten.methods.insert(name.clone(), m1.clone());
            }
        }

        if forgotten.is_empty() {
            Subsumption::zero()
        } else {
            Subsumption::with(Type::record(forgotten))
        }
    }

    pub fn is_arrow_subtype(&self, a1: &Type, a2: &Type) -> bool {
        self.arrow_subtype(a1, a2, &RelationCtx::root())
    }

    /// Contravariant parameters, covariant result, both with zero delta.
    pub fn arrow_subtype(&self, a1: &Type, a2: &Type, ctx: &RelationCtx<'_>) -> bool {
        if a1.same(a2) {
            return true;
        }

        let (Type::Arrow(a1), Type::Arrow(a2)) = (a1, a2) else {
            return false;
        };

        if a1.params.len() != a2.params.len() || a1.mandatory != a2.mandatory {
            return false;
        }

        let params_ok = a1
            .params
            .iter()
            .zip(a2.params.iter())
            .all(|(p1, p2)| self.subtype_in(p2, p1, ctx).is_zero());
        if !params_ok {
            return false;
        }

        if !self.subtype_in(&a1.result, &a2.result, ctx).is_zero() {
            return false;
        }

        match (&a1.varargs, &a2.varargs) {
            (None, None) => true,
            (Some(v1), Some(v2)) => self.subtype_in(v2, v1, ctx).is_zero(),
            _ => false,
        }
    }

    pub fn equal_types(&self, t1: &Type, t2: &Type) -> bool {
        self.equal_in(t1, t2, &RelationCtx::root())
    }

    /// Two absent types are equal: callers pass `None` to mean "no constraint"
    /// on either side, e.g. two arrows that both lack varargs.
    pub fn equal_opt(&self, t1: Option<&Type>, t2: Option<&Type>, ctx: &RelationCtx<'_>) -> bool {
        match (t1, t2) {
            (None, None) => true,
            (Some(t1), Some(t2)) => self.equal_in(t1, t2, ctx),
            _ => false,
        }
    }

    pub fn equal_in(&self, t1: &Type, t2: &Type, ctx: &RelationCtx<'_>) -> bool {
        if t1.same(t2) {
            return true;
        }

        match (t1, t2) {
            (Type::Any, Type::Any) | (Type::Un, Type::Un) => true,
            (Type::Primitive(a), Type::Primitive(b)) => a == b,
            (Type::Structured(a), Type::Structured(b)) => self.structured_equal(a, b, ctx),
            (Type::Interface(a), Type::Interface(b)) => self.interface_equal(a, b, ctx),
            (Type::Instance(a), Type::Instance(b)) | (Type::Class(a), Type::Class(b)) => a == b,
            (Type::Array(a), Type::Array(b)) | (Type::Just(a), Type::Just(b)) => {
                self.equal_in(a, b, ctx)
            }
            (Type::IndexMap(ka, va), Type::IndexMap(kb, vb)) => {
                self.equal_in(ka, kb, ctx) && self.equal_in(va, vb, ctx)
            }
            (Type::Arrow(a), Type::Arrow(b)) => self.arrow_equal(a, b, ctx),
            _ => false,
        }
    }

    fn interface_equal(&self, n1: &Named, n2: &Named, ctx: &RelationCtx<'_>) -> bool {
        if n1 == n2 {
            return true;
        }

        let key = RelationKey::equal(n1, n2);
        if self.recall(&key).is_some() || ctx.assumes(&key) {
            return true;
        }

        let (Some(v1), Some(v2)) = (n1.view(), n2.view()) else {
            return false;
        };

        let inner = ctx.assuming(key.clone());
        let eq = self.structured_equal(&v1, &v2, &inner);
        if eq && ctx.is_root() {
            self.remember(key, None);
        }
        eq
    }

    fn structured_equal(&self, s1: &Structured, s2: &Structured, ctx: &RelationCtx<'_>) -> bool {
        if s1.fields.len() != s2.fields.len() || s1.methods.len() != s2.methods.len() {
            return false;
        }

        let fields_eq = s1.fields.iter().all(|(name, f1)| match s2.fields.get(name) {
            Some(f2) => f1.optional == f2.optional && self.equal_in(&f1.ty, &f2.ty, ctx),
            None => false,
        });

        fields_eq
            && s1.methods.iter().all(|(name, m1)| match s2.methods.get(name) {
                Some(m2) => self.equal_in(m1, m2, ctx),
                None => false,
            })
    }

    fn arrow_equal(&self, a1: &Arc<Arrow>, a2: &Arc<Arrow>, ctx: &RelationCtx<'_>) -> bool {
        a1.params.len() == a2.params.len()
            && a1.mandatory == a2.mandatory
            && a1.params.iter().zip(a2.params.iter()).all(|(p1, p2)| self.equal_in(p1, p2, ctx))
            && self.equal_in(&a1.result, &a2.result, ctx)
            && self.equal_opt(a1.varargs.as_ref(), a2.varargs.as_ref(), ctx)
    }
}

impl Prototype {
    /// Whether `other` is on this prototype's chain, itself included.
    pub fn derives_from(self: &Arc<Self>, other: &Arc<Prototype>) -> bool {
        let mut at = Some(self.clone());
        while let Some(p) = at {
            if Arc::ptr_eq(&p, other) {
                return true;
            }
            at = p.parent.clone();
        }
        false
    }
}
