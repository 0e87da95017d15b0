use crate::config::EngineConfig;
use crate::types::*;

/// One position of a tuple type as the checker declares it.
#[derive(Clone, Debug, PartialEq)]
pub struct TupleElement {
    pub ty: Type,
    pub optional: bool,
    /// `...T[]`; `ty` is the element type `T`.
    pub rest: bool,
    pub mutable: bool,
}

impl TupleElement {
    pub fn new(ty: Type) -> TupleElement {
        TupleElement {
            ty,
            optional: false,
            rest: false,
            mutable: true,
        }
    }

    pub fn optional(mut self) -> TupleElement {
        self.optional = true;
        self
    }

    pub fn rest(mut self) -> TupleElement {
        self.rest = true;
        self
    }

    pub fn readonly(mut self) -> TupleElement {
        self.mutable = false;
        self
    }
}

/// The record type of a tuple: one field per position, named `"0"`, `"1"`, ...
pub fn tuple_type(elements: &[TupleElement]) -> Type {
    let mut s = Structured::new();
    for (i, e) in elements.iter().enumerate() {
        s.fields.insert(
            i.to_string().into(),
            Field {
                ty: e.ty.clone(),
                optional: e.optional,
                mutable: e.mutable,
                rest: e.rest,
            },
        );
    }
    Type::record(s)
}

#[derive(Clone, Debug, PartialEq)]
pub struct TupleRelation {
    pub holds: bool,
    /// Positions the source has beyond the target. The checker passes these
    /// to the coercion it emits; `None` means no coercion is needed.
    pub delta: Option<Structured>,
}

impl TupleRelation {
    fn no() -> TupleRelation {
        TupleRelation { holds: false, delta: None }
    }
}

pub struct TupleChecker<'r> {
    registry: &'r TypeRegistry,
    config: &'r EngineConfig,
}

impl<'r> TupleChecker<'r> {
    pub fn new(registry: &'r TypeRegistry, config: &'r EngineConfig) -> TupleChecker<'r> {
        TupleChecker { registry, config }
    }

    /// Whether a `t1` tuple may be assigned where a `t2` tuple is expected.
    ///
    /// Each position needs a zero-delta element subtype, and a mutable
    /// target position needs a mutable source position.
    /// Optional positions of `t2` may be missing from `t1` only when
    /// `fresh` (the source is a literal being checked in gradual mode);
    /// rest positions may always be missing.
    pub fn tuple_subtyping(&self, t1: &Structured, t2: &Structured, fresh: bool) -> TupleRelation {
        for (name, f2) in t2.fields.iter() {
            match t1.fields.get(name) {
                Some(f1) => {
                    let compatible = (f1.mutable || !f2.mutable)
                        && self.registry.subtype(&f1.ty, &f2.ty).is_zero();
                    if !compatible {
                        tracing::debug!(
                            "tuple position {name}: {} is not assignable to {}",
                            f1.ty,
                            f2.ty
                        );
                        return TupleRelation::no();
                    }
                }
                None if f2.rest => continue,
                None if f2.optional && fresh => continue,
                None => {
                    tracing::debug!("tuple position {name} is missing");
                    return TupleRelation::no();
                }
            }
        }

        if self.config.zero_delta_tuples {
            return TupleRelation { holds: true, delta: None };
        }

        let mut extra = Structured::new();
        for (name, f1) in t1.fields.iter() {
            if !t2.fields.contains_key(name) {
                extra.fields.insert(name.clone(), f1.clone());
            }
        }
        for (name, m1) in t1.methods.iter() {
            if !t2.methods.contains_key(name) {
                extra.methods.insert(name.clone(), m1.clone());
            }
        }

        TupleRelation {
            holds: true,
            delta: if extra.is_empty() { None } else { Some(extra) },
        }
    }

    /// [`TupleChecker::tuple_subtyping`] on two tuple record types.
    pub fn tuple_types(&self, t1: &Type, t2: &Type, fresh: bool) -> TupleRelation {
        match (t1, t2) {
            (Type::Structured(s1), Type::Structured(s2)) => self.tuple_subtyping(s1, s2, fresh),
            _ => TupleRelation::no(),
        }
    }
}
