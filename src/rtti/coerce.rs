//! Tag combination and the coercion gate.
//!
//! A value's tag together with the static type it is viewed through must
//! always describe it soundly. `combine` folds static knowledge into a tag,
//! `shallow_tag` records a delta on a value, and `check_and_tag` verifies a
//! value as it crosses from one static view into another.

use std::sync::Arc;

use itertools::Itertools;

use super::value::{Key, Value};
use super::Runtime;
use crate::errors::{InvariantViolation, RttiResult, TypeViolation};
use crate::types::*;

impl Runtime {
    /// The most precise type obtainable by folding `st` into `tag`.
    pub fn combine(&self, tag: &Type, st: &Type) -> RttiResult<Type> {
        if st.is_dotted() {
            return Err(InvariantViolation::DottedSource { source_ty: st.to_string() }.into());
        }

        if tag.is_any() {
            return Ok(st.clone());
        }

        match st {
            Type::Any
            | Type::Primitive(_)
            | Type::Array(_)
            | Type::Instance(_)
            | Type::IndexMap(_, _)
            | Type::Class(_)
            | Type::Arrow(_) => Ok(tag.clone()),

            Type::Interface(ns) => match tag {
                Type::Interface(nt) => {
                    let related = nt == ns
                        || nt.extends(ns.name())
                        || self.registry().recall(&RelationKey::subtype(nt, ns)).is_some();
                    if related {
                        return Ok(tag.clone());
                    }

                    let vt = self.registry().view(nt)?;
                    let vs = self.registry().view(ns)?;
                    Ok(Type::Structured(merge(vt, &vs)))
                }
                Type::Structured(ts) => {
                    let vs = self.registry().view(ns)?;
                    Ok(Type::Structured(merge(ts.clone(), &vs)))
                }
                _ => Ok(tag.clone()),
            },

            Type::Structured(ss) => match tag {
                Type::Structured(ts) => Ok(Type::Structured(merge(ts.clone(), ss))),
                Type::Interface(nt) => {
                    let vt = self.registry().view(nt)?;
                    Ok(Type::Structured(merge(vt, ss)))
                }
                _ => Ok(tag.clone()),
            },

            Type::Just(_) | Type::Un => unreachable!("rejected above"),
        }
    }

    /// Records `delta` on `value` without descending into it.
    pub fn shallow_tag(&self, value: Value, delta: Option<&Type>) -> RttiResult<Value> {
        let delta = match delta {
            Some(d) if !value.is_nullish() => d,
            _ => return Ok(value),
        };

        match delta {
            Type::Any | Type::Primitive(_) | Type::Instance(_) | Type::Arrow(_) => Ok(value),

            // tag-invariant containers: the delta is the whole story
            Type::Array(_) | Type::IndexMap(_, _) | Type::Class(_) => {
                value.set_tag(delta.clone());
                Ok(value)
            }

            Type::Interface(_) | Type::Structured(_) => {
                if value.as_object().is_none() {
                    return Ok(value);
                }

                let current = value.rtti();
                if matches!(current, Type::Instance(_) | Type::Interface(_)) {
                    return Ok(value);
                }

                let widened = self.combine(&current, delta)?;
                if !widened.same(&current) {
                    tracing::trace!("widening tag {current} to {widened}");
                    value.set_tag(widened);
                }
                Ok(value)
            }

            Type::Just(_) | Type::Un => Err(InvariantViolation::CoercionTarget {
                target: delta.to_string(),
            }
            .into()),
        }
    }

    /// The coercion gate: verifies that `value`, statically known as `from`,
    /// may be viewed as `to`, and records whatever the tag must remember.
    pub fn check_and_tag(&self, value: Value, from: &Type, to: &Type) -> RttiResult<Value> {
        if value.is_nullish() {
            return Ok(value);
        }

        if from.is_dotted() {
            return Err(InvariantViolation::DottedSource {
                source_ty: from.to_string(),
            }
            .into());
        }

        match to {
            Type::Primitive(p) => {
                let actual = value.rtti();
                if actual.is_primitive(*p) {
                    Ok(value)
                } else {
                    Err(mismatch(&actual, to))
                }
            }

            Type::Any => {
                if self.config().widen_on_any {
                    let absorbed = self.registry().subtype(from, &Type::Any);
                    self.shallow_tag(value, absorbed.delta.as_ref())
                } else {
                    Ok(value)
                }
            }

            Type::Instance(n) => {
                let by_tag = matches!(value.tag(), Some(Type::Instance(m)) if m.name() == n.name());
                if by_tag || self.instance_of(&value, n) {
                    Ok(value)
                } else {
                    Err(TypeViolation::InstanceCheckFailed {
                        actual: value.rtti().to_string(),
                        expected: to.to_string(),
                    }
                    .into())
                }
            }

            Type::Array(_) | Type::Class(_) | Type::IndexMap(_, _) => {
                let working = value.tag().unwrap_or_else(|| from.clone());
                if self.registry().equal_types(&working, to) {
                    Ok(value)
                } else {
                    Err(TypeViolation::FixedTypeMismatch {
                        actual: working.to_string(),
                        expected: to.to_string(),
                    }
                    .into())
                }
            }

            Type::Interface(n) => {
                let current = value.rtti();
                match &current {
                    Type::Instance(_) => {
                        if self.registry().subtype(&current, to).is_zero() {
                            Ok(value)
                        } else {
                            Err(TypeViolation::SubtypeRequired {
                                actual: current.to_string(),
                                expected: to.to_string(),
                            }
                            .into())
                        }
                    }
                    Type::Interface(m)
                        if m == n
                            || m.extends(n.name())
                            || self.registry().recall(&RelationKey::subtype(m, n)).is_some() =>
                    {
                        Ok(value)
                    }
                    _ => {
                        let view = self.registry().view(n)?;
                        self.check_and_tag(value, from, &Type::Structured(view))
                    }
                }
            }

            Type::Structured(s) => self.check_structured(value, from, to, s),

            Type::Just(base) => self.check_and_tag(value, from, base),

            Type::Un | Type::Arrow(_) => {
                Err(InvariantViolation::CoercionTarget { target: to.to_string() }.into())
            }
        }
    }

    fn check_structured(
        &self,
        value: Value,
        from: &Type,
        to: &Type,
        target: &Structured,
    ) -> RttiResult<Value> {
        let curr = self.combine(&value.rtti(), from)?;

        let direct = self.registry().subtype(&curr, to);
        if direct.holds {
            return self.shallow_tag(value, direct.delta.as_ref());
        }

        let fixed = || TypeViolation::StructuredFromFixedType {
            actual: curr.to_string(),
            expected: to.to_string(),
        };

        if value.as_object().is_none() {
            return Err(fixed().into());
        }

        let curr_view = match &curr {
            Type::Structured(s) => s.clone(),
            Type::Interface(n) => self.registry().view(n)?,
            Type::Any => Arc::new(Structured::new()),
            _ => return Err(fixed().into()),
        };

        let mut overlap = Structured {
            fields: Default::default(),
            methods: target.methods.clone(),
        };
        let mut fresh = Structured::new();

        for (name, field) in target.fields.iter() {
            match curr_view.fields.get(name) {
                Some(have) => {
                    if !self.registry().equal_types(&have.ty, &field.ty) {
                        return Err(TypeViolation::FieldOverlapMismatch {
                            field: name.clone(),
                            actual: have.ty.to_string(),
                            expected: field.ty.to_string(),
                        }
                        .into());
                    }
                    overlap.fields.insert(name.clone(), field.clone());
                }
                None => {
                    fresh.fields.insert(name.clone(), field.clone());
                }
            }
        }

        let partial = self
            .registry()
            .subtype(&Type::Structured(curr_view), &Type::record(overlap));
        if !partial.holds {
            return Err(TypeViolation::OverlapSubtypeFailure {
                actual: curr.to_string(),
                expected: to.to_string(),
            }
            .into());
        }

        let value = self.shallow_tag(value, partial.delta.as_ref())?;
        if fresh.is_empty() {
            return Ok(value);
        }

        // claim the new shape before descending, self-referential values
        // would otherwise be re-checked against an incomplete tag
        let value = self.shallow_tag(value, Some(&Type::record(fresh.clone())))?;

        for (name, field) in fresh.fields.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            let current = value.get(&Key::from_name(name));
            self.check_and_tag(current, &Type::Any, &field.ty)?;
        }

        Ok(value)
    }

    /// Native instance-of: the value's prototype chain reaches the backing
    /// constructor of `class`.
    pub fn instance_of(&self, value: &Value, class: &Named) -> bool {
        let target = class.body().and_then(|b| b.prototype.clone());
        match (value.proto(), target) {
            (Some(p), Some(t)) => p.derives_from(&t),
            _ => false,
        }
    }
}

/// Copies `incoming` into `tag`, cloning first whenever `tag` is shared, so
/// named views and other values' tags are never touched. Returns `tag` as is
/// when it already carries every incoming member.
fn merge(mut tag: Arc<Structured>, incoming: &Structured) -> Arc<Structured> {
    let covered = incoming.fields.iter().all(|(k, f)| tag.fields.get(k) == Some(f))
        && incoming.methods.iter().all(|(k, m)| tag.methods.get(k) == Some(m));
    if !covered {
        Arc::make_mut(&mut tag).absorb(incoming);
    }
    tag
}

fn mismatch(actual: &Type, expected: &Type) -> crate::errors::RttiError {
    TypeViolation::TypeMismatch {
        actual: actual.to_string(),
        expected: expected.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RttiError;

    fn point() -> Structured {
        Structured::new()
            .with_field("x", Field::new(Type::number()))
            .with_field("y", Field::new(Type::number()))
    }

    #[test]
    fn combine_with_any_takes_static() {
        let rt = Runtime::default();
        let p = Type::record(point());
        assert!(rt.combine(&Type::Any, &p).unwrap().same(&p));
    }

    #[test]
    fn combine_keeps_fixed_tags() {
        let rt = Runtime::default();
        let arr = Type::array(Type::number());
        assert!(rt.combine(&arr, &Type::record(point())).unwrap().same(&arr));
        assert_eq!(
            rt.combine(&Type::record(point()), &Type::number()).unwrap().kind(),
            TypeKind::Structured
        );
    }

    #[test]
    fn combine_never_mutates_named_views() {
        let rt = Runtime::default();
        let i = rt
            .registry()
            .register_type(NamedDef::interface("P", point()))
            .unwrap();
        let extra = Type::record(Structured::new().with_field("z", Field::new(Type::string())));

        let merged = rt.combine(&i, &extra).unwrap();
        assert_eq!(merged.to_string(), "{ x: number; y: number; z: string }");

        let view = rt.registry().view(i.named().unwrap()).unwrap();
        assert!(!view.fields.contains_key("z"));
    }

    #[test]
    fn combine_clones_shared_records() {
        let rt = Runtime::default();
        let shared = Type::record(point());
        let held_elsewhere = shared.clone();
        let extra = Type::record(Structured::new().with_field("z", Field::new(Type::string())));

        let merged = rt.combine(&shared, &extra).unwrap();
        assert!(!merged.same(&shared));
        assert_eq!(held_elsewhere.to_string(), "{ x: number; y: number }");
    }

    #[test]
    fn combine_rejects_dotted_static() {
        let rt = Runtime::default();
        let err = rt.combine(&Type::Any, &Type::just(Type::number())).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn shallow_tag_overwrites_containers() {
        let rt = Runtime::default();
        let v = rt.new_record(None, []);
        let arr = Type::array(Type::string());
        let v = rt.shallow_tag(v, Some(&arr)).unwrap();
        assert!(v.tag().unwrap().same(&arr));
    }

    #[test]
    fn shallow_tag_leaves_nominal_tags() {
        let rt = Runtime::default();
        let i = rt.registry().register_type(NamedDef::interface("P", point())).unwrap();
        let v = rt.new_record(None, [("x", Value::Number(1.0)), ("y", Value::Number(2.0))]);
        v.set_tag(i.clone());

        let extra = Type::record(Structured::new().with_field("z", Field::new(Type::string())));
        let v = rt.shallow_tag(v, Some(&extra)).unwrap();
        assert!(v.tag().unwrap().same(&i));
    }

    #[test]
    fn shallow_tag_zero_delta_and_nullish_are_noops() {
        let rt = Runtime::default();
        let v = rt.new_record(None, []);
        let v = rt.shallow_tag(v, None).unwrap();
        assert!(v.tag().is_none());
        assert_eq!(rt.shallow_tag(Value::Null, Some(&Type::record(point()))).unwrap(), Value::Null);
    }

    #[test]
    fn shallow_tag_rejects_dotted() {
        let rt = Runtime::default();
        let v = rt.new_record(None, []);
        assert!(rt.shallow_tag(v, Some(&Type::Un)).unwrap_err().is_internal());
    }

    #[test]
    fn primitive_target_names_both_types() {
        let rt = Runtime::default();
        let err = rt.check_and_tag(Value::str("8"), &Type::Any, &Type::number()).unwrap_err();
        match err {
            RttiError::User(TypeViolation::TypeMismatch { actual, expected }) => {
                assert_eq!(actual, "string");
                assert_eq!(expected, "number");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rt.check_and_tag(Value::Number(5.0), &Type::Any, &Type::number()).is_ok());
    }

    #[test]
    fn nullish_passes_every_target() {
        let rt = Runtime::default();
        for to in [Type::number(), Type::record(point()), Type::array(Type::number())] {
            assert_eq!(
                rt.check_and_tag(Value::Undefined, &Type::Any, &to).unwrap(),
                Value::Undefined
            );
        }
    }

    #[test]
    fn into_any_remembers_static_structure() {
        let rt = Runtime::default();
        let p = Type::record(point());
        let v = rt.new_record(None, [("x", Value::Number(1.0)), ("y", Value::Number(2.0))]);

        let v = rt.check_and_tag(v, &p, &Type::Any).unwrap();
        assert_eq!(v.tag(), Some(p));
    }

    #[test]
    fn fixed_targets_need_equality() {
        let rt = Runtime::default();
        let v = rt.new_array(Type::number(), vec![Value::Number(1.0)]);
        assert!(rt.check_and_tag(v.clone(), &Type::Any, &Type::array(Type::number())).is_ok());

        let err = rt.check_and_tag(v, &Type::Any, &Type::array(Type::Any)).unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::FixedTypeMismatch { .. })));

        // untagged falls back to the static type
        let raw = rt.new_record(None, []);
        assert!(rt
            .check_and_tag(raw, &Type::array(Type::string()), &Type::array(Type::string()))
            .is_ok());
    }

    fn register_point(rt: &Runtime) -> (Type, Type) {
        let mut def = ClassDef::new("Point", Arc::new(crate::rtti::Prototype::new("Point")));
        def.fields = point();
        let class = rt.registry().register_class(def).unwrap();
        let instance = Type::Instance(rt.registry().lookup("Point").unwrap());
        (instance, class)
    }

    #[test]
    fn instances_need_a_zero_delta_subtype_of_the_interface() {
        let rt = Runtime::default();
        let (instance, _) = register_point(&rt);
        let has_x = rt
            .registry()
            .register_type(NamedDef::interface(
                "HasX",
                Structured::new().with_field("x", Field::new(Type::number())),
            ))
            .unwrap();
        let labelled = rt
            .registry()
            .register_type(NamedDef::interface(
                "Labelled",
                Structured::new().with_field("label", Field::new(Type::string())),
            ))
            .unwrap();

        let v = rt
            .new_instance(&instance, [("x", Value::Number(1.0)), ("y", Value::Number(2.0))])
            .unwrap();

        let v = rt.check_and_tag(v, &instance, &has_x).unwrap();
        assert_eq!(v.tag(), Some(instance.clone()));

        let err = rt.check_and_tag(v.clone(), &Type::Any, &labelled).unwrap_err();
        match err {
            RttiError::User(TypeViolation::SubtypeRequired { actual, expected }) => {
                assert_eq!(actual, "Point");
                assert_eq!(expected, "Labelled");
            }
            other => panic!("unexpected {other:?}"),
        }
        // the failed check leaves the tag alone
        assert_eq!(v.tag(), Some(instance));
    }

    #[test]
    fn class_targets_need_the_same_class() {
        let rt = Runtime::default();
        let (_, point_class) = register_point(&rt);
        let line_class = rt
            .registry()
            .register_class(ClassDef::new("Line", Arc::new(crate::rtti::Prototype::new("Line"))))
            .unwrap();

        let ctor = rt.new_record(None, []);
        ctor.set_tag(point_class.clone());
        assert!(rt.check_and_tag(ctor.clone(), &Type::Any, &point_class).is_ok());

        let err = rt.check_and_tag(ctor, &Type::Any, &line_class).unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::FixedTypeMismatch { .. })));

        let untagged = rt.new_record(None, []);
        let err = rt.check_and_tag(untagged, &Type::Any, &point_class).unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::FixedTypeMismatch { .. })));
    }

    #[test]
    fn dynamic_record_gains_structure() {
        let rt = Runtime::default();
        let v = rt.new_record(None, [("x", Value::Number(1.0)), ("y", Value::Number(2.0))]);
        let p = Type::record(point());

        let v = rt.check_and_tag(v, &Type::Any, &p).unwrap();
        assert_eq!(v.tag(), Some(p));
    }

    #[test]
    fn dynamic_record_field_is_checked() {
        let rt = Runtime::default();
        let v = rt.new_record(None, [("x", Value::Number(1.0)), ("y", Value::str("no"))]);

        let err = rt.check_and_tag(v, &Type::Any, &Type::record(point())).unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::TypeMismatch { .. })));
    }

    #[test]
    fn overlapping_fields_must_agree() {
        let rt = Runtime::default();
        let v = rt.new_record(
            Some(Structured::new().with_field("x", Field::new(Type::string()))),
            [("x", Value::str("a"))],
        );

        let err = rt.check_and_tag(v, &Type::Any, &Type::record(point())).unwrap_err();
        match err {
            RttiError::User(TypeViolation::FieldOverlapMismatch { field, .. }) => {
                assert_eq!(&*field, "x")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_methods_fail_overlap() {
        let rt = Runtime::default();
        let v = rt.new_record(None, []);
        let to = Type::record(Structured::new().with_method("run", Arrow::new([], Type::void())));

        let err = rt.check_and_tag(v, &Type::Any, &to).unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::OverlapSubtypeFailure { .. })));
    }

    #[test]
    fn fixed_values_cannot_take_structure() {
        let rt = Runtime::default();
        let v = rt.new_array(Type::number(), vec![]);
        let err = rt.check_and_tag(v, &Type::Any, &Type::record(point())).unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::StructuredFromFixedType { .. })));

        let err = rt
            .check_and_tag(Value::Number(1.0), &Type::Any, &Type::record(point()))
            .unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::StructuredFromFixedType { .. })));
    }

    #[test]
    fn self_referential_values_terminate() {
        let rt = Runtime::default();
        let node = rt.registry().named_type("Node", NamedKind::Interface).unwrap();
        rt.registry()
            .register_type(NamedDef::interface(
                "Node",
                Structured::new()
                    .with_field("v", Field::new(Type::number()))
                    .with_field("next", Field::new(Type::Interface(node.clone()))),
            ))
            .unwrap();

        let shape = Type::record(
            Structured::new()
                .with_field("v", Field::new(Type::number()))
                .with_field("next", Field::new(Type::Interface(node.clone()))),
        );

        let v = rt.new_record(None, [("v", Value::Number(1.0))]);
        v.put(&Key::from_name("next"), v.clone()).unwrap();

        let v = rt.check_and_tag(v, &Type::Any, &shape).unwrap();
        assert_eq!(v.tag(), Some(shape));
    }

    #[test]
    fn dotted_targets_and_sources_are_internal() {
        let rt = Runtime::default();
        let v = rt.new_record(None, []);
        assert!(rt.check_and_tag(v.clone(), &Type::Any, &Type::Un).unwrap_err().is_internal());
        assert!(rt
            .check_and_tag(v.clone(), &Type::just(Type::number()), &Type::Any)
            .unwrap_err()
            .is_internal());
        // Just as a target delegates to its base
        assert!(rt
            .check_and_tag(Value::Number(1.0), &Type::Any, &Type::just(Type::number()))
            .is_ok());
    }
}
