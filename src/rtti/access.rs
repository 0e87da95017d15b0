use std::sync::Arc;

use super::value::{Key, Value};
use super::Runtime;
use crate::errors::{InvariantViolation, RttiError, RttiResult, TypeViolation};
use crate::types::*;

/// Where a guarded access lands once the working type is known.
pub(crate) enum Slot {
    /// A declared field.
    Typed { ty: Type, mutable: bool },
    /// Nothing is known statically; reads are raw, writes unchecked.
    Dynamic,
    /// `length` of a string or an array.
    Length,
    /// Not in the working type's field table.
    Missing { working: Type },
}

impl Runtime {
    /// Members of `t` seen as a record, shared with the registry for named
    /// types. `None` for kinds without a field table.
    pub fn structural_view(&self, t: &Type) -> RttiResult<Option<Arc<Structured>>> {
        match t {
            Type::Structured(s) => Ok(Some(s.clone())),
            Type::Interface(n) | Type::Instance(n) | Type::Class(n) => {
                Ok(Some(self.registry().view(n)?))
            }
            Type::Any => Ok(Some(Arc::new(Structured::new()))),
            _ => Ok(None),
        }
    }

    pub(crate) fn guard_receiver(&self, obj: &Value, field: &Name) -> RttiResult<()> {
        if obj.is_nullish() {
            Err(TypeViolation::NullReceiver {
                field: field.clone(),
                receiver: obj.to_js_string(),
            }
            .into())
        } else {
            Ok(())
        }
    }

    pub(crate) fn resolve_slot(&self, obj: &Value, from: &Type, field: &Value) -> RttiResult<Slot> {
        let t = obj.tag().unwrap_or_else(|| from.clone());
        let name = Key::from_value(field).name();

        let not_numeric = |t: &Type| -> RttiError {
            TypeViolation::IndexNotNumeric {
                key: field.to_js_string(),
                ty: t.to_string(),
            }
            .into()
        };

        let slot = match &t {
            Type::Any => Slot::Dynamic,

            Type::Interface(n) | Type::Instance(n) | Type::Class(n) => {
                let view = self.registry().view(n)?;
                match view.member(&name) {
                    Some(Member::Field(f)) => Slot::Typed {
                        ty: f.ty.clone(),
                        mutable: f.mutable,
                    },
                    Some(Member::Method(_)) => {
                        return Err(TypeViolation::MethodAsField {
                            field: name,
                            ty: t.to_string(),
                        }
                        .into())
                    }
                    None => Slot::Missing { working: t.clone() },
                }
            }

            Type::Primitive(Primitive::String) => match field {
                _ if &*name == "length" => Slot::Length,
                Value::Number(_) => Slot::Typed {
                    ty: Type::string(),
                    mutable: false,
                },
                _ => Slot::Missing { working: t.clone() },
            },

            Type::Array(element) => match field {
                _ if &*name == "length" => Slot::Length,
                Value::Number(_) => Slot::Typed {
                    ty: (**element).clone(),
                    mutable: true,
                },
                _ => return Err(not_numeric(&t)),
            },

            Type::Structured(s) => {
                let fallback = match from {
                    Type::Structured(_)
                    | Type::Interface(_)
                    | Type::Instance(_)
                    | Type::Class(_) => self.structural_view(from)?,
                    _ => None,
                };

                let member = s
                    .member(&name)
                    .or_else(|| fallback.as_ref().and_then(|f| f.member(&name)));
                match member {
                    Some(Member::Field(f)) => Slot::Typed {
                        ty: f.ty.clone(),
                        mutable: f.mutable,
                    },
                    Some(Member::Method(_)) => {
                        return Err(TypeViolation::MethodAsField {
                            field: name,
                            ty: t.to_string(),
                        }
                        .into())
                    }
                    None => Slot::Missing { working: t.clone() },
                }
            }

            Type::IndexMap(key, value) => {
                if key.is_primitive(Primitive::Number) && !matches!(field, Value::Number(_)) {
                    return Err(not_numeric(&t));
                }
                Slot::Typed {
                    ty: (**value).clone(),
                    mutable: true,
                }
            }

            Type::Primitive(_) | Type::Arrow(_) => Slot::Missing { working: t.clone() },

            Type::Just(_) | Type::Un => {
                return Err(InvariantViolation::DottedSource {
                    source_ty: t.to_string(),
                }
                .into())
            }
        };

        if let Slot::Typed { ty, .. } = &slot {
            if ty.is_dotted() {
                return Err(InvariantViolation::DottedFieldAccess {
                    field: name,
                    ty: ty.to_string(),
                }
                .into());
            }
        }

        Ok(slot)
    }

    /// `obj[field]` through the static view `from`.
    pub fn read_field(&self, obj: &Value, from: &Type, field: &Value) -> RttiResult<Value> {
        let key = Key::from_value(field);
        self.guard_receiver(obj, &key.name())?;

        match self.resolve_slot(obj, from, field)? {
            Slot::Typed { ty, .. } => self.shallow_tag(obj.get(&key), Some(&ty)),
            Slot::Length | Slot::Dynamic | Slot::Missing { .. } => Ok(obj.get(&key)),
        }
    }

    /// `obj[field] = value`, where `value` is statically known as `value_ty`.
    /// Returns the stored value, tagged as the slot requires.
    pub fn write_field(
        &self,
        obj: &Value,
        from: &Type,
        field: &Value,
        value: Value,
        value_ty: &Type,
    ) -> RttiResult<Value> {
        let key = Key::from_value(field);
        self.guard_receiver(obj, &key.name())?;

        let stored = match self.resolve_slot(obj, from, field)? {
            Slot::Typed { ty, mutable } => {
                if !mutable {
                    return Err(TypeViolation::ImmutableField {
                        field: key.name(),
                        ty: obj.rtti().to_string(),
                    }
                    .into());
                }
                if ty.is_any() {
                    value
                } else {
                    self.check_and_tag(value, value_ty, &ty)?
                }
            }
            Slot::Dynamic => value,
            Slot::Length => {
                return Err(TypeViolation::ImmutableField {
                    field: key.name(),
                    ty: obj.rtti().to_string(),
                }
                .into())
            }
            Slot::Missing { working } => {
                tracing::debug!("rejecting write of {} outside {working}", key.name());
                return Err(TypeViolation::UnknownField {
                    field: key.name(),
                    ty: working.to_string(),
                }
                .into());
            }
        };

        obj.put(&key, stored.clone())?;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtti::value::Prototype;

    fn point() -> Structured {
        Structured::new()
            .with_field("x", Field::new(Type::number()))
            .with_field("y", Field::new(Type::number()).readonly())
    }

    #[test]
    fn nullish_receivers_are_rejected() {
        let rt = Runtime::default();
        for obj in [Value::Null, Value::Undefined] {
            let err = rt.read_field(&obj, &Type::Any, &Value::str("x")).unwrap_err();
            assert!(matches!(err, RttiError::User(TypeViolation::NullReceiver { .. })));
        }
        let err = rt
            .write_field(
                &Value::Null,
                &Type::Any,
                &Value::str("x"),
                Value::Number(1.0),
                &Type::number(),
            )
            .unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::NullReceiver { .. })));
    }

    #[test]
    fn last_array_index_is_refused_without_growing() {
        let rt = Runtime::default();
        let arr = rt.new_array(Type::number(), vec![Value::Number(1.0)]);
        let err = rt
            .write_field(
                &arr,
                &Type::Any,
                &Value::Number(4294967295.0),
                Value::Number(2.0),
                &Type::number(),
            )
            .unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::IndexOutOfRange { len: 1, .. })));
        assert_eq!(
            rt.read_field(&arr, &Type::Any, &Value::str("length")).unwrap(),
            Value::Number(1.0)
        );
    }

    #[test]
    fn dynamic_reads_and_writes() {
        let rt = Runtime::default();
        let o = rt.new_record(None, [("a", Value::Number(1.0))]);

        assert_eq!(rt.read_field(&o, &Type::Any, &Value::str("a")).unwrap(), Value::Number(1.0));
        rt.write_field(&o, &Type::Any, &Value::str("b"), Value::str("x"), &Type::string())
            .unwrap();
        assert_eq!(o.get(&Key::from_name("b")), Value::str("x"));
    }

    #[test]
    fn structured_writes_are_checked() {
        let rt = Runtime::default();
        let o = rt.new_record(
            Some(point()),
            [("x", Value::Number(1.0)), ("y", Value::Number(2.0))],
        );

        rt.write_field(&o, &Type::Any, &Value::str("x"), Value::Number(3.0), &Type::number())
            .unwrap();
        assert_eq!(o.get(&Key::from_name("x")), Value::Number(3.0));

        let err = rt
            .write_field(&o, &Type::Any, &Value::str("x"), Value::str("3"), &Type::Any)
            .unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::TypeMismatch { .. })));
        assert_eq!(o.get(&Key::from_name("x")), Value::Number(3.0));

        let err = rt
            .write_field(&o, &Type::Any, &Value::str("y"), Value::Number(0.0), &Type::number())
            .unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::ImmutableField { .. })));

        let err = rt
            .write_field(&o, &Type::Any, &Value::str("z"), Value::Number(0.0), &Type::number())
            .unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::UnknownField { .. })));
    }

    #[test]
    fn structured_falls_back_to_static_view() {
        let rt = Runtime::default();
        let o = rt.new_record(
            Some(Structured::new().with_field("x", Field::new(Type::number()))),
            [("x", Value::Number(1.0)), ("y", Value::Number(2.0))],
        );

        let from = Type::record(point());
        let err = rt
            .write_field(&o, &from, &Value::str("y"), Value::Number(0.0), &Type::number())
            .unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::ImmutableField { .. })));
        assert_eq!(rt.read_field(&o, &from, &Value::str("y")).unwrap(), Value::Number(2.0));
    }

    #[test]
    fn reads_tag_the_result() {
        let rt = Runtime::default();
        let inner = rt.new_record(None, [("x", Value::Number(1.0)), ("y", Value::Number(2.0))]);
        let outer = rt.new_record(
            Some(Structured::new().with_field("p", Field::new(Type::record(point())))),
            [("p", inner.clone())],
        );

        let p = rt.read_field(&outer, &Type::Any, &Value::str("p")).unwrap();
        assert_eq!(p, inner);
        assert_eq!(inner.tag(), Some(Type::record(point())));
    }

    #[test]
    fn nominal_views_reject_methods_as_fields() {
        let rt = Runtime::default();
        let proto = Arc::new(Prototype::new("C"));
        let mut def = ClassDef::new("C", proto);
        def.fields = Structured::new().with_field("n", Field::new(Type::number()));
        def.methods = Structured::new().with_method("m", Arrow::new([], Type::void()));
        rt.registry().register_class(def).unwrap();

        let c = rt.registry().lookup("C").unwrap();
        let obj = rt.new_instance(&Type::Instance(c), [("n", Value::Number(4.0))]).unwrap();

        assert_eq!(rt.read_field(&obj, &Type::Any, &Value::str("n")).unwrap(), Value::Number(4.0));
        let err = rt.read_field(&obj, &Type::Any, &Value::str("m")).unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::MethodAsField { .. })));
    }

    #[test]
    fn arrays_need_numeric_indices() {
        let rt = Runtime::default();
        let arr = rt.new_array(Type::number(), vec![Value::Number(1.0), Value::Number(2.0)]);

        assert_eq!(
            rt.read_field(&arr, &Type::Any, &Value::Number(1.0)).unwrap(),
            Value::Number(2.0)
        );
        assert_eq!(
            rt.read_field(&arr, &Type::Any, &Value::str("length")).unwrap(),
            Value::Number(2.0)
        );

        let err = rt.read_field(&arr, &Type::Any, &Value::str("1")).unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::IndexNotNumeric { .. })));

        let err = rt
            .write_field(&arr, &Type::Any, &Value::Number(0.0), Value::str("a"), &Type::string())
            .unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::TypeMismatch { .. })));

        let err = rt
            .write_field(
                &arr,
                &Type::Any,
                &Value::str("length"),
                Value::Number(0.0),
                &Type::number(),
            )
            .unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::ImmutableField { .. })));
    }

    #[test]
    fn string_length_and_indexing() {
        let rt = Runtime::default();
        let s = Value::str("abc");
        assert_eq!(
            rt.read_field(&s, &Type::Any, &Value::str("length")).unwrap(),
            Value::Number(3.0)
        );
        assert_eq!(rt.read_field(&s, &Type::Any, &Value::Number(1.0)).unwrap(), Value::str("b"));
    }

    #[test]
    fn index_maps_branch_on_key_type() {
        let rt = Runtime::default();
        let entries = vec![("a".to_owned(), Value::Number(1.0))];
        let by_name = rt.new_map(Type::string(), Type::number(), entries);
        assert_eq!(
            rt.read_field(&by_name, &Type::Any, &Value::str("a")).unwrap(),
            Value::Number(1.0)
        );
        rt.write_field(&by_name, &Type::Any, &Value::str("b"), Value::Number(2.0), &Type::number())
            .unwrap();

        let by_num = rt.new_map(Type::number(), Type::string(), vec![]);
        let err = rt
            .write_field(&by_num, &Type::Any, &Value::str("k"), Value::str("v"), &Type::string())
            .unwrap_err();
        assert!(matches!(err, RttiError::User(TypeViolation::IndexNotNumeric { .. })));
    }

    #[test]
    fn dotted_field_types_are_internal() {
        let rt = Runtime::default();
        let o = rt.new_record(
            Some(Structured::new().with_field("j", Field::new(Type::just(Type::number())))),
            [("j", Value::Number(1.0))],
        );
        let err = rt.read_field(&o, &Type::Any, &Value::str("j")).unwrap_err();
        assert!(matches!(err, RttiError::Internal(InvariantViolation::DottedFieldAccess { .. })));
    }
}
