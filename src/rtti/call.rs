use std::sync::Arc;

use super::value::{Key, NativeFn, Value};
use super::Runtime;
use crate::errors::{MaxArity, RttiResult, TypeViolation};
use crate::types::*;

impl Runtime {
    /// Signature of `name` on `obj`: from the tag, then the method table of
    /// `any`, then `from`, then the callable's own tag.
    pub fn resolve_method(&self, obj: &Value, from: &Type, name: &str) -> RttiResult<Arc<Arrow>> {
        let tag = obj.rtti();

        let mut tables = Vec::with_capacity(3);
        match &tag {
            Type::Primitive(_) => tables.push(self.registry().wrapper_methods(Wrapper::of(&tag))),
            other => tables.extend(self.structural_view(other)?),
        }
        tables.push(self.registry().wrapper_methods(Wrapper::Object));
        if !from.same(&tag) {
            tables.extend(self.structural_view(from)?);
        }

        for table in tables.iter() {
            match table.member(name) {
                Some(Member::Method(sig)) => return as_arrow(sig, name, &tag),
                Some(Member::Field(f)) => {
                    return call_signature(&f.ty).ok_or_else(|| not_callable(name, &tag))
                }
                None => continue,
            }
        }

        // an untyped property that holds a typed function value
        if name != CALL {
            let prop = obj.get(&Key::from_name(name));
            if let Some(sig) = prop.tag().as_ref().and_then(call_signature) {
                return Ok(sig);
            }
        }

        Err(TypeViolation::UnknownMethod {
            method: name.into(),
            ty: tag.to_string(),
        }
        .into())
    }

    fn method_impl(&self, obj: &Value, name: &str) -> Option<NativeFn> {
        obj.method_impl(name).or_else(|| self.native_for(obj, name))
    }

    fn invoke(
        &self,
        receiver: &Value,
        this: &Value,
        from: &Type,
        name: &str,
        args: &[Value],
        arg_types: &[Type],
    ) -> RttiResult<Value> {
        self.guard_receiver(receiver, &name.into())?;

        let sig = self.resolve_method(receiver, from, name)?;
        let f = self
            .method_impl(receiver, name)
            .ok_or_else(|| not_callable(name, &receiver.rtti()))?;

        let found = args.len();
        let too_many = sig.varargs.is_none() && found > sig.params.len();
        if found < sig.mandatory || too_many {
            let max = match sig.varargs {
                Some(_) => MaxArity::Unbounded,
                None => MaxArity::Bounded(sig.params.len()),
            };
            return Err(TypeViolation::ArityMismatch {
                mandatory: sig.mandatory,
                max,
                found,
            }
            .into());
        }

        let mut coerced = Vec::with_capacity(found);
        for (i, arg) in args.iter().enumerate() {
            let param = sig.params.get(i).or(sig.varargs.as_ref()).unwrap_or(&Type::Any);
            let arg_ty = arg_types.get(i).unwrap_or(&Type::Any);
            coerced.push(self.check_and_tag(arg.clone(), arg_ty, param)?);
        }

        tracing::trace!("calling {name} with {} arguments", coerced.len());
        let result = f(this, &coerced)?;
        self.shallow_tag(result, Some(&sig.result))
    }

    /// `obj.name(args...)` through the static view `from`. `arg_types` are the
    /// static types of the arguments; missing entries are read as `any`.
    pub fn call_method(
        &self,
        obj: &Value,
        from: &Type,
        name: &str,
        args: &[Value],
        arg_types: &[Type],
    ) -> RttiResult<Value> {
        self.invoke(obj, obj, from, name, args, arg_types)
    }

    /// `f(args...)` for a function value statically known as `from`.
    pub fn call_function(
        &self,
        f: &Value,
        from: &Type,
        args: &[Value],
        arg_types: &[Type],
    ) -> RttiResult<Value> {
        self.invoke(f, &Value::Undefined, from, CALL, args, arg_types)
    }

    pub fn call_method_n<const N: usize>(
        &self,
        obj: &Value,
        from: &Type,
        name: &str,
        args: [Value; N],
        arg_types: [Type; N],
    ) -> RttiResult<Value> {
        self.call_method(obj, from, name, &args, &arg_types)
    }

    pub fn call_function_n<const N: usize>(
        &self,
        f: &Value,
        from: &Type,
        args: [Value; N],
        arg_types: [Type; N],
    ) -> RttiResult<Value> {
        self.call_function(f, from, &args, &arg_types)
    }
}

/// The signature recorded by a function type, `{ <call>(..) }`.
fn call_signature(t: &Type) -> Option<Arc<Arrow>> {
    match t {
        Type::Structured(s) => match s.methods.get(CALL) {
            Some(Type::Arrow(a)) => Some(a.clone()),
            _ => None,
        },
        Type::Arrow(a) => Some(a.clone()),
        _ => None,
    }
}

fn as_arrow(sig: &Type, name: &str, receiver: &Type) -> RttiResult<Arc<Arrow>> {
    match sig {
        Type::Arrow(a) => Ok(a.clone()),
        other => call_signature(other).ok_or_else(|| not_callable(name, receiver)),
    }
}

fn not_callable(name: &str, ty: &Type) -> crate::errors::RttiError {
    TypeViolation::NotCallable {
        method: name.into(),
        ty: ty.to_string(),
    }
    .into()
}
