//! Compound assignment and increment through a guarded field.

use super::access::Slot;
use super::value::{Key, Value};
use super::Runtime;
use crate::errors::{RttiResult, TypeViolation};
use crate::types::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum BinOp {
    #[strum(serialize = "+=")]
    Add,
    #[strum(serialize = "-=")]
    Sub,
    #[strum(serialize = "*=")]
    Mul,
    #[strum(serialize = "/=")]
    Div,
    #[strum(serialize = "%=")]
    Rem,
    #[strum(serialize = "&=")]
    BitAnd,
    #[strum(serialize = "|=")]
    BitOr,
    #[strum(serialize = "^=")]
    BitXor,
    #[strum(serialize = "<<=")]
    Shl,
    #[strum(serialize = ">>=")]
    Shr,
    #[strum(serialize = ">>>=")]
    UShr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Inc,
    Dec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fixity {
    Prefix,
    Postfix,
}

impl BinOp {
    /// The native operator, with JS coercions.
    pub fn apply(self, lhs: &Value, rhs: &Value) -> Value {
        let stringy = |v: &Value| matches!(v, Value::Str(_) | Value::Object(_));
        let concat = |a: &Value, b: &Value| stringy(a) || stringy(b);

        let n = match self {
            BinOp::Add if concat(lhs, rhs) => {
                return Value::str(&format!("{}{}", lhs.to_js_string(), rhs.to_js_string()));
            }
            BinOp::Add => lhs.to_number() + rhs.to_number(),
            BinOp::Sub => lhs.to_number() - rhs.to_number(),
            BinOp::Mul => lhs.to_number() * rhs.to_number(),
            BinOp::Div => lhs.to_number() / rhs.to_number(),
            BinOp::Rem => lhs.to_number() % rhs.to_number(),
            BinOp::BitAnd => (to_int32(lhs) & to_int32(rhs)) as f64,
            BinOp::BitOr => (to_int32(lhs) | to_int32(rhs)) as f64,
            BinOp::BitXor => (to_int32(lhs) ^ to_int32(rhs)) as f64,
            BinOp::Shl => to_int32(lhs).wrapping_shl(shift_count(rhs)) as f64,
            BinOp::Shr => to_int32(lhs).wrapping_shr(shift_count(rhs)) as f64,
            BinOp::UShr => to_uint32(lhs).wrapping_shr(shift_count(rhs)) as f64,
        };
        Value::Number(n)
    }

    fn numeric_only(self) -> bool {
        self != BinOp::Add
    }
}

fn to_uint32(v: &Value) -> u32 {
    let n = v.to_number();
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(4_294_967_296.0) as u32
}

fn to_int32(v: &Value) -> i32 {
    to_uint32(v) as i32
}

fn shift_count(v: &Value) -> u32 {
    to_uint32(v) & 31
}

impl Runtime {
    /// Field type of an arithmetic target, which must be writable.
    fn arithmetic_slot(&self, obj: &Value, from: &Type, field: &Value) -> RttiResult<Type> {
        let key = Key::from_value(field);
        self.guard_receiver(obj, &key.name())?;

        match self.resolve_slot(obj, from, field)? {
            Slot::Typed { ty, mutable: true } => Ok(ty),
            Slot::Dynamic => Ok(Type::Any),
            Slot::Typed { .. } | Slot::Length => Err(TypeViolation::ImmutableField {
                field: key.name(),
                ty: obj.rtti().to_string(),
            }
            .into()),
            Slot::Missing { working } => Err(TypeViolation::UnknownField {
                field: key.name(),
                ty: working.to_string(),
            }
            .into()),
        }
    }

    fn store_result(
        &self,
        obj: &Value,
        field: &Value,
        field_ty: &Type,
        result: Value,
    ) -> RttiResult<Value> {
        let result = if field_ty.is_primitive(Primitive::Number) {
            self.check_and_tag(result, &Type::Any, field_ty)?
        } else {
            result
        };
        obj.put(&Key::from_value(field), result.clone())?;
        Ok(result)
    }

    /// `obj[field] op= rhs`. Yields the stored value.
    pub fn assign_op(
        &self,
        obj: &Value,
        from: &Type,
        field: &Value,
        op: BinOp,
        rhs: Value,
    ) -> RttiResult<Value> {
        let field_ty = self.arithmetic_slot(obj, from, field)?;

        let numeric = field_ty.is_any() || field_ty.is_primitive(Primitive::Number);
        let concatenating = !op.numeric_only() && field_ty.is_primitive(Primitive::String);
        if !numeric && !concatenating {
            return Err(TypeViolation::NonNumericOperand {
                field: Key::from_value(field).name(),
                ty: field_ty.to_string(),
            }
            .into());
        }

        let current = obj.get(&Key::from_value(field));
        let result = op.apply(&current, &rhs);
        tracing::trace!("{} {op} {:?} gives {:?}", Key::from_value(field).name(), rhs, result);

        self.store_result(obj, field, &field_ty, result)
    }

    /// `++obj[field]`, `obj[field]--` and friends.
    pub fn increment(
        &self,
        obj: &Value,
        from: &Type,
        field: &Value,
        step: Step,
        fixity: Fixity,
    ) -> RttiResult<Value> {
        let field_ty = self.arithmetic_slot(obj, from, field)?;
        if !field_ty.is_any() && !field_ty.is_primitive(Primitive::Number) {
            return Err(TypeViolation::NonNumericOperand {
                field: Key::from_value(field).name(),
                ty: field_ty.to_string(),
            }
            .into());
        }

        let old = obj.get(&Key::from_value(field)).to_number();
        let new = match step {
            Step::Inc => old + 1.0,
            Step::Dec => old - 1.0,
        };

        let stored = self.store_result(obj, field, &field_ty, Value::Number(new))?;
        Ok(match fixity {
            Fixity::Prefix => stored,
            Fixity::Postfix => Value::Number(old),
        })
    }
}
