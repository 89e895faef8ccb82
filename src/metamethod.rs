//! Metamethod resolution (`§4.4`)
//!
//! Looks up the metatable for a value (per-instance for tables/userdata,
//! per-kind for everything else via [`crate::heap::LuaHeap::type_metatable`])
//! and fetches an event's handler out of it. Binary-operator dispatch tries
//! the left operand first, then the right, matching `§4.4`'s "first operand
//! whose metatable defines it wins" rule.

use crate::heap::LuaHeap;
use crate::value::Value;

/// Chains longer than this raise `"'__index' chain too long; possible loop"`.
pub const MAX_META_CHAIN: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaEvent {
    Index,
    NewIndex,
    Call,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Len,
    Concat,
    Eq,
    Lt,
    Le,
    Close,
    ToString,
    Name,
    GC,
    Mode,
    Pairs,
}

impl MetaEvent {
    pub fn name(self) -> &'static str {
        use MetaEvent::*;
        match self {
            Index => "__index",
            NewIndex => "__newindex",
            Call => "__call",
            Add => "__add",
            Sub => "__sub",
            Mul => "__mul",
            Mod => "__mod",
            Pow => "__pow",
            Div => "__div",
            IDiv => "__idiv",
            BAnd => "__band",
            BOr => "__bor",
            BXor => "__bxor",
            Shl => "__shl",
            Shr => "__shr",
            Unm => "__unm",
            BNot => "__bnot",
            Len => "__len",
            Concat => "__concat",
            Eq => "__eq",
            Lt => "__lt",
            Le => "__le",
            Close => "__close",
            ToString => "__tostring",
            Name => "__name",
            GC => "__gc",
            Mode => "__mode",
            Pairs => "__pairs",
        }
    }
}

/// The metatable consulted for `value`, if any.
pub fn metatable_of(heap: &LuaHeap, value: &Value) -> Option<crate::handle::TableHandle> {
    match value {
        Value::Table(t) => heap.table(*t).ok().and_then(|t| t.metatable),
        Value::UserData(u) => heap.userdata(*u).ok().and_then(|u| u.metatable),
        Value::String(_) => heap.type_metatable("string"),
        Value::Boolean(_) => heap.type_metatable("boolean"),
        Value::Integer(_) | Value::Float(_) => heap.type_metatable("number"),
        Value::Thread(_) => heap.type_metatable("thread"),
        Value::CFunction(_) | Value::Closure(_) => heap.type_metatable("function"),
        Value::Nil => None,
    }
}

/// Raw (non-recursive) lookup of `event` in `value`'s own metatable.
pub fn raw_event(heap: &LuaHeap, value: &Value, event: MetaEvent) -> Option<Value> {
    let mt = metatable_of(heap, value)?;
    let table = heap.table(mt).ok()?;
    let key_handle = heap.find_interned(event.name().as_bytes())?;
    match table.get(&Value::String(key_handle)) {
        Value::Nil => None,
        v => Some(v),
    }
}

/// Binary-operator dispatch: try `lhs`'s metatable, then `rhs`'s.
pub fn binary_event(heap: &LuaHeap, lhs: &Value, rhs: &Value, event: MetaEvent) -> Option<Value> {
    raw_event(heap, lhs, event).or_else(|| raw_event(heap, rhs, event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::LuaHeap;
    use crate::value::Value;

    #[test]
    fn no_metatable_means_no_event() {
        let heap = LuaHeap::new();
        assert!(raw_event(&heap, &Value::Integer(1), MetaEvent::Add).is_none());
    }

    #[test]
    fn table_metatable_event_lookup() {
        let mut heap = LuaHeap::new();
        let mt = heap.create_table();
        let add_key = heap.intern_str("__add");
        {
            let t = heap.table_mut(mt).unwrap();
            t.set(Value::String(add_key), Value::Integer(42));
        }
        let obj = heap.create_table();
        heap.table_mut(obj).unwrap().metatable = Some(mt);
        let found = raw_event(&heap, &Value::Table(obj), MetaEvent::Add);
        assert_eq!(found, Some(Value::Integer(42)));
    }
}
