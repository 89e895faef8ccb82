//! Typed handle wrappers
//!
//! Thin, `Copy` newtypes over [`arena::Handle`] so the heap's various arenas
//! (strings, tables, closures, threads, upvalue cells, userdata) can't be
//! confused with one another at the type level.

use crate::arena::Handle;
use crate::value::{Closure, LuaString, Table, Thread, UserData};
use crate::vm::UpvalueCell;

macro_rules! typed_handle {
    ($name:ident, $target:ty) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) Handle<$target>);

        impl $name {
            pub(crate) fn inner(&self) -> Handle<$target> {
                self.0
            }
        }

        impl From<Handle<$target>> for $name {
            fn from(h: Handle<$target>) -> Self {
                $name(h)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }
    };
}

typed_handle!(StringHandle, LuaString);
typed_handle!(TableHandle, Table);
typed_handle!(ClosureHandle, Closure);
typed_handle!(ThreadHandle, Thread);
typed_handle!(UpvalueHandle, UpvalueCell);
typed_handle!(UserDataHandle, UserData);
