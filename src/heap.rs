//! The Lua heap: arenas for every heap-allocated object plus the string
//! intern table, the globals/registry tables, and a forced mark-sweep
//! collector used by `collectgarbage("collect")` and the weak-table tests.

use std::collections::{HashMap, HashSet};

use crate::arena::Arena;
use crate::error::{LuaError, Result};
use crate::handle::{ClosureHandle, StringHandle, TableHandle, ThreadHandle, UpvalueHandle, UserDataHandle};
use crate::value::{Closure, LuaString, Table, Thread, ThreadStatus, UserData, Value};
use crate::vm::UpvalueCell;

pub struct LuaHeap {
    strings: Arena<LuaString>,
    tables: Arena<Table>,
    closures: Arena<Closure>,
    threads: Arena<Thread>,
    upvalues: Arena<UpvalueCell>,
    userdata: Arena<UserData>,

    string_cache: HashMap<Vec<u8>, StringHandle>,

    registry: TableHandle,
    globals: TableHandle,
    main_thread: ThreadHandle,

    /// Shared metatables for non-table primitive types (`§4.6`: the string
    /// library installs itself here so `("x"):upper()` works).
    type_metatables: HashMap<&'static str, TableHandle>,
}

impl LuaHeap {
    pub fn new() -> Self {
        let mut strings = Arena::new();
        let mut tables = Arena::new();
        let mut threads = Arena::new();

        let registry = TableHandle::from(tables.insert(Table::new()));
        let globals = TableHandle::from(tables.insert(Table::new()));
        let main_thread = ThreadHandle::from(threads.insert(Thread::new_main()));

        let _ = &mut strings; // populated lazily via intern()

        LuaHeap {
            strings,
            tables,
            closures: Arena::new(),
            threads,
            upvalues: Arena::new(),
            userdata: Arena::new(),
            string_cache: HashMap::new(),
            registry,
            globals,
            main_thread,
            type_metatables: HashMap::new(),
        }
    }

    pub fn registry(&self) -> TableHandle {
        self.registry
    }

    pub fn globals(&self) -> TableHandle {
        self.globals
    }

    pub fn main_thread(&self) -> ThreadHandle {
        self.main_thread
    }

    pub fn type_metatable(&self, type_name: &'static str) -> Option<TableHandle> {
        self.type_metatables.get(type_name).copied()
    }

    pub fn set_type_metatable(&mut self, type_name: &'static str, table: TableHandle) {
        self.type_metatables.insert(type_name, table);
    }

    // ----- strings: interned by content -----

    pub fn intern(&mut self, bytes: &[u8]) -> StringHandle {
        if let Some(h) = self.string_cache.get(bytes) {
            return *h;
        }
        let handle = StringHandle::from(self.strings.insert(LuaString::new(bytes.to_vec())));
        self.string_cache.insert(bytes.to_vec(), handle);
        handle
    }

    pub fn intern_str(&mut self, s: &str) -> StringHandle {
        self.intern(s.as_bytes())
    }

    pub fn get_string(&self, handle: StringHandle) -> Result<&LuaString> {
        self.strings.get(handle.inner()).ok_or(LuaError::InvalidHandle)
    }

    /// Look up an already-interned string without creating it. Metamethod
    /// event names (`"__index"` etc.) use this: a metatable can only ever
    /// contain an interned key, so a miss here means "not present".
    pub fn find_interned(&self, bytes: &[u8]) -> Option<StringHandle> {
        self.string_cache.get(bytes).copied()
    }

    // ----- tables -----

    pub fn create_table(&mut self) -> TableHandle {
        TableHandle::from(self.tables.insert(Table::new()))
    }

    pub fn create_table_with_capacity(&mut self, array_cap: usize, hash_cap: usize) -> TableHandle {
        TableHandle::from(self.tables.insert(Table::with_capacity(array_cap, hash_cap)))
    }

    pub fn table(&self, handle: TableHandle) -> Result<&Table> {
        self.tables.get(handle.inner()).ok_or(LuaError::InvalidHandle)
    }

    pub fn table_mut(&mut self, handle: TableHandle) -> Result<&mut Table> {
        self.tables.get_mut(handle.inner()).ok_or(LuaError::InvalidHandle)
    }

    // ----- closures -----

    pub fn create_closure(&mut self, closure: Closure) -> ClosureHandle {
        ClosureHandle::from(self.closures.insert(closure))
    }

    pub fn closure(&self, handle: ClosureHandle) -> Result<&Closure> {
        self.closures.get(handle.inner()).ok_or(LuaError::InvalidHandle)
    }

    // ----- threads -----

    pub fn create_thread(&mut self) -> ThreadHandle {
        ThreadHandle::from(self.threads.insert(Thread::new()))
    }

    pub fn thread(&self, handle: ThreadHandle) -> Result<&Thread> {
        self.threads.get(handle.inner()).ok_or(LuaError::InvalidHandle)
    }

    pub fn thread_mut(&mut self, handle: ThreadHandle) -> Result<&mut Thread> {
        self.threads.get_mut(handle.inner()).ok_or(LuaError::InvalidHandle)
    }

    // ----- upvalue cells -----

    pub fn create_upvalue(&mut self, cell: UpvalueCell) -> UpvalueHandle {
        UpvalueHandle::from(self.upvalues.insert(cell))
    }

    pub fn upvalue(&self, handle: UpvalueHandle) -> Result<&UpvalueCell> {
        self.upvalues.get(handle.inner()).ok_or(LuaError::InvalidHandle)
    }

    pub fn upvalue_mut(&mut self, handle: UpvalueHandle) -> Result<&mut UpvalueCell> {
        self.upvalues.get_mut(handle.inner()).ok_or(LuaError::InvalidHandle)
    }

    // ----- userdata -----

    pub fn create_userdata(&mut self, data: UserData) -> UserDataHandle {
        UserDataHandle::from(self.userdata.insert(data))
    }

    pub fn userdata(&self, handle: UserDataHandle) -> Result<&UserData> {
        self.userdata.get(handle.inner()).ok_or(LuaError::InvalidHandle)
    }

    // ----- garbage collection -----

    /// Forced mark-sweep used by `collectgarbage("collect")`. `extra_roots`
    /// covers host-held values not reachable from globals/registry, such as
    /// the currently-resuming coroutine chain.
    pub fn collect_garbage(&mut self, extra_roots: &[Value]) {
        let marks = self.mark(extra_roots);
        self.sweep(&marks);
    }

    fn mark(&self, extra_roots: &[Value]) -> Marks {
        let mut marks = Marks::default();
        let mut worklist: Vec<Value> =
            vec![Value::Table(self.registry), Value::Table(self.globals), Value::Thread(self.main_thread)];
        worklist.extend_from_slice(extra_roots);

        while let Some(v) = worklist.pop() {
            match v {
                Value::String(h) => {
                    marks.strings.insert(h);
                }
                Value::Table(h) => {
                    if marks.tables.insert(h) {
                        if let Some(t) = self.tables.get(h.inner()) {
                            for v in &t.array {
                                worklist.push(v.clone());
                            }
                            let mode = t.hash.mode();
                            for (k, v) in t.hash.iter() {
                                if !mode.weak_keys() {
                                    worklist.push(k.to_value());
                                }
                                if !mode.weak_values() {
                                    worklist.push(v.clone());
                                }
                            }
                            if let Some(mt) = t.metatable {
                                worklist.push(Value::Table(mt));
                            }
                        }
                    }
                }
                Value::Closure(h) => {
                    if marks.closures.insert(h) {
                        if let Some(c) = self.closures.get(h.inner()) {
                            for &uv in &c.upvalues {
                                marks.upvalues.insert(uv);
                                if let Some(UpvalueCell::Closed(val)) = self.upvalues.get(uv.inner()) {
                                    worklist.push(val.clone());
                                }
                            }
                            for k in &c.proto.constants {
                                worklist.push(k.clone());
                            }
                        }
                    }
                }
                Value::Thread(h) => {
                    if marks.threads.insert(h) {
                        if let Some(t) = self.threads.get(h.inner()) {
                            for v in &t.stack {
                                worklist.push(v.clone());
                            }
                            for frame in &t.frames {
                                worklist.push(Value::Closure(frame.closure));
                                for v in &frame.varargs {
                                    worklist.push(v.clone());
                                }
                                for (_, v) in &frame.pending_close {
                                    worklist.push(v.clone());
                                }
                            }
                            for &uv in &t.open_upvalues {
                                marks.upvalues.insert(uv);
                            }
                        }
                    }
                }
                Value::UserData(h) => {
                    if marks.userdata.insert(h) {
                        if let Some(u) = self.userdata.get(h.inner()) {
                            if let Some(mt) = u.metatable {
                                worklist.push(Value::Table(mt));
                            }
                        }
                    }
                }
                Value::Nil | Value::Boolean(_) | Value::Integer(_) | Value::Float(_) | Value::CFunction(_) => {}
            }
        }
        for h in self.type_metatables.values() {
            marks.tables.insert(*h);
        }
        marks
    }

    fn sweep(&mut self, marks: &Marks) {
        // Purge weak entries in every still-live table first, using the
        // mark set as the liveness oracle, then drop unreachable objects.
        let table_handles: Vec<TableHandle> =
            self.tables.iter().map(|(h, _)| TableHandle::from(h)).collect();
        for h in table_handles {
            if !marks.tables.contains(&h) {
                continue;
            }
            if let Some(t) = self.tables.get_mut(h.inner()) {
                t.hash.purge_dead(
                    |k| match k.clone().to_value() {
                        Value::String(s) => marks.strings.contains(&s),
                        Value::Table(t) => marks.tables.contains(&t),
                        _ => true,
                    },
                    |v| match v {
                        Value::String(s) => marks.strings.contains(s),
                        Value::Table(t) => marks.tables.contains(t),
                        Value::Closure(c) => marks.closures.contains(c),
                        Value::Thread(t) => marks.threads.contains(t),
                        Value::UserData(u) => marks.userdata.contains(u),
                        _ => true,
                    },
                );
            }
        }

        retain_unmarked(&mut self.tables, |h| marks.tables.contains(&TableHandle::from(h)));
        retain_unmarked(&mut self.closures, |h| marks.closures.contains(&ClosureHandle::from(h)));
        retain_unmarked(&mut self.threads, |h| {
            marks.threads.contains(&ThreadHandle::from(h)) || h == self.main_thread.inner()
        });
        retain_unmarked(&mut self.upvalues, |h| marks.upvalues.contains(&UpvalueHandle::from(h)));
        retain_unmarked(&mut self.userdata, |h| marks.userdata.contains(&UserDataHandle::from(h)));

        // Strings are swept from both the arena and the intern cache
        // together so a collected string can be re-interned afresh.
        let dead_strings: Vec<crate::arena::Handle<LuaString>> = self
            .strings
            .iter()
            .filter(|(h, _)| !marks.strings.contains(&StringHandle::from(*h)))
            .map(|(h, _)| h)
            .collect();
        for h in dead_strings {
            if let Some(s) = self.strings.remove(h) {
                self.string_cache.remove(&s.bytes);
            }
        }
    }
}

impl Default for LuaHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Marks {
    strings: HashSet<StringHandle>,
    tables: HashSet<TableHandle>,
    closures: HashSet<ClosureHandle>,
    threads: HashSet<ThreadHandle>,
    userdata: HashSet<UserDataHandle>,
    upvalues: HashSet<UpvalueHandle>,
}

fn retain_unmarked<T>(arena: &mut Arena<T>, is_marked: impl Fn(crate::arena::Handle<T>) -> bool) {
    let dead: Vec<crate::arena::Handle<T>> =
        arena.iter().filter(|(h, _)| !is_marked(*h)).map(|(h, _)| h).collect();
    for h in dead {
        arena.remove(h);
    }
}

impl Thread {
    pub(crate) fn new_main() -> Self {
        let mut t = Thread::new();
        t.status = ThreadStatus::Running;
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_interning_is_by_content() {
        let mut heap = LuaHeap::new();
        let a = heap.intern_str("hello");
        let b = heap.intern_str("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn globals_and_registry_are_distinct_tables() {
        let heap = LuaHeap::new();
        assert_ne!(heap.globals(), heap.registry());
    }

    #[test]
    fn gc_collects_table_unreachable_from_roots() {
        let mut heap = LuaHeap::new();
        let orphan = heap.create_table();
        heap.collect_garbage(&[]);
        assert!(heap.table(orphan).is_err());
    }

    #[test]
    fn gc_keeps_table_reachable_from_globals() {
        let mut heap = LuaHeap::new();
        let child = heap.create_table();
        let key = heap.intern_str("k");
        heap.table_mut(heap.globals()).unwrap().set(Value::String(key), Value::Table(child));
        heap.collect_garbage(&[]);
        assert!(heap.table(child).is_ok());
    }
}
