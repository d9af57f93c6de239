use super::object::{BoundMethod, Class, Closure, Function, Instance, Obj, ObjRef, Upvalue};
use super::value::{format_number, Value, ValueKind};
use std::collections::HashMap;
use std::mem;

const FIRST_GC: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

/// The object heap: an arena of slots addressed by `ObjRef`, the string
/// intern table, and the mark-and-sweep bookkeeping. The heap owns every
/// object; everything else holds non-owning `ObjRef`s that the collector
/// traces from the VM's roots.
pub struct Heap {
    objects: Vec<Option<Obj>>,
    sizes: Vec<usize>,
    marked: Vec<bool>,
    free: Vec<usize>,
    gray: Vec<ObjRef>,
    strings: HashMap<String, ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            sizes: Vec::new(),
            marked: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            strings: HashMap::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
        }
    }

    fn size_of_obj(obj: &Obj) -> usize {
        mem::size_of::<Obj>()
            + match obj {
                Obj::String(string) => string.capacity(),
                Obj::Function(function) => {
                    function.chunk.len()
                        + function.chunk.constants().len() * mem::size_of::<Value>()
                }
                Obj::Closure(closure) => closure.upvalues.len() * mem::size_of::<ObjRef>(),
                Obj::Class(class) => {
                    class.methods.len() * (mem::size_of::<ObjRef>() + mem::size_of::<Value>())
                }
                Obj::Instance(instance) => {
                    instance.fields.len() * (mem::size_of::<ObjRef>() + mem::size_of::<Value>())
                }
                Obj::Native(_) | Obj::Upvalue(_) | Obj::BoundMethod(_) => 0,
            }
    }

    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = Self::size_of_obj(&obj);
        self.bytes_allocated += size;

        let index = match self.free.pop() {
            Some(index) => {
                self.objects[index] = Some(obj);
                self.sizes[index] = size;
                self.marked[index] = false;
                index
            }
            None => {
                self.objects.push(Some(obj));
                self.sizes.push(size);
                self.marked.push(false);
                self.objects.len() - 1
            }
        };

        ObjRef::new(index)
    }

    /// Returns the canonical string object for `content`, allocating it on
    /// first sight. Reference equality of interned strings implies content
    /// equality.
    pub fn intern(&mut self, content: &str) -> ObjRef {
        if let Some(obj_ref) = self.strings.get(content) {
            return *obj_ref;
        }
        let obj_ref = self.alloc(Obj::String(content.to_string()));
        self.strings.insert(content.to_string(), obj_ref);
        obj_ref
    }

    pub fn should_collect(&self) -> bool {
        cfg!(feature = "stress-gc") || self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.objects.iter().filter(|slot| slot.is_some()).count()
    }

    //>> Accessors. Handles are produced by this heap only, so a missing or
    //   mistyped slot is a VM bug, not a runtime error.
    pub fn get(&self, obj_ref: ObjRef) -> &Obj {
        self.objects[obj_ref.index()].as_ref().unwrap()
    }

    pub fn get_mut(&mut self, obj_ref: ObjRef) -> &mut Obj {
        self.objects[obj_ref.index()].as_mut().unwrap()
    }

    pub fn string(&self, obj_ref: ObjRef) -> &str {
        match self.get(obj_ref) {
            Obj::String(string) => string,
            _ => unreachable!(),
        }
    }

    pub fn function(&self, obj_ref: ObjRef) -> &Function {
        match self.get(obj_ref) {
            Obj::Function(function) => function,
            _ => unreachable!(),
        }
    }

    pub fn closure(&self, obj_ref: ObjRef) -> &Closure {
        match self.get(obj_ref) {
            Obj::Closure(closure) => closure,
            _ => unreachable!(),
        }
    }

    pub fn closure_mut(&mut self, obj_ref: ObjRef) -> &mut Closure {
        match self.get_mut(obj_ref) {
            Obj::Closure(closure) => closure,
            _ => unreachable!(),
        }
    }

    pub fn upvalue(&self, obj_ref: ObjRef) -> &Upvalue {
        match self.get(obj_ref) {
            Obj::Upvalue(upvalue) => upvalue,
            _ => unreachable!(),
        }
    }

    pub fn upvalue_mut(&mut self, obj_ref: ObjRef) -> &mut Upvalue {
        match self.get_mut(obj_ref) {
            Obj::Upvalue(upvalue) => upvalue,
            _ => unreachable!(),
        }
    }

    pub fn class(&self, obj_ref: ObjRef) -> &Class {
        match self.get(obj_ref) {
            Obj::Class(class) => class,
            _ => unreachable!(),
        }
    }

    pub fn class_mut(&mut self, obj_ref: ObjRef) -> &mut Class {
        match self.get_mut(obj_ref) {
            Obj::Class(class) => class,
            _ => unreachable!(),
        }
    }

    pub fn instance(&self, obj_ref: ObjRef) -> &Instance {
        match self.get(obj_ref) {
            Obj::Instance(instance) => instance,
            _ => unreachable!(),
        }
    }

    pub fn instance_mut(&mut self, obj_ref: ObjRef) -> &mut Instance {
        match self.get_mut(obj_ref) {
            Obj::Instance(instance) => instance,
            _ => unreachable!(),
        }
    }

    pub fn bound_method(&self, obj_ref: ObjRef) -> &BoundMethod {
        match self.get(obj_ref) {
            Obj::BoundMethod(bound) => bound,
            _ => unreachable!(),
        }
    }

    /// The chunk of the function a closure wraps.
    pub fn chunk_of(&self, closure: ObjRef) -> &super::chunk::Chunk {
        &self.function(self.closure(closure).function).chunk
    }
    //<<

    //>> Mark phase
    pub fn mark_value(&mut self, value: Value) {
        if let ValueKind::Obj(obj_ref) = value.kind() {
            self.mark_object(obj_ref);
        }
    }

    pub fn mark_object(&mut self, obj_ref: ObjRef) {
        if self.marked[obj_ref.index()] {
            return;
        }
        self.marked[obj_ref.index()] = true;
        self.gray.push(obj_ref);
    }

    fn blacken(&mut self, obj_ref: ObjRef) {
        let mut refs = Vec::new();
        let mut values = Vec::new();

        match self.get(obj_ref) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(function) => {
                if let Some(name) = function.name {
                    refs.push(name);
                }
                values.extend_from_slice(function.chunk.constants());
            }
            Obj::Closure(closure) => {
                refs.push(closure.function);
                refs.extend_from_slice(&closure.upvalues);
            }
            Obj::Upvalue(upvalue) => {
                if let Upvalue::Closed(value) = upvalue {
                    values.push(*value);
                }
            }
            Obj::Class(class) => {
                refs.push(class.name);
                for (name, method) in &class.methods {
                    refs.push(*name);
                    values.push(*method);
                }
            }
            Obj::Instance(instance) => {
                refs.push(instance.class);
                for (name, value) in &instance.fields {
                    refs.push(*name);
                    values.push(*value);
                }
            }
            Obj::BoundMethod(bound) => {
                values.push(bound.receiver);
                refs.push(bound.method);
            }
        }

        for obj_ref in refs {
            self.mark_object(obj_ref);
        }
        for value in values {
            self.mark_value(value);
        }
    }

    pub fn trace_references(&mut self) {
        while let Some(obj_ref) = self.gray.pop() {
            self.blacken(obj_ref);
        }
    }
    //<<

    /// Frees everything unmarked, clears the surviving marks, and rescales
    /// the collection threshold. The intern table is weak: its entries are
    /// dropped before the sweep so it can't resurrect dead strings.
    pub fn sweep(&mut self) {
        let marked = &self.marked;
        self.strings.retain(|_, obj_ref| marked[obj_ref.index()]);

        for index in 0..self.objects.len() {
            if self.marked[index] {
                self.marked[index] = false;
            } else if self.objects[index].take().is_some() {
                self.bytes_allocated -= self.sizes[index];
                self.sizes[index] = 0;
                self.free.push(index);
            }
        }

        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
    }

    //>> Display
    pub fn show(&self, value: Value) -> String {
        match value.kind() {
            ValueKind::Nil => "nil".to_string(),
            ValueKind::Bool(b) => if b { "true" } else { "false" }.to_string(),
            ValueKind::Number(n) => format_number(n),
            ValueKind::Obj(obj_ref) => self.show_object(obj_ref),
        }
    }

    pub fn show_object(&self, obj_ref: ObjRef) -> String {
        match self.get(obj_ref) {
            Obj::String(string) => string.clone(),
            Obj::Function(function) => match function.name {
                Some(name) => format!("<fn {}>", self.string(name)),
                None => "<script>".to_string(),
            },
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Closure(closure) => self.show_object(closure.function),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(class) => self.string(class.name).to_string(),
            Obj::Instance(instance) => {
                format!("{} instance", self.string(self.class(instance.class).name))
            }
            Obj::BoundMethod(bound) => self.show_object(bound.method),
        }
    }
    //<<
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_canonical() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.string(a), "hello");
    }

    #[test]
    fn sweep_frees_unmarked_objects() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        let _dropped = heap.intern("dropped");
        assert_eq!(heap.object_count(), 2);

        heap.mark_object(kept);
        heap.trace_references();
        heap.sweep();

        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.string(kept), "kept");
        // the surviving mark is cleared for the next cycle
        heap.mark_object(kept);
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn intern_table_is_weak() {
        let mut heap = Heap::new();
        let first = heap.intern("transient");
        heap.sweep();
        // the table forgot the dead string, so reinterning allocates anew
        let second = heap.intern("transient");
        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.string(second), "transient");
        let _ = first;
    }

    #[test]
    fn accounting_shrinks_on_sweep() {
        let mut heap = Heap::new();
        for i in 0..100 {
            heap.intern(&format!("string-{i}"));
        }
        let before = heap.bytes_allocated();
        assert!(before > 0);
        heap.sweep();
        assert_eq!(heap.bytes_allocated(), 0);
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn closures_keep_their_upvalues_alive() {
        use super::super::chunk::Chunk;
        use super::super::object::{Closure, Function, Obj, Upvalue};

        let mut heap = Heap::new();
        let name = heap.intern("f");
        let function = heap.alloc(Obj::Function(Function::new(Some(name), 0, 1, Chunk::new())));
        let upvalue = heap.alloc(Obj::Upvalue(Upvalue::Closed(Value::from(1.0))));
        let closure = heap.alloc(Obj::Closure(Closure::new(function, vec![upvalue])));

        heap.mark_object(closure);
        heap.trace_references();
        heap.sweep();

        assert_eq!(heap.object_count(), 4);
        assert_eq!(heap.string(name), "f");
        assert!(matches!(heap.upvalue(upvalue), Upvalue::Closed(_)));
    }
}
