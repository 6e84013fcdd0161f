//! Memory image and runtime helpers for the reference machine.

use super::machine::{Exit, Machine, RETURN_SENTINEL};
use super::{Fault, Value};
use crate::bytecode::{ArrayType, FieldKind, JvmType, MethodDescriptor};
use crate::driver::CompiledCode;
use crate::meta::{ClassPool, Helper, ImtEntry, RuntimeEnv, layout};
use crate::x86::Reg;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

pub const STACK_TOP: u32 = 0x0080_0000;
pub const STACK_SIZE: u32 = 0x0010_0000;
pub const HEAP_BASE: u32 = 0x0100_0000;
pub const HEAP_SIZE: u32 = 0x0040_0000;

/// Superclass of every array class.
const OBJECT: &str = "java/lang/Object";

/// Element storage of an array object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    Primitive(FieldKind),
    /// Element type object, or 0 for untyped runtime tables
    Reference(u32),
}

impl ArrayKind {
    fn element_size(self) -> u32 {
        match self {
            ArrayKind::Primitive(kind) => kind.size() as u32,
            ArrayKind::Reference(_) => 4,
        }
    }
}

#[derive(Debug)]
struct ClassInfo {
    name: String,
    super_class: Option<String>,
    instance_size: i32,
    tib: u32,
    /// Type objects of the class, its superclasses and interfaces
    ancestors: Vec<u32>,
    clinit: Option<u32>,
}

#[derive(Debug, Clone)]
struct EntryPoint {
    address: u32,
    args: Vec<JvmType>,
    ret: Option<JvmType>,
}

pub struct Runtime {
    machine: Machine,
    env: RuntimeEnv,
    heap_next: u32,
    /// Type object -> class
    classes: HashMap<u32, ClassInfo>,
    by_name: HashMap<String, u32>,
    /// TIB -> type object
    tibs: HashMap<u32, u32>,
    /// Array class -> (type object, TIB), built on first use
    array_classes: HashMap<String, (u32, u32)>,
    /// IMT and collision flags shared by every array class
    empty_imt: Option<(u32, u32)>,
    arrays: HashMap<u32, ArrayKind>,
    /// `Class.name(desc)` -> entry point
    methods: HashMap<String, EntryPoint>,
    monitors: HashMap<u32, u32>,
    yields: u64,
}

impl Runtime {
    /// Build the memory image for `pool` with its compiled methods loaded.
    pub fn new(
        pool: &ClassPool,
        compiled: Vec<CompiledCode>,
        env: RuntimeEnv,
        max_steps: u64,
    ) -> Result<Self, Fault> {
        let mut machine = Machine::new(max_steps);
        let mem = &mut machine.mem;
        mem.map(STACK_TOP - STACK_SIZE, STACK_SIZE);
        mem.map(HEAP_BASE, HEAP_SIZE);
        mem.map(
            env.card_table + (HEAP_BASE >> layout::CARD_SHIFT),
            HEAP_SIZE >> layout::CARD_SHIFT,
        );
        mem.map(env.helper_table, 4 * Helper::ALL.len() as u32);
        mem.map(env.yield_flag, 4);
        mem.map(env.statics_base, 4 * pool.statics_len().max(1));
        for helper in Helper::ALL {
            mem.write_u32(
                env.helper_table + 4 * helper.index(),
                Machine::hook_address(helper),
            )?;
        }
        machine.set_reg(Reg::Esp, STACK_TOP);

        let mut rt = Runtime {
            machine,
            env,
            heap_next: HEAP_BASE,
            classes: HashMap::new(),
            by_name: HashMap::new(),
            tibs: HashMap::new(),
            array_classes: HashMap::new(),
            empty_imt: None,
            arrays: HashMap::new(),
            methods: HashMap::new(),
            monitors: HashMap::new(),
            yields: 0,
        };

        // Code, entered through the statics code slots.
        let mut code_addresses: HashMap<String, u32> = HashMap::new();
        for code in compiled {
            let start = code.compiled.code_start as u32;
            let base = rt.machine.load(code.listing)?;
            code_addresses.insert(format!("{}.{}", code.class, code.key), base + start);
        }
        for class in pool.classes() {
            for m in class.methods.values() {
                let id = format!("{}.{}", class.name, m.key());
                let address = code_addresses.get(&id).copied().unwrap_or(0);
                rt.write_static(m.code_slot, address)?;
                if address != 0 {
                    let sig = MethodDescriptor::parse(&m.descriptor)
                        .map_err(|e| Fault::BadEntry(e.to_string()))?;
                    let mut args = Vec::new();
                    if !m.is_static {
                        args.push(JvmType::Reference);
                    }
                    args.extend(sig.args.iter().map(|k| k.jvm_type()));
                    rt.methods.insert(
                        id,
                        EntryPoint {
                            address,
                            args,
                            ret: sig.ret.map(FieldKind::jvm_type),
                        },
                    );
                }
            }
        }

        // Type objects first: TIBs and ancestor arrays refer to them.
        for class in pool.classes() {
            let type_object = rt.new_type_object(class.initialized)?;
            rt.write_static(class.type_slot, type_object)?;
            rt.by_name.insert(class.name.clone(), type_object);
        }
        for (name, slot) in pool.array_classes() {
            let type_object = rt.new_type_object(true)?;
            rt.write_static(slot, type_object)?;
            rt.by_name.insert(name, type_object);
        }
        for class in pool.classes() {
            let mut ancestors = Vec::with_capacity(class.ancestors.len());
            for type_slot in &class.ancestors {
                ancestors.push(rt.read_static(*type_slot)?);
            }
            let clinit = rt
                .methods
                .get(&format!("{}.<clinit>()V", class.name))
                .map(|e| e.address);
            rt.classes.insert(
                rt.by_name[&class.name],
                ClassInfo {
                    name: class.name.clone(),
                    super_class: class.super_class.clone(),
                    instance_size: class.instance_size,
                    tib: 0,
                    ancestors,
                    clinit,
                },
            );
        }

        for class in pool.classes() {
            let type_object = rt.by_name[&class.name];
            let imt = rt.alloc_array(ArrayKind::Reference(0), layout::IMT_LENGTH as i32)?;
            let collisions = rt.alloc_array(
                ArrayKind::Primitive(FieldKind::Byte),
                layout::IMT_LENGTH as i32,
            )?;
            for (i, entry) in class.imt.iter().enumerate() {
                let slot = imt + layout::array_slot(i as i32) as u32;
                match entry {
                    ImtEntry::Empty => {}
                    ImtEntry::Single(code_slot) => {
                        let code = rt.read_static(*code_slot)?;
                        rt.write_u32(slot, code)?;
                    }
                    ImtEntry::Collision(list) => {
                        let methods = rt.alloc_array(ArrayKind::Reference(0), list.len() as i32)?;
                        for (j, (selector, code_slot)) in list.iter().enumerate() {
                            let method = rt.alloc(16)?;
                            let code = rt.read_static(*code_slot)?;
                            rt.write_u32(method + layout::METHOD_SELECTOR_OFFSET as u32, *selector)?;
                            rt.write_u32(method + layout::METHOD_CODE_OFFSET as u32, code)?;
                            rt.write_u32(methods + layout::array_slot(j as i32) as u32, method)?;
                        }
                        rt.write_u32(slot, methods)?;
                        let flag = collisions + (layout::ARRAY_DATA_OFFSET + i as i32) as u32;
                        rt.machine.mem.write_u8(flag, 1)?;
                    }
                }
            }

            let ancestors = rt
                .classes
                .get(&type_object)
                .map(|c| c.ancestors.clone())
                .unwrap_or_default();
            let ancestor_array = rt.int_array(&ancestors)?;

            let tib_len = layout::TIB_FIRST_METHOD_INDEX + class.vtable.len() as i32;
            let tib = rt.alloc_array(ArrayKind::Reference(0), tib_len)?;
            let header = [type_object, imt, collisions, ancestor_array];
            for (i, word) in header.iter().enumerate() {
                rt.write_u32(tib + layout::array_slot(i as i32) as u32, *word)?;
            }
            for (i, code_slot) in class.vtable.iter().enumerate() {
                let code = rt.read_static(*code_slot)?;
                let index = layout::TIB_FIRST_METHOD_INDEX + i as i32;
                rt.write_u32(tib + layout::array_slot(index) as u32, code)?;
            }
            rt.tibs.insert(tib, type_object);
            if let Some(info) = rt.classes.get_mut(&type_object) {
                info.tib = tib;
            }
        }
        for (name, _) in pool.array_classes() {
            rt.array_class(&name)?;
        }

        for (value, slot) in pool.strings() {
            let units: Vec<u16> = value.encode_utf16().collect();
            let string = rt.alloc_array(ArrayKind::Primitive(FieldKind::Char), units.len() as i32)?;
            for (i, unit) in units.iter().enumerate() {
                let addr = string + layout::ARRAY_DATA_OFFSET as u32 + 2 * i as u32;
                rt.machine.mem.write(addr, crate::x86::Width::Word, *unit as u32)?;
            }
            rt.write_static(slot, string)?;
        }
        debug!(
            classes = rt.classes.len(),
            methods = rt.methods.len(),
            heap = rt.heap_next - HEAP_BASE,
            "runtime image built"
        );
        Ok(rt)
    }

    fn new_type_object(&mut self, initialized: bool) -> Result<u32, Fault> {
        let type_object = self.alloc(16)?;
        if initialized {
            self.write_u32(
                type_object + layout::TYPE_STATE_OFFSET as u32,
                layout::ST_INITIALIZED as u32,
            )?;
        }
        Ok(type_object)
    }

    /// Type object and TIB of an array class, built on first use. The
    /// ancestor array holds the class itself, the array classes its element
    /// type makes it assignable to, and `java/lang/Object` when defined.
    fn array_class(&mut self, name: &str) -> Result<(u32, u32), Fault> {
        if let Some(entry) = self.array_classes.get(name) {
            return Ok(*entry);
        }
        let type_object = match self.by_name.get(name) {
            Some(t) => *t,
            None => {
                let t = self.new_type_object(true)?;
                self.by_name.insert(name.to_string(), t);
                t
            }
        };
        // Registered before its own tables are allocated: those are arrays too.
        let tib = self.alloc_array_storage(ArrayKind::Reference(0), layout::TIB_FIRST_METHOD_INDEX)?;
        self.array_classes.insert(name.to_string(), (type_object, tib));
        self.tibs.insert(tib, type_object);

        let mut ancestors = Vec::new();
        for supertype in self.array_supertypes(name) {
            if supertype == name {
                ancestors.push(type_object);
            } else if supertype.starts_with('[') {
                ancestors.push(self.array_class(&supertype)?.0);
            } else if let Some(t) = self.by_name.get(&supertype) {
                ancestors.push(*t);
            }
        }
        let (imt, collisions) = self.empty_imt()?;
        let ancestor_array = self.int_array(&ancestors)?;
        for (i, word) in [type_object, imt, collisions, ancestor_array].iter().enumerate() {
            self.write_u32(tib + layout::array_slot(i as i32) as u32, *word)?;
        }
        self.install_array_tib(tib, ArrayKind::Reference(0))?;
        trace!(class = name, type_object, "array class");
        self.classes.insert(
            type_object,
            ClassInfo {
                name: name.to_string(),
                super_class: None,
                instance_size: 0,
                tib,
                ancestors,
                clinit: None,
            },
        );
        Ok((type_object, tib))
    }

    /// Names of the types an array class is assignable to, itself first.
    fn array_supertypes(&self, name: &str) -> Vec<String> {
        let element = &name[1..];
        let mut names: Vec<String> = if element.starts_with('[') {
            self.array_supertypes(element).iter().map(|s| array_of(s)).collect()
        } else if let Some(class) = element.strip_prefix('L').and_then(|e| e.strip_suffix(';')) {
            let mut supers: Vec<String> =
                match self.by_name.get(class).and_then(|t| self.classes.get(t)) {
                    Some(info) => info.ancestors.iter().map(|a| self.type_name(*a)).collect(),
                    None => vec![class.to_string()],
                };
            supers.push(OBJECT.to_string());
            supers.iter().map(|s| array_of(s)).collect()
        } else {
            vec![name.to_string()]
        };
        names.push(OBJECT.to_string());
        let mut seen = HashSet::new();
        names.retain(|n| seen.insert(n.clone()));
        names
    }

    fn empty_imt(&mut self) -> Result<(u32, u32), Fault> {
        if let Some(tables) = self.empty_imt {
            return Ok(tables);
        }
        let imt = self.alloc_array_storage(ArrayKind::Reference(0), layout::IMT_LENGTH as i32)?;
        let flags = ArrayKind::Primitive(FieldKind::Byte);
        let collisions = self.alloc_array_storage(flags, layout::IMT_LENGTH as i32)?;
        self.empty_imt = Some((imt, collisions));
        self.install_array_tib(imt, ArrayKind::Reference(0))?;
        self.install_array_tib(collisions, flags)?;
        Ok((imt, collisions))
    }

    /// Class name of arrays holding `kind`, e.g. `[I` or `[Ldemo/Box;`.
    fn array_name(&self, kind: ArrayKind) -> String {
        match kind {
            ArrayKind::Primitive(k) => format!("[{}", k.descriptor_char()),
            ArrayKind::Reference(0) => array_of(OBJECT),
            ArrayKind::Reference(element) => array_of(&self.type_name(element)),
        }
    }

    // ==================== Accessors ====================

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn yields(&self) -> u64 {
        self.yields
    }

    /// Raise or clear the yield request polled at yield points.
    pub fn set_yield_flag(&mut self, on: bool) -> Result<(), Fault> {
        self.machine.mem.write_u32(self.env.yield_flag, on as u32)
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32, Fault> {
        self.machine.mem.read_u32(addr)
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), Fault> {
        self.machine.mem.write_u32(addr, value)
    }

    pub fn read_static(&self, slot: u32) -> Result<u32, Fault> {
        self.read_u32(self.env.statics_base + 4 * slot)
    }

    fn write_static(&mut self, slot: u32, value: u32) -> Result<(), Fault> {
        self.write_u32(self.env.statics_base + 4 * slot, value)
    }

    /// Type object of a class, by name.
    pub fn type_object(&self, class: &str) -> Option<u32> {
        self.by_name.get(class).copied()
    }

    pub fn is_initialized(&self, class: &str) -> Result<bool, Fault> {
        let type_object = self
            .type_object(class)
            .ok_or_else(|| Fault::BadEntry(class.to_string()))?;
        let state = self.read_u32(type_object + layout::TYPE_STATE_OFFSET as u32)?;
        Ok(state & layout::ST_INITIALIZED as u32 != 0)
    }

    pub fn array_kind(&self, array: u32) -> Option<ArrayKind> {
        self.arrays.get(&array).copied()
    }

    pub fn array_length(&self, array: u32) -> Result<i32, Fault> {
        Ok(self.read_u32(array + layout::ARRAY_LENGTH_OFFSET as u32)? as i32)
    }

    /// Raw bits of element `index`, zero-extended.
    pub fn array_element(&self, array: u32, index: i32) -> Result<u64, Fault> {
        let kind = self.array_kind(array).ok_or(Fault::BadAddress(array))?;
        if index < 0 || index >= self.array_length(array)? {
            return Err(Fault::ArrayBounds);
        }
        let size = kind.element_size();
        let addr = array + layout::ARRAY_DATA_OFFSET as u32 + size * index as u32;
        Ok(match size {
            1 => self.machine.mem.read_u8(addr)? as u64,
            2 => self.machine.mem.read(addr, crate::x86::Width::Word)? as u64,
            4 => self.read_u32(addr)? as u64,
            _ => self.machine.mem.read_u64(addr)?,
        })
    }

    /// Allocate a primitive array filled with `values` (raw bits).
    pub fn new_array(&mut self, ty: ArrayType, values: &[u64]) -> Result<u32, Fault> {
        let kind = ArrayKind::Primitive(ty.element());
        let array = self.alloc_array(kind, values.len() as i32)?;
        let size = kind.element_size();
        for (i, v) in values.iter().enumerate() {
            let addr = array + layout::ARRAY_DATA_OFFSET as u32 + size * i as u32;
            match size {
                1 => self.machine.mem.write_u8(addr, *v as u8)?,
                2 => self.machine.mem.write(addr, crate::x86::Width::Word, *v as u32)?,
                4 => self.write_u32(addr, *v as u32)?,
                _ => self.machine.mem.write_u64(addr, *v)?,
            }
        }
        Ok(array)
    }

    /// Allocate an instance of `class` with zeroed fields.
    pub fn new_object(&mut self, class: &str) -> Result<u32, Fault> {
        if class.starts_with('[') {
            return Err(Fault::BadEntry(format!("{} is an array class", class)));
        }
        let type_object = self
            .type_object(class)
            .ok_or_else(|| Fault::BadEntry(class.to_string()))?;
        self.alloc_instance(type_object)
    }

    /// Class name of an object. Arrays are named by descriptor, e.g. `[I`.
    pub fn class_of(&self, object: u32) -> Result<String, Fault> {
        let tib = self.read_u32(object + layout::TIB_OFFSET as u32)?;
        self.tibs
            .get(&tib)
            .and_then(|t| self.classes.get(t))
            .map(|c| c.name.clone())
            .ok_or(Fault::BadAddress(object))
    }

    // ==================== Heap ====================

    fn alloc(&mut self, size: u32) -> Result<u32, Fault> {
        let size = (size.max(layout::OBJECT_HEADER_SIZE as u32) + 7) & !7;
        let addr = self.heap_next;
        if addr + size > HEAP_BASE + HEAP_SIZE {
            return Err(Fault::OutOfMemory);
        }
        self.heap_next += size;
        Ok(addr)
    }

    fn alloc_instance(&mut self, type_object: u32) -> Result<u32, Fault> {
        let (size, tib) = match self.classes.get(&type_object) {
            Some(c) => (c.instance_size as u32, c.tib),
            None => return Err(Fault::BadAddress(type_object)),
        };
        let object = self.alloc(size)?;
        self.write_u32(object + layout::TIB_OFFSET as u32, tib)?;
        Ok(object)
    }

    fn alloc_array(&mut self, kind: ArrayKind, count: i32) -> Result<u32, Fault> {
        let array = self.alloc_array_storage(kind, count)?;
        self.install_array_tib(array, kind)?;
        Ok(array)
    }

    fn install_array_tib(&mut self, array: u32, kind: ArrayKind) -> Result<(), Fault> {
        let name = self.array_name(kind);
        let (_, tib) = self.array_class(&name)?;
        self.write_u32(array + layout::TIB_OFFSET as u32, tib)
    }

    /// Header and zeroed elements; the TIB word is left to the caller.
    fn alloc_array_storage(&mut self, kind: ArrayKind, count: i32) -> Result<u32, Fault> {
        if count < 0 {
            return Err(Fault::NegativeArraySize(count));
        }
        let bytes = (count as u64) * kind.element_size() as u64;
        if bytes > HEAP_SIZE as u64 {
            return Err(Fault::OutOfMemory);
        }
        let array = self.alloc(layout::ARRAY_DATA_OFFSET as u32 + bytes as u32)?;
        self.write_u32(array + layout::ARRAY_LENGTH_OFFSET as u32, count as u32)?;
        self.arrays.insert(array, kind);
        Ok(array)
    }

    fn int_array(&mut self, values: &[u32]) -> Result<u32, Fault> {
        let array = self.alloc_array(ArrayKind::Primitive(FieldKind::Int), values.len() as i32)?;
        for (i, v) in values.iter().enumerate() {
            self.write_u32(array + layout::array_slot(i as i32) as u32, *v)?;
        }
        Ok(array)
    }

    /// Arrays nested `counts.len()` deep; the innermost level holds `leaf`.
    /// Each outer level holds the array class of the level inside it.
    fn alloc_multi(&mut self, counts: &[i32], leaf: ArrayKind) -> Result<u32, Fault> {
        let mut kinds = vec![leaf];
        for _ in 1..counts.len() {
            let inner = self.array_name(kinds[kinds.len() - 1]);
            let (type_object, _) = self.array_class(&inner)?;
            kinds.push(ArrayKind::Reference(type_object));
        }
        kinds.reverse();
        self.fill_multi(counts, &kinds)
    }

    fn fill_multi(&mut self, counts: &[i32], kinds: &[ArrayKind]) -> Result<u32, Fault> {
        let ([n, rest @ ..], [kind, inner @ ..]) = (counts, kinds) else {
            return Ok(0);
        };
        let array = self.alloc_array(*kind, *n)?;
        if !rest.is_empty() {
            for i in 0..*n {
                let sub = self.fill_multi(rest, inner)?;
                self.write_u32(array + layout::array_slot(i) as u32, sub)?;
            }
        }
        Ok(array)
    }

    fn is_instance(&self, object: u32, type_object: u32) -> Result<bool, Fault> {
        let tib = self.read_u32(object + layout::TIB_OFFSET as u32)?;
        Ok(self
            .tibs
            .get(&tib)
            .and_then(|t| self.classes.get(t))
            .is_some_and(|c| c.ancestors.contains(&type_object)))
    }

    fn type_name(&self, type_object: u32) -> String {
        if let Some(c) = self.classes.get(&type_object) {
            return c.name.clone();
        }
        self.by_name
            .iter()
            .find(|(_, t)| **t == type_object)
            .map_or_else(|| format!("{:#x}", type_object), |(name, _)| name.clone())
    }

    // ==================== Calls ====================

    /// Call the code at `address` with raw argument words and return EAX and
    /// EDX. Helpers called on the way are serviced.
    pub fn call(&mut self, address: u32, words: &[u32]) -> Result<(u32, u32), Fault> {
        let saved_eip = self.machine.eip();
        let esp = self.machine.reg(Reg::Esp);
        for w in words {
            self.machine.push(*w)?;
        }
        self.machine.push(RETURN_SENTINEL)?;
        self.machine.set_eip(address);
        loop {
            match self.machine.run()? {
                Exit::Return => break,
                Exit::Hook(helper) => self.service(helper)?,
            }
        }
        if self.machine.reg(Reg::Esp) != esp {
            return Err(Fault::IllegalInstruction(format!(
                "call at {:#x} left esp at {:#x} instead of {:#x}",
                address,
                self.machine.reg(Reg::Esp),
                esp
            )));
        }
        self.machine.set_eip(saved_eip);
        Ok((self.machine.reg(Reg::Eax), self.machine.reg(Reg::Edx)))
    }

    /// Invoke `Class.name(desc)` with typed arguments.
    pub fn invoke(&mut self, method: &str, args: &[Value]) -> Result<Option<Value>, Fault> {
        let entry = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| Fault::BadEntry(format!("{} has no compiled code", method)))?;
        let types: Vec<JvmType> = args.iter().map(Value::ty).collect();
        if types != entry.args {
            return Err(Fault::BadEntry(format!(
                "{} takes {:?}, got {:?}",
                method, entry.args, types
            )));
        }
        let words: Vec<u32> = args.iter().flat_map(Value::words).collect();
        debug!(method, ?args, "invoke");
        let (eax, edx) = self.call(entry.address, &words)?;
        Ok(entry.ret.map(|ty| Value::from_result(ty, eax, edx)))
    }

    /// Argument types of a compiled method.
    pub fn arg_types(&self, method: &str) -> Option<&[JvmType]> {
        self.methods.get(method).map(|e| e.args.as_slice())
    }

    // ==================== Helpers ====================

    fn arg(&self, words: u32, i: u32) -> Result<u32, Fault> {
        self.machine.hook_arg(words, i)
    }

    fn service(&mut self, helper: Helper) -> Result<(), Fault> {
        trace!(?helper, "helper");
        let (old_eax, old_edx) = (self.machine.reg(Reg::Eax), self.machine.reg(Reg::Edx));
        let (words, eax, edx) = match helper {
            Helper::AllocObject => {
                let object = self.alloc_instance(self.arg(1, 0)?)?;
                (1, object, 0)
            }
            Helper::AllocPrimitiveArray => {
                let count = self.arg(2, 0)? as i32;
                let code = self.arg(2, 1)?;
                let ty = array_type(code)?;
                let array = self.alloc_array(ArrayKind::Primitive(ty.element()), count)?;
                (2, array, 0)
            }
            Helper::AllocObjectArray => {
                let count = self.arg(2, 0)? as i32;
                let element = self.arg(2, 1)?;
                let array = self.alloc_array(ArrayKind::Reference(element), count)?;
                (2, array, 0)
            }
            Helper::AllocMultiArray => {
                let esp = self.machine.reg(Reg::Esp);
                let dims = self.read_u32(esp + 8)?;
                let words = dims + 2;
                let mut counts = Vec::with_capacity(dims as usize);
                for i in 0..dims {
                    counts.push(self.arg(words, i)? as i32);
                }
                let element = self.arg(words, dims + 1)?;
                let leaf = if (4..=11).contains(&element) {
                    ArrayKind::Primitive(array_type(element)?.element())
                } else {
                    ArrayKind::Reference(element)
                };
                if let Some(n) = counts.iter().find(|n| **n < 0) {
                    return Err(Fault::NegativeArraySize(*n));
                }
                let array = self.alloc_multi(&counts, leaf)?;
                (words, array, 0)
            }
            Helper::InitializeClass => {
                let type_object = self.arg(1, 0)?;
                self.machine.return_from_hook(1)?;
                self.initialize(type_object)?;
                return Ok(());
            }
            Helper::LongDiv | Helper::LongRem => {
                let dividend = (self.arg(4, 0)? as u64) << 32 | self.arg(4, 1)? as u64;
                let divisor = (self.arg(4, 2)? as u64) << 32 | self.arg(4, 3)? as u64;
                let (a, b) = (dividend as i64, divisor as i64);
                if b == 0 {
                    return Err(Fault::DivideByZero);
                }
                let r = match helper {
                    Helper::LongDiv => a.wrapping_div(b),
                    _ => a.wrapping_rem(b),
                };
                (4, r as u32, (r as u64 >> 32) as u32)
            }
            Helper::ArrayStoreCheck => {
                let array = self.arg(2, 0)?;
                let value = self.arg(2, 1)?;
                if value != 0 {
                    match self.array_kind(array) {
                        Some(ArrayKind::Reference(0)) => {}
                        Some(ArrayKind::Reference(element)) => {
                            if !self.is_instance(value, element)? {
                                return Err(Fault::ArrayStore(
                                    self.class_of(value)?,
                                    self.type_name(element),
                                ));
                            }
                        }
                        _ => return Err(Fault::BadAddress(array)),
                    }
                }
                (2, old_eax, old_edx)
            }
            Helper::CheckCast => {
                let object = self.arg(2, 0)?;
                let target = self.arg(2, 1)?;
                if object != 0 && !self.is_instance(object, target)? {
                    return Err(Fault::ClassCast(self.class_of(object)?, self.type_name(target)));
                }
                (2, old_eax, old_edx)
            }
            Helper::MonitorEnter | Helper::MonitorExit => {
                let object = self.arg(1, 0)?;
                if object == 0 {
                    return Err(Fault::NullPointer);
                }
                let count = self.monitors.entry(object).or_insert(0);
                if helper == Helper::MonitorEnter {
                    *count += 1;
                } else if *count == 0 {
                    return Err(Fault::IllegalInstruction("monitor exit without enter".into()));
                } else {
                    *count -= 1;
                }
                (1, old_eax, old_edx)
            }
            Helper::Throw => {
                let exception = self.arg(1, 0)?;
                if exception == 0 {
                    return Err(Fault::NullPointer);
                }
                return Err(Fault::Thrown(self.class_of(exception)?));
            }
            Helper::Yield => {
                self.yields += 1;
                (0, old_eax, old_edx)
            }
        };
        self.machine.set_reg(Reg::Eax, eax);
        self.machine.set_reg(Reg::Edx, edx);
        self.machine.return_from_hook(words)
    }

    /// Mark the class initialized, then run superclass and own initializers.
    fn initialize(&mut self, type_object: u32) -> Result<(), Fault> {
        let state_addr = type_object + layout::TYPE_STATE_OFFSET as u32;
        let state = self.read_u32(state_addr)?;
        if state & layout::ST_INITIALIZED as u32 != 0 {
            return Ok(());
        }
        self.write_u32(state_addr, state | layout::ST_INITIALIZED as u32)?;
        let (super_class, clinit, name) = match self.classes.get(&type_object) {
            Some(c) => (c.super_class.clone(), c.clinit, c.name.clone()),
            None => return Err(Fault::BadAddress(type_object)),
        };
        if let Some(parent) = super_class.and_then(|s| self.type_object(&s)) {
            self.initialize(parent)?;
        }
        if let Some(address) = clinit {
            debug!(class = %name, "run class initializer");
            self.call(address, &[])?;
        }
        Ok(())
    }
}

/// Class name of arrays whose elements are `name`.
fn array_of(name: &str) -> String {
    if name.starts_with('[') {
        format!("[{}", name)
    } else {
        format!("[L{};", name)
    }
}

fn array_type(code: u32) -> Result<ArrayType, Fault> {
    Ok(match code {
        4 => ArrayType::Boolean,
        5 => ArrayType::Char,
        6 => ArrayType::Float,
        7 => ArrayType::Double,
        8 => ArrayType::Byte,
        9 => ArrayType::Short,
        10 => ArrayType::Int,
        11 => ArrayType::Long,
        other => {
            return Err(Fault::IllegalInstruction(format!(
                "unknown array type code {}",
                other
            )));
        }
    })
}
