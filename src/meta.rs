//! Class, field and method metadata as seen by the compiler.
//!
//! The compiler only talks to the [`Resolver`] trait. [`ClassPool`] is the
//! in-memory implementation: it links a set of [`ClassDef`]s, assigns object
//! layouts, statics slots, vtables and IMTs, and memoizes every resolution so
//! concurrent compilers sharing one pool see identical answers.

use crate::bytecode::{
    ClassRef, DescriptorError, FieldKind, FieldRef, JvmType, MethodBody, MethodDescriptor,
    MethodRef, parse_field_descriptor,
};
use crate::x86::Mem;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Object, TIB and metadata layout shared by compiled code and the runtime.
pub mod layout {
    pub const SLOT_SIZE: i32 = 4;

    /// Object header: TIB pointer, then a flags/monitor word.
    pub const TIB_OFFSET: i32 = 0;
    pub const FLAGS_OFFSET: i32 = 4;
    pub const OBJECT_HEADER_SIZE: i32 = 8;

    pub const ARRAY_LENGTH_OFFSET: i32 = 8;
    pub const ARRAY_DATA_OFFSET: i32 = 12;

    /// TIB entries (the TIB is an object array).
    pub const TIB_TYPE_INDEX: i32 = 0;
    pub const TIB_IMT_INDEX: i32 = 1;
    pub const TIB_IMT_COLLISIONS_INDEX: i32 = 2;
    pub const TIB_ANCESTORS_INDEX: i32 = 3;
    pub const TIB_FIRST_METHOD_INDEX: i32 = 4;

    pub const IMT_LENGTH: u32 = 64;

    /// Method metadata object fields (used by IMT collision lists).
    pub const METHOD_SELECTOR_OFFSET: i32 = 8;
    pub const METHOD_CODE_OFFSET: i32 = 12;

    /// Type object fields.
    pub const TYPE_STATE_OFFSET: i32 = 8;
    pub const ST_INITIALIZED: i32 = 0x1;

    /// Card-marking granularity of the store barrier.
    pub const CARD_SHIFT: u8 = 9;

    /// Displacement of element `index` of an object array.
    pub const fn array_slot(index: i32) -> i32 {
        ARRAY_DATA_OFFSET + index * SLOT_SIZE
    }
}

/// Runtime helpers reachable through the helper table.
///
/// All helpers use the managed convention: arguments pushed left to right,
/// callee pops, result in EAX or EDX:EAX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    /// (type) -> object
    AllocObject,
    /// (count, array-type code) -> array
    AllocPrimitiveArray,
    /// (count, element type) -> array
    AllocObjectArray,
    /// (count_0 .. count_n-1, n, element type) -> array
    AllocMultiArray,
    /// (type)
    InitializeClass,
    /// (dividend: long, divisor: long) -> long
    LongDiv,
    LongRem,
    /// (array, value); throws on an incompatible element
    ArrayStoreCheck,
    /// (object, type); throws on failure
    CheckCast,
    MonitorEnter,
    MonitorExit,
    /// (exception); does not return
    Throw,
    Yield,
}

impl Helper {
    pub const ALL: [Helper; 13] = [
        Helper::AllocObject,
        Helper::AllocPrimitiveArray,
        Helper::AllocObjectArray,
        Helper::AllocMultiArray,
        Helper::InitializeClass,
        Helper::LongDiv,
        Helper::LongRem,
        Helper::ArrayStoreCheck,
        Helper::CheckCast,
        Helper::MonitorEnter,
        Helper::MonitorExit,
        Helper::Throw,
        Helper::Yield,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u32) -> Option<Helper> {
        Self::ALL.get(index as usize).copied()
    }
}

/// Absolute addresses of the runtime structures compiled code refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeEnv {
    pub statics_base: u32,
    pub helper_table: u32,
    pub card_table: u32,
    pub yield_flag: u32,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self {
            statics_base: 0x0010_0000,
            helper_table: 0x0000_8000,
            card_table: 0x0020_0000,
            yield_flag: 0x0000_7000,
        }
    }
}

impl RuntimeEnv {
    pub fn statics_slot(&self, slot: u32) -> Mem {
        Mem::abs(self.statics_base + slot * layout::SLOT_SIZE as u32)
    }

    pub fn helper(&self, helper: Helper) -> Mem {
        Mem::abs(self.helper_table + helper.index() * layout::SLOT_SIZE as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unknown class `{0}`")]
    UnknownClass(String),
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("incompatible class change: {0}")]
    Incompatible(String),
    #[error("class `{0}` has a cyclic superclass chain")]
    Circularity(String),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClass {
    pub name: String,
    /// Statics slot holding the type object.
    pub type_slot: u32,
    pub initialized: bool,
    pub is_interface: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStorage {
    Instance { offset: i32 },
    Static { slot: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedField {
    pub kind: FieldKind,
    pub storage: FieldStorage,
    pub declaring: ResolvedClass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMethod {
    pub declaring: ResolvedClass,
    pub name: String,
    pub signature: MethodDescriptor,
    pub is_static: bool,
    pub selector: u32,
    /// Index into the virtual-method part of the TIB.
    pub vtable_index: Option<u32>,
    /// Statics slot holding the entry address.
    pub code_slot: u32,
    /// Bytecode, when available for inlining.
    pub body: Option<Arc<MethodBody>>,
}

impl ResolvedMethod {
    /// Argument words including the receiver.
    pub fn arg_slots(&self) -> u16 {
        self.signature.arg_slots() + if self.is_static { 0 } else { 1 }
    }

    pub fn arg_types(&self) -> Vec<JvmType> {
        let mut types = Vec::new();
        if !self.is_static {
            types.push(JvmType::Reference);
        }
        types.extend(self.signature.args.iter().map(|k| k.jvm_type()));
        types
    }

    pub fn return_type(&self) -> Option<JvmType> {
        self.signature.ret.map(FieldKind::jvm_type)
    }

    pub fn imt_index(&self) -> u32 {
        self.selector % layout::IMT_LENGTH
    }
}

/// Metadata collaborator used by the compiler.
pub trait Resolver {
    fn resolve_class(&self, class: &ClassRef) -> Result<Arc<ResolvedClass>, ResolveError>;
    fn resolve_field(&self, field: &FieldRef) -> Result<Arc<ResolvedField>, ResolveError>;
    fn resolve_method(&self, method: &MethodRef) -> Result<Arc<ResolvedMethod>, ResolveError>;
    /// Statics slot holding the interned string object.
    fn resolve_string(&self, value: &str) -> Result<u32, ResolveError>;
}

/// Interface selector: FNV-1a over name and descriptor.
pub fn selector_of(name: &str, descriptor: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in name.bytes().chain(descriptor.bytes()) {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

// ==================== Class definitions ====================

#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub descriptor: String,
    #[serde(default, rename = "static")]
    pub is_static: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassDef {
    pub name: String,
    #[serde(default, rename = "super")]
    pub super_class: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub interface: bool,
    /// Already initialized when code is compiled (no init guard needed).
    #[serde(default)]
    pub initialized: bool,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldDef>,
    #[serde(default, rename = "method")]
    pub methods: Vec<MethodBody>,
}

/// A method as linked into its declaring class.
#[derive(Debug, Clone)]
pub struct LinkedMethod {
    pub class: String,
    pub name: String,
    pub descriptor: String,
    pub is_static: bool,
    pub selector: u32,
    pub code_slot: u32,
    pub vtable_index: Option<u32>,
    pub body: Arc<MethodBody>,
}

impl LinkedMethod {
    pub fn key(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }

    pub fn has_code(&self) -> bool {
        !self.body.code.is_empty()
    }
}

/// One IMT entry of a linked class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImtEntry {
    Empty,
    /// Code slot of the single implementation.
    Single(u32),
    /// (selector, code slot) of every implementation sharing the entry.
    Collision(Vec<(u32, u32)>),
}

#[derive(Debug, Clone)]
pub struct LinkedClass {
    pub name: String,
    pub super_class: Option<String>,
    pub is_interface: bool,
    pub initialized: bool,
    pub type_slot: u32,
    pub instance_size: i32,
    /// Instance fields of this class and its superclasses: name -> (kind, offset).
    pub instance_fields: HashMap<String, (FieldKind, i32)>,
    /// Static fields declared here: name -> (kind, slot).
    pub static_fields: HashMap<String, (FieldKind, u32)>,
    /// Methods declared here, keyed by name + descriptor.
    pub methods: HashMap<String, LinkedMethod>,
    /// Code slots of the virtual methods, in vtable order.
    pub vtable: Vec<u32>,
    vtable_keys: Vec<String>,
    pub imt: Vec<ImtEntry>,
    /// Type slots of the class itself, its superclasses and every interface.
    pub ancestors: Vec<u32>,
    interfaces: BTreeSet<String>,
}

/// Linked, memoizing [`Resolver`].
pub struct ClassPool {
    classes: HashMap<String, LinkedClass>,
    /// Slots handed out so far (strings are interned lazily).
    statics: Mutex<StaticsAllocator>,
    class_memo: Memo<ClassRef, ResolvedClass>,
    field_memo: Memo<FieldRef, ResolvedField>,
    method_memo: Memo<MethodRef, ResolvedMethod>,
}

struct StaticsAllocator {
    next: u32,
    strings: HashMap<String, u32>,
    /// Array classes named by the code, e.g. `[I`, with their type slots.
    arrays: HashMap<String, u32>,
}

impl StaticsAllocator {
    fn intern(table: &mut HashMap<String, u32>, next: &mut u32, key: &str) -> u32 {
        if let Some(slot) = table.get(key) {
            return *slot;
        }
        let slot = *next;
        *next += 1;
        table.insert(key.to_string(), slot);
        slot
    }
}

/// First-use memo table safe to share between compiler threads.
struct Memo<K, V> {
    map: Mutex<HashMap<K, Arc<V>>>,
}

impl<K: Eq + Hash + Clone, V> Memo<K, V> {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_try<E>(&self, key: &K, f: impl FnOnce() -> Result<V, E>) -> Result<Arc<V>, E> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(v) = map.get(key) {
            return Ok(Arc::clone(v));
        }
        let v = Arc::new(f()?);
        map.insert(key.clone(), Arc::clone(&v));
        Ok(v)
    }
}

impl ClassPool {
    /// Link a set of class definitions.
    pub fn new(defs: Vec<ClassDef>) -> Result<Self, ResolveError> {
        let defs: HashMap<String, ClassDef> =
            defs.into_iter().map(|d| (d.name.clone(), d)).collect();
        let mut linker = Linker {
            defs: &defs,
            linked: HashMap::new(),
            in_progress: BTreeSet::new(),
            next_slot: 0,
        };
        let mut names: Vec<&String> = defs.keys().collect();
        names.sort();
        for name in names {
            linker.link(name)?;
        }
        let next = linker.next_slot;
        let mut classes = linker.linked;
        build_imts(&mut classes)?;
        Ok(Self {
            classes,
            statics: Mutex::new(StaticsAllocator {
                next,
                strings: HashMap::new(),
                arrays: HashMap::new(),
            }),
            class_memo: Memo::new(),
            field_memo: Memo::new(),
            method_memo: Memo::new(),
        })
    }

    pub fn class(&self, name: &str) -> Option<&LinkedClass> {
        self.classes.get(name)
    }

    /// Linked classes, sorted by name.
    pub fn classes(&self) -> Vec<&LinkedClass> {
        let mut all: Vec<&LinkedClass> = self.classes.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Every method that has bytecode, sorted by class then key.
    pub fn method_bodies(&self) -> Vec<&LinkedMethod> {
        let mut all: Vec<&LinkedMethod> = self
            .classes()
            .into_iter()
            .flat_map(|c| c.methods.values())
            .filter(|m| m.has_code())
            .collect();
        all.sort_by(|a, b| (&a.class, a.key()).cmp(&(&b.class, b.key())));
        all
    }

    /// Find a method by class and `name(desc)` key.
    pub fn find_method(&self, class: &str, key: &str) -> Option<&LinkedMethod> {
        self.classes.get(class)?.methods.get(key)
    }

    /// Number of statics slots allocated so far.
    pub fn statics_len(&self) -> u32 {
        self.statics.lock().unwrap_or_else(|e| e.into_inner()).next
    }

    /// Interned strings and their slots.
    pub fn strings(&self) -> Vec<(String, u32)> {
        let statics = self.statics.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<(String, u32)> =
            statics.strings.iter().map(|(s, slot)| (s.clone(), *slot)).collect();
        all.sort_by_key(|(_, slot)| *slot);
        all
    }

    /// Array classes resolved so far and their type slots.
    pub fn array_classes(&self) -> Vec<(String, u32)> {
        let statics = self.statics.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<(String, u32)> =
            statics.arrays.iter().map(|(s, slot)| (s.clone(), *slot)).collect();
        all.sort_by_key(|(_, slot)| *slot);
        all
    }

    /// Array classes are not linked; their type object gets a statics slot
    /// the first time code names them.
    fn array_class(&self, name: &str) -> Result<ResolvedClass, ResolveError> {
        parse_field_descriptor(name)?;
        let element = name.trim_start_matches('[');
        if let Some(class) = element.strip_prefix('L').and_then(|e| e.strip_suffix(';')) {
            self.linked(class)?;
        }
        let mut statics = self.statics.lock().unwrap_or_else(|e| e.into_inner());
        let StaticsAllocator { next, arrays, .. } = &mut *statics;
        let type_slot = StaticsAllocator::intern(arrays, next, name);
        Ok(ResolvedClass {
            name: name.to_string(),
            type_slot,
            initialized: true,
            is_interface: false,
        })
    }

    fn linked(&self, name: &str) -> Result<&LinkedClass, ResolveError> {
        self.classes
            .get(name)
            .ok_or_else(|| ResolveError::UnknownClass(name.to_string()))
    }

    fn describe(class: &LinkedClass) -> ResolvedClass {
        ResolvedClass {
            name: class.name.clone(),
            type_slot: class.type_slot,
            initialized: class.initialized,
            is_interface: class.is_interface,
        }
    }

    /// Walk `name` and its superclasses.
    fn chain<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a LinkedClass> + 'a {
        let mut next = self.classes.get(name);
        std::iter::from_fn(move || {
            let cur = next?;
            next = cur.super_class.as_deref().and_then(|s| self.classes.get(s));
            Some(cur)
        })
    }

    fn lookup_method(&self, method: &MethodRef) -> Result<ResolvedMethod, ResolveError> {
        let key = format!("{}{}", method.name, method.descriptor);
        let start = self.linked(&method.class)?;
        let found = self
            .chain(&method.class)
            .find_map(|c| c.methods.get(&key).map(|m| (c, m)))
            .or_else(|| {
                // Interface methods may be inherited from superinterfaces.
                start
                    .interfaces
                    .iter()
                    .filter_map(|i| self.classes.get(i))
                    .find_map(|c| c.methods.get(&key).map(|m| (c, m)))
            });
        let (declaring, m) = found.ok_or_else(|| ResolveError::UnknownMethod(method.to_string()))?;
        let vtable_index = if m.is_static || m.name == "<init>" {
            None
        } else {
            start
                .vtable_keys
                .iter()
                .position(|k| *k == key)
                .map(|i| i as u32)
        };
        Ok(ResolvedMethod {
            declaring: Self::describe(declaring),
            name: m.name.clone(),
            signature: MethodDescriptor::parse(&m.descriptor)?,
            is_static: m.is_static,
            selector: m.selector,
            vtable_index,
            code_slot: m.code_slot,
            body: m.has_code().then(|| Arc::clone(&m.body)),
        })
    }
}

impl Resolver for ClassPool {
    fn resolve_class(&self, class: &ClassRef) -> Result<Arc<ResolvedClass>, ResolveError> {
        self.class_memo.get_or_try(class, || {
            if class.0.starts_with('[') {
                self.array_class(&class.0)
            } else {
                self.linked(&class.0).map(Self::describe)
            }
        })
    }

    fn resolve_field(&self, field: &FieldRef) -> Result<Arc<ResolvedField>, ResolveError> {
        self.field_memo.get_or_try(field, || {
            let kind = parse_field_descriptor(&field.descriptor)?;
            let class = self.linked(&field.class)?;
            if let Some((k, offset)) = class.instance_fields.get(&field.name) {
                if *k == kind {
                    return Ok(ResolvedField {
                        kind,
                        storage: FieldStorage::Instance { offset: *offset },
                        declaring: Self::describe(class),
                    });
                }
            }
            self.chain(&field.class)
                .find_map(|c| {
                    c.static_fields
                        .get(&field.name)
                        .filter(|(k, _)| *k == kind)
                        .map(|(_, slot)| ResolvedField {
                            kind,
                            storage: FieldStorage::Static { slot: *slot },
                            declaring: Self::describe(c),
                        })
                })
                .ok_or_else(|| ResolveError::UnknownField(field.to_string()))
        })
    }

    fn resolve_method(&self, method: &MethodRef) -> Result<Arc<ResolvedMethod>, ResolveError> {
        self.method_memo
            .get_or_try(method, || self.lookup_method(method))
    }

    fn resolve_string(&self, value: &str) -> Result<u32, ResolveError> {
        let mut statics = self.statics.lock().unwrap_or_else(|e| e.into_inner());
        let StaticsAllocator { next, strings, .. } = &mut *statics;
        Ok(StaticsAllocator::intern(strings, next, value))
    }
}

// ==================== Linking ====================

struct Linker<'a> {
    defs: &'a HashMap<String, ClassDef>,
    linked: HashMap<String, LinkedClass>,
    in_progress: BTreeSet<String>,
    next_slot: u32,
}

impl Linker<'_> {
    fn alloc_slots(&mut self, n: u32) -> u32 {
        let slot = self.next_slot;
        self.next_slot += n;
        slot
    }

    fn link(&mut self, name: &str) -> Result<(), ResolveError> {
        if self.linked.contains_key(name) {
            return Ok(());
        }
        if !self.in_progress.insert(name.to_string()) {
            return Err(ResolveError::Circularity(name.to_string()));
        }
        let def = self
            .defs
            .get(name)
            .ok_or_else(|| ResolveError::UnknownClass(name.to_string()))?;
        if let Some(sup) = &def.super_class {
            self.link(sup)?;
        }
        for iface in &def.interfaces {
            self.link(iface)?;
        }

        let parent = def.super_class.as_ref().and_then(|s| self.linked.get(s)).cloned();
        let type_slot = self.alloc_slots(1);

        let mut instance_fields = parent
            .as_ref()
            .map(|p| p.instance_fields.clone())
            .unwrap_or_default();
        let mut instance_size = parent
            .as_ref()
            .map_or(layout::OBJECT_HEADER_SIZE, |p| p.instance_size);
        let mut static_fields = HashMap::new();
        for field in &def.fields {
            let kind = parse_field_descriptor(&field.descriptor)?;
            if field.is_static {
                let slot = self.alloc_slots(kind.slot_size() as u32 / 4);
                static_fields.insert(field.name.clone(), (kind, slot));
            } else {
                instance_fields.insert(field.name.clone(), (kind, instance_size));
                instance_size += kind.slot_size();
            }
        }

        let mut interfaces: BTreeSet<String> = parent
            .as_ref()
            .map(|p| p.interfaces.clone())
            .unwrap_or_default();
        for iface in &def.interfaces {
            interfaces.insert(iface.clone());
            if let Some(i) = self.linked.get(iface) {
                interfaces.extend(i.interfaces.iter().cloned());
            }
        }

        let mut vtable_keys = parent.as_ref().map(|p| p.vtable_keys.clone()).unwrap_or_default();
        let mut vtable = parent.as_ref().map(|p| p.vtable.clone()).unwrap_or_default();
        let mut methods = HashMap::new();
        for body in &def.methods {
            MethodDescriptor::parse(&body.descriptor)?;
            let mut body = body.clone();
            body.class = def.name.clone();
            let key = format!("{}{}", body.name, body.descriptor);
            let code_slot = self.alloc_slots(1);
            let virtual_method = !body.is_static && body.name != "<init>" && !def.interface;
            let vtable_index = if virtual_method {
                let index = match vtable_keys.iter().position(|k| *k == key) {
                    Some(i) => i,
                    None => {
                        vtable_keys.push(key.clone());
                        vtable.push(code_slot);
                        vtable_keys.len() - 1
                    }
                };
                vtable[index] = code_slot;
                Some(index as u32)
            } else {
                None
            };
            methods.insert(
                key,
                LinkedMethod {
                    class: def.name.clone(),
                    name: body.name.clone(),
                    descriptor: body.descriptor.clone(),
                    is_static: body.is_static,
                    selector: selector_of(&body.name, &body.descriptor),
                    code_slot,
                    vtable_index,
                    body: Arc::new(body),
                },
            );
        }

        let mut ancestors = vec![type_slot];
        let mut sup = parent.as_ref();
        while let Some(p) = sup {
            ancestors.push(p.type_slot);
            sup = p.super_class.as_ref().and_then(|s| self.linked.get(s));
        }
        for iface in &interfaces {
            if let Some(i) = self.linked.get(iface) {
                ancestors.push(i.type_slot);
            }
        }

        self.in_progress.remove(name);
        self.linked.insert(
            name.to_string(),
            LinkedClass {
                name: def.name.clone(),
                super_class: def.super_class.clone(),
                is_interface: def.interface,
                initialized: def.initialized,
                type_slot,
                instance_size,
                instance_fields,
                static_fields,
                methods,
                vtable,
                vtable_keys,
                imt: vec![ImtEntry::Empty; layout::IMT_LENGTH as usize],
                ancestors,
                interfaces,
            },
        );
        Ok(())
    }
}

/// Fill the IMT of every concrete class from the interfaces it implements.
fn build_imts(classes: &mut HashMap<String, LinkedClass>) -> Result<(), ResolveError> {
    let names: Vec<String> = classes.keys().cloned().collect();
    for name in names {
        let class = &classes[&name];
        if class.is_interface {
            continue;
        }
        let mut slots: Vec<Vec<(u32, u32)>> = vec![Vec::new(); layout::IMT_LENGTH as usize];
        for iface in &class.interfaces {
            let Some(i) = classes.get(iface) else {
                return Err(ResolveError::UnknownClass(iface.clone()));
            };
            let mut keys: Vec<&String> = i.methods.keys().collect();
            keys.sort();
            for key in keys {
                let m = &i.methods[key];
                if m.is_static {
                    continue;
                }
                // Implementation: nearest definition in the superclass chain.
                let mut cur = Some(class);
                let mut code_slot = None;
                while let Some(c) = cur {
                    if let Some(imp) = c.methods.get(key) {
                        code_slot = Some(imp.code_slot);
                        break;
                    }
                    cur = c.super_class.as_ref().and_then(|s| classes.get(s));
                }
                let Some(code_slot) = code_slot else { continue };
                let entry = &mut slots[(m.selector % layout::IMT_LENGTH) as usize];
                if !entry.iter().any(|(sel, _)| *sel == m.selector) {
                    entry.push((m.selector, code_slot));
                }
            }
        }
        let imt = slots
            .into_iter()
            .map(|mut s| match s.len() {
                0 => ImtEntry::Empty,
                1 => ImtEntry::Single(s[0].1),
                _ => {
                    s.sort();
                    ImtEntry::Collision(s)
                }
            })
            .collect();
        if let Some(c) = classes.get_mut(&name) {
            c.imt = imt;
        }
    }
    Ok(())
}
