//! Bytecode vocabulary: operand types, symbolic references, opcodes and
//! method bodies.
//!
//! Addresses are instruction indices into [`MethodBody::code`].

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Semantic type of an operand-stack value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JvmType {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl JvmType {
    /// Number of native words (1 or 2).
    pub fn category(self) -> u8 {
        match self {
            JvmType::Long | JvmType::Double => 2,
            _ => 1,
        }
    }

    pub fn is_wide(self) -> bool {
        self.category() == 2
    }

    pub fn size(self) -> i32 {
        self.category() as i32 * 4
    }
}

impl fmt::Display for JvmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JvmType::Int => "int",
            JvmType::Long => "long",
            JvmType::Float => "float",
            JvmType::Double => "double",
            JvmType::Reference => "reference",
        })
    }
}

/// Storage kind of a field or array element, keeping narrow widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl FieldKind {
    pub fn jvm_type(self) -> JvmType {
        match self {
            FieldKind::Long => JvmType::Long,
            FieldKind::Float => JvmType::Float,
            FieldKind::Double => JvmType::Double,
            FieldKind::Reference => JvmType::Reference,
            _ => JvmType::Int,
        }
    }

    /// Size in bytes when stored in an object or array.
    pub fn size(self) -> i32 {
        match self {
            FieldKind::Boolean | FieldKind::Byte => 1,
            FieldKind::Char | FieldKind::Short => 2,
            FieldKind::Long | FieldKind::Double => 8,
            _ => 4,
        }
    }

    /// Size of the slot the field occupies in an object or the statics table.
    pub fn slot_size(self) -> i32 {
        self.size().max(4)
    }

    /// Descriptor character; `L` for references.
    pub fn descriptor_char(self) -> char {
        match self {
            FieldKind::Boolean => 'Z',
            FieldKind::Byte => 'B',
            FieldKind::Char => 'C',
            FieldKind::Short => 'S',
            FieldKind::Int => 'I',
            FieldKind::Long => 'J',
            FieldKind::Float => 'F',
            FieldKind::Double => 'D',
            FieldKind::Reference => 'L',
        }
    }

    fn from_char(c: char) -> Option<FieldKind> {
        Some(match c {
            'Z' => FieldKind::Boolean,
            'B' => FieldKind::Byte,
            'C' => FieldKind::Char,
            'S' => FieldKind::Short,
            'I' => FieldKind::Int,
            'J' => FieldKind::Long,
            'F' => FieldKind::Float,
            'D' => FieldKind::Double,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("malformed descriptor `{0}`")]
    Malformed(String),
    #[error("malformed reference `{0}`")]
    BadReference(String),
}

/// Parse one field type at the start of `s`, returning it and the rest.
fn parse_field_type(s: &str) -> Option<(FieldKind, &str)> {
    let c = s.chars().next()?;
    match c {
        'L' => {
            let end = s.find(';')?;
            Some((FieldKind::Reference, &s[end + 1..]))
        }
        '[' => {
            let rest = s.trim_start_matches('[');
            let (_, rest) = parse_field_type(rest)?;
            Some((FieldKind::Reference, rest))
        }
        _ => FieldKind::from_char(c).map(|k| (k, &s[1..])),
    }
}

/// Parse a field descriptor such as `I` or `Ljava/lang/String;`.
pub fn parse_field_descriptor(desc: &str) -> Result<FieldKind, DescriptorError> {
    match parse_field_type(desc) {
        Some((kind, "")) => Ok(kind),
        _ => Err(DescriptorError::Malformed(desc.to_string())),
    }
}

/// Argument and return kinds of a method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub args: Vec<FieldKind>,
    pub ret: Option<FieldKind>,
}

impl MethodDescriptor {
    pub fn parse(desc: &str) -> Result<Self, DescriptorError> {
        let bad = || DescriptorError::Malformed(desc.to_string());
        let mut rest = desc.strip_prefix('(').ok_or_else(bad)?;
        let mut args = Vec::new();
        while !rest.starts_with(')') {
            let (kind, r) = parse_field_type(rest).ok_or_else(bad)?;
            args.push(kind);
            rest = r;
        }
        let ret = match &rest[1..] {
            "V" => None,
            r => Some(parse_field_descriptor(r).map_err(|_| bad())?),
        };
        Ok(MethodDescriptor { args, ret })
    }

    /// Argument words, excluding any receiver.
    pub fn arg_slots(&self) -> u16 {
        self.args.iter().map(|k| k.jvm_type().category() as u16).sum()
    }
}

/// Symbolic class reference, written `pkg/Name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct ClassRef(pub String);

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Symbolic field reference, written `pkg/Name.field:Desc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct FieldRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

impl FromStr for FieldRef {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DescriptorError::BadReference(s.to_string());
        let (owner, desc) = s.split_once(':').ok_or_else(bad)?;
        let (class, name) = owner.rsplit_once('.').ok_or_else(bad)?;
        if class.is_empty() || name.is_empty() {
            return Err(bad());
        }
        parse_field_descriptor(desc)?;
        Ok(FieldRef {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: desc.to_string(),
        })
    }
}

impl TryFrom<String> for FieldRef {
    type Error = DescriptorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.class, self.name, self.descriptor)
    }
}

/// Symbolic method reference, written `pkg/Name.method(Args)Ret`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct MethodRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

impl FromStr for MethodRef {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DescriptorError::BadReference(s.to_string());
        let paren = s.find('(').ok_or_else(bad)?;
        let (owner, desc) = s.split_at(paren);
        let (class, name) = owner.rsplit_once('.').ok_or_else(bad)?;
        if class.is_empty() || name.is_empty() {
            return Err(bad());
        }
        MethodDescriptor::parse(desc)?;
        Ok(MethodRef {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: desc.to_string(),
        })
    }
}

impl TryFrom<String> for MethodRef {
    type Error = DescriptorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.descriptor)
    }
}

/// Element type operand of `newarray`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl ArrayType {
    pub fn element(self) -> FieldKind {
        match self {
            ArrayType::Boolean => FieldKind::Boolean,
            ArrayType::Char => FieldKind::Char,
            ArrayType::Float => FieldKind::Float,
            ArrayType::Double => FieldKind::Double,
            ArrayType::Byte => FieldKind::Byte,
            ArrayType::Short => FieldKind::Short,
            ArrayType::Int => FieldKind::Int,
            ArrayType::Long => FieldKind::Long,
        }
    }
}

/// Operand of `ldc`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LdcValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Class(ClassRef),
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    Nop,
    AconstNull,
    Iconst(i32),
    Lconst(i64),
    Fconst(f32),
    Dconst(f64),
    Ldc(LdcValue),

    Iload(u16),
    Lload(u16),
    Fload(u16),
    Dload(u16),
    Aload(u16),
    Istore(u16),
    Lstore(u16),
    Fstore(u16),
    Dstore(u16),
    Astore(u16),

    Iaload,
    Laload,
    Faload,
    Daload,
    Aaload,
    Baload,
    Caload,
    Saload,
    Iastore,
    Lastore,
    Fastore,
    Dastore,
    Aastore,
    Bastore,
    Castore,
    Sastore,

    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,

    Iadd,
    Ladd,
    Fadd,
    Dadd,
    Isub,
    Lsub,
    Fsub,
    Dsub,
    Imul,
    Lmul,
    Fmul,
    Dmul,
    Idiv,
    Ldiv,
    Fdiv,
    Ddiv,
    Irem,
    Lrem,
    Frem,
    Drem,
    Ineg,
    Lneg,
    Fneg,
    Dneg,
    Ishl,
    Lshl,
    Ishr,
    Lshr,
    Iushr,
    Lushr,
    Iand,
    Land,
    Ior,
    Lor,
    Ixor,
    Lxor,
    Iinc { index: u16, delta: i32 },

    I2l,
    I2f,
    I2d,
    L2i,
    L2f,
    L2d,
    F2i,
    F2l,
    F2d,
    D2i,
    D2l,
    D2f,
    I2b,
    I2c,
    I2s,

    Lcmp,
    Fcmpl,
    Fcmpg,
    Dcmpl,
    Dcmpg,

    Ifeq(u32),
    Ifne(u32),
    Iflt(u32),
    Ifge(u32),
    Ifgt(u32),
    Ifle(u32),
    IfIcmpeq(u32),
    IfIcmpne(u32),
    IfIcmplt(u32),
    IfIcmpge(u32),
    IfIcmpgt(u32),
    IfIcmple(u32),
    IfAcmpeq(u32),
    IfAcmpne(u32),
    Ifnull(u32),
    Ifnonnull(u32),
    Goto(u32),
    Jsr(u32),
    Ret(u16),
    Tableswitch { default: u32, low: i32, targets: Vec<u32> },
    Lookupswitch { default: u32, pairs: Vec<(i32, u32)> },

    Ireturn,
    Lreturn,
    Freturn,
    Dreturn,
    Areturn,
    Return,

    Getstatic(FieldRef),
    Putstatic(FieldRef),
    Getfield(FieldRef),
    Putfield(FieldRef),
    Invokevirtual(MethodRef),
    Invokespecial(MethodRef),
    Invokestatic(MethodRef),
    Invokeinterface(MethodRef),

    New(ClassRef),
    Newarray(ArrayType),
    Anewarray(ClassRef),
    Multianewarray { class: ClassRef, dims: u8 },
    Arraylength,
    Athrow,
    Checkcast(ClassRef),
    Instanceof(ClassRef),
    Monitorenter,
    Monitorexit,
}

impl Opcode {
    /// Explicit branch targets (not the fall-through successor).
    pub fn branch_targets(&self) -> Vec<u32> {
        use Opcode::*;
        match self {
            Ifeq(t) | Ifne(t) | Iflt(t) | Ifge(t) | Ifgt(t) | Ifle(t) | IfIcmpeq(t)
            | IfIcmpne(t) | IfIcmplt(t) | IfIcmpge(t) | IfIcmpgt(t) | IfIcmple(t)
            | IfAcmpeq(t) | IfAcmpne(t) | Ifnull(t) | Ifnonnull(t) | Goto(t) | Jsr(t) => {
                vec![*t]
            }
            Tableswitch { default, targets, .. } => {
                let mut all = targets.clone();
                all.push(*default);
                all
            }
            Lookupswitch { default, pairs } => {
                let mut all: Vec<u32> = pairs.iter().map(|(_, t)| *t).collect();
                all.push(*default);
                all
            }
            _ => Vec::new(),
        }
    }

    /// Whether this instruction ends a basic block.
    pub fn ends_block(&self) -> bool {
        !self.branch_targets().is_empty() || !self.falls_through()
    }

    /// Whether control can continue with the next instruction.
    /// `jsr` counts as falling through: the subroutine returns there.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Opcode::Goto(_)
                | Opcode::Ret(_)
                | Opcode::Tableswitch { .. }
                | Opcode::Lookupswitch { .. }
                | Opcode::Ireturn
                | Opcode::Lreturn
                | Opcode::Freturn
                | Opcode::Dreturn
                | Opcode::Areturn
                | Opcode::Return
                | Opcode::Athrow
        )
    }

    pub fn is_return(&self) -> bool {
        matches!(
            self,
            Opcode::Ireturn
                | Opcode::Lreturn
                | Opcode::Freturn
                | Opcode::Dreturn
                | Opcode::Areturn
                | Opcode::Return
        )
    }

    /// Typed local store for a value of `ty`.
    pub fn store_for(ty: JvmType, index: u16) -> Opcode {
        match ty {
            JvmType::Int => Opcode::Istore(index),
            JvmType::Long => Opcode::Lstore(index),
            JvmType::Float => Opcode::Fstore(index),
            JvmType::Double => Opcode::Dstore(index),
            JvmType::Reference => Opcode::Astore(index),
        }
    }

    /// The same instruction with local indices shifted by `base`.
    pub fn relocate_locals(&self, base: u16) -> Opcode {
        use Opcode::*;
        match self {
            Iload(i) => Iload(i + base),
            Lload(i) => Lload(i + base),
            Fload(i) => Fload(i + base),
            Dload(i) => Dload(i + base),
            Aload(i) => Aload(i + base),
            Istore(i) => Istore(i + base),
            Lstore(i) => Lstore(i + base),
            Fstore(i) => Fstore(i + base),
            Dstore(i) => Dstore(i + base),
            Astore(i) => Astore(i + base),
            Ret(i) => Ret(i + base),
            Iinc { index, delta } => Iinc {
                index: index + base,
                delta: *delta,
            },
            other => other.clone(),
        }
    }
}

/// One exception-table entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExceptionHandler {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    #[serde(default)]
    pub catch_type: Option<ClassRef>,
}

/// A method ready for compilation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MethodBody {
    /// Declaring class; filled in by the loader when read from a class table.
    #[serde(default)]
    pub class: String,
    pub name: String,
    pub descriptor: String,
    #[serde(default, rename = "static")]
    pub is_static: bool,
    #[serde(default)]
    pub max_locals: u16,
    #[serde(default)]
    pub code: Vec<Opcode>,
    #[serde(default)]
    pub handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    pub fn signature(&self) -> Result<MethodDescriptor, DescriptorError> {
        MethodDescriptor::parse(&self.descriptor)
    }

    /// Argument words including the receiver.
    pub fn arg_slots(&self) -> Result<u16, DescriptorError> {
        let sig = self.signature()?;
        Ok(sig.arg_slots() + if self.is_static { 0 } else { 1 })
    }

    /// Types of the incoming local slots, receiver first.
    pub fn arg_types(&self) -> Result<Vec<JvmType>, DescriptorError> {
        let sig = self.signature()?;
        let mut types = Vec::with_capacity(sig.args.len() + 1);
        if !self.is_static {
            types.push(JvmType::Reference);
        }
        types.extend(sig.args.iter().map(|k| k.jvm_type()));
        Ok(types)
    }

    pub fn method_ref(&self) -> MethodRef {
        MethodRef {
            class: self.class.clone(),
            name: self.name.clone(),
            descriptor: self.descriptor.clone(),
        }
    }
}

impl fmt::Display for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.descriptor)
    }
}
