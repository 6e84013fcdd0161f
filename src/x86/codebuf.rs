//! Code buffer for encoded IA-32 code.
//!
//! Bytes are appended as instructions are encoded. Branches to labels that
//! are not bound yet leave a placeholder and a fixup; [`CodeBuffer::resolve`]
//! patches every fixup once the whole method has been emitted.

use super::{EncodeError, Label};

/// Size of a label reference to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefSize {
    /// 32-bit displacement relative to the end of the field
    Rel32,
    /// 8-bit displacement relative to the end of the field (LOOP)
    Rel8,
}

/// A buffer for building machine code.
pub struct CodeBuffer {
    /// The code bytes
    code: Vec<u8>,
    /// Label arena (label id -> bound offset)
    labels: Vec<Option<usize>>,
    /// Pending references (field offset, label, size)
    fixups: Vec<(usize, Label, RefSize)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a new code buffer with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind a label to the current offset.
    pub fn bind_label(&mut self, label: Label) -> Result<(), EncodeError> {
        let slot = self
            .labels
            .get_mut(label.0 as usize)
            .ok_or(EncodeError::UnboundLabel(label))?;
        if slot.is_some() {
            return Err(EncodeError::LabelRebound(label));
        }
        *slot = Some(self.code.len());
        Ok(())
    }

    /// Get the offset of a label (if bound).
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Emit a placeholder displacement to `label`, patched by `resolve`.
    pub fn emit_label_ref(&mut self, label: Label, size: RefSize) {
        self.fixups.push((self.code.len(), label, size));
        match size {
            RefSize::Rel32 => self.emit_u32(0),
            RefSize::Rel8 => self.emit_u8(0),
        }
    }

    /// Patch all label references.
    pub fn resolve(&mut self) -> Result<(), EncodeError> {
        for (at, label, size) in self.fixups.drain(..) {
            let target = self
                .labels
                .get(label.0 as usize)
                .copied()
                .flatten()
                .ok_or(EncodeError::UnboundLabel(label))? as i64;
            match size {
                RefSize::Rel32 => {
                    let rel = target - (at as i64 + 4);
                    self.code[at..at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
                }
                RefSize::Rel8 => {
                    let rel = target - (at as i64 + 1);
                    if !(-128..=127).contains(&rel) {
                        return Err(EncodeError::Rel8OutOfRange(label));
                    }
                    self.code[at] = rel as i8 as u8;
                }
            }
        }
        Ok(())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer and return the raw code bytes.
    /// Note: This does not patch label references - call `resolve` first.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }

    /// Pad with NOPs up to the given alignment.
    pub fn align(&mut self, alignment: usize) {
        while self.code.len() % alignment != 0 {
            self.emit_u8(0x90);
        }
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}
