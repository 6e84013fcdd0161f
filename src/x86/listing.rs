//! Recording code stream.
//!
//! A [`Listing`] keeps the emitted instructions as values instead of bytes.
//! It prints as Intel-syntax assembly and is what the reference machine in
//! [`crate::sim`] executes. Native offsets are instruction indices.

use super::{CodeStream, EncodeError, Insn, Label};
use std::fmt;

#[derive(Debug, Clone, Default)]
pub struct Listing {
    insns: Vec<Insn>,
    /// Label arena (label id -> instruction index)
    labels: Vec<Option<usize>>,
    error: Option<EncodeError>,
}

impl Listing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Instruction index a label is bound to.
    pub fn target(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Check every instruction and label reference, as the encoder would.
    pub fn check(&self) -> Result<(), EncodeError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        for insn in &self.insns {
            insn.validate()?;
            if let Some(label) = insn.target() {
                if self.target(label).is_none() {
                    return Err(EncodeError::UnboundLabel(label));
                }
            }
        }
        Ok(())
    }

    /// Replay the recorded instructions into another stream.
    pub fn replay(&self, out: &mut dyn CodeStream) {
        let mut mapped: Vec<Option<Label>> = vec![None; self.labels.len()];
        let mut map = |out: &mut dyn CodeStream, label: Label| -> Label {
            *mapped[label.0 as usize].get_or_insert_with(|| out.new_label())
        };
        let mut by_index: Vec<Vec<Label>> = vec![Vec::new(); self.insns.len() + 1];
        for (id, pos) in self.labels.iter().enumerate() {
            if let Some(pos) = pos {
                by_index[*pos].push(Label(id as u32));
            }
        }
        for (i, insn) in self.insns.iter().enumerate() {
            for label in &by_index[i] {
                let l = map(out, *label);
                out.bind(l);
            }
            let insn = match insn {
                Insn::Jmp(l) => Insn::Jmp(map(out, *l)),
                Insn::Jcc(c, l) => Insn::Jcc(*c, map(out, *l)),
                Insn::CallLabel(l) => Insn::CallLabel(map(out, *l)),
                Insn::Loop(l) => Insn::Loop(map(out, *l)),
                other => other.clone(),
            };
            out.emit(insn);
        }
        for label in &by_index[self.insns.len()] {
            let l = map(out, *label);
            out.bind(l);
        }
    }
}

impl CodeStream for Listing {
    fn emit(&mut self, insn: Insn) {
        self.insns.push(insn);
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    fn bind(&mut self, label: Label) {
        match self.labels.get_mut(label.0 as usize) {
            Some(slot @ None) => *slot = Some(self.insns.len()),
            Some(Some(_)) => {
                self.error.get_or_insert(EncodeError::LabelRebound(label));
            }
            None => {
                self.error.get_or_insert(EncodeError::UnboundLabel(label));
            }
        }
    }

    fn position(&self) -> usize {
        self.insns.len()
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bound: Vec<(usize, Label)> = self
            .labels
            .iter()
            .enumerate()
            .filter_map(|(id, pos)| pos.map(|p| (p, Label(id as u32))))
            .collect();
        bound.sort();
        let mut next = bound.iter().peekable();
        for (i, insn) in self.insns.iter().enumerate() {
            while let Some((_, label)) = next.next_if(|(p, _)| *p == i) {
                writeln!(f, "{}:", label)?;
            }
            writeln!(f, "    {:4}  {}", i, insn)?;
        }
        for (_, label) in next {
            writeln!(f, "{}:", label)?;
        }
        Ok(())
    }
}
