//! Builder for emitting bytecode during compilation.
//!
//! Handles encoding opcodes and word operands into raw bytes, collecting the
//! constant pool, and managing forward jumps that need patching. Word
//! operands are aligned to the machine word; the builder pads with zero
//! bytes to reach alignment, and the VM skips the same padding when
//! fetching. Jump operands are relative byte distances measured from the
//! start of the operand word.

use super::{code::WORD, Code, Opcode};
use crate::value::Value;

/// Initial byte-buffer capacity; the buffer doubles on demand and is shrunk
/// to exact size at finalize.
const INITIAL_CAPACITY: usize = 128;

#[derive(Debug)]
pub(crate) struct CodeBuilder {
    bytes: Vec<u8>,
    consts: Vec<Value>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(INITIAL_CAPACITY),
            consts: Vec::new(),
        }
    }

    /// Current cursor position in bytes.
    pub fn pos(&self) -> usize {
        self.bytes.len()
    }

    /// Emits a bare opcode byte.
    pub fn emit(&mut self, op: Opcode) {
        self.bytes.push(op as u8);
    }

    fn align(&mut self) {
        let aligned = self.bytes.len().next_multiple_of(WORD);
        self.bytes.resize(aligned, 0);
    }

    /// Emits an aligned word operand.
    pub fn emit_word(&mut self, word: usize) {
        self.align();
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    /// Emits `PUSH` of a constant-pool entry.
    pub fn emit_push(&mut self, value: Value) {
        self.emit(Opcode::Push);
        let index = self.consts.len();
        self.consts.push(value);
        self.emit_word(index);
    }

    /// Reserves an aligned word for a forward jump distance and returns its
    /// offset for later patching.
    pub fn make_label(&mut self) -> usize {
        self.align();
        let label = self.bytes.len();
        self.bytes.extend_from_slice(&0usize.to_le_bytes());
        label
    }

    /// Patches a reserved label with the distance from the label word to the
    /// current position.
    pub fn patch_label(&mut self, label: usize) {
        let distance = self.bytes.len() - label;
        self.bytes[label..label + WORD].copy_from_slice(&distance.to_le_bytes());
    }

    /// Appends the terminating `RET` and produces the finalized, exact-size
    /// bytecode object.
    pub fn finalize(mut self) -> Code {
        self.emit(Opcode::Ret);
        self.bytes.shrink_to_fit();
        self.consts.shrink_to_fit();
        Code::new(self.bytes, self.consts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_operands_are_aligned() {
        let mut b = CodeBuilder::new();
        b.emit(Opcode::Noop);
        b.emit_word(42);
        assert_eq!(b.pos(), WORD + WORD);
        let code = b.finalize();
        // opcode byte, zero padding up to the word boundary, then the word
        assert_eq!(code.bytes()[0], Opcode::Noop as u8);
        assert!(code.bytes()[1..WORD].iter().all(|&b| b == 0));
        let (word, next) = code.read_word(1);
        assert_eq!(word, 42);
        assert_eq!(next, 2 * WORD);
    }

    #[test]
    fn labels_record_distance_from_operand_word() {
        let mut b = CodeBuilder::new();
        b.emit(Opcode::Jump);
        let label = b.make_label();
        b.emit(Opcode::Noop);
        b.emit(Opcode::Noop);
        b.patch_label(label);
        let target = b.pos();
        let code = b.finalize();
        let (distance, _) = code.read_word(1);
        assert_eq!(label + distance, target);
    }

    #[test]
    fn push_collects_constants() {
        let mut b = CodeBuilder::new();
        b.emit_push(Value::Int(7));
        b.emit_push(Value::Bool(true));
        let code = b.finalize();
        assert_eq!(code.constants(), &[Value::Int(7), Value::Bool(true)]);
        let (index, _) = code.read_word(1);
        assert_eq!(index, 0);
    }

    #[test]
    fn finalize_appends_ret() {
        let code = CodeBuilder::new().finalize();
        assert_eq!(code.bytes(), &[Opcode::Ret as u8]);
    }
}
