//! Contains a [Chunk] of [OpCode].

use crate::value::{Value, ValueArray};
use crate::with_try_from_u8;

extern crate static_assertions as sa;

with_try_from_u8! {
    /// A one-byte operation code for blox.
    ///
    /// Operands follow the opcode in the byte stream. Unless noted, an operand is one byte;
    /// "constant" operands index the chunk's constant pool.
    #[repr(u8)]
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub enum OpCode {
        /// constant
        Constant,
        Nil,
        True,
        False,
        Pop,
        /// stack slot (relative to the frame)
        GetLocal,
        /// stack slot (relative to the frame)
        SetLocal,
        /// constant (name)
        GetGlobal,
        /// constant (name)
        DefineGlobal,
        /// constant (name)
        DefineConstGlobal,
        /// constant (name)
        SetGlobal,
        /// upvalue index
        GetUpvalue,
        /// upvalue index
        SetUpvalue,
        /// constant (name); always raises "Cannot assign to const".
        AssignConst,
        /// constant (name)
        GetProperty,
        /// constant (name)
        SetProperty,
        /// constant (name)
        GetSuper,
        Equal,
        Greater,
        GreaterEqual,
        Less,
        LessEqual,
        Add,
        Subtract,
        Multiply,
        Divide,
        Modulo,
        Not,
        Negate,
        Print,
        /// u16 forward offset
        Jump,
        /// u16 forward offset
        JumpIfFalse,
        /// u16 backward offset
        Loop,
        /// argument count
        Call,
        /// constant (name), argument count
        Invoke,
        /// constant (name), argument count
        SuperInvoke,
        /// constant (function), then (is_local, index) per upvalue
        Closure,
        CloseUpvalue,
        Return,
        /// constant (name)
        Class,
        Inherit,
        /// constant (name)
        Method,
        /// item count
        BuildList,
        /// item count
        BuildTuple,
        /// entry count
        BuildDict,
        Index,
        IndexAssign,
        Slice,
        SliceAssign,
        /// constant (path)
        Import,
        /// u16 forward offset to the handler
        Try,
        EndTry,
        Raise,
    }
}

sa::assert_eq_size!(OpCode, u8);

/// A chunk of code, with metadata.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Chunk {
    code: Vec<u8>,
    pub constants: ValueArray,
    lines: Vec<LineNumberRun>,
}

/// A valid byte from a chunk. This byte can then be interpreted as required.
#[derive(Clone, Copy)]
pub struct BytecodeEntry<'a> {
    byte: u8,
    provenance: &'a Chunk,
}

/// An [OpCode] that has already been written to the bytestream.
///
/// This opcode can be augmented with additional operands.
pub struct WrittenOpcode<'a> {
    line: usize,
    provenance: &'a mut Chunk,
}

/// An entry of run-length encoded line numbers.
/// Every entry signifies that the next [length] bytes have the same line number
#[derive(Debug, Clone, PartialEq)]
struct LineNumberRun {
    /// The actual line number
    line_number: usize,
    /// How many consecutive bytes came from this line
    length: usize,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl Chunk {
    /// Return a new, empty [Chunk].
    pub fn new() -> Self {
        Chunk::default()
    }

    /// Rebuilds a chunk from its raw parts. `lines` has one entry per byte of `code`.
    ///
    /// Returns `None` when the line table does not line up with the code.
    pub fn from_parts(code: Vec<u8>, lines: &[usize], constants: Vec<Value>) -> Option<Self> {
        if code.len() != lines.len() {
            return None;
        }

        let mut chunk = Chunk::new();
        for (byte, &line) in code.into_iter().zip(lines) {
            chunk.write(byte, line);
        }
        for constant in constants {
            chunk.constants.write(constant);
        }
        Some(chunk)
    }

    /// Get an entry from the bytecode stream.
    ///
    /// Returns `Some(entry)` when the offset is in [0, self.len()).
    pub fn get(&self, offset: usize) -> Option<BytecodeEntry> {
        self.code.get(offset).copied().map(|byte| BytecodeEntry {
            byte,
            provenance: self,
        })
    }

    /// Reads a big-endian u16 operand starting at the given offset.
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let high = *self.code.get(offset)?;
        let low = *self.code.get(offset + 1)?;
        Some(u16::from_be_bytes([high, low]))
    }

    /// The raw byte stream.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Append a single [OpCode] to the chunk.
    pub fn write_opcode(&mut self, opcode: OpCode, line: usize) -> WrittenOpcode {
        self.write(opcode as u8, line);

        WrittenOpcode {
            line,
            provenance: self,
        }
    }

    /// Overwrites two bytes at `offset` with a big-endian u16. Used to backpatch jumps.
    ///
    /// # Panics
    ///
    /// Panics if the offset is not within the code already written.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        let [high, low] = value.to_be_bytes();
        self.code[offset] = high;
        self.code[offset + 1] = low;
    }

    /// Adds a constant to the constant pool, and returns its index.
    ///
    /// Since the available indices are 0-255, there is only room for 256 constants. Adding the
    /// 257th constant or greater returns `None` (the constant is not added).
    pub fn add_constant(&mut self, value: Value) -> Option<u8> {
        if self.constants.len() > u8::MAX as usize {
            return None;
        }
        let index = self.constants.write(value);
        u8::try_from(index).ok()
    }

    /// Returns the line number for whatever is at the given offset.
    pub fn line_number_for(&self, offset: usize) -> Option<usize> {
        let mut base_offset = 0;
        for run in self.lines.iter() {
            if (base_offset..base_offset + run.length).contains(&offset) {
                return Some(run.line_number);
            }

            base_offset += run.length;
        }

        None
    }

    /// Returns the line number of every byte, in order.
    pub fn lines(&self) -> Vec<usize> {
        self.lines
            .iter()
            .flat_map(|run| std::iter::repeat(run.line_number).take(run.length))
            .collect()
    }

    /// Returns the length of the byte stream.
    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Returns true if nothing has been appended to the byte stream.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Actually writes to the byte stream.
    fn write(&mut self, payload: u8, line_number: usize) {
        self.code.push(payload);

        // Figure out the line number
        if let Some(run) = self.previous_line_number_run() {
            if run.line_number == line_number {
                run.increment()
            } else {
                // Must create new run
                self.lines.push(LineNumberRun::new(line_number))
            }
        } else {
            assert!(self.lines.is_empty());
            self.lines.push(LineNumberRun::new(line_number))
        }
    }

    /// Return the last line number run
    #[inline(always)]
    fn previous_line_number_run(&mut self) -> Option<&mut LineNumberRun> {
        self.lines.last_mut()
    }
}

impl LineNumberRun {
    fn new(line_number: usize) -> Self {
        Self {
            line_number,
            length: 1,
        }
    }

    fn increment(&mut self) {
        self.length += 1;
    }
}

impl<'a> BytecodeEntry<'a> {
    /// Returns the raw byte, e.g., a stack slot or an argument count.
    #[inline(always)]
    pub fn byte(self) -> u8 {
        self.byte
    }

    /// Returns the byte as an index into the constant pool.
    #[inline(always)]
    pub fn as_constant_index(self) -> usize {
        self.byte as usize
    }

    /// Returns the byte decoded as an [OpCode].
    /// Returns `None` if the byte is not a valid opcode.
    #[inline]
    pub fn as_opcode(self) -> Option<OpCode> {
        self.byte.try_into().ok()
    }

    /// Yanks out a constant from the constant pool.
    #[inline]
    pub fn resolve_constant(self) -> Option<&'a Value> {
        self.provenance.constants.get(self.as_constant_index())
    }
}

impl<'a> WrittenOpcode<'a> {
    /// Appends the operand to the byte stream for the last written instruction.
    #[inline]
    pub fn with_operand(self, operand: u8) -> Self {
        self.provenance.write(operand, self.line);
        self
    }

    /// Appends a big-endian u16 operand. Returns the offset of its first byte, for patching.
    #[inline]
    pub fn with_u16(self, operand: u16) -> usize {
        let offset = self.provenance.len();
        let [high, low] = operand.to_be_bytes();
        self.provenance.write(high, self.line);
        self.provenance.write(low, self.line);
        offset
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boring_test_of_chunk() {
        let c = Chunk::default();
        assert_eq!(0, c.code.len());
    }

    #[test]
    fn mess_around_with_bytecode() {
        let mut c = Chunk::new();
        let i = c.add_constant(1.0.into()).unwrap();
        c.write_opcode(OpCode::Constant, 123).with_operand(i);
        c.write_opcode(OpCode::Return, 123);

        assert!(c.len() >= 3);

        // Constant
        assert_eq!(Some(OpCode::Constant), c.get(0).unwrap().as_opcode());
        assert_eq!(Some(0), c.get(1).map(|b| b.as_constant_index()));
        assert_eq!(
            Some(&Value::Float(1.0)),
            c.get(1).and_then(|b| b.resolve_constant())
        );

        // Return
        assert_eq!(Some(OpCode::Return), c.get(2).unwrap().as_opcode());
    }

    #[test]
    fn line_numbers() {
        let mut c = Chunk::new();

        let idx = c.add_constant(1.2.into()).unwrap();

        // Write a bunch of opcodes on the same line.
        c.write_opcode(OpCode::Constant, 1).with_operand(idx);
        c.write_opcode(OpCode::Constant, 1).with_operand(idx);
        c.write_opcode(OpCode::Constant, 1).with_operand(idx);
        assert_eq!(6, c.len());

        // Write a bunch of opcodes on a different line.
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        assert_eq!(14, c.len());

        // Write an opcode on yet a different line
        c.write_opcode(OpCode::Return, 4);
        assert_eq!(15, c.len());

        // Check line numbers.
        assert_eq!(Some(1), c.line_number_for(2));
        assert_eq!(Some(2), c.line_number_for(10));
        assert_eq!(Some(4), c.line_number_for(c.len() - 1));

        let lines = c.lines();
        assert_eq!(c.len(), lines.len());
        let rebuilt = Chunk::from_parts(c.code.clone(), &lines, vec![1.2.into()]);
        assert_eq!(Some(c), rebuilt);
    }

    #[test]
    fn the_constant_pool_holds_256_values() {
        let mut c = Chunk::new();
        for i in 0..256 {
            assert_eq!(Some(i as u8), c.add_constant(Value::Int(i)));
        }
        assert_eq!(None, c.add_constant(Value::Int(256)));
        assert_eq!(256, c.constants.len());
    }

    #[test]
    fn jumps_are_patched_in_place() {
        let mut c = Chunk::new();
        let offset = c.write_opcode(OpCode::Jump, 1).with_u16(0xffff);
        assert_eq!(1, offset);
        c.patch_u16(offset, 0x0102);
        assert_eq!(Some(0x0102), c.read_u16(offset));
        assert_eq!(&[OpCode::Jump as u8, 1, 2], c.code());
    }

    #[test]
    fn every_opcode_round_trips_through_a_byte() {
        for byte in 0..OpCode::COUNT as u8 {
            let opcode = OpCode::try_from(byte).expect("contiguous opcodes");
            assert_eq!(byte, opcode as u8);
        }
        let past_the_end = OpCode::COUNT as u8;
        assert_eq!(Err(past_the_end), OpCode::try_from(past_the_end));
    }
}
