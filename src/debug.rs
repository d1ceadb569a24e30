//! Disassembler for [Chunk]s. Used by the `print_code` and `trace_execution` features, and by
//! the CLI's `--disassemble` flag.
//!
//! ```
//! let script = blox::compiler::compile("print 1").unwrap();
//! let listing = blox::debug::chunk_to_string(&script.chunk, "script");
//! assert!(listing.starts_with("== script =="));
//! assert!(listing.contains("OP_PRINT"));
//! ```
use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};
use crate::value::{Object, Value};

/// Prints a listing of the whole chunk to stdout.
pub fn disassemble_chunk(c: &Chunk, name: &str) {
    print!("{}", chunk_to_string(c, name));
}

/// Prints one instruction to stdout. Returns the offset of the next instruction.
pub fn disassemble_instruction(c: &Chunk, offset: usize) -> usize {
    let (text, next) = instruction_to_string(c, offset);
    println!("{text}");
    next
}

/// Renders a listing of the whole chunk, followed by the listings of every function in its
/// constant pool.
pub fn chunk_to_string(c: &Chunk, name: &str) -> String {
    let mut listing = format!("== {name} ==\n");

    let mut offset = 0;
    while offset < c.len() {
        let (text, next) = instruction_to_string(c, offset);
        listing.push_str(&text);
        listing.push('\n');
        offset = next;
    }

    for constant in c.constants.iter() {
        if let Value::Obj(Object::Function(function)) = constant {
            listing.push_str(&chunk_to_string(&function.chunk, function.display_name()));
        }
    }

    listing
}

/// Returns the offset of the instruction after the one at `offset`.
pub fn next_offset(c: &Chunk, offset: usize) -> usize {
    instruction_to_string(c, offset).1
}

/// Renders one instruction. Returns the text and the offset of the next instruction.
pub fn instruction_to_string(c: &Chunk, offset: usize) -> (String, usize) {
    let mut out = format!("{offset:04} ");

    let line = c.line_number_for(offset);
    if offset > 0 && line == c.line_number_for(offset - 1) {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{:4} ", line.unwrap_or(0));
    }

    let Some(entry) = c.get(offset) else {
        out.push_str("<end of chunk>");
        return (out, offset + 1);
    };
    let Some(instruction) = entry.as_opcode() else {
        let _ = write!(out, "Unknown opcode {}", entry.byte());
        return (out, offset + 1);
    };

    use OpCode::*;
    let next = match instruction {
        Nil | True | False | Pop | Equal | Greater | GreaterEqual | Less | LessEqual | Add
        | Subtract | Multiply | Divide | Modulo | Not | Negate | Print | CloseUpvalue | Return | Inherit | Index
        | IndexAssign | Slice | SliceAssign | EndTry | Raise => {
            simple_instruction(&mut out, instruction, offset)
        }
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call | BuildList | BuildTuple
        | BuildDict => byte_instruction(&mut out, instruction, c, offset),
        Constant | GetGlobal | DefineGlobal | DefineConstGlobal | SetGlobal | AssignConst
        | GetProperty | SetProperty | GetSuper | Class | Method | Import => {
            constant_instruction(&mut out, instruction, c, offset)
        }
        Invoke | SuperInvoke => invoke_instruction(&mut out, instruction, c, offset),
        Jump | JumpIfFalse | Try => jump_instruction(&mut out, instruction, 1, c, offset),
        Loop => jump_instruction(&mut out, instruction, -1, c, offset),
        Closure => closure_instruction(&mut out, c, offset),
    };

    (out, next)
}

/// `GetLocal` becomes `OP_GET_LOCAL`.
fn mnemonic(opcode: OpCode) -> String {
    let mut name = String::from("OP");
    for c in opcode.name().chars() {
        if c.is_ascii_uppercase() {
            name.push('_');
        }
        name.push(c.to_ascii_uppercase());
    }
    name
}

fn operand(c: &Chunk, offset: usize) -> Option<u8> {
    c.get(offset).map(|entry| entry.byte())
}

fn simple_instruction(out: &mut String, opcode: OpCode, offset: usize) -> usize {
    out.push_str(&mnemonic(opcode));
    offset + 1
}

fn byte_instruction(out: &mut String, opcode: OpCode, c: &Chunk, offset: usize) -> usize {
    let _ = write!(out, "{:<20}", mnemonic(opcode));
    match operand(c, offset + 1) {
        Some(slot) => {
            let _ = write!(out, " {slot:4}");
        }
        None => out.push_str(" <missing operand>"),
    }
    offset + 2
}

fn write_constant(out: &mut String, c: &Chunk, index: Option<u8>) {
    match index {
        Some(index) => {
            let _ = write!(out, " {index:4}");
            match c.constants.get(index as usize) {
                Some(value) => {
                    let _ = write!(out, " '{value}'");
                }
                None => out.push_str(" <invalid constant>"),
            }
        }
        None => out.push_str(" <missing operand>"),
    }
}

fn constant_instruction(out: &mut String, opcode: OpCode, c: &Chunk, offset: usize) -> usize {
    let _ = write!(out, "{:<20}", mnemonic(opcode));
    write_constant(out, c, operand(c, offset + 1));
    offset + 2
}

fn invoke_instruction(out: &mut String, opcode: OpCode, c: &Chunk, offset: usize) -> usize {
    let _ = write!(out, "{:<20}", mnemonic(opcode));
    let arg_count = operand(c, offset + 2).unwrap_or(0);
    let _ = write!(out, " ({arg_count} args)");
    write_constant(out, c, operand(c, offset + 1));
    offset + 3
}

fn jump_instruction(
    out: &mut String,
    opcode: OpCode,
    sign: isize,
    c: &Chunk,
    offset: usize,
) -> usize {
    let _ = write!(out, "{:<20}", mnemonic(opcode));
    match c.read_u16(offset + 1) {
        Some(jump) => {
            let target = offset as isize + 3 + sign * jump as isize;
            let _ = write!(out, " {offset:4} -> {target}");
        }
        None => out.push_str(" <missing operand>"),
    }
    offset + 3
}

fn closure_instruction(out: &mut String, c: &Chunk, offset: usize) -> usize {
    let _ = write!(out, "{:<20}", mnemonic(OpCode::Closure));
    let index = operand(c, offset + 1);
    write_constant(out, c, index);

    let upvalue_count = index
        .and_then(|index| c.constants.get(index as usize))
        .map_or(0, |value| match value {
            Value::Obj(Object::Function(function)) => function.upvalue_count,
            _ => 0,
        });

    let mut offset = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = operand(c, offset).unwrap_or(0) != 0;
        let index = operand(c, offset + 1).unwrap_or(0);
        let kind = if is_local { "local" } else { "upvalue" };
        let _ = write!(out, "\n{offset:04}    |                     {kind} {index}");
        offset += 2;
    }
    offset
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::compile;

    #[test]
    fn mnemonics_follow_clox() {
        assert_eq!("OP_RETURN", mnemonic(OpCode::Return));
        assert_eq!("OP_GET_LOCAL", mnemonic(OpCode::GetLocal));
        assert_eq!("OP_JUMP_IF_FALSE", mnemonic(OpCode::JumpIfFalse));
        assert_eq!("OP_GREATER_EQUAL", mnemonic(OpCode::GreaterEqual));
    }

    #[test]
    fn listing_shows_lines_and_operands() {
        let script = compile("print 1\nprint 2").unwrap();
        let listing = chunk_to_string(&script.chunk, "script");
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!("== script ==", lines[0]);
        assert!(lines[1].starts_with("0000    1 OP_CONSTANT"), "{}", lines[1]);
        assert!(lines[1].ends_with("0 '1'"), "{}", lines[1]);
        assert_eq!("0002    | OP_PRINT", lines[2]);
        assert!(lines[3].starts_with("0003    2 OP_CONSTANT"), "{}", lines[3]);
    }

    #[test]
    fn jumps_show_their_target() {
        let script = compile("while (false) {}").unwrap();
        let listing = chunk_to_string(&script.chunk, "script");
        assert!(listing.contains("OP_JUMP_IF_FALSE"), "{listing}");
        assert!(listing.contains("-> 0"), "the loop jumps back to the start: {listing}");
    }

    #[test]
    fn closures_list_their_captures_and_nested_functions() {
        let script = compile("func outer() { var x = 1; func inner() { return x } }").unwrap();
        let listing = chunk_to_string(&script.chunk, "script");
        assert!(listing.contains("== outer =="), "{listing}");
        assert!(listing.contains("== inner =="), "{listing}");
        assert!(listing.contains("local 1"), "{listing}");
    }

    #[test]
    fn next_offset_skips_closure_operands() {
        let script = compile("{ var a = 1; func f() { return a } }").unwrap();
        let chunk = &script.chunk;
        // Constant, index; Closure, index, is_local, slot
        assert_eq!(2, next_offset(chunk, 0));
        assert_eq!(6, next_offset(chunk, 2));
    }
}
