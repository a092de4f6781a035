use std::io::{self, Write};

use crate::{Chunk, OpCode};

/// Go through the instructions in the chunk and display them in human-readable
/// format, with a box-drawing overlay of forward jumps and backward loops.
pub fn disassemble_chunk(chunk: &Chunk, name: &str, out: &mut impl Write) -> io::Result<()> {
    Disassembler::new(chunk).print(name, out)
}

/// Renders one chunk. All overlay bookkeeping lives on the value so that no
/// state leaks from one disassembly into the next.
#[derive(Debug)]
pub struct Disassembler<'a> {
    chunk: &'a Chunk,
    loops: Vec<(usize, usize)>,
    false_jumps: Vec<usize>,
    jumps: Vec<usize>,
    loop_depth: usize,
}

impl<'a> Disassembler<'a> {
    /// Create a disassembler for the chunk, pre-scanning it for loop spans.
    pub fn new(chunk: &'a Chunk) -> Self {
        let mut loops = Vec::new();
        for idx in 0..chunk.instructions_count() {
            if let (OpCode::Loop(offset), _) = chunk.read_instruction(idx) {
                loops.push((idx + 1 - *offset as usize, idx));
            }
        }
        Self {
            chunk,
            loops,
            false_jumps: Vec::new(),
            jumps: Vec::new(),
            loop_depth: 0,
        }
    }

    /// Print every instruction of the chunk.
    pub fn print(&mut self, name: &str, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "== {} ==", name)?;
        for idx in 0..self.chunk.instructions_count() {
            self.print_instruction(idx, out)?;
        }
        Ok(())
    }

    fn print_instruction(&mut self, idx: usize, out: &mut impl Write) -> io::Result<()> {
        let (opcode, pos) = self.chunk.read_instruction(idx);

        // Conditional jumps open an arc on the left of the offset column.
        if let OpCode::JumpIfFalse(offset) = opcode {
            let glyph = if self.false_jumps.is_empty() { "┌╼" } else { "├╼" };
            self.false_jumps.push(idx + 1 + *offset as usize);
            write!(out, "{}", glyph)?;
        } else if self.false_jumps.contains(&idx) {
            self.false_jumps.retain(|target| *target != idx);
            write!(
                out,
                "{}",
                if self.false_jumps.is_empty() { "└─" } else { "├─" }
            )?;
        } else if !self.false_jumps.is_empty() {
            write!(out, "│ ")?;
        } else {
            write!(out, "  ")?;
        }

        write!(out, " {:04} ", idx)?;

        // Unconditional jumps open an arc on the right of the offset column.
        if let OpCode::Jump(offset) = opcode {
            let glyph = if self.jumps.is_empty() { "╾┐" } else { "╾┤" };
            self.jumps.push(idx + 1 + *offset as usize);
            write!(out, "{}", glyph)?;
        } else if self.jumps.contains(&idx) {
            self.jumps.retain(|target| *target != idx);
            write!(out, "{}", if self.jumps.is_empty() { "─┘" } else { "─┤" })?;
        } else if !self.jumps.is_empty() {
            write!(out, " │")?;
        } else {
            write!(out, "  ")?;
        }

        // Loop spans, found by the pre-scan since they point backwards.
        let opens = self.loops.iter().filter(|(start, _)| *start == idx).count();
        let closes = self.loops.iter().filter(|(_, end)| *end == idx).count();
        if opens > 0 {
            write!(out, "{}", if self.loop_depth > 0 { "├╼" } else { "┌╼" })?;
            self.loop_depth += opens;
        } else if closes > 0 {
            self.loop_depth -= closes;
            write!(out, "{}", if self.loop_depth > 0 { "├╼" } else { "└╼" })?;
        } else if self.loop_depth > 0 {
            write!(out, "│ ")?;
        } else {
            write!(out, "  ")?;
        }

        if idx > 0 && pos.line == self.chunk.read_instruction(idx - 1).1.line {
            write!(out, "   | ")?;
        } else {
            write!(out, "{:4} ", pos.line)?;
        }

        self.print_opcode(idx, opcode, out)
    }

    fn print_opcode(&self, idx: usize, opcode: &OpCode, out: &mut impl Write) -> io::Result<()> {
        let constant = |op_repr: &str, const_id: u8, out: &mut dyn Write| {
            writeln!(
                out,
                "{:-16} {:4} '{}'",
                op_repr,
                const_id,
                self.chunk.read_const(const_id)
            )
        };
        let byte =
            |op_repr: &str, slot: u8, out: &mut dyn Write| writeln!(out, "{:-16} {:4}", op_repr, slot);
        let jump = |op_repr: &str, offset: u16, fwd: bool, out: &mut dyn Write| {
            // +1 since the instruction pointer has already moved past the
            // opcode when the offset is applied.
            let target = if fwd {
                idx + 1 + offset as usize
            } else {
                idx + 1 - offset as usize
            };
            writeln!(out, "{:-16} {:4} -> {}", op_repr, idx, target)
        };
        let invoke = |op_repr: &str, const_id: u8, argc: u8, out: &mut dyn Write| {
            writeln!(
                out,
                "{:-16} ({} args) {:4} '{}'",
                op_repr,
                argc,
                const_id,
                self.chunk.read_const(const_id)
            )
        };

        match opcode {
            OpCode::Constant(const_id) => constant("OP_CONSTANT", *const_id, out),
            OpCode::Nil => writeln!(out, "OP_NIL"),
            OpCode::True => writeln!(out, "OP_TRUE"),
            OpCode::False => writeln!(out, "OP_FALSE"),
            OpCode::Pop => writeln!(out, "OP_POP"),
            OpCode::Dup => writeln!(out, "OP_DUP"),
            OpCode::GetLocal(slot) => byte("OP_GET_LOCAL", *slot, out),
            OpCode::SetLocal(slot) => byte("OP_SET_LOCAL", *slot, out),
            OpCode::GetGlobal(const_id) => constant("OP_GET_GLOBAL", *const_id, out),
            OpCode::DefineGlobal(const_id) => constant("OP_DEFINE_GLOBAL", *const_id, out),
            OpCode::SetGlobal(const_id) => constant("OP_SET_GLOBAL", *const_id, out),
            OpCode::GetUpvalue(slot) => byte("OP_GET_UPVALUE", *slot, out),
            OpCode::SetUpvalue(slot) => byte("OP_SET_UPVALUE", *slot, out),
            OpCode::GetProperty(const_id) => constant("OP_GET_PROPERTY", *const_id, out),
            OpCode::SetProperty(const_id) => constant("OP_SET_PROPERTY", *const_id, out),
            OpCode::GetSuper(const_id) => constant("OP_GET_SUPER", *const_id, out),
            OpCode::Equal => writeln!(out, "OP_EQUAL"),
            OpCode::Greater => writeln!(out, "OP_GREATER"),
            OpCode::Less => writeln!(out, "OP_LESS"),
            OpCode::Add => writeln!(out, "OP_ADD"),
            OpCode::Subtract => writeln!(out, "OP_SUBTRACT"),
            OpCode::Multiply => writeln!(out, "OP_MULTIPLY"),
            OpCode::Divide => writeln!(out, "OP_DIVIDE"),
            OpCode::Modulo => writeln!(out, "OP_MODULO"),
            OpCode::BitwiseAnd => writeln!(out, "OP_BITWISE_AND"),
            OpCode::BitwiseOr => writeln!(out, "OP_BITWISE_OR"),
            OpCode::BitwiseXor => writeln!(out, "OP_BITWISE_XOR"),
            OpCode::ShiftLeft => writeln!(out, "OP_SHIFT_LEFT"),
            OpCode::ShiftRight => writeln!(out, "OP_SHIFT_RIGHT"),
            OpCode::Not => writeln!(out, "OP_NOT"),
            OpCode::Negate => writeln!(out, "OP_NEGATE"),
            OpCode::Increment => writeln!(out, "OP_INCREMENT"),
            OpCode::Decrement => writeln!(out, "OP_DECREMENT"),
            OpCode::Jump(offset) => jump("OP_JUMP", *offset, true, out),
            OpCode::JumpIfFalse(offset) => jump("OP_JUMP_IF_FALSE", *offset, true, out),
            OpCode::Loop(offset) => jump("OP_LOOP", *offset, false, out),
            OpCode::Call(argc) => byte("OP_CALL", *argc, out),
            OpCode::Invoke(const_id, argc) => invoke("OP_INVOKE", *const_id, *argc, out),
            OpCode::SuperInvoke(const_id, argc) => {
                invoke("OP_SUPER_INVOKE", *const_id, *argc, out)
            }
            OpCode::Index => writeln!(out, "OP_INDEX"),
            OpCode::SetIndex => writeln!(out, "OP_SET_INDEX"),
            OpCode::Closure(const_id, upvalues) => {
                let value = self.chunk.read_const(*const_id);
                writeln!(out, "{:-16} {:4} {}", "OP_CLOSURE", const_id, value)?;
                for upvalue in upvalues {
                    writeln!(
                        out,
                        "{:04}      |                     {} {}",
                        idx,
                        if upvalue.is_local { "local" } else { "upvalue" },
                        upvalue.index,
                    )?;
                }
                Ok(())
            }
            OpCode::CloseUpvalue => writeln!(out, "OP_CLOSE_UPVALUE"),
            OpCode::SetTable(count) => byte("OP_SET_TABLE", *count, out),
            OpCode::SetArray(count) => byte("OP_SET_ARRAY", *count, out),
            OpCode::Return => writeln!(out, "OP_RETURN"),
            OpCode::Dump => writeln!(out, "OP_DUMP"),
            OpCode::Class(const_id) => constant("OP_CLASS", *const_id, out),
            OpCode::Inherit => writeln!(out, "OP_INHERIT"),
            OpCode::Method(const_id) => constant("OP_METHOD", *const_id, out),
            OpCode::Property(const_id) => constant("OP_PROPERTY", *const_id, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;

    fn disassemble_source(src: &str) -> String {
        let fun = compile(src).expect("source should compile");
        let mut out = Vec::new();
        disassemble_chunk(&fun.chunk, "script", &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn lists_every_instruction_with_its_offset() {
        let fun = compile("dump 1 + 2;").expect("source should compile");
        let listing = disassemble_source("dump 1 + 2;");
        for idx in 0..fun.chunk.instructions_count() {
            assert!(
                listing.contains(&format!("{:04}", idx)),
                "missing offset {idx} in:\n{listing}"
            );
        }
        assert!(listing.contains("OP_ADD"));
        assert!(listing.contains("OP_DUMP"));
        assert!(listing.contains("OP_CONSTANT"));
    }

    #[test]
    fn loops_and_jumps_are_overlaid() {
        let listing = disassemble_source("let i = 0; while (i < 3) { i = i + 1; }");
        assert!(listing.contains("OP_LOOP"));
        assert!(listing.contains("OP_JUMP_IF_FALSE"));
        assert!(listing.contains("┌╼"), "no loop/jump arc drawn:\n{listing}");
        assert!(listing.contains("└╼"), "no loop close drawn:\n{listing}");
    }

    #[test]
    fn state_does_not_leak_between_invocations() {
        let src = "if (true) { dump 1; } else { dump 2; }";
        let first = disassemble_source(src);
        let second = disassemble_source(src);
        assert_eq!(first, second);
    }

    #[test]
    fn does_not_mutate_the_chunk() {
        let fun = compile("dump 1;").expect("source should compile");
        let before: Vec<OpCode> = (0..fun.chunk.instructions_count())
            .map(|idx| fun.chunk.read_instruction(idx).0.clone())
            .collect();
        let mut out = Vec::new();
        disassemble_chunk(&fun.chunk, "script", &mut out).unwrap();
        let after: Vec<OpCode> = (0..fun.chunk.instructions_count())
            .map(|idx| fun.chunk.read_instruction(idx).0.clone())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn line_numbers_repeat_as_pipes() {
        let fun = compile("let a = 1;\nlet b = 2;").expect("source should compile");
        let mut out = Vec::new();
        disassemble_chunk(&fun.chunk, "script", &mut out).unwrap();
        let listing = String::from_utf8(out).unwrap();
        assert!(listing.contains("   | "));
    }
}
