use super::chunk::{Chunk, Instruction};
use super::heap::Heap;
use super::object::Obj;
use std::convert::TryFrom;

/// Renders a whole chunk, then the chunks of any function constants it
/// carries.
pub fn disassemble(chunk: &Chunk, heap: &Heap, name: &str) -> String {
    let mut buffer = format!("=== {} ===\n", name);
    let mut offset = 0;
    while offset < chunk.len() {
        let (text, size) = disassemble_instr_at(chunk, heap, offset);
        buffer += &text;
        offset += size;
    }

    for value in chunk.constants() {
        if let Some(obj_ref) = value.as_obj() {
            if let Obj::Function(function) = heap.get(obj_ref) {
                let name = match function.name {
                    Some(name) => heap.string(name).to_string(),
                    None => "anonymous".to_string(),
                };
                buffer += &disassemble(&function.chunk, heap, &name);
            }
        }
    }

    buffer
}

pub fn disassemble_instr_at(chunk: &Chunk, heap: &Heap, offset: usize) -> (String, usize) {
    let instr = Instruction::try_from(chunk.byte(offset).unwrap()).unwrap();
    let mut buffer = format!("{:0>5} {:<16}", offset, format!("{:?}", instr));

    match instr {
        Instruction::Nil
        | Instruction::True
        | Instruction::False
        | Instruction::Pop
        | Instruction::CloseUpvalue
        | Instruction::Inherit
        | Instruction::Equal
        | Instruction::Greater
        | Instruction::Less
        | Instruction::Add
        | Instruction::Subtract
        | Instruction::Multiply
        | Instruction::Divide
        | Instruction::Modulo
        | Instruction::Power
        | Instruction::ShiftLeft
        | Instruction::ShiftRight
        | Instruction::Not
        | Instruction::Negate
        | Instruction::Print
        | Instruction::Return
        | Instruction::Exit => {
            buffer += "\n";
            (buffer, 1)
        }
        Instruction::Constant
        | Instruction::DefineGlobal
        | Instruction::GetGlobal
        | Instruction::SetGlobal
        | Instruction::DefineConstant
        | Instruction::GetProperty
        | Instruction::SetProperty
        | Instruction::GetSuper
        | Instruction::Class
        | Instruction::Method => {
            let index = chunk.byte(offset + 1).unwrap() as usize;
            buffer += &format!("{} ({})\n", index, heap.show(chunk.constant(index)));
            (buffer, 2)
        }
        Instruction::GetLocal
        | Instruction::SetLocal
        | Instruction::GetUpvalue
        | Instruction::SetUpvalue
        | Instruction::Call => {
            let oper = chunk.byte(offset + 1).unwrap();
            buffer += &format!("{}\n", oper);
            (buffer, 2)
        }
        Instruction::Jump | Instruction::JumpIfFalse | Instruction::Loop => {
            let oper = ((chunk.byte(offset + 1).unwrap() as u16) << 8)
                | chunk.byte(offset + 2).unwrap() as u16;
            buffer += &format!("{}\n", oper);
            (buffer, 3)
        }
        Instruction::Invoke | Instruction::SuperInvoke => {
            let index = chunk.byte(offset + 1).unwrap() as usize;
            let argc = chunk.byte(offset + 2).unwrap();
            buffer += &format!(
                "{} ({}) argc {}\n",
                index,
                heap.show(chunk.constant(index)),
                argc
            );
            (buffer, 3)
        }
        Instruction::Closure => {
            let index = chunk.byte(offset + 1).unwrap() as usize;
            let function = chunk.constant(index).as_obj().unwrap();
            let upvalue_count = heap.function(function).upvalue_count;
            buffer += &format!("{} ({})\n", index, heap.show(chunk.constant(index)));

            for i in 0..upvalue_count {
                buffer += &format!(
                    "|     {i}: is_local: {}, index: {}\n",
                    chunk.byte(offset + 2 + i * 2).unwrap() != 0,
                    chunk.byte(offset + 3 + i * 2).unwrap()
                );
            }

            (buffer, 2 + upvalue_count * 2)
        }
    }
}
