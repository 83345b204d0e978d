//! The code item of one method: register counts, the instruction stream,
//! the try/handler area and an optionally attached debug program.

use crate::dex::debug::DebugSequence;
use crate::dex::ins::{Ins, InstructionList};
use crate::dex::tries::TryList;
use crate::dex::{read_u2, read_u4, write_u2, write_u4};
use crate::error::BlockError;

#[derive(Debug, Default)]
pub struct CodeItem {
    registers_size: u16,
    ins_size: u16,
    outs_size: u16,
    debug_info_off: u32,
    instructions: InstructionList,
    tries: TryList,
    debug: Option<DebugSequence>,
}

impl CodeItem {
    pub fn new(registers_size: u16, ins_size: u16, outs_size: u16) -> Self {
        CodeItem {
            registers_size,
            ins_size,
            outs_size,
            debug_info_off: 0,
            instructions: InstructionList::new(),
            tries: TryList::new(),
            debug: None,
        }
    }

    /// Read the standard code_item layout. The debug program lives at
    /// `debug_info_off` elsewhere in the file; the offset is carried
    /// opaquely and the program is attached by the caller.
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<Self, BlockError> {
        let registers_size = read_u2(bytes, ix)?;
        let ins_size = read_u2(bytes, ix)?;
        let outs_size = read_u2(bytes, ix)?;
        let tries_size = read_u2(bytes, ix)?;
        let debug_info_off = read_u4(bytes, ix)?;
        let insns_size = read_u4(bytes, ix)? as usize;

        let instructions = InstructionList::read(bytes, ix, insns_size)?;
        if tries_size > 0 && insns_size % 2 != 0 {
            read_u2(bytes, ix)?; // alignment padding before the tries array
        }
        let tries = TryList::read(bytes, ix, tries_size as usize)?;
        Ok(CodeItem {
            registers_size,
            ins_size,
            outs_size,
            debug_info_off,
            instructions,
            tries,
            debug: None,
        })
    }

    pub fn registers_size(&self) -> u16 {
        self.registers_size
    }

    pub fn set_registers_size(&mut self, registers_size: u16) {
        self.registers_size = registers_size;
    }

    pub fn ins_size(&self) -> u16 {
        self.ins_size
    }

    pub fn outs_size(&self) -> u16 {
        self.outs_size
    }

    pub fn set_outs_size(&mut self, outs_size: u16) {
        self.outs_size = outs_size;
    }

    pub fn debug_info_off(&self) -> u32 {
        self.debug_info_off
    }

    pub fn set_debug_info_off(&mut self, offset: u32) {
        self.debug_info_off = offset;
    }

    pub fn instructions(&self) -> &InstructionList {
        &self.instructions
    }

    pub fn tries(&self) -> &TryList {
        &self.tries
    }

    pub fn tries_mut(&mut self) -> &mut TryList {
        &mut self.tries
    }

    pub fn debug(&self) -> Option<&DebugSequence> {
        self.debug.as_ref()
    }

    pub fn debug_mut(&mut self) -> Option<&mut DebugSequence> {
        self.debug.as_mut()
    }

    pub fn attach_debug(&mut self, debug: DebugSequence) {
        self.debug = Some(debug);
    }

    pub fn push_instruction(&mut self, ins: Ins) {
        self.instructions.push(ins);
    }

    pub fn insert_instruction(&mut self, index: usize, ins: Ins) -> Result<(), BlockError> {
        self.instructions.insert_at(index, ins)
    }

    pub fn remove_instruction(&mut self, index: usize) -> Result<Ins, BlockError> {
        self.instructions.remove_at(index)
    }

    pub fn instruction_mut(&mut self, index: usize) -> Option<&mut Ins> {
        self.instructions.get_mut(index)
    }

    /// Settle instruction addresses and branch offsets, then replay the
    /// debug program so its cached positions agree with the new layout.
    pub fn refresh(&mut self) -> Result<(), BlockError> {
        self.instructions.refresh()?;
        if let Some(debug) = &mut self.debug {
            debug.cache_values();
        }
        Ok(())
    }

    /// Encoded size of the code_item, agreeing with [`CodeItem::write`].
    pub fn byte_size(&self) -> usize {
        let units = self.instructions.unit_count();
        let mut size = 16 + units * 2;
        if !self.tries.is_empty() {
            if units % 2 != 0 {
                size += 2;
            }
            size += self.tries.byte_size();
        }
        size
    }

    pub fn write(&self, buffer: &mut Vec<u8>) -> Result<usize, BlockError> {
        let start = buffer.len();
        let units = self.instructions.unit_count();
        write_u2(buffer, self.registers_size);
        write_u2(buffer, self.ins_size);
        write_u2(buffer, self.outs_size);
        write_u2(buffer, self.tries.len() as u16);
        write_u4(buffer, self.debug_info_off);
        write_u4(buffer, units as u32);
        self.instructions.write(buffer)?;
        if !self.tries.is_empty() {
            if units % 2 != 0 {
                write_u2(buffer, 0);
            }
            self.tries.write(buffer)?;
        }
        Ok(buffer.len() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::opcodes::Opcode;
    use crate::dex::tries::{HandlerSet, TryItem};

    fn simple_body() -> CodeItem {
        let mut item = CodeItem::new(3, 1, 1);
        item.push_instruction(Ins::new(Opcode::by_name("nop").unwrap()));
        let mut branch = Ins::new(Opcode::by_name("goto/16").unwrap());
        branch.set_target_address(3).unwrap();
        item.push_instruction(branch);
        item.push_instruction(Ins::new(Opcode::by_name("return-void").unwrap()));
        item
    }

    #[test]
    fn round_trips_with_tries() {
        let mut item = CodeItem::new(3, 1, 1);
        item.push_instruction(Ins::new(Opcode::by_name("nop").unwrap()));
        item.push_instruction(Ins::new(Opcode::by_name("nop").unwrap()));
        item.push_instruction(Ins::new(Opcode::by_name("return-void").unwrap()));
        let mut handlers = HandlerSet::new();
        handlers.add_typed(4, 2);
        item.tries_mut().push(TryItem::new(0, 3, handlers));
        item.refresh().unwrap();

        let mut bytes = Vec::new();
        let written = item.write(&mut bytes).unwrap();
        assert_eq!(written, item.byte_size());
        // 3 units of code: padding inserted before the tries array
        assert_eq!(item.instructions().unit_count() % 2, 1);

        let mut ix = 0;
        let read = CodeItem::read(&bytes, &mut ix).unwrap();
        assert_eq!(ix, bytes.len());
        assert_eq!(read.registers_size(), 3);
        assert_eq!(read.tries().len(), 1);
        assert_eq!(read.instructions().len(), 3);

        let mut again = Vec::new();
        read.write(&mut again).unwrap();
        assert_eq!(again, bytes);
    }

    #[test]
    fn refresh_is_idempotent() {
        let mut item = simple_body();
        item.refresh().unwrap();
        let mut first = Vec::new();
        item.write(&mut first).unwrap();
        item.refresh().unwrap();
        let mut second = Vec::new();
        item.write(&mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn insert_then_remove_restores_addresses() {
        let mut item = simple_body();
        item.refresh().unwrap();
        let before: Vec<u32> = item.instructions().iter().map(|i| i.address()).collect();

        let filler = Ins::new(Opcode::by_name("nop").unwrap());
        item.insert_instruction(1, filler).unwrap();
        item.refresh().unwrap();
        item.remove_instruction(1).unwrap();
        item.refresh().unwrap();

        let after: Vec<u32> = item.instructions().iter().map(|i| i.address()).collect();
        assert_eq!(before, after);
        assert_eq!(item.instructions().get(1).unwrap().target_address(), Some(3));
    }

    #[test]
    fn debug_positions_follow_refresh() {
        use crate::dex::debug::DebugElementKind;
        let mut item = simple_body();
        let mut debug = DebugSequence::new(5);
        debug.push(DebugElementKind::LineNumber {
            addr_diff: 1,
            line_diff: 1,
        });
        item.attach_debug(debug);
        item.refresh().unwrap();
        assert_eq!(item.debug().unwrap().get(0).unwrap().line(), 6);
    }
}
