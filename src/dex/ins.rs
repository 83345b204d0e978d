//! Instructions as code-unit sequences, with branch targets tracked as
//! absolute addresses and re-encoded to relative offsets on refresh.

use crate::block::{Block, BlockId};
use crate::dex::opcodes::{Format, LabelKind, Opcode};
use crate::error::BlockError;

pub const PACKED_SWITCH_PAYLOAD: u16 = 0x0100;
pub const SPARSE_SWITCH_PAYLOAD: u16 = 0x0200;
pub const FILL_ARRAY_DATA_PAYLOAD: u16 = 0x0300;

/// A single Dalvik instruction. `units` always holds the full encoding,
/// including unit 0 with the opcode byte; `address` is the code-unit
/// offset of the instruction within its method, maintained by the owning
/// [`InstructionList`].
#[derive(Debug, Clone)]
pub struct Ins {
    id: BlockId,
    units: Vec<u16>,
    address: u32,
    target: Option<u32>,
}

impl Ins {
    /// A zero-operand skeleton of the given opcode; callers fill registers
    /// and literals through the setters.
    pub fn new(opcode: &Opcode) -> Self {
        let mut units = vec![0u16; opcode.format.code_units()];
        units[0] = opcode.value as u16;
        Ins {
            id: BlockId::next(),
            units,
            address: 0,
            target: None,
        }
    }

    pub fn from_units(units: Vec<u16>) -> Result<Self, BlockError> {
        if units.is_empty() {
            fail!(Format, "an instruction needs at least one code unit");
        }
        let ins = Ins {
            id: BlockId::next(),
            units,
            address: 0,
            target: None,
        };
        if ins.is_payload() {
            // payloads have no opcode entry; check the declared width instead
            let (_, width) = Ins::read_at(&ins.units, 0)?;
            if width != ins.units.len() {
                fail!(
                    Format,
                    "payload declares {} code units, got {}",
                    width,
                    ins.units.len()
                );
            }
        } else {
            // validate the opcode byte up front
            ins.opcode()?;
        }
        Ok(ins)
    }

    pub fn packed_switch_payload(first_key: i32, offsets: &[i32]) -> Self {
        let mut units = Vec::with_capacity(4 + 2 * offsets.len());
        units.push(PACKED_SWITCH_PAYLOAD);
        units.push(offsets.len() as u16);
        units.push(first_key as u16);
        units.push((first_key >> 16) as u16);
        for &off in offsets {
            units.push(off as u16);
            units.push((off >> 16) as u16);
        }
        Ins {
            id: BlockId::next(),
            units,
            address: 0,
            target: None,
        }
    }

    pub fn sparse_switch_payload(pairs: &[(i32, i32)]) -> Self {
        let mut units = Vec::with_capacity(2 + 4 * pairs.len());
        units.push(SPARSE_SWITCH_PAYLOAD);
        units.push(pairs.len() as u16);
        for &(key, _) in pairs {
            units.push(key as u16);
            units.push((key >> 16) as u16);
        }
        for &(_, off) in pairs {
            units.push(off as u16);
            units.push((off >> 16) as u16);
        }
        Ins {
            id: BlockId::next(),
            units,
            address: 0,
            target: None,
        }
    }

    pub fn fill_array_data_payload(element_width: u16, data: &[u8]) -> Self {
        let unit_count = 4 + (data.len() + 1) / 2;
        let mut units = Vec::with_capacity(unit_count);
        units.push(FILL_ARRAY_DATA_PAYLOAD);
        units.push(element_width);
        let size = if element_width == 0 {
            0
        } else {
            (data.len() / element_width as usize) as u32
        };
        units.push(size as u16);
        units.push((size >> 16) as u16);
        for chunk in data.chunks(2) {
            let lo = chunk[0] as u16;
            let hi = if chunk.len() > 1 { chunk[1] as u16 } else { 0 };
            units.push(lo | (hi << 8));
        }
        Ins {
            id: BlockId::next(),
            units,
            address: 0,
            target: None,
        }
    }

    pub fn is_payload(&self) -> bool {
        matches!(
            self.units[0],
            PACKED_SWITCH_PAYLOAD | SPARSE_SWITCH_PAYLOAD | FILL_ARRAY_DATA_PAYLOAD
        )
    }

    /// The opcode table entry; payloads have none.
    pub fn opcode(&self) -> Result<&'static Opcode, BlockError> {
        if self.is_payload() {
            fail!(
                Format,
                "payload pseudo-instruction 0x{:04x} has no opcode entry",
                self.units[0]
            );
        }
        let value = (self.units[0] & 0xFF) as u8;
        match Opcode::for_value(value) {
            Some(op) => Ok(op),
            None => fail!(Format, "undefined opcode value 0x{:02x}", value),
        }
    }

    pub fn name(&self) -> &'static str {
        if self.is_payload() {
            match self.units[0] {
                PACKED_SWITCH_PAYLOAD => "packed-switch-payload",
                SPARSE_SWITCH_PAYLOAD => "sparse-switch-payload",
                _ => "fill-array-data-payload",
            }
        } else {
            self.opcode().map(|op| op.name).unwrap_or("unknown")
        }
    }

    pub fn code_units(&self) -> usize {
        self.units.len()
    }

    pub fn units(&self) -> &[u16] {
        &self.units
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub(crate) fn set_address(&mut self, address: u32) {
        self.address = address;
    }

    fn label_kind(&self) -> LabelKind {
        if self.is_payload() {
            return LabelKind::None;
        }
        match self.opcode() {
            Ok(op) => op.format.label_kind(),
            Err(_) => LabelKind::None,
        }
    }

    pub fn has_label(&self) -> bool {
        self.label_kind() != LabelKind::None
    }

    /// Absolute code-unit address this instruction branches to, if any.
    pub fn target_address(&self) -> Option<u32> {
        self.target
    }

    pub fn set_target_address(&mut self, target: u32) -> Result<(), BlockError> {
        if !self.has_label() {
            fail!(
                Consistency,
                "instruction {} does not take a branch target",
                self.name()
            );
        }
        self.target = Some(target);
        Ok(())
    }

    /// Recompute the absolute target from the encoded relative offset.
    /// Called after reading, once addresses are known.
    pub(crate) fn resolve_target(&mut self) {
        let offset: i32 = match self.label_kind() {
            LabelKind::None => return,
            LabelKind::Rel8 => ((self.units[0] >> 8) as u8 as i8) as i32,
            LabelKind::Rel16 => self.units[1] as i16 as i32,
            LabelKind::Rel32 => (self.units[1] as u32 | ((self.units[2] as u32) << 16)) as i32,
        };
        self.target = Some(self.address.wrapping_add(offset as u32));
    }

    /// Re-encode the relative offset from the absolute target. Fails when
    /// the distance no longer fits the instruction's offset width.
    pub(crate) fn encode_target(&mut self) -> Result<(), BlockError> {
        let kind = self.label_kind();
        if kind == LabelKind::None {
            return Ok(());
        }
        let target = match self.target {
            Some(t) => t,
            None => fail!(
                Consistency,
                "branch instruction {} at address {} has no target",
                self.name(),
                self.address
            ),
        };
        let offset = target as i64 - self.address as i64;
        match kind {
            LabelKind::Rel8 => {
                if offset < i8::MIN as i64 || offset > i8::MAX as i64 {
                    return Err(BlockError::range(
                        "branch offset",
                        offset,
                        i8::MIN as i64,
                        i8::MAX as i64,
                    ));
                }
                self.units[0] = (self.units[0] & 0x00FF) | (((offset as i8 as u8) as u16) << 8);
            }
            LabelKind::Rel16 => {
                if offset < i16::MIN as i64 || offset > i16::MAX as i64 {
                    return Err(BlockError::range(
                        "branch offset",
                        offset,
                        i16::MIN as i64,
                        i16::MAX as i64,
                    ));
                }
                self.units[1] = offset as i16 as u16;
            }
            LabelKind::Rel32 => {
                let off = offset as i32 as u32;
                self.units[1] = off as u16;
                self.units[2] = (off >> 16) as u16;
            }
            LabelKind::None => {}
        }
        Ok(())
    }

    /// 4-bit operand field `n`, counting from the low nibble of unit 0.
    pub fn nibble(&self, n: usize) -> Result<u8, BlockError> {
        let max = self.units.len() * 4;
        if n >= max {
            return Err(BlockError::range("nibble index", n as i64, 0, max as i64 - 1));
        }
        let unit = self.units[n / 4];
        Ok(((unit >> ((n % 4) * 4)) & 0xF) as u8)
    }

    pub fn set_nibble(&mut self, n: usize, value: u8) -> Result<(), BlockError> {
        let max = self.units.len() * 4;
        if n >= max {
            return Err(BlockError::range("nibble index", n as i64, 0, max as i64 - 1));
        }
        if value > 0xF {
            return Err(BlockError::range("nibble value", value as i64, 0, 0xF));
        }
        let shift = (n % 4) * 4;
        let unit = &mut self.units[n / 4];
        *unit = (*unit & !(0xF << shift)) | ((value as u16) << shift);
        Ok(())
    }

    /// 8-bit operand field `n`, counting from the low byte of unit 0.
    pub fn byte_at(&self, n: usize) -> Result<u8, BlockError> {
        let max = self.units.len() * 2;
        if n >= max {
            return Err(BlockError::range("byte index", n as i64, 0, max as i64 - 1));
        }
        let unit = self.units[n / 2];
        Ok(((unit >> ((n % 2) * 8)) & 0xFF) as u8)
    }

    pub fn set_byte_at(&mut self, n: usize, value: u8) -> Result<(), BlockError> {
        let max = self.units.len() * 2;
        if n >= max {
            return Err(BlockError::range("byte index", n as i64, 0, max as i64 - 1));
        }
        let shift = (n % 2) * 8;
        let unit = &mut self.units[n / 2];
        *unit = (*unit & !(0xFF << shift)) | ((value as u16) << shift);
        Ok(())
    }

    /// Whole code unit `n`.
    pub fn short_at(&self, n: usize) -> Result<u16, BlockError> {
        if n >= self.units.len() {
            return Err(BlockError::range(
                "code unit index",
                n as i64,
                0,
                self.units.len() as i64 - 1,
            ));
        }
        Ok(self.units[n])
    }

    pub fn set_short_at(&mut self, n: usize, value: u16) -> Result<(), BlockError> {
        if n >= self.units.len() {
            return Err(BlockError::range(
                "code unit index",
                n as i64,
                0,
                self.units.len() as i64 - 1,
            ));
        }
        self.units[n] = value;
        Ok(())
    }

    /// Parse one instruction starting at `index` within `code`. Returns the
    /// instruction and its width in units.
    pub fn read_at(code: &[u16], index: usize) -> Result<(Self, usize), BlockError> {
        if index >= code.len() {
            fail!(Format, "instruction read past end of code at unit {}", index);
        }
        let unit0 = code[index];
        let width = match unit0 {
            PACKED_SWITCH_PAYLOAD => {
                let size = Self::payload_size(code, index)? as usize;
                4 + 2 * size
            }
            SPARSE_SWITCH_PAYLOAD => {
                let size = Self::payload_size(code, index)? as usize;
                2 + 4 * size
            }
            FILL_ARRAY_DATA_PAYLOAD => {
                if index + 4 > code.len() {
                    fail!(Format, "truncated fill-array-data payload at unit {}", index);
                }
                let element_width = code[index + 1] as usize;
                let size = code[index + 2] as usize | ((code[index + 3] as usize) << 16);
                4 + (size * element_width + 1) / 2
            }
            _ => {
                let value = (unit0 & 0xFF) as u8;
                match Opcode::for_value(value) {
                    Some(op) => op.format.code_units(),
                    None => fail!(
                        Format,
                        "undefined opcode value 0x{:02x} at unit {}",
                        value,
                        index
                    ),
                }
            }
        };
        if index + width > code.len() {
            fail!(
                Format,
                "instruction at unit {} needs {} units but only {} remain",
                index,
                width,
                code.len() - index
            );
        }
        let ins = Ins {
            id: BlockId::next(),
            units: code[index..index + width].to_vec(),
            address: index as u32,
            target: None,
        };
        Ok((ins, width))
    }

    fn payload_size(code: &[u16], index: usize) -> Result<u16, BlockError> {
        if index + 2 > code.len() {
            fail!(Format, "truncated switch payload at unit {}", index);
        }
        Ok(code[index + 1])
    }
}

impl Block for Ins {
    fn id(&self) -> BlockId {
        self.id
    }

    fn byte_size(&self) -> usize {
        2 * self.units.len()
    }

    fn refresh(&mut self) {}

    fn write_to(&self, out: &mut Vec<u8>) -> usize {
        for &unit in &self.units {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        2 * self.units.len()
    }
}

const LAYOUT_PASS_LIMIT: usize = 8;

/// The instruction stream of one method body. Addresses and branch offsets
/// are derived state: edits mark the list dirty and `refresh` settles the
/// layout before any write.
#[derive(Debug, Default)]
pub struct InstructionList {
    items: Vec<Ins>,
    dirty: bool,
}

impl InstructionList {
    pub fn new() -> Self {
        InstructionList {
            items: Vec::new(),
            dirty: false,
        }
    }

    /// Decode `unit_count` code units from the byte stream. Branch targets
    /// are resolved to absolute addresses in a second pass.
    pub fn read(bytes: &[u8], ix: &mut usize, unit_count: usize) -> Result<Self, BlockError> {
        if bytes.len() < *ix + unit_count * 2 {
            fail!(
                Format,
                "code area of {} units exceeds remaining input at index {}",
                unit_count,
                *ix
            );
        }
        let mut code = Vec::with_capacity(unit_count);
        for k in 0..unit_count {
            let at = *ix + k * 2;
            code.push(u16::from_le_bytes([bytes[at], bytes[at + 1]]));
        }
        *ix += unit_count * 2;

        let mut items = Vec::new();
        let mut index = 0;
        while index < unit_count {
            let (ins, width) = Ins::read_at(&code, index)?;
            items.push(ins);
            index += width;
        }
        for ins in &mut items {
            ins.resolve_target();
        }
        Ok(InstructionList {
            items,
            dirty: false,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Ins> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Ins> {
        self.dirty = true;
        self.items.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Ins> {
        self.items.iter()
    }

    pub fn push(&mut self, ins: Ins) {
        self.items.push(ins);
        self.dirty = true;
    }

    pub fn insert_at(&mut self, index: usize, ins: Ins) -> Result<(), BlockError> {
        if index > self.items.len() {
            return Err(BlockError::range(
                "instruction index",
                index as i64,
                0,
                self.items.len() as i64,
            ));
        }
        self.items.insert(index, ins);
        self.dirty = true;
        Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> Result<Ins, BlockError> {
        if index >= self.items.len() {
            return Err(BlockError::range(
                "instruction index",
                index as i64,
                0,
                self.items.len() as i64 - 1,
            ));
        }
        self.dirty = true;
        Ok(self.items.remove(index))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Instruction holding the given absolute address, if the address falls
    /// on an instruction boundary.
    pub fn at_address(&self, address: u32) -> Option<&Ins> {
        self.items.iter().find(|ins| ins.address == address)
    }

    /// Total width in code units, including alignment padding before
    /// payloads. Valid after `refresh`.
    pub fn unit_count(&self) -> usize {
        let mut total = 0usize;
        for ins in &self.items {
            if ins.is_payload() && total % 2 != 0 {
                total += 1;
            }
            total += ins.code_units();
        }
        total
    }

    /// Settle addresses and branch offsets. Payloads are kept 4-byte
    /// aligned by accounting a padding nop before them, so an edit can move
    /// addresses on the next pass; iterate until a full pass changes
    /// nothing.
    pub fn refresh(&mut self) -> Result<(), BlockError> {
        for _ in 0..LAYOUT_PASS_LIMIT {
            let mut changed = false;
            let mut address = 0u32;
            for ins in &mut self.items {
                if ins.is_payload() && address % 2 != 0 {
                    address += 1;
                }
                if ins.address != address {
                    ins.set_address(address);
                    changed = true;
                }
                address += ins.code_units() as u32;
            }
            for ins in &mut self.items {
                ins.encode_target()?;
            }
            if !changed {
                self.dirty = false;
                return Ok(());
            }
        }
        fail!(
            Consistency,
            "instruction layout failed to settle after {} passes",
            LAYOUT_PASS_LIMIT
        );
    }

    /// Serialize the code units little-endian, padding before payloads with
    /// a nop so their address stays 4-byte aligned.
    pub fn write(&self, buffer: &mut Vec<u8>) -> Result<usize, BlockError> {
        if self.dirty {
            fail!(Consistency, "instruction list written before refresh");
        }
        let start = buffer.len();
        let mut units_written = 0usize;
        for ins in &self.items {
            if ins.is_payload() && units_written % 2 != 0 {
                buffer.extend_from_slice(&0u16.to_le_bytes());
                units_written += 1;
            }
            ins.write_to(buffer);
            units_written += ins.code_units();
        }
        Ok(buffer.len() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goto16(target: u32) -> Ins {
        let mut ins = Ins::new(Opcode::by_name("goto/16").unwrap());
        ins.set_target_address(target).unwrap();
        ins
    }

    #[test]
    fn operand_accessors_check_bounds() {
        let ins = Ins::from_units(vec![0x2112]).unwrap(); // const/4 v1, 2
        assert_eq!(ins.nibble(2).unwrap(), 1);
        assert_eq!(ins.nibble(3).unwrap(), 2);
        assert_eq!(ins.byte_at(0).unwrap(), 0x12);
        let err = ins.nibble(4).unwrap_err();
        assert!(err.to_string().contains("nibble index"));
        assert!(ins.short_at(1).is_err());
    }

    #[test]
    fn from_units_accepts_payloads() {
        let built = Ins::packed_switch_payload(10, &[4, 8]);
        let reparsed = Ins::from_units(built.units().to_vec()).unwrap();
        assert!(reparsed.is_payload());
        assert_eq!(reparsed.units(), built.units());

        // declares two entries but carries only one
        let err = Ins::from_units(vec![PACKED_SWITCH_PAYLOAD, 2, 0, 0, 4, 0]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Format);
    }

    #[test]
    fn branch_targets_round_trip() {
        let mut list = InstructionList::new();
        list.push(goto16(3));
        list.push(Ins::new(Opcode::by_name("nop").unwrap()));
        list.push(Ins::new(Opcode::by_name("return-void").unwrap()));
        list.refresh().unwrap();

        let mut bytes = Vec::new();
        list.write(&mut bytes).unwrap();
        let mut ix = 0;
        let read = InstructionList::read(&bytes, &mut ix, list.unit_count()).unwrap();
        assert_eq!(read.get(0).unwrap().target_address(), Some(3));
        assert_eq!(read.get(2).unwrap().address(), 3);
    }

    #[test]
    fn insert_shifts_following_addresses() {
        let mut list = InstructionList::new();
        list.push(goto16(2));
        list.push(Ins::new(Opcode::by_name("return-void").unwrap()));
        list.refresh().unwrap();
        assert_eq!(list.get(1).unwrap().address(), 2);

        list.insert_at(1, Ins::new(Opcode::by_name("nop").unwrap()))
            .unwrap();
        assert!(list.is_dirty());
        list.get_mut(0).unwrap().set_target_address(3).unwrap();
        list.refresh().unwrap();
        assert_eq!(list.get(2).unwrap().address(), 3);
        assert_eq!(list.get(0).unwrap().units()[1], 3);
    }

    #[test]
    fn write_before_refresh_is_rejected() {
        let mut list = InstructionList::new();
        list.push(Ins::new(Opcode::by_name("nop").unwrap()));
        list.push(Ins::new(Opcode::by_name("return-void").unwrap()));
        list.remove_at(0).unwrap();
        let mut bytes = Vec::new();
        assert!(list.write(&mut bytes).is_err());
        list.refresh().unwrap();
        assert!(list.write(&mut bytes).is_ok());
    }

    #[test]
    fn payloads_are_aligned() {
        let mut list = InstructionList::new();
        list.push(Ins::new(Opcode::by_name("nop").unwrap()));
        list.push(Ins::packed_switch_payload(0, &[4, 8]));
        list.refresh().unwrap();
        // nop, padding nop, then the payload on an even unit address
        assert_eq!(list.get(1).unwrap().address(), 2);
        assert_eq!(list.unit_count(), 2 + 4 + 4);

        let mut bytes = Vec::new();
        let written = list.write(&mut bytes).unwrap();
        assert_eq!(written, list.unit_count() * 2);
        let mut ix = 0;
        let read = InstructionList::read(&bytes, &mut ix, list.unit_count()).unwrap();
        // the padding nop reads back as a separate instruction
        assert_eq!(read.len(), 3);
        assert!(read.get(2).unwrap().is_payload());
    }

    #[test]
    fn out_of_range_offset_fails() {
        let mut list = InstructionList::new();
        let mut b = Ins::new(Opcode::by_name("goto").unwrap());
        b.set_target_address(4000).unwrap();
        list.push(b);
        let err = list.refresh().unwrap_err();
        assert!(err.to_string().contains("branch offset"));
    }
}
