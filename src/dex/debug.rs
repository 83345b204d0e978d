//! The debug info program: a delta-encoded (address, line) state machine.
//! Elements store diffs; absolute values are cached by replaying the
//! sequence and every mutation keeps the replay and the caches in
//! agreement.

use crate::dex::leb::{sleb128_len, uleb128_len};
use crate::dex::{
    read_sleb128, read_u1, read_uleb128, read_uleb128p1, write_sleb128, write_u1, write_uleb128,
    write_uleb128p1,
};
use crate::error::BlockError;

const DBG_END_SEQUENCE: u8 = 0x00;
const DBG_ADVANCE_PC: u8 = 0x01;
const DBG_ADVANCE_LINE: u8 = 0x02;
const DBG_START_LOCAL: u8 = 0x03;
const DBG_START_LOCAL_EXTENDED: u8 = 0x04;
const DBG_END_LOCAL: u8 = 0x05;
const DBG_RESTART_LOCAL: u8 = 0x06;
const DBG_SET_PROLOGUE_END: u8 = 0x07;
const DBG_SET_EPILOGUE_BEGIN: u8 = 0x08;
const DBG_SET_FILE: u8 = 0x09;
const DBG_FIRST_SPECIAL: u8 = 0x0A;

/// Largest adjusted value a special opcode can carry (0xFF - 0x0A).
pub const SPECIAL_OPCODE_CAPACITY: i64 = 245;

const SPECIAL_LINE_BASE: i32 = -4;
const SPECIAL_LINE_RANGE: i32 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugElementKind {
    AdvancePc {
        addr_diff: u32,
    },
    AdvanceLine {
        line_diff: i32,
    },
    StartLocal {
        register: u32,
        name_index: Option<u32>,
        type_index: Option<u32>,
    },
    StartLocalExtended {
        register: u32,
        name_index: Option<u32>,
        type_index: Option<u32>,
        signature_index: Option<u32>,
    },
    EndLocal {
        register: u32,
    },
    RestartLocal {
        register: u32,
    },
    PrologueEnd,
    EpilogueBegin,
    SetFile {
        name_index: Option<u32>,
    },
    /// A position entry: advances address and line together. Stored
    /// unpacked; emission packs it into one special opcode when the diffs
    /// fit and splits off advance-pc / advance-line prefixes when not.
    LineNumber {
        addr_diff: u32,
        line_diff: i32,
    },
}

impl DebugElementKind {
    /// Build a position entry from the adjusted special-opcode value
    /// (opcode byte minus 0x0A).
    pub fn from_flag_offset(flag_offset: i64) -> Result<Self, BlockError> {
        if !(0..=SPECIAL_OPCODE_CAPACITY).contains(&flag_offset) {
            return Err(BlockError::range(
                "flag offset",
                flag_offset,
                0,
                SPECIAL_OPCODE_CAPACITY,
            ));
        }
        let adjusted = flag_offset as i32;
        Ok(DebugElementKind::LineNumber {
            addr_diff: (adjusted / SPECIAL_LINE_RANGE) as u32,
            line_diff: SPECIAL_LINE_BASE + adjusted % SPECIAL_LINE_RANGE,
        })
    }

    fn addr_diff(&self) -> Option<u32> {
        match *self {
            DebugElementKind::AdvancePc { addr_diff } => Some(addr_diff),
            DebugElementKind::LineNumber { addr_diff, .. } => Some(addr_diff),
            _ => None,
        }
    }

    fn set_addr_diff(&mut self, diff: u32) {
        match self {
            DebugElementKind::AdvancePc { addr_diff } => *addr_diff = diff,
            DebugElementKind::LineNumber { addr_diff, .. } => *addr_diff = diff,
            _ => {}
        }
    }

    fn line_diff(&self) -> Option<i64> {
        match *self {
            DebugElementKind::AdvanceLine { line_diff } => Some(line_diff as i64),
            DebugElementKind::LineNumber { line_diff, .. } => Some(line_diff as i64),
            _ => None,
        }
    }

    fn set_line_diff(&mut self, diff: i64) {
        match self {
            DebugElementKind::AdvanceLine { line_diff } => *line_diff = diff as i32,
            DebugElementKind::LineNumber { line_diff, .. } => *line_diff = diff as i32,
            _ => {}
        }
    }

    fn encoded_len(&self) -> usize {
        match *self {
            DebugElementKind::AdvancePc { addr_diff } => 1 + uleb128_len(addr_diff),
            DebugElementKind::AdvanceLine { line_diff } => 1 + sleb128_len(line_diff),
            DebugElementKind::StartLocal {
                register,
                name_index,
                type_index,
            } => {
                1 + uleb128_len(register)
                    + ulebp1_len(name_index)
                    + ulebp1_len(type_index)
            }
            DebugElementKind::StartLocalExtended {
                register,
                name_index,
                type_index,
                signature_index,
            } => {
                1 + uleb128_len(register)
                    + ulebp1_len(name_index)
                    + ulebp1_len(type_index)
                    + ulebp1_len(signature_index)
            }
            DebugElementKind::EndLocal { register } | DebugElementKind::RestartLocal { register } => {
                1 + uleb128_len(register)
            }
            DebugElementKind::PrologueEnd | DebugElementKind::EpilogueBegin => 1,
            DebugElementKind::SetFile { name_index } => 1 + ulebp1_len(name_index),
            DebugElementKind::LineNumber {
                addr_diff,
                line_diff,
            } => {
                let mut len = 1;
                let (line, addr) = (line_diff, addr_diff);
                let line_in_range = (SPECIAL_LINE_BASE..SPECIAL_LINE_BASE + SPECIAL_LINE_RANGE)
                    .contains(&line);
                let effective_line = if line_in_range { line } else { 0 };
                if !line_in_range {
                    len += 1 + sleb128_len(line);
                }
                let adjusted =
                    (effective_line - SPECIAL_LINE_BASE) as i64 + SPECIAL_LINE_RANGE as i64 * addr as i64;
                if adjusted > SPECIAL_OPCODE_CAPACITY {
                    len += 1 + uleb128_len(addr);
                }
                len
            }
        }
    }

    fn write(&self, buffer: &mut Vec<u8>) {
        match *self {
            DebugElementKind::AdvancePc { addr_diff } => {
                write_u1(buffer, DBG_ADVANCE_PC);
                write_uleb128(buffer, addr_diff);
            }
            DebugElementKind::AdvanceLine { line_diff } => {
                write_u1(buffer, DBG_ADVANCE_LINE);
                write_sleb128(buffer, line_diff);
            }
            DebugElementKind::StartLocal {
                register,
                name_index,
                type_index,
            } => {
                write_u1(buffer, DBG_START_LOCAL);
                write_uleb128(buffer, register);
                write_uleb128p1(buffer, opt_index(name_index));
                write_uleb128p1(buffer, opt_index(type_index));
            }
            DebugElementKind::StartLocalExtended {
                register,
                name_index,
                type_index,
                signature_index,
            } => {
                write_u1(buffer, DBG_START_LOCAL_EXTENDED);
                write_uleb128(buffer, register);
                write_uleb128p1(buffer, opt_index(name_index));
                write_uleb128p1(buffer, opt_index(type_index));
                write_uleb128p1(buffer, opt_index(signature_index));
            }
            DebugElementKind::EndLocal { register } => {
                write_u1(buffer, DBG_END_LOCAL);
                write_uleb128(buffer, register);
            }
            DebugElementKind::RestartLocal { register } => {
                write_u1(buffer, DBG_RESTART_LOCAL);
                write_uleb128(buffer, register);
            }
            DebugElementKind::PrologueEnd => {
                write_u1(buffer, DBG_SET_PROLOGUE_END);
            }
            DebugElementKind::EpilogueBegin => {
                write_u1(buffer, DBG_SET_EPILOGUE_BEGIN);
            }
            DebugElementKind::SetFile { name_index } => {
                write_u1(buffer, DBG_SET_FILE);
                write_uleb128p1(buffer, opt_index(name_index));
            }
            DebugElementKind::LineNumber {
                addr_diff,
                line_diff,
            } => {
                let mut line = line_diff;
                let line_in_range =
                    (SPECIAL_LINE_BASE..SPECIAL_LINE_BASE + SPECIAL_LINE_RANGE).contains(&line);
                if !line_in_range {
                    write_u1(buffer, DBG_ADVANCE_LINE);
                    write_sleb128(buffer, line);
                    line = 0;
                }
                let mut adjusted = (line - SPECIAL_LINE_BASE) as i64
                    + SPECIAL_LINE_RANGE as i64 * addr_diff as i64;
                if adjusted > SPECIAL_OPCODE_CAPACITY {
                    write_u1(buffer, DBG_ADVANCE_PC);
                    write_uleb128(buffer, addr_diff);
                    adjusted = (line - SPECIAL_LINE_BASE) as i64;
                }
                write_u1(buffer, DBG_FIRST_SPECIAL + adjusted as u8);
            }
        }
    }
}

fn opt_index(value: Option<u32>) -> i32 {
    match value {
        Some(v) => v as i32,
        None => -1,
    }
}

fn ulebp1_len(value: Option<u32>) -> usize {
    uleb128_len((opt_index(value) + 1) as u32)
}

/// One element plus its cached absolute position, valid after the owning
/// sequence's last replay.
#[derive(Debug, Clone)]
pub struct DebugElement {
    kind: DebugElementKind,
    address: u32,
    line: u32,
}

impl DebugElement {
    pub fn new(kind: DebugElementKind) -> Self {
        DebugElement {
            kind,
            address: 0,
            line: 0,
        }
    }

    pub fn kind(&self) -> &DebugElementKind {
        &self.kind
    }

    /// Absolute code-unit address after this element.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Absolute line after this element.
    pub fn line(&self) -> u32 {
        self.line
    }
}

/// The debug program of one method: starting line, parameter names and the
/// element chain. The end-sequence terminator is implicit.
#[derive(Debug, Default)]
pub struct DebugSequence {
    line_start: u32,
    parameter_names: Vec<Option<u32>>,
    elements: Vec<DebugElement>,
}

impl DebugSequence {
    pub fn new(line_start: u32) -> Self {
        DebugSequence {
            line_start,
            parameter_names: Vec::new(),
            elements: Vec::new(),
        }
    }

    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<Self, BlockError> {
        let line_start = read_uleb128(bytes, ix)?;
        let parameter_count = read_uleb128(bytes, ix)?;
        let mut parameter_names = Vec::with_capacity(parameter_count as usize);
        for _ in 0..parameter_count {
            let raw = read_uleb128p1(bytes, ix)?;
            parameter_names.push(if raw < 0 { None } else { Some(raw as u32) });
        }

        let mut elements = Vec::new();
        loop {
            let op = read_u1(bytes, ix)?;
            let kind = match op {
                DBG_END_SEQUENCE => break,
                DBG_ADVANCE_PC => DebugElementKind::AdvancePc {
                    addr_diff: read_uleb128(bytes, ix)?,
                },
                DBG_ADVANCE_LINE => DebugElementKind::AdvanceLine {
                    line_diff: read_sleb128(bytes, ix)?,
                },
                DBG_START_LOCAL => DebugElementKind::StartLocal {
                    register: read_uleb128(bytes, ix)?,
                    name_index: read_index(bytes, ix)?,
                    type_index: read_index(bytes, ix)?,
                },
                DBG_START_LOCAL_EXTENDED => DebugElementKind::StartLocalExtended {
                    register: read_uleb128(bytes, ix)?,
                    name_index: read_index(bytes, ix)?,
                    type_index: read_index(bytes, ix)?,
                    signature_index: read_index(bytes, ix)?,
                },
                DBG_END_LOCAL => DebugElementKind::EndLocal {
                    register: read_uleb128(bytes, ix)?,
                },
                DBG_RESTART_LOCAL => DebugElementKind::RestartLocal {
                    register: read_uleb128(bytes, ix)?,
                },
                DBG_SET_PROLOGUE_END => DebugElementKind::PrologueEnd,
                DBG_SET_EPILOGUE_BEGIN => DebugElementKind::EpilogueBegin,
                DBG_SET_FILE => DebugElementKind::SetFile {
                    name_index: read_index(bytes, ix)?,
                },
                special => {
                    DebugElementKind::from_flag_offset((special - DBG_FIRST_SPECIAL) as i64)?
                }
            };
            elements.push(DebugElement::new(kind));
        }

        let mut sequence = DebugSequence {
            line_start,
            parameter_names,
            elements,
        };
        sequence.cache_values();
        Ok(sequence)
    }

    pub fn line_start(&self) -> u32 {
        self.line_start
    }

    pub fn set_line_start(&mut self, line_start: u32) {
        self.line_start = line_start;
        self.cache_values();
    }

    pub fn parameter_names(&self) -> &[Option<u32>] {
        &self.parameter_names
    }

    pub fn add_parameter_name(&mut self, name_index: Option<u32>) {
        self.parameter_names.push(name_index);
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DebugElement> {
        self.elements.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DebugElement> {
        self.elements.iter()
    }

    pub fn push(&mut self, kind: DebugElementKind) {
        self.elements.push(DebugElement::new(kind));
        self.cache_values();
    }

    pub fn insert(&mut self, index: usize, kind: DebugElementKind) -> Result<(), BlockError> {
        if index > self.elements.len() {
            return Err(BlockError::range(
                "debug element index",
                index as i64,
                0,
                self.elements.len() as i64,
            ));
        }
        self.elements.insert(index, DebugElement::new(kind));
        self.cache_values();
        Ok(())
    }

    /// Final (address, line) after the whole program.
    pub fn end_state(&self) -> (u32, u32) {
        match self.elements.last() {
            Some(last) => (last.address, last.line),
            None => (0, self.line_start),
        }
    }

    /// Replay the diffs from `(0, line_start)` into every element's cached
    /// address and line.
    pub fn cache_values(&mut self) {
        let mut address = 0u32;
        let mut line = self.line_start as i64;
        for element in &mut self.elements {
            if let Some(diff) = element.kind.addr_diff() {
                address = address.wrapping_add(diff);
            }
            if let Some(diff) = element.kind.line_diff() {
                line += diff;
            }
            element.address = address;
            element.line = line.max(0) as u32;
        }
    }

    /// Move element `index` to the given absolute address by rewriting its
    /// address diff, then shrink following diffs so later elements keep
    /// their absolute addresses. A diff never goes below zero; the unmet
    /// part of the adjustment carries to the next diff-bearing element.
    pub fn set_target_address(&mut self, index: usize, address: u32) -> Result<(), BlockError> {
        if index >= self.elements.len() {
            return Err(BlockError::range(
                "debug element index",
                index as i64,
                0,
                self.elements.len() as i64 - 1,
            ));
        }
        if self.elements[index].kind.addr_diff().is_none() {
            fail!(
                Consistency,
                "debug element {} carries no address advance",
                index
            );
        }
        let previous_address = if index == 0 {
            0
        } else {
            self.elements[index - 1].address
        };
        let old_address = self.elements[index].address;
        let new_diff = address.saturating_sub(previous_address);
        self.elements[index].kind.set_addr_diff(new_diff);
        let new_address = previous_address + new_diff;

        let mut residual = new_address as i64 - old_address as i64;
        for element in self.elements.iter_mut().skip(index + 1) {
            if residual == 0 {
                break;
            }
            if let Some(diff) = element.kind.addr_diff() {
                let adjusted = diff as i64 - residual;
                if adjusted < 0 {
                    element.kind.set_addr_diff(0);
                    residual = -adjusted;
                } else {
                    element.kind.set_addr_diff(adjusted as u32);
                    residual = 0;
                }
            }
        }
        self.cache_values();
        Ok(())
    }

    /// Remove element `index`, conserving its line delta: spill to the
    /// previous element up to capacity, the remainder to the next, and
    /// fold into `line_start` only when the removed element was first.
    /// A delta the two neighbors cannot absorb is a hard error.
    pub fn remove(&mut self, index: usize) -> Result<DebugElement, BlockError> {
        if index >= self.elements.len() {
            return Err(BlockError::range(
                "debug element index",
                index as i64,
                0,
                self.elements.len() as i64 - 1,
            ));
        }
        let mut remainder = self.elements[index].kind.line_diff().unwrap_or(0);
        if remainder != 0 {
            if index > 0 {
                remainder = spill_line_diff(&mut self.elements[index - 1], remainder);
            }
            if remainder != 0 && index + 1 < self.elements.len() {
                remainder = spill_line_diff(&mut self.elements[index + 1], remainder);
            }
            if remainder != 0 {
                if index == 0 {
                    let folded = self.line_start as i64 + remainder;
                    if folded < 0 || folded > u32::MAX as i64 {
                        return Err(BlockError::range(
                            "line start after fold",
                            folded,
                            0,
                            u32::MAX as i64,
                        ));
                    }
                    self.line_start = folded as u32;
                } else {
                    return Err(BlockError::range(
                        "unconserved line delta",
                        remainder,
                        0,
                        0,
                    ));
                }
            }
        }
        let removed = self.elements.remove(index);
        self.cache_values();
        Ok(removed)
    }

    /// Encoded size in bytes, agreeing exactly with [`DebugSequence::write`].
    pub fn byte_size(&self) -> usize {
        let mut len = uleb128_len(self.line_start) + uleb128_len(self.parameter_names.len() as u32);
        for &name in &self.parameter_names {
            len += ulebp1_len(name);
        }
        for element in &self.elements {
            len += element.kind.encoded_len();
        }
        len + 1 // end-sequence
    }

    pub fn write(&self, buffer: &mut Vec<u8>) -> usize {
        let start = buffer.len();
        write_uleb128(buffer, self.line_start);
        write_uleb128(buffer, self.parameter_names.len() as u32);
        for &name in &self.parameter_names {
            write_uleb128p1(buffer, opt_index(name));
        }
        for element in &self.elements {
            element.kind.write(buffer);
        }
        write_u1(buffer, DBG_END_SEQUENCE);
        buffer.len() - start
    }
}

fn read_index(bytes: &[u8], ix: &mut usize) -> Result<Option<u32>, BlockError> {
    let raw = read_uleb128p1(bytes, ix)?;
    Ok(if raw < 0 { None } else { Some(raw as u32) })
}

/// Add as much of `diff` to the element's line diff as its capacity
/// allows; returns what could not be absorbed. Capacity only binds
/// upward, at the special-opcode limit.
fn spill_line_diff(element: &mut DebugElement, diff: i64) -> i64 {
    let current = match element.kind.line_diff() {
        Some(d) => d,
        None => return diff,
    };
    if diff < 0 {
        element.kind.set_line_diff(current + diff);
        return 0;
    }
    let capacity = SPECIAL_OPCODE_CAPACITY - current;
    if capacity <= 0 {
        return diff;
    }
    let taken = diff.min(capacity);
    element.kind.set_line_diff(current + taken);
    diff - taken
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(addr_diff: u32, line_diff: i32) -> DebugElementKind {
        DebugElementKind::LineNumber {
            addr_diff,
            line_diff,
        }
    }

    #[test]
    fn replay_matches_caches() {
        let mut seq = DebugSequence::new(10);
        seq.push(line(2, 1));
        seq.push(DebugElementKind::AdvancePc { addr_diff: 5 });
        seq.push(DebugElementKind::AdvanceLine { line_diff: -3 });
        seq.push(line(1, 2));
        assert_eq!(seq.get(0).unwrap().address(), 2);
        assert_eq!(seq.get(0).unwrap().line(), 11);
        assert_eq!(seq.get(3).unwrap().address(), 8);
        assert_eq!(seq.get(3).unwrap().line(), 10);
        assert_eq!(seq.end_state(), (8, 10));
    }

    #[test]
    fn byte_round_trip() {
        let mut seq = DebugSequence::new(42);
        seq.add_parameter_name(Some(3));
        seq.add_parameter_name(None);
        seq.push(DebugElementKind::PrologueEnd);
        seq.push(line(1, 0));
        seq.push(DebugElementKind::StartLocal {
            register: 2,
            name_index: Some(7),
            type_index: None,
        });
        seq.push(DebugElementKind::AdvancePc { addr_diff: 300 });
        seq.push(line(0, 5));
        seq.push(DebugElementKind::EndLocal { register: 2 });

        let mut bytes = Vec::new();
        let written = seq.write(&mut bytes);
        assert_eq!(written, seq.byte_size());

        let mut ix = 0;
        let read = DebugSequence::read(&bytes, &mut ix).unwrap();
        assert_eq!(ix, bytes.len());
        assert_eq!(read.line_start(), 42);
        assert_eq!(read.parameter_names(), &[Some(3), None]);
        assert_eq!(read.len(), seq.len());
        assert_eq!(read.end_state(), seq.end_state());
    }

    #[test]
    fn oversized_diffs_split_into_advances() {
        let mut seq = DebugSequence::new(1);
        seq.push(line(100, 30));
        let mut bytes = Vec::new();
        let written = seq.write(&mut bytes);
        assert_eq!(written, seq.byte_size());

        let mut ix = 0;
        let read = DebugSequence::read(&bytes, &mut ix).unwrap();
        assert_eq!(read.end_state(), (100, 31));
    }

    #[test]
    fn set_target_address_preserves_later_addresses() {
        let mut seq = DebugSequence::new(1);
        seq.push(line(4, 1));
        seq.push(line(4, 1));
        seq.push(line(4, 1));
        let later = seq.get(2).unwrap().address();

        seq.set_target_address(1, 10).unwrap();
        assert_eq!(seq.get(1).unwrap().address(), 10);
        assert_eq!(seq.get(2).unwrap().address(), later);
    }

    #[test]
    fn set_target_address_clamp_cascades() {
        let mut seq = DebugSequence::new(1);
        seq.push(line(4, 0));
        seq.push(line(1, 0));
        seq.push(line(1, 0));
        // element 0 jumps to 6: following diffs shrink to zero in turn
        seq.set_target_address(0, 6).unwrap();
        assert_eq!(seq.get(0).unwrap().address(), 6);
        assert_eq!(seq.get(1).unwrap().address(), 6);
        assert_eq!(seq.get(2).unwrap().address(), 6);
    }

    #[test]
    fn marker_rejects_target_address() {
        let mut seq = DebugSequence::new(1);
        seq.push(DebugElementKind::PrologueEnd);
        assert!(seq.set_target_address(0, 4).is_err());
    }

    #[test]
    fn removal_conserves_total_line_delta() {
        let mut seq = DebugSequence::new(10);
        seq.push(line(1, 3));
        seq.push(line(1, 5));
        seq.push(line(1, 2));
        let (_, final_line) = seq.end_state();

        seq.remove(1).unwrap();
        assert_eq!(seq.end_state().1, final_line);
        assert_eq!(seq.len(), 2);
    }

    #[test]
    fn removing_first_folds_into_line_start() {
        let mut seq = DebugSequence::new(10);
        seq.push(DebugElementKind::AdvanceLine { line_diff: 7 });
        seq.push(DebugElementKind::PrologueEnd);
        let final_line = seq.end_state().1;

        seq.remove(0).unwrap();
        assert_eq!(seq.line_start(), 17);
        assert_eq!(seq.end_state().1, final_line);
    }

    #[test]
    fn unconservable_removal_is_an_error() {
        let mut seq = DebugSequence::new(1);
        seq.push(DebugElementKind::AdvanceLine { line_diff: 245 });
        seq.push(DebugElementKind::AdvanceLine { line_diff: 600 });
        seq.push(DebugElementKind::AdvanceLine { line_diff: 245 });
        let err = seq.remove(1).unwrap_err();
        assert!(err.to_string().contains("unconserved line delta"));
    }

    #[test]
    fn flag_offset_bounds() {
        assert!(DebugElementKind::from_flag_offset(245).is_ok());
        assert!(DebugElementKind::from_flag_offset(246).is_err());
        assert_eq!(
            DebugElementKind::from_flag_offset(0).unwrap(),
            line(0, -4)
        );
    }
}
