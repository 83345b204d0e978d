//! The textual form of a code body: a line-oriented listing with opcode
//! mnemonics, `vN` registers, `:label` targets and `.catch`/`.line`
//! directives. `to_text` renders the tree and `from_text` assembles it
//! back; text -> tree -> text is stable for unchanged input.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1, hex_digit1, space0, space1};
use nom::combinator::opt;
use nom::multi::separated_list0;
use nom::sequence::{delimited, preceded};
use nom::IResult;
use std::collections::HashMap;

use crate::dex::code::CodeItem;
use crate::dex::debug::{DebugElementKind, DebugSequence};
use crate::dex::ins::{Ins, FILL_ARRAY_DATA_PAYLOAD, PACKED_SWITCH_PAYLOAD, SPARSE_SWITCH_PAYLOAD};
use crate::dex::opcodes::{Format, LabelKind, Opcode};
use crate::dex::tries::{HandlerSet, TryItem};
use crate::error::BlockError;

pub fn to_text(item: &CodeItem) -> Result<String, BlockError> {
    let labels = collect_labels(item);
    let mut out = String::new();
    out.push_str(&format!(".registers {}\n", item.registers_size()));

    let mut line_markers: HashMap<u32, u32> = HashMap::new();
    if let Some(debug) = item.debug() {
        for element in debug.iter() {
            if let DebugElementKind::LineNumber { .. } = element.kind() {
                line_markers.insert(element.address(), element.line());
            }
        }
    }

    for ins in item.instructions().iter() {
        if let Some(name) = labels.get(&ins.address()) {
            out.push_str(&format!(":{}\n", name));
        }
        if let Some(&line) = line_markers.get(&ins.address()) {
            out.push_str(&format!("    .line {}\n", line));
        }
        out.push_str("    ");
        out.push_str(&render_instruction(ins, &labels)?);
        out.push('\n');
    }
    // a label can sit exactly at the end of the code area (try end)
    let end = item.instructions().unit_count() as u32;
    if let Some(name) = labels.get(&end) {
        out.push_str(&format!(":{}\n", name));
    }

    for try_item in item.tries().iter() {
        let start = label_ref(&labels, try_item.start_address())?;
        let stop = label_ref(&labels, try_item.end_address())?;
        for handler in try_item.handlers().typed() {
            out.push_str(&format!(
                ".catch @{} {{:{} .. :{}}} :{}\n",
                handler.type_index,
                start,
                stop,
                label_ref(&labels, handler.address)?
            ));
        }
        if let Some(address) = try_item.handlers().catch_all() {
            out.push_str(&format!(
                ".catchall {{:{} .. :{}}} :{}\n",
                start,
                stop,
                label_ref(&labels, address)?
            ));
        }
    }
    Ok(out)
}

/// Every address that needs a `:label_xxxxxxxx` line: branch targets, try
/// boundaries and handler addresses.
fn collect_labels(item: &CodeItem) -> HashMap<u32, String> {
    let mut labels = HashMap::new();
    let mut add = |address: u32| {
        labels
            .entry(address)
            .or_insert_with(|| format!("label_{:08x}", address));
    };
    for ins in item.instructions().iter() {
        if let Some(target) = ins.target_address() {
            add(target);
        }
    }
    for try_item in item.tries().iter() {
        add(try_item.start_address());
        add(try_item.end_address());
        for handler in try_item.handlers().typed() {
            add(handler.address);
        }
        if let Some(address) = try_item.handlers().catch_all() {
            add(address);
        }
    }
    labels
}

fn label_ref(labels: &HashMap<u32, String>, address: u32) -> Result<&str, BlockError> {
    match labels.get(&address) {
        Some(name) => Ok(name),
        None => fail!(Consistency, "no label collected for address {}", address),
    }
}

fn render_instruction(ins: &Ins, labels: &HashMap<u32, String>) -> Result<String, BlockError> {
    if ins.is_payload() {
        let mut line = String::from(".payload");
        for &unit in ins.units() {
            line.push_str(&format!(" {:04x}", unit));
        }
        return Ok(line);
    }
    let opcode = ins.opcode()?;
    let mut line = opcode.name.to_string();
    let operands = render_operands(ins, opcode, labels)?;
    if !operands.is_empty() {
        line.push(' ');
        line.push_str(&operands);
    }
    Ok(line)
}

fn render_operands(
    ins: &Ins,
    opcode: &Opcode,
    labels: &HashMap<u32, String>,
) -> Result<String, BlockError> {
    let label = |ins: &Ins| -> Result<String, BlockError> {
        let target = match ins.target_address() {
            Some(t) => t,
            None => fail!(Consistency, "{} has no resolved target", opcode.name),
        };
        Ok(format!(":{}", label_ref(labels, target)?))
    };
    let text = match opcode.format {
        Format::F10x => String::new(),
        Format::F12x => format!("v{}, v{}", ins.nibble(2)?, ins.nibble(3)?),
        Format::F11n => {
            let lit = ((ins.nibble(3)? as i8) << 4) >> 4;
            format!("v{}, #{}", ins.nibble(2)?, lit)
        }
        Format::F11x => format!("v{}", ins.byte_at(1)?),
        Format::F10t | Format::F20t | Format::F30t => label(ins)?,
        Format::F22x => format!("v{}, v{}", ins.byte_at(1)?, ins.short_at(1)?),
        Format::F21t | Format::F31t => format!("v{}, {}", ins.byte_at(1)?, label(ins)?),
        Format::F21s => format!("v{}, #{}", ins.byte_at(1)?, ins.short_at(1)? as i16),
        Format::F21h => format!("v{}, #{}", ins.byte_at(1)?, ins.short_at(1)? as i16),
        Format::F21c => format!("v{}, @{}", ins.byte_at(1)?, ins.short_at(1)?),
        Format::F23x => format!(
            "v{}, v{}, v{}",
            ins.byte_at(1)?,
            ins.byte_at(2)?,
            ins.byte_at(3)?
        ),
        Format::F22b => format!(
            "v{}, v{}, #{}",
            ins.byte_at(1)?,
            ins.byte_at(2)?,
            ins.byte_at(3)? as i8
        ),
        Format::F22t => format!("v{}, v{}, {}", ins.nibble(2)?, ins.nibble(3)?, label(ins)?),
        Format::F22s => format!(
            "v{}, v{}, #{}",
            ins.nibble(2)?,
            ins.nibble(3)?,
            ins.short_at(1)? as i16
        ),
        Format::F22c => format!(
            "v{}, v{}, @{}",
            ins.nibble(2)?,
            ins.nibble(3)?,
            ins.short_at(1)?
        ),
        Format::F32x => format!("v{}, v{}", ins.short_at(1)?, ins.short_at(2)?),
        Format::F31i => {
            let lit = ins.short_at(1)? as u32 | ((ins.short_at(2)? as u32) << 16);
            format!("v{}, #{}", ins.byte_at(1)?, lit as i32)
        }
        Format::F31c => {
            let index = ins.short_at(1)? as u32 | ((ins.short_at(2)? as u32) << 16);
            format!("v{}, @{}", ins.byte_at(1)?, index)
        }
        Format::F35c => {
            let count = ins.nibble(3)? as usize;
            let regs = [
                ins.nibble(8)?,
                ins.nibble(9)?,
                ins.nibble(10)?,
                ins.nibble(11)?,
                ins.nibble(2)?,
            ];
            let list: Vec<String> = regs[..count.min(5)]
                .iter()
                .map(|r| format!("v{}", r))
                .collect();
            format!("{{{}}}, @{}", list.join(", "), ins.short_at(1)?)
        }
        Format::F3rc => {
            let count = ins.byte_at(1)? as u16;
            let first = ins.short_at(2)?;
            format!(
                "{{v{} .. v{}}}, @{}",
                first,
                first + count.saturating_sub(1),
                ins.short_at(1)?
            )
        }
        Format::F45cc => {
            let count = ins.nibble(3)? as usize;
            let regs = [
                ins.nibble(8)?,
                ins.nibble(9)?,
                ins.nibble(10)?,
                ins.nibble(11)?,
                ins.nibble(2)?,
            ];
            let list: Vec<String> = regs[..count.min(5)]
                .iter()
                .map(|r| format!("v{}", r))
                .collect();
            format!(
                "{{{}}}, @{}, @{}",
                list.join(", "),
                ins.short_at(1)?,
                ins.short_at(3)?
            )
        }
        Format::F4rcc => {
            let count = ins.byte_at(1)? as u16;
            let first = ins.short_at(2)?;
            format!(
                "{{v{} .. v{}}}, @{}, @{}",
                first,
                first + count.saturating_sub(1),
                ins.short_at(1)?,
                ins.short_at(3)?
            )
        }
        Format::F51l => {
            let lit = ins.short_at(1)? as u64
                | ((ins.short_at(2)? as u64) << 16)
                | ((ins.short_at(3)? as u64) << 32)
                | ((ins.short_at(4)? as u64) << 48);
            format!("v{}, #{}", ins.byte_at(1)?, lit as i64)
        }
        Format::Payload => String::new(),
    };
    Ok(text)
}

// ---------------------------------------------------------------------------
// Parsing

#[derive(Debug)]
enum Statement {
    Registers(u16),
    Line(u32),
    LabelDef(String),
    Instruction {
        opcode: &'static Opcode,
        operands: Vec<Operand>,
    },
    Payload(Vec<u16>),
    Catch {
        type_index: Option<u32>,
        start: String,
        end: String,
        handler: String,
    },
}

#[derive(Debug, Clone)]
enum Operand {
    Register(u32),
    RegisterList(Vec<u32>),
    RegisterRange(u32, u32),
    Literal(i64),
    Index(u32),
    Label(String),
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn mnemonic(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '/')(input)
}

fn number(input: &str) -> IResult<&str, i64> {
    let (input, sign) = opt(char('-'))(input)?;
    let (input, value) = alt((hex_number, decimal_number))(input)?;
    Ok((input, if sign.is_some() { -value } else { value }))
}

fn hex_number(input: &str) -> IResult<&str, i64> {
    let (input, digits) = preceded(tag("0x"), hex_digit1)(input)?;
    let value = i64::from_str_radix(digits, 16).unwrap_or(0);
    Ok((input, value))
}

fn decimal_number(input: &str) -> IResult<&str, i64> {
    let (input, digits) = digit1(input)?;
    let value: i64 = digits.parse().unwrap_or(0);
    Ok((input, value))
}

fn register(input: &str) -> IResult<&str, u32> {
    let (input, digits) = preceded(char('v'), digit1)(input)?;
    Ok((input, digits.parse().unwrap_or(0)))
}

fn label_name(input: &str) -> IResult<&str, String> {
    let (input, name) = preceded(char(':'), identifier)(input)?;
    Ok((input, name.to_string()))
}

fn operand(input: &str) -> IResult<&str, Operand> {
    alt((
        register_range,
        register_list,
        |i| register(i).map(|(r, v)| (r, Operand::Register(v))),
        |i| preceded(char('#'), number)(i).map(|(r, v)| (r, Operand::Literal(v))),
        |i| preceded(char('@'), number)(i).map(|(r, v)| (r, Operand::Index(v as u32))),
        |i| label_name(i).map(|(r, v)| (r, Operand::Label(v))),
    ))(input)
}

fn register_list(input: &str) -> IResult<&str, Operand> {
    let (input, registers) = delimited(
        char('{'),
        separated_list0(delimited(space0, char(','), space0), register),
        char('}'),
    )(input)?;
    Ok((input, Operand::RegisterList(registers)))
}

fn register_range(input: &str) -> IResult<&str, Operand> {
    let (input, _) = char('{')(input)?;
    let (input, first) = register(input)?;
    let (input, _) = delimited(space0, tag(".."), space0)(input)?;
    let (input, last) = register(input)?;
    let (input, _) = char('}')(input)?;
    Ok((input, Operand::RegisterRange(first, last)))
}

fn parse_statement(line: &str) -> Result<Option<Statement>, BlockError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    if let Some(rest) = trimmed.strip_prefix(".registers ") {
        let value: u16 = rest
            .trim()
            .parse()
            .map_err(|_| BlockError::format(&format!("bad register count: {}", rest.trim())))?;
        return Ok(Some(Statement::Registers(value)));
    }
    if let Some(rest) = trimmed.strip_prefix(".line ") {
        let value: u32 = rest
            .trim()
            .parse()
            .map_err(|_| BlockError::format(&format!("bad line number: {}", rest.trim())))?;
        return Ok(Some(Statement::Line(value)));
    }
    if let Some(rest) = trimmed.strip_prefix(".payload") {
        let mut units = Vec::new();
        for word in rest.split_whitespace() {
            let unit = u16::from_str_radix(word, 16)
                .map_err(|_| BlockError::format(&format!("bad payload unit: {}", word)))?;
            units.push(unit);
        }
        return Ok(Some(Statement::Payload(units)));
    }
    if trimmed.starts_with(".catch") {
        return parse_catch(trimmed).map(Some);
    }
    if let Some(rest) = trimmed.strip_prefix(':') {
        return Ok(Some(Statement::LabelDef(rest.trim().to_string())));
    }
    parse_instruction(trimmed).map(Some)
}

fn catch_inner(input: &str) -> IResult<&str, Statement> {
    let (input, catchall) = alt((tag(".catchall"), tag(".catch")))(input)?;
    let is_all = catchall == ".catchall";
    let (input, type_index) = if is_all {
        (input, None)
    } else {
        let (input, index) = preceded(space1, preceded(char('@'), number))(input)?;
        (input, Some(index as u32))
    };
    let (input, _) = delimited(space1, char('{'), space0)(input)?;
    let (input, start) = label_name(input)?;
    let (input, _) = delimited(space0, tag(".."), space0)(input)?;
    let (input, end) = label_name(input)?;
    let (input, _) = preceded(space0, char('}'))(input)?;
    let (input, handler) = preceded(space1, label_name)(input)?;
    Ok((
        input,
        Statement::Catch {
            type_index,
            start,
            end,
            handler,
        },
    ))
}

fn parse_catch(input: &str) -> Result<Statement, BlockError> {
    match catch_inner(input) {
        Ok((_, statement)) => Ok(statement),
        Err(_) => Err(BlockError::format(&format!("bad catch directive: {}", input))),
    }
}

fn instruction_inner(input: &str) -> IResult<&str, (&str, Vec<Operand>)> {
    let (input, name) = mnemonic(input)?;
    let (input, _) = space0(input)?;
    let (input, operands) = separated_list0(delimited(space0, char(','), space0), operand)(input)?;
    Ok((input, (name, operands)))
}

fn parse_instruction(input: &str) -> Result<Statement, BlockError> {
    let (name, operands) = match instruction_inner(input) {
        Ok((rest, parts)) if rest.trim().is_empty() => parts,
        _ => return Err(BlockError::format(&format!("bad instruction line: {}", input))),
    };
    let opcode = Opcode::by_name(name)
        .ok_or_else(|| BlockError::format(&format!("unknown opcode: {}", name)))?;
    Ok(Statement::Instruction { opcode, operands })
}

struct PendingLine {
    address: u32,
    line: u32,
}

pub fn from_text(text: &str) -> Result<CodeItem, BlockError> {
    let mut statements = Vec::new();
    for line in text.lines() {
        if let Some(statement) = parse_statement(line)? {
            statements.push(statement);
        }
    }

    // First pass: assign addresses and collect label definitions, so the
    // second pass can resolve every label reference.
    let mut labels: HashMap<String, u32> = HashMap::new();
    let mut address = 0u32;
    for statement in &statements {
        match statement {
            Statement::LabelDef(name) => {
                if labels.insert(name.clone(), address).is_some() {
                    fail!(Format, "label defined twice: {}", name);
                }
            }
            Statement::Instruction { opcode, .. } => {
                address += opcode.format.code_units() as u32;
            }
            Statement::Payload(units) => {
                if address % 2 != 0 {
                    address += 1;
                }
                address += units.len() as u32;
            }
            _ => {}
        }
    }

    let resolve = |name: &str| -> Result<u32, BlockError> {
        match labels.get(name) {
            Some(&address) => Ok(address),
            None => fail!(Format, "undefined label: {}", name),
        }
    };

    let mut item = CodeItem::new(1, 0, 0);
    let mut line_markers: Vec<PendingLine> = Vec::new();
    let mut address = 0u32;
    for statement in statements {
        match statement {
            Statement::Registers(count) => item.set_registers_size(count),
            Statement::Line(line) => line_markers.push(PendingLine { address, line }),
            Statement::LabelDef(_) => {}
            Statement::Payload(units) => {
                if address % 2 != 0 {
                    address += 1;
                }
                address += units.len() as u32;
                item.push_instruction(payload_from_units(units)?);
            }
            Statement::Instruction { opcode, operands } => {
                address += opcode.format.code_units() as u32;
                item.push_instruction(assemble(opcode, &operands, &resolve)?);
            }
            Statement::Catch {
                type_index,
                start,
                end,
                handler,
            } => {
                let start_address = resolve(&start)?;
                let end_address = resolve(&end)?;
                if end_address < start_address {
                    fail!(Format, "try range ends before it starts: :{} .. :{}", start, end);
                }
                let handler_address = resolve(&handler)?;
                attach_handler(
                    item.tries_mut(),
                    start_address,
                    (end_address - start_address) as u16,
                    type_index,
                    handler_address,
                );
            }
        }
    }

    if !line_markers.is_empty() {
        let mut debug = DebugSequence::new(line_markers[0].line);
        let mut previous_address = 0u32;
        let mut previous_line = line_markers[0].line as i64;
        for marker in &line_markers {
            debug.push(DebugElementKind::LineNumber {
                addr_diff: marker.address - previous_address,
                line_diff: (marker.line as i64 - previous_line) as i32,
            });
            previous_address = marker.address;
            previous_line = marker.line as i64;
        }
        item.attach_debug(debug);
    }

    item.refresh()?;
    Ok(item)
}

/// Merge a catch directive into the try list: directives naming the same
/// range extend one handler set, fresh ranges open a new try.
fn attach_handler(
    tries: &mut crate::dex::tries::TryList,
    start_address: u32,
    unit_count: u16,
    type_index: Option<u32>,
    handler_address: u32,
) {
    let existing = (0..tries.len()).find(|&index| {
        tries
            .get(index)
            .map(|t| t.start_address() == start_address && t.unit_count() == unit_count)
            .unwrap_or(false)
    });
    if let Some(index) = existing {
        if let Some(try_item) = tries.get_mut(index) {
            let handlers = try_item.handlers_mut();
            match type_index {
                Some(t) => handlers.add_typed(t, handler_address),
                None => handlers.set_catch_all(handler_address),
            }
        }
        return;
    }
    let mut handlers = HandlerSet::new();
    match type_index {
        Some(t) => handlers.add_typed(t, handler_address),
        None => handlers.set_catch_all(handler_address),
    }
    tries.push(TryItem::new(start_address, unit_count, handlers));
}

fn payload_from_units(units: Vec<u16>) -> Result<Ins, BlockError> {
    match units.first() {
        Some(&PACKED_SWITCH_PAYLOAD) | Some(&SPARSE_SWITCH_PAYLOAD)
        | Some(&FILL_ARRAY_DATA_PAYLOAD) => Ins::from_units(units),
        _ => fail!(Format, "payload directive with unknown ident"),
    }
}

fn assemble<F>(opcode: &'static Opcode, operands: &[Operand], resolve: &F) -> Result<Ins, BlockError>
where
    F: Fn(&str) -> Result<u32, BlockError>,
{
    let mut ins = Ins::new(opcode);
    let expect = |wanted: usize| -> Result<(), BlockError> {
        if operands.len() != wanted {
            fail!(
                Format,
                "{} takes {} operands, got {}",
                opcode.name,
                wanted,
                operands.len()
            );
        }
        Ok(())
    };
    let reg = |operand: &Operand| -> Result<u32, BlockError> {
        match operand {
            Operand::Register(r) => Ok(*r),
            _ => fail!(Format, "{} expects a register operand", opcode.name),
        }
    };
    let lit = |operand: &Operand| -> Result<i64, BlockError> {
        match operand {
            Operand::Literal(v) => Ok(*v),
            _ => fail!(Format, "{} expects a literal operand", opcode.name),
        }
    };
    let idx = |operand: &Operand| -> Result<u32, BlockError> {
        match operand {
            Operand::Index(v) => Ok(*v),
            _ => fail!(Format, "{} expects an index operand", opcode.name),
        }
    };
    let lbl = |operand: &Operand| -> Result<u32, BlockError> {
        match operand {
            Operand::Label(name) => resolve(name),
            _ => fail!(Format, "{} expects a label operand", opcode.name),
        }
    };

    match opcode.format {
        Format::F10x => expect(0)?,
        Format::F12x => {
            expect(2)?;
            ins.set_nibble(2, reg(&operands[0])? as u8)?;
            ins.set_nibble(3, reg(&operands[1])? as u8)?;
        }
        Format::F11n => {
            expect(2)?;
            ins.set_nibble(2, reg(&operands[0])? as u8)?;
            ins.set_nibble(3, (lit(&operands[1])? as u8) & 0xF)?;
        }
        Format::F11x => {
            expect(1)?;
            ins.set_byte_at(1, reg(&operands[0])? as u8)?;
        }
        Format::F10t | Format::F20t | Format::F30t => {
            expect(1)?;
            ins.set_target_address(lbl(&operands[0])?)?;
        }
        Format::F22x => {
            expect(2)?;
            ins.set_byte_at(1, reg(&operands[0])? as u8)?;
            ins.set_short_at(1, reg(&operands[1])? as u16)?;
        }
        Format::F21t | Format::F31t => {
            expect(2)?;
            ins.set_byte_at(1, reg(&operands[0])? as u8)?;
            ins.set_target_address(lbl(&operands[1])?)?;
        }
        Format::F21s | Format::F21h => {
            expect(2)?;
            ins.set_byte_at(1, reg(&operands[0])? as u8)?;
            ins.set_short_at(1, lit(&operands[1])? as i16 as u16)?;
        }
        Format::F21c => {
            expect(2)?;
            ins.set_byte_at(1, reg(&operands[0])? as u8)?;
            ins.set_short_at(1, idx(&operands[1])? as u16)?;
        }
        Format::F23x => {
            expect(3)?;
            ins.set_byte_at(1, reg(&operands[0])? as u8)?;
            ins.set_byte_at(2, reg(&operands[1])? as u8)?;
            ins.set_byte_at(3, reg(&operands[2])? as u8)?;
        }
        Format::F22b => {
            expect(3)?;
            ins.set_byte_at(1, reg(&operands[0])? as u8)?;
            ins.set_byte_at(2, reg(&operands[1])? as u8)?;
            ins.set_byte_at(3, lit(&operands[2])? as i8 as u8)?;
        }
        Format::F22t => {
            expect(3)?;
            ins.set_nibble(2, reg(&operands[0])? as u8)?;
            ins.set_nibble(3, reg(&operands[1])? as u8)?;
            ins.set_target_address(lbl(&operands[2])?)?;
        }
        Format::F22s => {
            expect(3)?;
            ins.set_nibble(2, reg(&operands[0])? as u8)?;
            ins.set_nibble(3, reg(&operands[1])? as u8)?;
            ins.set_short_at(1, lit(&operands[2])? as i16 as u16)?;
        }
        Format::F22c => {
            expect(3)?;
            ins.set_nibble(2, reg(&operands[0])? as u8)?;
            ins.set_nibble(3, reg(&operands[1])? as u8)?;
            ins.set_short_at(1, idx(&operands[2])? as u16)?;
        }
        Format::F32x => {
            expect(2)?;
            ins.set_short_at(1, reg(&operands[0])? as u16)?;
            ins.set_short_at(2, reg(&operands[1])? as u16)?;
        }
        Format::F31i => {
            expect(2)?;
            ins.set_byte_at(1, reg(&operands[0])? as u8)?;
            let value = lit(&operands[1])? as i32 as u32;
            ins.set_short_at(1, value as u16)?;
            ins.set_short_at(2, (value >> 16) as u16)?;
        }
        Format::F31c => {
            expect(2)?;
            ins.set_byte_at(1, reg(&operands[0])? as u8)?;
            let value = idx(&operands[1])?;
            ins.set_short_at(1, value as u16)?;
            ins.set_short_at(2, (value >> 16) as u16)?;
        }
        Format::F35c | Format::F45cc => {
            let wanted = if opcode.format == Format::F45cc { 3 } else { 2 };
            expect(wanted)?;
            let registers = match &operands[0] {
                Operand::RegisterList(list) if list.len() <= 5 => list.clone(),
                _ => fail!(Format, "{} expects a register list of up to 5", opcode.name),
            };
            ins.set_nibble(3, registers.len() as u8)?;
            for (slot, &register) in registers.iter().enumerate() {
                let nibble_index = if slot == 4 { 2 } else { 8 + slot };
                ins.set_nibble(nibble_index, register as u8)?;
            }
            ins.set_short_at(1, idx(&operands[1])? as u16)?;
            if opcode.format == Format::F45cc {
                ins.set_short_at(3, idx(&operands[2])? as u16)?;
            }
        }
        Format::F3rc | Format::F4rcc => {
            let wanted = if opcode.format == Format::F4rcc { 3 } else { 2 };
            expect(wanted)?;
            let (first, last) = match &operands[0] {
                Operand::RegisterRange(first, last) if last >= first => (*first, *last),
                _ => fail!(Format, "{} expects a register range", opcode.name),
            };
            ins.set_byte_at(1, (last - first + 1) as u8)?;
            ins.set_short_at(1, idx(&operands[1])? as u16)?;
            ins.set_short_at(2, first as u16)?;
            if opcode.format == Format::F4rcc {
                ins.set_short_at(3, idx(&operands[2])? as u16)?;
            }
        }
        Format::F51l => {
            expect(2)?;
            ins.set_byte_at(1, reg(&operands[0])? as u8)?;
            let value = lit(&operands[1])? as u64;
            ins.set_short_at(1, value as u16)?;
            ins.set_short_at(2, (value >> 16) as u16)?;
            ins.set_short_at(3, (value >> 32) as u16)?;
            ins.set_short_at(4, (value >> 48) as u16)?;
        }
        Format::Payload => fail!(Format, "payloads use the .payload directive"),
    }
    Ok(ins)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
.registers 3
    .line 12
    const/4 v0, #2
:try_start
    if-eqz v0, :done
    invoke-virtual {v0, v1}, @8
:done
    return-void
:after
.catch @4 {:try_start .. :done} :done
";

    #[test]
    fn assembles_and_round_trips() {
        let item = from_text(LISTING).unwrap();
        assert_eq!(item.registers_size(), 3);
        assert_eq!(item.instructions().len(), 4);
        assert_eq!(item.tries().len(), 1);
        assert_eq!(
            item.instructions().get(1).unwrap().target_address(),
            Some(6)
        );
        assert_eq!(item.debug().unwrap().line_start(), 12);

        let text = to_text(&item).unwrap();
        let again = from_text(&text).unwrap();
        assert_eq!(to_text(&again).unwrap(), text);
    }

    #[test]
    fn binary_and_text_agree() {
        let item = from_text(LISTING).unwrap();
        let mut bytes = Vec::new();
        item.write(&mut bytes).unwrap();
        let mut ix = 0;
        let read = CodeItem::read(&bytes, &mut ix).unwrap();
        assert_eq!(
            read.instructions().get(1).unwrap().target_address(),
            Some(6)
        );
        assert_eq!(read.tries().get(0).unwrap().handlers().typed()[0].type_index, 4);
    }

    #[test]
    fn catchall_and_shared_range_merge() {
        let text = "\
.registers 1
:start
    nop
:stop
    return-void
:handler
.catch @1 {:start .. :stop} :handler
.catchall {:start .. :stop} :handler
";
        let item = from_text(text).unwrap();
        assert_eq!(item.tries().len(), 1);
        let handlers = item.tries().get(0).unwrap().handlers();
        assert_eq!(handlers.typed().len(), 1);
        assert_eq!(handlers.catch_all(), Some(2));
    }

    #[test]
    fn unknown_opcode_is_a_format_error() {
        let err = from_text(".registers 1\n    frobnicate v0\n").unwrap_err();
        assert!(err.to_string().contains("unknown opcode"));
    }

    #[test]
    fn undefined_label_is_reported() {
        let err = from_text(".registers 1\n    goto :nowhere\n").unwrap_err();
        assert!(err.to_string().contains("undefined label"));
    }

    #[test]
    fn payload_directive_round_trips() {
        let text = "\
.registers 1
    nop
    .payload 0100 0002 0000 0000 0004 0000 0008 0000
    return-void
";
        let item = from_text(text).unwrap();
        assert!(item.instructions().get(1).unwrap().is_payload());
        let rendered = to_text(&item).unwrap();
        assert!(rendered.contains(".payload 0100 0002"));
    }
}
