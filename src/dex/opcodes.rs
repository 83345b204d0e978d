//! The Dalvik opcode set: value, mnemonic and encoding format.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Where a branch-capable format stores its target offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    None,
    /// Signed 8-bit offset in the high byte of unit 0 (10t).
    Rel8,
    /// Signed 16-bit offset in unit 1 (20t, 21t, 22t).
    Rel16,
    /// Signed 32-bit offset in units 1-2 (30t, 31t).
    Rel32,
}

/// One variant per operand layout, not per opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F22x,
    F21t,
    F21s,
    F21h,
    F21c,
    F23x,
    F22b,
    F22t,
    F22s,
    F22c,
    F32x,
    F30t,
    F31i,
    F31t,
    F31c,
    F35c,
    F3rc,
    F45cc,
    F4rcc,
    F51l,
    /// packed-switch, sparse-switch and fill-array-data payloads; width is
    /// content-dependent.
    Payload,
}

impl Format {
    /// Fixed code-unit width; payloads report 0 and size themselves.
    pub fn code_units(self) -> usize {
        match self {
            Format::F10x | Format::F12x | Format::F11n | Format::F11x | Format::F10t => 1,
            Format::F20t
            | Format::F22x
            | Format::F21t
            | Format::F21s
            | Format::F21h
            | Format::F21c
            | Format::F23x
            | Format::F22b
            | Format::F22t
            | Format::F22s
            | Format::F22c => 2,
            Format::F32x
            | Format::F30t
            | Format::F31i
            | Format::F31t
            | Format::F31c
            | Format::F35c
            | Format::F3rc => 3,
            Format::F45cc | Format::F4rcc => 4,
            Format::F51l => 5,
            Format::Payload => 0,
        }
    }

    pub fn label_kind(self) -> LabelKind {
        match self {
            Format::F10t => LabelKind::Rel8,
            Format::F20t | Format::F21t | Format::F22t => LabelKind::Rel16,
            Format::F30t | Format::F31t => LabelKind::Rel32,
            _ => LabelKind::None,
        }
    }
}

#[derive(Debug)]
pub struct Opcode {
    pub value: u8,
    pub name: &'static str,
    pub format: Format,
}

macro_rules! op {
    ($value:literal, $name:literal, $format:ident) => {
        Opcode {
            value: $value,
            name: $name,
            format: Format::$format,
        }
    };
}

static OPCODES: Lazy<Vec<Opcode>> = Lazy::new(|| {
    vec![
        op!(0x00, "nop", F10x),
        op!(0x01, "move", F12x),
        op!(0x02, "move/from16", F22x),
        op!(0x03, "move/16", F32x),
        op!(0x04, "move-wide", F12x),
        op!(0x05, "move-wide/from16", F22x),
        op!(0x06, "move-wide/16", F32x),
        op!(0x07, "move-object", F12x),
        op!(0x08, "move-object/from16", F22x),
        op!(0x09, "move-object/16", F32x),
        op!(0x0a, "move-result", F11x),
        op!(0x0b, "move-result-wide", F11x),
        op!(0x0c, "move-result-object", F11x),
        op!(0x0d, "move-exception", F11x),
        op!(0x0e, "return-void", F10x),
        op!(0x0f, "return", F11x),
        op!(0x10, "return-wide", F11x),
        op!(0x11, "return-object", F11x),
        op!(0x12, "const/4", F11n),
        op!(0x13, "const/16", F21s),
        op!(0x14, "const", F31i),
        op!(0x15, "const/high16", F21h),
        op!(0x16, "const-wide/16", F21s),
        op!(0x17, "const-wide/32", F31i),
        op!(0x18, "const-wide", F51l),
        op!(0x19, "const-wide/high16", F21h),
        op!(0x1a, "const-string", F21c),
        op!(0x1b, "const-string/jumbo", F31c),
        op!(0x1c, "const-class", F21c),
        op!(0x1d, "monitor-enter", F11x),
        op!(0x1e, "monitor-exit", F11x),
        op!(0x1f, "check-cast", F21c),
        op!(0x20, "instance-of", F22c),
        op!(0x21, "array-length", F12x),
        op!(0x22, "new-instance", F21c),
        op!(0x23, "new-array", F22c),
        op!(0x24, "filled-new-array", F35c),
        op!(0x25, "filled-new-array/range", F3rc),
        op!(0x26, "fill-array-data", F31t),
        op!(0x27, "throw", F11x),
        op!(0x28, "goto", F10t),
        op!(0x29, "goto/16", F20t),
        op!(0x2a, "goto/32", F30t),
        op!(0x2b, "packed-switch", F31t),
        op!(0x2c, "sparse-switch", F31t),
        op!(0x2d, "cmpl-float", F23x),
        op!(0x2e, "cmpg-float", F23x),
        op!(0x2f, "cmpl-double", F23x),
        op!(0x30, "cmpg-double", F23x),
        op!(0x31, "cmp-long", F23x),
        op!(0x32, "if-eq", F22t),
        op!(0x33, "if-ne", F22t),
        op!(0x34, "if-lt", F22t),
        op!(0x35, "if-ge", F22t),
        op!(0x36, "if-gt", F22t),
        op!(0x37, "if-le", F22t),
        op!(0x38, "if-eqz", F21t),
        op!(0x39, "if-nez", F21t),
        op!(0x3a, "if-ltz", F21t),
        op!(0x3b, "if-gez", F21t),
        op!(0x3c, "if-gtz", F21t),
        op!(0x3d, "if-lez", F21t),
        op!(0x44, "aget", F23x),
        op!(0x45, "aget-wide", F23x),
        op!(0x46, "aget-object", F23x),
        op!(0x47, "aget-boolean", F23x),
        op!(0x48, "aget-byte", F23x),
        op!(0x49, "aget-char", F23x),
        op!(0x4a, "aget-short", F23x),
        op!(0x4b, "aput", F23x),
        op!(0x4c, "aput-wide", F23x),
        op!(0x4d, "aput-object", F23x),
        op!(0x4e, "aput-boolean", F23x),
        op!(0x4f, "aput-byte", F23x),
        op!(0x50, "aput-char", F23x),
        op!(0x51, "aput-short", F23x),
        op!(0x52, "iget", F22c),
        op!(0x53, "iget-wide", F22c),
        op!(0x54, "iget-object", F22c),
        op!(0x55, "iget-boolean", F22c),
        op!(0x56, "iget-byte", F22c),
        op!(0x57, "iget-char", F22c),
        op!(0x58, "iget-short", F22c),
        op!(0x59, "iput", F22c),
        op!(0x5a, "iput-wide", F22c),
        op!(0x5b, "iput-object", F22c),
        op!(0x5c, "iput-boolean", F22c),
        op!(0x5d, "iput-byte", F22c),
        op!(0x5e, "iput-char", F22c),
        op!(0x5f, "iput-short", F22c),
        op!(0x60, "sget", F21c),
        op!(0x61, "sget-wide", F21c),
        op!(0x62, "sget-object", F21c),
        op!(0x63, "sget-boolean", F21c),
        op!(0x64, "sget-byte", F21c),
        op!(0x65, "sget-char", F21c),
        op!(0x66, "sget-short", F21c),
        op!(0x67, "sput", F21c),
        op!(0x68, "sput-wide", F21c),
        op!(0x69, "sput-object", F21c),
        op!(0x6a, "sput-boolean", F21c),
        op!(0x6b, "sput-byte", F21c),
        op!(0x6c, "sput-char", F21c),
        op!(0x6d, "sput-short", F21c),
        op!(0x6e, "invoke-virtual", F35c),
        op!(0x6f, "invoke-super", F35c),
        op!(0x70, "invoke-direct", F35c),
        op!(0x71, "invoke-static", F35c),
        op!(0x72, "invoke-interface", F35c),
        op!(0x74, "invoke-virtual/range", F3rc),
        op!(0x75, "invoke-super/range", F3rc),
        op!(0x76, "invoke-direct/range", F3rc),
        op!(0x77, "invoke-static/range", F3rc),
        op!(0x78, "invoke-interface/range", F3rc),
        op!(0x7b, "neg-int", F12x),
        op!(0x7c, "not-int", F12x),
        op!(0x7d, "neg-long", F12x),
        op!(0x7e, "not-long", F12x),
        op!(0x7f, "neg-float", F12x),
        op!(0x80, "neg-double", F12x),
        op!(0x81, "int-to-long", F12x),
        op!(0x82, "int-to-float", F12x),
        op!(0x83, "int-to-double", F12x),
        op!(0x84, "long-to-int", F12x),
        op!(0x85, "long-to-float", F12x),
        op!(0x86, "long-to-double", F12x),
        op!(0x87, "float-to-int", F12x),
        op!(0x88, "float-to-long", F12x),
        op!(0x89, "float-to-double", F12x),
        op!(0x8a, "double-to-int", F12x),
        op!(0x8b, "double-to-long", F12x),
        op!(0x8c, "double-to-float", F12x),
        op!(0x8d, "int-to-byte", F12x),
        op!(0x8e, "int-to-char", F12x),
        op!(0x8f, "int-to-short", F12x),
        op!(0x90, "add-int", F23x),
        op!(0x91, "sub-int", F23x),
        op!(0x92, "mul-int", F23x),
        op!(0x93, "div-int", F23x),
        op!(0x94, "rem-int", F23x),
        op!(0x95, "and-int", F23x),
        op!(0x96, "or-int", F23x),
        op!(0x97, "xor-int", F23x),
        op!(0x98, "shl-int", F23x),
        op!(0x99, "shr-int", F23x),
        op!(0x9a, "ushr-int", F23x),
        op!(0x9b, "add-long", F23x),
        op!(0x9c, "sub-long", F23x),
        op!(0x9d, "mul-long", F23x),
        op!(0x9e, "div-long", F23x),
        op!(0x9f, "rem-long", F23x),
        op!(0xa0, "and-long", F23x),
        op!(0xa1, "or-long", F23x),
        op!(0xa2, "xor-long", F23x),
        op!(0xa3, "shl-long", F23x),
        op!(0xa4, "shr-long", F23x),
        op!(0xa5, "ushr-long", F23x),
        op!(0xa6, "add-float", F23x),
        op!(0xa7, "sub-float", F23x),
        op!(0xa8, "mul-float", F23x),
        op!(0xa9, "div-float", F23x),
        op!(0xaa, "rem-float", F23x),
        op!(0xab, "add-double", F23x),
        op!(0xac, "sub-double", F23x),
        op!(0xad, "mul-double", F23x),
        op!(0xae, "div-double", F23x),
        op!(0xaf, "rem-double", F23x),
        op!(0xb0, "add-int/2addr", F12x),
        op!(0xb1, "sub-int/2addr", F12x),
        op!(0xb2, "mul-int/2addr", F12x),
        op!(0xb3, "div-int/2addr", F12x),
        op!(0xb4, "rem-int/2addr", F12x),
        op!(0xb5, "and-int/2addr", F12x),
        op!(0xb6, "or-int/2addr", F12x),
        op!(0xb7, "xor-int/2addr", F12x),
        op!(0xb8, "shl-int/2addr", F12x),
        op!(0xb9, "shr-int/2addr", F12x),
        op!(0xba, "ushr-int/2addr", F12x),
        op!(0xbb, "add-long/2addr", F12x),
        op!(0xbc, "sub-long/2addr", F12x),
        op!(0xbd, "mul-long/2addr", F12x),
        op!(0xbe, "div-long/2addr", F12x),
        op!(0xbf, "rem-long/2addr", F12x),
        op!(0xc0, "and-long/2addr", F12x),
        op!(0xc1, "or-long/2addr", F12x),
        op!(0xc2, "xor-long/2addr", F12x),
        op!(0xc3, "shl-long/2addr", F12x),
        op!(0xc4, "shr-long/2addr", F12x),
        op!(0xc5, "ushr-long/2addr", F12x),
        op!(0xc6, "add-float/2addr", F12x),
        op!(0xc7, "sub-float/2addr", F12x),
        op!(0xc8, "mul-float/2addr", F12x),
        op!(0xc9, "div-float/2addr", F12x),
        op!(0xca, "rem-float/2addr", F12x),
        op!(0xcb, "add-double/2addr", F12x),
        op!(0xcc, "sub-double/2addr", F12x),
        op!(0xcd, "mul-double/2addr", F12x),
        op!(0xce, "div-double/2addr", F12x),
        op!(0xcf, "rem-double/2addr", F12x),
        op!(0xd0, "add-int/lit16", F22s),
        op!(0xd1, "rsub-int", F22s),
        op!(0xd2, "mul-int/lit16", F22s),
        op!(0xd3, "div-int/lit16", F22s),
        op!(0xd4, "rem-int/lit16", F22s),
        op!(0xd5, "and-int/lit16", F22s),
        op!(0xd6, "or-int/lit16", F22s),
        op!(0xd7, "xor-int/lit16", F22s),
        op!(0xd8, "add-int/lit8", F22b),
        op!(0xd9, "rsub-int/lit8", F22b),
        op!(0xda, "mul-int/lit8", F22b),
        op!(0xdb, "div-int/lit8", F22b),
        op!(0xdc, "rem-int/lit8", F22b),
        op!(0xdd, "and-int/lit8", F22b),
        op!(0xde, "or-int/lit8", F22b),
        op!(0xdf, "xor-int/lit8", F22b),
        op!(0xe0, "shl-int/lit8", F22b),
        op!(0xe1, "shr-int/lit8", F22b),
        op!(0xe2, "ushr-int/lit8", F22b),
        op!(0xfa, "invoke-polymorphic", F45cc),
        op!(0xfb, "invoke-polymorphic/range", F4rcc),
        op!(0xfc, "invoke-custom", F35c),
        op!(0xfd, "invoke-custom/range", F3rc),
        op!(0xfe, "const-method-handle", F21c),
        op!(0xff, "const-method-type", F21c),
    ]
});

static BY_VALUE: Lazy<HashMap<u8, &'static Opcode>> =
    Lazy::new(|| OPCODES.iter().map(|op| (op.value, op)).collect());

static BY_NAME: Lazy<HashMap<&'static str, &'static Opcode>> =
    Lazy::new(|| OPCODES.iter().map(|op| (op.name, op)).collect());

impl Opcode {
    /// Lookup by opcode byte; `None` for undefined/odex values.
    pub fn for_value(value: u8) -> Option<&'static Opcode> {
        BY_VALUE.get(&value).copied()
    }

    /// Lookup by mnemonic, used by the textual form.
    pub fn by_name(name: &str) -> Option<&'static Opcode> {
        BY_NAME.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_agree() {
        let goto16 = Opcode::for_value(0x29).unwrap();
        assert_eq!(goto16.name, "goto/16");
        assert_eq!(goto16.format, Format::F20t);
        assert_eq!(goto16.format.code_units(), 2);
        assert_eq!(goto16.format.label_kind(), LabelKind::Rel16);
        assert!(std::ptr::eq(Opcode::by_name("goto/16").unwrap(), goto16));
    }

    #[test]
    fn undefined_values_are_absent() {
        assert!(Opcode::for_value(0x3e).is_none());
        assert!(Opcode::for_value(0x73).is_none());
        assert!(Opcode::for_value(0xe3).is_none());
    }

    #[test]
    fn widths_cover_all_fixed_formats() {
        assert_eq!(Format::F10x.code_units(), 1);
        assert_eq!(Format::F22t.code_units(), 2);
        assert_eq!(Format::F31t.code_units(), 3);
        assert_eq!(Format::F45cc.code_units(), 4);
        assert_eq!(Format::F51l.code_units(), 5);
    }
}
