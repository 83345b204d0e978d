use std::fmt;

/// Classifies a [`BlockError`]. The kind decides whether a caller can
/// reasonably retry or must abandon the operation; all three are fatal to
/// the read/write that raised them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or truncated input: bad chunk header, out-of-bounds read,
    /// unexpected chunk type.
    Format,
    /// A value outside its encodable bounds: line/address diff, operand
    /// sub-offset, branch offset too wide for the opcode format.
    Range,
    /// Structure invalidated mid-operation: write before refresh, pool
    /// mutated under an open cursor, layout failed to converge.
    Consistency,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Format => write!(f, "format error"),
            ErrorKind::Range => write!(f, "range error"),
            ErrorKind::Consistency => write!(f, "consistency error"),
        }
    }
}

#[macro_export]
macro_rules! fail {
    ($kind:ident, $msg:literal) => {
        return Err($crate::error::BlockError::new($crate::error::ErrorKind::$kind, $msg))
    };
    ($kind:ident, $fmtstr:literal, $($args:tt)*) => {
        return Err($crate::error::BlockError::new($crate::error::ErrorKind::$kind, &format!($fmtstr, $($args)*)))
    };
}

#[derive(Debug, PartialEq, Eq)]
pub struct BlockError {
    kind: ErrorKind,
    msg: String,
    contexts: Vec<String>,
}

impl BlockError {
    pub fn new(kind: ErrorKind, msg: &str) -> Self {
        BlockError {
            kind,
            msg: msg.to_string(),
            contexts: Vec::new(),
        }
    }

    pub fn format(msg: &str) -> Self {
        BlockError::new(ErrorKind::Format, msg)
    }

    pub fn consistency(msg: &str) -> Self {
        BlockError::new(ErrorKind::Consistency, msg)
    }

    /// Range error carrying the offending value and its valid bounds.
    pub fn range(what: &str, value: i64, min: i64, max: i64) -> Self {
        BlockError::new(
            ErrorKind::Range,
            &format!("{} out of range, should be [{} - {}]: {}", what, min, max, value),
        )
    }

    pub fn with_context(base: BlockError, context: String) -> Self {
        let mut contexts = base.contexts;
        contexts.push(context);
        BlockError {
            kind: base.kind,
            msg: base.msg,
            contexts,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)?;
        let mut connector = " for ";
        for context in &self.contexts {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for BlockError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_chain_display() {
        let e = BlockError::format("bad chunk size");
        let e = BlockError::with_context(e, "string pool".to_string());
        let e = BlockError::with_context(e, "AndroidManifest.xml".to_string());
        assert_eq!(
            e.to_string(),
            "format error: bad chunk size for string pool of AndroidManifest.xml"
        );
    }

    #[test]
    fn range_reports_bounds() {
        let e = BlockError::range("line diff", 300, 0, 245);
        assert_eq!(e.kind(), ErrorKind::Range);
        assert!(e.to_string().contains("[0 - 245]: 300"));
    }
}
