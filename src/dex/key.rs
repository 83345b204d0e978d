//! Identity keys: pure value objects naming strings, types, prototypes and
//! methods independently of where they sit in any pool. Two references to
//! the same method compare equal through their keys no matter which items
//! encode them.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A plain interned string value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringKey(pub String);

impl fmt::Display for StringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A type descriptor such as `Ljava/lang/String;`, `I` or `[B`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeKey(pub String);

impl TypeKey {
    pub fn descriptor(&self) -> &str {
        &self.0
    }

    pub fn is_array(&self) -> bool {
        self.0.starts_with('[')
    }

    pub fn is_primitive(&self) -> bool {
        self.0.len() == 1
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A method prototype: parameter descriptors and return descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtoKey {
    pub parameters: Vec<String>,
    pub return_type: String,
}

impl fmt::Display for ProtoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for parameter in &self.parameters {
            write!(f, "{}", parameter)?;
        }
        write!(f, "){}", self.return_type)
    }
}

/// The identity of one method: defining type, name, parameter types and
/// (optionally) return type. Canonical text is
/// `LDefining;->name(Params)Return`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodKey {
    defining: TypeKey,
    name: String,
    parameters: Vec<String>,
    return_type: Option<String>,
    #[serde(skip)]
    cached_hash: Cell<u32>,
}

impl MethodKey {
    pub fn new(
        defining: TypeKey,
        name: impl Into<String>,
        parameters: Vec<String>,
        return_type: Option<String>,
    ) -> Self {
        MethodKey {
            defining,
            name: name.into(),
            parameters,
            return_type,
            cached_hash: Cell::new(0),
        }
    }

    pub fn defining(&self) -> &TypeKey {
        &self.defining
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn return_type(&self) -> Option<&str> {
        self.return_type.as_deref()
    }

    /// Name and parameters are always compared; the defining type and the
    /// return type are each optional, so covariant-return overrides can be
    /// matched separately from exact signatures.
    pub fn equals_with(&self, other: &MethodKey, check_defining: bool, check_return: bool) -> bool {
        if self.name != other.name || self.parameters != other.parameters {
            return false;
        }
        if check_defining && self.defining != other.defining {
            return false;
        }
        if check_return && self.return_type != other.return_type {
            return false;
        }
        true
    }

    /// Hash over name and parameters, computed once. Zero marks the unset
    /// cache; a computed zero is bumped so the sentinel stays unambiguous.
    fn name_parameters_hash(&self) -> u32 {
        let cached = self.cached_hash.get();
        if cached != 0 {
            return cached;
        }
        let mut hash: u32 = 0;
        for byte in self.name.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(byte as u32);
        }
        for parameter in &self.parameters {
            for byte in parameter.bytes() {
                hash = hash.wrapping_mul(31).wrapping_add(byte as u32);
            }
        }
        if hash == 0 {
            hash = 1;
        }
        self.cached_hash.set(hash);
        hash
    }

    /// Parse the canonical form. Malformed input is "not a method
    /// reference", never an error.
    pub fn parse(text: &str) -> Option<MethodKey> {
        let (defining, rest) = text.split_once(";->")?;
        if defining.is_empty() {
            return None;
        }
        let defining = TypeKey(format!("{};", defining));
        let open = rest.find('(')?;
        let close = rest.find(')')?;
        if close < open || open == 0 {
            return None;
        }
        let name = &rest[..open];
        let parameters = split_parameters(&rest[open + 1..close])?;
        let return_part = &rest[close + 1..];
        let return_type = if return_part.is_empty() {
            None
        } else if is_type_descriptor(return_part) {
            Some(return_part.to_string())
        } else {
            return None;
        };
        Some(MethodKey::new(defining, name, parameters, return_type))
    }
}

impl PartialEq for MethodKey {
    fn eq(&self, other: &Self) -> bool {
        self.equals_with(other, true, true)
    }
}

impl Eq for MethodKey {}

impl Hash for MethodKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.name_parameters_hash());
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}(", self.defining, self.name)?;
        for parameter in &self.parameters {
            write!(f, "{}", parameter)?;
        }
        write!(f, ")")?;
        if let Some(ret) = &self.return_type {
            write!(f, "{}", ret)?;
        }
        Ok(())
    }
}

/// Split a concatenated parameter descriptor list into individual
/// descriptors; `None` when the text is not a valid list.
fn split_parameters(text: &str) -> Option<Vec<String>> {
    let bytes = text.as_bytes();
    let mut parameters = Vec::new();
    let mut at = 0;
    while at < bytes.len() {
        let start = at;
        while at < bytes.len() && bytes[at] == b'[' {
            at += 1;
        }
        match bytes.get(at)? {
            b'Z' | b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D' => at += 1,
            b'L' => {
                let semi = text[at..].find(';')?;
                at += semi + 1;
            }
            _ => return None,
        }
        parameters.push(text[start..at].to_string());
    }
    Some(parameters)
}

fn is_type_descriptor(text: &str) -> bool {
    match split_parameters(text) {
        Some(list) => list.len() == 1,
        None => text == "V",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn key(text: &str) -> MethodKey {
        MethodKey::parse(text).unwrap()
    }

    fn hash_of(key: &MethodKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn parse_print_round_trip() {
        for text in [
            "Ljava/lang/Object;->hashCode()I",
            "Lcom/example/A;->run()V",
            "Lcom/example/A;->get(I)Ljava/lang/String;",
            "Lcom/example/A;->sum(II[Ljava/lang/String;)J",
            "Lcom/example/A;->partial(I)",
        ] {
            let parsed = key(text);
            assert_eq!(parsed.to_string(), text);
            assert_eq!(MethodKey::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn malformed_input_is_none() {
        assert!(MethodKey::parse("no separator").is_none());
        assert!(MethodKey::parse("Lcom/A;->noParens").is_none());
        assert!(MethodKey::parse(";->m()V").is_none());
        assert!(MethodKey::parse("Lcom/A;->()V").is_none());
        assert!(MethodKey::parse("Lcom/A;->m(Q)V").is_none());
        assert!(MethodKey::parse("Lcom/A;->m(I)X").is_none());
    }

    #[test]
    fn toggleable_equality() {
        let a = key("Lcom/A;->get(I)Ljava/lang/Object;");
        let b = key("Lcom/B;->get(I)Ljava/lang/Object;");
        let c = key("Lcom/A;->get(I)Ljava/lang/String;");

        assert_ne!(a, b);
        assert!(a.equals_with(&b, false, true));
        assert!(!a.equals_with(&c, true, true));
        assert!(a.equals_with(&c, true, false));
        assert!(!a.equals_with(&key("Lcom/A;->get(J)Ljava/lang/Object;"), false, false));
    }

    #[test]
    fn equal_keys_hash_equal() {
        let a = key("Lcom/A;->sum(II)J");
        let b = key("Lcom/A;->sum(II)J");
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        // second call serves the cache
        assert_eq!(hash_of(&a), hash_of(&a));
    }

    #[test]
    fn proto_display() {
        let proto = ProtoKey {
            parameters: vec!["I".into(), "Ljava/lang/String;".into()],
            return_type: "V".into(),
        };
        assert_eq!(proto.to_string(), "(ILjava/lang/String;)V");
    }
}
