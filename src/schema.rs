//! Declarative message validation.
//!
//! A message shape is a flat list of [`KeyDesc`] entries checked in order
//! against a [`Dict`]. Nested dictionaries are described inline: an entry
//! flagged [`PARSE_CHILDREN`] descends into its value, and the entry flagged
//! [`LAST_CHILD`] climbs back out.
//!
//! ```ignore
//! const SHAPE: &[KeyDesc] = &[
//!     KeyDesc::bytes("k", 32),
//!     KeyDesc::dict("p").parse_children(),
//!     KeyDesc::int("seq"),
//!     KeyDesc::bytes("v", 0).last_child(),
//! ];
//! ```
//!
//! On success the result holds one slot per descriptor, `None` for optional
//! keys that were absent.

use crate::messages::{Dict, Value, ValueKind};

pub const OPTIONAL: u8 = 1;
/// Descend into this entry's dictionary for the following descriptors.
pub const PARSE_CHILDREN: u8 = 2;
/// Last descriptor of the current nested dictionary.
pub const LAST_CHILD: u8 = 4;
/// Byte length must be a multiple of `size` instead of equal to it.
pub const SIZE_DIVISIBLE: u8 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyDesc {
    pub name: &'static str,
    pub kind: ValueKind,
    /// Required byte length for strings; 0 for any.
    pub size: usize,
    pub flags: u8,
}

impl KeyDesc {
    pub const fn new(name: &'static str, kind: ValueKind, size: usize) -> Self {
        Self {
            name,
            kind,
            size,
            flags: 0,
        }
    }

    pub const fn bytes(name: &'static str, size: usize) -> Self {
        Self::new(name, ValueKind::Bytes, size)
    }

    pub const fn int(name: &'static str) -> Self {
        Self::new(name, ValueKind::Int, 0)
    }

    pub const fn list(name: &'static str) -> Self {
        Self::new(name, ValueKind::List, 0)
    }

    pub const fn dict(name: &'static str) -> Self {
        Self::new(name, ValueKind::Dict, 0)
    }

    pub const fn optional(mut self) -> Self {
        self.flags |= OPTIONAL;
        self
    }

    pub const fn parse_children(mut self) -> Self {
        self.flags |= PARSE_CHILDREN;
        self
    }

    pub const fn last_child(mut self) -> Self {
        self.flags |= LAST_CHILD;
        self
    }

    pub const fn size_divisible(mut self) -> Self {
        self.flags |= SIZE_DIVISIBLE;
        self
    }

    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Missing { path: String },
    WrongType { path: String, expected: ValueKind },
    WrongSize { path: String, expected: usize, actual: usize },
    NotDivisible { path: String, divisor: usize, actual: usize },
    /// Well-typed, but outside the range the field allows.
    OutOfRange { path: String },
}

impl ValidationError {
    pub fn path(&self) -> &str {
        match self {
            ValidationError::Missing { path }
            | ValidationError::WrongType { path, .. }
            | ValidationError::WrongSize { path, .. }
            | ValidationError::NotDivisible { path, .. }
            | ValidationError::OutOfRange { path } => path,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Missing { path } => write!(f, "missing '{path}' key"),
            ValidationError::WrongType { path, expected } => {
                write!(f, "invalid value for '{path}': expected {expected}")
            }
            ValidationError::WrongSize {
                path,
                expected,
                actual,
            } => write!(f, "invalid size for '{path}': {actual} (expected {expected})"),
            ValidationError::NotDivisible {
                path,
                divisor,
                actual,
            } => write!(f, "invalid size for '{path}': {actual} (not a multiple of {divisor})"),
            ValidationError::OutOfRange { path } => write!(f, "invalid value for '{path}'"),
        }
    }
}

impl std::error::Error for ValidationError {}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn check_value(desc: &KeyDesc, value: &Value, path: &str) -> Result<(), ValidationError> {
    if value.kind() != desc.kind {
        return Err(ValidationError::WrongType {
            path: path.to_string(),
            expected: desc.kind,
        });
    }
    if let Value::Bytes(bytes) = value
        && desc.size > 0
    {
        if desc.has(SIZE_DIVISIBLE) {
            if bytes.len() % desc.size != 0 {
                return Err(ValidationError::NotDivisible {
                    path: path.to_string(),
                    divisor: desc.size,
                    actual: bytes.len(),
                });
            }
        } else if bytes.len() != desc.size {
            return Err(ValidationError::WrongSize {
                path: path.to_string(),
                expected: desc.size,
                actual: bytes.len(),
            });
        }
    }
    Ok(())
}

/// Check `root` against `desc`. `root_path` prefixes error paths (e.g. `"a"`).
pub fn verify_message<'a>(
    root: &'a Dict,
    root_path: &str,
    desc: &[KeyDesc],
) -> Result<Vec<Option<&'a Value>>, ValidationError> {
    let mut out = Vec::with_capacity(desc.len());
    let mut stack: Vec<(&'a Dict, String)> = vec![(root, root_path.to_string())];
    // Depth of descriptors being skipped because an optional parent was absent.
    let mut skip_depth = 0usize;

    for d in desc {
        if skip_depth > 0 {
            out.push(None);
            if d.has(PARSE_CHILDREN) {
                skip_depth += 1;
            }
            if d.has(LAST_CHILD) {
                skip_depth -= 1;
            }
            continue;
        }

        let Some((dict, prefix)) = stack.last().map(|(dict, prefix)| (*dict, prefix.clone())) else {
            out.push(None);
            continue;
        };
        let path = join(&prefix, d.name);

        match dict.get(d.name) {
            None => {
                if !d.has(OPTIONAL) {
                    return Err(ValidationError::Missing { path });
                }
                out.push(None);
                if d.has(PARSE_CHILDREN) {
                    skip_depth = 1;
                }
            }
            Some(value) => {
                check_value(d, value, &path)?;
                out.push(Some(value));
                if d.has(PARSE_CHILDREN)
                    && let Value::Dict(child) = value
                {
                    stack.push((child, path));
                    continue;
                }
            }
        }

        if d.has(LAST_CHILD) && stack.len() > 1 {
            stack.pop();
        }
    }

    Ok(out)
}
