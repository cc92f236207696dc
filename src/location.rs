//! Storage locations: the raw `(space, offset, size)` triple that micro-ops read and write.

use crate::error::Result;

/// The address space a [`Location`] lives in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Space {
    /// Architectural registers, addressed by their offset in the register file
    Register,
    /// Memory (stack, heap, globals)
    Ram,
    /// Instruction-local temporaries
    Unique,
    /// Literal values; the offset holds the value itself
    Const,
}

impl Space {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "register" => Ok(Space::Register),
            "ram" => Ok(Space::Ram),
            "unique" => Ok(Space::Unique),
            "const" => Ok(Space::Const),
            _ => Err(malformed_error!("Unknown address space {:?}", name)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Space::Register => "register",
            Space::Ram => "ram",
            Space::Unique => "unique",
            Space::Const => "const",
        }
    }
}

/// A storage location. Two locations are the same location iff all of space, offset and size
/// agree; overlapping registers of different widths are distinct locations.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub space: Space,
    pub offset: u64,
    pub size: u32,
}

impl Location {
    pub fn new(space: Space, offset: u64, size: u32) -> Self {
        Self {
            space,
            offset,
            size,
        }
    }

    pub fn register(offset: u64, size: u32) -> Self {
        Self::new(Space::Register, offset, size)
    }

    pub fn ram(offset: u64, size: u32) -> Self {
        Self::new(Space::Ram, offset, size)
    }

    pub fn unique(offset: u64, size: u32) -> Self {
        Self::new(Space::Unique, offset, size)
    }

    pub fn constant(value: u64, size: u32) -> Self {
        Self::new(Space::Const, value, size)
    }

    pub fn is_const(&self) -> bool {
        self.space == Space::Const
    }

    pub fn is_unique(&self) -> bool {
        self.space == Space::Unique
    }

    pub fn is_ram(&self) -> bool {
        self.space == Space::Ram
    }

    /// The literal held by a constant location
    pub fn const_value(&self) -> Option<u64> {
        if self.is_const() {
            Some(self.offset)
        } else {
            None
        }
    }

    /// Whether `self` should be placed after `other` when reordering a commutative operation.
    /// Only constants sort last; everything else keeps its original order.
    pub fn sorts_after(&self, other: &Location) -> bool {
        self.is_const() && !other.is_const()
    }
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.space {
            Space::Const => write!(f, "{:#x}:{}", self.offset, self.size),
            Space::Unique => write!(f, "U{:x}:{}", self.offset, self.size),
            _ => write!(
                f,
                "[{}]{:#x}:{}",
                self.space.name(),
                self.offset,
                self.size
            ),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Parse a hexadecimal number, with or without a `0x` prefix.
pub fn parse_hex(s: &str) -> Result<u64> {
    let t = s.trim();
    let t = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);
    u64::from_str_radix(t, 16).map_err(|e| malformed_error!("Bad hex number {:?}: {}", s, e))
}
