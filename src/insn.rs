//! Machine instructions, as sequences of micro-ops sharing one machine address.

use crate::error::Result;
use crate::pcode::PcodeOp;

/// A position in the function. `offset` is the machine address; `seq` is the index of a micro-op
/// within the machine instruction at that address, which makes every micro-op (and every part of
/// a machine instruction that was split at an inner branch) individually addressable while keeping
/// a total order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address {
    pub offset: u64,
    pub seq: u32,
}

impl Address {
    pub fn new(offset: u64, seq: u32) -> Self {
        Self { offset, seq }
    }

    /// The start of the machine instruction at `offset`
    pub fn machine(offset: u64) -> Self {
        Self { offset, seq: 0 }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}.{:02}", self.offset, self.seq)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// A run of micro-ops with at most one control transfer, which (if present) is the last op.
///
/// A machine instruction whose micro-ops branch or return part-way through is represented as
/// several `Instruction`s, see [`Instruction::split_machine_instruction`].
#[derive(Clone, PartialEq, Eq)]
pub struct Instruction {
    pub addr: Address,
    /// Byte length of the machine instruction this belongs to
    pub length: u64,
    pub ops: Vec<PcodeOp>,
    /// The address immediately following this instruction
    pub next: Address,
}

impl Instruction {
    /// Split the micro-ops of one machine instruction after every branch or return. `ops` must
    /// already carry their `(offset, seq)` addresses. An instruction running past the end of the
    /// address space is malformed.
    pub fn split_machine_instruction(
        offset: u64,
        length: u64,
        ops: Vec<PcodeOp>,
    ) -> Result<Vec<Self>> {
        let after = offset.checked_add(length).ok_or_else(|| {
            malformed_error!(
                "Instruction at {:#x} of length {:#x} overflows the address space",
                offset,
                length
            )
        })?;
        let after = Address::machine(after);
        let mut parts: Vec<Vec<PcodeOp>> = vec![];
        let mut curr = vec![];
        for op in ops {
            let terminates = op.terminates();
            curr.push(op);
            if terminates {
                parts.push(std::mem::take(&mut curr));
            }
        }
        if !curr.is_empty() || parts.is_empty() {
            parts.push(curr);
        }

        let starts: Vec<Address> = parts
            .iter()
            .map(|p| p.first().map(|op| op.addr).unwrap_or(Address::machine(offset)))
            .collect();
        Ok(parts
            .into_iter()
            .enumerate()
            .map(|(i, ops)| Instruction {
                addr: starts[i],
                length,
                ops,
                next: starts.get(i + 1).copied().unwrap_or(after),
            })
            .collect())
    }

    fn last(&self) -> Option<&PcodeOp> {
        self.ops.last()
    }

    pub fn branches(&self) -> bool {
        self.last().map_or(false, |op| op.branches())
    }

    pub fn returns(&self) -> bool {
        self.last().map_or(false, |op| op.returns())
    }

    pub fn is_conditional(&self) -> bool {
        self.last().map_or(false, |op| op.is_conditional())
    }

    pub fn is_indirect(&self) -> bool {
        self.last().map_or(false, |op| op.is_indirect())
    }

    pub fn terminates(&self) -> bool {
        self.branches() || self.returns()
    }

    /// Statically known branch destination
    pub fn target(&self) -> Option<Address> {
        self.last().and_then(|op| op.target()).map(Address::machine)
    }

    /// Where execution continues when this instruction does not transfer control elsewhere.
    /// Returns and unconditional branches have no fallthrough.
    pub fn fallthrough(&self) -> Option<Address> {
        if self.returns() || (self.branches() && !self.is_conditional()) {
            None
        } else {
            Some(self.next)
        }
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} (len {}):", self.addr, self.length)?;
        for op in &self.ops {
            writeln!(f, "  {:?}", op)?;
        }
        Ok(())
    }
}
