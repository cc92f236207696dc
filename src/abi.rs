//! Calling-convention descriptions.
//!
//! The decompiler only needs a coarse view of the calling convention: which locations a call may
//! overwrite, which locations a return hands back to the caller, and what to call registers when
//! printing. These sets are data, supplied to a [`crate::session::Decompilation`], rather than
//! anything the pipeline hard-codes.

use crate::location::Location;

#[derive(Clone, Debug)]
pub struct Abi {
    pub name: &'static str,
    /// Argument locations, in argument order
    pub input_locations: Vec<Location>,
    /// Return-value locations
    pub output_locations: Vec<Location>,
    /// Locations a call may overwrite (caller-saved). Each call defines a fresh version of each.
    pub killed_locations: Vec<Location>,
    /// Locations a return is considered to read
    pub observed_locations: Vec<Location>,
    /// The program counter, whose writes are implied by control flow and never merged by phis
    pub program_counter: Option<Location>,
    pub register_names: Vec<(Location, &'static str)>,
}

/// Offsets of the x86-64 registers in the register space
mod x86_64 {
    pub const RAX: u64 = 0x0;
    pub const RCX: u64 = 0x8;
    pub const RDX: u64 = 0x10;
    pub const RBX: u64 = 0x18;
    pub const RSP: u64 = 0x20;
    pub const RBP: u64 = 0x28;
    pub const RSI: u64 = 0x30;
    pub const RDI: u64 = 0x38;
    pub const R8: u64 = 0x80;
    pub const R9: u64 = 0x88;
    pub const R10: u64 = 0x90;
    pub const R11: u64 = 0x98;
    pub const R12: u64 = 0xa0;
    pub const R13: u64 = 0xa8;
    pub const R14: u64 = 0xb0;
    pub const R15: u64 = 0xb8;
    pub const RIP: u64 = 0x288;
}

impl Abi {
    /// System V x86-64, as laid out in Ghidra's register space
    pub fn x86_64() -> Self {
        use x86_64::*;
        let r = |o| Location::register(o, 8);
        let names64 = [
            (RAX, "RAX"),
            (RCX, "RCX"),
            (RDX, "RDX"),
            (RBX, "RBX"),
            (RSP, "RSP"),
            (RBP, "RBP"),
            (RSI, "RSI"),
            (RDI, "RDI"),
            (R8, "R8"),
            (R9, "R9"),
            (R10, "R10"),
            (R11, "R11"),
            (R12, "R12"),
            (R13, "R13"),
            (R14, "R14"),
            (R15, "R15"),
            (RIP, "RIP"),
        ];
        let names32 = [
            (RAX, "EAX"),
            (RCX, "ECX"),
            (RDX, "EDX"),
            (RBX, "EBX"),
            (RSP, "ESP"),
            (RBP, "EBP"),
            (RSI, "ESI"),
            (RDI, "EDI"),
        ];
        Self {
            name: "x86-64",
            input_locations: [RDI, RSI, RDX, RCX, R8, R9].into_iter().map(r).collect(),
            output_locations: vec![r(RAX)],
            killed_locations: [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11]
                .into_iter()
                .map(r)
                .collect(),
            observed_locations: vec![r(RAX)],
            program_counter: Some(r(RIP)),
            register_names: names64
                .iter()
                .map(|&(o, n)| (r(o), n))
                .chain(names32.iter().map(|&(o, n)| (Location::register(o, 4), n)))
                .collect(),
        }
    }

    /// No calling-convention knowledge: calls kill nothing, returns observe nothing
    pub fn none() -> Self {
        Self {
            name: "none",
            input_locations: vec![],
            output_locations: vec![],
            killed_locations: vec![],
            observed_locations: vec![],
            program_counter: None,
            register_names: vec![],
        }
    }

    pub fn is_program_counter(&self, loc: &Location) -> bool {
        self.program_counter.as_ref() == Some(loc)
    }

    pub fn register_name(&self, loc: &Location) -> Option<&'static str> {
        self.register_names
            .iter()
            .find(|(l, _)| l == loc)
            .map(|&(_, n)| n)
    }

    /// The `idx`th argument location, if it is passed in a register
    pub fn input_location(&self, idx: usize) -> Option<&Location> {
        self.input_locations.get(idx)
    }

    pub fn output_location(&self, idx: usize) -> Option<&Location> {
        self.output_locations.get(idx)
    }
}

impl Default for Abi {
    fn default() -> Self {
        Self::x86_64()
    }
}
