//! A lifter from a JSON micro-op listing.
//!
//! The listing is a list of machine-instruction records as exported by the disassembly host:
//!
//! ```json
//! [{ "address": "0x401000", "length": 4,
//!    "pcode": [{ "address": 4198400.0, "mnemonic": "INT_ADD",
//!                "inputs": [{ "space": "register", "offset": "0x38", "size": 8 },
//!                           { "space": "const", "offset": "0x5", "size": "0x8" }],
//!                "output": { "space": "register", "offset": "0x0", "size": 8 } }] }]
//! ```
//!
//! `addr` is accepted in place of `address`. Offsets are hex strings; sizes and lengths may be
//! integers or hex strings. The per-micro-op `address` is an optional fractional position inside
//! the instruction; it only has to be non-decreasing, and micro-ops are otherwise numbered by
//! their position.

use itertools::Itertools;
use serde::Deserialize;

use crate::error::Result;
use crate::insn::{Address, Instruction};
use crate::location::{parse_hex, Location, Space};
use crate::log::*;
use crate::pcode::{Opcode, PcodeOp};

/// An integer given either as a JSON number or as a hex string
#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum HexOrInt {
    Int(u64),
    Hex(String),
}

impl HexOrInt {
    pub fn value(&self) -> Result<u64> {
        match self {
            HexOrInt::Int(i) => Ok(*i),
            HexOrInt::Hex(s) => parse_hex(s),
        }
    }
}

/// Position of a micro-op inside its instruction
#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum SubAddress {
    Number(f64),
    Text(String),
}

impl SubAddress {
    fn value(&self) -> Result<f64> {
        match self {
            SubAddress::Number(n) => Ok(*n),
            SubAddress::Text(s) => match s.trim().parse::<f64>() {
                Ok(n) => Ok(n),
                Err(_) => parse_hex(s).map(|v| v as f64),
            },
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct RawVarnode {
    pub space: String,
    pub offset: HexOrInt,
    pub size: HexOrInt,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RawPcodeOp {
    #[serde(alias = "addr", default)]
    pub address: Option<SubAddress>,
    pub mnemonic: String,
    #[serde(default)]
    pub inputs: Vec<RawVarnode>,
    #[serde(default)]
    pub output: Option<RawVarnode>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RawInstruction {
    #[serde(alias = "addr")]
    pub address: HexOrInt,
    pub length: HexOrInt,
    #[serde(default)]
    pub pcode: Vec<RawPcodeOp>,
}

impl RawVarnode {
    fn lift(&self) -> Result<Location> {
        let size = self.size.value()?;
        let size = u32::try_from(size)
            .map_err(|_| malformed_error!("Location size {:#x} is out of range", size))?;
        Ok(Location::new(
            Space::parse(&self.space)?,
            self.offset.value()?,
            size,
        ))
    }
}

impl RawInstruction {
    /// Lift one machine instruction into one or more [`Instruction`]s.
    fn lift(&self) -> Result<Vec<Instruction>> {
        let offset = self.address.value()?;
        let length = self.length.value()?;

        let positions: Vec<f64> = self
            .pcode
            .iter()
            .filter_map(|op| op.address.as_ref())
            .map(|a| a.value())
            .collect::<Result<_>>()?;
        if let Some((a, b)) = positions.iter().tuple_windows().find(|(a, b)| b < a) {
            return Err(malformed_error!(
                "Micro-op positions go backwards at {:#x}: {} then {}",
                offset,
                a,
                b
            ));
        }

        let ops = self
            .pcode
            .iter()
            .enumerate()
            .map(|(seq, raw)| {
                let opcode = Opcode::from_mnemonic(&raw.mnemonic).ok_or_else(|| {
                    malformed_error!("Unknown mnemonic {:?} at {:#x}", raw.mnemonic, offset)
                })?;
                let seq = u32::try_from(seq)
                    .map_err(|_| malformed_error!("Too many micro-ops at {:#x}", offset))?;
                let inputs = raw.inputs.iter().map(|v| v.lift()).collect::<Result<_>>()?;
                let output = raw.output.as_ref().map(|v| v.lift()).transpose()?;
                PcodeOp::new(Address::new(offset, seq), opcode, inputs, output)
            })
            .collect::<Result<Vec<_>>>()?;

        Instruction::split_machine_instruction(offset, length, ops)
    }
}

/// Lift machine-instruction records into instructions sorted by address. Two records at the same
/// address are malformed input.
pub fn lift_records(records: &[RawInstruction]) -> Result<Vec<Instruction>> {
    let mut insns: Vec<Instruction> = records
        .iter()
        .map(|r| r.lift())
        .collect::<Result<Vec<_>>>()?
        .concat();
    insns.sort_by_key(|i| i.addr);
    if let Some((a, _)) = insns.iter().tuple_windows().find(|(a, b)| a.addr == b.addr) {
        return Err(malformed_error!("Duplicate instruction at {}", a.addr));
    }
    info!("Lifted listing";
          "machine_instructions" => records.len(),
          "instructions" => insns.len(),
          "micro_ops" => insns.iter().map(|i| i.ops.len()).sum::<usize>());
    Ok(insns)
}

/// Lift a JSON listing.
pub fn lift_from_json(json: &str) -> Result<Vec<Instruction>> {
    // Well-formed JSON of the wrong shape is a malformed listing, not a JSON error
    let records: Vec<RawInstruction> = serde_json::from_str(json).map_err(|e| {
        if e.is_data() {
            malformed_error!("Listing does not have the expected shape: {}", e)
        } else {
            e.into()
        }
    })?;
    lift_records(&records)
}
