//! Micro-operations (P-code): the primitive effects a machine instruction lowers to.

use crate::error::Result;
use crate::insn::Address;
use crate::location::{Location, Space};

use self::Arity::{AtLeast, Exactly};

/// How an operation turns into an expression when its result is reconstructed
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Shape {
    Unary,
    Binary,
    Nary,
}

/// Number of inputs an operation accepts
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    fn admits(self, n: usize) -> bool {
        match self {
            Exactly(k) => n == k,
            AtLeast(k) => n >= k,
        }
    }
}

macro_rules! opcodes {
    ($($variant:ident = $name:literal, $shape:ident, $arity:expr, $symbol:expr;)*) => {
        /// A micro-op mnemonic
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            pub fn from_mnemonic(s: &str) -> Option<Self> {
                match s {
                    $($name => Some(Opcode::$variant),)*
                    _ => None,
                }
            }

            pub fn shape(self) -> Shape {
                match self {
                    $(Opcode::$variant => Shape::$shape,)*
                }
            }

            pub fn arity(self) -> Arity {
                match self {
                    $(Opcode::$variant => $arity,)*
                }
            }

            /// Infix/prefix operator used when rendering, if the operation has one
            pub fn symbol(self) -> Option<&'static str> {
                match self {
                    $(Opcode::$variant => $symbol,)*
                }
            }
        }
    };
}

opcodes! {
    Copy = "COPY", Unary, Exactly(1), None;
    Load = "LOAD", Nary, Exactly(2), None;
    Store = "STORE", Nary, Exactly(3), None;
    Branch = "BRANCH", Nary, Exactly(1), None;
    Cbranch = "CBRANCH", Nary, Exactly(2), None;
    BranchInd = "BRANCHIND", Nary, Exactly(1), None;
    Call = "CALL", Nary, AtLeast(1), None;
    CallInd = "CALLIND", Nary, AtLeast(1), None;
    CallOther = "CALLOTHER", Nary, AtLeast(1), None;
    Return = "RETURN", Nary, AtLeast(1), None;
    IntEqual = "INT_EQUAL", Binary, Exactly(2), Some("==");
    IntNotEqual = "INT_NOTEQUAL", Binary, Exactly(2), Some("!=");
    IntSLess = "INT_SLESS", Binary, Exactly(2), Some("s<");
    IntSLessEqual = "INT_SLESSEQUAL", Binary, Exactly(2), Some("s<=");
    IntLess = "INT_LESS", Binary, Exactly(2), Some("<");
    IntLessEqual = "INT_LESSEQUAL", Binary, Exactly(2), Some("<=");
    IntZext = "INT_ZEXT", Unary, Exactly(1), None;
    IntSext = "INT_SEXT", Unary, Exactly(1), None;
    IntAdd = "INT_ADD", Binary, Exactly(2), Some("+");
    IntSub = "INT_SUB", Binary, Exactly(2), Some("-");
    IntCarry = "INT_CARRY", Binary, Exactly(2), None;
    IntSCarry = "INT_SCARRY", Binary, Exactly(2), None;
    IntSBorrow = "INT_SBORROW", Binary, Exactly(2), None;
    Int2Comp = "INT_2COMP", Unary, Exactly(1), Some("-");
    IntNegate = "INT_NEGATE", Unary, Exactly(1), Some("~");
    IntXor = "INT_XOR", Binary, Exactly(2), Some("^");
    IntAnd = "INT_AND", Binary, Exactly(2), Some("&");
    IntOr = "INT_OR", Binary, Exactly(2), Some("|");
    IntLeft = "INT_LEFT", Binary, Exactly(2), Some("<<");
    IntRight = "INT_RIGHT", Binary, Exactly(2), Some(">>");
    IntSRight = "INT_SRIGHT", Binary, Exactly(2), Some("s>>");
    IntMult = "INT_MULT", Binary, Exactly(2), Some("*");
    IntDiv = "INT_DIV", Binary, Exactly(2), Some("/");
    IntSDiv = "INT_SDIV", Binary, Exactly(2), Some("s/");
    IntRem = "INT_REM", Binary, Exactly(2), Some("%");
    IntSRem = "INT_SREM", Binary, Exactly(2), Some("s%");
    BoolNegate = "BOOL_NEGATE", Unary, Exactly(1), Some("!");
    BoolXor = "BOOL_XOR", Binary, Exactly(2), Some("^^");
    BoolAnd = "BOOL_AND", Binary, Exactly(2), Some("&&");
    BoolOr = "BOOL_OR", Binary, Exactly(2), Some("||");
    FloatEqual = "FLOAT_EQUAL", Binary, Exactly(2), Some("f==");
    FloatNotEqual = "FLOAT_NOTEQUAL", Binary, Exactly(2), Some("f!=");
    FloatLess = "FLOAT_LESS", Binary, Exactly(2), Some("f<");
    FloatLessEqual = "FLOAT_LESSEQUAL", Binary, Exactly(2), Some("f<=");
    FloatNan = "FLOAT_NAN", Unary, Exactly(1), None;
    FloatAdd = "FLOAT_ADD", Binary, Exactly(2), Some("f+");
    FloatDiv = "FLOAT_DIV", Binary, Exactly(2), Some("f/");
    FloatMult = "FLOAT_MULT", Binary, Exactly(2), Some("f*");
    FloatSub = "FLOAT_SUB", Binary, Exactly(2), Some("f-");
    FloatNeg = "FLOAT_NEG", Unary, Exactly(1), Some("f-");
    FloatAbs = "FLOAT_ABS", Unary, Exactly(1), None;
    FloatSqrt = "FLOAT_SQRT", Unary, Exactly(1), None;
    Int2Float = "INT2FLOAT", Unary, Exactly(1), None;
    Float2Float = "FLOAT2FLOAT", Unary, Exactly(1), None;
    Trunc = "TRUNC", Unary, Exactly(1), None;
    Ceil = "CEIL", Unary, Exactly(1), None;
    Floor = "FLOOR", Unary, Exactly(1), None;
    Round = "ROUND", Unary, Exactly(1), None;
    MultiEqual = "MULTIEQUAL", Nary, AtLeast(1), None;
    Indirect = "INDIRECT", Binary, Exactly(2), None;
    Piece = "PIECE", Binary, Exactly(2), None;
    SubPiece = "SUBPIECE", Binary, Exactly(2), None;
    Cast = "CAST", Unary, Exactly(1), None;
    PtrAdd = "PTRADD", Nary, Exactly(3), None;
    PtrSub = "PTRSUB", Binary, Exactly(2), None;
    SegmentOp = "SEGMENTOP", Nary, AtLeast(2), None;
    CPoolRef = "CPOOLREF", Nary, AtLeast(2), None;
    New = "NEW", Nary, AtLeast(1), None;
    Insert = "INSERT", Nary, Exactly(4), None;
    Extract = "EXTRACT", Nary, Exactly(3), None;
    PopCount = "POPCOUNT", Unary, Exactly(1), None;
    LzCount = "LZCOUNT", Unary, Exactly(1), None;
}

impl Opcode {
    /// Operations whose two inputs may be swapped without changing the result
    pub fn is_commutative(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            IntAdd
                | IntMult
                | IntAnd
                | IntOr
                | IntXor
                | IntEqual
                | IntNotEqual
                | IntCarry
                | IntSCarry
                | BoolAnd
                | BoolOr
                | BoolXor
                | FloatAdd
                | FloatMult
                | FloatEqual
                | FloatNotEqual
        )
    }

    pub fn branches(self) -> bool {
        matches!(self, Opcode::Branch | Opcode::Cbranch | Opcode::BranchInd)
    }

    pub fn returns(self) -> bool {
        self == Opcode::Return
    }

    pub fn is_call(self) -> bool {
        matches!(self, Opcode::Call | Opcode::CallInd | Opcode::CallOther)
    }

    /// Operations that must be kept even if nothing reads their result
    pub fn has_side_effects(self) -> bool {
        self == Opcode::Store || self.branches() || self.returns() || self.is_call()
    }

    /// Operations that can never produce a result
    fn never_writes(self) -> bool {
        self == Opcode::Store || self.branches() || self.returns()
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// A single micro-operation over raw (pre-SSA) locations
#[derive(Clone, PartialEq, Eq)]
pub struct PcodeOp {
    pub addr: Address,
    pub opcode: Opcode,
    pub inputs: Vec<Location>,
    pub output: Option<Location>,
}

impl PcodeOp {
    /// Construct a validated, canonicalized operation.
    pub fn new(
        addr: Address,
        opcode: Opcode,
        inputs: Vec<Location>,
        output: Option<Location>,
    ) -> Result<Self> {
        let mut op = Self {
            addr,
            opcode,
            inputs,
            output,
        };
        op.try_confirm_valid()?;
        op.canonicalize();
        Ok(op)
    }

    /// A phi for `loc` with one slot per predecessor. Every slot initially names the raw location
    /// itself; renaming replaces each with the version live at the end of that predecessor.
    pub fn phi(addr: Address, loc: Location, num_predecessors: usize) -> Self {
        Self {
            addr,
            opcode: Opcode::MultiEqual,
            inputs: vec![loc; num_predecessors],
            output: Some(loc),
        }
    }

    /// Confirms that the operation's operand count and output agree with its mnemonic.
    pub fn try_confirm_valid(&self) -> Result<()> {
        if !self.opcode.arity().admits(self.inputs.len()) {
            return Err(malformed_error!(
                "Got {} inputs for {} at {}. Expected {:?}.",
                self.inputs.len(),
                self.opcode,
                self.addr,
                self.opcode.arity()
            ));
        }
        match (&self.output, self.opcode.never_writes()) {
            (Some(o), true) => Err(malformed_error!(
                "{} at {} cannot write to {:?}",
                self.opcode,
                self.addr,
                o
            )),
            (None, false) if !self.opcode.is_call() => Err(malformed_error!(
                "{} at {} is missing its output",
                self.opcode,
                self.addr
            )),
            (Some(o), false) if o.is_const() => Err(malformed_error!(
                "{} at {} writes to a constant",
                self.opcode,
                self.addr
            )),
            _ => Ok(()),
        }
    }

    /// Move a constant out of the first slot of a commutative operation.
    fn canonicalize(&mut self) {
        if self.opcode.is_commutative()
            && self.inputs.len() == 2
            && self.inputs[0].sorts_after(&self.inputs[1])
        {
            self.inputs.swap(0, 1);
        }
    }

    pub fn branches(&self) -> bool {
        self.opcode.branches()
    }

    pub fn returns(&self) -> bool {
        self.opcode.returns()
    }

    pub fn is_conditional(&self) -> bool {
        self.opcode == Opcode::Cbranch
    }

    pub fn is_indirect(&self) -> bool {
        self.opcode == Opcode::BranchInd
    }

    pub fn is_phi(&self) -> bool {
        self.opcode == Opcode::MultiEqual
    }

    /// Ends a basic block
    pub fn terminates(&self) -> bool {
        self.branches() || self.returns()
    }

    /// Statically known destination of a direct branch. Only `ram` destinations are resolved;
    /// `const` destinations are relative to the current machine instruction and are not modelled.
    pub fn target(&self) -> Option<u64> {
        match self.opcode {
            Opcode::Branch | Opcode::Cbranch => {
                let dest = self.inputs.first()?;
                if dest.space == Space::Ram {
                    Some(dest.offset)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for PcodeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: ", self.addr)?;
        if let Some(o) = &self.output {
            write!(f, "{:?} = ", o)?;
        }
        write!(f, "{}", self.opcode)?;
        for i in &self.inputs {
            write!(f, " {:?}", i)?;
        }
        Ok(())
    }
}
