//! Bytecode instruction set and its bit-exact 32-bit encoding.
//!
//! ```text
//!  31        23 22        14 13      6 5      0
//! +------------+------------+---------+--------+
//! |     B      |     C      |    A    | opcode |   iABC
//! +------------+------------+---------+--------+
//! |           Bx            |    A    | opcode |   iABx / iAsBx
//! +-------------------------+---------+--------+
//! ```
//!
//! B and C are 9 bits wide. When an instruction accepts an "RK" operand,
//! a value with bit 8 set names literal `x & 0xFF` instead of register `x`.
//! sBx is stored biased by `MAX_SBX`.

use crate::{Error, MAX_BX, MAX_RK_CONSTANT};
use std::fmt;

const SIZE_OP: u32 = 6;
const SIZE_A: u32 = 8;
const SIZE_B: u32 = 9;
const SIZE_C: u32 = 9;

const POS_A: u32 = SIZE_OP;
const POS_C: u32 = POS_A + SIZE_A;
const POS_B: u32 = POS_C + SIZE_C;
const POS_BX: u32 = POS_C;

const MASK_OP: u32 = (1 << SIZE_OP) - 1;
const MASK_A: u32 = (1 << SIZE_A) - 1;
const MASK_B: u32 = (1 << SIZE_B) - 1;
const MASK_C: u32 = (1 << SIZE_C) - 1;

/// Largest value of a B or C operand
pub const MAX_BC: u16 = (1 << SIZE_B) - 1;

/// Bias of the signed sBx operand
pub const MAX_SBX: i32 = (MAX_BX >> 1) as i32;

/// Marks an RK operand as a literal-pool index
pub const RK_CONSTANT: u16 = 1 << (SIZE_B - 1);

/// Addressing mode of an opcode, used for decoding and disassembly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    A,
    AB,
    ABC,
    ABx,
    AsBx,
}

macro_rules! opcodes {
    ($( $(#[$doc:meta])* $name:ident = $mnemonic:literal, $mode:ident; )+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum OpCode {
            $( $(#[$doc])* $name, )+
        }

        impl OpCode {
            const ALL: &'static [OpCode] = &[ $( OpCode::$name, )+ ];

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( OpCode::$name => $mnemonic, )+
                }
            }

            pub fn mode(self) -> OpMode {
                match self {
                    $( OpCode::$name => OpMode::$mode, )+
                }
            }

            pub fn from_u8(byte: u8) -> Option<OpCode> {
                Self::ALL.get(usize::from(byte)).copied()
            }
        }
    };
}

opcodes! {
    /// R(A) := R(B)
    Move = "MOVE", AB;
    /// R(A) := K(Bx)
    LoadK = "LOADK", ABx;
    /// R(A) := (B != 0); if C != 0 then pc++
    LoadBool = "LOADBOOL", ABC;
    /// R(A) ..= R(B) := nil
    LoadNil = "LOADNIL", AB;
    /// R(A) := upvalue described by variable B
    GetUpval = "GETUPVAL", AB;
    /// upvalue described by variable B := R(A)
    SetUpval = "SETUPVAL", AB;
    /// R(A) := global named by K(Bx)
    GetGlobal = "GETGLOBAL", ABx;
    /// global named by K(Bx) := R(A)
    SetGlobal = "SETGLOBAL", ABx;
    /// R(A) := RK(B) + RK(C)
    Add = "ADD", ABC;
    Sub = "SUB", ABC;
    Mul = "MUL", ABC;
    Div = "DIV", ABC;
    /// R(A) := RK(B) modulo RK(C), sign of the divisor
    Mod = "MOD", ABC;
    /// R(A) := RK(B) remainder RK(C), sign of the dividend
    Rem = "REM", ABC;
    /// R(A) := -R(B)
    Unm = "UNM", AB;
    /// R(A) := not R(B)
    Not = "NOT", AB;
    /// if (RK(B) eqv RK(C)) != A then pc++
    Eq = "EQ", ABC;
    /// if (RK(B) = RK(C)) != A then pc++, comparing as numbers
    NumEq = "EQNUM", ABC;
    /// if (RK(B) < RK(C)) != A then pc++
    Lt = "LT", ABC;
    /// if (RK(B) <= RK(C)) != A then pc++
    Le = "LE", ABC;
    /// if truthy(R(A)) != C then pc++
    Test = "TEST", ABC;
    /// if truthy(R(B)) == C then R(A) := R(B) else pc++
    TestSet = "TESTSET", ABC;
    /// pc += sBx
    Jmp = "JMP", AsBx;
    /// R(A) := R(A)(R(A+1), ..., R(A+B-1)); C - 1 results are kept
    Call = "CALL", ABC;
    /// return R(A) when B == 2, nothing when B == 1
    Return = "RETURN", AB;
    /// R(A) := closure over template K(Bx) and the current frame
    Closure = "CLOSURE", ABx;
    /// R(A) := (RK(B) . RK(C))
    Cons = "CONS", ABC;
    /// R(A) := car of R(B)
    Car = "CAR", AB;
    /// R(A) := cdr of R(B)
    Cdr = "CDR", AB;
}

/// One encoded instruction word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction(u32);

fn check_bc(op: OpCode, operand: u16) -> Result<u32, Error> {
    if operand > MAX_BC {
        return Err(Error::Compile(format!(
            "operand {operand} of {} exceeds {MAX_BC}",
            op.mnemonic()
        )));
    }
    Ok(u32::from(operand))
}

impl Instruction {
    pub fn abc(op: OpCode, a: u8, b: u16, c: u16) -> Result<Self, Error> {
        let b = check_bc(op, b)?;
        let c = check_bc(op, c)?;
        Ok(Instruction(
            op as u32 | u32::from(a) << POS_A | c << POS_C | b << POS_B,
        ))
    }

    pub fn ab(op: OpCode, a: u8, b: u16) -> Result<Self, Error> {
        Self::abc(op, a, b, 0)
    }

    pub fn abx(op: OpCode, a: u8, bx: u32) -> Result<Self, Error> {
        if bx as usize > MAX_BX {
            return Err(Error::Compile(format!(
                "literal index {bx} of {} exceeds {MAX_BX}",
                op.mnemonic()
            )));
        }
        Ok(Instruction(op as u32 | u32::from(a) << POS_A | bx << POS_BX))
    }

    pub fn asbx(op: OpCode, a: u8, sbx: i32) -> Result<Self, Error> {
        let biased = sbx
            .checked_add(MAX_SBX)
            .and_then(|b| u32::try_from(b).ok())
            .filter(|&b| b as usize <= MAX_BX)
            .ok_or_else(|| Error::Compile(format!("jump displacement {sbx} out of range")))?;
        Self::abx(op, a, biased)
    }

    /// Decode the opcode; a word that names no opcode is a corrupted template
    pub fn opcode(self) -> OpCode {
        let byte = (self.0 & MASK_OP) as u8;
        OpCode::from_u8(byte)
            .unwrap_or_else(|| panic!("invalid opcode {byte} in instruction {:#010x}", self.0))
    }

    pub fn a(self) -> u8 {
        ((self.0 >> POS_A) & MASK_A) as u8
    }

    pub fn b(self) -> u16 {
        ((self.0 >> POS_B) & MASK_B) as u16
    }

    pub fn c(self) -> u16 {
        ((self.0 >> POS_C) & MASK_C) as u16
    }

    pub fn bx(self) -> u32 {
        self.0 >> POS_BX
    }

    pub fn sbx(self) -> i32 {
        self.bx() as i32 - MAX_SBX
    }

    /// Replace the jump displacement of a `JMP`, keeping its other fields
    pub fn with_sbx(self, sbx: i32) -> Result<Self, Error> {
        Self::asbx(self.opcode(), self.a(), sbx)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(word: u32) -> Self {
        Instruction(word)
    }
}

/// Encode literal `index` as an RK operand, if it fits
pub fn rk_constant(index: usize) -> Option<u16> {
    (index <= MAX_RK_CONSTANT).then(|| RK_CONSTANT | index as u16)
}

pub fn is_constant(operand: u16) -> bool {
    operand & RK_CONSTANT != 0
}

pub fn constant_index(operand: u16) -> usize {
    usize::from(operand & !RK_CONSTANT)
}

fn write_rk(f: &mut fmt::Formatter<'_>, operand: u16) -> fmt::Result {
    if is_constant(operand) {
        write!(f, "K{}", constant_index(operand))
    } else {
        write!(f, "R{operand}")
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        write!(f, "{:<10}", op.mnemonic())?;
        match op {
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Rem
            | OpCode::Cons => {
                write!(f, "R{} ", self.a())?;
                write_rk(f, self.b())?;
                write!(f, " ")?;
                write_rk(f, self.c())
            }
            OpCode::Eq | OpCode::NumEq | OpCode::Lt | OpCode::Le => {
                write!(f, "{} ", self.a())?;
                write_rk(f, self.b())?;
                write!(f, " ")?;
                write_rk(f, self.c())
            }
            OpCode::LoadK | OpCode::Closure => write!(f, "R{} K{}", self.a(), self.bx()),
            OpCode::GetGlobal | OpCode::SetGlobal => write!(f, "R{} K{}", self.a(), self.bx()),
            OpCode::GetUpval | OpCode::SetUpval => write!(f, "R{} V{}", self.a(), self.b()),
            OpCode::Test => write!(f, "R{} {}", self.a(), self.c()),
            OpCode::Return => write!(f, "R{} {}", self.a(), self.b()),
            OpCode::Jmp => write!(f, "{:+}", self.sbx()),
            _ => match op.mode() {
                OpMode::A => write!(f, "R{}", self.a()),
                OpMode::AB => write!(f, "R{} R{}", self.a(), self.b()),
                OpMode::ABC => write!(f, "R{} {} {}", self.a(), self.b(), self.c()),
                OpMode::ABx => write!(f, "R{} {}", self.a(), self.bx()),
                OpMode::AsBx => write!(f, "R{} {:+}", self.a(), self.sbx()),
            },
        }
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instruction({self})")
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    #[test]
    fn test_field_layout_is_bit_exact() {
        let instruction = Instruction::abc(OpCode::Add, 3, 0x101, 7).unwrap();
        let word = instruction.raw();
        assert_eq!(word & 0x3F, OpCode::Add as u32);
        assert_eq!((word >> 6) & 0xFF, 3);
        assert_eq!((word >> 14) & 0x1FF, 7);
        assert_eq!(word >> 23, 0x101);

        let instruction = Instruction::abx(OpCode::LoadK, 255, MAX_BX as u32).unwrap();
        assert_eq!(instruction.raw() >> 14, MAX_BX as u32);
        assert_eq!(instruction.a(), 255);
    }

    #[test]
    fn test_operand_decoding() {
        // (instruction, a, b, c)
        let cases = vec![
            (Instruction::abc(OpCode::Call, 4, 3, 2).unwrap(), 4, 3, 2),
            (Instruction::ab(OpCode::Move, 0, 511).unwrap(), 0, 511, 0),
            (Instruction::abc(OpCode::LoadBool, 9, 1, 1).unwrap(), 9, 1, 1),
        ];
        for (i, (instruction, a, b, c)) in cases.into_iter().enumerate() {
            assert_eq!(instruction.a(), a, "#{}", i + 1);
            assert_eq!(instruction.b(), b, "#{}", i + 1);
            assert_eq!(instruction.c(), c, "#{}", i + 1);
        }
    }

    #[test]
    fn test_signed_jump_displacement() {
        for sbx in [0, 1, -1, 1000, -1000, MAX_SBX, -MAX_SBX] {
            let jump = Instruction::asbx(OpCode::Jmp, 0, sbx).unwrap();
            assert_eq!(jump.sbx(), sbx);
            assert_eq!(jump.opcode(), OpCode::Jmp);
        }
        let patched = Instruction::asbx(OpCode::Jmp, 0, 0)
            .unwrap()
            .with_sbx(-5)
            .unwrap();
        assert_eq!(patched.sbx(), -5);
    }

    #[test]
    fn test_operand_overflow_is_an_error() {
        assert!(matches!(
            Instruction::abc(OpCode::Add, 0, 512, 0),
            Err(Error::Compile(_))
        ));
        assert!(matches!(
            Instruction::abx(OpCode::LoadK, 0, MAX_BX as u32 + 1),
            Err(Error::Compile(_))
        ));
        assert!(matches!(
            Instruction::asbx(OpCode::Jmp, 0, MAX_SBX + 2),
            Err(Error::Compile(_))
        ));
        assert!(matches!(
            Instruction::asbx(OpCode::Jmp, 0, -MAX_SBX - 1),
            Err(Error::Compile(_))
        ));
    }

    #[test]
    fn test_rk_operands() {
        assert_eq!(rk_constant(0), Some(256));
        assert_eq!(rk_constant(255), Some(511));
        assert_eq!(rk_constant(256), None);
        assert!(is_constant(300));
        assert!(!is_constant(255));
        assert_eq!(constant_index(300), 44);
    }

    #[test]
    fn test_every_opcode_round_trips_through_its_byte() {
        for (i, op) in OpCode::ALL.iter().enumerate() {
            assert_eq!(OpCode::from_u8(i as u8), Some(*op));
            assert_eq!(*op as usize, i);
        }
        assert!(OpCode::ALL.len() <= 64);
        assert_eq!(OpCode::from_u8(63), None);
    }

    #[test]
    fn test_display() {
        let cases = vec![
            (Instruction::abc(OpCode::Add, 1, 2, 257).unwrap(), "ADD       R1 R2 K1"),
            (Instruction::abx(OpCode::LoadK, 0, 3).unwrap(), "LOADK     R0 K3"),
            (Instruction::asbx(OpCode::Jmp, 0, -2).unwrap(), "JMP       -2"),
            (Instruction::ab(OpCode::Return, 0, 2).unwrap(), "RETURN    R0 2"),
            (Instruction::abc(OpCode::NumEq, 0, 1, 256).unwrap(), "EQNUM     0 R1 K0"),
        ];
        for (i, (instruction, expected)) in cases.into_iter().enumerate() {
            assert_eq!(instruction.to_string(), expected, "#{}", i + 1);
        }
    }
}
