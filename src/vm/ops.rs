//! Instruction set of the console VM.
//!
//! An instruction stream is a flat sequence of 32-bit words. The first word of
//! every instruction is its opcode (always below `0xFF`, so that the line-break
//! table can pack it into the low byte of a pair); operands follow in the next
//! words. [`Instruction`] is the typed view of one decoded instruction.
use super::symbols::SymbolId;
use crate::error::DecodeError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ========================================
    // Declarations
    // ========================================
    FuncDecl = 0,
    CreateObject,
    AddObject,
    EndObject,

    // ========================================
    // Control flow
    // ========================================
    JmpIffNot,
    JmpIfNot,
    JmpIff,
    JmpIf,
    JmpIfNotNp,
    JmpIfNp,
    Jmp,
    Return,
    ReturnVoid,

    // ========================================
    // Comparison (float operands, uint result)
    // ========================================
    CmpEq,
    CmpGr,
    CmpGe,
    CmpLt,
    CmpLe,
    CmpNe,

    // ========================================
    // Integer arithmetic / logic
    // ========================================
    Xor,
    Mod,
    BitAnd,
    BitOr,
    Not,
    NotF,
    OnesComplement,
    Shr,
    Shl,

    // ========================================
    // Float arithmetic
    // ========================================
    Add,
    Sub,
    Mul,
    Div,
    Neg,

    // ========================================
    // Variables
    // ========================================
    SetCurVar,
    SetCurVarCreate,
    SetCurVarArray,
    SetCurVarArrayCreate,
    LoadVarUint,
    LoadVarFlt,
    LoadVarStr,
    SaveVarUint,
    SaveVarFlt,
    SaveVarStr,

    // ========================================
    // Object fields
    // ========================================
    SetCurObject,
    SetCurObjectNew,
    SetCurField,
    SetCurFieldArray,
    LoadFieldUint,
    LoadFieldFlt,
    LoadFieldStr,
    SaveFieldUint,
    SaveFieldFlt,
    SaveFieldStr,

    // ========================================
    // Coercion
    // ========================================
    StrToUint,
    StrToFlt,
    StrToNone,
    FltToUint,
    FltToStr,
    FltToNone,
    UintToFlt,
    UintToStr,
    UintToNone,

    // ========================================
    // Immediates
    // ========================================
    LoadImmedUint,
    LoadImmedFlt,
    TagToStr,
    LoadImmedStr,
    LoadImmedIdent,

    // ========================================
    // Calls and strings
    // ========================================
    CallFunc,
    Concat,
    ConcatChar,
    CompareStr,
    PushFrame,
    Push,

    // ========================================
    // Iteration
    // ========================================
    IterBegin,
    IterBeginStr,
    Iter,
    IterEnd,

    // ========================================
    // Debugging
    // ========================================
    Break,
}

const OPCODES: [Opcode; 78] = [
    Opcode::FuncDecl,
    Opcode::CreateObject,
    Opcode::AddObject,
    Opcode::EndObject,
    Opcode::JmpIffNot,
    Opcode::JmpIfNot,
    Opcode::JmpIff,
    Opcode::JmpIf,
    Opcode::JmpIfNotNp,
    Opcode::JmpIfNp,
    Opcode::Jmp,
    Opcode::Return,
    Opcode::ReturnVoid,
    Opcode::CmpEq,
    Opcode::CmpGr,
    Opcode::CmpGe,
    Opcode::CmpLt,
    Opcode::CmpLe,
    Opcode::CmpNe,
    Opcode::Xor,
    Opcode::Mod,
    Opcode::BitAnd,
    Opcode::BitOr,
    Opcode::Not,
    Opcode::NotF,
    Opcode::OnesComplement,
    Opcode::Shr,
    Opcode::Shl,
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::Div,
    Opcode::Neg,
    Opcode::SetCurVar,
    Opcode::SetCurVarCreate,
    Opcode::SetCurVarArray,
    Opcode::SetCurVarArrayCreate,
    Opcode::LoadVarUint,
    Opcode::LoadVarFlt,
    Opcode::LoadVarStr,
    Opcode::SaveVarUint,
    Opcode::SaveVarFlt,
    Opcode::SaveVarStr,
    Opcode::SetCurObject,
    Opcode::SetCurObjectNew,
    Opcode::SetCurField,
    Opcode::SetCurFieldArray,
    Opcode::LoadFieldUint,
    Opcode::LoadFieldFlt,
    Opcode::LoadFieldStr,
    Opcode::SaveFieldUint,
    Opcode::SaveFieldFlt,
    Opcode::SaveFieldStr,
    Opcode::StrToUint,
    Opcode::StrToFlt,
    Opcode::StrToNone,
    Opcode::FltToUint,
    Opcode::FltToStr,
    Opcode::FltToNone,
    Opcode::UintToFlt,
    Opcode::UintToStr,
    Opcode::UintToNone,
    Opcode::LoadImmedUint,
    Opcode::LoadImmedFlt,
    Opcode::TagToStr,
    Opcode::LoadImmedStr,
    Opcode::LoadImmedIdent,
    Opcode::CallFunc,
    Opcode::Concat,
    Opcode::ConcatChar,
    Opcode::CompareStr,
    Opcode::PushFrame,
    Opcode::Push,
    Opcode::IterBegin,
    Opcode::IterBeginStr,
    Opcode::Iter,
    Opcode::IterEnd,
    Opcode::Break,
];

impl Opcode {
    pub fn from_word(word: u32) -> Option<Opcode> {
        OPCODES.get(word as usize).copied()
    }

    pub fn from_byte(byte: u8) -> Option<Opcode> {
        Self::from_word(byte as u32)
    }

    pub fn word(self) -> u32 {
        self as u8 as u32
    }

    /// Returns the mnemonic used by the disassembler.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::FuncDecl => "FUNC_DECL",
            Opcode::CreateObject => "CREATE_OBJECT",
            Opcode::AddObject => "ADD_OBJECT",
            Opcode::EndObject => "END_OBJECT",
            Opcode::JmpIffNot => "JMPIFFNOT",
            Opcode::JmpIfNot => "JMPIFNOT",
            Opcode::JmpIff => "JMPIFF",
            Opcode::JmpIf => "JMPIF",
            Opcode::JmpIfNotNp => "JMPIFNOT_NP",
            Opcode::JmpIfNp => "JMPIF_NP",
            Opcode::Jmp => "JMP",
            Opcode::Return => "RETURN",
            Opcode::ReturnVoid => "RETURN_VOID",
            Opcode::CmpEq => "CMPEQ",
            Opcode::CmpGr => "CMPGR",
            Opcode::CmpGe => "CMPGE",
            Opcode::CmpLt => "CMPLT",
            Opcode::CmpLe => "CMPLE",
            Opcode::CmpNe => "CMPNE",
            Opcode::Xor => "XOR",
            Opcode::Mod => "MOD",
            Opcode::BitAnd => "BITAND",
            Opcode::BitOr => "BITOR",
            Opcode::Not => "NOT",
            Opcode::NotF => "NOTF",
            Opcode::OnesComplement => "ONESCOMPLEMENT",
            Opcode::Shr => "SHR",
            Opcode::Shl => "SHL",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Neg => "NEG",
            Opcode::SetCurVar => "SETCURVAR",
            Opcode::SetCurVarCreate => "SETCURVAR_CREATE",
            Opcode::SetCurVarArray => "SETCURVAR_ARRAY",
            Opcode::SetCurVarArrayCreate => "SETCURVAR_ARRAY_CREATE",
            Opcode::LoadVarUint => "LOADVAR_UINT",
            Opcode::LoadVarFlt => "LOADVAR_FLT",
            Opcode::LoadVarStr => "LOADVAR_STR",
            Opcode::SaveVarUint => "SAVEVAR_UINT",
            Opcode::SaveVarFlt => "SAVEVAR_FLT",
            Opcode::SaveVarStr => "SAVEVAR_STR",
            Opcode::SetCurObject => "SETCUROBJECT",
            Opcode::SetCurObjectNew => "SETCUROBJECT_NEW",
            Opcode::SetCurField => "SETCURFIELD",
            Opcode::SetCurFieldArray => "SETCURFIELD_ARRAY",
            Opcode::LoadFieldUint => "LOADFIELD_UINT",
            Opcode::LoadFieldFlt => "LOADFIELD_FLT",
            Opcode::LoadFieldStr => "LOADFIELD_STR",
            Opcode::SaveFieldUint => "SAVEFIELD_UINT",
            Opcode::SaveFieldFlt => "SAVEFIELD_FLT",
            Opcode::SaveFieldStr => "SAVEFIELD_STR",
            Opcode::StrToUint => "STR_TO_UINT",
            Opcode::StrToFlt => "STR_TO_FLT",
            Opcode::StrToNone => "STR_TO_NONE",
            Opcode::FltToUint => "FLT_TO_UINT",
            Opcode::FltToStr => "FLT_TO_STR",
            Opcode::FltToNone => "FLT_TO_NONE",
            Opcode::UintToFlt => "UINT_TO_FLT",
            Opcode::UintToStr => "UINT_TO_STR",
            Opcode::UintToNone => "UINT_TO_NONE",
            Opcode::LoadImmedUint => "LOADIMMED_UINT",
            Opcode::LoadImmedFlt => "LOADIMMED_FLT",
            Opcode::TagToStr => "TAG_TO_STR",
            Opcode::LoadImmedStr => "LOADIMMED_STR",
            Opcode::LoadImmedIdent => "LOADIMMED_IDENT",
            Opcode::CallFunc => "CALLFUNC",
            Opcode::Concat => "CONCAT",
            Opcode::ConcatChar => "CONCAT_CHAR",
            Opcode::CompareStr => "COMPARE_STR",
            Opcode::PushFrame => "PUSH_FRAME",
            Opcode::Push => "PUSH",
            Opcode::IterBegin => "ITER_BEGIN",
            Opcode::IterBeginStr => "ITER_BEGIN_STR",
            Opcode::Iter => "ITER",
            Opcode::IterEnd => "ITER_END",
            Opcode::Break => "BREAK",
        }
    }
}

/// Value representation selected by a typed load/save opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Uint,
    Float,
    Str,
}

/// How a `CALLFUNC` resolves its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// `name(...)` or `Ns::name(...)`.
    Function = 0,
    /// `obj.name(...)`; the first pushed argument is the object.
    Method = 1,
    /// `Parent::name(...)`.
    Parent = 2,
}

impl CallType {
    fn from_word(word: u32) -> Option<CallType> {
        match word {
            0 => Some(CallType::Function),
            1 => Some(CallType::Method),
            2 => Some(CallType::Parent),
            _ => None,
        }
    }
}

/// A decoded instruction with typed operands.
///
/// Jump targets and `end_ip`/`fail` are absolute word offsets into the
/// owning code block. `LoadImmedStr`/`TagToStr` carry a byte offset into the
/// active string blob, `LoadImmedFlt` an index into the active float table.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    FuncDecl {
        name: Option<SymbolId>,
        namespace: Option<SymbolId>,
        has_body: bool,
        line: u32,
        end_ip: u32,
        args: Vec<Option<SymbolId>>,
    },
    CreateObject {
        fail: u32,
    },
    AddObject {
        place_at_root: bool,
    },
    EndObject {
        place_at_root: bool,
    },

    JmpIffNot(u32),
    JmpIfNot(u32),
    JmpIff(u32),
    JmpIf(u32),
    JmpIfNotNp(u32),
    JmpIfNp(u32),
    Jmp(u32),
    Return,
    ReturnVoid,

    CmpEq,
    CmpGr,
    CmpGe,
    CmpLt,
    CmpLe,
    CmpNe,
    Xor,
    Mod,
    BitAnd,
    BitOr,
    Not,
    NotF,
    OnesComplement,
    Shr,
    Shl,
    Add,
    Sub,
    Mul,
    Div,
    Neg,

    SetCurVar(Option<SymbolId>),
    SetCurVarCreate(Option<SymbolId>),
    SetCurVarArray,
    SetCurVarArrayCreate,
    LoadVar(Kind),
    SaveVar(Kind),

    SetCurObject,
    SetCurObjectNew,
    SetCurField(Option<SymbolId>),
    SetCurFieldArray,
    LoadField(Kind),
    SaveField(Kind),

    StrToUint,
    StrToFlt,
    StrToNone,
    FltToUint,
    FltToStr,
    FltToNone,
    UintToFlt,
    UintToStr,
    UintToNone,

    LoadImmedUint(u32),
    LoadImmedFlt(u32),
    TagToStr(u32),
    LoadImmedStr(u32),
    LoadImmedIdent(Option<SymbolId>),

    CallFunc {
        name: Option<SymbolId>,
        namespace: Option<SymbolId>,
        call_type: CallType,
    },
    Concat,
    ConcatChar(u8),
    CompareStr,
    PushFrame,
    Push,

    IterBegin {
        var: Option<SymbolId>,
        fail: u32,
    },
    IterBeginStr {
        var: Option<SymbolId>,
        fail: u32,
    },
    Iter {
        exit: u32,
    },
    IterEnd,

    Break,
}

impl Instruction {
    /// Decode the instruction starting at `ip`.
    pub fn decode(code: &[u32], ip: usize) -> Result<Instruction, DecodeError> {
        let word = *code.get(ip).ok_or(DecodeError::Truncated { ip })?;
        Self::decode_with_opcode(code, ip, word)
    }

    /// Decode the instruction at `ip` using `word` in place of `code[ip]`;
    /// operands still come from `code`.
    pub fn decode_with_opcode(code: &[u32], ip: usize, word: u32) -> Result<Instruction, DecodeError> {
        let op = Opcode::from_word(word).ok_or(DecodeError::InvalidOpcode { ip, word })?;
        let operand = |n: usize| -> Result<u32, DecodeError> {
            code.get(ip + n).copied().ok_or(DecodeError::Truncated { ip })
        };
        let sym = |n: usize| -> Result<Option<SymbolId>, DecodeError> {
            operand(n).map(SymbolId::from_word)
        };

        let inst = match op {
            Opcode::FuncDecl => {
                let flags = operand(3)?;
                let argc = operand(5)? as usize;
                let mut args = Vec::with_capacity(argc);
                for i in 0..argc {
                    args.push(sym(6 + i)?);
                }
                Instruction::FuncDecl {
                    name: sym(1)?,
                    namespace: sym(2)?,
                    has_body: flags & 1 != 0,
                    line: flags >> 1,
                    end_ip: operand(4)?,
                    args,
                }
            }
            Opcode::CreateObject => Instruction::CreateObject { fail: operand(1)? },
            Opcode::AddObject => Instruction::AddObject {
                place_at_root: operand(1)? != 0,
            },
            Opcode::EndObject => Instruction::EndObject {
                place_at_root: operand(1)? != 0,
            },
            Opcode::JmpIffNot => Instruction::JmpIffNot(operand(1)?),
            Opcode::JmpIfNot => Instruction::JmpIfNot(operand(1)?),
            Opcode::JmpIff => Instruction::JmpIff(operand(1)?),
            Opcode::JmpIf => Instruction::JmpIf(operand(1)?),
            Opcode::JmpIfNotNp => Instruction::JmpIfNotNp(operand(1)?),
            Opcode::JmpIfNp => Instruction::JmpIfNp(operand(1)?),
            Opcode::Jmp => Instruction::Jmp(operand(1)?),
            Opcode::Return => Instruction::Return,
            Opcode::ReturnVoid => Instruction::ReturnVoid,
            Opcode::CmpEq => Instruction::CmpEq,
            Opcode::CmpGr => Instruction::CmpGr,
            Opcode::CmpGe => Instruction::CmpGe,
            Opcode::CmpLt => Instruction::CmpLt,
            Opcode::CmpLe => Instruction::CmpLe,
            Opcode::CmpNe => Instruction::CmpNe,
            Opcode::Xor => Instruction::Xor,
            Opcode::Mod => Instruction::Mod,
            Opcode::BitAnd => Instruction::BitAnd,
            Opcode::BitOr => Instruction::BitOr,
            Opcode::Not => Instruction::Not,
            Opcode::NotF => Instruction::NotF,
            Opcode::OnesComplement => Instruction::OnesComplement,
            Opcode::Shr => Instruction::Shr,
            Opcode::Shl => Instruction::Shl,
            Opcode::Add => Instruction::Add,
            Opcode::Sub => Instruction::Sub,
            Opcode::Mul => Instruction::Mul,
            Opcode::Div => Instruction::Div,
            Opcode::Neg => Instruction::Neg,
            Opcode::SetCurVar => Instruction::SetCurVar(sym(1)?),
            Opcode::SetCurVarCreate => Instruction::SetCurVarCreate(sym(1)?),
            Opcode::SetCurVarArray => Instruction::SetCurVarArray,
            Opcode::SetCurVarArrayCreate => Instruction::SetCurVarArrayCreate,
            Opcode::LoadVarUint => Instruction::LoadVar(Kind::Uint),
            Opcode::LoadVarFlt => Instruction::LoadVar(Kind::Float),
            Opcode::LoadVarStr => Instruction::LoadVar(Kind::Str),
            Opcode::SaveVarUint => Instruction::SaveVar(Kind::Uint),
            Opcode::SaveVarFlt => Instruction::SaveVar(Kind::Float),
            Opcode::SaveVarStr => Instruction::SaveVar(Kind::Str),
            Opcode::SetCurObject => Instruction::SetCurObject,
            Opcode::SetCurObjectNew => Instruction::SetCurObjectNew,
            Opcode::SetCurField => Instruction::SetCurField(sym(1)?),
            Opcode::SetCurFieldArray => Instruction::SetCurFieldArray,
            Opcode::LoadFieldUint => Instruction::LoadField(Kind::Uint),
            Opcode::LoadFieldFlt => Instruction::LoadField(Kind::Float),
            Opcode::LoadFieldStr => Instruction::LoadField(Kind::Str),
            Opcode::SaveFieldUint => Instruction::SaveField(Kind::Uint),
            Opcode::SaveFieldFlt => Instruction::SaveField(Kind::Float),
            Opcode::SaveFieldStr => Instruction::SaveField(Kind::Str),
            Opcode::StrToUint => Instruction::StrToUint,
            Opcode::StrToFlt => Instruction::StrToFlt,
            Opcode::StrToNone => Instruction::StrToNone,
            Opcode::FltToUint => Instruction::FltToUint,
            Opcode::FltToStr => Instruction::FltToStr,
            Opcode::FltToNone => Instruction::FltToNone,
            Opcode::UintToFlt => Instruction::UintToFlt,
            Opcode::UintToStr => Instruction::UintToStr,
            Opcode::UintToNone => Instruction::UintToNone,
            Opcode::LoadImmedUint => Instruction::LoadImmedUint(operand(1)?),
            Opcode::LoadImmedFlt => Instruction::LoadImmedFlt(operand(1)?),
            Opcode::TagToStr => Instruction::TagToStr(operand(1)?),
            Opcode::LoadImmedStr => Instruction::LoadImmedStr(operand(1)?),
            Opcode::LoadImmedIdent => Instruction::LoadImmedIdent(sym(1)?),
            Opcode::CallFunc => {
                let raw = operand(3)?;
                let call_type = CallType::from_word(raw)
                    .ok_or(DecodeError::InvalidOperand { ip, word: raw })?;
                Instruction::CallFunc {
                    name: sym(1)?,
                    namespace: sym(2)?,
                    call_type,
                }
            }
            Opcode::Concat => Instruction::Concat,
            Opcode::ConcatChar => {
                let raw = operand(1)?;
                let ch = u8::try_from(raw).map_err(|_| DecodeError::InvalidOperand { ip, word: raw })?;
                Instruction::ConcatChar(ch)
            }
            Opcode::CompareStr => Instruction::CompareStr,
            Opcode::PushFrame => Instruction::PushFrame,
            Opcode::Push => Instruction::Push,
            Opcode::IterBegin => Instruction::IterBegin {
                var: sym(1)?,
                fail: operand(2)?,
            },
            Opcode::IterBeginStr => Instruction::IterBeginStr {
                var: sym(1)?,
                fail: operand(2)?,
            },
            Opcode::Iter => Instruction::Iter { exit: operand(1)? },
            Opcode::IterEnd => Instruction::IterEnd,
            Opcode::Break => Instruction::Break,
        };
        Ok(inst)
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::FuncDecl { .. } => Opcode::FuncDecl,
            Instruction::CreateObject { .. } => Opcode::CreateObject,
            Instruction::AddObject { .. } => Opcode::AddObject,
            Instruction::EndObject { .. } => Opcode::EndObject,
            Instruction::JmpIffNot(_) => Opcode::JmpIffNot,
            Instruction::JmpIfNot(_) => Opcode::JmpIfNot,
            Instruction::JmpIff(_) => Opcode::JmpIff,
            Instruction::JmpIf(_) => Opcode::JmpIf,
            Instruction::JmpIfNotNp(_) => Opcode::JmpIfNotNp,
            Instruction::JmpIfNp(_) => Opcode::JmpIfNp,
            Instruction::Jmp(_) => Opcode::Jmp,
            Instruction::Return => Opcode::Return,
            Instruction::ReturnVoid => Opcode::ReturnVoid,
            Instruction::CmpEq => Opcode::CmpEq,
            Instruction::CmpGr => Opcode::CmpGr,
            Instruction::CmpGe => Opcode::CmpGe,
            Instruction::CmpLt => Opcode::CmpLt,
            Instruction::CmpLe => Opcode::CmpLe,
            Instruction::CmpNe => Opcode::CmpNe,
            Instruction::Xor => Opcode::Xor,
            Instruction::Mod => Opcode::Mod,
            Instruction::BitAnd => Opcode::BitAnd,
            Instruction::BitOr => Opcode::BitOr,
            Instruction::Not => Opcode::Not,
            Instruction::NotF => Opcode::NotF,
            Instruction::OnesComplement => Opcode::OnesComplement,
            Instruction::Shr => Opcode::Shr,
            Instruction::Shl => Opcode::Shl,
            Instruction::Add => Opcode::Add,
            Instruction::Sub => Opcode::Sub,
            Instruction::Mul => Opcode::Mul,
            Instruction::Div => Opcode::Div,
            Instruction::Neg => Opcode::Neg,
            Instruction::SetCurVar(_) => Opcode::SetCurVar,
            Instruction::SetCurVarCreate(_) => Opcode::SetCurVarCreate,
            Instruction::SetCurVarArray => Opcode::SetCurVarArray,
            Instruction::SetCurVarArrayCreate => Opcode::SetCurVarArrayCreate,
            Instruction::LoadVar(Kind::Uint) => Opcode::LoadVarUint,
            Instruction::LoadVar(Kind::Float) => Opcode::LoadVarFlt,
            Instruction::LoadVar(Kind::Str) => Opcode::LoadVarStr,
            Instruction::SaveVar(Kind::Uint) => Opcode::SaveVarUint,
            Instruction::SaveVar(Kind::Float) => Opcode::SaveVarFlt,
            Instruction::SaveVar(Kind::Str) => Opcode::SaveVarStr,
            Instruction::SetCurObject => Opcode::SetCurObject,
            Instruction::SetCurObjectNew => Opcode::SetCurObjectNew,
            Instruction::SetCurField(_) => Opcode::SetCurField,
            Instruction::SetCurFieldArray => Opcode::SetCurFieldArray,
            Instruction::LoadField(Kind::Uint) => Opcode::LoadFieldUint,
            Instruction::LoadField(Kind::Float) => Opcode::LoadFieldFlt,
            Instruction::LoadField(Kind::Str) => Opcode::LoadFieldStr,
            Instruction::SaveField(Kind::Uint) => Opcode::SaveFieldUint,
            Instruction::SaveField(Kind::Float) => Opcode::SaveFieldFlt,
            Instruction::SaveField(Kind::Str) => Opcode::SaveFieldStr,
            Instruction::StrToUint => Opcode::StrToUint,
            Instruction::StrToFlt => Opcode::StrToFlt,
            Instruction::StrToNone => Opcode::StrToNone,
            Instruction::FltToUint => Opcode::FltToUint,
            Instruction::FltToStr => Opcode::FltToStr,
            Instruction::FltToNone => Opcode::FltToNone,
            Instruction::UintToFlt => Opcode::UintToFlt,
            Instruction::UintToStr => Opcode::UintToStr,
            Instruction::UintToNone => Opcode::UintToNone,
            Instruction::LoadImmedUint(_) => Opcode::LoadImmedUint,
            Instruction::LoadImmedFlt(_) => Opcode::LoadImmedFlt,
            Instruction::TagToStr(_) => Opcode::TagToStr,
            Instruction::LoadImmedStr(_) => Opcode::LoadImmedStr,
            Instruction::LoadImmedIdent(_) => Opcode::LoadImmedIdent,
            Instruction::CallFunc { .. } => Opcode::CallFunc,
            Instruction::Concat => Opcode::Concat,
            Instruction::ConcatChar(_) => Opcode::ConcatChar,
            Instruction::CompareStr => Opcode::CompareStr,
            Instruction::PushFrame => Opcode::PushFrame,
            Instruction::Push => Opcode::Push,
            Instruction::IterBegin { .. } => Opcode::IterBegin,
            Instruction::IterBeginStr { .. } => Opcode::IterBeginStr,
            Instruction::Iter { .. } => Opcode::Iter,
            Instruction::IterEnd => Opcode::IterEnd,
            Instruction::Break => Opcode::Break,
        }
    }

    /// Number of words this instruction occupies.
    pub fn size(&self) -> usize {
        match self {
            Instruction::FuncDecl { args, .. } => 6 + args.len(),
            Instruction::CallFunc { .. } => 4,
            Instruction::IterBegin { .. } | Instruction::IterBeginStr { .. } => 3,
            Instruction::CreateObject { .. }
            | Instruction::AddObject { .. }
            | Instruction::EndObject { .. }
            | Instruction::JmpIffNot(_)
            | Instruction::JmpIfNot(_)
            | Instruction::JmpIff(_)
            | Instruction::JmpIf(_)
            | Instruction::JmpIfNotNp(_)
            | Instruction::JmpIfNp(_)
            | Instruction::Jmp(_)
            | Instruction::SetCurVar(_)
            | Instruction::SetCurVarCreate(_)
            | Instruction::SetCurField(_)
            | Instruction::LoadImmedUint(_)
            | Instruction::LoadImmedFlt(_)
            | Instruction::TagToStr(_)
            | Instruction::LoadImmedStr(_)
            | Instruction::LoadImmedIdent(_)
            | Instruction::ConcatChar(_)
            | Instruction::Iter { .. } => 2,
            _ => 1,
        }
    }

    /// Append the encoded words of this instruction to `out`.
    pub fn encode(&self, out: &mut Vec<u32>) {
        out.push(self.opcode().word());
        match self {
            Instruction::FuncDecl {
                name,
                namespace,
                has_body,
                line,
                end_ip,
                args,
            } => {
                out.push(SymbolId::encode(*name));
                out.push(SymbolId::encode(*namespace));
                out.push((line << 1) | (*has_body as u32));
                out.push(*end_ip);
                out.push(args.len() as u32);
                out.extend(args.iter().map(|a| SymbolId::encode(*a)));
            }
            Instruction::CreateObject { fail } => out.push(*fail),
            Instruction::AddObject { place_at_root } | Instruction::EndObject { place_at_root } => {
                out.push(*place_at_root as u32)
            }
            Instruction::JmpIffNot(t)
            | Instruction::JmpIfNot(t)
            | Instruction::JmpIff(t)
            | Instruction::JmpIf(t)
            | Instruction::JmpIfNotNp(t)
            | Instruction::JmpIfNp(t)
            | Instruction::Jmp(t) => out.push(*t),
            Instruction::SetCurVar(s)
            | Instruction::SetCurVarCreate(s)
            | Instruction::SetCurField(s)
            | Instruction::LoadImmedIdent(s) => out.push(SymbolId::encode(*s)),
            Instruction::LoadImmedUint(v)
            | Instruction::LoadImmedFlt(v)
            | Instruction::TagToStr(v)
            | Instruction::LoadImmedStr(v) => out.push(*v),
            Instruction::CallFunc {
                name,
                namespace,
                call_type,
            } => {
                out.push(SymbolId::encode(*name));
                out.push(SymbolId::encode(*namespace));
                out.push(*call_type as u32);
            }
            Instruction::ConcatChar(c) => out.push(*c as u32),
            Instruction::IterBegin { var, fail } | Instruction::IterBeginStr { var, fail } => {
                out.push(SymbolId::encode(*var));
                out.push(*fail);
            }
            Instruction::Iter { exit } => out.push(*exit),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes_fit_in_a_byte() {
        for (i, op) in OPCODES.iter().enumerate() {
            assert_eq!(op.word() as usize, i);
            assert!(op.word() < 0xFF);
            assert_eq!(Opcode::from_byte(op.word() as u8), Some(*op));
        }
        assert_eq!(Opcode::from_word(OPCODES.len() as u32), None);
    }

    #[test]
    fn test_size_matches_encoding() {
        let mut syms = crate::vm::symbols::SymbolTable::new();
        let a = syms.insert("%a");
        let f = syms.insert("foo");
        let insts = vec![
            Instruction::FuncDecl {
                name: Some(f),
                namespace: None,
                has_body: true,
                line: 12,
                end_ip: 40,
                args: vec![Some(a), Some(a)],
            },
            Instruction::CallFunc {
                name: Some(f),
                namespace: None,
                call_type: CallType::Method,
            },
            Instruction::IterBeginStr { var: Some(a), fail: 9 },
            Instruction::ConcatChar(b' '),
            Instruction::SaveField(Kind::Float),
            Instruction::Break,
        ];
        let mut code = Vec::new();
        for inst in &insts {
            let before = code.len();
            inst.encode(&mut code);
            assert_eq!(code.len() - before, inst.size());
        }
        let mut ip = 0;
        for inst in &insts {
            let decoded = Instruction::decode(&code, ip).unwrap();
            assert_eq!(&decoded, inst);
            ip += decoded.size();
        }
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            Instruction::decode(&[0xF0], 0),
            Err(DecodeError::InvalidOpcode { ip: 0, word: 0xF0 })
        ));
        assert!(matches!(
            Instruction::decode(&[Opcode::Jmp.word()], 0),
            Err(DecodeError::Truncated { ip: 0 })
        ));
        assert!(matches!(
            Instruction::decode(&[], 0),
            Err(DecodeError::Truncated { ip: 0 })
        ));
    }
}
