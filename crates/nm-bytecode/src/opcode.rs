//! Opcode enumeration.
//!
//! Discriminants are part of the wire format; never reorder. New opcodes go
//! at the end and bump [`crate::NMBC_VERSION`].

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid opcode byte {0:#04x}")]
pub struct InvalidOpcode(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0,
    Halt = 1,
    Jump = 2,
    JumpIf = 3,
    JumpIfNot = 4,
    PushInt = 5,
    PushFloat = 6,
    PushString = 7,
    PushBool = 8,
    PushNull = 9,
    Pop = 10,
    Dup = 11,
    LoadGlobal = 12,
    StoreGlobal = 13,
    SetFlag = 14,
    CheckFlag = 15,
    Add = 16,
    Sub = 17,
    Mul = 18,
    Div = 19,
    Mod = 20,
    Neg = 21,
    Eq = 22,
    Ne = 23,
    Lt = 24,
    Le = 25,
    Gt = 26,
    Ge = 27,
    And = 28,
    Or = 29,
    Not = 30,
    Say = 31,
    ShowBackground = 32,
    ShowCharacter = 33,
    HideCharacter = 34,
    MoveCharacter = 35,
    Choice = 36,
    Wait = 37,
    Transition = 38,
    PlaySound = 39,
    PlayMusic = 40,
    StopMusic = 41,
    GotoScene = 42,
    Call = 43,
    Return = 44,
}

impl OpCode {
    /// Opcodes that hand control to the host presentation layer.
    pub fn is_host_command(self) -> bool {
        matches!(
            self,
            OpCode::Say
                | OpCode::ShowBackground
                | OpCode::ShowCharacter
                | OpCode::HideCharacter
                | OpCode::MoveCharacter
                | OpCode::Choice
                | OpCode::Wait
                | OpCode::Transition
                | OpCode::PlaySound
                | OpCode::PlayMusic
                | OpCode::StopMusic
                | OpCode::GotoScene
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Nop => "NOP",
            OpCode::Halt => "HALT",
            OpCode::Jump => "JUMP",
            OpCode::JumpIf => "JUMP_IF",
            OpCode::JumpIfNot => "JUMP_IF_NOT",
            OpCode::PushInt => "PUSH_INT",
            OpCode::PushFloat => "PUSH_FLOAT",
            OpCode::PushString => "PUSH_STRING",
            OpCode::PushBool => "PUSH_BOOL",
            OpCode::PushNull => "PUSH_NULL",
            OpCode::Pop => "POP",
            OpCode::Dup => "DUP",
            OpCode::LoadGlobal => "LOAD_GLOBAL",
            OpCode::StoreGlobal => "STORE_GLOBAL",
            OpCode::SetFlag => "SET_FLAG",
            OpCode::CheckFlag => "CHECK_FLAG",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Neg => "NEG",
            OpCode::Eq => "EQ",
            OpCode::Ne => "NE",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Gt => "GT",
            OpCode::Ge => "GE",
            OpCode::And => "AND",
            OpCode::Or => "OR",
            OpCode::Not => "NOT",
            OpCode::Say => "SAY",
            OpCode::ShowBackground => "SHOW_BACKGROUND",
            OpCode::ShowCharacter => "SHOW_CHARACTER",
            OpCode::HideCharacter => "HIDE_CHARACTER",
            OpCode::MoveCharacter => "MOVE_CHARACTER",
            OpCode::Choice => "CHOICE",
            OpCode::Wait => "WAIT",
            OpCode::Transition => "TRANSITION",
            OpCode::PlaySound => "PLAY_SOUND",
            OpCode::PlayMusic => "PLAY_MUSIC",
            OpCode::StopMusic => "STOP_MUSIC",
            OpCode::GotoScene => "GOTO_SCENE",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = InvalidOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0 => OpCode::Nop,
            1 => OpCode::Halt,
            2 => OpCode::Jump,
            3 => OpCode::JumpIf,
            4 => OpCode::JumpIfNot,
            5 => OpCode::PushInt,
            6 => OpCode::PushFloat,
            7 => OpCode::PushString,
            8 => OpCode::PushBool,
            9 => OpCode::PushNull,
            10 => OpCode::Pop,
            11 => OpCode::Dup,
            12 => OpCode::LoadGlobal,
            13 => OpCode::StoreGlobal,
            14 => OpCode::SetFlag,
            15 => OpCode::CheckFlag,
            16 => OpCode::Add,
            17 => OpCode::Sub,
            18 => OpCode::Mul,
            19 => OpCode::Div,
            20 => OpCode::Mod,
            21 => OpCode::Neg,
            22 => OpCode::Eq,
            23 => OpCode::Ne,
            24 => OpCode::Lt,
            25 => OpCode::Le,
            26 => OpCode::Gt,
            27 => OpCode::Ge,
            28 => OpCode::And,
            29 => OpCode::Or,
            30 => OpCode::Not,
            31 => OpCode::Say,
            32 => OpCode::ShowBackground,
            33 => OpCode::ShowCharacter,
            34 => OpCode::HideCharacter,
            35 => OpCode::MoveCharacter,
            36 => OpCode::Choice,
            37 => OpCode::Wait,
            38 => OpCode::Transition,
            39 => OpCode::PlaySound,
            40 => OpCode::PlayMusic,
            41 => OpCode::StopMusic,
            42 => OpCode::GotoScene,
            43 => OpCode::Call,
            44 => OpCode::Return,
            other => return Err(InvalidOpcode(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_discriminant() {
        for byte in 0u8..=44 {
            let op = OpCode::try_from(byte).expect("discriminant range is dense");
            assert_eq!(op as u8, byte);
        }
    }

    #[test]
    fn rejects_out_of_range() {
        assert_eq!(OpCode::try_from(45), Err(InvalidOpcode(45)));
        assert_eq!(OpCode::try_from(0xff), Err(InvalidOpcode(0xff)));
    }

    #[test]
    fn host_command_set_matches_waiting_surface() {
        assert!(OpCode::Say.is_host_command());
        assert!(OpCode::GotoScene.is_host_command());
        assert!(!OpCode::Add.is_host_command());
        assert!(!OpCode::Call.is_host_command());
    }
}
