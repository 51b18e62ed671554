//! Abstract syntax tree for NM Script.
//!
//! Every statement and expression carries the location of its first token so
//! the compiler can emit the IP-to-source map the debugger consumes.

use crate::token::Location;
use nm_bytecode::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub characters: Vec<CharacterDecl>,
    pub scenes: Vec<SceneDecl>,
    pub global_statements: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharacterDecl {
    pub id: String,
    pub display_name: String,
    pub color: Option<String>,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneDecl {
    pub name: String,
    pub body: Vec<Stmt>,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Show(ShowStmt),
    Hide(HideStmt),
    Say(SayStmt),
    Choice(ChoiceStmt),
    If(IfStmt),
    Goto(GotoStmt),
    Wait(WaitStmt),
    Play(PlayStmt),
    Stop(StopStmt),
    Set(SetStmt),
    Transition(TransitionStmt),
    Move(MoveStmt),
    Label(LabelStmt),
    Block(Vec<Stmt>),
    Expression(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowTarget {
    Background,
    Character,
    Sprite,
}

/// Screen position codes shared by `show ... at` and `move ... to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Left,
    Center,
    Right,
    Custom,
}

impl Position {
    /// Operand encoding used by the bytecode (0=left, 1=center, 2=right,
    /// 3=custom).
    pub fn code(self) -> i32 {
        match self {
            Position::Left => 0,
            Position::Center => 1,
            Position::Right => 2,
            Position::Custom => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShowStmt {
    pub target: ShowTarget,
    pub identifier: String,
    pub resource: Option<String>,
    pub position: Option<Position>,
    pub transition: Option<String>,
    pub duration: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HideStmt {
    pub identifier: String,
    pub transition: Option<String>,
    pub duration: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SayStmt {
    pub speaker: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceOption {
    pub text: String,
    pub condition: Option<Expr>,
    pub goto_target: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceStmt {
    pub options: Vec<ChoiceOption>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfStmt {
    pub condition: Expr,
    pub then_branch: Vec<Stmt>,
    pub else_branch: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GotoStmt {
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitStmt {
    pub duration: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Music,
    Sound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayStmt {
    pub media: MediaKind,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopStmt {
    pub fadeout: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetStmt {
    pub variable: String,
    pub value: Expr,
    pub is_flag: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionStmt {
    pub kind: String,
    pub duration: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveStmt {
    pub character_id: String,
    pub position: Position,
    pub custom_x: Option<f32>,
    pub custom_y: Option<f32>,
    pub duration: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelStmt {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Value),
    Identifier(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    Property {
        object: Box<Expr>,
        property: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}
