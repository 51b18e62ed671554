//! AST to bytecode compiler.
//!
//! Mechanics worth knowing before touching this file:
//!
//! * Strings are interned: the first occurrence claims an index, later equal
//!   strings reuse it.
//! * Forward jumps are emitted with operand 0 and either patched immediately
//!   once the target IP is known (`patch_jump`) or queued on the pending list
//!   for resolution against named labels at the end of compilation. Patching
//!   bounds-checks the instruction index; a violation is a compiler bug, not
//!   a user error, and is reported as `Internal`.
//! * Float operands are stored as IEEE 754 bit patterns
//!   ([`nm_bytecode::serialize_float`]), which keeps emitted bytecode
//!   byte-identical across hosts.
//! * Multiple source files compile into one artifact: each unit appends to
//!   the same instruction stream (terminated by its own HALT) and shares the
//!   string table and label namespace, so `goto` works across files.

use std::collections::BTreeMap;

use crate::ast::*;
use crate::token::Location;
use crate::validator::similar_names;
use nm_bytecode::{serialize_float, CompiledScript, Instruction, OpCode, SourceLoc, Value};
use thiserror::Error;

/// Hard cap on options in a single choice statement.
pub const MAX_CHOICE_OPTIONS: usize = 256;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("{location}: goto target '{target}' is not defined{}", format_suggestions(.suggestions))]
    InvalidGotoTarget {
        target: String,
        suggestions: Vec<String>,
        location: Location,
    },
    #[error("{location}: choice has {actual} options (maximum allowed: {limit})")]
    TooManyChoices {
        actual: usize,
        limit: usize,
        location: Location,
    },
    #[error("internal compiler error: {0}")]
    Internal(String),
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!("; did you mean {}?", suggestions.join(", "))
    }
}

struct PendingJump {
    instr_index: u32,
    target: String,
    location: Location,
}

#[derive(Default)]
pub struct Compiler {
    output: CompiledScript,
    labels: BTreeMap<String, u32>,
    pending_jumps: Vec<PendingJump>,
    errors: Vec<CompileError>,
    current_scene: String,
    source_file: String,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a single program.
    pub fn compile(
        program: &Program,
        source_file: &str,
    ) -> Result<CompiledScript, Vec<CompileError>> {
        let mut compiler = Self::new();
        compiler.add_unit(program, source_file);
        compiler.finish()
    }

    /// Append one source unit to the artifact under construction.
    pub fn add_unit(&mut self, program: &Program, source_file: &str) {
        self.source_file = source_file.to_string();
        for decl in &program.characters {
            self.output.characters.insert(
                decl.id.clone(),
                nm_bytecode::CharacterDecl {
                    id: decl.id.clone(),
                    display_name: decl.display_name.clone(),
                    color: decl.color.clone().unwrap_or_default(),
                },
            );
        }
        for scene in &program.scenes {
            self.compile_scene(scene);
        }
        for stmt in &program.global_statements {
            self.compile_statement(stmt);
        }
        self.emit(OpCode::Halt, 0);
    }

    /// Resolve pending jumps and hand over the artifact.
    pub fn finish(mut self) -> Result<CompiledScript, Vec<CompileError>> {
        let pending = std::mem::take(&mut self.pending_jumps);
        for jump in pending {
            if jump.instr_index as usize >= self.output.instructions.len() {
                self.errors.push(CompileError::Internal(format!(
                    "pending jump records instruction {} but the program has {}",
                    jump.instr_index,
                    self.output.instructions.len()
                )));
                continue;
            }
            match self.labels.get(&jump.target) {
                Some(&target_ip) => {
                    self.output.instructions[jump.instr_index as usize].operand = target_ip;
                }
                None => {
                    let suggestions =
                        similar_names(&jump.target, self.labels.keys().map(String::as_str));
                    self.errors.push(CompileError::InvalidGotoTarget {
                        target: jump.target,
                        suggestions,
                        location: jump.location,
                    });
                }
            }
        }
        if self.errors.is_empty() {
            Ok(self.output)
        } else {
            Err(self.errors)
        }
    }

    // --- emission helpers ---------------------------------------------------

    fn ip(&self) -> u32 {
        self.output.instructions.len() as u32
    }

    fn emit(&mut self, opcode: OpCode, operand: u32) {
        self.output.instructions.push(Instruction::new(opcode, operand));
    }

    fn emit_at(&mut self, opcode: OpCode, operand: u32, location: Location) {
        let ip = self.ip();
        self.emit(opcode, operand);
        if location.line > 0 {
            self.output.source_map.insert(
                ip,
                SourceLoc {
                    file: self.source_file.clone(),
                    line: location.line,
                    column: location.column,
                    scene: self.current_scene.clone(),
                },
            );
        }
    }

    /// Emit a jump with a placeholder operand; returns its index for
    /// [`Self::patch_jump`].
    fn emit_jump(&mut self, opcode: OpCode) -> u32 {
        let index = self.ip();
        self.emit(opcode, 0);
        index
    }

    /// Point a previously emitted jump at the current IP.
    fn patch_jump(&mut self, jump_index: u32) {
        let target = self.ip();
        match self.output.instructions.get_mut(jump_index as usize) {
            Some(instr) => instr.operand = target,
            None => self.errors.push(CompileError::Internal(format!(
                "patch_jump({jump_index}) is out of bounds for {target} instructions"
            ))),
        }
    }

    fn add_string(&mut self, s: &str) -> u32 {
        if let Some(index) = self.output.string_table.iter().position(|e| e == s) {
            return index as u32;
        }
        self.output.string_table.push(s.to_string());
        (self.output.string_table.len() - 1) as u32
    }

    // --- declarations -------------------------------------------------------

    fn compile_scene(&mut self, scene: &SceneDecl) {
        let entry = self.ip();
        self.output.scene_entry_points.insert(scene.name.clone(), entry);
        self.labels.insert(scene.name.clone(), entry);
        self.current_scene = scene.name.clone();
        for stmt in &scene.body {
            self.compile_statement(stmt);
        }
        self.current_scene.clear();
    }

    // --- statements ---------------------------------------------------------

    fn compile_statement(&mut self, stmt: &Stmt) {
        let loc = stmt.location;
        match &stmt.kind {
            StmtKind::Show(s) => self.compile_show(s, loc),
            StmtKind::Hide(s) => self.compile_hide(s, loc),
            StmtKind::Say(s) => self.compile_say(s, loc),
            StmtKind::Choice(s) => self.compile_choice(s, loc),
            StmtKind::If(s) => self.compile_if(s),
            StmtKind::Goto(s) => self.compile_goto(s, loc),
            StmtKind::Wait(s) => self.emit_at(OpCode::Wait, serialize_float(s.duration), loc),
            StmtKind::Play(s) => {
                let res = self.add_string(&s.resource);
                let opcode = match s.media {
                    MediaKind::Sound => OpCode::PlaySound,
                    MediaKind::Music => OpCode::PlayMusic,
                };
                self.emit_at(opcode, res, loc);
            }
            StmtKind::Stop(s) => {
                if let Some(fadeout) = s.fadeout {
                    self.emit(OpCode::PushFloat, serialize_float(fadeout));
                }
                self.emit_at(OpCode::StopMusic, 0, loc);
            }
            StmtKind::Set(s) => {
                self.compile_expression(&s.value);
                let name = self.add_string(&s.variable);
                if s.is_flag {
                    self.emit_at(OpCode::SetFlag, name, loc);
                } else {
                    self.emit_at(OpCode::StoreGlobal, name, loc);
                }
            }
            StmtKind::Transition(s) => {
                let kind = self.add_string(&s.kind);
                self.emit(OpCode::PushFloat, serialize_float(s.duration));
                self.emit_at(OpCode::Transition, kind, loc);
            }
            StmtKind::Move(s) => self.compile_move(s, loc),
            StmtKind::Label(s) => {
                let ip = self.ip();
                self.labels.insert(s.name.clone(), ip);
            }
            StmtKind::Block(body) => {
                for inner in body {
                    self.compile_statement(inner);
                }
            }
            StmtKind::Expression(expr) => {
                self.compile_expression(expr);
                self.emit(OpCode::Pop, 0);
            }
        }
    }

    fn compile_show(&mut self, stmt: &ShowStmt, loc: Location) {
        match stmt.target {
            ShowTarget::Background => {
                let res = self.add_string(stmt.resource.as_deref().unwrap_or(""));
                self.emit_at(OpCode::ShowBackground, res, loc);
            }
            ShowTarget::Character | ShowTarget::Sprite => {
                let id = self.add_string(&stmt.identifier);
                self.emit(OpCode::PushString, id);
                let code = stmt.position.unwrap_or(Position::Center).code();
                self.emit(OpCode::PushInt, code as u32);
                self.emit_at(OpCode::ShowCharacter, id, loc);
            }
        }
        self.compile_transition_tail(stmt.transition.as_deref(), stmt.duration);
    }

    fn compile_hide(&mut self, stmt: &HideStmt, loc: Location) {
        let id = self.add_string(&stmt.identifier);
        self.emit_at(OpCode::HideCharacter, id, loc);
        self.compile_transition_tail(stmt.transition.as_deref(), stmt.duration);
    }

    fn compile_transition_tail(&mut self, transition: Option<&str>, duration: Option<f32>) {
        if let Some(name) = transition {
            let kind = self.add_string(name);
            self.emit(OpCode::PushFloat, serialize_float(duration.unwrap_or(0.0)));
            self.emit(OpCode::Transition, kind);
        }
    }

    fn compile_say(&mut self, stmt: &SayStmt, loc: Location) {
        let text = self.add_string(&stmt.text);
        match &stmt.speaker {
            Some(speaker) => {
                let idx = self.add_string(speaker);
                self.emit(OpCode::PushString, idx);
            }
            None => self.emit(OpCode::PushNull, 0),
        }
        self.emit_at(OpCode::Say, text, loc);
    }

    /// Choices compile to a jump table over the host-selected index:
    ///
    /// ```text
    /// PUSH_INT n; PUSH_STRING t0 .. tn-1; CHOICE n
    /// ; host resolves, signal_choice pushes the selected index
    /// for each option i:
    ///   DUP; PUSH_INT i; EQ; JUMP_IF_NOT skip_i
    ///   POP
    ///   [condition; JUMP_IF_NOT after_cond]
    ///   body | JUMP goto_target (pending)
    ///   [after_cond:]
    ///   JUMP end
    ///   skip_i:
    /// POP              ; discard unmatched selection
    /// end:
    /// ```
    fn compile_choice(&mut self, stmt: &ChoiceStmt, loc: Location) {
        if stmt.options.len() > MAX_CHOICE_OPTIONS {
            self.errors.push(CompileError::TooManyChoices {
                actual: stmt.options.len(),
                limit: MAX_CHOICE_OPTIONS,
                location: loc,
            });
            return;
        }

        self.emit(OpCode::PushInt, stmt.options.len() as u32);
        for option in &stmt.options {
            let text = self.add_string(&option.text);
            self.emit(OpCode::PushString, text);
        }
        self.emit_at(OpCode::Choice, stmt.options.len() as u32, loc);

        let mut end_jumps = Vec::with_capacity(stmt.options.len());
        for (i, option) in stmt.options.iter().enumerate() {
            self.emit(OpCode::Dup, 0);
            self.emit(OpCode::PushInt, i as u32);
            self.emit(OpCode::Eq, 0);
            let skip = self.emit_jump(OpCode::JumpIfNot);

            self.emit(OpCode::Pop, 0);

            let cond_jump = option.condition.as_ref().map(|condition| {
                self.compile_expression(condition);
                self.emit_jump(OpCode::JumpIfNot)
            });

            if let Some(target) = &option.goto_target {
                let index = self.emit_jump(OpCode::Jump);
                self.pending_jumps.push(PendingJump {
                    instr_index: index,
                    target: target.clone(),
                    location: loc,
                });
            } else {
                for inner in &option.body {
                    self.compile_statement(inner);
                }
            }

            if let Some(cond_jump) = cond_jump {
                self.patch_jump(cond_jump);
            }

            end_jumps.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(skip);
        }

        self.emit(OpCode::Pop, 0);
        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    fn compile_if(&mut self, stmt: &IfStmt) {
        self.compile_expression(&stmt.condition);
        let else_jump = self.emit_jump(OpCode::JumpIfNot);
        for inner in &stmt.then_branch {
            self.compile_statement(inner);
        }
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        for inner in &stmt.else_branch {
            self.compile_statement(inner);
        }
        self.patch_jump(end_jump);
    }

    fn compile_goto(&mut self, stmt: &GotoStmt, loc: Location) {
        let index = self.ip();
        self.emit_at(OpCode::GotoScene, 0, loc);
        self.pending_jumps.push(PendingJump {
            instr_index: index,
            target: stmt.target.clone(),
            location: loc,
        });
    }

    fn compile_move(&mut self, stmt: &MoveStmt, loc: Location) {
        let id = self.add_string(&stmt.character_id);
        self.emit(OpCode::PushString, id);
        self.emit(OpCode::PushInt, stmt.position.code() as u32);
        if stmt.position == Position::Custom {
            let x = stmt.custom_x.unwrap_or(0.5);
            let y = stmt.custom_y.unwrap_or(0.5);
            self.emit(OpCode::PushFloat, serialize_float(x));
            self.emit(OpCode::PushFloat, serialize_float(y));
        }
        self.emit(OpCode::PushFloat, serialize_float(stmt.duration));
        self.emit_at(OpCode::MoveCharacter, id, loc);
    }

    // --- expressions --------------------------------------------------------

    fn compile_expression(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Literal(value) => self.compile_literal(value),
            ExprKind::Identifier(name) => {
                let idx = self.add_string(name);
                self.emit(OpCode::LoadGlobal, idx);
            }
            ExprKind::Binary { op, left, right } => self.compile_binary(*op, left, right),
            ExprKind::Unary { op, operand } => {
                self.compile_expression(operand);
                match op {
                    UnaryOp::Neg => self.emit(OpCode::Neg, 0),
                    UnaryOp::Not => self.emit(OpCode::Not, 0),
                }
            }
            ExprKind::Call { callee, args } => {
                for arg in args {
                    self.compile_expression(arg);
                }
                let idx = self.add_string(callee);
                self.emit(OpCode::Call, idx);
            }
            ExprKind::Property { object, property } => {
                self.compile_expression(object);
                let idx = self.add_string(property);
                self.emit(OpCode::PushString, idx);
            }
        }
    }

    fn compile_literal(&mut self, value: &Value) {
        match value {
            Value::Null => self.emit(OpCode::PushNull, 0),
            Value::Int(v) => self.emit(OpCode::PushInt, *v as u32),
            Value::Float(v) => self.emit(OpCode::PushFloat, serialize_float(*v)),
            Value::Bool(b) => self.emit(OpCode::PushBool, u32::from(*b)),
            Value::String(s) => {
                let idx = self.add_string(s);
                self.emit(OpCode::PushString, idx);
            }
        }
    }

    fn compile_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) {
        self.compile_expression(left);

        // `and`/`or` short-circuit: the left value is duplicated so it can
        // survive as the result when the right side is skipped.
        match op {
            BinaryOp::And => {
                self.emit(OpCode::Dup, 0);
                let end = self.emit_jump(OpCode::JumpIfNot);
                self.emit(OpCode::Pop, 0);
                self.compile_expression(right);
                self.patch_jump(end);
                return;
            }
            BinaryOp::Or => {
                self.emit(OpCode::Dup, 0);
                let end = self.emit_jump(OpCode::JumpIf);
                self.emit(OpCode::Pop, 0);
                self.compile_expression(right);
                self.patch_jump(end);
                return;
            }
            _ => {}
        }

        self.compile_expression(right);
        let opcode = match op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::Div => OpCode::Div,
            BinaryOp::Mod => OpCode::Mod,
            BinaryOp::Eq => OpCode::Eq,
            BinaryOp::Ne => OpCode::Ne,
            BinaryOp::Lt => OpCode::Lt,
            BinaryOp::Le => OpCode::Le,
            BinaryOp::Gt => OpCode::Gt,
            BinaryOp::Ge => OpCode::Ge,
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        };
        self.emit(opcode, 0);
    }
}
