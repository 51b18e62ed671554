//! The stack machine.
//!
//! Execution is strictly cooperative: `step` never blocks and never yields
//! the thread. Opcodes that need the host (dialogue, choices, timers, scene
//! transitions) invoke a registered callback and raise the `waiting` flag;
//! the host clears it with [`Vm::signal_continue`] / [`Vm::signal_choice`]
//! before the next step can make progress.
//!
//! Jump encoding: a taken jump to target `t > 0` sets `ip = t - 1` so the
//! post-instruction increment lands on `t`. A jump to 0 sets `ip = 0` and
//! suppresses the next increment instead, since 0 has no predecessor.

use std::collections::HashMap;

use nm_bytecode::{deserialize_float, CompiledScript, Instruction, OpCode, Value};
use thiserror::Error;

use crate::debugger::VmDebugger;
use crate::guard::{SecurityGuard, SecurityLimits, SecurityViolation};

pub type HostCallback = Box<dyn FnMut(&[Value])>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("cannot load an empty program")]
    EmptyProgram,
    #[error("instruction pointer {requested} is outside the program ({len} instructions)")]
    InvalidJumpTarget { requested: u32, len: usize },
}

#[derive(Default)]
pub struct Vm {
    program: Vec<Instruction>,
    string_table: Vec<String>,
    scene_names_by_entry: HashMap<u32, String>,

    ip: u32,
    stack: Vec<Value>,
    globals: HashMap<String, Value>,
    flags: HashMap<String, bool>,

    running: bool,
    paused: bool,
    waiting: bool,
    halted: bool,
    skip_next_increment: bool,
    quit_requested: bool,
    choice_result: i32,

    callbacks: HashMap<OpCode, HostCallback>,
    guard: SecurityGuard,
    debugger: Option<VmDebugger>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_limits(SecurityLimits::default())
    }

    pub fn with_limits(limits: SecurityLimits) -> Self {
        Self {
            guard: SecurityGuard::new(limits),
            choice_result: -1,
            ..Default::default()
        }
    }

    /// Load a compiled script. Also remembers scene entry points so the
    /// debugger can name call-stack frames.
    pub fn load(&mut self, script: &CompiledScript) -> Result<(), VmError> {
        if script.instructions.is_empty() {
            return Err(VmError::EmptyProgram);
        }
        self.program = script.instructions.clone();
        self.string_table = script.string_table.clone();
        self.scene_names_by_entry = script
            .scene_entry_points
            .iter()
            .map(|(name, &entry)| (entry, name.clone()))
            .collect();
        self.reset();
        Ok(())
    }

    /// Load raw instructions and strings, for tests and tooling.
    pub fn load_parts(
        &mut self,
        program: Vec<Instruction>,
        string_table: Vec<String>,
    ) -> Result<(), VmError> {
        if program.is_empty() {
            return Err(VmError::EmptyProgram);
        }
        self.program = program;
        self.string_table = string_table;
        self.scene_names_by_entry.clear();
        self.reset();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.ip = 0;
        self.stack.clear();
        self.running = false;
        self.paused = false;
        self.waiting = false;
        self.halted = false;
        self.skip_next_increment = false;
        self.quit_requested = false;
        self.choice_result = -1;
        self.guard.reset();
    }

    // --- state inspection ---------------------------------------------------

    pub fn ip(&self) -> u32 {
        self.ip
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn choice_result(&self) -> i32 {
        self.choice_result
    }

    pub fn globals(&self) -> &HashMap<String, Value> {
        &self.globals
    }

    pub fn flags(&self) -> &HashMap<String, bool> {
        &self.flags
    }

    pub fn violations(&self) -> &[SecurityViolation] {
        self.guard.violations()
    }

    pub fn program_len(&self) -> usize {
        self.program.len()
    }

    pub fn scene_name_at(&self, entry_ip: u32) -> Option<&str> {
        self.scene_names_by_entry.get(&entry_ip).map(String::as_str)
    }

    // --- host / debugger API ------------------------------------------------

    pub fn register_callback<F>(&mut self, opcode: OpCode, callback: F)
    where
        F: FnMut(&[Value]) + 'static,
    {
        self.callbacks.insert(opcode, Box::new(callback));
    }

    pub fn attach_debugger(&mut self, mut debugger: VmDebugger) {
        debugger.on_attach();
        self.debugger = Some(debugger);
    }

    pub fn detach_debugger(&mut self) -> Option<VmDebugger> {
        self.debugger.take()
    }

    pub fn debugger(&self) -> Option<&VmDebugger> {
        self.debugger.as_ref()
    }

    pub fn debugger_mut(&mut self) -> Option<&mut VmDebugger> {
        self.debugger.as_mut()
    }

    /// Checked IP override used by the debugger and the script runtime for
    /// scene transitions. Rejects out-of-range targets; un-halts on success.
    pub fn set_ip(&mut self, ip: u32) -> Result<(), VmError> {
        if (ip as usize) < self.program.len() {
            self.ip = ip;
            self.halted = false;
            Ok(())
        } else {
            tracing::warn!(target: "vm", requested = ip, len = self.program.len(),
                "refusing to set instruction pointer out of bounds");
            Err(VmError::InvalidJumpTarget {
                requested: ip,
                len: self.program.len(),
            })
        }
    }

    pub fn get_variable(&self, name: &str) -> Value {
        self.globals.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        if let Some(dbg) = self.debugger.as_mut() {
            let old = self.globals.get(name).cloned().unwrap_or(Value::Null);
            dbg.track_variable_change(name, old, value.clone(), self.ip);
        }
        self.globals.insert(name.to_string(), value);
    }

    pub fn get_flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn set_flag(&mut self, name: &str, value: bool) {
        self.flags.insert(name.to_string(), value);
    }

    pub fn request_quit(&mut self) {
        self.quit_requested = true;
    }

    // --- execution ----------------------------------------------------------

    /// Execute one instruction. Returns `false` when no progress was made
    /// (halted, paused, waiting, quit requested, or a debugger pause).
    pub fn step(&mut self) -> bool {
        if self.quit_requested {
            self.halted = true;
            self.running = false;
            return false;
        }
        if self.halted || self.paused || self.waiting {
            return false;
        }
        if self.ip as usize >= self.program.len() {
            // Walking off the end is an orderly stop, not a fault, when it
            // lands exactly on the boundary; past it is a bug we log.
            if self.ip as usize > self.program.len() {
                tracing::error!(target: "vm", ip = self.ip, len = self.program.len(),
                    "instruction pointer out of bounds");
            }
            self.halted = true;
            self.running = false;
            return false;
        }

        if let Some(dbg) = self.debugger.as_mut() {
            if !dbg.before_instruction(self.ip, &self.globals, &self.flags) {
                self.paused = true;
                return false;
            }
        }

        if !self.guard.count_instruction(self.ip) {
            self.halt_on_violation();
            return false;
        }

        let instr = self.program[self.ip as usize];
        self.execute(instr);

        if let Some(dbg) = self.debugger.as_mut() {
            dbg.after_instruction(self.ip);
        }

        if !self.skip_next_increment {
            self.ip += 1;
        } else {
            self.skip_next_increment = false;
        }

        !self.halted
    }

    /// Start a new execution burst: resets the guard's per-burst instruction
    /// and loop budgets. `run` does this itself; a host that drives the VM
    /// with bare `step` calls (the script runtime's tick loop) calls this
    /// once per tick, otherwise the budgets degrade into whole-session caps.
    pub fn begin_step_burst(&mut self) {
        self.guard.begin_run();
    }

    /// Run until something stops us: halt, pause, wait, or a guard trip.
    pub fn run(&mut self) {
        self.running = true;
        self.paused = false;
        self.guard.begin_run();
        while self.running && !self.halted && !self.paused && !self.waiting {
            if !self.step() {
                break;
            }
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
        if self.running && !self.waiting {
            self.run();
        }
    }

    /// Host acknowledgement for SAY / WAIT / MOVE / scene transitions.
    pub fn signal_continue(&mut self) {
        self.waiting = false;
        if self.running && !self.paused {
            self.run();
        }
    }

    /// Host resolution of a CHOICE: pushes the selected index for the
    /// compiled jump table and resumes.
    pub fn signal_choice(&mut self, choice: i32) {
        self.choice_result = choice;
        self.push(Value::Int(choice));
        self.waiting = false;
        if self.running && !self.paused {
            self.run();
        }
    }

    fn halt_on_violation(&mut self) {
        self.halted = true;
        self.running = false;
    }

    fn push(&mut self, value: Value) {
        if !self.guard.check_stack_push(self.stack.len(), self.ip) {
            self.halt_on_violation();
            return;
        }
        if let Value::String(s) = &value {
            if !self.guard.check_string(s.len(), self.ip) {
                self.halt_on_violation();
                return;
            }
        }
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => {
                tracing::warn!(target: "vm", ip = self.ip, "stack underflow");
                Value::Null
            }
        }
    }

    /// String-table lookup. An out-of-range index means corrupted bytecode;
    /// the VM halts rather than propagate garbage.
    fn get_string(&mut self, index: u32) -> Option<String> {
        match self.string_table.get(index as usize) {
            Some(s) => Some(s.clone()),
            None => {
                tracing::error!(target: "vm", index, table = self.string_table.len(), ip = self.ip,
                    "invalid string table index");
                self.halt_on_violation();
                None
            }
        }
    }

    /// Apply the shared jump rule; halts on out-of-range targets.
    fn jump_to(&mut self, target: u32) {
        if target as usize >= self.program.len() {
            tracing::error!(target: "vm", requested = target, len = self.program.len(), ip = self.ip,
                "jump target out of bounds");
            self.halt_on_violation();
            return;
        }
        if target <= self.ip && !self.guard.count_backward_jump(self.ip) {
            self.halt_on_violation();
            return;
        }
        if target > 0 {
            self.ip = target - 1;
        } else {
            self.ip = 0;
            self.skip_next_increment = true;
        }
    }

    fn execute(&mut self, instr: Instruction) {
        match instr.opcode {
            OpCode::Nop => {}

            OpCode::Halt => {
                self.halted = true;
                self.running = false;
                self.notify_scene_exit();
            }

            OpCode::Jump => self.jump_to(instr.operand),

            OpCode::JumpIf => {
                if self.pop().as_bool() {
                    self.jump_to(instr.operand);
                }
            }

            OpCode::JumpIfNot => {
                if !self.pop().as_bool() {
                    self.jump_to(instr.operand);
                }
            }

            OpCode::PushInt => self.push(Value::Int(instr.operand as i32)),
            OpCode::PushFloat => self.push(Value::Float(deserialize_float(instr.operand))),
            OpCode::PushString => {
                if let Some(s) = self.get_string(instr.operand) {
                    self.push(Value::String(s));
                }
            }
            OpCode::PushBool => self.push(Value::Bool(instr.operand != 0)),
            OpCode::PushNull => self.push(Value::Null),

            OpCode::Pop => {
                self.pop();
            }
            OpCode::Dup => {
                if let Some(top) = self.stack.last().cloned() {
                    self.push(top);
                }
            }

            OpCode::LoadGlobal => {
                if let Some(name) = self.get_string(instr.operand) {
                    // Variables shadow flags; a flag read surfaces as Bool.
                    let value = match self.globals.get(&name) {
                        Some(v) => v.clone(),
                        None => match self.flags.get(&name) {
                            Some(&f) => Value::Bool(f),
                            None => Value::Null,
                        },
                    };
                    self.push(value);
                }
            }

            OpCode::StoreGlobal => {
                if let Some(name) = self.get_string(instr.operand) {
                    let value = self.pop();
                    if !self.globals.contains_key(&name)
                        && !self.guard.check_variable_count(self.globals.len(), self.ip)
                    {
                        self.halt_on_violation();
                        return;
                    }
                    self.set_variable(&name, value);
                }
            }

            OpCode::SetFlag => {
                if let Some(name) = self.get_string(instr.operand) {
                    let value = self.pop().as_bool();
                    self.flags.insert(name, value);
                }
            }

            OpCode::CheckFlag => {
                if let Some(name) = self.get_string(instr.operand) {
                    let value = self.get_flag(&name);
                    self.push(Value::Bool(value));
                }
            }

            OpCode::Add => {
                let b = self.pop();
                let a = self.pop();
                use nm_bytecode::ValueType::*;
                let result = match (a.value_type(), b.value_type()) {
                    (String, _) | (_, String) => Value::String(a.as_string() + &b.as_string()),
                    (Float, _) | (_, Float) => Value::Float(a.as_float() + b.as_float()),
                    _ => Value::Int(a.as_int().wrapping_add(b.as_int())),
                };
                self.push(result);
            }

            OpCode::Sub => self.numeric_binop(|x, y| x - y, i32::wrapping_sub),
            OpCode::Mul => self.numeric_binop(|x, y| x * y, i32::wrapping_mul),

            OpCode::Div => {
                let b = self.pop();
                let a = self.pop();
                let divisor = b.as_float();
                if divisor != 0.0 {
                    self.push(Value::Float(a.as_float() / divisor));
                } else {
                    tracing::error!(target: "vm", ip = self.ip, "division by zero");
                    self.push(Value::Int(0));
                }
            }

            OpCode::Mod => {
                let b = self.pop();
                let a = self.pop();
                let divisor = b.as_int();
                if divisor != 0 {
                    self.push(Value::Int(a.as_int().wrapping_rem(divisor)));
                } else {
                    tracing::error!(target: "vm", ip = self.ip, "modulo by zero");
                    self.push(Value::Int(0));
                }
            }

            OpCode::Neg => {
                let a = self.pop();
                let result = match a {
                    Value::Float(v) => Value::Float(-v),
                    other => Value::Int(other.as_int().wrapping_neg()),
                };
                self.push(result);
            }

            OpCode::Eq => self.compare(|a, b| a.loose_eq(b)),
            OpCode::Ne => self.compare(|a, b| !a.loose_eq(b)),
            OpCode::Lt => self.compare(|a, b| a.loose_lt(b)),
            OpCode::Le => self.compare(|a, b| a.loose_le(b)),
            OpCode::Gt => self.compare(|a, b| b.loose_lt(a)),
            OpCode::Ge => self.compare(|a, b| b.loose_le(a)),

            OpCode::And => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a.as_bool() && b.as_bool()));
            }
            OpCode::Or => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a.as_bool() || b.as_bool()));
            }
            OpCode::Not => {
                let a = self.pop();
                self.push(Value::Bool(!a.as_bool()));
            }

            OpCode::Call => {
                let Some(name) = self.get_string(instr.operand) else {
                    return;
                };
                if !self.guard.check_native_call(&name, self.ip) {
                    self.halt_on_violation();
                    return;
                }
                let args = vec![Value::String(name.clone())];
                if let Some(callback) = self.callbacks.get_mut(&OpCode::Call) {
                    callback(&args);
                } else {
                    tracing::warn!(target: "vm", function = %name,
                        "no callback registered for native call");
                }
                self.push(Value::Null);
            }

            OpCode::Return => {
                self.halted = true;
                self.notify_scene_exit();
            }

            opcode if opcode.is_host_command() => self.execute_host_command(instr),

            // Every remaining discriminant is a host command and lands in the
            // guard arm above; the compiler just cannot see through the guard.
            other => {
                tracing::warn!(target: "vm", opcode = other.mnemonic(), ip = self.ip, "unknown opcode");
            }
        }
    }

    fn numeric_binop(&mut self, float_op: fn(f32, f32) -> f32, int_op: fn(i32, i32) -> i32) {
        let b = self.pop();
        let a = self.pop();
        use nm_bytecode::ValueType::Float;
        let result = if a.value_type() == Float || b.value_type() == Float {
            Value::Float(float_op(a.as_float(), b.as_float()))
        } else {
            Value::Int(int_op(a.as_int(), b.as_int()))
        };
        self.push(result);
    }

    fn compare(&mut self, predicate: fn(&Value, &Value) -> bool) {
        let b = self.pop();
        let a = self.pop();
        self.push(Value::Bool(predicate(&a, &b)));
    }

    /// Pop like `pop`, but silent: host-command argument gathering tolerates
    /// missing optional operands.
    fn pop_arg(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Null)
    }

    fn execute_host_command(&mut self, instr: Instruction) {
        let opcode = instr.opcode;
        let mut args: Vec<Value> = Vec::new();

        match opcode {
            OpCode::ShowBackground | OpCode::HideCharacter | OpCode::PlaySound | OpCode::PlayMusic => {
                let Some(s) = self.get_string(instr.operand) else { return };
                args.push(Value::String(s));
            }

            OpCode::ShowCharacter => {
                let pos = self.pop_arg();
                let id = self.pop_arg();
                let id = if id.is_null() {
                    match self.get_string(instr.operand) {
                        Some(s) => Value::String(s),
                        None => return,
                    }
                } else {
                    id
                };
                let pos = if pos.is_null() { Value::Int(1) } else { pos };
                args.push(id);
                args.push(pos);
            }

            OpCode::MoveCharacter => {
                // Stack: duration, [custom_y, custom_x when pos == 3], pos, id.
                let duration = self.pop_arg();
                let pos = self.pop_arg();
                let pos_code = match &pos {
                    Value::Int(v) => *v,
                    _ => 1,
                };
                let (custom_x, custom_y) = if pos_code == 3 {
                    let y = self.pop_arg();
                    let x = self.pop_arg();
                    (Some(x), Some(y))
                } else {
                    (None, None)
                };
                let id = self.pop_arg();
                let id = if id.is_null() {
                    match self.get_string(instr.operand) {
                        Some(s) => Value::String(s),
                        None => return,
                    }
                } else {
                    id
                };
                args.push(id);
                args.push(pos);
                if let (Some(x), Some(y)) = (custom_x, custom_y) {
                    args.push(x);
                    args.push(y);
                }
                args.push(duration);
            }

            OpCode::Say => {
                let speaker = self.pop_arg();
                let Some(text) = self.get_string(instr.operand) else { return };
                args.push(Value::String(text));
                args.push(speaker);
            }

            OpCode::Choice => {
                let count = instr.operand;
                let mut options = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    options.push(self.pop_arg());
                }
                self.pop_arg(); // the pushed count
                options.reverse();
                args.push(Value::Int(count as i32));
                args.extend(options);
            }

            OpCode::Wait => {
                args.push(Value::Float(deserialize_float(instr.operand)));
            }

            OpCode::Transition => {
                let duration = self.pop_arg();
                let Some(kind) = self.get_string(instr.operand) else { return };
                args.push(Value::String(kind));
                args.push(duration);
            }

            OpCode::StopMusic => {
                if !self.stack.is_empty() {
                    args.push(self.pop_arg());
                }
            }

            OpCode::GotoScene => {
                args.push(Value::Int(instr.operand as i32));
                self.notify_scene_entry(instr.operand);
            }

            _ => unreachable!("not a host command"),
        }

        if let Some(callback) = self.callbacks.get_mut(&opcode) {
            callback(&args);
        }

        // Commands that surrender control until the host signals back. A
        // scene transition also waits: the host re-points the IP before
        // resuming, so running on would execute the wrong instruction.
        if matches!(
            opcode,
            OpCode::Say | OpCode::Choice | OpCode::Wait | OpCode::MoveCharacter | OpCode::GotoScene
        ) {
            self.waiting = true;
        }
    }

    fn notify_scene_entry(&mut self, target_ip: u32) {
        let Some(name) = self.scene_names_by_entry.get(&target_ip).cloned() else {
            return;
        };
        if let Some(dbg) = self.debugger.as_mut() {
            if !self
                .guard
                .check_call_depth(dbg.call_stack().len(), self.ip)
            {
                self.halted = true;
                self.running = false;
                return;
            }
            let source = dbg.source_location(self.ip).cloned();
            dbg.notify_scene_entered(&name, self.ip, self.ip + 1, source);
        }
    }

    fn notify_scene_exit(&mut self) {
        if let Some(dbg) = self.debugger.as_mut() {
            dbg.notify_scene_exited();
        }
    }
}
