//! VM debugger: breakpoints, stepping, call-stack and variable tracking.
//!
//! The debugger is a capability the VM holds, not a wrapper around it: the
//! VM calls [`VmDebugger::before_instruction`] ahead of every instruction
//! and a `false` return pauses execution. Conditional breakpoints evaluate
//! their expression with the NM Script expression parser against the live
//! globals/flags; no host code is ever evaluated.

use std::collections::{HashMap, HashSet, VecDeque};

use nm_bytecode::{CompiledScript, SourceLoc, Value};
use nm_lang::ast::{BinaryOp, Expr, ExprKind, UnaryOp};

/// Bound on the variable-change history ring buffer.
pub const MAX_VARIABLE_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    #[default]
    None,
    StepInto,
    StepOver,
    StepOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointKind {
    Normal,
    /// Pauses only when the expression evaluates truthy.
    Conditional(String),
    /// Logs the (interpolated) template and never pauses.
    Logpoint(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    pub id: u32,
    pub ip: u32,
    pub kind: BreakpointKind,
    pub enabled: bool,
    pub source: Option<SourceLoc>,
    pub hit_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableChange {
    pub name: String,
    pub old_value: Value,
    pub new_value: Value,
    pub ip: u32,
    pub source_line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallStackFrame {
    pub scene_name: String,
    pub ip_at_call: u32,
    pub return_ip: u32,
    pub source_file: Option<String>,
    pub source_line: Option<u32>,
}

type BreakpointHitFn = Box<dyn FnMut(&Breakpoint, u32)>;
type PausedFn = Box<dyn FnMut(u32, &str)>;
type VariableChangedFn = Box<dyn FnMut(&VariableChange)>;
type SceneFn = Box<dyn FnMut(&str)>;
type LogpointFn = Box<dyn FnMut(&str, u32)>;

#[derive(Default)]
pub struct VmDebugger {
    breakpoints: HashMap<u32, Breakpoint>,
    /// Fast lookup index; invariant: exactly the IPs of enabled breakpoints.
    breakpoint_ips: HashSet<u32>,
    source_map: HashMap<u32, SourceLoc>,
    call_stack: Vec<CallStackFrame>,
    variable_history: VecDeque<VariableChange>,
    next_breakpoint_id: u32,
    paused: bool,
    step_mode: StepMode,
    step_start_depth: usize,
    step_start_ip: Option<u32>,
    /// IP of the most recent pause. Consumed by the first
    /// `before_instruction` after resume so the same breakpoint does not
    /// immediately refire; a later loop back to the IP breaks again.
    last_pause_ip: Option<u32>,

    on_breakpoint_hit: Option<BreakpointHitFn>,
    on_paused: Option<PausedFn>,
    on_variable_changed: Option<VariableChangedFn>,
    on_scene_entered: Option<SceneFn>,
    on_scene_exited: Option<SceneFn>,
    on_logpoint: Option<LogpointFn>,
}

impl VmDebugger {
    pub fn new() -> Self {
        Self {
            next_breakpoint_id: 1,
            ..Default::default()
        }
    }

    pub(crate) fn on_attach(&mut self) {
        tracing::info!(target: "vm.debugger", breakpoints = self.breakpoints.len(), "debugger attached");
    }

    // --- breakpoint management ----------------------------------------------

    pub fn add_breakpoint(&mut self, ip: u32) -> u32 {
        self.insert_breakpoint(ip, BreakpointKind::Normal)
    }

    pub fn add_conditional_breakpoint(&mut self, ip: u32, condition: impl Into<String>) -> u32 {
        self.insert_breakpoint(ip, BreakpointKind::Conditional(condition.into()))
    }

    pub fn add_logpoint(&mut self, ip: u32, template: impl Into<String>) -> u32 {
        self.insert_breakpoint(ip, BreakpointKind::Logpoint(template.into()))
    }

    fn insert_breakpoint(&mut self, ip: u32, kind: BreakpointKind) -> u32 {
        let id = self.next_breakpoint_id;
        self.next_breakpoint_id += 1;
        let source = self.source_map.get(&ip).cloned();
        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                ip,
                kind,
                enabled: true,
                source,
                hit_count: 0,
            },
        );
        self.rebuild_ip_index();
        id
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> bool {
        let removed = self.breakpoints.remove(&id).is_some();
        if removed {
            self.rebuild_ip_index();
        }
        removed
    }

    pub fn set_breakpoint_enabled(&mut self, id: u32, enabled: bool) -> bool {
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return false;
        };
        bp.enabled = enabled;
        self.rebuild_ip_index();
        true
    }

    /// Flip enablement; returns the new state, or `false` for unknown ids.
    pub fn toggle_breakpoint(&mut self, id: u32) -> bool {
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return false;
        };
        bp.enabled = !bp.enabled;
        let state = bp.enabled;
        self.rebuild_ip_index();
        state
    }

    pub fn clear_all_breakpoints(&mut self) {
        self.breakpoints.clear();
        self.breakpoint_ips.clear();
    }

    pub fn has_breakpoint_at(&self, ip: u32) -> bool {
        self.breakpoint_ips.contains(&ip)
    }

    pub fn breakpoint(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    fn rebuild_ip_index(&mut self) {
        self.breakpoint_ips = self
            .breakpoints
            .values()
            .filter(|bp| bp.enabled)
            .map(|bp| bp.ip)
            .collect();
    }

    // --- execution control --------------------------------------------------

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn step_mode(&self) -> StepMode {
        self.step_mode
    }

    pub fn continue_execution(&mut self) {
        self.paused = false;
        self.step_mode = StepMode::None;
    }

    pub fn pause(&mut self) {
        self.paused = true;
        self.step_mode = StepMode::StepInto; // pause before the very next instruction
    }

    /// Pause on the very next instruction.
    pub fn step_into(&mut self) {
        self.step_mode = StepMode::StepInto;
        self.paused = false;
    }

    /// Run until control returns to at most the current call-stack depth at
    /// a new IP: a scene entered in between executes as one step.
    pub fn step_over(&mut self, current_ip: u32) {
        self.step_mode = StepMode::StepOver;
        self.step_start_depth = self.call_stack.len();
        self.step_start_ip = Some(current_ip);
        self.paused = false;
    }

    /// Run until the current scene frame is gone.
    pub fn step_out(&mut self) {
        self.step_mode = StepMode::StepOut;
        self.step_start_depth = self.call_stack.len();
        self.step_start_ip = None;
        self.paused = false;
    }

    // --- inspection ---------------------------------------------------------

    pub fn call_stack(&self) -> &[CallStackFrame] {
        &self.call_stack
    }

    pub fn current_scene(&self) -> Option<&str> {
        self.call_stack.last().map(|f| f.scene_name.as_str())
    }

    pub fn source_location(&self, ip: u32) -> Option<&SourceLoc> {
        self.source_map.get(&ip)
    }

    pub fn recent_variable_changes(&self, count: usize) -> Vec<&VariableChange> {
        self.variable_history.iter().rev().take(count).collect()
    }

    // --- source mapping -----------------------------------------------------

    pub fn load_source_map(&mut self, script: &CompiledScript) {
        self.source_map = script.source_map.clone();
    }

    pub fn set_source_mapping(&mut self, ip: u32, location: SourceLoc) {
        self.source_map.insert(ip, location);
    }

    pub fn clear_source_mappings(&mut self) {
        self.source_map.clear();
    }

    // --- callbacks ----------------------------------------------------------

    pub fn set_breakpoint_hit_callback(&mut self, f: impl FnMut(&Breakpoint, u32) + 'static) {
        self.on_breakpoint_hit = Some(Box::new(f));
    }

    pub fn set_paused_callback(&mut self, f: impl FnMut(u32, &str) + 'static) {
        self.on_paused = Some(Box::new(f));
    }

    pub fn set_variable_changed_callback(&mut self, f: impl FnMut(&VariableChange) + 'static) {
        self.on_variable_changed = Some(Box::new(f));
    }

    pub fn set_scene_entered_callback(&mut self, f: impl FnMut(&str) + 'static) {
        self.on_scene_entered = Some(Box::new(f));
    }

    pub fn set_scene_exited_callback(&mut self, f: impl FnMut(&str) + 'static) {
        self.on_scene_exited = Some(Box::new(f));
    }

    pub fn set_logpoint_callback(&mut self, f: impl FnMut(&str, u32) + 'static) {
        self.on_logpoint = Some(Box::new(f));
    }

    // --- hooks called by the VM --------------------------------------------

    /// Decide whether the VM may execute the instruction at `ip`. Returning
    /// `false` pauses the VM before execution.
    pub fn before_instruction(
        &mut self,
        ip: u32,
        globals: &HashMap<String, Value>,
        flags: &HashMap<String, bool>,
    ) -> bool {
        if self.last_pause_ip.take() == Some(ip) {
            return true;
        }
        if self.breakpoint_ips.contains(&ip) {
            if let Some(pause) = self.handle_breakpoints_at(ip, globals, flags) {
                if pause {
                    self.enter_paused(ip, "breakpoint");
                    return false;
                }
            }
        }

        match self.step_mode {
            StepMode::None => true,
            StepMode::StepInto => {
                self.enter_paused(ip, "step");
                false
            }
            StepMode::StepOver => {
                if self.call_stack.len() <= self.step_start_depth && Some(ip) != self.step_start_ip
                {
                    self.enter_paused(ip, "step-over");
                    false
                } else {
                    true
                }
            }
            StepMode::StepOut => {
                if self.call_stack.len() < self.step_start_depth {
                    self.enter_paused(ip, "step-out");
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn after_instruction(&mut self, _ip: u32) {}

    /// Returns `Some(true)` when a pausing breakpoint fired, `Some(false)`
    /// when only logpoints fired, `None` when nothing was enabled here.
    fn handle_breakpoints_at(
        &mut self,
        ip: u32,
        globals: &HashMap<String, Value>,
        flags: &HashMap<String, bool>,
    ) -> Option<bool> {
        let ids: Vec<u32> = self
            .breakpoints
            .values()
            .filter(|bp| bp.enabled && bp.ip == ip)
            .map(|bp| bp.id)
            .collect();
        let mut any = false;
        let mut pause = false;
        for id in ids {
            let kind = self.breakpoints[&id].kind.clone();
            match kind {
                BreakpointKind::Normal => {
                    self.record_hit(id, ip);
                    pause = true;
                }
                BreakpointKind::Conditional(expr) => {
                    if evaluate_condition(&expr, globals, flags) {
                        self.record_hit(id, ip);
                        pause = true;
                    }
                }
                BreakpointKind::Logpoint(template) => {
                    self.record_hit(id, ip);
                    let message = interpolate(&template, globals, flags);
                    tracing::info!(target: "vm.debugger", ip, message = %message, "logpoint");
                    if let Some(f) = self.on_logpoint.as_mut() {
                        f(&message, ip);
                    }
                }
            }
            any = true;
        }
        any.then_some(pause)
    }

    fn record_hit(&mut self, id: u32, ip: u32) {
        if let Some(bp) = self.breakpoints.get_mut(&id) {
            bp.hit_count += 1;
            let snapshot = bp.clone();
            if !matches!(snapshot.kind, BreakpointKind::Logpoint(_)) {
                if let Some(f) = self.on_breakpoint_hit.as_mut() {
                    f(&snapshot, ip);
                }
            }
        }
    }

    fn enter_paused(&mut self, ip: u32, reason: &str) {
        self.paused = true;
        self.step_mode = StepMode::None;
        self.last_pause_ip = Some(ip);
        if let Some(f) = self.on_paused.as_mut() {
            f(ip, reason);
        }
    }

    /// Record a `STORE_GLOBAL` in the bounded history ring.
    pub fn track_variable_change(&mut self, name: &str, old_value: Value, new_value: Value, ip: u32) {
        let change = VariableChange {
            name: name.to_string(),
            old_value,
            new_value,
            ip,
            source_line: self.source_map.get(&ip).map(|loc| loc.line),
        };
        if let Some(f) = self.on_variable_changed.as_mut() {
            f(&change);
        }
        self.variable_history.push_back(change);
        while self.variable_history.len() > MAX_VARIABLE_HISTORY {
            self.variable_history.pop_front();
        }
    }

    /// Scene transition observed by the VM. A `goto` back to a scene already
    /// on the stack unwinds to that frame instead of pushing, so loops do not
    /// grow the stack without bound.
    pub fn notify_scene_entered(
        &mut self,
        scene_name: &str,
        ip_at_call: u32,
        return_ip: u32,
        source: Option<SourceLoc>,
    ) {
        if let Some(pos) = self
            .call_stack
            .iter()
            .position(|f| f.scene_name == scene_name)
        {
            self.call_stack.truncate(pos + 1);
        } else {
            self.call_stack.push(CallStackFrame {
                scene_name: scene_name.to_string(),
                ip_at_call,
                return_ip,
                source_file: source.as_ref().map(|s| s.file.clone()),
                source_line: source.as_ref().map(|s| s.line),
            });
        }
        if let Some(f) = self.on_scene_entered.as_mut() {
            f(scene_name);
        }
    }

    pub fn notify_scene_exited(&mut self) {
        if let Some(frame) = self.call_stack.pop() {
            if let Some(f) = self.on_scene_exited.as_mut() {
                f(&frame.scene_name);
            }
        }
    }
}

/// Evaluate a breakpoint condition against the VM state. Parse failures and
/// unsupported constructs evaluate to false (never pause on garbage).
fn evaluate_condition(
    source: &str,
    globals: &HashMap<String, Value>,
    flags: &HashMap<String, bool>,
) -> bool {
    match nm_lang::parse_expression(source) {
        Ok(expr) => eval(&expr, globals, flags).as_bool(),
        Err(err) => {
            tracing::warn!(target: "vm.debugger", condition = source, %err,
                "breakpoint condition failed to parse");
            false
        }
    }
}

fn eval(expr: &Expr, globals: &HashMap<String, Value>, flags: &HashMap<String, bool>) -> Value {
    match &expr.kind {
        ExprKind::Literal(value) => value.clone(),
        ExprKind::Identifier(name) => match globals.get(name) {
            Some(v) => v.clone(),
            None => match flags.get(name) {
                Some(&f) => Value::Bool(f),
                None => Value::Null,
            },
        },
        ExprKind::Unary { op, operand } => {
            let v = eval(operand, globals, flags);
            match op {
                UnaryOp::Not => Value::Bool(!v.as_bool()),
                UnaryOp::Neg => match v {
                    Value::Float(f) => Value::Float(-f),
                    other => Value::Int(-other.as_int()),
                },
            }
        }
        ExprKind::Binary { op, left, right } => {
            // Conditions are side-effect free, so short-circuiting is purely
            // an evaluation-order nicety here.
            let l = eval(left, globals, flags);
            match op {
                BinaryOp::And => {
                    if !l.as_bool() {
                        return Value::Bool(false);
                    }
                    return Value::Bool(eval(right, globals, flags).as_bool());
                }
                BinaryOp::Or => {
                    if l.as_bool() {
                        return Value::Bool(true);
                    }
                    return Value::Bool(eval(right, globals, flags).as_bool());
                }
                _ => {}
            }
            let r = eval(right, globals, flags);
            use nm_bytecode::ValueType::{Float, String as StringType};
            match op {
                BinaryOp::Add => {
                    if l.value_type() == StringType || r.value_type() == StringType {
                        Value::String(l.as_string() + &r.as_string())
                    } else if l.value_type() == Float || r.value_type() == Float {
                        Value::Float(l.as_float() + r.as_float())
                    } else {
                        Value::Int(l.as_int().wrapping_add(r.as_int()))
                    }
                }
                BinaryOp::Sub => numeric(&l, &r, |a, b| a - b, i32::wrapping_sub),
                BinaryOp::Mul => numeric(&l, &r, |a, b| a * b, i32::wrapping_mul),
                BinaryOp::Div => {
                    if r.as_float() == 0.0 {
                        Value::Int(0)
                    } else {
                        Value::Float(l.as_float() / r.as_float())
                    }
                }
                BinaryOp::Mod => {
                    if r.as_int() == 0 {
                        Value::Int(0)
                    } else {
                        Value::Int(l.as_int().wrapping_rem(r.as_int()))
                    }
                }
                BinaryOp::Eq => Value::Bool(l.loose_eq(&r)),
                BinaryOp::Ne => Value::Bool(!l.loose_eq(&r)),
                BinaryOp::Lt => Value::Bool(l.loose_lt(&r)),
                BinaryOp::Le => Value::Bool(l.loose_le(&r)),
                BinaryOp::Gt => Value::Bool(r.loose_lt(&l)),
                BinaryOp::Ge => Value::Bool(r.loose_le(&l)),
                BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
            }
        }
        // No native calls and no objects from condition context.
        ExprKind::Call { .. } | ExprKind::Property { .. } => Value::Null,
    }
}

fn numeric(l: &Value, r: &Value, float_op: fn(f32, f32) -> f32, int_op: fn(i32, i32) -> i32) -> Value {
    use nm_bytecode::ValueType::Float;
    if l.value_type() == Float || r.value_type() == Float {
        Value::Float(float_op(l.as_float(), r.as_float()))
    } else {
        Value::Int(int_op(l.as_int(), r.as_int()))
    }
}

/// Replace `{name}` placeholders with stringified variable/flag values.
/// Unknown names render as `{name}` unchanged.
fn interpolate(
    template: &str,
    globals: &HashMap<String, Value>,
    flags: &HashMap<String, bool>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match globals.get(name) {
                    Some(value) => out.push_str(&value.as_string()),
                    None => match flags.get(name) {
                        Some(flag) => out.push_str(if *flag { "true" } else { "false" }),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    },
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (HashMap<String, Value>, HashMap<String, bool>) {
        let mut globals = HashMap::new();
        globals.insert("trust".to_string(), Value::Int(60));
        globals.insert("name".to_string(), Value::String("Ren".into()));
        let mut flags = HashMap::new();
        flags.insert("met_hero".to_string(), true);
        (globals, flags)
    }

    #[test]
    fn breakpoint_ip_index_tracks_enabled_set() {
        let mut dbg = VmDebugger::new();
        let a = dbg.add_breakpoint(5);
        let b = dbg.add_breakpoint(9);
        assert!(dbg.has_breakpoint_at(5));
        assert!(dbg.has_breakpoint_at(9));

        dbg.set_breakpoint_enabled(a, false);
        assert!(!dbg.has_breakpoint_at(5));
        assert!(dbg.has_breakpoint_at(9));

        assert!(dbg.toggle_breakpoint(a));
        assert!(dbg.has_breakpoint_at(5));

        dbg.remove_breakpoint(b);
        assert!(!dbg.has_breakpoint_at(9));

        dbg.clear_all_breakpoints();
        assert!(!dbg.has_breakpoint_at(5));
    }

    #[test]
    fn normal_breakpoint_pauses_and_counts_hits() {
        let mut dbg = VmDebugger::new();
        let id = dbg.add_breakpoint(3);
        let (globals, flags) = state();
        assert!(dbg.before_instruction(2, &globals, &flags));
        assert!(!dbg.before_instruction(3, &globals, &flags));
        assert!(dbg.is_paused());
        assert_eq!(dbg.breakpoint(id).unwrap().hit_count, 1);
    }

    #[test]
    fn conditional_breakpoint_consults_vm_state() {
        let mut dbg = VmDebugger::new();
        dbg.add_conditional_breakpoint(4, "trust > 50 and met_hero");
        let (mut globals, flags) = state();
        assert!(!dbg.before_instruction(4, &globals, &flags));

        dbg.continue_execution();
        globals.insert("trust".to_string(), Value::Int(10));
        assert!(dbg.before_instruction(4, &globals, &flags));
    }

    #[test]
    fn malformed_condition_never_pauses() {
        let mut dbg = VmDebugger::new();
        dbg.add_conditional_breakpoint(4, "goto main");
        let (globals, flags) = state();
        assert!(dbg.before_instruction(4, &globals, &flags));
    }

    #[test]
    fn logpoint_emits_without_pausing() {
        let mut dbg = VmDebugger::new();
        dbg.add_logpoint(2, "trust is {trust}, met: {met_hero}, missing: {nope}");
        let messages = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = messages.clone();
        dbg.set_logpoint_callback(move |msg, _ip| sink.borrow_mut().push(msg.to_string()));
        let (globals, flags) = state();
        assert!(dbg.before_instruction(2, &globals, &flags));
        assert!(!dbg.is_paused());
        assert_eq!(
            messages.borrow()[0],
            "trust is 60, met: true, missing: {nope}"
        );
    }

    #[test]
    fn step_into_pauses_immediately() {
        let mut dbg = VmDebugger::new();
        dbg.step_into();
        let (globals, flags) = state();
        assert!(!dbg.before_instruction(0, &globals, &flags));
        // The step mode is consumed by the pause.
        assert_eq!(dbg.step_mode(), StepMode::None);
    }

    #[test]
    fn step_over_skips_entered_scene() {
        let mut dbg = VmDebugger::new();
        dbg.notify_scene_entered("main", 0, 1, None);
        let (globals, flags) = state();

        dbg.step_over(7);
        // Same ip: not a new position yet.
        assert!(dbg.before_instruction(7, &globals, &flags));
        // Deeper frame: run through.
        dbg.notify_scene_entered("side", 7, 8, None);
        assert!(dbg.before_instruction(20, &globals, &flags));
        // Back at the original depth on a new ip: pause.
        dbg.notify_scene_exited();
        assert!(!dbg.before_instruction(8, &globals, &flags));
        assert!(dbg.call_stack().len() <= 1);
    }

    #[test]
    fn step_out_waits_for_frame_pop() {
        let mut dbg = VmDebugger::new();
        dbg.notify_scene_entered("main", 0, 1, None);
        dbg.notify_scene_entered("side", 5, 6, None);
        let (globals, flags) = state();

        dbg.step_out();
        assert!(dbg.before_instruction(10, &globals, &flags));
        dbg.notify_scene_exited();
        assert!(!dbg.before_instruction(11, &globals, &flags));
    }

    #[test]
    fn goto_loop_reuses_existing_frame() {
        let mut dbg = VmDebugger::new();
        dbg.notify_scene_entered("a", 0, 1, None);
        dbg.notify_scene_entered("b", 5, 6, None);
        dbg.notify_scene_entered("a", 9, 10, None);
        assert_eq!(dbg.call_stack().len(), 1);
        assert_eq!(dbg.current_scene(), Some("a"));
    }

    #[test]
    fn variable_history_is_bounded() {
        let mut dbg = VmDebugger::new();
        for i in 0..150 {
            dbg.track_variable_change("x", Value::Int(i), Value::Int(i + 1), i as u32);
        }
        assert_eq!(dbg.recent_variable_changes(1000).len(), MAX_VARIABLE_HISTORY);
        // Most recent first.
        assert_eq!(dbg.recent_variable_changes(1)[0].new_value, Value::Int(150));
    }
}
