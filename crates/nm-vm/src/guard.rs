//! Execution limits for untrusted scripts.
//!
//! Scripts ship in packs from arbitrary authors; the guard bounds what a
//! hostile or buggy script can do to the host. Violations are recorded and
//! halt the VM.

#[derive(Debug, Clone)]
pub struct SecurityLimits {
    pub max_stack_size: usize,
    pub max_call_depth: usize,
    pub max_instructions_per_step: u32,
    pub max_string_length: usize,
    pub max_variables: usize,
    pub max_loop_iterations: u32,
    pub allow_native_calls: bool,
    pub allow_file_access: bool,
    pub allow_network_access: bool,
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            max_stack_size: 1024,
            max_call_depth: 256,
            max_instructions_per_step: 100_000,
            max_string_length: 1 << 16,
            max_variables: 10_000,
            max_loop_iterations: 1_000_000,
            allow_native_calls: true,
            allow_file_access: false,
            allow_network_access: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    StackOverflow,
    CallDepthExceeded,
    InstructionBudgetExceeded,
    StringTooLong,
    TooManyVariables,
    LoopLimitExceeded,
    NativeCallsDisabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityViolation {
    pub kind: ViolationKind,
    pub ip: u32,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct SecurityGuard {
    limits: SecurityLimits,
    violations: Vec<SecurityViolation>,
    instructions_this_run: u32,
    backward_jumps: u32,
}

impl SecurityGuard {
    pub fn new(limits: SecurityLimits) -> Self {
        Self {
            limits,
            violations: Vec::new(),
            instructions_this_run: 0,
            backward_jumps: 0,
        }
    }

    pub fn limits(&self) -> &SecurityLimits {
        &self.limits
    }

    pub fn violations(&self) -> &[SecurityViolation] {
        &self.violations
    }

    /// Clear recorded violations and per-run counters (VM reset).
    pub fn reset(&mut self) {
        self.violations.clear();
        self.instructions_this_run = 0;
        self.backward_jumps = 0;
    }

    /// Called when an execution burst begins — a `run` call, or one
    /// host-driven step loop — so the instruction and loop budgets apply per
    /// burst, not across the whole session.
    pub fn begin_run(&mut self) {
        self.instructions_this_run = 0;
        self.backward_jumps = 0;
    }

    fn violate(&mut self, kind: ViolationKind, ip: u32, detail: String) -> bool {
        tracing::error!(target: "vm.guard", ?kind, ip, %detail, "security violation");
        self.violations.push(SecurityViolation { kind, ip, detail });
        false
    }

    pub fn check_stack_push(&mut self, depth: usize, ip: u32) -> bool {
        if depth >= self.limits.max_stack_size {
            return self.violate(
                ViolationKind::StackOverflow,
                ip,
                format!("stack depth {depth} at limit {}", self.limits.max_stack_size),
            );
        }
        true
    }

    pub fn check_string(&mut self, len: usize, ip: u32) -> bool {
        if len > self.limits.max_string_length {
            return self.violate(
                ViolationKind::StringTooLong,
                ip,
                format!("string of {len} bytes exceeds {}", self.limits.max_string_length),
            );
        }
        true
    }

    pub fn check_variable_count(&mut self, count: usize, ip: u32) -> bool {
        if count >= self.limits.max_variables {
            return self.violate(
                ViolationKind::TooManyVariables,
                ip,
                format!("{count} variables at limit {}", self.limits.max_variables),
            );
        }
        true
    }

    pub fn check_call_depth(&mut self, depth: usize, ip: u32) -> bool {
        if depth >= self.limits.max_call_depth {
            return self.violate(
                ViolationKind::CallDepthExceeded,
                ip,
                format!("call depth {depth} at limit {}", self.limits.max_call_depth),
            );
        }
        true
    }

    pub fn check_native_call(&mut self, name: &str, ip: u32) -> bool {
        if !self.limits.allow_native_calls {
            return self.violate(
                ViolationKind::NativeCallsDisabled,
                ip,
                format!("native call '{name}' while native calls are disabled"),
            );
        }
        true
    }

    pub fn count_instruction(&mut self, ip: u32) -> bool {
        self.instructions_this_run += 1;
        if self.instructions_this_run > self.limits.max_instructions_per_step {
            return self.violate(
                ViolationKind::InstructionBudgetExceeded,
                ip,
                format!(
                    "more than {} instructions in one run burst",
                    self.limits.max_instructions_per_step
                ),
            );
        }
        true
    }

    pub fn count_backward_jump(&mut self, ip: u32) -> bool {
        self.backward_jumps += 1;
        if self.backward_jumps > self.limits.max_loop_iterations {
            return self.violate(
                ViolationKind::LoopLimitExceeded,
                ip,
                format!("more than {} backward jumps", self.limits.max_loop_iterations),
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_limit_records_violation() {
        let mut guard = SecurityGuard::new(SecurityLimits {
            max_stack_size: 4,
            ..Default::default()
        });
        assert!(guard.check_stack_push(3, 7));
        assert!(!guard.check_stack_push(4, 7));
        assert_eq!(guard.violations().len(), 1);
        assert_eq!(guard.violations()[0].kind, ViolationKind::StackOverflow);
        assert_eq!(guard.violations()[0].ip, 7);
    }

    #[test]
    fn native_calls_can_be_disabled() {
        let mut guard = SecurityGuard::new(SecurityLimits {
            allow_native_calls: false,
            ..Default::default()
        });
        assert!(!guard.check_native_call("roll_dice", 0));
        assert_eq!(
            guard.violations()[0].kind,
            ViolationKind::NativeCallsDisabled
        );
    }

    #[test]
    fn begin_run_resets_per_burst_counters() {
        let mut guard = SecurityGuard::new(SecurityLimits {
            max_instructions_per_step: 2,
            max_loop_iterations: 2,
            ..Default::default()
        });
        assert!(guard.count_instruction(0));
        assert!(guard.count_instruction(1));
        assert!(guard.count_backward_jump(1));
        assert!(guard.count_backward_jump(1));
        guard.begin_run();
        assert!(guard.count_instruction(2));
        assert!(guard.count_backward_jump(2));
        assert!(guard.violations().is_empty());
    }

    #[test]
    fn reset_clears_violations_and_counters() {
        let mut guard = SecurityGuard::new(SecurityLimits {
            max_instructions_per_step: 1,
            ..Default::default()
        });
        assert!(guard.count_instruction(0));
        assert!(!guard.count_instruction(1));
        guard.reset();
        assert!(guard.violations().is_empty());
        assert!(guard.count_instruction(2));
    }
}
