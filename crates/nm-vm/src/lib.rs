//! Cooperative stack VM for compiled NM Script, with its security guard and
//! an attachable debugger.

mod debugger;
mod guard;
mod vm;

pub use debugger::{
    Breakpoint, BreakpointKind, CallStackFrame, StepMode, VariableChange, VmDebugger,
    MAX_VARIABLE_HISTORY,
};
pub use guard::{SecurityGuard, SecurityLimits, SecurityViolation, ViolationKind};
pub use vm::{HostCallback, Vm, VmError};
