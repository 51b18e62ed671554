//! Script runtime: adapts raw VM execution to the host-facing state machine.
//!
//! ```text
//! Idle ──load──▶ Ready ──goto_scene──▶ Running
//! Running ──SAY/MOVE──▶ WaitingInput      ──continue──▶ Running
//! Running ──WAIT──▶ WaitingTimer          ──(t elapsed)──▶ Running
//! Running ──CHOICE──▶ WaitingChoice       ──choose(i)──▶ Running
//! Running ──HALT──▶ Halted
//! ```
//!
//! The runtime drives the VM exclusively through [`nm_vm::Vm::step`], at most
//! `max_steps_per_update` instructions per host tick, so a tick's cost is
//! bounded and event order equals instruction order. Everything the VM wants
//! from the host funnels through a small mailbox the runtime's opcode hooks
//! write into; the runtime turns the mailbox into state transitions and
//! [`ScriptEvent`]s after stepping.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use nm_bytecode::{CompiledScript, OpCode, Value};
use nm_vm::{Vm, VmError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Ready,
    Running,
    WaitingInput,
    WaitingChoice,
    WaitingTimer,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptEventKind {
    SceneChange,
    DialogueStart,
    ChoiceStart,
    ChoiceSelected,
    Transition,
    PlaybackRequest,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptEvent {
    pub kind: ScriptEventKind,
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("no script is loaded")]
    NotLoaded,
    #[error("unknown scene '{0}'")]
    UnknownScene(String),
    #[error("choice index {index} out of range (options: {count})")]
    ChoiceOutOfRange { index: i32, count: usize },
    #[error(transparent)]
    Vm(#[from] VmError),
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Upper bound on VM instructions executed per `update` call.
    pub max_steps_per_update: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_steps_per_update: 256,
        }
    }
}

/// Blocking and observable effects the VM raised during stepping, recorded by
/// the opcode hooks and consumed after the step loop.
#[derive(Debug)]
enum VmSignal {
    Say { text: String, speaker: String },
    Choice { options: Vec<String> },
    Wait { seconds: f32 },
    Move,
    Goto { target: u32 },
    Transition { kind: String, duration: f32 },
    Play { resource: String, music: bool },
    StopMusic { fadeout: f32 },
}

type HostHook = Box<dyn FnMut(&[Value])>;

#[derive(Default)]
struct Mailbox {
    signals: VecDeque<VmSignal>,
    host_hooks: HashMap<OpCode, HostHook>,
}

pub struct ScriptRuntime {
    vm: Vm,
    script: Option<CompiledScript>,
    state: RuntimeState,
    options: RuntimeOptions,
    mailbox: Rc<RefCell<Mailbox>>,
    events: VecDeque<ScriptEvent>,
    current_scene: String,
    current_choices: Vec<String>,
    timer_remaining: f32,
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRuntime {
    pub fn new() -> Self {
        Self::with_options(RuntimeOptions::default())
    }

    pub fn with_options(options: RuntimeOptions) -> Self {
        Self {
            vm: Vm::new(),
            script: None,
            state: RuntimeState::Idle,
            options,
            mailbox: Rc::new(RefCell::new(Mailbox::default())),
            events: VecDeque::new(),
            current_scene: String::new(),
            current_choices: Vec::new(),
            timer_remaining: 0.0,
        }
    }

    /// Load a compiled script and install the opcode hooks.
    pub fn load(&mut self, script: CompiledScript) -> Result<(), RuntimeError> {
        self.vm.load(&script)?;
        self.install_hooks();
        self.script = Some(script);
        self.state = RuntimeState::Ready;
        self.current_scene.clear();
        self.current_choices.clear();
        self.events.clear();
        tracing::info!(target: "runtime.script", "script loaded");
        Ok(())
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn current_scene(&self) -> &str {
        &self.current_scene
    }

    /// Option texts of the pending choice while in `WaitingChoice`.
    pub fn current_choices(&self) -> &[String] {
        &self.current_choices
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Direct VM access for the debugger and tests.
    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Register a presentation-layer callable for one of the host-facing
    /// opcodes (`SHOW_*`, `HIDE_CHARACTER`, `MOVE_CHARACTER`, `CALL`, ...).
    /// The runtime keeps driving its own state machine; the hook observes the
    /// same arguments the VM produced.
    pub fn register_host_callback<F>(&mut self, opcode: OpCode, callback: F)
    where
        F: FnMut(&[Value]) + 'static,
    {
        self.mailbox
            .borrow_mut()
            .host_hooks
            .insert(opcode, Box::new(callback));
    }

    /// Drain the events emitted since the last call, in emission order.
    pub fn drain_events(&mut self) -> Vec<ScriptEvent> {
        self.events.drain(..).collect()
    }

    /// Jump to a scene entry point and start running.
    pub fn goto_scene(&mut self, name: &str) -> Result<(), RuntimeError> {
        let script = self.script.as_ref().ok_or(RuntimeError::NotLoaded)?;
        let &entry = script
            .scene_entry_points
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownScene(name.to_string()))?;
        self.vm.set_ip(entry)?;
        self.vm.signal_continue(); // clear any pending wait
        self.enter_scene(name.to_string());
        self.state = RuntimeState::Running;
        Ok(())
    }

    /// Host acknowledgement while in `WaitingInput`.
    pub fn signal_continue(&mut self) {
        if self.state == RuntimeState::WaitingInput {
            self.vm.signal_continue();
            self.state = RuntimeState::Running;
        }
    }

    /// Host resolution of the pending choice.
    pub fn choose(&mut self, index: i32) -> Result<(), RuntimeError> {
        if self.state != RuntimeState::WaitingChoice {
            return Ok(());
        }
        let count = self.current_choices.len();
        if index < 0 || index as usize >= count {
            return Err(RuntimeError::ChoiceOutOfRange { index, count });
        }
        let name = self.current_choices[index as usize].clone();
        self.emit(ScriptEventKind::ChoiceSelected, name, Value::Int(index));
        self.current_choices.clear();
        self.vm.signal_choice(index);
        self.state = RuntimeState::Running;
        Ok(())
    }

    /// Cancel whatever the VM is waiting on and keep running (skip feature,
    /// shutdown paths).
    pub fn cancel_wait(&mut self) {
        if matches!(
            self.state,
            RuntimeState::WaitingInput | RuntimeState::WaitingTimer
        ) {
            self.timer_remaining = 0.0;
            self.vm.signal_continue();
            self.state = RuntimeState::Running;
        }
    }

    pub fn request_quit(&mut self) {
        self.vm.request_quit();
        self.state = RuntimeState::Halted;
    }

    /// Advance the runtime by one host tick.
    pub fn update(&mut self, dt: f32) {
        match self.state {
            RuntimeState::Running => self.run_steps(),
            RuntimeState::WaitingTimer => {
                self.timer_remaining -= dt;
                if self.timer_remaining <= 0.0 {
                    self.timer_remaining = 0.0;
                    self.vm.signal_continue();
                    self.state = RuntimeState::Running;
                }
            }
            _ => {}
        }
    }

    fn run_steps(&mut self) {
        // Each tick is one execution burst: without this the guard's
        // per-burst instruction and loop budgets accumulate across the whole
        // session and halt long playthroughs.
        self.vm.begin_step_burst();
        for _ in 0..self.options.max_steps_per_update {
            if !self.vm.step() {
                break;
            }
        }
        self.process_signals();
        if self.vm.is_halted() && self.state == RuntimeState::Running {
            self.state = RuntimeState::Halted;
            tracing::info!(target: "runtime.script", scene = %self.current_scene, "script halted");
        }
    }

    fn process_signals(&mut self) {
        // Signals must be drained outside the borrow: goto handling re-enters
        // the VM.
        let signals: Vec<VmSignal> = self.mailbox.borrow_mut().signals.drain(..).collect();
        for signal in signals {
            match signal {
                VmSignal::Say { text, speaker } => {
                    self.emit(ScriptEventKind::DialogueStart, speaker, Value::String(text));
                    self.state = RuntimeState::WaitingInput;
                }
                VmSignal::Move => {
                    self.state = RuntimeState::WaitingInput;
                }
                VmSignal::Choice { options } => {
                    self.emit(
                        ScriptEventKind::ChoiceStart,
                        String::new(),
                        Value::Int(options.len() as i32),
                    );
                    self.current_choices = options;
                    self.state = RuntimeState::WaitingChoice;
                }
                VmSignal::Wait { seconds } => {
                    self.timer_remaining = seconds;
                    self.state = RuntimeState::WaitingTimer;
                }
                VmSignal::Goto { target } => {
                    if self.vm.set_ip(target).is_ok() {
                        let name = self
                            .vm
                            .scene_name_at(target)
                            .unwrap_or_default()
                            .to_string();
                        self.vm.signal_continue();
                        self.enter_scene(name);
                        self.state = RuntimeState::Running;
                    } else {
                        self.state = RuntimeState::Halted;
                    }
                }
                VmSignal::Transition { kind, duration } => {
                    self.emit(ScriptEventKind::Transition, kind, Value::Float(duration));
                }
                VmSignal::Play { resource, music } => {
                    let medium = if music { "music" } else { "sound" };
                    self.emit(
                        ScriptEventKind::PlaybackRequest,
                        resource,
                        Value::String(medium.to_string()),
                    );
                }
                VmSignal::StopMusic { fadeout } => {
                    self.emit(ScriptEventKind::Stop, String::new(), Value::Float(fadeout));
                }
            }
        }
    }

    fn enter_scene(&mut self, name: String) {
        if !name.is_empty() && name != self.current_scene {
            self.current_scene = name.clone();
            self.emit(ScriptEventKind::SceneChange, name, Value::Null);
        }
    }

    fn emit(&mut self, kind: ScriptEventKind, name: String, value: Value) {
        tracing::debug!(target: "runtime.script", ?kind, name = %name, "script event");
        self.events.push_back(ScriptEvent { kind, name, value });
    }

    fn install_hooks(&mut self) {
        let hooks: [(OpCode, fn(&[Value]) -> Option<VmSignal>); 12] = [
            (OpCode::Say, |args| {
                Some(VmSignal::Say {
                    text: args.first().map(Value::as_string).unwrap_or_default(),
                    speaker: args
                        .get(1)
                        .filter(|v| !v.is_null())
                        .map(Value::as_string)
                        .unwrap_or_default(),
                })
            }),
            (OpCode::Choice, |args| {
                let count = args.first().map(|v| v.as_int()).unwrap_or(0).max(0) as usize;
                Some(VmSignal::Choice {
                    options: args
                        .iter()
                        .skip(1)
                        .take(count)
                        .map(Value::as_string)
                        .collect(),
                })
            }),
            (OpCode::Wait, |args| {
                Some(VmSignal::Wait {
                    seconds: args.first().map(Value::as_float).unwrap_or(0.0),
                })
            }),
            (OpCode::MoveCharacter, |_| Some(VmSignal::Move)),
            (OpCode::GotoScene, |args| {
                Some(VmSignal::Goto {
                    target: args.first().map(|v| v.as_int()).unwrap_or(0).max(0) as u32,
                })
            }),
            (OpCode::Transition, |args| {
                Some(VmSignal::Transition {
                    kind: args.first().map(Value::as_string).unwrap_or_default(),
                    duration: args.get(1).map(Value::as_float).unwrap_or(0.0),
                })
            }),
            (OpCode::PlayMusic, |args| {
                Some(VmSignal::Play {
                    resource: args.first().map(Value::as_string).unwrap_or_default(),
                    music: true,
                })
            }),
            (OpCode::PlaySound, |args| {
                Some(VmSignal::Play {
                    resource: args.first().map(Value::as_string).unwrap_or_default(),
                    music: false,
                })
            }),
            (OpCode::StopMusic, |args| {
                Some(VmSignal::StopMusic {
                    fadeout: args.first().map(Value::as_float).unwrap_or(0.0),
                })
            }),
            // Pure presentation: forwarded to host hooks only.
            (OpCode::ShowBackground, |_| None),
            (OpCode::ShowCharacter, |_| None),
            (OpCode::HideCharacter, |_| None),
        ];
        for (opcode, extract) in hooks {
            let mailbox = Rc::clone(&self.mailbox);
            self.vm.register_callback(opcode, move |args| {
                let mut mb = mailbox.borrow_mut();
                if let Some(signal) = extract(args) {
                    mb.signals.push_back(signal);
                }
                if let Some(hook) = mb.host_hooks.get_mut(&opcode) {
                    hook(args);
                }
            });
        }
        // CALL only forwards.
        let mailbox = Rc::clone(&self.mailbox);
        self.vm.register_callback(OpCode::Call, move |args| {
            let mut mb = mailbox.borrow_mut();
            if let Some(hook) = mb.host_hooks.get_mut(&OpCode::Call) {
                hook(args);
            }
        });
    }
}
