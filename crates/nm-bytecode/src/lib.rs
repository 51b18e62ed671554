//! Value and bytecode model shared by the compiler, the VM, and the build
//! pipeline.
//!
//! Everything here is deliberately dependency-free: the compiled artifact is
//! the contract between build time and run time, so its types live in a leaf
//! crate that both sides can agree on. The wire encoding is little-endian on
//! every host; see [`CompiledScript::encode`].

mod compiled;
mod opcode;
mod value;

pub use compiled::{
    deserialize_float, serialize_float, BytecodeError, CharacterDecl, CompiledScript, Instruction,
    SourceLoc, NMBC_MAGIC, NMBC_VERSION,
};
pub use opcode::{InvalidOpcode, OpCode};
pub use value::{Value, ValueType};
