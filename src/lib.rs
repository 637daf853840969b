//! AArch64 JIT backend for a typed, stack-style virtual machine.
//!
//! Given a [`module::Module`] — a table of functions whose bodies are sequences of
//! [`module::Op`] values over typed virtual registers — this crate compiles each function to
//! native AArch64 machine code and links the result into one executable blob. The backend
//! itself has no knowledge of how the module was loaded or how the runtime it calls into is
//! implemented; see [`runtime`] for the boundary.
//!
//! The public entry points mirror a small, five-call lifecycle:
//!
//! 1. [`JitContext::new`] — allocate a fresh context.
//! 2. [`JitContext::init`] — bind a module, emit the literal pool and guard instructions.
//! 3. [`JitContext::compile_function`] — compile one function body, return its offset.
//! 4. [`JitContext::finalize`] — relocate, copy to executable memory, invalidate the icache.
//! 5. [`JitContext::reset`] — reuse the context shell for another module.

pub mod abi;
pub mod buffer;
pub mod codegen;
pub mod context;
pub mod encoder;
pub mod error;
pub mod exec_mem;
pub mod module;
pub mod regalloc;
pub mod regs;
pub mod runtime;
pub mod settings;

pub use context::JitContext;
pub use error::JitError;
pub use settings::Flags;
