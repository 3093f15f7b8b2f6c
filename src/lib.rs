//! Ivy Compiler — AST-to-IR lowering (pass 1) for the Ivy language.
//!
//! # Pipeline placement
//!
//! ```text
//! Source Code (.ivy)
//!     │
//!     ▼
//! ┌──────────┐
//! │  Parser   │  (external) produces a tagged S-expression AST
//! └────┬─────┘
//!      │
//!      ▼
//! ┌──────────┐
//! │ Lowering  │  this crate: AST → stack-machine instruction stream
//! └────┬─────┘
//!      │
//!      ▼
//! ┌──────────┐
//! │ Backend   │  (external) resolves branches and links the C++ runtime
//! └──────────┘
//! ```
//!
//! The crate is a library with one job: turn a parsed [`ast::Node`] tree
//! into a flat sequence of [`instruction::Instruction`]s via
//! [`lower::lower`]. Control flow comes out as structured scope markers,
//! never jump offsets, so the backend chooses its own execution strategy.

pub mod ast;
pub mod errors;
pub mod instruction;
pub mod lower;
pub mod verify;

pub use ast::Node;
pub use errors::LowerError;
pub use instruction::{Instruction, ScopeTag};
pub use lower::lower;
