//! Error taxonomy — structured lowering failures.
//!
//! Uses miette so the outer compiler driver can render diagnostics with
//! stable codes and suggestions. Every failure is synchronous and carries
//! the offending tag; the pass does no local recovery, so the first error
//! aborts the whole transformation.

use miette::Diagnostic;
use thiserror::Error;

/// A failure raised while lowering the AST to instructions.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum LowerError {
    /// The top-level AST node is not a `block`.
    #[error("top-level node must be a `block`, got `{0}`")]
    #[diagnostic(
        code(ivy::lower::unexpected_root),
        help("the parser wraps every program in a `block` node; pass the unmodified parse result")
    )]
    UnexpectedRoot(String),

    /// No transform is registered for this node tag.
    #[error("no lowering rule for `{0}` nodes")]
    #[diagnostic(code(ivy::lower::unknown_construct))]
    UnknownConstruct(String),

    /// A `lit` node carries a payload kind the pass does not support.
    #[error("unsupported literal kind `{0}`")]
    #[diagnostic(code(ivy::lower::unknown_literal))]
    UnknownLiteral(String),

    /// A `hash` node has an odd number of children.
    #[error("hash node has an odd number of children")]
    #[diagnostic(
        code(ivy::lower::odd_hash_items),
        help("hash children alternate key and value")
    )]
    OddHashItems,

    /// The name slot of a constant-defining construct has an unexpected
    /// shape.
    #[error("constant owner slot holds a `{0}` node")]
    #[diagnostic(
        code(ivy::lower::unknown_constant_name),
        help("constant names are a bare symbol, a `colon2`, or a `colon3`")
    )]
    UnknownConstantName(String),

    /// The embedded head of a block form is not a `call`.
    #[error("block form expects a `call` head, got `{0}`")]
    #[diagnostic(code(ivy::lower::unexpected_iter_call))]
    UnexpectedIterCall(String),

    /// A formal-parameter entry has an unsupported shape.
    #[error("unsupported parameter shape `{0}`")]
    #[diagnostic(code(ivy::lower::unknown_parameter))]
    UnknownParameter(String),

    /// A node is missing a required child or carries the wrong leaf kind
    /// in a required slot.
    #[error("malformed `{tag}` node: expected {expected}")]
    #[diagnostic(code(ivy::lower::malformed_node))]
    MalformedNode {
        tag: String,
        expected: &'static str,
    },
}
