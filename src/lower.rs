//! Lowering — AST to instruction-stream compilation (pass 1).
//!
//! Walks the tagged S-expression tree produced by the parser and emits
//! stack-machine [`Instruction`]s for the backend. Each node tag has a
//! dedicated transform; every transform takes a `used` flag declaring
//! whether the expression's value is consumed by its parent:
//!
//!   * `used = true` — the emitted sequence leaves exactly one value on
//!     the operand stack.
//!   * `used = false` — the emitted sequence leaves the stack unchanged.
//!     Pure producers emit nothing at all; impure expressions are still
//!     evaluated, and a trailing pop discards the result.
//!
//! Control flow is emitted as structured scope markers (`If`,
//! `Else(tag)`, `End(tag)`) rather than jump targets; the backend
//! resolves branch offsets later. The pass is a pure function of its
//! input: no state survives an invocation, and identical trees produce
//! identical streams.

use crate::ast::{Node, Sexp};
use crate::errors::LowerError;
use crate::instruction::{Instruction as I, ScopeTag};

// ── Driver ───────────────────────────────────────────────────────────

/// Lower a parsed program to a flat instruction stream.
///
/// The root must be a `block` node; its children form the program body,
/// lowered with the last-expression-is-used discipline under the
/// caller-supplied `used`.
pub fn lower(root: &Node, used: bool) -> Result<Vec<I>, LowerError> {
    let sexp = match root.as_sexp() {
        Some(sexp) if sexp.tag == "block" => sexp,
        _ => return Err(LowerError::UnexpectedRoot(root.kind_name().to_string())),
    };
    let mut out = Vec::new();
    lower_body(&sexp.children, used, &mut out)?;
    Ok(out)
}

/// Lower a body: all but the last expression unused, the last with the
/// inherited flag. An empty body reads as nil.
fn lower_body(body: &[Node], used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    match body.split_last() {
        None => {
            if used {
                out.push(I::PushNil);
            }
            Ok(())
        }
        Some((last, init)) => {
            for expr in init {
                lower_expr(expr, false, out)?;
            }
            lower_expr(last, used, out)
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

fn lower_expr(node: &Node, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    let sexp = match node {
        Node::Sexp(sexp) => sexp,
        // An absent child slot in expression position reads as nil
        // (missing else branch, empty when body, and so on).
        Node::Nil => {
            if used {
                out.push(I::PushNil);
            }
            return Ok(());
        }
        other => return Err(LowerError::UnknownConstruct(other.kind_name().to_string())),
    };
    match sexp.tag.as_str() {
        "block" => lower_body(&sexp.children, used, out),

        // Pure producers
        "lit" => lower_lit(sexp.child(0), used, out),
        "str" => lower_str(sexp, used, out),
        "true" => {
            if used {
                out.push(I::PushTrue);
            }
            Ok(())
        }
        "false" => {
            if used {
                out.push(I::PushFalse);
            }
            Ok(())
        }
        "nil" => {
            if used {
                out.push(I::PushNil);
            }
            Ok(())
        }
        "self" => {
            if used {
                out.push(I::PushSelf);
            }
            Ok(())
        }
        "lvar" => {
            let name = sym_child(sexp, 0, "a variable name")?.to_string();
            if used {
                out.push(I::VariableGet(name));
            }
            Ok(())
        }
        "ivar" => {
            let name = sym_child(sexp, 0, "a variable name")?.to_string();
            if used {
                out.push(I::InstanceVariableGet(name));
            }
            Ok(())
        }
        "gvar" => {
            let name = sym_child(sexp, 0, "a variable name")?.to_string();
            if used {
                out.push(I::GlobalVariableGet(name));
            }
            Ok(())
        }
        "const" => {
            let name = sym_child(sexp, 0, "a constant name")?.to_string();
            if used {
                out.push(I::PushSelf);
                out.push(I::ConstFind(name));
            }
            Ok(())
        }
        "colon2" => {
            let name = sym_child(sexp, 1, "a constant name")?.to_string();
            if used {
                lower_expr(sexp.child(0), true, out)?;
                out.push(I::ConstFind(name));
            }
            Ok(())
        }
        "colon3" => {
            let name = sym_child(sexp, 0, "a constant name")?.to_string();
            if used {
                out.push(I::PushObjectClass);
                out.push(I::ConstFind(name));
            }
            Ok(())
        }

        // Assignments
        "lasgn" => {
            let name = sym_child(sexp, 0, "a variable name")?.to_string();
            lower_expr(sexp.child(1), true, out)?;
            out.push(I::VariableSet {
                name: name.clone(),
                local_only: false,
            });
            if used {
                out.push(I::VariableGet(name));
            }
            Ok(())
        }
        "iasgn" => {
            let name = sym_child(sexp, 0, "a variable name")?.to_string();
            lower_expr(sexp.child(1), true, out)?;
            out.push(I::InstanceVariableSet(name.clone()));
            if used {
                out.push(I::InstanceVariableGet(name));
            }
            Ok(())
        }
        "gasgn" => {
            let name = sym_child(sexp, 0, "a variable name")?.to_string();
            lower_expr(sexp.child(1), true, out)?;
            out.push(I::GlobalVariableSet(name.clone()));
            if used {
                out.push(I::GlobalVariableGet(name));
            }
            Ok(())
        }
        "cdecl" => {
            let (name, prep) = resolve_constant_owner(sexp.child(0))?;
            lower_expr(sexp.child(1), true, out)?;
            out.extend(prep.iter().cloned());
            out.push(I::ConstSet(name.clone()));
            if used {
                out.extend(prep);
                out.push(I::ConstFind(name));
            }
            Ok(())
        }
        "attrasgn" => lower_attrasgn(sexp, used, out),

        // Aggregates
        "array" => {
            for item in &sexp.children {
                lower_expr(item, true, out)?;
            }
            out.push(I::CreateArray {
                count: sexp.children.len(),
            });
            if !used {
                out.push(I::Pop);
            }
            Ok(())
        }
        "hash" => {
            if sexp.children.len() % 2 != 0 {
                return Err(LowerError::OddHashItems);
            }
            for item in &sexp.children {
                lower_expr(item, true, out)?;
            }
            out.push(I::CreateHash {
                count: sexp.children.len() / 2,
            });
            if !used {
                out.push(I::Pop);
            }
            Ok(())
        }

        // Range sugar: ending first, then beginning
        "dot2" | "dot3" => {
            lower_expr(sexp.child(1), true, out)?;
            lower_expr(sexp.child(0), true, out)?;
            out.push(I::PushRange {
                exclude_end: sexp.tag == "dot3",
            });
            if !used {
                out.push(I::Pop);
            }
            Ok(())
        }

        // Short-circuit
        "and" => {
            lower_expr(sexp.child(0), true, out)?;
            out.push(I::Dup);
            out.push(I::If);
            out.push(I::Pop);
            lower_expr(sexp.child(1), true, out)?;
            out.push(I::Else(ScopeTag::If));
            out.push(I::End(ScopeTag::If));
            if !used {
                out.push(I::Pop);
            }
            Ok(())
        }
        "or" => {
            lower_expr(sexp.child(0), true, out)?;
            out.push(I::Dup);
            out.push(I::If);
            out.push(I::Else(ScopeTag::If));
            out.push(I::Pop);
            lower_expr(sexp.child(1), true, out)?;
            out.push(I::End(ScopeTag::If));
            if !used {
                out.push(I::Pop);
            }
            Ok(())
        }

        // Conditionals
        "if" => {
            lower_expr(sexp.child(0), true, out)?;
            out.push(I::If);
            lower_expr(sexp.child(1), true, out)?;
            out.push(I::Else(ScopeTag::If));
            lower_expr(sexp.child(2), true, out)?;
            out.push(I::End(ScopeTag::If));
            if !used {
                out.push(I::Pop);
            }
            Ok(())
        }
        "case" => lower_case(sexp, used, out),

        // Interpolated strings
        "dstr" => lower_dstr(sexp, used, out),

        // Loops
        "while" => lower_loop(sexp, false, used, out),
        "until" => lower_loop(sexp, true, used, out),
        "break" => lower_loop_exit(sexp, I::Break, used, out),
        "next" => lower_loop_exit(sexp, I::Next, used, out),

        // Calls and blocks
        "call" => lower_call(sexp, used, false, out),
        "iter" => lower_iter(sexp, used, out),
        "yield" => {
            for arg in &sexp.children {
                lower_expr(arg, true, out)?;
            }
            out.push(I::PushArgc(sexp.children.len()));
            out.push(I::Yield);
            if !used {
                out.push(I::Pop);
            }
            Ok(())
        }

        // Definitions
        "defn" => lower_defn(sexp, used, out),
        "class" => lower_class(sexp, used, out),
        "module" => lower_module(sexp, used, out),

        // Guarded regions
        "rescue" => lower_rescue(sexp, used, out),
        "ensure" => lower_ensure(sexp, used, out),

        tag => Err(LowerError::UnknownConstruct(tag.to_string())),
    }
}

// ── Literals ─────────────────────────────────────────────────────────

/// Lower a `lit` payload. Payload shapes are validated even when the
/// value is unused; only the emission is elided.
fn lower_lit(payload: &Node, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    match payload {
        Node::Int(value) => {
            if used {
                out.push(I::PushInt(*value));
            }
            Ok(())
        }
        Node::Float(value) => {
            if used {
                out.push(I::PushFloat(*value));
            }
            Ok(())
        }
        Node::Sym(name) => {
            if used {
                out.push(I::PushSymbol(name.clone()));
            }
            Ok(())
        }
        // Range endpoints are literal payloads themselves: ending first,
        // then beginning.
        Node::Range(range) => {
            lower_lit(&range.end, used, out)?;
            lower_lit(&range.begin, used, out)?;
            if used {
                out.push(I::PushRange {
                    exclude_end: range.exclude_end,
                });
            }
            Ok(())
        }
        other => Err(LowerError::UnknownLiteral(other.kind_name().to_string())),
    }
}

fn lower_str(sexp: &Sexp, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    let value = match sexp.child(0) {
        Node::Str(value) => value,
        _ => {
            return Err(LowerError::MalformedNode {
                tag: sexp.tag.clone(),
                expected: "a string payload",
            })
        }
    };
    if used {
        out.push(I::PushString {
            value: value.clone(),
            length: value.len(),
        });
    }
    Ok(())
}

/// Interpolated string: start from the leading literal and accumulate
/// each segment with a `+` send, converting interpolations with `to_s`.
fn lower_dstr(sexp: &Sexp, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    let leading = match sexp.child(0) {
        Node::Str(value) => value,
        _ => {
            return Err(LowerError::MalformedNode {
                tag: sexp.tag.clone(),
                expected: "a leading string payload",
            })
        }
    };
    out.push(I::PushString {
        value: leading.clone(),
        length: leading.len(),
    });
    for part in sexp.rest(1) {
        match part.as_sexp() {
            Some(segment) if segment.tag == "str" => lower_str(segment, true, out)?,
            Some(segment) if segment.tag == "evstr" => {
                out.push(I::PushArgc(0));
                lower_expr(segment.child(0), true, out)?;
                out.push(I::Send {
                    message: "to_s".to_string(),
                    receiver_is_self: false,
                    with_block: false,
                });
            }
            _ => return Err(LowerError::UnknownConstruct(part.kind_name().to_string())),
        }
        // The accumulated string sits beneath the segment: copy it up as
        // the receiver, send `+`, then drop the stale accumulator.
        out.push(I::PushArgc(1));
        out.push(I::DupRel(2));
        out.push(I::Send {
            message: "+".to_string(),
            receiver_is_self: false,
            with_block: false,
        });
        out.push(I::Swap);
        out.push(I::Pop);
    }
    if !used {
        out.push(I::Pop);
    }
    Ok(())
}

// ── Case ─────────────────────────────────────────────────────────────

fn lower_case(sexp: &Sexp, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    let subject = sexp.child(0);
    let mut whens: Vec<&Sexp> = Vec::new();
    let mut else_node: &Node = &Node::Nil;
    for child in sexp.rest(1) {
        match child.as_sexp() {
            Some(when) if when.tag == "when" => whens.push(when),
            _ => else_node = child,
        }
    }

    // With no branches the whole node reduces to its else branch.
    if whens.is_empty() {
        return lower_expr(else_node, used, out);
    }

    if subject.is_nil() {
        lower_case_ladder(&whens, else_node, out)?;
    } else {
        lower_case_subject(subject, &whens, else_node, out)?;
    }
    if !used {
        out.push(I::Pop);
    }
    Ok(())
}

/// Subject form: the scrutinee stays on the stack while each option is
/// tested with `===`; a boolean ladder feeds each branch's `If`. The
/// final Swap/Pop drops the scrutinee from beneath the result.
fn lower_case_subject(
    subject: &Node,
    whens: &[&Sexp],
    else_node: &Node,
    out: &mut Vec<I>,
) -> Result<(), LowerError> {
    lower_expr(subject, true, out)?;
    for when in whens {
        let options = when_options(when)?;
        for option in options {
            lower_expr(option, true, out)?;
            out.push(I::PushArgc(1));
            out.push(I::DupRel(2));
            out.push(I::Send {
                message: "===".to_string(),
                receiver_is_self: false,
                with_block: false,
            });
            out.push(I::If);
            out.push(I::PushTrue);
            out.push(I::Else(ScopeTag::If));
        }
        out.push(I::PushFalse);
        for _ in options {
            out.push(I::End(ScopeTag::If));
        }
        out.push(I::If);
        lower_body(when.rest(1), true, out)?;
        out.push(I::Else(ScopeTag::If));
    }
    lower_expr(else_node, true, out)?;
    for _ in whens {
        out.push(I::End(ScopeTag::If));
    }
    out.push(I::Swap);
    out.push(I::Pop);
    Ok(())
}

/// Subjectless form: each branch's options fold right-to-left into a
/// nested `or`, and the branches chain as an if-else ladder.
fn lower_case_ladder(
    whens: &[&Sexp],
    else_node: &Node,
    out: &mut Vec<I>,
) -> Result<(), LowerError> {
    let Some((first, rest)) = whens.split_first() else {
        return lower_expr(else_node, true, out);
    };
    let options = when_options(first)?;
    let condition = options
        .iter()
        .rev()
        .fold(None, |folded, option| {
            Some(match folded {
                None => option.clone(),
                Some(rhs) => Node::sexp("or", vec![option.clone(), rhs]),
            })
        })
        .unwrap_or(Node::Nil);
    lower_expr(&condition, true, out)?;
    out.push(I::If);
    lower_body(first.rest(1), true, out)?;
    out.push(I::Else(ScopeTag::If));
    lower_case_ladder(rest, else_node, out)?;
    out.push(I::End(ScopeTag::If));
    Ok(())
}

fn when_options<'a>(when: &'a Sexp) -> Result<&'a [Node], LowerError> {
    match when.child(0).as_sexp() {
        Some(options) if options.tag == "array" => Ok(&options.children),
        _ => Err(LowerError::MalformedNode {
            tag: when.tag.clone(),
            expected: "an options array",
        }),
    }
}

// ── Loops ────────────────────────────────────────────────────────────

/// `while` and `until`. The test segment precedes `Else(while)`, which
/// consumes it at each iteration boundary; the body is stack-neutral. A
/// loop in value position evaluates to nil. The trailing pre-condition
/// flag some parsers attach is accepted and ignored.
fn lower_loop(sexp: &Sexp, negate: bool, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    out.push(I::While);
    if negate {
        out.push(I::PushArgc(0));
        lower_expr(sexp.child(0), true, out)?;
        out.push(I::Send {
            message: "!".to_string(),
            receiver_is_self: false,
            with_block: false,
        });
    } else {
        lower_expr(sexp.child(0), true, out)?;
    }
    out.push(I::Else(ScopeTag::While));
    lower_expr(sexp.child(1), false, out)?;
    out.push(I::End(ScopeTag::While));
    if used {
        out.push(I::PushNil);
    }
    Ok(())
}

/// `break` / `next`. A value child is evaluated and discarded
/// (value-carrying loop exits are a known limitation). The nil pushed in
/// value position is never reached; it keeps branch heights in
/// agreement.
fn lower_loop_exit(sexp: &Sexp, exit: I, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    let value = sexp.child(0);
    if !value.is_nil() {
        lower_expr(value, false, out)?;
    }
    out.push(exit);
    if used {
        out.push(I::PushNil);
    }
    Ok(())
}

// ── Calls and blocks ─────────────────────────────────────────────────

/// A message send: arguments, argc, then the receiver (self when the
/// receiver slot is empty).
fn lower_call(
    sexp: &Sexp,
    used: bool,
    with_block: bool,
    out: &mut Vec<I>,
) -> Result<(), LowerError> {
    let message = sym_child(sexp, 1, "a message symbol")?.to_string();
    let receiver = sexp.child(0);
    let args = sexp.rest(2);
    for arg in args {
        lower_expr(arg, true, out)?;
    }
    out.push(I::PushArgc(args.len()));
    let receiver_is_self = receiver.is_nil();
    if receiver_is_self {
        out.push(I::PushSelf);
    } else {
        lower_expr(receiver, true, out)?;
    }
    out.push(I::Send {
        message,
        receiver_is_self,
        with_block,
    });
    if !used {
        out.push(I::Pop);
    }
    Ok(())
}

/// Attribute assignment `recv.name = value`: call-shaped, but the
/// grammar always supplies a receiver, so the send never targets
/// implicit self. The message already carries its `=` suffix.
fn lower_attrasgn(sexp: &Sexp, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    let message = sym_child(sexp, 1, "a message symbol")?.to_string();
    let args = sexp.rest(2);
    for arg in args {
        lower_expr(arg, true, out)?;
    }
    out.push(I::PushArgc(args.len()));
    lower_expr(sexp.child(0), true, out)?;
    out.push(I::Send {
        message,
        receiver_is_self: false,
        with_block: false,
    });
    if !used {
        out.push(I::Pop);
    }
    Ok(())
}

/// A block form: the block's formals and body compile into a
/// `define_block` region, then the embedded call is sent with the block
/// attached.
fn lower_iter(sexp: &Sexp, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    let call = match sexp.child(0).as_sexp() {
        Some(call) if call.tag == "call" => call,
        _ => {
            return Err(LowerError::UnexpectedIterCall(
                sexp.child(0).kind_name().to_string(),
            ))
        }
    };
    let params = sexp.child(1);
    out.push(I::DefineBlock {
        arity: param_count(params),
    });
    lower_formals(params, true, out)?;
    lower_body(sexp.rest(2), true, out)?;
    out.push(I::End(ScopeTag::DefineBlock));
    lower_call(call, used, true, out)
}

// ── Definitions ──────────────────────────────────────────────────────

fn lower_defn(sexp: &Sexp, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    let name = sym_child(sexp, 0, "a method name")?.to_string();
    let params = sexp.child(1);
    out.push(I::DefineMethod {
        name: name.clone(),
        arity: param_count(params),
    });
    lower_formals(params, true, out)?;
    lower_body(sexp.rest(2), true, out)?;
    out.push(I::End(ScopeTag::DefineMethod));
    if used {
        out.push(I::PushSymbol(name));
    }
    Ok(())
}

fn lower_class(sexp: &Sexp, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    let (name, prep) = resolve_constant_owner(sexp.child(0))?;
    let superclass = sexp.child(1);
    if superclass.is_nil() {
        out.push(I::PushObjectClass);
    } else {
        lower_expr(superclass, true, out)?;
    }
    out.extend(prep);
    out.push(I::DefineClass(name));
    lower_body(sexp.rest(2), true, out)?;
    out.push(I::End(ScopeTag::DefineClass));
    if used {
        out.push(I::PushNil);
    }
    Ok(())
}

fn lower_module(sexp: &Sexp, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    let (name, prep) = resolve_constant_owner(sexp.child(0))?;
    out.extend(prep);
    out.push(I::DefineModule(name));
    lower_body(sexp.rest(1), true, out)?;
    out.push(I::End(ScopeTag::DefineModule));
    if used {
        out.push(I::PushNil);
    }
    Ok(())
}

// ── Rescue / ensure ──────────────────────────────────────────────────

fn is_resbody(node: &Node) -> bool {
    matches!(node.as_sexp(), Some(sexp) if sexp.tag == "resbody")
}

/// A guarded region: protected body (and optional else expression) up to
/// `Else(rescue)`, then the handler ladder.
fn lower_rescue(sexp: &Sexp, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    let mut body: &Node = &Node::Nil;
    let mut index = 0;
    if let Some(first) = sexp.children.first() {
        if !is_resbody(first) {
            body = first;
            index = 1;
        }
    }
    let mut handlers: Vec<&Sexp> = Vec::new();
    let mut else_clause: Option<&Node> = None;
    for child in sexp.rest(index) {
        match child.as_sexp() {
            Some(handler) if handler.tag == "resbody" => handlers.push(handler),
            _ => else_clause = Some(child),
        }
    }

    out.push(I::Try);
    match else_clause {
        // The else expression is the region's value when the body
        // completes without raising.
        Some(else_expr) => {
            lower_expr(body, false, out)?;
            lower_expr(else_expr, true, out)?;
        }
        None => lower_expr(body, true, out)?,
    }
    out.push(I::Else(ScopeTag::Rescue));
    lower_handlers(&handlers, out)?;
    out.push(I::End(ScopeTag::Rescue));
    if !used {
        out.push(I::Pop);
    }
    Ok(())
}

/// Handler ladder: each level tests the in-flight exception against its
/// class list; the first match wins. When no level matches the exception
/// propagates (the nil after the reraise is unreachable and keeps branch
/// heights in agreement).
fn lower_handlers(handlers: &[&Sexp], out: &mut Vec<I>) -> Result<(), LowerError> {
    let Some((first, rest)) = handlers.split_first() else {
        out.push(I::Reraise);
        out.push(I::PushNil);
        return Ok(());
    };
    let options = match first.child(0).as_sexp() {
        Some(options) if options.tag == "array" => &options.children,
        _ => {
            return Err(LowerError::MalformedNode {
                tag: first.tag.clone(),
                expected: "a tests array",
            })
        }
    };

    // The tests array mixes exception classes with the binding
    // assignment a `=> e` clause parses into.
    let mut tests: Vec<&Node> = Vec::new();
    let mut bindings: Vec<&Node> = Vec::new();
    for option in options {
        let is_binding = matches!(
            option.as_sexp(),
            Some(sexp) if matches!(sexp.tag.as_str(), "lasgn" | "iasgn" | "gasgn")
        );
        if is_binding {
            bindings.push(option);
        } else {
            tests.push(option);
        }
    }

    if tests.is_empty() {
        // A bare rescue matches StandardError.
        out.push(I::PushSelf);
        out.push(I::ConstFind("StandardError".to_string()));
        out.push(I::CreateArray { count: 1 });
    } else {
        for test in &tests {
            lower_expr(test, true, out)?;
        }
        out.push(I::CreateArray { count: tests.len() });
    }
    out.push(I::MatchException);
    out.push(I::If);
    for binding in &bindings {
        lower_expr(binding, false, out)?;
    }
    lower_body(first.rest(1), true, out)?;
    out.push(I::Else(ScopeTag::If));
    lower_handlers(rest, out)?;
    out.push(I::End(ScopeTag::If));
    Ok(())
}

/// `ensure` inlines its cleanup on both paths: once in the handler
/// position (followed by a reraise), once after the region.
fn lower_ensure(sexp: &Sexp, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    out.push(I::Try);
    lower_expr(sexp.child(0), true, out)?;
    out.push(I::Else(ScopeTag::Rescue));
    lower_expr(sexp.child(1), false, out)?;
    out.push(I::Reraise);
    out.push(I::PushNil);
    out.push(I::End(ScopeTag::Rescue));
    lower_expr(sexp.child(1), false, out)?;
    if !used {
        out.push(I::Pop);
    }
    Ok(())
}

// ── Constants ────────────────────────────────────────────────────────

/// Resolve how a constant-defining construct names its owning scope:
/// the leaf name plus the instructions that produce the owner on top of
/// the stack.
fn resolve_constant_owner(name: &Node) -> Result<(String, Vec<I>), LowerError> {
    match name {
        Node::Sym(leaf) => Ok((leaf.clone(), vec![I::PushSelf])),
        Node::Sexp(sexp) if sexp.tag == "colon2" => {
            let leaf = sym_child(sexp, 1, "a constant name")?.to_string();
            let mut prep = Vec::new();
            lower_expr(sexp.child(0), true, &mut prep)?;
            Ok((leaf, prep))
        }
        Node::Sexp(sexp) if sexp.tag == "colon3" => {
            let leaf = sym_child(sexp, 0, "a constant name")?.to_string();
            Ok((leaf, vec![I::PushObjectClass]))
        }
        other => Err(LowerError::UnknownConstantName(
            other.kind_name().to_string(),
        )),
    }
}

// ── Formal parameters ────────────────────────────────────────────────

/// Arity is the raw parameter-list child count. Optional, splat, and
/// destructured parameters all count as one; a later pass reconciles
/// this with the richer binding emitted below.
fn param_count(params: &Node) -> usize {
    match params.as_sexp() {
        Some(sexp) => sexp.children.len(),
        None => 0,
    }
}

fn is_splat(param: &Node) -> bool {
    matches!(param, Node::Sym(name) if name.starts_with('*'))
}

/// Bind formal parameters at the head of a method or block region.
///
/// When every parameter is a bare name, each binds directly from its
/// positional slot. Any splat or nested shape switches to the general
/// path: materialize the argument array and destructure it.
fn lower_formals(params: &Node, used: bool, out: &mut Vec<I>) -> Result<(), LowerError> {
    if !used {
        return Ok(());
    }
    let list: &[Node] = match params {
        Node::Nil => &[],
        Node::Sexp(sexp) if sexp.tag == "args" => &sexp.children,
        other => return Err(LowerError::UnknownConstruct(other.kind_name().to_string())),
    };
    let simple = list
        .iter()
        .all(|param| matches!(param, Node::Sym(name) if !name.starts_with('*')));
    if simple {
        for (index, param) in list.iter().enumerate() {
            if let Node::Sym(name) = param {
                out.push(I::PushArg(index));
                out.push(I::VariableSet {
                    name: name.clone(),
                    local_only: true,
                });
            }
        }
    } else {
        out.push(I::PushArgs);
        lower_param_array(list, out)?;
        out.push(I::Pop);
    }
    Ok(())
}

/// Destructure the argument array on top of the stack: leading
/// positionals shift from the front, trailing positionals (after a
/// splat) pop from the back, and the splat takes what remains. The
/// array itself stays on the stack for the caller to discard.
fn lower_param_array(params: &[Node], out: &mut Vec<I>) -> Result<(), LowerError> {
    match params.iter().position(is_splat) {
        None => {
            for param in params {
                out.push(I::ArrayShift);
                bind_param(param, out)?;
            }
        }
        Some(splat) => {
            for param in &params[..splat] {
                out.push(I::ArrayShift);
                bind_param(param, out)?;
            }
            for param in params[splat + 1..].iter().rev() {
                out.push(I::ArrayPop);
                bind_param(param, out)?;
            }
            if let Node::Sym(name) = &params[splat] {
                let rest = &name[1..];
                // A bare `*` discards the remainder.
                if !rest.is_empty() {
                    out.push(I::Dup);
                    out.push(I::VariableSet {
                        name: rest.to_string(),
                        local_only: true,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Bind one extracted element (on top of the stack) to a parameter.
fn bind_param(param: &Node, out: &mut Vec<I>) -> Result<(), LowerError> {
    match param {
        Node::Sym(name) if !name.starts_with('*') => {
            out.push(I::VariableSet {
                name: name.clone(),
                local_only: true,
            });
            Ok(())
        }
        Node::Sexp(sexp) if sexp.tag == "lasgn" => {
            let name = sym_child(sexp, 0, "a parameter name")?.to_string();
            if sexp.children.len() > 1 {
                // Optional parameter: fall back to the default when the
                // slot came through empty. An explicit nil argument is
                // indistinguishable from an absent one here.
                out.push(I::Dup);
                out.push(I::If);
                out.push(I::Else(ScopeTag::If));
                out.push(I::Pop);
                lower_expr(sexp.child(1), true, out)?;
                out.push(I::End(ScopeTag::If));
            }
            out.push(I::VariableSet {
                name,
                local_only: true,
            });
            Ok(())
        }
        Node::Sexp(sexp) if sexp.tag == "masgn" => {
            // Nested destructure: the element is itself an argument
            // array.
            let sub = match sexp.child(0).as_sexp() {
                Some(array) if array.tag == "array" => &array.children,
                _ => {
                    return Err(LowerError::MalformedNode {
                        tag: sexp.tag.clone(),
                        expected: "a destructure array",
                    })
                }
            };
            lower_param_array(sub, out)?;
            out.push(I::Pop);
            Ok(())
        }
        other => Err(LowerError::UnknownParameter(other.kind_name().to_string())),
    }
}

// ── Shared helpers ───────────────────────────────────────────────────

fn sym_child<'a>(
    sexp: &'a Sexp,
    index: usize,
    expected: &'static str,
) -> Result<&'a str, LowerError> {
    sexp.child(index)
        .as_sym()
        .ok_or_else(|| LowerError::MalformedNode {
            tag: sexp.tag.clone(),
            expected,
        })
}

// ── Tests ────────────────────────────────────────────────────────────
