//! Stream verification — stack-effect and scope-balance checking.
//!
//! Simulates an instruction stream against the documented stack effects:
//! heights through branches must agree, scope markers must nest LIFO, and
//! `Send`/`Yield` must find the argc marker they consume. Used by the test
//! suites and offered to the backend as a debugging aid for streams of
//! unknown provenance.

use crate::instruction::{Instruction, ScopeTag};

/// A shadow-stack cell. Argc markers are tracked by value so `Send` and
/// `Yield` can be charged for the arguments they consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cell {
    Value,
    Argc(usize),
}

/// An open structured-control region.
enum Region {
    If { entry: usize, branch: Option<usize> },
    Rescue { entry: usize, branch: Option<usize> },
    While { entry: usize, in_body: bool },
    Define { tag: ScopeTag, saved: Vec<Cell> },
}

fn err(pc: usize, msg: impl Into<String>) -> String {
    format!("pc={pc}: {}", msg.into())
}

fn pop_value(stack: &mut Vec<Cell>, pc: usize, what: &str) -> Result<(), String> {
    match stack.pop() {
        Some(Cell::Value) => Ok(()),
        Some(Cell::Argc(_)) => Err(err(pc, format!("{what} consumed an argc marker"))),
        None => Err(err(pc, format!("stack underflow in {what}"))),
    }
}

fn pop_argc(stack: &mut Vec<Cell>, pc: usize, what: &str) -> Result<usize, String> {
    match stack.pop() {
        Some(Cell::Argc(count)) => Ok(count),
        Some(Cell::Value) => Err(err(pc, format!("{what} expected an argc marker"))),
        None => Err(err(pc, format!("stack underflow in {what}"))),
    }
}

/// Branch joins compare heights only; pad or truncate back to the height
/// the region was entered at.
fn reset_height(stack: &mut Vec<Cell>, target: usize) {
    while stack.len() > target {
        stack.pop();
    }
    while stack.len() < target {
        stack.push(Cell::Value);
    }
}

/// Simulate `stream` and return the net stack height it leaves behind.
///
/// Fails on underflow, unbalanced branches, unclosed or mismatched
/// regions, and argc markers left stranded.
pub fn check(stream: &[Instruction]) -> Result<usize, String> {
    let mut stack: Vec<Cell> = Vec::new();
    let mut regions: Vec<Region> = Vec::new();

    for (pc, ins) in stream.iter().enumerate() {
        match ins {
            Instruction::PushInt(_)
            | Instruction::PushFloat(_)
            | Instruction::PushSymbol(_)
            | Instruction::PushString { .. }
            | Instruction::PushTrue
            | Instruction::PushFalse
            | Instruction::PushNil
            | Instruction::PushSelf
            | Instruction::PushObjectClass
            | Instruction::PushArg(_)
            | Instruction::PushArgs
            | Instruction::VariableGet(_)
            | Instruction::InstanceVariableGet(_)
            | Instruction::GlobalVariableGet(_) => stack.push(Cell::Value),

            Instruction::PushArgc(count) => stack.push(Cell::Argc(*count)),

            Instruction::PushRange { .. } => {
                pop_value(&mut stack, pc, "push_range")?;
                pop_value(&mut stack, pc, "push_range")?;
                stack.push(Cell::Value);
            }

            Instruction::CreateArray { count } => {
                for _ in 0..*count {
                    pop_value(&mut stack, pc, "create_array")?;
                }
                stack.push(Cell::Value);
            }

            Instruction::CreateHash { count } => {
                for _ in 0..count * 2 {
                    pop_value(&mut stack, pc, "create_hash")?;
                }
                stack.push(Cell::Value);
            }

            Instruction::Dup => match stack.last() {
                Some(Cell::Value) => stack.push(Cell::Value),
                Some(Cell::Argc(_)) => return Err(err(pc, "dup of an argc marker")),
                None => return Err(err(pc, "stack underflow in dup")),
            },

            Instruction::DupRel(depth) => {
                if stack.len() < depth + 1 {
                    return Err(err(pc, format!("dup_rel {depth} reaches below the stack")));
                }
                match stack[stack.len() - 1 - depth] {
                    Cell::Value => stack.push(Cell::Value),
                    Cell::Argc(_) => return Err(err(pc, "dup_rel of an argc marker")),
                }
            }

            Instruction::Swap => {
                let len = stack.len();
                if len < 2 {
                    return Err(err(pc, "stack underflow in swap"));
                }
                stack.swap(len - 1, len - 2);
            }

            Instruction::Pop => pop_value(&mut stack, pc, "pop")?,

            Instruction::VariableSet { .. }
            | Instruction::InstanceVariableSet(_)
            | Instruction::GlobalVariableSet(_) => pop_value(&mut stack, pc, "set")?,

            Instruction::ConstFind(_) => {
                pop_value(&mut stack, pc, "const_find")?;
                stack.push(Cell::Value);
            }

            Instruction::ConstSet(_) => {
                pop_value(&mut stack, pc, "const_set owner")?;
                pop_value(&mut stack, pc, "const_set value")?;
            }

            Instruction::Send { .. } => {
                pop_value(&mut stack, pc, "send receiver")?;
                let count = pop_argc(&mut stack, pc, "send")?;
                for _ in 0..count {
                    pop_value(&mut stack, pc, "send argument")?;
                }
                stack.push(Cell::Value);
            }

            Instruction::Yield => {
                let count = pop_argc(&mut stack, pc, "yield")?;
                for _ in 0..count {
                    pop_value(&mut stack, pc, "yield argument")?;
                }
                stack.push(Cell::Value);
            }

            Instruction::If => {
                pop_value(&mut stack, pc, "if test")?;
                regions.push(Region::If {
                    entry: stack.len(),
                    branch: None,
                });
            }

            Instruction::Else(tag) => match regions.last_mut() {
                Some(Region::If { entry, branch }) if *tag == ScopeTag::If => {
                    if branch.is_some() {
                        return Err(err(pc, "second else in an if region"));
                    }
                    *branch = Some(stack.len());
                    let entry = *entry;
                    reset_height(&mut stack, entry);
                }
                Some(Region::Rescue { entry, branch }) if *tag == ScopeTag::Rescue => {
                    if branch.is_some() {
                        return Err(err(pc, "second else in a rescue region"));
                    }
                    *branch = Some(stack.len());
                    let entry = *entry;
                    reset_height(&mut stack, entry);
                }
                Some(Region::While { entry, in_body }) if *tag == ScopeTag::While => {
                    if *in_body {
                        return Err(err(pc, "second else in a while region"));
                    }
                    pop_value(&mut stack, pc, "loop test")?;
                    if stack.len() != *entry {
                        return Err(err(pc, "loop test left extra values"));
                    }
                    *in_body = true;
                }
                Some(_) => return Err(err(pc, format!("else {tag} does not match the open region"))),
                None => return Err(err(pc, format!("else {tag} without an open region"))),
            },

            Instruction::End(tag) => match regions.pop() {
                Some(Region::If { branch, .. }) if *tag == ScopeTag::If => {
                    let branch =
                        branch.ok_or_else(|| err(pc, "if region closed without an else"))?;
                    if stack.len() != branch {
                        return Err(err(
                            pc,
                            format!(
                                "if branches disagree on height ({} vs {})",
                                branch,
                                stack.len()
                            ),
                        ));
                    }
                }
                Some(Region::Rescue { entry, branch }) if *tag == ScopeTag::Rescue => {
                    let branch =
                        branch.ok_or_else(|| err(pc, "rescue region closed without an else"))?;
                    if branch != entry + 1 {
                        return Err(err(pc, "protected body must leave exactly one value"));
                    }
                    if stack.len() != entry + 1 {
                        return Err(err(pc, "handler path must leave exactly one value"));
                    }
                }
                Some(Region::While { entry, in_body }) if *tag == ScopeTag::While => {
                    if !in_body {
                        return Err(err(pc, "while region closed without a body segment"));
                    }
                    if stack.len() != entry {
                        return Err(err(pc, "loop body must be stack-neutral"));
                    }
                }
                Some(Region::Define { tag: opened, saved }) if *tag == opened => {
                    if stack.len() != 1 || stack[0] != Cell::Value {
                        return Err(err(pc, "define region body must leave exactly one value"));
                    }
                    stack = saved;
                }
                Some(_) => return Err(err(pc, format!("end {tag} does not match the open region"))),
                None => return Err(err(pc, format!("end {tag} without an open region"))),
            },

            Instruction::DefineMethod { .. } => regions.push(Region::Define {
                tag: ScopeTag::DefineMethod,
                saved: std::mem::take(&mut stack),
            }),

            Instruction::DefineBlock { .. } => regions.push(Region::Define {
                tag: ScopeTag::DefineBlock,
                saved: std::mem::take(&mut stack),
            }),

            Instruction::DefineClass(_) => {
                pop_value(&mut stack, pc, "define_class owner")?;
                pop_value(&mut stack, pc, "define_class superclass")?;
                regions.push(Region::Define {
                    tag: ScopeTag::DefineClass,
                    saved: std::mem::take(&mut stack),
                });
            }

            Instruction::DefineModule(_) => {
                pop_value(&mut stack, pc, "define_module owner")?;
                regions.push(Region::Define {
                    tag: ScopeTag::DefineModule,
                    saved: std::mem::take(&mut stack),
                });
            }

            Instruction::Try => regions.push(Region::Rescue {
                entry: stack.len(),
                branch: None,
            }),

            Instruction::MatchException => {
                pop_value(&mut stack, pc, "match_exception")?;
                stack.push(Cell::Value);
            }

            Instruction::Reraise | Instruction::Break | Instruction::Next => {}

            Instruction::While => regions.push(Region::While {
                entry: stack.len(),
                in_body: false,
            }),

            Instruction::ArrayShift | Instruction::ArrayPop => {
                match stack.last() {
                    Some(Cell::Value) => stack.push(Cell::Value),
                    Some(Cell::Argc(_)) => {
                        return Err(err(pc, "array destructure of an argc marker"))
                    }
                    None => return Err(err(pc, "stack underflow in array destructure")),
                }
            }
        }
    }

    if !regions.is_empty() {
        return Err(format!("{} region(s) left open at end of stream", regions.len()));
    }
    if stack.iter().any(|cell| matches!(cell, Cell::Argc(_))) {
        return Err("argc marker left on the stack at end of stream".into());
    }
    Ok(stack.len())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction as I;

    #[test]
    fn balanced_if() {
        let stream = [
            I::PushTrue,
            I::If,
            I::PushInt(1),
            I::Else(ScopeTag::If),
            I::PushInt(2),
            I::End(ScopeTag::If),
        ];
        assert_eq!(check(&stream), Ok(1));
    }

    #[test]
    fn unbalanced_branches_rejected() {
        let stream = [
            I::PushTrue,
            I::If,
            I::PushInt(1),
            I::Else(ScopeTag::If),
            I::End(ScopeTag::If),
        ];
        assert!(check(&stream).is_err());
    }

    #[test]
    fn send_charges_argc() {
        let stream = [
            I::PushString {
                value: "hi".into(),
                length: 2,
            },
            I::PushArgc(1),
            I::PushSelf,
            I::Send {
                message: "puts".into(),
                receiver_is_self: true,
                with_block: false,
            },
        ];
        assert_eq!(check(&stream), Ok(1));
    }

    #[test]
    fn send_without_argc_rejected() {
        let stream = [
            I::PushSelf,
            I::PushSelf,
            I::Send {
                message: "inspect".into(),
                receiver_is_self: false,
                with_block: false,
            },
        ];
        assert!(check(&stream).is_err());
    }

    #[test]
    fn unclosed_region_rejected() {
        let stream = [I::PushTrue, I::If, I::PushNil];
        assert!(check(&stream).is_err());
    }

    #[test]
    fn mismatched_end_rejected() {
        let stream = [I::PushTrue, I::If, I::PushNil, I::End(ScopeTag::While)];
        assert!(check(&stream).is_err());
    }

    #[test]
    fn define_region_runs_in_own_frame() {
        let stream = [
            I::DefineMethod {
                name: "answer".into(),
                arity: 0,
            },
            I::PushInt(42),
            I::End(ScopeTag::DefineMethod),
        ];
        assert_eq!(check(&stream), Ok(0));
    }

    #[test]
    fn stranded_argc_rejected() {
        let stream = [I::PushArgc(0)];
        assert!(check(&stream).is_err());
    }
}
