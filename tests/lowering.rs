use ivy_compiler::instruction::ScopeTag;
use ivy_compiler::{lower, verify, Instruction, LowerError, Node};

// ── Documented end-to-end scenarios ──────────────────────────────────
// Each test feeds a literal tree through the public entry point and pins
// the exact emission.

fn s(tag: &str, children: Vec<Node>) -> Node {
    Node::sexp(tag, children)
}

fn lit(value: i64) -> Node {
    s("lit", vec![Node::Int(value)])
}

#[test]
fn literal_in_value_position() {
    let program = s("block", vec![lit(42)]);
    assert_eq!(lower(&program, true), Ok(vec![Instruction::PushInt(42)]));
}

#[test]
fn literal_in_discard_position() {
    let program = s("block", vec![lit(42)]);
    assert_eq!(lower(&program, false), Ok(vec![]));
}

#[test]
fn assignment_in_discard_position() {
    let program = s("block", vec![s("lasgn", vec![Node::sym("a"), lit(1)])]);
    assert_eq!(
        lower(&program, false),
        Ok(vec![
            Instruction::PushInt(1),
            Instruction::VariableSet {
                name: "a".into(),
                local_only: false
            }
        ])
    );
}

#[test]
fn conditional_in_value_position() {
    let program = s(
        "block",
        vec![s("if", vec![s("true", vec![]), lit(1), lit(2)])],
    );
    assert_eq!(
        lower(&program, true),
        Ok(vec![
            Instruction::PushTrue,
            Instruction::If,
            Instruction::PushInt(1),
            Instruction::Else(ScopeTag::If),
            Instruction::PushInt(2),
            Instruction::End(ScopeTag::If)
        ])
    );
}

#[test]
fn short_circuit_in_discard_position() {
    let lvar = |name: &str| s("lvar", vec![Node::sym(name)]);
    let program = s("block", vec![s("and", vec![lvar("x"), lvar("y")])]);
    assert_eq!(
        lower(&program, false),
        Ok(vec![
            Instruction::VariableGet("x".into()),
            Instruction::Dup,
            Instruction::If,
            Instruction::Pop,
            Instruction::VariableGet("y".into()),
            Instruction::Else(ScopeTag::If),
            Instruction::End(ScopeTag::If),
            Instruction::Pop
        ])
    );
}

#[test]
fn implicit_self_send_in_discard_position() {
    let call = s(
        "call",
        vec![
            Node::Nil,
            Node::sym("puts"),
            s("str", vec![Node::Str("hi".into())]),
        ],
    );
    let program = s("block", vec![call]);
    assert_eq!(
        lower(&program, false),
        Ok(vec![
            Instruction::PushString {
                value: "hi".into(),
                length: 2
            },
            Instruction::PushArgc(1),
            Instruction::PushSelf,
            Instruction::Send {
                message: "puts".into(),
                receiver_is_self: true,
                with_block: false
            },
            Instruction::Pop
        ])
    );
}

// ── Invariants over a program corpus ─────────────────────────────────
// Every lowering, simulated against the documented stack effects, must
// leave exactly one value when used and nothing otherwise, with all
// scope markers balanced. `verify::check` enforces both at once.

fn corpus() -> Vec<Node> {
    let lvar = |name: &str| s("lvar", vec![Node::sym(name)]);
    let call_self = |msg: &str| s("call", vec![Node::Nil, Node::sym(msg)]);
    vec![
        s("block", vec![lit(1), lit(2), lvar("x")]),
        s("block", vec![s("lasgn", vec![Node::sym("a"), lit(1)])]),
        s("block", vec![s("gasgn", vec![Node::sym("$a"), lvar("b")])]),
        s(
            "block",
            vec![s("cdecl", vec![Node::sym("MAX"), s("array", vec![lit(1)])])],
        ),
        s(
            "block",
            vec![s("hash", vec![s("lit", vec![Node::sym("k")]), lit(1)])],
        ),
        s("block", vec![s("dot2", vec![lit(1), lvar("n")])]),
        s(
            "block",
            vec![s("lit", vec![Node::range(Node::Int(0), Node::Int(9), true)])],
        ),
        s("block", vec![s("and", vec![lvar("x"), call_self("probe")])]),
        s("block", vec![s("or", vec![call_self("probe"), lvar("x")])]),
        s(
            "block",
            vec![s("if", vec![lvar("c"), call_self("a"), Node::Nil])],
        ),
        s(
            "block",
            vec![s(
                "case",
                vec![
                    lvar("x"),
                    s("when", vec![s("array", vec![lit(1), lit(2)]), call_self("a")]),
                    s("when", vec![s("array", vec![lit(3)]), call_self("b")]),
                    call_self("fallback"),
                ],
            )],
        ),
        s(
            "block",
            vec![s(
                "case",
                vec![
                    Node::Nil,
                    s("when", vec![s("array", vec![lvar("p"), lvar("q")]), lit(1)]),
                ],
            )],
        ),
        s(
            "block",
            vec![s(
                "iter",
                vec![
                    s("call", vec![lvar("list"), Node::sym("map")]),
                    s("args", vec![Node::sym("x")]),
                    s("call", vec![lvar("x"), Node::sym("succ")]),
                ],
            )],
        ),
        s("block", vec![s("yield", vec![lit(1), lit(2)])]),
        s(
            "block",
            vec![s(
                "defn",
                vec![
                    Node::sym("f"),
                    s(
                        "args",
                        vec![
                            Node::sym("a"),
                            s("lasgn", vec![Node::sym("b"), lit(9)]),
                            Node::sym("*rest"),
                        ],
                    ),
                    s("yield", vec![lvar("a")]),
                ],
            )],
        ),
        s(
            "block",
            vec![s(
                "class",
                vec![
                    Node::sym("Reader"),
                    s("const", vec![Node::sym("IO")]),
                    s("defn", vec![Node::sym("read"), Node::Nil]),
                ],
            )],
        ),
        s("block", vec![s("module", vec![Node::sym("Kit"), lit(1)])]),
        s(
            "block",
            vec![s("while", vec![lvar("going"), call_self("step")])],
        ),
        s(
            "block",
            vec![s("until", vec![lvar("done"), s("break", vec![])])],
        ),
        s(
            "block",
            vec![s(
                "dstr",
                vec![
                    Node::Str("got ".into()),
                    s("evstr", vec![lvar("x")]),
                ],
            )],
        ),
        s(
            "block",
            vec![s(
                "rescue",
                vec![
                    call_self("risky"),
                    s(
                        "resbody",
                        vec![
                            s(
                                "array",
                                vec![
                                    s("const", vec![Node::sym("IOError")]),
                                    s(
                                        "lasgn",
                                        vec![Node::sym("e"), s("gvar", vec![Node::sym("$!")])],
                                    ),
                                ],
                            ),
                            s("lvar", vec![Node::sym("e")]),
                        ],
                    ),
                    s("resbody", vec![s("array", vec![]), lit(0)]),
                ],
            )],
        ),
        s(
            "block",
            vec![s("ensure", vec![call_self("risky"), call_self("cleanup")])],
        ),
        s(
            "block",
            vec![s(
                "attrasgn",
                vec![lvar("p"), Node::sym("x="), lit(1)],
            )],
        ),
    ]
}

#[test]
fn stack_effects_are_sound() {
    for program in corpus() {
        let used = lower(&program, true).expect("lowering failed");
        assert_eq!(
            verify::check(&used),
            Ok(1),
            "used stream for {program:?}: {used:?}"
        );
        let unused = lower(&program, false).expect("lowering failed");
        assert_eq!(
            verify::check(&unused),
            Ok(0),
            "unused stream for {program:?}: {unused:?}"
        );
    }
}

#[test]
fn lowering_is_deterministic() {
    for program in corpus() {
        assert_eq!(lower(&program, true), lower(&program, true));
        assert_eq!(lower(&program, false), lower(&program, false));
    }
}

#[test]
fn else_markers_sit_between_open_and_close() {
    for program in corpus() {
        let stream = lower(&program, true).expect("lowering failed");
        let mut open: Vec<ScopeTag> = Vec::new();
        for ins in &stream {
            match ins {
                Instruction::If => open.push(ScopeTag::If),
                Instruction::Try => open.push(ScopeTag::Rescue),
                Instruction::While => open.push(ScopeTag::While),
                Instruction::DefineMethod { .. } => open.push(ScopeTag::DefineMethod),
                Instruction::DefineBlock { .. } => open.push(ScopeTag::DefineBlock),
                Instruction::DefineClass(_) => open.push(ScopeTag::DefineClass),
                Instruction::DefineModule(_) => open.push(ScopeTag::DefineModule),
                Instruction::Else(tag) => assert_eq!(open.last(), Some(tag)),
                Instruction::End(tag) => assert_eq!(open.pop().as_ref(), Some(tag)),
                _ => {}
            }
        }
        assert!(open.is_empty(), "unclosed scopes in {stream:?}");
    }
}

// ── Error surface ────────────────────────────────────────────────────

#[test]
fn errors_abort_the_whole_transformation() {
    let program = s(
        "block",
        vec![lit(1), s("wibble", vec![]), lit(2)],
    );
    assert_eq!(
        lower(&program, false),
        Err(LowerError::UnknownConstruct("wibble".into()))
    );
}

#[test]
fn root_validation() {
    assert_eq!(
        lower(&s("call", vec![Node::Nil, Node::sym("f")]), true),
        Err(LowerError::UnexpectedRoot("call".into()))
    );
}

#[test]
fn errors_render_with_context() {
    let err = LowerError::UnknownConstruct("wibble".into());
    assert_eq!(err.to_string(), "no lowering rule for `wibble` nodes");
    let err = LowerError::UnexpectedIterCall("lit".into());
    assert_eq!(err.to_string(), "block form expects a `call` head, got `lit`");
}
