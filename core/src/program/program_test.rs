use super::*;

fn answer() -> Program {
    let mut b = ProgramBuilder::new();
    let main = b.function("main", 0, 1);
    b.emit(Instr::PushNumber(42.0)).emit(Instr::Return);
    b.finish(main).expect("finish")
}

#[test]
fn builder_brackets_code_and_records_entries() {
    let p = answer();
    assert_eq!(p.code.first(), Some(&Instr::Begin));
    assert_eq!(p.code.last(), Some(&Instr::End));
    assert_eq!(p.functions[0].address, 1);
    assert_eq!(p.code[1], Instr::GlobStart(0));
}

#[test]
fn labels_are_patched_on_finish() {
    let mut b = ProgramBuilder::new();
    let main = b.function("main", 0, 2);
    let done = b.label();
    b.emit(Instr::PushNumber(1.0)).emit(Instr::PushNumber(2.0));
    b.jcmp(CmpOp::Lt, done);
    b.emit(Instr::PushNumber(3.0)).emit(Instr::Return);
    b.bind(done);
    b.emit(Instr::PushNumber(4.0)).emit(Instr::Return);
    let p = b.finish(main).unwrap();
    let target = p
        .code
        .iter()
        .find_map(|i| match i {
            Instr::JCmp(CmpOp::Lt, t) => Some(*t),
            _ => None,
        })
        .unwrap();
    assert_eq!(p.code[target as usize], Instr::PushNumber(4.0));
}

#[test]
fn unbound_label_is_an_error() {
    let mut b = ProgramBuilder::new();
    let main = b.function("main", 0, 1);
    let nowhere = b.label();
    b.jump(nowhere);
    assert!(b.finish(main).is_err());
}

#[test]
fn json_round_trip_preserves_program() {
    let p = answer();
    let json = p.to_json().unwrap();
    assert!(json.contains("\"PushNumber\""));
    let back = Program::from_json(&json).unwrap();
    assert_eq!(back, p);
}

#[test]
fn json_function_fields_have_defaults() {
    let src = r#"{
        "functions": [{"name": "main", "arity": 0, "stack_depth": 1, "address": 1}],
        "code": ["Begin", {"GlobStart": 0}, {"PushNumber": 7.0}, "Return", "End"],
        "main": 0
    }"#;
    let loaded = Program::from_json(src).unwrap().load().unwrap();
    let main = loaded.function(0).unwrap();
    assert_eq!(main.entry_ne(), 1);
    assert!(main.missing_entries.is_empty());
}

#[test]
fn loading_appends_stubs_and_wrappers() {
    let loaded = answer().load().unwrap();
    assert_eq!(loaded.user_functions(), 1);

    let eval = loaded.function(loaded.eval_stub).unwrap();
    assert_eq!(eval.arity, 1);
    assert_eq!(loaded.instr(eval.address + 1).unwrap(), Instr::Eval(0));

    let apply = loaded.function(loaded.apply_stub).unwrap();
    assert_eq!(loaded.instr(apply.address + 2).unwrap(), Instr::Do);

    let add = loaded.function(loaded.wrapper(Builtin::Add)).unwrap();
    assert_eq!(add.arity, 2);
    let body: Vec<Instr> = (1..=4).map(|i| loaded.instr(add.address + i).unwrap()).collect();
    assert_eq!(body, vec![Instr::Eval(0), Instr::Eval(1), Instr::Bif(Builtin::Add), Instr::Return]);

    let cons = loaded.function(loaded.wrapper(Builtin::Cons)).unwrap();
    assert_eq!(loaded.instr(cons.address + 1).unwrap(), Instr::Bif(Builtin::Cons));
}

#[test]
fn loader_rejects_malformed_programs() {
    let mut bad_main = answer();
    bad_main.functions[0].arity = 1;
    bad_main.functions[0].stack_depth = 1;
    assert!(bad_main.load().is_err());

    let mut bad_jump = answer();
    let end = bad_jump.code.len() - 1;
    bad_jump.code.insert(end, Instr::Jump(999));
    assert!(bad_jump.load().is_err());

    let mut bad_frame = answer();
    let end = bad_frame.code.len() - 1;
    bad_frame.code.insert(end, Instr::MkFrame { fno: 0, n: 2 });
    assert!(bad_frame.load().is_err());

    let mut no_end = answer();
    no_end.code.pop();
    assert!(no_end.load().is_err());
}

#[test]
fn describe_names_function_and_offset() {
    let loaded = answer().load().unwrap();
    assert_eq!(loaded.describe(0, 2), "main+1");
}

#[test]
fn cap_entry_uses_missing_entries_for_short_applications() {
    let mut f = FunctionInfo::new("f", 3, 3, 10);
    f.missing_entries = vec![20, 30];
    assert_eq!(f.entry_for(2, 1), 20);
    assert_eq!(f.entry_for(1, 2), 30);
    assert_eq!(f.entry_for(0, 3), 10);
    assert_eq!(f.entry_for(0, 1), 10);
}
