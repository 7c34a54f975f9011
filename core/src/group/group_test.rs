use std::thread;

use super::*;
use crate::program::{Builtin, Instr, ProgramBuilder};
use crate::task::testkit;

fn config() -> RuntimeConfig {
    RuntimeConfig {
        fish_interval_ms: 1,
        dist_gc_interval_ms: 5,
        seed: Some(11),
        ..RuntimeConfig::default()
    }
}

#[test]
fn single_task_runs_main() {
    let out = run_local(testkit::fact_program(10.0), 1, config()).unwrap();
    assert_eq!(out.result.unwrap(), Value::Number(3_628_800.0));
}

#[test]
fn group_size_does_not_change_the_result() {
    for ntasks in [1, 2, 4] {
        let out = run_local(testkit::parallel_sum_program(8), ntasks, config()).unwrap();
        // sum of k! for k in 1..=8
        assert_eq!(out.result.unwrap(), Value::Number(46_233.0), "{} tasks", ntasks);
    }
}

#[test]
fn small_slices_and_frequent_collection_agree() {
    let tight = RuntimeConfig {
        slice: 3,
        minor_gc_threshold: 16,
        major_every: 2,
        ..config()
    };
    let out = run_local(testkit::parallel_sum_program(6), 3, tight).unwrap();
    assert_eq!(out.result.unwrap(), Value::Number(873.0));
}

#[test]
fn application_errors_become_the_result() {
    let mut b = ProgramBuilder::new();
    let main = b.function("main", 0, 2);
    b.emit(Instr::PushNumber(1.0))
        .emit(Instr::PushNumber(0.0))
        .emit(Instr::Bif(Builtin::Mod))
        .emit(Instr::Return);
    let out = run_local(b.finish(main).unwrap(), 2, config()).unwrap();
    let err = out.result.unwrap_err();
    assert_eq!(err.task, 0);
    assert!(err.message.contains("by zero"), "{}", err.message);
}

#[test]
fn printed_text_is_returned_as_output() {
    let mut b = ProgramBuilder::new();
    let text = b.string("hi\n");
    let main = b.function("main", 0, 1);
    b.emit(Instr::PushString(text))
        .emit(Instr::Bif(Builtin::Print))
        .emit(Instr::Pop(1))
        .emit(Instr::PushNil)
        .emit(Instr::Return);
    let out = run_local(b.finish(main).unwrap(), 2, config()).unwrap();
    assert_eq!(out.result.unwrap(), Value::Nil);
    assert_eq!(out.output, b"hi\n");
}

#[test]
fn zero_tasks_is_rejected() {
    assert!(run_local(testkit::trivial_program(), 0, config()).is_err());
}

#[test]
fn host_lists_skip_comments() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hosts");
    std::fs::write(&path, "# group\nalpha\n\n  beta  \n").unwrap();
    assert_eq!(read_hosts(&path).unwrap(), vec!["alpha", "beta"]);

    std::fs::write(&path, "# nobody\n").unwrap();
    assert!(read_hosts(&path).is_err());
}

#[test]
fn master_and_workers_over_tcp() {
    let hosts = vec!["127.0.0.1".to_string(); 3];
    let master = Master::bind("127.0.0.1:0", hosts, config()).unwrap();
    let addr = master.local_addr().unwrap();
    let workers: Vec<_> = (0..3)
        .map(|_| {
            let addr = addr.clone();
            thread::spawn(move || run_worker(&addr, "127.0.0.1:0"))
        })
        .collect();

    let out = master.run(testkit::parallel_sum_program(6)).unwrap();
    assert_eq!(out.result.unwrap(), Value::Number(873.0));
    for w in workers {
        w.join().unwrap().unwrap();
    }
}
