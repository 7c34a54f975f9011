use super::dgc::Report;
use super::testkit::{self, Cluster};
use crate::addr::TaskId;
use crate::config::RuntimeConfig;
use crate::heap::Pntr;
use crate::wire::{Message, WireValue};

fn cluster() -> Cluster {
    cluster_of(2)
}

fn cluster_of(ntasks: u32) -> Cluster {
    let config = RuntimeConfig {
        dist_gc_interval_ms: 3_600_000,
        ..testkit::config()
    };
    Cluster::with_config(testkit::fact_program(1.0), ntasks, config)
}

/// Hand task `tid` the messages it sent to itself.
fn drain_local(c: &mut Cluster, tid: TaskId) {
    while let Some(msg) = c.task(tid).local.pop_front() {
        c.tasks[tid as usize].deliver(tid, msg);
    }
}

/// Start an epoch and get every task into it before anything else runs.
fn start_epoch(c: &mut Cluster) {
    c.task(0).begin_dist_gc().unwrap();
    for (to, msg) in c.tasks[0].take_sent() {
        c.tasks[to as usize].deliver(0, msg);
    }
    drain_local(c, 0);
    for t in &c.tasks {
        assert!(t.task.dgc.active);
    }
}

fn finish_epoch(c: &mut Cluster) {
    for _ in 0..100 {
        c.round();
        if !c.task(0).dgc.is_coordinating() {
            return;
        }
    }
    panic!("distributed collection did not finish");
}

#[test]
fn unreferenced_addresses_are_swept() {
    let mut c = cluster();
    let nil = c.task(0).heap.nil();
    let kept = c.task(0).heap.cons(Pntr::number(1.0), nil);
    let dropped = c.task(0).heap.cons(Pntr::number(2.0), nil);
    let a1 = c.task(0).globals.make_phys(kept);
    let a2 = c.task(0).globals.make_phys(dropped);

    let remote = c.task(1).import(WireValue::Ref(a1)).unwrap();
    let result = c.tasks[1].demand(remote);

    start_epoch(&mut c);
    finish_epoch(&mut c);
    assert!(c.task(0).globals.find_addr(a1).is_some());
    assert!(c.task(0).globals.find_addr(a2).is_none());
    assert!(!c.task(1).dgc.active);
    assert_eq!(c.task(0).stats.dist_epochs, 1);

    // the blocked reader resumes once the epoch is over
    c.pump();
    assert_eq!(testkit::numbers(&c.tasks[1].task, result), vec![1.0]);
    assert!(c.task(0).globals.check_consistency().is_ok());
}

#[test]
fn addresses_in_unacknowledged_messages_survive() {
    let mut c = cluster();
    let nil = c.task(0).heap.nil();
    let carried = c.task(0).heap.cons(Pntr::number(7.0), nil);
    let stray = c.task(0).heap.cons(Pntr::number(9.0), nil);
    let a2 = c.task(0).globals.make_phys(stray);
    let stub = c.task(0).program.eval_stub;
    let entry = c.task(0).program.function(stub).unwrap().address;
    let (_, cell) = c.task(0).spawn_frame(stub, entry, vec![carried]).unwrap();
    c.task(0).spark(Pntr::cell(cell)).unwrap();

    // the migrated frame is the only thing naming `carried`; hold it back
    c.tasks[0].deliver(1, Message::Fish { from: 1, hops: 0, count: 1 });
    let held = c.tasks[0].take_sent();
    assert!(matches!(held.as_slice(), [(1, Message::Schedule { .. })]));
    let gid = c.task(0).globals.phys_of(carried).expect("exported with an address");
    let carried_addr = c.task(0).globals.get(gid).unwrap().addr;

    start_epoch(&mut c);
    finish_epoch(&mut c);
    assert!(c.task(0).globals.find_addr(carried_addr).is_some());
    assert!(c.task(0).globals.find_addr(a2).is_none());

    for (to, msg) in held {
        c.tasks[to as usize].deliver(0, msg);
    }
    c.pump();
    let back = c.tasks[0].demand(Pntr::cell(cell));
    c.pump();
    assert_eq!(testkit::numbers(&c.tasks[0].task, back), vec![7.0]);
}

#[test]
fn heap_messages_wait_for_the_sweep() {
    let mut c = cluster();
    let nil = c.task(0).heap.nil();
    let list = c.task(0).heap.cons(Pntr::number(5.0), nil);
    let a1 = c.task(0).globals.make_phys(list);
    let remote = c.task(1).import(WireValue::Ref(a1)).unwrap();
    let result = c.tasks[1].demand(remote);
    c.tasks[1].run_until_idle(false);
    let fetch = c.tasks[1].take_sent();

    start_epoch(&mut c);
    for (to, msg) in fetch {
        c.tasks[to as usize].deliver(1, msg);
    }
    // deferred, so nothing answered yet
    assert!(c.tasks[0].take_sent().iter().all(|(_, m)| !matches!(m, Message::Respond { .. })));

    finish_epoch(&mut c);
    c.pump();
    assert_eq!(testkit::numbers(&c.tasks[1].task, result), vec![5.0]);
}

#[test]
fn stale_epoch_reports_are_ignored() {
    let mut c = cluster();
    start_epoch(&mut c);
    let epoch = c.task(0).dgc.epoch;
    let stale = Report {
        sent: vec![0, 0],
        received: vec![0, 0],
        roots_marked: true,
    };
    let r = c.task(0).handle_gc_update(1, epoch - 1, stale);
    assert!(r.is_ok());
    finish_epoch(&mut c);

    let err = c
        .task(0)
        .handle_gc_ack(1, epoch, crate::wire::GcPhase::Swept)
        .unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn queued_frames_wait_out_the_epoch() {
    let mut c = cluster();
    let result = c.tasks[1].demand(Pntr::number(6.0));
    start_epoch(&mut c);
    assert!(!c.task(1).run_queue.is_empty());
    assert!(!c.task(1).runnable());
    assert!(!c.tasks[1].run_until_idle(false));

    finish_epoch(&mut c);
    c.pump();
    assert_eq!(testkit::number(&c.tasks[1].task, result), 6.0);
}

/// Task 1's MARKROOTS is held back until a MARKENTRY from task 2 has reached
/// task 1 and its report has reached the coordinator.
#[test]
fn sweep_waits_for_roots_delivered_late() {
    let mut c = cluster_of(3);
    // c0 lives on task 0 and is read only by a queued frame on task 1
    let nil0 = c.task(0).heap.nil();
    let c0 = c.task(0).heap.cons(Pntr::number(3.0), nil0);
    let a0 = c.task(0).globals.make_phys(c0);
    let r0 = c.task(1).import(WireValue::Ref(a0)).unwrap();
    let on1 = c.tasks[1].demand(r0);
    // b1 lives on task 1 and is read from task 2
    let nil1 = c.task(1).heap.nil();
    let b1 = c.task(1).heap.cons(Pntr::number(4.0), nil1);
    let a1 = c.task(1).globals.make_phys(b1);
    let r1 = c.task(2).import(WireValue::Ref(a1)).unwrap();
    let on2 = c.tasks[2].demand(r1);

    start_epoch(&mut c);
    for tid in [1, 2] {
        for (to, msg) in c.tasks[tid as usize].take_sent() {
            assert_eq!(to, 0);
            c.tasks[0].deliver(tid, msg);
        }
    }
    let mut mark_roots = c.tasks[0].take_sent();
    assert_eq!(mark_roots.len(), 2);
    let held = mark_roots.remove(mark_roots.iter().position(|(to, _)| *to == 1).unwrap());
    for (to, msg) in mark_roots {
        c.tasks[to as usize].deliver(0, msg);
    }
    drain_local(&mut c, 0);

    // task 2 reaches b1: the entry goes to task 1, the report to task 0
    for (to, msg) in c.tasks[2].take_sent() {
        c.tasks[to as usize].deliver(2, msg);
    }
    for (to, msg) in c.tasks[1].take_sent() {
        assert!(matches!(msg, Message::GcUpdate { roots_marked: false, .. }));
        c.tasks[to as usize].deliver(1, msg);
    }
    drain_local(&mut c, 0);
    assert!(c.tasks[0].take_sent().iter().all(|(_, m)| !matches!(m, Message::Sweep { .. })));
    assert!(c.task(0).local.iter().all(|m| !matches!(m, Message::Sweep { .. })));

    let (to, msg) = held;
    c.tasks[to as usize].deliver(0, msg);
    finish_epoch(&mut c);
    assert!(c.task(0).globals.find_addr(a0).is_some());
    assert!(c.task(1).globals.find_addr(a1).is_some());

    c.pump();
    assert_eq!(testkit::numbers(&c.tasks[1].task, on1), vec![3.0]);
    assert_eq!(testkit::numbers(&c.tasks[2].task, on2), vec![4.0]);
}
