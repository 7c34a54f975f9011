use super::*;
use crate::addr::GAddr;
use crate::error::TaskError;
use crate::program::Builtin;

fn list(items: &[f64]) -> WireValue {
    items.iter().rev().enumerate().fold(WireValue::Nil, |tail, (i, n)| WireValue::Cons {
        addr: GAddr::new(0, i as u32 + 1),
        head: Box::new(WireValue::Number(*n)),
        tail: Box::new(tail),
    })
}

fn round_trip(msg: Message) {
    let bytes = encode_message(&msg);
    assert_eq!(bytes[0], VERSION);
    let back = decode_message(&bytes).unwrap_or_else(|e| panic!("decode {}: {:#}", msg.name(), e));
    assert_eq!(back, msg);
}

#[test]
fn every_message_kind_decodes_to_itself() {
    let a = GAddr::new(0, 5);
    let b = GAddr::new(1, 9);
    let messages = vec![
        Message::Fetch { target: a, store: b },
        Message::Respond {
            store: b,
            value: list(&[1.0, 2.0, 3.0]),
        },
        Message::Schedule {
            frames: vec![ScheduledFrame {
                tell: a,
                frame: WireValue::Frame {
                    addr: a,
                    fno: 3,
                    pc: 17,
                    slots: vec![WireValue::Number(4.0), WireValue::Ref(b)],
                },
            }],
        },
        Message::UpdateRef { tell: a, addr: b },
        Message::Ack { count: 3, addr_count: 7 },
        Message::Fish { from: 2, hops: 1, count: 2 },
        Message::StartDistGc { epoch: 1 },
        Message::MarkRoots { epoch: 1 },
        Message::MarkEntry {
            epoch: 1,
            addrs: vec![a, b],
        },
        Message::Sweep { epoch: 1 },
        Message::GcUpdate {
            epoch: 1,
            sent: vec![0, 3],
            received: vec![2, 0],
            roots_marked: true,
        },
        Message::GcAck {
            epoch: 1,
            phase: GcPhase::Swept,
        },
        Message::Output { bytes: b"hi\n".to_vec() },
        Message::ReportError {
            error: TaskError {
                task: 1,
                message: "division by zero".into(),
                location: "main+4".into(),
            },
        },
        Message::Shutdown,
    ];
    for msg in messages {
        round_trip(msg);
    }
}

#[test]
fn nested_values_keep_their_shape() {
    let addr = GAddr::new(3, 1);
    let value = WireValue::Cap {
        addr,
        fno: 2,
        arity: 3,
        args: vec![
            WireValue::Array {
                addr: GAddr::new(3, 2),
                data: WireArray::Bytes(b"abc".to_vec()),
            },
            WireValue::ArrayRef {
                addr: GAddr::new(3, 3),
                array: Box::new(WireValue::Array {
                    addr: GAddr::new(3, 4),
                    data: WireArray::Values(vec![WireValue::Nil, WireValue::Scref(7)]),
                }),
                start: 1,
            },
            WireValue::Builtin(Builtin::Head),
        ],
    };
    round_trip(Message::Respond {
        store: GAddr::new(0, 1),
        value,
    });
}

#[test]
fn special_doubles_survive_encoding() {
    for n in [0.0, -0.0, f64::INFINITY, f64::NEG_INFINITY, f64::MAX, 1e-300] {
        let msg = Message::Respond {
            store: GAddr::new(0, 1),
            value: WireValue::Number(n),
        };
        match decode_message(&encode_message(&msg)).unwrap() {
            Message::Respond {
                value: WireValue::Number(back),
                ..
            } => assert_eq!(back.to_bits(), n.to_bits()),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[test]
fn version_mismatch_is_rejected() {
    let mut bytes = encode_message(&Message::Shutdown);
    bytes[0] = VERSION + 1;
    let err = decode_message(&bytes).unwrap_err();
    assert!(err.to_string().contains("version"));
}

#[test]
fn primitive_tags_are_checked() {
    let mut enc = Encoder::new();
    enc.write_int(7);
    let bytes = enc.finish();
    let mut dec = Decoder::new(&bytes);
    assert!(dec.read_gaddr().is_err());

    let mut dec = Decoder::new(&bytes);
    assert_eq!(dec.read_int().unwrap(), 7);
    assert!(dec.is_at_end());
}

#[test]
fn truncated_frames_fail_cleanly() {
    let bytes = encode_message(&Message::Respond {
        store: GAddr::new(0, 1),
        value: list(&[1.0, 2.0, 3.0, 4.0, 5.0]),
    });
    for cut in 1..bytes.len() {
        assert!(decode_message(&bytes[..cut]).is_err(), "prefix of {} bytes accepted", cut);
    }
}

#[test]
fn trailing_garbage_is_rejected() {
    let mut bytes = encode_message(&Message::Shutdown);
    bytes.push(0);
    assert!(decode_message(&bytes).is_err());
}

#[test]
fn deep_nesting_is_bounded() {
    let mut v = WireValue::Nil;
    for i in 0..600 {
        v = WireValue::Cons {
            addr: GAddr::new(0, i),
            head: Box::new(WireValue::Number(0.0)),
            tail: Box::new(v),
        };
    }
    let bytes = encode_message(&Message::Respond {
        store: GAddr::new(0, 1),
        value: v,
    });
    assert!(decode_message(&bytes).is_err());
}

#[test]
fn counted_messages_report_their_addresses() {
    let msg = Message::Respond {
        store: GAddr::new(1, 1),
        value: list(&[1.0, 2.0]),
    };
    assert!(msg.is_counted());
    assert_eq!(msg.addresses().len(), 3);
    assert!(!Message::Fish { from: 0, hops: 1, count: 1 }.is_counted());
}
