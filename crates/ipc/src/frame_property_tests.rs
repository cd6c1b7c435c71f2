// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Round-trip property tests for the frame codec.

use super::*;
use proptest::prelude::*;
use serde_json::json;

fn ident_strategy() -> impl Strategy<Value = FrameIdent> {
    let id = "[a-z0-9-]{1,32}";
    prop_oneof![
        id.prop_map(FrameIdent::job),
        id.prop_map(FrameIdent::process),
        id.prop_map(FrameIdent::instance),
    ]
}

fn level_strategy() -> impl Strategy<Value = LogLevel> {
    prop_oneof![
        Just(LogLevel::Debug),
        Just(LogLevel::Info),
        Just(LogLevel::Warn),
        Just(LogLevel::Error),
    ]
}

fn body_strategy() -> impl Strategy<Value = FrameBody> {
    let text = "[ -~]{0,64}";
    prop_oneof![
        Just(FrameBody::Connected),
        Just(FrameBody::Heartbeat),
        Just(FrameBody::Started),
        Just(FrameBody::Disconnecting),
        Just(FrameBody::Ready),
        (0.0f64..100.0, proptest::option::of(text)).prop_map(|(percent, message)| {
            FrameBody::Progress { percent, message, data: None }
        }),
        (level_strategy(), text).prop_map(|(level, message)| FrameBody::Log {
            level,
            message,
            data: None,
        }),
        proptest::option::of(any::<i64>()).prop_map(|n| FrameBody::Completed {
            result: n.map(|n| json!({ "n": n })),
        }),
        (text, proptest::option::of(text)).prop_map(|(error, stack)| FrameBody::Failed {
            error,
            stack,
        }),
        (text, any::<u32>()).prop_map(|(step, poll_count)| FrameBody::StepPoll {
            step,
            poll_count,
        }),
        (text, any::<u32>()).prop_map(|(step, loop_count)| FrameBody::StepLoop {
            step,
            loop_count,
        }),
        text.prop_map(|step| FrameBody::StepStarted { step }),
        (text, proptest::option::of(any::<i64>())).prop_map(|(step, out)| {
            FrameBody::StepCompleted { step, output: out.map(|n| json!(n)) }
        }),
        (text, text).prop_map(|(step, error)| FrameBody::StepFailed { step, error }),
        (text, any::<i64>()).prop_map(|(topic, n)| FrameBody::ChildEvent {
            topic,
            payload: json!({ "n": n }),
        }),
    ]
}

proptest! {
    #[test]
    fn encode_decode_round_trips(
        ident in ident_strategy(),
        body in body_strategy(),
        timestamp in any::<u64>(),
    ) {
        let frame = Frame::new(ident, body, timestamp);
        let line = encode(&frame).unwrap();
        let decoded = decode(line.trim_end().as_bytes()).unwrap();
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_never_panics_on_garbage(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode(&bytes);
    }
}
