//! Property tests: any well-formed message survives serialize → parse.

use proptest::prelude::*;
use tether_proto::{Message, Source, Tag};

fn command_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Z]{3,10}",
        "[0-9]{3}",
    ]
}

fn middle_param_strategy() -> impl Strategy<Value = String> {
    // No spaces, no leading colon, non-empty, no line terminators.
    "[!-9;-~][!-~]{0,15}".prop_map(|s| s)
}

fn last_param_strategy() -> impl Strategy<Value = String> {
    // May be empty, contain spaces, or start with a colon.
    "[ -~]{0,40}"
}

fn tag_strategy() -> impl Strategy<Value = Tag> {
    (
        "[a-zA-Z0-9/.+-]{1,12}",
        proptest::option::of("[ -~;\\\\]{0,20}"),
    )
        .prop_map(|(key, value)| Tag { key, value })
}

fn source_strategy() -> impl Strategy<Value = Source> {
    (
        "[A-Za-z][A-Za-z0-9.-]{0,12}",
        proptest::option::of("[A-Za-z~][A-Za-z0-9]{0,8}"),
        proptest::option::of("[A-Za-z0-9.:-]{1,16}"),
    )
        .prop_map(|(name, user, host)| Source { name, user, host })
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (
        proptest::collection::vec(tag_strategy(), 0..4),
        proptest::option::of(source_strategy()),
        command_strategy(),
        proptest::collection::vec(middle_param_strategy(), 0..4),
        proptest::option::of(last_param_strategy()),
    )
        .prop_map(|(mut tags, source, command, mut params, last)| {
            // Duplicate tag keys would be ambiguous on re-parse.
            tags.sort_by(|a, b| a.key.cmp(&b.key));
            tags.dedup_by(|a, b| a.key == b.key);
            if let Some(last) = last {
                params.push(last);
            }
            Message {
                tags,
                source,
                command,
                params,
            }
        })
}

proptest! {
    #[test]
    fn serialize_parse_roundtrip(msg in message_strategy()) {
        let wire = msg.to_string();
        let parsed: Message = wire.parse().expect("serialized message must parse");
        prop_assert_eq!(parsed, msg, "wire form: {:?}", wire);
    }
}
