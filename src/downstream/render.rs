//! Rendering hub deliveries for one client's negotiated view.
//!
//! Three concerns live here: filtering message tags down to what the
//! client negotiated, dropping or rewriting messages that depend on
//! capabilities the client lacks, and the transparent
//! `<network>/<name>` channel renaming for unscoped multi-upstream
//! clients.

use std::collections::HashSet;

use tether_proto::Message;

/// Default channel-type sigils used when deciding whether a parameter
/// names a channel on the client side.
const CHANTYPES: &str = "#&+!";

/// Drop tags the client did not negotiate.
///
/// `message-tags` opens the floodgates; without it only the tags backed
/// by an individually negotiated capability survive.
pub fn filter_tags(msg: &mut Message, caps: &HashSet<String>) {
    if caps.contains("message-tags") {
        return;
    }
    msg.tags.retain(|tag| match tag.key.as_str() {
        "time" => caps.contains("server-time"),
        "batch" => caps.contains("batch"),
        "label" => caps.contains("labeled-response"),
        "account" => caps.contains("account-tag"),
        _ => false,
    });
}

/// Adjust a message for capabilities the client lacks.
///
/// Returns `false` when the message must not be delivered at all.
pub fn adapt_to_caps(msg: &mut Message, caps: &HashSet<String>) -> bool {
    match msg.command.as_str() {
        "AWAY" => caps.contains("away-notify"),
        "ACCOUNT" => caps.contains("account-notify"),
        "CHGHOST" => caps.contains("chghost"),
        "SETNAME" => caps.contains("setname"),
        "JOIN" => {
            // extended-join carries account and realname.
            if !caps.contains("extended-join") && msg.params.len() > 1 {
                msg.params.truncate(1);
            }
            true
        }
        _ => true,
    }
}

/// Whether a target looks like a channel name.
pub fn is_channel(target: &str) -> bool {
    target.chars().next().is_some_and(|c| CHANTYPES.contains(c))
}

/// Prefix a channel name with its network: `#rust` → `net/#rust`.
pub fn add_network_prefix(network: &str, channel: &str) -> String {
    format!("{network}/{channel}")
}

/// Split a client-side name into (network, bare name) when it carries a
/// network prefix.
pub fn split_network_prefix(name: &str) -> Option<(&str, &str)> {
    // A channel sigil cannot start a network name, so "#a/b" is a plain
    // channel and "net/#a" is a prefixed one.
    if is_channel(name) {
        return None;
    }
    let (network, rest) = name.split_once('/')?;
    if network.is_empty() || rest.is_empty() {
        return None;
    }
    Some((network, rest))
}

/// Positions of channel-name parameters per command, for the renaming
/// rewrite. Numerics address the client in param 0.
fn channel_param_index(command: &str) -> Option<usize> {
    match command {
        "JOIN" | "PART" | "TOPIC" | "MODE" | "KICK" | "INVITE" | "PRIVMSG" | "NOTICE"
        | "NAMES" => Some(0),
        // RPL_CHANNELMODEIS, RPL_CREATIONTIME, RPL_NOTOPIC, RPL_TOPIC,
        // RPL_TOPICWHOTIME, RPL_ENDOFNAMES
        "324" | "329" | "331" | "332" | "333" | "366" => Some(1),
        // RPL_NAMREPLY: <client> <symbol> <channel> ...
        "353" => Some(2),
        _ => None,
    }
}

/// Apply the `<network>/<name>` renaming to a message headed for an
/// unscoped multi-upstream client.
pub fn prefix_channels(msg: &mut Message, network: &str) {
    let Some(idx) = channel_param_index(&msg.command) else {
        return;
    };
    let Some(param) = msg.params.get_mut(idx) else {
        return;
    };
    // Some commands take comma-separated lists.
    let renamed: Vec<String> = param
        .split(',')
        .map(|name| {
            if is_channel(name) {
                add_network_prefix(network, name)
            } else {
                name.to_string()
            }
        })
        .collect();
    *param = renamed.join(",");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_proto::Tag;

    fn caps(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn message_tags_keeps_everything() {
        let mut msg = Message::privmsg("#a", "hi")
            .with_tag("time", Some("x"))
            .with_tag("+draft/reply", Some("y"));
        filter_tags(&mut msg, &caps(&["message-tags"]));
        assert_eq!(msg.tags.len(), 2);
    }

    #[test]
    fn server_time_only_keeps_time() {
        let mut msg = Message::privmsg("#a", "hi")
            .with_tag("time", Some("x"))
            .with_tag("msgid", Some("y"));
        filter_tags(&mut msg, &caps(&["server-time"]));
        assert_eq!(msg.tags.len(), 1);
        assert_eq!(msg.tags[0].key, "time");
    }

    #[test]
    fn no_caps_strips_all_tags() {
        let mut msg = Message::privmsg("#a", "hi");
        msg.tags.push(Tag {
            key: "time".into(),
            value: Some("x".into()),
        });
        filter_tags(&mut msg, &caps(&[]));
        assert!(msg.tags.is_empty());
    }

    #[test]
    fn away_dropped_without_cap() {
        let mut away = Message::new("AWAY", vec!["gone".into()]);
        assert!(!adapt_to_caps(&mut away, &caps(&[])));
        assert!(adapt_to_caps(&mut away, &caps(&["away-notify"])));
    }

    #[test]
    fn extended_join_truncated_without_cap() {
        let mut join = Message::new(
            "JOIN",
            vec!["#a".into(), "account".into(), "Real Name".into()],
        );
        assert!(adapt_to_caps(&mut join, &caps(&[])));
        assert_eq!(join.params, vec!["#a"]);

        let mut join = Message::new(
            "JOIN",
            vec!["#a".into(), "account".into(), "Real Name".into()],
        );
        assert!(adapt_to_caps(&mut join, &caps(&["extended-join"])));
        assert_eq!(join.params.len(), 3);
    }

    #[test]
    fn network_prefix_roundtrip() {
        assert_eq!(add_network_prefix("n1", "#x"), "n1/#x");
        assert_eq!(split_network_prefix("n2/#y"), Some(("n2", "#y")));
        assert_eq!(split_network_prefix("n2/bob"), Some(("n2", "bob")));
        assert_eq!(split_network_prefix("#plain"), None);
        assert_eq!(split_network_prefix("bob"), None);
    }

    #[test]
    fn prefix_rewrites_channel_params() {
        let mut msg = Message::privmsg("#x", "hi");
        prefix_channels(&mut msg, "n1");
        assert_eq!(msg.params[0], "n1/#x");

        // Direct messages stay untouched.
        let mut msg = Message::privmsg("ada", "hi");
        prefix_channels(&mut msg, "n1");
        assert_eq!(msg.params[0], "ada");

        // NAMES reply carries the channel in param 2.
        let mut msg = Message::new(
            "353",
            vec!["me".into(), "=".into(), "#x".into(), "@ada zoe".into()],
        );
        prefix_channels(&mut msg, "n1");
        assert_eq!(msg.params[2], "n1/#x");

        // Comma-separated lists are rewritten element-wise.
        let mut msg = Message::new("JOIN", vec!["#a,#b".into()]);
        prefix_channels(&mut msg, "n1");
        assert_eq!(msg.params[0], "n1/#a,n1/#b");
    }
}
