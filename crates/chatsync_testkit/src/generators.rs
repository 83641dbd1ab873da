//! Property-based test generators using proptest.

use chatsync_protocol::{Cid, Event, EventKind, Message, User};
use proptest::prelude::*;

/// Strategy for generating channel ids.
pub fn cid_strategy() -> impl Strategy<Value = Cid> {
    (
        prop::sample::select(vec!["messaging", "team", "livestream"]),
        prop::string::string_regex("[a-z0-9]{1,12}").expect("Invalid regex"),
    )
        .prop_map(|(channel_type, id)| Cid::new(channel_type, id))
}

/// Strategy for generating user ids.
pub fn user_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{3,8}").expect("Invalid regex")
}

/// Strategy for generating messages in `cid`.
pub fn message_strategy(cid: Cid) -> impl Strategy<Value = Message> {
    (
        prop::string::string_regex("[a-f0-9]{8}").expect("Invalid regex"),
        ".{0,64}",
        user_id_strategy(),
        any::<bool>(),
    )
        .prop_map(move |(id, text, sender, reply)| {
            let mut message = Message::new(id, text);
            message.cid = Some(cid.clone());
            message.user = Some(User::new(sender));
            if reply {
                message.parent_id = Some("parent".into());
            }
            message
        })
}

/// Strategy for generating message event kinds.
pub fn message_event_kind_strategy() -> impl Strategy<Value = EventKind> {
    prop::sample::select(vec![
        EventKind::MessageNew,
        EventKind::MessageUpdated,
        EventKind::MessageDeleted,
        EventKind::MessageUndeleted,
    ])
}

/// Strategy for generating message events in `cid`.
pub fn message_event_strategy(cid: Cid) -> impl Strategy<Value = Event> {
    (
        message_event_kind_strategy(),
        message_strategy(cid.clone()),
        any::<bool>(),
    )
        .prop_map(move |(kind, message, hard_delete)| {
            let mut event = Event::new(kind).with_cid(cid.clone()).with_message(message);
            event.hard_delete = hard_delete;
            event
        })
}

/// Strategy for generating short lists of handler labels.
pub fn handler_labels_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[A-Z]", 1..8).prop_map(|labels| {
        labels
            .into_iter()
            .enumerate()
            .map(|(i, label)| format!("{label}{i}"))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn cids_round_trip_through_their_string_form(cid in cid_strategy()) {
            prop_assert_eq!(Cid::parse(&cid.to_string()).unwrap(), cid);
        }

        #[test]
        fn message_events_target_their_channel(event in message_event_strategy(Cid::new("messaging", "general"))) {
            let message = event.message.unwrap();
            prop_assert_eq!(message.cid, event.cid);
        }

        #[test]
        fn handler_labels_are_unique(labels in handler_labels_strategy()) {
            let mut sorted = labels.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), labels.len());
        }
    }
}
