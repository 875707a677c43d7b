//! Property-based test generators using proptest.
//!
//! Entity ids are drawn from a small pool so generated ops collide on the
//! same nodes and links often enough to exercise merging.

use graphsync_protocol::{
    AttrValue, Attributes, ConnectionId, DeltaBody, DeltaOp, EntityId, Heartbeat, Message,
    ResyncRequest,
};
use proptest::prelude::*;

/// Strategy for node ids `n0`..`n7`.
pub fn node_id_strategy() -> impl Strategy<Value = EntityId> {
    (0u8..8).prop_map(|i| EntityId::new(format!("n{i}")))
}

/// Strategy for link ids `l0`..`l3`.
pub fn link_id_strategy() -> impl Strategy<Value = EntityId> {
    (0u8..4).prop_map(|i| EntityId::new(format!("l{i}")))
}

/// Strategy for attribute keys.
pub fn attr_key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("label".to_string()),
        Just("weight".to_string()),
        Just("color".to_string()),
        Just("pinned".to_string()),
    ]
}

/// Strategy for non-null attribute values.
///
/// Floats are finite so generated values compare equal to themselves.
pub fn attr_value_strategy() -> impl Strategy<Value = AttrValue> {
    prop_oneof![
        any::<bool>().prop_map(AttrValue::Bool),
        (-1000i64..1000).prop_map(AttrValue::Integer),
        (-1.0e6f64..1.0e6).prop_map(AttrValue::Float),
        "[a-z]{0,12}".prop_map(AttrValue::Text),
    ]
}

/// Strategy for attribute change sets, including `Null` removals.
pub fn changes_strategy() -> impl Strategy<Value = Attributes> {
    prop::collection::btree_map(
        attr_key_strategy(),
        prop_oneof![
            4 => attr_value_strategy(),
            1 => Just(AttrValue::Null),
        ],
        0..4,
    )
}

/// Strategy for initial attributes, without `Null`.
pub fn attributes_strategy() -> impl Strategy<Value = Attributes> {
    prop::collection::btree_map(attr_key_strategy(), attr_value_strategy(), 0..4)
}

/// Strategy for any delta body.
pub fn delta_body_strategy() -> impl Strategy<Value = DeltaBody> {
    prop_oneof![
        (node_id_strategy(), attributes_strategy())
            .prop_map(|(id, attrs)| DeltaBody::add_node(id, attrs)),
        (node_id_strategy(), changes_strategy())
            .prop_map(|(id, changes)| DeltaBody::update_node(id, changes)),
        node_id_strategy().prop_map(DeltaBody::remove_node),
        (
            link_id_strategy(),
            node_id_strategy(),
            node_id_strategy(),
            attributes_strategy()
        )
            .prop_map(|(id, source, target, attrs)| DeltaBody::add_link(id, source, target, attrs)),
        (link_id_strategy(), changes_strategy())
            .prop_map(|(id, changes)| DeltaBody::update_link(id, changes)),
        link_id_strategy().prop_map(DeltaBody::remove_link),
    ]
}

/// Strategy for a single op on `connection`.
pub fn delta_op_strategy(connection: ConnectionId) -> impl Strategy<Value = DeltaOp> {
    (1u64..1000, 0u64..10_000, delta_body_strategy())
        .prop_map(move |(sequence, timestamp, body)| DeltaOp::new(connection, sequence, timestamp, body))
}

/// Strategy for an in-order op stream on `connection`.
///
/// Sequences run 1..=len; timestamps never decrease.
pub fn op_stream_strategy(
    connection: ConnectionId,
    len: std::ops::Range<usize>,
) -> impl Strategy<Value = Vec<DeltaOp>> {
    prop::collection::vec((0u64..50, delta_body_strategy()), len).prop_map(move |steps| {
        let mut timestamp = 0;
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (advance, body))| {
                timestamp += advance;
                DeltaOp::new(connection, i as u64 + 1, timestamp, body)
            })
            .collect()
    })
}

/// Strategy for messages a client can receive or send.
pub fn message_strategy() -> impl Strategy<Value = Message> {
    let connection = (1u32..4).prop_map(ConnectionId::new);
    prop_oneof![
        connection
            .clone()
            .prop_flat_map(delta_op_strategy)
            .prop_map(Message::Delta),
        connection
            .clone()
            .prop_flat_map(delta_op_strategy)
            .prop_map(Message::Submit),
        (connection.clone(), any::<u64>(), any::<u64>())
            .prop_map(|(c, nonce, at)| Message::Ping(Heartbeat::new(c, nonce, at))),
        (connection.clone(), any::<u64>(), any::<u64>())
            .prop_map(|(c, nonce, at)| Message::Pong(Heartbeat::new(c, nonce, at))),
        (connection, any::<u64>()).prop_map(|(connection_id, last_delivered)| {
            Message::ResyncRequest(ResyncRequest {
                connection_id,
                last_delivered,
            })
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn stream_sequences_are_consecutive(ops in op_stream_strategy(ConnectionId::new(1), 1..20)) {
            for (i, op) in ops.iter().enumerate() {
                prop_assert_eq!(op.sequence, i as u64 + 1);
            }
            for pair in ops.windows(2) {
                prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            }
        }

        #[test]
        fn initial_attributes_have_no_nulls(attrs in attributes_strategy()) {
            prop_assert!(attrs.values().all(|v| !v.is_null()));
        }
    }
}
