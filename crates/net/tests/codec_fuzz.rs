//! Fuzz-style property tests for the wire codec.
//!
//! Decoders must survive arbitrary and truncated input without panicking,
//! and every encodable value must come back byte-for-byte identical.

use glam::{Vec2, Vec3, Vec4};
use proptest::prelude::*;

use ember_net::{
    Datagram, FieldUpdate, Message, MessageHeader, NetValue, Reader,
};

fn finite_f32() -> impl Strategy<Value = f32> {
    -1.0e6f32..1.0e6f32
}

fn net_value_strategy() -> impl Strategy<Value = NetValue> {
    prop_oneof![
        any::<i32>().prop_map(NetValue::I32),
        finite_f32().prop_map(NetValue::F32),
        any::<bool>().prop_map(NetValue::Bool),
        "[a-zA-Z0-9 _-]{0,24}".prop_map(NetValue::String),
        "[a-zA-Z0-9_]{0,24}".prop_map(NetValue::Asset),
        (finite_f32(), finite_f32()).prop_map(|(x, y)| NetValue::Vec2(Vec2::new(x, y))),
        (finite_f32(), finite_f32(), finite_f32())
            .prop_map(|(x, y, z)| NetValue::Vec3(Vec3::new(x, y, z))),
        (finite_f32(), finite_f32(), finite_f32(), finite_f32())
            .prop_map(|(x, y, z, w)| NetValue::Vec4(Vec4::new(x, y, z, w))),
    ]
}

proptest! {
    /// Any sequence of typed values decodes back to identical values and
    /// type tags.
    #[test]
    fn value_sequences_roundtrip(values in prop::collection::vec(net_value_strategy(), 0..16)) {
        let mut buf = Vec::new();
        for value in &values {
            value.encode(&mut buf);
        }

        let mut reader = Reader::new(&buf);
        for value in &values {
            let decoded = NetValue::decode(&mut reader).unwrap();
            prop_assert_eq!(decoded.kind(), value.kind());
            prop_assert_eq!(&decoded, value);
        }
        prop_assert!(reader.is_empty());
    }

    /// Arbitrary bytes never panic the datagram decoder.
    #[test]
    fn arbitrary_bytes_dont_crash(bytes in prop::collection::vec(any::<u8>(), 0..2000)) {
        let _ = Datagram::decode(&bytes);
    }

    /// Truncating a valid datagram anywhere never panics.
    #[test]
    fn truncated_datagrams_dont_crash(
        truncate_at in 0usize..64,
        values in prop::collection::vec(net_value_strategy(), 0..4),
    ) {
        let datagram = Datagram {
            header: MessageHeader::new(9, 4, 0b111),
            reliable: Some(3),
            message: Message::Rpc { net_id: 12, func: 1, args: values },
        };
        let mut bytes = datagram.encode().unwrap();
        if truncate_at < bytes.len() {
            bytes.truncate(truncate_at);
            prop_assert!(Datagram::decode(&bytes).is_err());
        }
    }

    /// Single-bit corruption is rejected or decodes to a valid datagram,
    /// never a panic.
    #[test]
    fn flipped_bits_dont_crash(
        flip_pos in 0usize..40,
        flip_bit in 0u8..8,
    ) {
        let datagram = Datagram {
            header: MessageHeader::new(1, 0, 0),
            reliable: None,
            message: Message::Spawn { net_id: 3, class: "player".into(), owner: 1 },
        };
        let mut bytes = datagram.encode().unwrap();
        if flip_pos < bytes.len() {
            bytes[flip_pos] ^= 1 << flip_bit;
            let _ = Datagram::decode(&bytes);
        }
    }

    /// Update messages with arbitrary field payloads roundtrip exactly.
    #[test]
    fn update_messages_roundtrip(
        net_id in 1u32..100_000,
        entries in prop::collection::vec(
            (0u8..16, 1u32..1000, net_value_strategy()),
            0..8,
        ),
    ) {
        let fields: Vec<FieldUpdate> = entries
            .into_iter()
            .map(|(index, version, value)| FieldUpdate { index, version, value })
            .collect();

        let datagram = Datagram {
            header: MessageHeader::new(2, 1, 0),
            reliable: None,
            message: Message::Update { net_id, fields: fields.clone() },
        };
        let bytes = datagram.encode().unwrap();
        let decoded = Datagram::decode(&bytes).unwrap();
        prop_assert_eq!(decoded.message, Message::Update { net_id, fields });
    }

    /// Rpc messages roundtrip with any legal argument list.
    #[test]
    fn rpc_messages_roundtrip(
        net_id in 1u32..100_000,
        func in 0u8..32,
        args in prop::collection::vec(net_value_strategy(), 0..8),
        reliable in proptest::option::of(1u32..10_000),
    ) {
        let datagram = Datagram {
            header: MessageHeader::new(5, 2, 0b1),
            reliable,
            message: Message::Rpc { net_id, func, args: args.clone() },
        };
        let bytes = datagram.encode().unwrap();
        let decoded = Datagram::decode(&bytes).unwrap();
        prop_assert_eq!(decoded.reliable, reliable);
        prop_assert_eq!(decoded.message, Message::Rpc { net_id, func, args });
    }
}
