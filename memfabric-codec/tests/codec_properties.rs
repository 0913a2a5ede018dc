//! Property-based round-trip tests for the codec.

use chrono::{TimeZone, Utc};
use memfabric_codec::{Codec, CodecConfig, Compressor, decode, encode};
use memfabric_types::Value;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<f64>()
            .prop_filter("finite", |x| x.is_finite())
            .prop_map(Value::Float),
        ".{0,40}".prop_map(Value::String),
        (0i64..4_000_000_000, 0u32..1_000_000_000).prop_map(|(secs, nanos)| {
            Value::DateTime(Utc.timestamp_opt(secs, nanos).unwrap())
        }),
        ("[a-z^$.*+]{0,12}", "[gimsuy]{0,3}").prop_map(|(s, f)| Value::pattern(s, f)),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
    ]
}

fn value_strategy() -> impl Strategy<Value = Value> {
    leaf_strategy().prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..8)
                .prop_map(|m: BTreeMap<String, Value>| Value::Map(m)),
        ]
    })
}

proptest! {
    #[test]
    fn serializer_round_trip(value in value_strategy()) {
        let bytes = encode(&value).unwrap();
        prop_assert_eq!(decode(&bytes).unwrap(), value);
    }

    #[test]
    fn codec_round_trip(value in value_strategy(), threshold in 0usize..2048) {
        let codec = Codec::new(CodecConfig {
            compression_threshold: threshold,
            ..Default::default()
        });
        let encoded = codec.encode(&value).unwrap();
        prop_assert_eq!(codec.decode(&encoded.bytes).unwrap(), value);
    }

    #[test]
    fn compressor_round_trip(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        threshold in 0usize..2048,
    ) {
        let compressor = Compressor::new(CodecConfig {
            compression_threshold: threshold,
            ..Default::default()
        });
        let out = compressor.compress(&data).unwrap();
        prop_assert_eq!(compressor.decompress(&out.bytes).unwrap(), data);
    }

    #[test]
    fn repetitive_data_round_trip(byte in any::<u8>(), len in 0usize..20_000) {
        let data = vec![byte; len];
        let compressor = Compressor::default();
        let out = compressor.compress(&data).unwrap();
        prop_assert_eq!(compressor.decompress(&out.bytes).unwrap(), data);
    }
}
