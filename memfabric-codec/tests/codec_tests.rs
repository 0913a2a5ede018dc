use chrono::{TimeZone, Utc};
use memfabric_codec::{
    Algorithm, Codec, CodecConfig, CodecError, Compressor, FORMAT_VERSION, MAX_NESTING_DEPTH,
    decode, encode, peek_compression, peek_header,
};
use memfabric_types::{Value, ValueKind};
use pretty_assertions::assert_eq;

fn nested_value() -> Value {
    Value::map([
        ("name", Value::from("alice")),
        ("age", Value::Int(31)),
        ("score", Value::Float(0.125)),
        ("active", Value::Bool(true)),
        ("nothing", Value::Null),
        (
            "joined",
            Value::from(Utc.with_ymd_and_hms(2023, 5, 17, 8, 30, 0).unwrap()),
        ),
        ("filter", Value::pattern("^user:[0-9]+$", "i")),
        ("avatar", Value::Bytes(vec![0, 1, 2, 254, 255])),
        (
            "tags",
            Value::from(vec![
                Value::from("a"),
                Value::map([("deep", Value::from(vec![Value::Int(-1)]))]),
            ]),
        ),
    ])
}

/// `levels` arrays wrapped around a single null.
fn nested_arrays(levels: usize) -> Value {
    (0..levels).fold(Value::Null, |inner, _| Value::from(vec![inner]))
}

fn compressible(len: usize) -> Vec<u8> {
    b"memory-fabric ".iter().copied().cycle().take(len).collect()
}

// ── Serializer ───────────────────────────────────────────────────

#[test]
fn encode_decode_nested_value() {
    let value = nested_value();
    let bytes = encode(&value).unwrap();
    assert_eq!(decode(&bytes).unwrap(), value);
}

#[test]
fn header_describes_payload() {
    let bytes = encode(&Value::from(vec![Value::Int(1)])).unwrap();
    let header = peek_header(&bytes).unwrap();
    assert_eq!(header.kind, ValueKind::Array);
    assert_eq!(header.version, FORMAT_VERSION);
    assert!(header.original_size > 0);
}

#[test]
fn non_finite_float_is_rejected_on_encode() {
    let err = encode(&Value::Float(f64::NAN)).unwrap_err();
    assert!(matches!(err, CodecError::Encode(_)));
    let nested = Value::map([("x", Value::Float(f64::INFINITY))]);
    assert!(encode(&nested).is_err());
}

#[test]
fn nesting_limit_is_enforced_on_encode() {
    let deepest = nested_arrays(MAX_NESTING_DEPTH);
    let bytes = encode(&deepest).unwrap();
    assert_eq!(decode(&bytes).unwrap(), deepest);

    for levels in [MAX_NESTING_DEPTH + 1, 64, 100] {
        let err = encode(&nested_arrays(levels)).unwrap_err();
        assert!(matches!(err, CodecError::Encode(_)), "{levels} levels");
    }

    let deep_map = Value::map([("inner", nested_arrays(MAX_NESTING_DEPTH))]);
    assert!(matches!(encode(&deep_map), Err(CodecError::Encode(_))));
}

#[test]
fn truncated_payload_is_decode_error() {
    let bytes = encode(&nested_value()).unwrap();
    for cut in [0, 3, 10, bytes.len() - 1] {
        let err = decode(&bytes[..cut]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)), "cut at {cut}");
    }
}

#[test]
fn garbage_is_decode_error() {
    assert!(matches!(decode(b"\x00\x00\x00\x02{}"), Err(CodecError::Decode(_))));
    assert!(matches!(decode(&[0xff; 16]), Err(CodecError::Decode(_))));
}

#[test]
fn type_tag_mismatch_is_detected() {
    let mut bytes = encode(&Value::Int(5)).unwrap();
    let text = String::from_utf8_lossy(&bytes).into_owned();
    assert!(text.contains("\"type\":\"int\""));
    // Swap "int" for "map" inside the header; sizes are unchanged.
    let pos = text.find("\"type\":\"int\"").unwrap() + 8;
    bytes[pos..pos + 3].copy_from_slice(b"map");
    assert!(matches!(decode(&bytes), Err(CodecError::Decode(_))));
}

// ── Compressor ───────────────────────────────────────────────────

#[test]
fn below_threshold_is_stored_raw() {
    let compressor = Compressor::new(CodecConfig::default());
    let data = compressible(100);
    let out = compressor.compress(&data).unwrap();
    assert_eq!(out.algorithm, Algorithm::None);
    assert!(!out.fell_back);
    assert_eq!(compressor.decompress(&out.bytes).unwrap(), data);
}

#[test]
fn above_threshold_is_compressed() {
    let compressor = Compressor::new(CodecConfig::default());
    let data = compressible(8 * 1024);
    let out = compressor.compress(&data).unwrap();
    assert_eq!(out.algorithm, Algorithm::Zstd);
    assert!(out.ratio >= 1.1);
    assert!(out.bytes.len() < data.len());

    let header = peek_compression(&out.bytes).unwrap();
    assert_eq!(header.algorithm, Algorithm::Zstd);
    assert_eq!(header.original_size, data.len());
    assert_eq!(compressor.decompress(&out.bytes).unwrap(), data);
}

#[test]
fn exactly_at_threshold_is_eligible() {
    let config = CodecConfig {
        compression_threshold: 2048,
        ..Default::default()
    };
    let compressor = Compressor::new(config);
    let data = compressible(2048);
    assert_eq!(compressor.compress(&data).unwrap().algorithm, Algorithm::Zstd);
    let below = compressible(2047);
    assert_eq!(compressor.compress(&below).unwrap().algorithm, Algorithm::None);
}

#[test]
fn incompressible_data_is_stored_raw() {
    let compressor = Compressor::new(CodecConfig {
        compression_threshold: 0,
        ..Default::default()
    });
    // xorshift noise does not compress
    let mut x: u64 = 0x9e37_79b9_7f4a_7c15;
    let data: Vec<u8> = (0..4096)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .collect();
    let out = compressor.compress(&data).unwrap();
    assert_eq!(out.algorithm, Algorithm::None);
    assert_eq!(compressor.decompress(&out.bytes).unwrap(), data);
}

#[test]
fn empty_input_round_trips() {
    let compressor = Compressor::new(CodecConfig {
        compression_threshold: 0,
        ..Default::default()
    });
    let out = compressor.compress(&[]).unwrap();
    assert_eq!(compressor.decompress(&out.bytes).unwrap(), Vec::<u8>::new());
}

#[test]
fn disabled_compression_never_compresses() {
    let compressor = Compressor::new(CodecConfig {
        compression_enabled: false,
        ..Default::default()
    });
    let out = compressor.compress(&compressible(64 * 1024)).unwrap();
    assert_eq!(out.algorithm, Algorithm::None);
}

#[test]
fn corrupted_body_is_decode_error() {
    let compressor = Compressor::new(CodecConfig::default());
    let data = compressible(16 * 1024);
    let mut framed = compressor.compress(&data).unwrap().bytes;
    let last = framed.len() - 1;
    framed[last] ^= 0xff;
    framed[last - 5] ^= 0x55;
    assert!(matches!(compressor.decompress(&framed), Err(CodecError::Decode(_))));
}

#[test]
fn corrupted_raw_body_fails_checksum() {
    let compressor = Compressor::new(CodecConfig::default());
    let mut framed = compressor.compress(b"short and raw").unwrap().bytes;
    let last = framed.len() - 1;
    framed[last] ^= 0x01;
    let err = compressor.decompress(&framed).unwrap_err();
    assert!(err.to_string().contains("checksum"));
}

#[test]
fn batch_reports_counts() {
    let compressor = Compressor::new(CodecConfig::default());
    let big = compressible(10_000);
    let small = compressible(10);
    let items = vec![big.as_slice(), small.as_slice(), big.as_slice()];
    let (results, report) = compressor.compress_batch(items);
    assert_eq!(results.len(), 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.bytes_in, 20_010);
    assert!(report.bytes_out < report.bytes_in);
}

// ── Codec ────────────────────────────────────────────────────────

#[test]
fn codec_round_trip_large_value_compresses() {
    let codec = Codec::new(CodecConfig::default());
    let items: Vec<Value> = (0..500).map(|i| Value::from(format!("item-{}", i % 7))).collect();
    let value = Value::from(items);
    let encoded = codec.encode(&value).unwrap();
    assert_eq!(encoded.algorithm, Algorithm::Zstd);
    assert!(encoded.bytes.len() < encoded.serialized_size);
    assert_eq!(codec.decode(&encoded.bytes).unwrap(), value);
}

#[test]
fn codec_small_value_stays_raw() {
    let codec = Codec::default();
    let encoded = codec.encode(&Value::Int(1)).unwrap();
    assert_eq!(encoded.algorithm, Algorithm::None);
    assert_eq!(encoded.ratio, 1.0);
    assert_eq!(codec.decode(&encoded.bytes).unwrap(), Value::Int(1));
}

#[test]
fn config_defaults() {
    let config = CodecConfig::default();
    assert!(config.compression_enabled);
    assert_eq!(config.compression_threshold, 1024);
    assert_eq!(config.min_ratio, 1.1);
    assert_eq!(config.algorithm, Algorithm::Zstd);
}

#[test]
fn config_deserializes_with_defaults() {
    let config: CodecConfig = serde_json::from_str(r#"{"compression_threshold": 10}"#).unwrap();
    assert_eq!(config.compression_threshold, 10);
    assert_eq!(config.level, 3);
}
