use bytes::BytesMut;
use natter_wire::{ProtocolOp, decode_op, decode_ops};
use std::fs;

fn vectors() -> Vec<(std::path::PathBuf, serde_json::Value)> {
    let dir = "tests/vectors";
    let mut vectors = Vec::new();
    for entry in fs::read_dir(dir).expect("read vectors dir") {
        let path = entry.expect("entry").path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let contents = fs::read_to_string(&path).expect("read vector");
        let value: serde_json::Value = serde_json::from_str(&contents).expect("json");
        vectors.push((path, value));
    }
    assert!(!vectors.is_empty(), "no vectors found");
    vectors
}

fn expected_ops(value: &serde_json::Value) -> Vec<&str> {
    value["ops"]
        .as_array()
        .expect("ops")
        .iter()
        .map(|op| op.as_str().expect("op name"))
        .collect()
}

#[test]
fn vectors_decode_to_expected_ops() {
    for (path, value) in vectors() {
        let input = value["input"].as_str().expect("input");
        let mut buf = BytesMut::from(input.as_bytes());
        let ops = decode_ops(&mut buf).expect("decode");
        let names: Vec<&str> = ops.iter().map(ProtocolOp::name).collect();
        assert_eq!(names, expected_ops(&value), "op mismatch for {:?}", path);
        assert!(buf.is_empty(), "leftover bytes for {:?}", path);

        let Some(expected) = value.get("info") else {
            continue;
        };
        let Some(ProtocolOp::Info(info)) = ops.first() else {
            panic!("first op is not INFO for {:?}", path);
        };
        let info = info.server_info();
        assert_eq!(info.server_id, expected["server_id"].as_str().expect("server_id"));
        assert_eq!(info.version, expected["version"].as_str().expect("version"));
        assert_eq!(u64::from(info.port), expected["port"].as_u64().expect("port"));
        assert_eq!(info.max_payload, expected["max_payload"].as_u64().expect("max_payload"));
        assert_eq!(
            info.auth_required,
            expected["auth_required"].as_bool().expect("auth_required")
        );
        let urls: Vec<&str> = expected["connect_urls"]
            .as_array()
            .expect("connect_urls")
            .iter()
            .map(|url| url.as_str().expect("url"))
            .collect();
        assert_eq!(info.connect_urls, urls, "connect_urls mismatch for {:?}", path);
    }
}

#[test]
fn vectors_decode_identically_when_fed_byte_by_byte() {
    for (path, value) in vectors() {
        let input = value["input"].as_str().expect("input");
        let mut whole = BytesMut::from(input.as_bytes());
        let expected = decode_ops(&mut whole).expect("decode");

        let mut buf = BytesMut::new();
        let mut ops = Vec::new();
        for byte in input.as_bytes() {
            buf.extend_from_slice(&[*byte]);
            while let Some(op) = decode_op(&mut buf).expect("decode") {
                ops.push(op);
            }
        }
        assert_eq!(ops, expected, "incremental mismatch for {:?}", path);
        assert!(buf.is_empty(), "leftover bytes for {:?}", path);
    }
}
