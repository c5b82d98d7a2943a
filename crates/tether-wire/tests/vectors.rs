use bytes::Bytes;
use tether_wire::{Envelope, EnvelopeKind, Error};

struct Vector {
    name: &'static str,
    kind: EnvelopeKind,
    account: &'static str,
    cluster: &'static str,
    payload: &'static [u8],
    frame_hex: &'static str,
}

const VECTORS: &[Vector] = &[
    Vector {
        name: "resource-update",
        kind: EnvelopeKind::ResourceUpdate,
        account: "acme",
        cluster: "c1",
        payload: b"{}",
        frame_hex: "545448310001000100000010000461636d6500026331000000027b7d",
    },
    Vector {
        name: "error-report-empty-payload",
        kind: EnvelopeKind::ErrorReport,
        account: "a",
        cluster: "b",
        payload: b"",
        frame_hex: "54544831000100020000000a00016100016200000000",
    },
];

#[test]
fn vectors_match_envelope_encoding() {
    for vector in VECTORS {
        let expected = Bytes::from(hex_to_bytes(vector.frame_hex));
        let envelope = Envelope::new(
            vector.kind,
            vector.account,
            vector.cluster,
            Bytes::from_static(vector.payload),
        );
        let encoded = envelope.encode().expect("encode");
        assert_eq!(
            encoded.as_ref(),
            expected.as_ref(),
            "frame mismatch for {}",
            vector.name
        );

        let decoded = Envelope::decode(expected).expect("decode");
        assert_eq!(decoded, envelope, "round trip mismatch for {}", vector.name);
    }
}

#[test]
fn vectors_reject_trailing_bytes() {
    let mut raw = hex_to_bytes(VECTORS[0].frame_hex);
    raw.push(0);
    let err = Envelope::decode(Bytes::from(raw)).expect_err("trailing");
    assert!(matches!(err, Error::MalformedEnvelope("length mismatch")));
}

#[test]
fn vectors_reject_unsupported_version() {
    let mut raw = hex_to_bytes(VECTORS[0].frame_hex);
    raw[5] = 2;
    let err = Envelope::decode(Bytes::from(raw)).expect_err("version");
    assert!(matches!(err, Error::MalformedEnvelope("unsupported version")));
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    assert!(hex.len().is_multiple_of(2), "hex length must be even");
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = from_hex_char(pair[0]) << 4;
            let lo = from_hex_char(pair[1]);
            hi | lo
        })
        .collect()
}

fn from_hex_char(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex char"),
    }
}
