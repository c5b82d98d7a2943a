// Outer envelope: routing keys plus an opaque inner payload.
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MAGIC: u32 = 0x5454_4831;
pub const VERSION: u16 = 1;
// Flags name the inner schema carried in the payload.
pub const FLAG_RESOURCE_UPDATE: u16 = 0x0001;
pub const FLAG_ERROR_REPORT: u16 = 0x0002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    ResourceUpdate,
    ErrorReport,
}

impl EnvelopeKind {
    fn flags(self) -> u16 {
        match self {
            EnvelopeKind::ResourceUpdate => FLAG_RESOURCE_UPDATE,
            EnvelopeKind::ErrorReport => FLAG_ERROR_REPORT,
        }
    }

    fn from_flags(flags: u16) -> Result<Self> {
        match flags {
            FLAG_RESOURCE_UPDATE => Ok(EnvelopeKind::ResourceUpdate),
            FLAG_ERROR_REPORT => Ok(EnvelopeKind::ErrorReport),
            _ => Err(Error::MalformedEnvelope("unknown envelope kind")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.magic);
        buf.put_u16(self.version);
        buf.put_u16(self.flags);
        buf.put_u32(self.length);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        // Validate the header before trusting the declared length.
        if buf.remaining() < Self::LEN {
            return Err(Error::MalformedEnvelope("incomplete header"));
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::MalformedEnvelope("invalid magic"));
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::MalformedEnvelope("unsupported version"));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Decoded outer envelope.
///
/// Routing keys are kept as raw strings: an envelope with an empty account or
/// cluster still decodes, and it is the consumer's job to drop it.
///
/// ```
/// use bytes::Bytes;
/// use tether_wire::{Envelope, EnvelopeKind};
///
/// let envelope = Envelope::new(
///     EnvelopeKind::ResourceUpdate,
///     "acme",
///     "c1",
///     Bytes::from_static(b"{}"),
/// );
/// let encoded = envelope.encode().expect("encode");
/// let decoded = Envelope::decode(encoded).expect("decode");
/// assert_eq!(decoded, envelope);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub account_name: String,
    pub cluster_name: String,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(
        kind: EnvelopeKind,
        account_name: impl Into<String>,
        cluster_name: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            kind,
            account_name: account_name.into(),
            cluster_name: cluster_name.into(),
            payload,
        }
    }

    pub fn has_routing_keys(&self) -> bool {
        !self.account_name.is_empty() && !self.cluster_name.is_empty()
    }

    pub fn encode(&self) -> Result<Bytes> {
        let account = self.account_name.as_bytes();
        let cluster = self.cluster_name.as_bytes();
        let account_len = u16::try_from(account.len()).map_err(|_| Error::FieldTooLarge("account"))?;
        let cluster_len = u16::try_from(cluster.len()).map_err(|_| Error::FieldTooLarge("cluster"))?;
        let payload_len =
            u32::try_from(self.payload.len()).map_err(|_| Error::FieldTooLarge("payload"))?;
        let body_len = 2 + account.len() + 2 + cluster.len() + 4 + self.payload.len();
        let body_len_u32 = u32::try_from(body_len).map_err(|_| Error::FieldTooLarge("frame"))?;

        // Pre-allocate the exact size to avoid reallocation.
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + body_len);
        FrameHeader::new(self.kind.flags(), body_len_u32).encode(&mut buf);
        buf.put_u16(account_len);
        buf.extend_from_slice(account);
        buf.put_u16(cluster_len);
        buf.extend_from_slice(cluster);
        buf.put_u32(payload_len);
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        let mut buf = input;
        let header = FrameHeader::decode(&mut buf)?;
        let kind = EnvelopeKind::from_flags(header.flags)?;
        if buf.remaining() != header.length as usize {
            return Err(Error::MalformedEnvelope("length mismatch"));
        }
        let account_name = read_string(&mut buf, "account is not utf-8")?;
        let cluster_name = read_string(&mut buf, "cluster is not utf-8")?;
        if buf.remaining() < 4 {
            return Err(Error::MalformedEnvelope("incomplete payload length"));
        }
        let payload_len = buf.get_u32() as usize;
        if buf.remaining() != payload_len {
            return Err(Error::MalformedEnvelope("payload length mismatch"));
        }
        let payload = buf.copy_to_bytes(payload_len);
        Ok(Self {
            kind,
            account_name,
            cluster_name,
            payload,
        })
    }
}

fn read_string(buf: &mut Bytes, not_utf8: &'static str) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::MalformedEnvelope("incomplete field length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(Error::MalformedEnvelope("incomplete field"));
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::MalformedEnvelope(not_utf8))
}

/// Encode routing keys and inner bytes into an outer envelope.
pub fn encode_outer(
    kind: EnvelopeKind,
    account_name: &str,
    cluster_name: &str,
    inner: Bytes,
) -> Result<Bytes> {
    Envelope::new(kind, account_name, cluster_name, inner).encode()
}

/// Decode an outer envelope into `(account, cluster, inner)`.
///
/// Any structural failure is [`Error::MalformedEnvelope`]; retrying will not help.
pub fn decode_outer(input: Bytes) -> Result<(String, String, Bytes)> {
    let envelope = Envelope::decode(input)?;
    Ok((
        envelope.account_name,
        envelope.cluster_name,
        envelope.payload,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(
            EnvelopeKind::ErrorReport,
            "acme",
            "c1",
            Bytes::from_static(br#"{"error":"boom"}"#),
        )
    }

    #[test]
    fn round_trip_preserves_kind_and_keys() {
        let encoded = sample().encode().expect("encode");
        let decoded = Envelope::decode(encoded).expect("decode");
        assert_eq!(decoded.kind, EnvelopeKind::ErrorReport);
        assert_eq!(decoded.account_name, "acme");
        assert_eq!(decoded.cluster_name, "c1");
        assert!(decoded.has_routing_keys());
    }

    #[test]
    fn empty_routing_keys_still_decode() {
        let envelope = Envelope::new(EnvelopeKind::ResourceUpdate, "", "c1", Bytes::new());
        let decoded = Envelope::decode(envelope.encode().expect("encode")).expect("decode");
        assert!(!decoded.has_routing_keys());
    }

    #[test]
    fn decode_rejects_invalid_magic() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xDEAD_BEEF);
        buf.put_u16(VERSION);
        buf.put_u16(FLAG_RESOURCE_UPDATE);
        buf.put_u32(0);
        let err = Envelope::decode(buf.freeze()).expect_err("magic");
        assert!(matches!(err, Error::MalformedEnvelope("invalid magic")));
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let mut buf = BytesMut::new();
        FrameHeader::new(0x00FF, 0).encode(&mut buf);
        let err = Envelope::decode(buf.freeze()).expect_err("kind");
        assert!(matches!(err, Error::MalformedEnvelope("unknown envelope kind")));
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let encoded = sample().encode().expect("encode");
        let truncated = encoded.slice(0..encoded.len() - 3);
        let err = Envelope::decode(truncated).expect_err("truncated");
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn decode_rejects_json_garbage() {
        let err = decode_outer(Bytes::from_static(b"{\"accountName\":\"acme\"}"))
            .expect_err("not an envelope");
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn decode_rejects_non_utf8_account() {
        let mut buf = BytesMut::new();
        let body_len = 2 + 1 + 2 + 0 + 4;
        FrameHeader::new(FLAG_RESOURCE_UPDATE, body_len).encode(&mut buf);
        buf.put_u16(1);
        buf.put_u8(0xFF);
        buf.put_u16(0);
        buf.put_u32(0);
        let err = Envelope::decode(buf.freeze()).expect_err("utf8");
        assert!(matches!(err, Error::MalformedEnvelope("account is not utf-8")));
    }

    #[test]
    fn encode_outer_matches_decode_outer() {
        let inner = Bytes::from_static(b"inner");
        let encoded =
            encode_outer(EnvelopeKind::ResourceUpdate, "acme", "c1", inner.clone()).expect("encode");
        let (account, cluster, payload) = decode_outer(encoded).expect("decode");
        assert_eq!((account.as_str(), cluster.as_str()), ("acme", "c1"));
        assert_eq!(payload, inner);
    }
}
