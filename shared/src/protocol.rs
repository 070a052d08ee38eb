//! JSON wire protocol for Backhaul tunnels.
//!
//! A private server opens one WebSocket to the relay and sends an
//! [`Announcement`] first. After that the relay pushes [`TunneledRequest`]
//! records down the socket and the agent answers each one with a
//! [`TunneledResponse`] carrying the same `request_id`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default HTTP header naming the target private server
pub const IDENTIFIER_HEADER: &str = "X-Private-Server-ID";

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Header name → value. Repeated headers are folded with ", ".
pub type HeaderMap = HashMap<String, String>;

/// First message on every tunnel connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub private_server_id: String,
}

impl Announcement {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            private_server_id: identifier.into(),
        }
    }
}

/// HTTP request forwarded down the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunneledRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub header: HeaderMap,
    #[serde(default, with = "body")]
    pub body: Vec<u8>,
}

/// HTTP response sent back up the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunneledResponse {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub header: HeaderMap,
    #[serde(default, with = "body")]
    pub body: Vec<u8>,
}

/// Any record that can follow the announcement.
///
/// Discriminated by shape: a response always has `status_code`, a request
/// always has `method` and `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TunnelMessage {
    Response(TunneledResponse),
    Request(TunneledRequest),
}

impl From<TunneledRequest> for TunnelMessage {
    fn from(req: TunneledRequest) -> Self {
        TunnelMessage::Request(req)
    }
}

impl From<TunneledResponse> for TunnelMessage {
    fn from(resp: TunneledResponse) -> Self {
        TunnelMessage::Response(resp)
    }
}

/// Body field codec.
///
/// UTF-8 bodies go on the wire as a JSON string, anything else as an array
/// of byte values. Both shapes (and `null`) are accepted when decoding.
mod body {
    use std::fmt;

    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.collect_seq(bytes),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_any(BodyVisitor)
    }

    struct BodyVisitor;

    impl<'de> Visitor<'de> for BodyVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string or an array of bytes")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<u8>, E> {
            Ok(v.as_bytes().to_vec())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<Vec<u8>, E> {
            Ok(v.into_bytes())
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(v)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Vec<u8>, E> {
            Ok(Vec::new())
        }

        fn visit_none<E: de::Error>(self) -> Result<Vec<u8>, E> {
            Ok(Vec::new())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}

/// Encode a record into its wire bytes
pub fn encode(message: &TunnelMessage) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| Error::Encode(e.to_string()))
}

/// Decode a request or response record
pub fn decode(data: &[u8]) -> Result<TunnelMessage> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MalformedMessage(format!(
            "frame of {} bytes exceeds limit",
            data.len()
        )));
    }
    serde_json::from_slice(data).map_err(|e| Error::MalformedMessage(e.to_string()))
}

/// Decode and validate the identifier announcement
pub fn decode_announcement(data: &[u8]) -> Result<Announcement> {
    let announcement: Announcement =
        serde_json::from_slice(data).map_err(|e| Error::MalformedMessage(e.to_string()))?;
    if announcement.private_server_id.trim().is_empty() {
        return Err(Error::InvalidIdentifier);
    }
    Ok(announcement)
}

/// Connection-scoped headers that must not be copied across the tunnel
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "content-length",
    "te",
    "trailer",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Fold `(name, value)` pairs into a header mapping
pub fn fold_headers<'a, I>(pairs: I) -> HeaderMap
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.entry(name.to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_response_by_shape() {
        let raw = br#"{"request_id":"r1","status_code":200,"header":{"Content-Type":"text/plain"},"body":[111,107]}"#;
        match decode(raw).unwrap() {
            TunnelMessage::Response(resp) => {
                assert_eq!(resp.request_id, "r1");
                assert_eq!(resp.status_code, 200);
                assert_eq!(resp.body, b"ok");
                assert_eq!(resp.header["Content-Type"], "text/plain");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_string_body() {
        let raw = br#"{"request_id":"r1","status_code":200,"header":{"Content-Type":"text/plain"},"body":"ok"}"#;
        match decode(raw).unwrap() {
            TunnelMessage::Response(resp) => assert_eq!(resp.body, b"ok"),
            other => panic!("expected response, got {:?}", other),
        }

        let raw = br#"{"request_id":"r2","method":"POST","path":"/p","body":null}"#;
        match decode(raw).unwrap() {
            TunnelMessage::Request(req) => assert!(req.body.is_empty()),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_body_wire_shape() {
        let text = TunneledResponse {
            request_id: "r1".into(),
            status_code: 200,
            header: HeaderMap::new(),
            body: b"hello".to_vec(),
        };
        let json: serde_json::Value = serde_json::from_slice(&encode(&text.into()).unwrap()).unwrap();
        assert_eq!(json["body"], "hello");

        let binary = TunneledResponse {
            request_id: "r2".into(),
            status_code: 200,
            header: HeaderMap::new(),
            body: vec![0xff, 0x00],
        };
        let json: serde_json::Value = serde_json::from_slice(&encode(&binary.into()).unwrap()).unwrap();
        assert_eq!(json["body"], serde_json::json!([255, 0]));
    }

    #[test]
    fn test_decode_request_by_shape() {
        let raw = br#"{"request_id":"r2","method":"GET","path":"/x"}"#;
        match decode(raw).unwrap() {
            TunnelMessage::Request(req) => {
                assert_eq!(req.method, "GET");
                assert_eq!(req.path, "/x");
                assert!(req.query.is_empty());
                assert!(req.body.is_empty());
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_encoded_request_is_recognized() {
        let req = TunneledRequest {
            request_id: "abc".into(),
            method: "POST".into(),
            path: "/upload".into(),
            query: "a=1".into(),
            header: fold_headers([("X-A", "1")]),
            body: vec![0, 159, 255],
        };
        let bytes = encode(&req.clone().into()).unwrap();
        assert_eq!(decode(&bytes).unwrap(), TunnelMessage::Request(req));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(decode(b"not json"), Err(Error::MalformedMessage(_))));
        assert!(matches!(decode(br#"{"request_id":"x"}"#), Err(Error::MalformedMessage(_))));
        assert!(matches!(decode(br#"{"status_code":200}"#), Err(Error::MalformedMessage(_))));
        assert!(matches!(decode(br#"[1,2,3]"#), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_announcement() {
        let a = decode_announcement(br#"{"private_server_id":"srv1"}"#).unwrap();
        assert_eq!(a, Announcement::new("srv1"));
        assert!(matches!(
            decode_announcement(br#"{"private_server_id":""}"#),
            Err(Error::InvalidIdentifier)
        ));
        assert!(matches!(
            decode_announcement(br#"{"hello":1}"#),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("connection"));
        assert!(!is_hop_by_hop("Content-Type"));
    }

    #[test]
    fn test_fold_repeated_headers() {
        let map = fold_headers([("Accept", "text/html"), ("Accept", "*/*"), ("Host", "a")]);
        assert_eq!(map["Accept"], "text/html, */*");
        assert_eq!(map["Host"], "a");
    }
}
