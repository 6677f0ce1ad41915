//! Multi-frame envelope codec.
//!
//! Frame layout:
//! ```text
//! ┌────────────┬───────────┬───────────┬────────┬────────┬──────────┬─────────┬─────────┐
//! │ identities │ <IDS|MSG> │ hex HMAC  │ header │ parent │ metadata │ content │ buffers │
//! │ 0..n       │ delimiter │ signature │ JSON   │ JSON   │ JSON     │ JSON    │ 0..n    │
//! └────────────┴───────────┴───────────┴────────┴────────┴──────────┴─────────┴─────────┘
//! ```
//! The signature covers the four JSON frames, concatenated in order.

use bytes::Bytes;
use serde_json::{Map, Value};

use super::message::{ComposedMessage, Header, ReceivedFrames};
use super::signer::Signer;
use crate::types::{Error, Result};

/// Delimiter frame between routing identities and the signed message.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Decode raw frames into a message, verifying the signature first.
///
/// Envelope damage (missing delimiter, too few frames, bad signature) is a
/// [`Error::Signature`]; a JSON frame that does not parse is a
/// [`Error::Decode`].
pub fn decode(frames: Vec<Bytes>, signer: &Signer) -> Result<ComposedMessage> {
    let delim = frames
        .iter()
        .position(|f| &f[..] == DELIMITER)
        .ok_or_else(|| Error::signature("missing <IDS|MSG> delimiter"))?;

    if frames.len() < delim + 6 {
        return Err(Error::signature(format!(
            "truncated envelope: {} frames after delimiter, need 5",
            frames.len() - delim - 1
        )));
    }

    let mut frames = frames;
    let buffers = frames.split_off(delim + 6);
    let json = frames.split_off(delim + 2);
    let signature = frames.pop().unwrap_or_default();
    frames.truncate(delim);
    let identities = frames;

    let parts: [&[u8]; 4] = [&json[0], &json[1], &json[2], &json[3]];
    signer.verify(&signature, &parts)?;

    let header: Header = from_frame("header", &json[0])?;
    let parent_header = parse_parent(&json[1])?;
    let metadata: Map<String, Value> = from_frame("metadata", &json[2])?;
    let content: Value = from_frame("content", &json[3])?;

    let received = ReceivedFrames {
        header: json[0].clone(),
        parent_header: json[1].clone(),
        metadata: json[2].clone(),
        content: json[3].clone(),
    };

    Ok(ComposedMessage {
        identities,
        header,
        parent_header,
        metadata,
        content,
        buffers,
        received: Some(received),
    })
}

/// Encode a message into frames: identities, delimiter, signature, the four
/// JSON frames and any buffers.
pub fn encode(msg: &ComposedMessage, signer: &Signer) -> Result<Vec<Bytes>> {
    let received = msg.received.as_ref();
    let header = json_frame(
        received.map(|r| &r.header),
        &msg.header,
        |f| from_frame("header", f),
        || Ok(serde_json::to_vec(&msg.header)?),
    )?;
    let parent = json_frame(
        received.map(|r| &r.parent_header),
        &msg.parent_header,
        parse_parent,
        || match &msg.parent_header {
            Some(parent) => Ok(serde_json::to_vec(parent)?),
            None => Ok(b"{}".to_vec()),
        },
    )?;
    let metadata = json_frame(
        received.map(|r| &r.metadata),
        &msg.metadata,
        |f| from_frame("metadata", f),
        || Ok(serde_json::to_vec(&msg.metadata)?),
    )?;
    let content = json_frame(
        received.map(|r| &r.content),
        &msg.content,
        |f| from_frame("content", f),
        || Ok(serde_json::to_vec(&msg.content)?),
    )?;

    let signature = signer.sign(&[&header[..], &parent[..], &metadata[..], &content[..]]);

    let mut frames = Vec::with_capacity(msg.identities.len() + 6 + msg.buffers.len());
    frames.extend(msg.identities.iter().cloned());
    frames.push(Bytes::from_static(DELIMITER));
    frames.push(Bytes::from(signature));
    frames.push(header);
    frames.push(parent);
    frames.push(metadata);
    frames.push(content);
    frames.extend(msg.buffers.iter().cloned());
    Ok(frames)
}

/// The received frame when `current` still equals what it decodes to,
/// otherwise a fresh serialization.
fn json_frame<T: PartialEq>(
    received: Option<&Bytes>,
    current: &T,
    parse: impl FnOnce(&[u8]) -> Result<T>,
    fresh: impl FnOnce() -> Result<Vec<u8>>,
) -> Result<Bytes> {
    if let Some(frame) = received {
        if parse(frame).is_ok_and(|decoded| decoded == *current) {
            return Ok(frame.clone());
        }
    }
    Ok(Bytes::from(fresh()?))
}

/// `{}` and `null` mean "no parent".
fn parse_parent(frame: &[u8]) -> Result<Option<Header>> {
    let parent: Value = from_frame("parent_header", frame)?;
    match parent {
        Value::Object(ref obj) if obj.is_empty() => Ok(None),
        Value::Null => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(|e| Error::decode(format!("parent_header: {}", e))),
    }
}

fn from_frame<T: serde::de::DeserializeOwned>(name: &str, frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame).map_err(|e| Error::decode(format!("{}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;
    use crate::wire::message::{EXECUTE_REPLY, EXECUTE_REQUEST};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn signer() -> Signer {
        Signer::new(b"abc").unwrap()
    }

    fn request() -> ComposedMessage {
        let mut msg = ComposedMessage::new(
            EXECUTE_REQUEST,
            &SessionId::from_string("sess".to_string()),
            "user",
            json!({"code": "2+2", "silent": false}),
        );
        msg.identities = vec![Bytes::from_static(b"id-1"), Bytes::from_static(b"id-2")];
        msg
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let signer = signer();
        let msg = request().reply(EXECUTE_REPLY, json!({"status": "ok", "execution_count": 1}));

        let frames = encode(&msg, &signer).unwrap();
        let decoded = decode(frames.clone(), &signer).unwrap();
        assert_eq!(decoded, msg);

        let again = encode(&decoded, &signer).unwrap();
        assert_eq!(again, frames);
    }

    #[test]
    fn test_frame_layout() {
        let msg = request();
        let frames = encode(&msg, &signer()).unwrap();

        assert_eq!(frames.len(), 2 + 6);
        assert_eq!(&frames[0][..], b"id-1");
        assert_eq!(&frames[2][..], DELIMITER);
        assert_eq!(frames[3].len(), 64);
        assert_eq!(&frames[5][..], b"{}");
    }

    #[test]
    fn test_buffers_survive() {
        let mut msg = request();
        msg.buffers = vec![Bytes::from_static(&[0, 1, 2])];
        let signer = signer();
        let decoded = decode(encode(&msg, &signer).unwrap(), &signer).unwrap();
        assert_eq!(decoded.buffers, msg.buffers);
    }

    #[test]
    fn test_signature_mismatch() {
        let mut frames = encode(&request(), &signer()).unwrap();
        let mut content = frames[7].to_vec();
        content[2] ^= 0x01;
        frames[7] = Bytes::from(content);

        let err = decode(frames, &signer()).unwrap_err();
        assert!(matches!(err, Error::Signature(_)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let frames = encode(&request(), &signer()).unwrap();
        let other = Signer::new(b"xyz").unwrap();
        assert!(matches!(decode(frames, &other), Err(Error::Signature(_))));
    }

    #[test]
    fn test_missing_delimiter_and_truncation() {
        let frames = encode(&request(), &signer()).unwrap();

        let no_delim: Vec<Bytes> = frames.iter().filter(|f| &f[..] != DELIMITER).cloned().collect();
        assert!(matches!(decode(no_delim, &signer()), Err(Error::Signature(_))));

        let truncated = frames[..frames.len() - 1].to_vec();
        assert!(matches!(decode(truncated, &signer()), Err(Error::Signature(_))));
    }

    #[test]
    fn test_bad_json_is_decode_error() {
        let signer = signer();
        let header = br#"{"msg_id":"1","msg_type":"execute_request"}"#.to_vec();
        let bad: &[u8] = b"{not json";
        let empty: &[u8] = b"{}";
        let sig = signer.sign(&[header.as_slice(), empty, empty, bad]);
        let frames = vec![
            Bytes::from_static(DELIMITER),
            Bytes::from(sig),
            Bytes::from(header),
            Bytes::from_static(b"{}"),
            Bytes::from_static(b"{}"),
            Bytes::from_static(b"{not json"),
        ];
        assert!(matches!(decode(frames, &signer), Err(Error::Decode(_))));
    }

    #[test]
    fn test_unsigned_mode_skips_verification() {
        let unsigned = Signer::unsigned();
        let mut frames = encode(&request(), &unsigned).unwrap();
        assert_eq!(&frames[3][..], b"");

        frames[3] = Bytes::from_static(b"deadbeef");
        assert!(decode(frames, &unsigned).is_ok());
    }

    #[test]
    fn test_lenient_header_fields() {
        let signer = Signer::unsigned();
        let frames = vec![
            Bytes::from_static(DELIMITER),
            Bytes::new(),
            Bytes::from_static(br#"{"msg_id":"m","msg_type":"kernel_info_request","extra":1}"#),
            Bytes::from_static(b"{}"),
            Bytes::from_static(b"{}"),
            Bytes::from_static(b"{}"),
        ];
        let msg = decode(frames, &signer).unwrap();
        assert_eq!(msg.msg_type(), "kernel_info_request");
        assert!(msg.parent_header.is_none());
        assert!(msg.identities.is_empty());
    }

    /// Frames as jupyter_client writes them: `json.dumps` separators, its own
    /// key order, extra header fields.
    fn client_frames(signer: &Signer) -> Vec<Bytes> {
        let header: &[u8] = br#"{"msg_id": "m1", "msg_type": "execute_request", "username": "u", "session": "s", "date": "2024-01-01T00:00:00.000000Z", "version": "5.3", "subshell_id": null}"#;
        let parent: &[u8] = b"{}";
        let metadata: &[u8] = br#"{"trusted": true, "cellId": "c-1"}"#;
        let content: &[u8] = br#"{"silent": false, "store_history": true, "user_expressions": {}, "allow_stdin": true, "stop_on_error": true, "code": "2+2"}"#;
        let sig = signer.sign(&[header, parent, metadata, content]);
        vec![
            Bytes::from_static(b"client-id"),
            Bytes::from_static(DELIMITER),
            Bytes::from(sig),
            Bytes::copy_from_slice(header),
            Bytes::copy_from_slice(parent),
            Bytes::copy_from_slice(metadata),
            Bytes::copy_from_slice(content),
        ]
    }

    #[test]
    fn test_client_frames_round_trip_byte_identical() {
        let signer = signer();
        let frames = client_frames(&signer);

        let decoded = decode(frames.clone(), &signer).unwrap();
        assert_eq!(decoded.msg_type(), EXECUTE_REQUEST);
        assert_eq!(decoded.content["code"], "2+2");

        let again = encode(&decoded, &signer).unwrap();
        assert_eq!(again, frames);
    }

    #[test]
    fn test_edited_field_is_reserialized() {
        let signer = signer();
        let frames = client_frames(&signer);
        let mut decoded = decode(frames.clone(), &signer).unwrap();
        decoded.content["code"] = json!("3+3");

        let again = encode(&decoded, &signer).unwrap();
        assert_eq!(again[3], frames[3]);
        assert_eq!(again[5], frames[5]);
        assert_ne!(again[6], frames[6]);
        assert_ne!(again[2], frames[2]);

        let redecoded = decode(again, &signer).unwrap();
        assert_eq!(redecoded.content["code"], "3+3");
    }

    proptest! {
        #[test]
        fn prop_round_trip(code in ".*", silent in any::<bool>(), ids in prop::collection::vec("[a-z0-9]{1,8}", 0..3)) {
            let signer = signer();
            let mut msg = ComposedMessage::new(
                EXECUTE_REQUEST,
                &SessionId::new(),
                "user",
                json!({"code": code, "silent": silent}),
            );
            msg.identities = ids.into_iter().map(Bytes::from).collect();

            let frames = encode(&msg, &signer).unwrap();
            let decoded = decode(frames.clone(), &signer).unwrap();
            prop_assert_eq!(&decoded, &msg);
            prop_assert_eq!(encode(&decoded, &signer).unwrap(), frames);
        }
    }
}
