//! Message envelope and CBOR framing.

use crate::error::{ProtocolError, ProtocolResult};
use crate::packets::Packet;
use serde::{Deserialize, Serialize};

/// Wire format version written in front of every encoded message.
pub const WIRE_VERSION: u16 = 1;

/// Exchange a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    /// Clock offset negotiation.
    TimeSync,
    /// Version, schema and security negotiation.
    AbilitySync,
    /// Record transfer.
    DataSync,
    /// Subscribe/unsubscribe commands.
    ControlSync,
    /// Remote query.
    RemoteExecute,
}

/// Role of a message in its exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Starts an exchange.
    Request,
    /// Answers a request.
    Response,
    /// One-way notification.
    Notify,
}

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message.
    pub kind: MessageType,
    /// Session of the sending task; responses echo the request's session.
    pub session_id: u32,
    /// Position of the message within its session.
    pub sequence_id: u32,
    /// Body.
    pub packet: Packet,
}

impl Message {
    /// Creates a request.
    pub fn request(session_id: u32, sequence_id: u32, packet: Packet) -> Self {
        Self {
            kind: MessageType::Request,
            session_id,
            sequence_id,
            packet,
        }
    }

    /// Creates a response echoing the session and sequence of `request`.
    pub fn response_to(request: &Message, packet: Packet) -> Self {
        Self {
            kind: MessageType::Response,
            session_id: request.session_id,
            sequence_id: request.sequence_id,
            packet,
        }
    }

    /// Creates a notification.
    pub fn notify(session_id: u32, sequence_id: u32, packet: Packet) -> Self {
        Self {
            kind: MessageType::Notify,
            session_id,
            sequence_id,
            packet,
        }
    }

    /// Exchange this message belongs to.
    pub fn id(&self) -> MessageId {
        self.packet.message_id()
    }

    /// Whether the message is a request.
    pub fn is_request(&self) -> bool {
        self.kind == MessageType::Request
    }

    /// Encodes to CBOR, prefixed with [`WIRE_VERSION`].
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&(WIRE_VERSION, self), &mut bytes)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedVersion`] if the frame was written
    /// by a newer wire format, and [`ProtocolError::Decode`] for malformed
    /// bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value: ciborium::Value =
            ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let mut frame = match value {
            ciborium::Value::Array(items) if items.len() == 2 => items,
            _ => return Err(ProtocolError::Decode("expected [version, message]".into())),
        };
        let remote = frame[0]
            .as_integer()
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| ProtocolError::Decode("missing wire version".into()))?;
        if remote > WIRE_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                local: WIRE_VERSION,
                remote,
            });
        }
        let body = frame.pop().unwrap_or(ciborium::Value::Null);
        body.deserialized()
            .map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::SyncMode;
    use crate::packets::{
        AbilitySyncAck, AckCode, DataAckPacket, DataRequestPacket, QuerySpec, TimeSyncPacket,
    };
    use kvsync_storage::DataItem;
    use proptest::prelude::*;

    #[test]
    fn data_request_survives_codec() {
        let items = vec![
            DataItem::put(b"a".to_vec(), b"1".to_vec(), 10),
            DataItem::tombstone(b"b".to_vec(), 11),
        ];
        let packet = DataRequestPacket::batch(SyncMode::PushAndPull, items, 0, 11)
            .with_query(Some(QuerySpec::new("q1", b"a".to_vec())))
            .with_last(true);
        let msg = Message::request(7, 1, Packet::DataRequest(packet));

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.id(), MessageId::DataSync);
    }

    #[test]
    fn response_echoes_session_and_sequence() {
        let req = Message::request(42, 3, Packet::TimeSync(TimeSyncPacket::request(100)));
        let resp = Message::response_to(&req, Packet::DataAck(DataAckPacket::ok(5)));
        assert_eq!(resp.session_id, 42);
        assert_eq!(resp.sequence_id, 3);
        assert_eq!(resp.kind, MessageType::Response);
    }

    #[test]
    fn newer_wire_version_is_rejected() {
        let msg = Message::notify(1, 1, Packet::AbilityAck(AbilitySyncAck::new(AckCode::Ok)));
        let mut bytes = Vec::new();
        ciborium::into_writer(&(WIRE_VERSION + 1, &msg), &mut bytes).unwrap();

        let err = Message::decode(&bytes).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnsupportedVersion {
                local: WIRE_VERSION,
                remote: WIRE_VERSION + 1
            }
        );
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = Message::decode(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));

        let mut bytes = Vec::new();
        ciborium::into_writer(&"not a frame", &mut bytes).unwrap();
        assert!(matches!(
            Message::decode(&bytes).unwrap_err(),
            ProtocolError::Decode(_)
        ));
    }

    proptest! {
        #[test]
        fn time_sync_timestamps_preserved(begin in any::<u64>(), end in any::<u64>()) {
            let mut packet = TimeSyncPacket::request(begin);
            packet.target_time_end = end;
            let msg = Message::request(1, 1, Packet::TimeSync(packet));
            let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded.packet, Packet::TimeSync(packet));
        }
    }
}
