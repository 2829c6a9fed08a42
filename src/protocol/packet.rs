//! The packets exchanged during the handshake, status and login states.
//!
//! Packet ids are only meaningful relative to `(state, direction)`: `0x00`
//! is the handshake serverbound, the status response clientbound in the
//! Status state and the disconnect clientbound in the Login state. Decoding
//! therefore always dispatches on the session's current state, never on the
//! id alone.

use uuid::Uuid;

use super::{
    ProtocolError, ProtocolState,
    codec::{self, Reader},
};

/// Next-state selector carried in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
}

impl NextState {
    fn id(self) -> i32 {
        match self {
            NextState::Status => 1,
            NextState::Login => 2,
        }
    }
}

/// A packet we send. `encode` writes `packet_id || fields`, the framing is
/// applied by the session.
pub trait Serverbound {
    fn encode(&self, buf: &mut Vec<u8>);
}

/// Handshake `0x00`. Always the first packet of a connection.
pub struct Handshake<'a> {
    pub protocol_version: i32,
    pub server_address: &'a str,
    pub server_port: u16,
    pub next_state: NextState,
}

impl Serverbound for Handshake<'_> {
    fn encode(&self, buf: &mut Vec<u8>) {
        codec::write_varint(buf, 0x00);
        codec::write_varint(buf, self.protocol_version);
        codec::write_string(buf, self.server_address);
        codec::write_ushort(buf, self.server_port);
        codec::write_varint(buf, self.next_state.id());
    }
}

/// Status Request `0x00`. Empty body.
pub struct StatusRequest;

impl Serverbound for StatusRequest {
    fn encode(&self, buf: &mut Vec<u8>) {
        codec::write_varint(buf, 0x00);
    }
}

/// Login Start `0x00`. The field layout changed several times across
/// protocol versions, so encoding needs the version the handshake declared:
/// 759 and 760 carry a signature-data flag, 760 through 763 carry a
/// has-uuid flag, and everything above 758 carries the profile uuid.
pub struct LoginStart<'a> {
    pub protocol_version: i32,
    pub username: &'a str,
    pub uuid: Uuid,
}

impl Serverbound for LoginStart<'_> {
    fn encode(&self, buf: &mut Vec<u8>) {
        codec::write_varint(buf, 0x00);
        codec::write_string(buf, self.username);

        let version = self.protocol_version;
        if version > 758 {
            if version == 759 || version == 760 {
                codec::write_bool(buf, false); // has sig data
            }
            if (760..=763).contains(&version) {
                codec::write_bool(buf, true); // has uuid
            }
            codec::write_uuid(buf, self.uuid);
        }
    }
}

/// Encryption Response `0x01`. Both arrays are encrypted under the server's
/// public key with PKCS#1 v1.5 padding.
pub struct EncryptionResponse {
    pub encrypted_secret: Vec<u8>,
    pub encrypted_verify_token: Vec<u8>,
}

impl Serverbound for EncryptionResponse {
    fn encode(&self, buf: &mut Vec<u8>) {
        codec::write_varint(buf, 0x01);
        codec::write_byte_array(buf, &self.encrypted_secret);
        codec::write_byte_array(buf, &self.encrypted_verify_token);
    }
}

/// Encryption Request `0x01` clientbound.
#[derive(Debug)]
pub struct EncryptionRequest {
    pub server_id: String,
    pub public_key: Vec<u8>,
    pub verify_token: Vec<u8>,
}

/// A packet the server sent, decoded according to the session state it
/// arrived in.
#[derive(Debug)]
pub enum Clientbound {
    /// Status `0x00`: the status response JSON document.
    StatusResponse { json: String },
    /// Login `0x00`: login rejected, reason is a chat component.
    Disconnect { reason: String },
    /// Login `0x01`.
    EncryptionRequest(EncryptionRequest),
    /// Login `0x02`. The profile fields vary per version and are not needed
    /// for classification, so they are left unparsed.
    LoginSuccess,
    /// Login `0x03`: compression threshold for the rest of the session.
    SetCompression { threshold: i32 },
    /// Login `0x04`: mod-loader channel negotiation.
    PluginRequest {
        message_id: i32,
        channel: String,
        data: Vec<u8>,
    },
}

impl Clientbound {
    /// Decodes a packet body (`packet_id || fields`) in the given state.
    pub fn decode(state: ProtocolState, body: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(body);
        let id = reader.read_varint()?;

        match (state, id) {
            (ProtocolState::Status, 0x00) => Ok(Clientbound::StatusResponse {
                json: reader.read_string()?,
            }),
            (ProtocolState::Login, 0x00) => Ok(Clientbound::Disconnect {
                reason: reader.read_string()?,
            }),
            (ProtocolState::Login, 0x01) => {
                let server_id = reader.read_string()?;
                let public_key = reader.read_byte_array()?.to_vec();
                // a few servers lie about the token length, take what's there
                let verify_token = match reader.read_byte_array() {
                    Ok(token) => token.to_vec(),
                    Err(_) => reader.read_rest().to_vec(),
                };
                Ok(Clientbound::EncryptionRequest(EncryptionRequest {
                    server_id,
                    public_key,
                    verify_token,
                }))
            }
            (ProtocolState::Login, 0x02) => Ok(Clientbound::LoginSuccess),
            (ProtocolState::Login, 0x03) => Ok(Clientbound::SetCompression {
                threshold: reader.read_varint()?,
            }),
            (ProtocolState::Login, 0x04) => Ok(Clientbound::PluginRequest {
                message_id: reader.read_varint()?,
                channel: reader.read_string()?,
                data: reader.read_rest().to_vec(),
            }),
            _ => Err(ProtocolError::UnexpectedPacket { state, id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_encoding() {
        let mut buf = Vec::new();
        Handshake {
            protocol_version: 765,
            server_address: "localhost",
            server_port: 25565,
            next_state: NextState::Status,
        }
        .encode(&mut buf);

        let mut expected = vec![0x00];
        codec::write_varint(&mut expected, 765);
        codec::write_string(&mut expected, "localhost");
        expected.extend_from_slice(&[0x63, 0xDD]); // 25565 big-endian
        expected.push(0x01);
        assert_eq!(buf, expected);
    }

    #[test]
    fn login_start_pre_759_has_no_uuid() {
        let mut buf = Vec::new();
        LoginStart {
            protocol_version: 47,
            username: "Steve",
            uuid: Uuid::nil(),
        }
        .encode(&mut buf);
        // id, length-prefixed name, nothing else
        assert_eq!(buf.len(), 1 + 1 + 5);
    }

    #[test]
    fn login_start_763_has_flag_and_uuid() {
        let mut buf = Vec::new();
        LoginStart {
            protocol_version: 763,
            username: "Steve",
            uuid: "4566e69f-c907-48ee-8d71-d7ba5aa00d20".parse().unwrap(),
        }
        .encode(&mut buf);
        assert_eq!(buf.len(), 1 + 1 + 5 + 1 + 16);
        assert_eq!(buf[7], 0x01); // has uuid
    }

    #[test]
    fn id_zero_depends_on_state() {
        let mut body = vec![0x00];
        codec::write_string(&mut body, r#"{"text":"hi"}"#);

        match Clientbound::decode(ProtocolState::Status, &body).unwrap() {
            Clientbound::StatusResponse { json } => assert_eq!(json, r#"{"text":"hi"}"#),
            other => panic!("expected status response, got {other:?}"),
        }
        match Clientbound::decode(ProtocolState::Login, &body).unwrap() {
            Clientbound::Disconnect { reason } => assert_eq!(reason, r#"{"text":"hi"}"#),
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[test]
    fn unknown_id_for_state_is_rejected() {
        let body = [0x07];
        assert!(matches!(
            Clientbound::decode(ProtocolState::Status, &body),
            Err(ProtocolError::UnexpectedPacket {
                state: ProtocolState::Status,
                id: 0x07,
            })
        ));
    }
}
