//! Authenticated length-framed IPC channel.
//!
//! The channel rides on any bidirectional byte stream (`Read + Write`); it
//! never opens sockets itself. A connection starts with a five-field,
//! two-round-trip nonce-challenge handshake that mutually authenticates
//! both ends against a pre-shared secret and derives a per-connection
//! session key:
//!
//! | Step | Direction | Bytes | Contents |
//! |------|-----------|-------|----------|
//! | 1 | S→C | 40 | `"WSLH"`, version, 3 reserved, server nonce (32) |
//! | 2 | C→S | 72 | `"WSLC"`, version, 3 reserved, client nonce (32), client proof (32) |
//! | 3 | S→C | 40 | `"WSLA"`, version, 3 reserved, server proof (32) |
//!
//! All derivations are HMAC-SHA-256 keyed with the shared secret:
//! `client_proof = HMAC(secret, "client-proof" || server_nonce || client_nonce)`,
//! `server_proof = HMAC(secret, "server-proof" || client_nonce || server_nonce)`,
//! `session_key = HMAC(secret, "session" || server_nonce || client_nonce)`.
//!
//! After the handshake each event travels as a `"WSLE"` frame: a 12-byte
//! header (magic, version, type, 2 reserved, little-endian u32 payload
//! length), a 32-byte payload MAC keyed with the session key, then the
//! canonical JSON payload. Any magic, version, type, or MAC mismatch is an
//! error; callers drop the connection rather than attempt a resync.
//!
//! The frame length is validated against [`MAX_FRAME_SIZE`] before any
//! allocation. Reads loop through `read_exact`, so transports only need
//! ordinary blocking semantics.

use std::fmt;
use std::io::{Read, Write};

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::event::{EventError, EventRecord};

type HmacSha256 = Hmac<Sha256>;

/// Wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum accepted frame payload (16 MiB), validated before allocation.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

const SERVER_HELLO_MAGIC: &[u8; 4] = b"WSLH";
const CLIENT_HELLO_MAGIC: &[u8; 4] = b"WSLC";
const SERVER_ACK_MAGIC: &[u8; 4] = b"WSLA";
const FRAME_MAGIC: &[u8; 4] = b"WSLE";

const FRAME_TYPE_EVENT: u8 = 1;

const NONCE_LEN: usize = 32;
const PROOF_LEN: usize = 32;
const MAC_LEN: usize = 32;
const HELLO_LEN: usize = 4 + 1 + 3 + NONCE_LEN;
const CLIENT_RESPONSE_LEN: usize = 4 + 1 + 3 + NONCE_LEN + PROOF_LEN;
const ACK_LEN: usize = 4 + 1 + 3 + PROOF_LEN;
const FRAME_HEADER_LEN: usize = 4 + 1 + 1 + 2 + 4;

/// Errors surfaced by handshake and frame transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// The underlying stream failed or closed.
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A message carried the wrong magic bytes.
    #[error("unexpected magic in {context}")]
    BadMagic {
        /// Which message was being read.
        context: &'static str,
    },

    /// The peer speaks a different protocol version.
    #[error("unsupported protocol version {version}")]
    VersionMismatch {
        /// The version byte received.
        version: u8,
    },

    /// A handshake proof did not verify; the secrets differ or the
    /// exchange was tampered with.
    #[error("handshake proof mismatch")]
    ProofMismatch,

    /// A data frame carried an unknown type byte.
    #[error("unexpected frame type {frame_type}")]
    UnexpectedFrameType {
        /// The type byte received.
        frame_type: u8,
    },

    /// A frame declared a payload larger than [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes exceeds {max}")]
    FrameTooLarge {
        /// Declared payload length.
        size: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// The frame MAC did not verify against the session key.
    #[error("frame MAC mismatch")]
    MacMismatch,

    /// The payload passed its MAC but is not a valid event.
    #[error("malformed frame payload: {0}")]
    MalformedPayload(#[from] EventError),
}

/// A 32-byte symmetric key derived during the handshake, live for the
/// lifetime of one connection.
#[derive(Clone)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).unwrap_u8() == 1
    }
}

impl Eq for SessionKey {}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn hmac_label(secret: &[u8], label: &str, first: &[u8], second: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(label.as_bytes());
    mac.update(first);
    mac.update(second);
    mac.finalize().into_bytes().into()
}

/// Runs the server side of the handshake over `stream`.
///
/// # Errors
///
/// Returns a [`ChannelError`] on I/O failure, magic or version mismatch,
/// or when the client proof does not verify. The caller must drop the
/// connection on any error.
pub fn server_handshake<S: Read + Write>(
    stream: &mut S,
    secret: &[u8],
) -> Result<SessionKey, ChannelError> {
    let server_nonce = generate_nonce();

    let mut hello = [0u8; HELLO_LEN];
    hello[..4].copy_from_slice(SERVER_HELLO_MAGIC);
    hello[4] = PROTOCOL_VERSION;
    hello[8..].copy_from_slice(&server_nonce);
    stream.write_all(&hello)?;
    stream.flush()?;

    let mut response = [0u8; CLIENT_RESPONSE_LEN];
    stream.read_exact(&mut response)?;
    if &response[..4] != CLIENT_HELLO_MAGIC {
        return Err(ChannelError::BadMagic {
            context: "client hello",
        });
    }
    if response[4] != PROTOCOL_VERSION {
        return Err(ChannelError::VersionMismatch {
            version: response[4],
        });
    }
    let mut client_nonce = [0u8; NONCE_LEN];
    client_nonce.copy_from_slice(&response[8..8 + NONCE_LEN]);
    let client_proof = &response[8 + NONCE_LEN..];

    let expected = hmac_label(secret, "client-proof", &server_nonce, &client_nonce);
    if expected[..].ct_eq(client_proof).unwrap_u8() == 0 {
        return Err(ChannelError::ProofMismatch);
    }

    let server_proof = hmac_label(secret, "server-proof", &client_nonce, &server_nonce);
    let mut ack = [0u8; ACK_LEN];
    ack[..4].copy_from_slice(SERVER_ACK_MAGIC);
    ack[4] = PROTOCOL_VERSION;
    ack[8..].copy_from_slice(&server_proof);
    stream.write_all(&ack)?;
    stream.flush()?;

    Ok(SessionKey(hmac_label(
        secret,
        "session",
        &server_nonce,
        &client_nonce,
    )))
}

/// Runs the client side of the handshake over `stream`.
///
/// # Errors
///
/// Returns a [`ChannelError`] on I/O failure, magic or version mismatch,
/// or when the server proof does not verify.
pub fn client_handshake<S: Read + Write>(
    stream: &mut S,
    secret: &[u8],
) -> Result<SessionKey, ChannelError> {
    let mut hello = [0u8; HELLO_LEN];
    stream.read_exact(&mut hello)?;
    if &hello[..4] != SERVER_HELLO_MAGIC {
        return Err(ChannelError::BadMagic {
            context: "server hello",
        });
    }
    if hello[4] != PROTOCOL_VERSION {
        return Err(ChannelError::VersionMismatch { version: hello[4] });
    }
    let mut server_nonce = [0u8; NONCE_LEN];
    server_nonce.copy_from_slice(&hello[8..]);

    let client_nonce = generate_nonce();
    let client_proof = hmac_label(secret, "client-proof", &server_nonce, &client_nonce);

    let mut response = [0u8; CLIENT_RESPONSE_LEN];
    response[..4].copy_from_slice(CLIENT_HELLO_MAGIC);
    response[4] = PROTOCOL_VERSION;
    response[8..8 + NONCE_LEN].copy_from_slice(&client_nonce);
    response[8 + NONCE_LEN..].copy_from_slice(&client_proof);
    stream.write_all(&response)?;
    stream.flush()?;

    let mut ack = [0u8; ACK_LEN];
    stream.read_exact(&mut ack)?;
    if &ack[..4] != SERVER_ACK_MAGIC {
        return Err(ChannelError::BadMagic {
            context: "server ack",
        });
    }
    if ack[4] != PROTOCOL_VERSION {
        return Err(ChannelError::VersionMismatch { version: ack[4] });
    }
    let server_proof = &ack[8..];
    let expected = hmac_label(secret, "server-proof", &client_nonce, &server_nonce);
    if expected[..].ct_eq(server_proof).unwrap_u8() == 0 {
        return Err(ChannelError::ProofMismatch);
    }

    Ok(SessionKey(hmac_label(
        secret,
        "session",
        &server_nonce,
        &client_nonce,
    )))
}

/// Sends one event as an authenticated frame.
///
/// # Errors
///
/// Returns [`ChannelError::FrameTooLarge`] when the canonical payload
/// exceeds [`MAX_FRAME_SIZE`], or an I/O error from the stream.
pub fn send_event<W: Write>(
    writer: &mut W,
    session: &SessionKey,
    record: &EventRecord,
) -> Result<(), ChannelError> {
    let payload = record.canonical_json();
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(ChannelError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE as usize,
        });
    }
    #[allow(clippy::cast_possible_truncation)] // bounded above
    let payload_len = payload.len() as u32;

    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(FRAME_MAGIC);
    header[4] = PROTOCOL_VERSION;
    header[5] = FRAME_TYPE_EVENT;
    header[8..].copy_from_slice(&payload_len.to_le_bytes());

    let mut mac = HmacSha256::new_from_slice(session.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    let tag: [u8; MAC_LEN] = mac.finalize().into_bytes().into();

    writer.write_all(&header)?;
    writer.write_all(&tag)?;
    writer.write_all(payload.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Receives one authenticated frame and decodes the event.
///
/// # Errors
///
/// Returns a [`ChannelError`] on I/O failure, header mismatch, oversized
/// length, MAC mismatch, or a payload that does not decode. The caller
/// must drop the connection on any error.
pub fn recv_event<R: Read>(
    reader: &mut R,
    session: &SessionKey,
) -> Result<EventRecord, ChannelError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    if &header[..4] != FRAME_MAGIC {
        return Err(ChannelError::BadMagic {
            context: "event frame",
        });
    }
    if header[4] != PROTOCOL_VERSION {
        return Err(ChannelError::VersionMismatch { version: header[4] });
    }
    if header[5] != FRAME_TYPE_EVENT {
        return Err(ChannelError::UnexpectedFrameType {
            frame_type: header[5],
        });
    }
    let payload_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if payload_len > MAX_FRAME_SIZE {
        return Err(ChannelError::FrameTooLarge {
            size: payload_len as usize,
            max: MAX_FRAME_SIZE as usize,
        });
    }

    let mut tag = [0u8; MAC_LEN];
    reader.read_exact(&mut tag)?;

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload)?;

    let mut mac = HmacSha256::new_from_slice(session.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(&payload);
    mac.verify_slice(&tag)
        .map_err(|_| ChannelError::MacMismatch)?;

    Ok(EventRecord::from_canonical_bytes(&payload)?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::event::{Category, Severity};

    fn sample_record() -> EventRecord {
        let mut record = EventRecord::new(Category::Ipc, Severity::Info, "ping");
        record.timestamp = crate::event::parse_timestamp("2024-05-01T10:00:00.000000Z").unwrap();
        record.sequence = 7;
        record.source = "bridge".to_string();
        record.set_attribute("peer", "guest");
        record
    }

    fn handshake_pair(
        server_secret: &'static [u8],
        client_secret: &'static [u8],
    ) -> (
        Result<SessionKey, ChannelError>,
        Result<SessionKey, ChannelError>,
    ) {
        let (mut server_end, mut client_end) = UnixStream::pair().unwrap();
        let server = std::thread::spawn(move || server_handshake(&mut server_end, server_secret));
        let client = client_handshake(&mut client_end, client_secret);
        (server.join().unwrap(), client)
    }

    #[test]
    fn test_handshake_derives_matching_session_keys() {
        let (server, client) = handshake_pair(b"secret", b"secret");
        let server = server.unwrap();
        let client = client.unwrap();
        assert_eq!(server, client);
        assert_eq!(server.as_bytes().len(), 32);
    }

    #[test]
    fn test_handshake_rejects_secret_mismatch() {
        let (server, client) = handshake_pair(b"secret", b"other");
        assert!(matches!(server, Err(ChannelError::ProofMismatch)));
        // The server drops the connection before acking, so the client sees
        // either a proof failure or a closed stream.
        assert!(client.is_err());
    }

    #[test]
    fn test_tampered_server_nonce_fails_both_proofs() {
        let (mut server_end, mut proxy_server_side) = UnixStream::pair().unwrap();
        let (mut client_end, mut proxy_client_side) = UnixStream::pair().unwrap();

        // Relay that flips the high bit of the server nonce in the hello and
        // forwards every later message verbatim. Dropping both ends at the
        // end signals EOF to whichever side is still waiting.
        let relay = std::thread::spawn(move || {
            let mut hello = [0u8; 40];
            if proxy_server_side.read_exact(&mut hello).is_err() {
                return;
            }
            hello[8] ^= 0x80;
            if proxy_client_side.write_all(&hello).is_err() {
                return;
            }
            let mut response = [0u8; 72];
            if proxy_client_side.read_exact(&mut response).is_err() {
                return;
            }
            if proxy_server_side.write_all(&response).is_err() {
                return;
            }
            let mut ack = [0u8; 40];
            if proxy_server_side.read_exact(&mut ack).is_ok() {
                let _ = proxy_client_side.write_all(&ack);
            }
        });

        let server = std::thread::spawn(move || server_handshake(&mut server_end, b"secret"));
        let client = client_handshake(&mut client_end, b"secret");
        let server = server.join().unwrap();
        let _ = relay.join();

        assert!(server.is_err(), "server must reject the forged client proof");
        assert!(client.is_err(), "client must not complete the handshake");
    }

    #[test]
    fn test_frame_roundtrip() {
        let (server, client) = handshake_pair(b"secret", b"secret");
        let key = server.unwrap();
        let peer_key = client.unwrap();
        let record = sample_record();

        let mut wire = Vec::new();
        send_event(&mut wire, &key, &record).unwrap();
        let received = recv_event(&mut Cursor::new(&wire), &peer_key).unwrap();
        assert_eq!(received.message, record.message);
        assert_eq!(received.sequence, record.sequence);
        assert_eq!(received.attribute("peer"), Some("guest"));
    }

    #[test]
    fn test_any_single_byte_mutation_is_rejected() {
        let (server, _client) = handshake_pair(b"secret", b"secret");
        let key = server.unwrap();
        let mut wire = Vec::new();
        send_event(&mut wire, &key, &sample_record()).unwrap();

        for index in 0..wire.len() {
            let mut corrupted = wire.clone();
            corrupted[index] ^= 0x01;
            let result = recv_event(&mut Cursor::new(&corrupted), &key);
            assert!(result.is_err(), "mutation at byte {index} must be rejected");
        }
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let (server, _client) = handshake_pair(b"secret", b"secret");
        let key = server.unwrap();
        let mut header = [0u8; 12];
        header[..4].copy_from_slice(b"WSLE");
        header[4] = PROTOCOL_VERSION;
        header[5] = 1;
        header[8..].copy_from_slice(&(MAX_FRAME_SIZE + 1).to_le_bytes());
        let result = recv_event(&mut Cursor::new(&header), &key);
        assert!(matches!(result, Err(ChannelError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_wrong_session_key_rejects_mac() {
        let (first, _) = handshake_pair(b"secret", b"secret");
        let (second, _) = handshake_pair(b"secret", b"secret");
        let sender = first.unwrap();
        let receiver = second.unwrap();
        assert_ne!(sender, receiver, "fresh nonces must give fresh keys");

        let mut wire = Vec::new();
        send_event(&mut wire, &sender, &sample_record()).unwrap();
        let result = recv_event(&mut Cursor::new(&wire), &receiver);
        assert!(matches!(result, Err(ChannelError::MacMismatch)));
    }
}
