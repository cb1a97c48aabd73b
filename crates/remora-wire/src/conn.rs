//! Framed message I/O and the authenticated handshake shared by both ends.

use crate::message::*;
use crate::transport::WireError;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HmacSha256 = Hmac<Sha256>;

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Generate an HMAC-SHA256 signature, hex encoded.
pub fn hmac_sign(secret: &str, data: &[u8]) -> String {
    // HMAC accepts keys of any length, so this never fails.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an HMAC-SHA256 signature using constant-time comparison.
pub fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

/// Identity a node presents during the handshake.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub node_name: String,
    pub shared_secret: String,
}

impl NodeIdentity {
    /// Sign a fresh nonce for this node. Returns `(nonce, hmac)`.
    pub fn sign(&self) -> (String, String) {
        let nonce = uuid::Uuid::new_v4().to_string();
        let data = format!("{}{}", nonce, self.node_id);
        let auth = hmac_sign(&self.shared_secret, data.as_bytes());
        (nonce, auth)
    }

    /// Check a remote node's signature over `nonce + node_id`.
    pub fn verify(&self, nonce: &str, node_id: &str, auth_hmac: &str) -> bool {
        let data = format!("{nonce}{node_id}");
        hmac_verify(&self.shared_secret, data.as_bytes(), auth_hmac)
    }
}

/// The remote side of a completed handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteNode {
    pub node_id: String,
    pub node_name: String,
    pub protocol_version: u32,
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_message<W>(writer: &mut W, msg: &WireMessage) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(msg)?;
    if bytes.len() - 4 > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: (bytes.len() - 4) as u32,
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON).
pub async fn read_message<R>(reader: &mut R) -> Result<WireMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let msg = decode_message(&body)?;
    Ok(msg)
}

/// Perform the controller side of the handshake on a fresh connection.
pub async fn client_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    identity: &NodeIdentity,
) -> Result<RemoteNode, WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (nonce, auth_hmac) = identity.sign();
    let handshake = WireMessage::new(WireMessageKind::Request(WireRequest::Handshake {
        node_id: identity.node_id.clone(),
        node_name: identity.node_name.clone(),
        protocol_version: PROTOCOL_VERSION,
        nonce,
        auth_hmac,
    }));
    write_message(writer, &handshake).await?;

    let ack = read_message(reader).await?;
    match ack.kind {
        WireMessageKind::Response(WireResponse::HandshakeAck {
            node_id,
            node_name,
            protocol_version,
            nonce,
            auth_hmac,
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(WireError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: protocol_version,
                });
            }
            if !identity.verify(&nonce, &node_id, &auth_hmac) {
                return Err(WireError::HandshakeFailed(
                    "HMAC verification failed on HandshakeAck".into(),
                ));
            }
            Ok(RemoteNode {
                node_id,
                node_name,
                protocol_version,
            })
        }
        WireMessageKind::Response(WireResponse::Error { code, message }) => Err(
            WireError::HandshakeFailed(format!("Remote error {code}: {message}")),
        ),
        _ => Err(WireError::HandshakeFailed(
            "Unexpected response to handshake".to_string(),
        )),
    }
}

/// Send a request and wait for the response with the same ID.
///
/// Notifications arriving in between are skipped.
pub async fn request<R, W>(
    reader: &mut R,
    writer: &mut W,
    request: WireRequest,
) -> Result<WireResponse, WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg = WireMessage::new(WireMessageKind::Request(request));
    write_message(writer, &msg).await?;
    loop {
        let reply = read_message(reader).await?;
        match reply.kind {
            WireMessageKind::Response(response) if reply.id == msg.id => return Ok(response),
            WireMessageKind::Response(_) => {
                return Err(WireError::UnexpectedResponse(format!(
                    "response id {} does not match request {}",
                    reply.id, msg.id
                )))
            }
            WireMessageKind::Notification(_) => continue,
            WireMessageKind::Request(_) => {
                return Err(WireError::UnexpectedResponse(
                    "request received while awaiting response".into(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(node_id: &str, secret: &str) -> NodeIdentity {
        NodeIdentity {
            node_id: node_id.to_string(),
            node_name: format!("{node_id}-name"),
            shared_secret: secret.to_string(),
        }
    }

    #[test]
    fn test_hmac_sign_verify() {
        let sig = hmac_sign("secret", b"nonce-node");
        assert_eq!(sig.len(), 64);
        assert!(hmac_verify("secret", b"nonce-node", &sig));
        assert!(!hmac_verify("other", b"nonce-node", &sig));
        assert!(!hmac_verify("secret", b"nonce-nodf", &sig));
    }

    #[test]
    fn test_identity_signature_binds_node_id() {
        let local = identity("node-1", "s3cret");
        let (nonce, auth) = local.sign();
        assert!(local.verify(&nonce, "node-1", &auth));
        assert!(!local.verify(&nonce, "node-2", &auth));
    }

    #[tokio::test]
    async fn test_framed_io_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = WireMessage::new(WireMessageKind::Request(WireRequest::Ping));
        write_message(&mut a, &msg).await.unwrap();
        let read = read_message(&mut b).await.unwrap();
        assert_eq!(read.id, msg.id);
        assert!(matches!(
            read.kind,
            WireMessageKind::Request(WireRequest::Ping)
        ));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        match read_message(&mut b).await {
            Err(WireError::MessageTooLarge { size, max }) => {
                assert_eq!(size, MAX_MESSAGE_SIZE + 1);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_reassembles_split_frame() {
        let msg = WireMessage::new(WireMessageKind::Request(WireRequest::Discover));
        let frame = encode_message(&msg).unwrap();
        let (header, body) = frame.split_at(4);
        let (first, rest) = body.split_at(body.len() / 2);
        let mut reader = tokio_test::io::Builder::new()
            .read(&header[..2])
            .read(&header[2..])
            .read(first)
            .read(rest)
            .build();

        let read = read_message(&mut reader).await.unwrap();
        assert_eq!(read.id, msg.id);
        assert!(matches!(
            read.kind,
            WireMessageKind::Request(WireRequest::Discover)
        ));
    }

    #[tokio::test]
    async fn test_read_on_closed_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_message(&mut b).await,
            Err(WireError::ConnectionClosed)
        ));
    }
}
