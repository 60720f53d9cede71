//! Relay frames
//!
//! Tunneled payloads travel to the relay port as a stream of length-prefixed
//! sealed frames. The original destination rides inside the sealed part so
//! the relay can recover it after the outer header was rewritten:
//!
//! ```text
//! frame   = len:u32 BE | sealed
//! sealed  = nonce[24] | AEAD(plain) | tag[16]
//! plain   = dst_ip[4] | dst_port:u16 BE | payload
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Encoder, LengthDelimitedCodec};

use crate::crypto::{NONCE_LEN, TAG_LEN};
use crate::error::{Error, Result};
use crate::secrets::PeerSecret;

/// Length prefix size
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Destination header inside the sealed plaintext
pub const DESTINATION_LEN: usize = 6;

/// Bytes a sealed frame adds on top of the payload
pub const FRAME_OVERHEAD: usize = LENGTH_PREFIX_LEN + NONCE_LEN + TAG_LEN + DESTINATION_LEN;

/// A payload together with the destination it was originally sent to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub destination: SocketAddrV4,
    pub payload: Bytes,
}

impl RelayFrame {
    pub fn new(destination: SocketAddrV4, payload: impl Into<Bytes>) -> Self {
        Self {
            destination,
            payload: payload.into(),
        }
    }

    fn to_plaintext(&self) -> Vec<u8> {
        let mut plain = Vec::with_capacity(DESTINATION_LEN + self.payload.len());
        plain.extend_from_slice(&self.destination.ip().octets());
        plain.extend_from_slice(&self.destination.port().to_be_bytes());
        plain.extend_from_slice(&self.payload);
        plain
    }

    fn from_plaintext(plain: Vec<u8>) -> Result<Self> {
        if plain.len() < DESTINATION_LEN {
            return Err(Error::Frame(format!(
                "{} byte plaintext has no destination header",
                plain.len()
            )));
        }
        let ip = Ipv4Addr::new(plain[0], plain[1], plain[2], plain[3]);
        let port = u16::from_be_bytes([plain[4], plain[5]]);
        if port == 0 || ip.is_unspecified() {
            return Err(Error::Frame(format!("invalid destination {}:{}", ip, port)));
        }

        let mut payload = Bytes::from(plain);
        let payload = payload.split_off(DESTINATION_LEN);
        Ok(Self {
            destination: SocketAddrV4::new(ip, port),
            payload,
        })
    }

    /// Encrypt under the peer's relay cipher (without length prefix)
    pub fn seal(&self, secret: &PeerSecret) -> Result<Vec<u8>> {
        secret.cipher().seal(&self.to_plaintext())
    }

    /// Decrypt a sealed frame body (without length prefix)
    pub fn open(sealed: &[u8], secret: &PeerSecret) -> Result<Self> {
        if sealed.len() < NONCE_LEN + TAG_LEN + DESTINATION_LEN {
            return Err(Error::Frame(format!("sealed frame too short: {} bytes", sealed.len())));
        }
        let plain = secret.cipher().open(sealed)?;
        Self::from_plaintext(plain)
    }

    /// Sealed and length-prefixed, ready to be written to the relay stream
    pub fn to_wire(&self, secret: &PeerSecret, max_frame_len: usize) -> Result<Bytes> {
        let sealed = self.seal(secret)?;
        let mut codec = codec(max_frame_len);
        let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + sealed.len());
        codec
            .encode(Bytes::from(sealed), &mut out)
            .map_err(|e| Error::Frame(e.to_string()))?;
        Ok(out.freeze())
    }
}

/// Codec for the relay stream: u32 big-endian length prefix, frames larger
/// than `max_frame_len` rejected in both directions.
pub fn codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_PREFIX_LEN)
        .big_endian()
        .max_frame_length(max_frame_len)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KemAlgorithm;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn secret(fill: u8) -> PeerSecret {
        PeerSecret::new("10.118.0.9".parse().unwrap(), KemAlgorithm::MlKem512, vec![fill; 32]).unwrap()
    }

    fn dest() -> SocketAddrV4 {
        "203.0.113.5:443".parse().unwrap()
    }

    #[test]
    fn test_seal_open() {
        let s = secret(1);
        let frame = RelayFrame::new(dest(), &b"GET /"[..]);
        let sealed = frame.seal(&s).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + DESTINATION_LEN + 5 + TAG_LEN);
        assert!(!sealed.windows(5).any(|w| w == b"GET /"));

        let opened = RelayFrame::open(&sealed, &s).unwrap();
        assert_eq!(opened, frame);
    }

    #[test]
    fn test_empty_payload() {
        let s = secret(1);
        let frame = RelayFrame::new(dest(), Bytes::new());
        let opened = RelayFrame::open(&frame.seal(&s).unwrap(), &s).unwrap();
        assert!(opened.payload.is_empty());
        assert_eq!(opened.destination, dest());
    }

    #[test]
    fn test_wrong_secret_fails() {
        let sealed = RelayFrame::new(dest(), &b"data"[..]).seal(&secret(1)).unwrap();
        assert!(matches!(RelayFrame::open(&sealed, &secret(2)), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_tampered_destination_fails() {
        let s = secret(1);
        let mut sealed = RelayFrame::new(dest(), &b"data"[..]).seal(&s).unwrap();
        sealed[NONCE_LEN] ^= 0x01;
        assert!(RelayFrame::open(&sealed, &s).is_err());
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(matches!(
            RelayFrame::open(&[0u8; 20], &secret(1)),
            Err(Error::Frame(_))
        ));
    }

    #[test]
    fn test_plaintext_without_destination() {
        assert!(matches!(
            RelayFrame::from_plaintext(vec![1, 2, 3]),
            Err(Error::Frame(_))
        ));
        assert!(RelayFrame::from_plaintext(vec![10, 0, 0, 1, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_wire_stream_decodes() {
        let s = secret(3);
        let frames = [
            RelayFrame::new(dest(), &b"first"[..]),
            RelayFrame::new("10.118.0.20:8080".parse().unwrap(), &b"second"[..]),
        ];
        let mut wire = Vec::new();
        for frame in &frames {
            let bytes = frame.to_wire(&s, 65536).unwrap();
            assert_eq!(bytes.len(), FRAME_OVERHEAD + frame.payload.len());
            wire.extend_from_slice(&bytes);
        }

        let mut reader = FramedRead::new(&wire[..], codec(65536));
        for expected in &frames {
            let sealed = reader.next().await.unwrap().unwrap();
            assert_eq!(&RelayFrame::open(&sealed, &s).unwrap(), expected);
        }
        assert!(reader.next().await.is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = RelayFrame::new(dest(), vec![0u8; 200]);
        assert!(frame.to_wire(&secret(1), 64).is_err());
    }
}
