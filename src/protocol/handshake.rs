//! RTMP server handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//! ```
//!
//! This is the simple handshake without the HMAC digest scheme; encoders in
//! the wild (OBS, ffmpeg) accept it. Version checking is lenient: anything
//! from 3 up is tolerated, below 3 is refused.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::{HANDSHAKE_SIZE, RTMP_VERSION};
use crate::error::{Error, ProtocolError};

/// Run the server side of the handshake to completion.
pub async fn server_handshake<S>(stream: &mut S) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // C0
    let version = stream.read_u8().await?;
    if version < RTMP_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version).into());
    }

    // C1
    let mut c1 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c1).await?;

    // S0 + S1 + S2
    let s1 = generate_packet();
    let s2 = generate_echo(&c1);
    stream.write_u8(RTMP_VERSION).await?;
    stream.write_all(&s1).await?;
    stream.write_all(&s2).await?;
    stream.flush().await?;

    // C2: consume without strict verification; several encoders do not echo
    // S1 faithfully
    let mut c2 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c2).await?;

    Ok(())
}

/// Build an S1 packet: timestamp, zero field, random fill.
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);
    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());
    // Bytes 4..8 stay zero: simple handshake marker

    rand::thread_rng().fill_bytes(&mut packet[8..]);
    packet
}

/// Build S2: echo the peer's packet with our receive timestamp in bytes 4..8.
fn generate_echo(peer_packet: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer_packet;
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);
    echo[4..8].copy_from_slice(&timestamp.to_be_bytes());
    echo
}
