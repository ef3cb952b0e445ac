//! The framed packet codec (C1). Wire format: one type byte (§3 — low 6
//! bits code, high 2 bits flags), a 4-byte big-endian length, then that many
//! payload bytes. When `FLAG_SEQUENCED` is set the first 16 payload bytes
//! are `seq_num`/`ack_num` (big-endian u64 each); when `FLAG_COMPRESSED` is
//! set the remainder (everything after the optional seq/ack prefix) is
//! deflate-compressed. Grounded on the teacher's `neutronium::net::frame`
//! read/write pair, generalized from a fixed header to this packet's
//! variable framing.

use std::io;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tunnox_types::{CommandPacket, PacketCode, Payload, TransferPacket, WireError, FLAG_COMPRESSED, FLAG_SEQUENCED};

/// Matches the teacher's frame cap; well above anything this protocol's
/// command bodies or a single data chunk need.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TransferPacket, WireError> {
    let type_byte = reader.read_u8().await?;
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::PayloadTooLarge(len));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;

    let code = PacketCode::from_u8(type_byte)?;
    let compressed = type_byte & FLAG_COMPRESSED != 0;
    let sequenced = type_byte & FLAG_SEQUENCED != 0;

    let (seq_num, ack_num, rest) = if sequenced {
        if buf.len() < 16 {
            return Err(WireError::MissingSequenceNumbers);
        }
        let seq = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let ack = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        (Some(seq), Some(ack), buf.split_off(16))
    } else {
        (None, None, buf)
    };

    let body = if compressed { inflate(&rest)? } else { rest };

    let payload = match code {
        PacketCode::Command => Payload::Command(serde_json::from_slice::<CommandPacket>(&body)?),
        _ => Payload::Data(body),
    };

    Ok(TransferPacket {
        code,
        compressed,
        seq_num,
        ack_num,
        payload,
    })
}

pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &TransferPacket) -> Result<usize, WireError> {
    let body = match &packet.payload {
        Payload::Data(data) => data.clone(),
        Payload::Command(cmd) => serde_json::to_vec(cmd)?,
    };

    let body = if packet.compressed { deflate(&body)? } else { body };

    let mut framed = Vec::with_capacity(16 + body.len());
    if let (Some(seq), Some(ack)) = (packet.seq_num, packet.ack_num) {
        framed.extend_from_slice(&seq.to_be_bytes());
        framed.extend_from_slice(&ack.to_be_bytes());
    }
    framed.extend_from_slice(&body);

    if framed.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(WireError::PayloadTooLarge(framed.len() as u32));
    }

    writer.write_u8(packet.type_byte()).await?;
    writer.write_u32(framed.len() as u32).await?;
    writer.write_all(&framed).await?;
    writer.flush().await?;

    Ok(5 + framed.len())
}

fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn inflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnox_types::CommandPacket;

    #[tokio::test]
    async fn roundtrips_plain_data_packet() {
        let pkt = TransferPacket::data(b"hello tunnel".to_vec());
        let mut buf = Vec::new();
        write_packet(&mut buf, &pkt).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_packet(&mut cursor).await.unwrap();
        assert_eq!(decoded.as_data(), Some(&b"hello tunnel"[..]));
    }

    #[tokio::test]
    async fn roundtrips_sequenced_data_packet() {
        let pkt = TransferPacket::sequenced_data(b"chunk".to_vec(), 42, 41);
        let mut buf = Vec::new();
        write_packet(&mut buf, &pkt).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_packet(&mut cursor).await.unwrap();
        assert_eq!(decoded.seq_num, Some(42));
        assert_eq!(decoded.ack_num, Some(41));
        assert_eq!(decoded.as_data(), Some(&b"chunk"[..]));
    }

    #[tokio::test]
    async fn roundtrips_compressed_command_packet() {
        let cmd = CommandPacket::request(30, "req-1", "{\"foo\":\"bar\"}");
        let mut pkt = TransferPacket::command(cmd.clone());
        pkt.compressed = true;

        let mut buf = Vec::new();
        write_packet(&mut buf, &pkt).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_packet(&mut cursor).await.unwrap();
        assert_eq!(decoded.as_command(), Some(&cmd));
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let mut buf = Vec::new();
        buf.push(PacketCode::Data.as_u8());
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_packet(&mut cursor).await.unwrap_err();
        assert!(matches!(err, WireError::PayloadTooLarge(_)));
    }
}
