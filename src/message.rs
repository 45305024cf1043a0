//! 프로토콜 메시지와 와이어 인코딩
//!
//! 모든 정수는 고정폭 리틀엔디언. 파서는 손상된 데이터그램을 조용히 버릴 수
//! 있도록 `Option`을 돌려준다 (수신 루프는 None을 무시하고 계속).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::file::FileEntry;
use crate::{Error, Result};

/// 전송 식별자 길이 (BLAKE3)
pub const TRANSFER_ID_LEN: usize = 32;

/// 컨트롤 메시지 접두 오버헤드 (식별자 + opcode)
pub const CONTROL_OVERHEAD: usize = TRANSFER_ID_LEN + 1;

/// 데이터 메시지 오버헤드 (식별자 + 가상 오프셋)
pub const DATA_MESSAGE_OVERHEAD: usize = TRANSFER_ID_LEN + 8;

/// 메타데이터 섹션 인덱스 크기
pub const SECTION_INDEX_LEN: usize = 2;

/// NAK 리전 인덱스 하나의 크기
pub const NAK_INDEX_LEN: usize = 4;

/// 파일 내용 해시 길이
pub const FILE_HASH_LEN: usize = 32;

/// 전송 식별자 (매니페스트에서 결정적으로 유도)
pub type TransferId = [u8; TRANSFER_ID_LEN];

/// 컨트롤 opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// 전송 존재 알림 (서버 → 클라이언트, 페이로드 없음)
    AnnounceTarball = 1,

    /// 메타데이터 헤더 요청
    RequestMetadataHeader = 2,

    /// 메타데이터 헤더 응답 (섹션 수)
    RespondMetadataHeader = 3,

    /// 메타데이터 섹션 요청 (인덱스)
    RequestMetadataSection = 4,

    /// 메타데이터 섹션 응답 (인덱스 + 블롭 조각)
    RespondMetadataSection = 5,

    /// 데이터 스트리밍 요청 (NAK 리전 인덱스 목록)
    RequestDataSections = 6,
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            1 => Ok(Self::AnnounceTarball),
            2 => Ok(Self::RequestMetadataHeader),
            3 => Ok(Self::RespondMetadataHeader),
            4 => Ok(Self::RequestMetadataSection),
            5 => Ok(Self::RespondMetadataSection),
            6 => Ok(Self::RequestDataSections),
            _ => Err(()),
        }
    }
}

/// 컨트롤 엔벨로프: 식별자 + opcode + opcode별 페이로드
#[derive(Debug, Clone)]
pub struct ControlMessage {
    pub transfer_id: TransferId,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl ControlMessage {
    pub fn new(transfer_id: TransferId, opcode: Opcode, payload: Bytes) -> Self {
        Self {
            transfer_id,
            opcode,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_OVERHEAD + self.payload.len());
        buf.put_slice(&self.transfer_id);
        buf.put_u8(self.opcode as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < CONTROL_OVERHEAD {
            return None;
        }
        let mut transfer_id = [0u8; TRANSFER_ID_LEN];
        transfer_id.copy_from_slice(&bytes[..TRANSFER_ID_LEN]);
        let opcode = Opcode::try_from(bytes[TRANSFER_ID_LEN]).ok()?;
        let payload = Bytes::copy_from_slice(&bytes[CONTROL_OVERHEAD..]);
        Some(Self {
            transfer_id,
            opcode,
            payload,
        })
    }
}

/// 데이터 메시지: 식별자 + 가상 리전 오프셋 + 페이로드
#[derive(Debug, Clone)]
pub struct DataMessage {
    pub transfer_id: TransferId,
    pub offset: u64,
    pub payload: Bytes,
}

impl DataMessage {
    pub fn new(transfer_id: TransferId, offset: u64, payload: Bytes) -> Self {
        Self {
            transfer_id,
            offset,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DATA_MESSAGE_OVERHEAD + self.payload.len());
        buf.put_slice(&self.transfer_id);
        buf.put_u64_le(self.offset);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DATA_MESSAGE_OVERHEAD {
            return None;
        }
        let mut transfer_id = [0u8; TRANSFER_ID_LEN];
        transfer_id.copy_from_slice(&bytes[..TRANSFER_ID_LEN]);
        let mut rest = &bytes[TRANSFER_ID_LEN..];
        let offset = rest.get_u64_le();
        let payload = Bytes::copy_from_slice(rest);
        Some(Self {
            transfer_id,
            offset,
            payload,
        })
    }
}

/// 메타데이터 블롭 인코딩
///
/// u64 전체 크기, u32 파일 수, 파일마다 (u16 경로 길이 + 경로 + u64 크기 +
/// u32 mode + 32바이트 해시). 정렬된 엔트리에서 만들어지므로 결정적이다.
pub fn encode_metadata(total_size: u64, entries: &[FileEntry]) -> Bytes {
    let per_file: usize = entries
        .iter()
        .map(|entry| 2 + entry.path.len() + 8 + 4 + FILE_HASH_LEN)
        .sum();
    let mut buf = BytesMut::with_capacity(12 + per_file);

    buf.put_u64_le(total_size);
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        buf.put_u16_le(entry.path.len() as u16);
        buf.put_slice(entry.path.as_bytes());
        buf.put_u64_le(entry.size);
        buf.put_u32_le(entry.mode);
        buf.put_slice(&entry.hash);
    }
    buf.freeze()
}

/// 메타데이터 블롭 디코딩
///
/// 수신측에서 사용. 잘린 블롭은 `TruncatedMetadata`.
pub fn decode_metadata(bytes: &[u8]) -> Result<(u64, Vec<FileEntry>)> {
    let mut buf = bytes;
    if buf.remaining() < 12 {
        return Err(Error::TruncatedMetadata);
    }
    let total_size = buf.get_u64_le();
    let count = buf.get_u32_le() as usize;

    let mut entries = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        if buf.remaining() < 2 {
            return Err(Error::TruncatedMetadata);
        }
        let path_len = buf.get_u16_le() as usize;
        if buf.remaining() < path_len + 8 + 4 + FILE_HASH_LEN {
            return Err(Error::TruncatedMetadata);
        }
        let path = String::from_utf8(buf[..path_len].to_vec()).map_err(|_| {
            Error::InvalidPath {
                path: String::from_utf8_lossy(&buf[..path_len]).into_owned(),
            }
        })?;
        buf.advance(path_len);
        let size = buf.get_u64_le();
        let mode = buf.get_u32_le();
        let mut hash = [0u8; FILE_HASH_LEN];
        hash.copy_from_slice(&buf[..FILE_HASH_LEN]);
        buf.advance(FILE_HASH_LEN);
        entries.push(FileEntry::from_wire(path, size, mode, hash));
    }

    Ok((total_size, entries))
}

/// 블롭을 데이터그램 크기 섹션으로 분할 (제로카피 슬라이스)
pub fn split_sections(blob: &Bytes, section_payload_len: usize) -> Vec<Bytes> {
    let mut sections = Vec::with_capacity(blob.len() / section_payload_len.max(1) + 1);
    let mut offset = 0usize;
    while offset < blob.len() {
        let end = (offset + section_payload_len).min(blob.len());
        sections.push(blob.slice(offset..end));
        offset = end;
    }
    sections
}

/// NAK 리전 인덱스 목록 인코딩
pub fn encode_nak_list(indices: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(indices.len() * NAK_INDEX_LEN);
    for &index in indices {
        buf.put_u32_le(index);
    }
    buf.freeze()
}

/// NAK 리전 인덱스 목록 디코딩 (꼬리의 불완전한 인덱스는 버림)
pub fn decode_nak_list(payload: &[u8]) -> Vec<u32> {
    payload
        .chunks_exact(NAK_INDEX_LEN)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// 전송 식별자의 소문자 16진수 표기
pub fn transfer_id_hex(id: &TransferId) -> String {
    let mut out = String::with_capacity(TRANSFER_ID_LEN * 2);
    for byte in id {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// 16진수 문자열에서 전송 식별자 파싱
pub fn parse_transfer_id(text: &str) -> Option<TransferId> {
    if text.len() != TRANSFER_ID_LEN * 2 || !text.is_ascii() {
        return None;
    }
    let mut id = [0u8; TRANSFER_ID_LEN];
    for (i, byte) in id.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id() -> TransferId {
        let mut id = [0u8; TRANSFER_ID_LEN];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = i as u8;
        }
        id
    }

    #[test]
    fn test_control_roundtrip() {
        let msg = ControlMessage::new(
            sample_id(),
            Opcode::RequestMetadataSection,
            Bytes::from_static(&[7, 0]),
        );
        let restored = ControlMessage::from_bytes(&msg.to_bytes()).expect("parse");

        assert_eq!(restored.transfer_id, msg.transfer_id);
        assert_eq!(restored.opcode, Opcode::RequestMetadataSection);
        assert_eq!(restored.payload.as_ref(), &[7, 0]);
    }

    #[test]
    fn test_control_rejects_garbage() {
        assert!(ControlMessage::from_bytes(&[0u8; 10]).is_none());

        let mut frame = ControlMessage::new(sample_id(), Opcode::AnnounceTarball, Bytes::new())
            .to_bytes()
            .to_vec();
        frame[TRANSFER_ID_LEN] = 0xEE; // 모르는 opcode
        assert!(ControlMessage::from_bytes(&frame).is_none());
    }

    #[test]
    fn test_data_roundtrip() {
        let msg = DataMessage::new(sample_id(), 0x0102_0304, Bytes::from_static(b"payload"));
        let restored = DataMessage::from_bytes(&msg.to_bytes()).expect("parse");

        assert_eq!(restored.transfer_id, msg.transfer_id);
        assert_eq!(restored.offset, 0x0102_0304);
        assert_eq!(restored.payload.as_ref(), b"payload");
    }

    #[test]
    fn test_metadata_roundtrip() {
        let entries = vec![
            FileEntry::regular("dir/a.bin", 42, 0o640, *blake3::hash(b"a").as_bytes()),
            FileEntry::symlink("link", "dir/a.bin"),
        ];
        let blob = encode_metadata(100, &entries);
        let (total, restored) = decode_metadata(&blob).expect("decode");

        assert_eq!(total, 100);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].path, "dir/a.bin");
        assert_eq!(restored[0].size, 42);
        assert_eq!(restored[0].mode, 0o640);
        assert_eq!(restored[0].hash, *blake3::hash(b"a").as_bytes());
        assert!(restored[1].is_symlink());
        // 링크 대상은 와이어에 없음
        assert_eq!(restored[1].symlink_destination, None);
    }

    #[test]
    fn test_metadata_truncated() {
        let entries = vec![FileEntry::regular("a", 1, 0o644, [0u8; 32])];
        let blob = encode_metadata(2, &entries);

        for cut in [0, 4, 13, blob.len() - 1] {
            let result = decode_metadata(&blob[..cut]);
            assert!(
                matches!(result, Err(Error::TruncatedMetadata)),
                "cut {} accepted",
                cut
            );
        }
    }

    #[test]
    fn test_sections_reassemble() {
        let entries: Vec<FileEntry> = (0..50)
            .map(|i| FileEntry::regular(format!("file-{:03}", i), i, 0o644, [i as u8; 32]))
            .collect();
        let blob = encode_metadata(12345, &entries);
        let sections = split_sections(&blob, 100);

        assert_eq!(sections.len(), (blob.len() + 99) / 100);
        let mut reassembled = Vec::new();
        for section in &sections {
            reassembled.extend_from_slice(section);
        }
        assert_eq!(reassembled, blob.as_ref());
    }

    #[test]
    fn test_nak_list_roundtrip() {
        let indices = vec![0u32, 7, 1_000_000];
        let encoded = encode_nak_list(&indices);
        assert_eq!(decode_nak_list(&encoded), indices);

        // 꼬리의 불완전한 인덱스는 버려짐
        let mut bad = encoded.to_vec();
        bad.extend_from_slice(&[1, 2]);
        assert_eq!(decode_nak_list(&bad), indices);
    }

    #[test]
    fn test_transfer_id_hex_roundtrip() {
        let id = sample_id();
        let hex = transfer_id_hex(&id);
        assert_eq!(hex.len(), 64);
        assert_eq!(parse_transfer_id(&hex), Some(id));
        assert_eq!(parse_transfer_id("zz"), None);
    }
}
