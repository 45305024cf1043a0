//! 에러 타입 정의

use thiserror::Error;

/// MDP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("유효하지 않은 경로: {path}")]
    InvalidPath { path: String },

    #[error("중복된 경로: {path}")]
    DuplicatePaths { path: String },

    #[error("빈 버퍼")]
    EmptyBuffer,

    #[error("범위 밖 오프셋: offset={offset}, total_size={total_size}")]
    OutOfRange { offset: u64, total_size: u64 },

    #[error("잘못된 패딩 바이트: offset={offset}, got {got:#04X}")]
    BadPaddingByte { offset: u64, got: u8 },

    #[error("메타데이터가 잘렸거나 손상됨")]
    TruncatedMetadata,

    #[error("해시 불일치: {path}")]
    HashMismatch { path: String },

    #[error("채널 종료")]
    ChannelClosed,

    #[error("타임아웃: {phase}")]
    Timeout { phase: &'static str },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// 스트리밍 중 무시해도 되는 에러인지 (가상 주소 공간 끝 근처 읽기)
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Error::OutOfRange { .. })
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
