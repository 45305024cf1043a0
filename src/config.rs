//! 프로토콜 설정

use std::time::Duration;

use crate::message::{CONTROL_OVERHEAD, DATA_MESSAGE_OVERHEAD, NAK_INDEX_LEN, SECTION_INDEX_LEN};
use crate::{Error, Result, DEFAULT_DATAGRAM_CAPACITY};

/// MDP 프로토콜 설정
///
/// 와이어 포맷 상수(바이트 순서, 오버헤드 크기)는 `message` 모듈의 고정 상수이고,
/// 여기에는 조정 가능한 값만 둔다. 생성자에 명시적으로 전달된다.
#[derive(Debug, Clone)]
pub struct Config {
    /// 데이터그램 용량 (바이트, 헤더 포함 최대 페이로드)
    pub datagram_capacity: usize,

    /// 서버 알림 주기 (밀리초)
    pub announce_interval_ms: u64,

    /// 데이터 요청 유효 시간 (밀리초)
    /// 마지막 요청이 이 시간보다 오래되면 스트리밍 중단
    pub request_window_ms: u64,

    /// 클라이언트 데이터 요청 주기 (밀리초)
    /// request_window_ms보다 짧아야 스트림이 유지됨
    pub request_interval_ms: u64,

    /// 유휴 폴링 간격 (마이크로초)
    /// 스트리밍 비활성 시 루프가 코어를 점유하지 않도록 제한
    pub poll_interval_us: u64,

    /// 폴링 슬롯당 전송하는 최대 리전 수
    pub stream_burst: usize,

    /// 전송 채널 용량 (메시지 수)
    pub channel_capacity: usize,

    /// 메타데이터 수신 타임아웃 (밀리초)
    pub handshake_timeout_ms: u64,

    /// 데이터 수신 유휴 타임아웃 (밀리초)
    pub idle_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datagram_capacity: DEFAULT_DATAGRAM_CAPACITY,
            announce_interval_ms: 1000,
            request_window_ms: 500,
            request_interval_ms: 300,
            poll_interval_us: 500,
            stream_burst: 16,
            channel_capacity: 1024,
            handshake_timeout_ms: 15_000,
            idle_timeout_ms: 30_000,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 로컬 네트워크용 설정 (점보 프레임, 공격적 버스트)
    pub fn local_network() -> Self {
        Self {
            datagram_capacity: 8952,
            stream_burst: 64,
            poll_interval_us: 200,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정 (작은 데이터그램, 짧은 요청 주기)
    pub fn lossy_network() -> Self {
        Self {
            datagram_capacity: 1200,
            stream_burst: 8,
            request_interval_ms: 150,
            idle_timeout_ms: 60_000,
            ..Self::default()
        }
    }

    /// 설정 유효성 검사
    pub fn validate(&self) -> Result<()> {
        if self.datagram_capacity <= DATA_MESSAGE_OVERHEAD
            || self.datagram_capacity <= CONTROL_OVERHEAD + SECTION_INDEX_LEN
        {
            return Err(Error::InvalidConfig(format!(
                "datagram_capacity {} 가 프로토콜 오버헤드보다 작음",
                self.datagram_capacity
            )));
        }
        if self.request_interval_ms >= self.request_window_ms {
            return Err(Error::InvalidConfig(format!(
                "request_interval_ms {} >= request_window_ms {}",
                self.request_interval_ms, self.request_window_ms
            )));
        }
        if self.stream_burst == 0 {
            return Err(Error::InvalidConfig("stream_burst == 0".into()));
        }
        Ok(())
    }

    /// 리전 크기 계산 (데이터 메시지 하나에 담기는 페이로드)
    pub fn region_size(&self) -> usize {
        self.datagram_capacity - DATA_MESSAGE_OVERHEAD
    }

    /// 메타데이터 섹션 하나의 페이로드 크기
    pub fn section_payload_len(&self) -> usize {
        self.datagram_capacity - CONTROL_OVERHEAD - SECTION_INDEX_LEN
    }

    /// 데이터 요청 하나에 담기는 최대 NAK 인덱스 수
    pub fn max_nak_indices(&self) -> usize {
        (self.datagram_capacity - CONTROL_OVERHEAD) / NAK_INDEX_LEN
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn request_window(&self) -> Duration {
        Duration::from_millis(self.request_window_ms)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_sizes() {
        let config = Config::default();
        assert_eq!(config.region_size(), config.datagram_capacity - 40);
        assert_eq!(
            config.section_payload_len(),
            config.datagram_capacity - 33 - 2
        );
        assert!(config.max_nak_indices() > 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tiny_datagram() {
        let config = Config {
            datagram_capacity: 32,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_slow_request_interval() {
        let config = Config {
            request_interval_ms: 700,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
