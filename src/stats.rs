//! 전송 통계

use std::time::{Duration, Instant};

/// 전송 통계 (송신/수신 공용, 역할에 따라 일부 필드만 사용)
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 보낸 알림 수
    pub announcements: u64,

    /// 처리한 메타데이터 요청 수 (헤더 + 섹션)
    pub metadata_requests: u64,

    /// 받은/보낸 데이터 요청 수
    pub data_requests: u64,

    /// NAK로 누락 표시된 리전 수 (누적)
    pub regions_nakked: u64,

    /// 전송한 리전 수
    pub regions_sent: u64,

    /// 전송한 바이트 (페이로드 기준)
    pub bytes_sent: u64,

    /// 수신한 리전 수 (새 리전만)
    pub regions_received: u64,

    /// 수신한 바이트 (페이로드 기준)
    pub bytes_received: u64,

    /// 중복 수신 리전 수
    pub duplicate_regions: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            announcements: 0,
            metadata_requests: 0,
            data_requests: 0,
            regions_nakked: 0,
            regions_sent: 0,
            bytes_sent: 0,
            regions_received: 0,
            bytes_received: 0,
            duplicate_regions: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 송신 처리율 (bytes/sec)
    pub fn send_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / elapsed
    }

    /// 수신 처리율 (bytes/sec)
    pub fn receive_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_received as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} regions / {} bytes | Recv: {} regions / {} bytes (dup {}) | Requests: {} | NAKs: {}",
            self.elapsed().as_secs_f64(),
            self.regions_sent,
            self.bytes_sent,
            self.regions_received,
            self.bytes_received,
            self.duplicate_regions,
            self.data_requests,
            self.regions_nakked,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
