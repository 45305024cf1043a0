//! 배포 엔진 (송신자)
//!
//! 가상 타르볼 읽기와 리전 추적기를 소유하는 단일 협력 루프.
//! - 1초마다 전송 알림 방송
//! - 컨트롤 요청(메타데이터 헤더/섹션, 데이터 요청) 응답
//! - 최근 500ms 안에 데이터 요청이 있을 때만 리전 스트리밍
//!
//! 다른 전송의 메시지(식별자 불일치)와 손상된 데이터그램은 조용히 무시한다.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes};
use parking_lot::RwLock;
#[cfg(test)]
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Config;
use crate::message::{
    self, ControlMessage, DataMessage, Opcode, TransferId, SECTION_INDEX_LEN,
};
use crate::reader::VirtualTarballReader;
use crate::region::RegionTracker;
use crate::stats::TransferStats;
use crate::transport::{Frame, Multicast};
use crate::{Error, Result};

/// 배포 엔진
pub struct Server {
    config: Config,
    transport: Multicast,
    tarball: VirtualTarballReader,
    tracker: RegionTracker,

    transfer_id: TransferId,

    /// 데이터그램 크기로 자른 메타데이터 섹션들
    sections: Vec<Bytes>,

    /// 스트리밍 커서 (다음 탐색 시작 리전)
    cursor: u32,

    /// 마지막 데이터 요청 시각
    last_request: Option<Instant>,

    running: Arc<AtomicBool>,
    stats: Arc<RwLock<TransferStats>>,
}

/// 외부 제어용 핸들 (정지 + 통계)
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<TransferStats>>,
}

impl ServerHandle {
    /// 루프를 다음 반복에서 정지시킴
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TransferStats {
        self.stats.read().clone()
    }
}

impl Server {
    /// 새 배포 엔진 생성
    ///
    /// 메타데이터 블롭과 섹션, 리전 추적기를 여기서 미리 구성한다.
    pub fn new(config: Config, transport: Multicast, tarball: VirtualTarballReader) -> Result<Self> {
        config.validate()?;

        let tracker = RegionTracker::new(tarball.total_size(), config.region_size())?;
        let transfer_id = tarball.transfer_id();

        let blob = message::encode_metadata(tarball.total_size(), tarball.entries());
        let sections = message::split_sections(&blob, config.section_payload_len());
        if sections.len() > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "메타데이터 섹션 수 {} 가 u16 범위를 넘음",
                sections.len()
            )));
        }

        Ok(Self {
            config,
            transport,
            tarball,
            tracker,
            transfer_id,
            sections,
            cursor: 0,
            last_request: None,
            running: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(RwLock::new(TransferStats::new())),
        })
    }

    /// 전송 식별자
    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// 메타데이터 섹션 수
    pub fn section_count(&self) -> u16 {
        self.sections.len() as u16
    }

    /// 제어 핸들
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: self.running.clone(),
            stats: self.stats.clone(),
        }
    }

    /// 메인 루프 실행. 전송 실패나 `stop()`까지 돌고, 종료 시 전송을 닫는다.
    ///
    /// 루프 에러가 우선 반환되고, 전송 닫기 에러는 루프가 깨끗이 끝났을 때만
    /// 표면화된다.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "MDP Server: transfer {} ({} files, {} bytes, {} regions)",
            message::transfer_id_hex(&self.transfer_id),
            self.tarball.entries().len(),
            self.tarball.total_size(),
            self.tracker.region_count(),
        );

        let result = self.run_loop().await;
        self.running.store(false, Ordering::SeqCst);

        let close_result = self.transport.close();
        match result {
            Err(err) => Err(err),
            Ok(()) => close_result,
        }
    }

    async fn run_loop(&mut self) -> Result<()> {
        let mut control_in = match self.transport.take_control_in() {
            Some(receiver) => receiver,
            None => return Err(Error::ChannelClosed),
        };

        let announce = ControlMessage::new(self.transfer_id, Opcode::AnnounceTarball, Bytes::new())
            .to_bytes();

        let mut announce_ticker = tokio::time::interval(self.config.announce_interval());
        announce_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                frame = control_in.recv() => {
                    match frame {
                        // 채널이 닫히면 전송이 끝난 것
                        None => return Ok(()),
                        // 전송 계층 에러는 치명적
                        Some(Err(err)) => return Err(err),
                        Some(Ok(frame)) => self.handle_control(&frame).await?,
                    }
                }
                _ = announce_ticker.tick() => {
                    self.transport.send_control(announce.clone()).await?;
                    self.stats.write().announcements += 1;
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {
                    // 유휴 슬롯: 요청 창이 열려 있으면 리전 스트리밍
                    self.pump_stream().await?;
                }
            }
        }

        Ok(())
    }

    async fn handle_control(&mut self, frame: &Frame) -> Result<()> {
        let msg = match ControlMessage::from_bytes(frame) {
            Some(msg) => msg,
            // 손상된 데이터그램은 무시
            None => return Ok(()),
        };
        if msg.transfer_id != self.transfer_id {
            // 같은 그룹의 다른 전송 메시지
            return Ok(());
        }

        match msg.opcode {
            Opcode::RequestMetadataHeader => {
                self.stats.write().metadata_requests += 1;
                self.respond_header().await?;
            }
            Opcode::RequestMetadataSection => {
                self.stats.write().metadata_requests += 1;
                self.respond_section(&msg.payload).await?;
            }
            Opcode::RequestDataSections => {
                let naks = message::decode_nak_list(&msg.payload);
                for index in &naks {
                    self.tracker.mark_missing(*index);
                }
                self.last_request = Some(Instant::now());

                let mut stats = self.stats.write();
                stats.data_requests += 1;
                stats.regions_nakked += naks.len() as u64;
            }
            // 서버가 처리할 일 없는 opcode (자기 방송 포함)
            Opcode::AnnounceTarball
            | Opcode::RespondMetadataHeader
            | Opcode::RespondMetadataSection => {}
        }

        Ok(())
    }

    async fn respond_header(&self) -> Result<()> {
        let mut payload = bytes::BytesMut::with_capacity(SECTION_INDEX_LEN);
        bytes::BufMut::put_u16_le(&mut payload, self.sections.len() as u16);

        let msg = ControlMessage::new(
            self.transfer_id,
            Opcode::RespondMetadataHeader,
            payload.freeze(),
        );
        self.transport.send_control(msg.to_bytes()).await
    }

    async fn respond_section(&self, request_payload: &[u8]) -> Result<()> {
        if request_payload.len() < SECTION_INDEX_LEN {
            return Ok(());
        }
        let mut buf = request_payload;
        let index = buf.get_u16_le();

        let section = match self.sections.get(index as usize) {
            Some(section) => section,
            // 범위 밖 인덱스는 무시
            None => return Ok(()),
        };

        let mut payload = bytes::BytesMut::with_capacity(SECTION_INDEX_LEN + section.len());
        bytes::BufMut::put_u16_le(&mut payload, index);
        bytes::BufMut::put_slice(&mut payload, section);

        let msg = ControlMessage::new(
            self.transfer_id,
            Opcode::RespondMetadataSection,
            payload.freeze(),
        );
        self.transport.send_control(msg.to_bytes()).await
    }

    /// 요청 창이 열려 있으면 리전을 버스트로 전송
    ///
    /// 요청이 한 번도 없었거나 500ms보다 오래됐으면 아무것도 보내지 않는다.
    /// 클라이언트가 계속 요청해야 스트림이 유지된다.
    async fn pump_stream(&mut self) -> Result<()> {
        let window_open = match self.last_request {
            Some(at) => at.elapsed() <= self.config.request_window(),
            None => false,
        };
        if !window_open {
            return Ok(());
        }

        let region_count = self.tracker.region_count();
        for _ in 0..self.config.stream_burst {
            let index = match self.tracker.next_region(self.cursor) {
                Some(index) => index,
                None => break,
            };

            let offset = self.tracker.region_offset(index);
            let mut buf = vec![0u8; self.tracker.region_length(index)];

            match self.tarball.read_at(&mut buf, offset) {
                Ok(n) => {
                    buf.truncate(n);
                    let msg = DataMessage::new(self.transfer_id, offset, Bytes::from(buf));
                    self.transport.send_data(msg.to_bytes()).await?;
                    self.tracker.mark_in_flight(index);

                    let mut stats = self.stats.write();
                    stats.regions_sent += 1;
                    stats.bytes_sent += n as u64;
                }
                // 끝 근처 탐침은 정상, 건너뛰고 계속
                Err(err) if err.is_out_of_range() => {
                    debug!("리전 {} 읽기가 범위를 벗어남, 건너뜀", index);
                }
                Err(err) => return Err(err),
            }

            self.cursor = (index + 1) % region_count.max(1);
        }

        Ok(())
    }
}

/// 컨트롤 수신 채널에서 다음으로 파싱되는 컨트롤 메시지를 기다림 (테스트 보조)
#[cfg(test)]
pub(crate) async fn next_control(
    receiver: &mut mpsc::Receiver<Result<Frame>>,
) -> Option<ControlMessage> {
    while let Some(item) = receiver.recv().await {
        if let Ok(frame) = item {
            if let Some(msg) = ControlMessage::from_bytes(&frame) {
                return Some(msg);
            }
        }
    }
    None
}
