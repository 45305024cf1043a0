//! 수신 클라이언트
//!
//! 서버 루프를 거울처럼 뒤집은 단일 협력 루프.
//! 1. 알림을 기다려 전송을 발견 (또는 지정된 식별자 사용)
//! 2. 메타데이터 헤더/섹션을 재시도하며 수집, 블롭 무결성 확인
//! 3. 가상 타르볼 쓰기 + 리전 추적기로 데이터 수신
//!    - request_interval마다 NAK 목록을 실어 데이터 요청 (500ms 창 유지)
//!    - 모든 리전 수신 확인이면 종료, 파일 해시 검증
//!
//! 업링크 트래픽은 수신자 수와 무관하게 요청/NAK뿐이다.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use rayon::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::file::{hash_file, FileEntry};
use crate::message::{
    self, ControlMessage, DataMessage, Opcode, TransferId, SECTION_INDEX_LEN,
};
use crate::region::{RegionStatus, RegionTracker};
use crate::stats::TransferStats;
use crate::transport::{Frame, Multicast};
use crate::writer::VirtualTarballWriter;
use crate::{Error, Result};

/// 수신 클라이언트
pub struct Client {
    config: Config,
    transport: Multicast,

    /// 재구성 대상 루트 디렉터리
    root: PathBuf,

    /// 수신할 전송 식별자 (None이면 처음 발견한 전송)
    target: Option<TransferId>,

    running: Arc<AtomicBool>,
    stats: Arc<RwLock<TransferStats>>,
}

/// 외부 제어용 핸들 (정지 + 통계)
#[derive(Clone)]
pub struct ClientHandle {
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<TransferStats>>,
}

impl ClientHandle {
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

/// 메타데이터 수집 상태
struct MetadataAssembly {
    transfer_id: TransferId,
    sections: Vec<Option<Bytes>>,
}

impl MetadataAssembly {
    fn missing_sections(&self) -> Vec<u16> {
        self.sections
            .iter()
            .enumerate()
            .filter(|(_, section)| section.is_none())
            .map(|(index, _)| index as u16)
            .collect()
    }

    fn is_complete(&self) -> bool {
        !self.sections.is_empty() && self.sections.iter().all(|section| section.is_some())
    }

    fn reassemble(&self) -> Bytes {
        let mut blob = BytesMut::new();
        for section in self.sections.iter().flatten() {
            blob.put_slice(section);
        }
        blob.freeze()
    }
}

impl Client {
    pub fn new(
        config: Config,
        transport: Multicast,
        root: impl Into<PathBuf>,
        target: Option<TransferId>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            root: root.into(),
            target,
            running: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(RwLock::new(TransferStats::new())),
        })
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            running: self.running.clone(),
            stats: self.stats.clone(),
        }
    }

    /// 전송 하나를 끝까지 수신. 종료 시 전송을 닫는다.
    ///
    /// 루프 에러가 우선 반환되고, 전송 닫기 에러는 루프가 깨끗이 끝났을 때만
    /// 표면화된다.
    pub async fn run(mut self) -> Result<TransferStats> {
        let result = self.run_loop().await;
        self.running.store(false, Ordering::SeqCst);

        let close_result = self.transport.close();
        match result {
            Err(err) => Err(err),
            Ok(stats) => close_result.map(|_| stats),
        }
    }

    async fn run_loop(&mut self) -> Result<TransferStats> {
        let mut control_in = match self.transport.take_control_in() {
            Some(receiver) => receiver,
            None => return Err(Error::ChannelClosed),
        };
        let mut data_in = match self.transport.take_data_in() {
            Some(receiver) => receiver,
            None => return Err(Error::ChannelClosed),
        };

        // 1단계: 전송 발견 + 메타데이터 수집
        let (transfer_id, blob) = self.fetch_metadata(&mut control_in).await?;
        let (total_size, entries) = message::decode_metadata(&blob)?;

        info!(
            "MDP Client: transfer {} ({} files, {} bytes)",
            message::transfer_id_hex(&transfer_id),
            entries.len(),
            total_size,
        );

        // 2단계: 데이터 수신
        let entries_for_verify = entries.clone();
        let mut writer = VirtualTarballWriter::new(entries, &self.root)?;
        let mut tracker = RegionTracker::new(total_size, self.config.region_size())?;

        self.receive_data(&mut control_in, &mut data_in, transfer_id, &mut writer, &mut tracker)
            .await?;

        writer.close()?;
        self.verify_hashes(&entries_for_verify)?;

        Ok(self.stats.read().clone())
    }

    /// 알림 대기 → 헤더 요청 → 누락 섹션 요청 반복
    ///
    /// 재조립된 블롭의 BLAKE3이 전송 식별자와 일치해야 한다. 불일치하면
    /// (혼선/손상) 수집을 버리고 다시 모은다.
    async fn fetch_metadata(
        &mut self,
        control_in: &mut mpsc::Receiver<Result<Frame>>,
    ) -> Result<(TransferId, Bytes)> {
        let deadline =
            Instant::now() + std::time::Duration::from_millis(self.config.handshake_timeout_ms);
        let mut retry = tokio::time::interval(self.config.request_interval());
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut discovered: Option<TransferId> = self.target;
        let mut assembly: Option<MetadataAssembly> = None;

        while self.running.load(Ordering::SeqCst) {
            if Instant::now() > deadline {
                return Err(Error::Timeout {
                    phase: "metadata fetch",
                });
            }

            tokio::select! {
                frame = control_in.recv() => {
                    let msg = match frame {
                        None => return Err(Error::ChannelClosed),
                        Some(Err(err)) => return Err(err),
                        Some(Ok(frame)) => match ControlMessage::from_bytes(&frame) {
                            Some(msg) => msg,
                            None => continue,
                        },
                    };

                    match msg.opcode {
                        Opcode::AnnounceTarball => {
                            if discovered.is_none() {
                                info!(
                                    "전송 발견: {}",
                                    message::transfer_id_hex(&msg.transfer_id)
                                );
                                discovered = Some(msg.transfer_id);
                            }
                        }
                        Opcode::RespondMetadataHeader => {
                            if Some(msg.transfer_id) != discovered {
                                continue;
                            }
                            if assembly.is_none() && msg.payload.len() >= SECTION_INDEX_LEN {
                                let mut payload = msg.payload.as_ref();
                                let count = payload.get_u16_le() as usize;
                                debug!("메타데이터 섹션 {}개", count);
                                assembly = Some(MetadataAssembly {
                                    transfer_id: msg.transfer_id,
                                    sections: vec![None; count],
                                });
                            }
                        }
                        Opcode::RespondMetadataSection => {
                            let current = match &mut assembly {
                                Some(current) if current.transfer_id == msg.transfer_id => current,
                                _ => continue,
                            };
                            if msg.payload.len() < SECTION_INDEX_LEN {
                                continue;
                            }
                            let mut payload = msg.payload.as_ref();
                            let index = payload.get_u16_le() as usize;
                            if let Some(slot) = current.sections.get_mut(index) {
                                if slot.is_none() {
                                    *slot = Some(msg.payload.slice(SECTION_INDEX_LEN..));
                                }
                            }
                        }
                        _ => {}
                    }

                    // 전부 모였으면 무결성 확인 후 반환
                    if let Some(current) = &assembly {
                        if current.is_complete() {
                            let blob = current.reassemble();
                            if *blake3::hash(&blob).as_bytes() == current.transfer_id {
                                return Ok((current.transfer_id, blob));
                            }
                            // 손상된 수집은 버리고 다시
                            warn!("메타데이터 블롭 해시 불일치, 다시 수집");
                            assembly = None;
                        }
                    }
                }
                _ = retry.tick() => {
                    let id = match discovered {
                        Some(id) => id,
                        None => continue, // 아직 알림 대기 중
                    };
                    match &assembly {
                        None => {
                            self.stats.write().metadata_requests += 1;
                            let msg = ControlMessage::new(
                                id,
                                Opcode::RequestMetadataHeader,
                                Bytes::new(),
                            );
                            self.transport.send_control(msg.to_bytes()).await?;
                        }
                        Some(current) => {
                            // 누락 섹션만 다시 요청
                            for index in current.missing_sections().into_iter().take(32) {
                                self.stats.write().metadata_requests += 1;
                                let mut payload = BytesMut::with_capacity(SECTION_INDEX_LEN);
                                payload.put_u16_le(index);
                                let msg = ControlMessage::new(
                                    id,
                                    Opcode::RequestMetadataSection,
                                    payload.freeze(),
                                );
                                self.transport.send_control(msg.to_bytes()).await?;
                            }
                        }
                    }
                }
            }
        }

        Err(Error::Timeout {
            phase: "metadata fetch",
        })
    }

    async fn receive_data(
        &mut self,
        control_in: &mut mpsc::Receiver<Result<Frame>>,
        data_in: &mut mpsc::Receiver<Result<Frame>>,
        transfer_id: TransferId,
        writer: &mut VirtualTarballWriter,
        tracker: &mut RegionTracker,
    ) -> Result<()> {
        let mut request_ticker = tokio::time::interval(self.config.request_interval());
        request_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let idle_timeout = std::time::Duration::from_millis(self.config.idle_timeout_ms);
        let mut last_progress = Instant::now();

        while self.running.load(Ordering::SeqCst) && !tracker.is_complete() {
            tokio::select! {
                frame = data_in.recv() => {
                    let frame = match frame {
                        None => return Err(Error::ChannelClosed),
                        Some(Err(err)) => return Err(err),
                        Some(Ok(frame)) => frame,
                    };
                    let msg = match DataMessage::from_bytes(&frame) {
                        Some(msg) => msg,
                        None => continue,
                    };
                    if msg.transfer_id != transfer_id || msg.payload.is_empty() {
                        continue;
                    }
                    // 리전 경계에 정렬된 오프셋만 유효
                    let index = match tracker.index_of(msg.offset) {
                        Some(index) => index,
                        None => continue,
                    };

                    if tracker.status(index) == Some(RegionStatus::Acknowledged) {
                        self.stats.write().duplicate_regions += 1;
                        continue;
                    }

                    writer.write_at(&msg.payload, msg.offset)?;
                    tracker.mark_acknowledged(index);
                    last_progress = Instant::now();

                    let mut stats = self.stats.write();
                    stats.regions_received += 1;
                    stats.bytes_received += msg.payload.len() as u64;
                }
                frame = control_in.recv() => {
                    // 데이터 단계에서 컨트롤 채널은 알림 소음뿐, 에러만 감시
                    match frame {
                        None => return Err(Error::ChannelClosed),
                        Some(Err(err)) => return Err(err),
                        Some(Ok(_)) => {}
                    }
                }
                _ = request_ticker.tick() => {
                    if last_progress.elapsed() > idle_timeout {
                        return Err(Error::Timeout { phase: "data receive" });
                    }
                    // 수신 확인 안 된 리전을 NAK 목록으로 실어 요청 창을 유지
                    let naks = tracker.missing_indices(self.config.max_nak_indices());
                    let msg = ControlMessage::new(
                        transfer_id,
                        Opcode::RequestDataSections,
                        message::encode_nak_list(&naks),
                    );
                    self.transport.send_control(msg.to_bytes()).await?;

                    let mut stats = self.stats.write();
                    stats.data_requests += 1;
                    stats.regions_nakked += naks.len() as u64;
                }
            }
        }

        if !tracker.is_complete() {
            return Err(Error::Timeout { phase: "stopped" });
        }
        Ok(())
    }

    /// 재구성된 파일들의 내용 해시 검증 (병렬)
    fn verify_hashes(&self, entries: &[FileEntry]) -> Result<()> {
        entries
            .par_iter()
            .filter(|entry| !entry.is_symlink())
            .try_for_each(|entry| {
                let actual = hash_file(&self.root.join(&entry.path))?;
                if actual != entry.hash {
                    warn!("해시 불일치: {}", entry.path);
                    return Err(Error::HashMismatch {
                        path: entry.path.clone(),
                    });
                }
                Ok(())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    use crate::file::scan_dir;
    use crate::reader::VirtualTarballReader;
    use crate::server::Server;

    fn test_config() -> Config {
        Config {
            datagram_capacity: 256,
            announce_interval_ms: 50,
            request_window_ms: 400,
            request_interval_ms: 60,
            poll_interval_us: 200,
            stream_burst: 8,
            channel_capacity: 512,
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 10_000,
        }
    }

    fn build_source_tree(root: &std::path::Path) {
        fs::create_dir_all(root.join("docs/deep")).expect("mkdir");
        fs::write(root.join("hello.txt"), b"Hello, multicast world!\n").expect("write");
        fs::write(root.join("empty.bin"), b"").expect("write");
        fs::write(
            root.join("docs/deep/data.bin"),
            (0u32..2048).flat_map(|i| i.to_le_bytes()).collect::<Vec<u8>>(),
        )
        .expect("write");
        fs::set_permissions(
            root.join("docs/deep/data.bin"),
            fs::Permissions::from_mode(0o640),
        )
        .expect("chmod");
        std::os::unix::fs::symlink("hello.txt", root.join("hello.link")).expect("symlink");
    }

    #[tokio::test]
    async fn test_end_to_end_loopback_transfer() {
        let src = tempfile::tempdir().expect("tempdir");
        let dst = tempfile::tempdir().expect("tempdir");
        build_source_tree(src.path());

        let (server_side, client_side) = Multicast::loopback(256, 512);

        let entries = scan_dir(src.path()).expect("scan");
        let tarball = VirtualTarballReader::new(entries, src.path()).expect("reader");

        let server = Server::new(test_config(), server_side, tarball).expect("server");
        let server_handle = server.handle();
        let server_task = tokio::spawn(server.run());

        let client = Client::new(test_config(), client_side, dst.path(), None).expect("client");
        let stats = tokio::time::timeout(Duration::from_secs(30), client.run())
            .await
            .expect("transfer timed out")
            .expect("client run");

        assert!(stats.regions_received > 0);
        assert!(stats.bytes_received > 8192);

        // 내용 복원 확인
        assert_eq!(
            fs::read(dst.path().join("hello.txt")).expect("read"),
            b"Hello, multicast world!\n"
        );
        assert_eq!(fs::read(dst.path().join("empty.bin")).expect("read"), b"");
        assert_eq!(
            fs::read(dst.path().join("docs/deep/data.bin")).expect("read"),
            fs::read(src.path().join("docs/deep/data.bin")).expect("read"),
        );

        // 퍼미션 복원 확인
        let mode = fs::metadata(dst.path().join("docs/deep/data.bin"))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o640);

        // 링크 대상은 와이어에 실리지 않으므로 수신측에 링크는 생기지 않는다
        assert!(fs::symlink_metadata(dst.path().join("hello.link")).is_err());

        server_handle.stop();
        let _ = server_task.await.expect("join");
    }

    #[tokio::test]
    async fn test_client_times_out_without_server() {
        let dst = tempfile::tempdir().expect("tempdir");
        let (_server_side, client_side) = Multicast::loopback(256, 64);

        let config = Config {
            handshake_timeout_ms: 300,
            ..test_config()
        };
        let client = Client::new(config, client_side, dst.path(), None).expect("client");

        let result = tokio::time::timeout(Duration::from_secs(5), client.run())
            .await
            .expect("should finish");
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_client_stop_handle() {
        let dst = tempfile::tempdir().expect("tempdir");
        let (_server_side, client_side) = Multicast::loopback(256, 64);

        let client = Client::new(test_config(), client_side, dst.path(), None).expect("client");
        let handle = client.handle();
        let task = tokio::spawn(client.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("should finish")
            .expect("join");
        // 발견 전에 멈췄으므로 타임아웃 계열 에러
        assert!(result.is_err());
    }
}
