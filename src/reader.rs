//! 가상 타르볼 읽기
//!
//! 쓰기와 동일한 정규 레이아웃을 실제 파일 읽기로 매핑하는 송신측 카운터파트.
//! 전체 매니페스트에서 유도한 결정적 전송 식별자를 노출한다.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::file::{layout, FileEntry};
use crate::message::{self, TransferId};
use crate::{Error, Result};

/// 가상 타르볼 읽기 핸들
pub struct VirtualTarballReader {
    entries: Vec<FileEntry>,
    total_size: u64,
    root: PathBuf,
    transfer_id: TransferId,

    // 현재 열려 있는 파일 (엔트리 인덱스 + 핸들), 한 번에 하나만
    open_slot: Option<(usize, File)>,
}

impl VirtualTarballReader {
    pub fn new(entries: Vec<FileEntry>, root: impl AsRef<Path>) -> Result<Self> {
        let (entries, total_size) = layout(entries)?;
        // 식별자는 정규 매니페스트 인코딩의 BLAKE3. 같은 내용이면 입력 순서와
        // 무관하게 같은 식별자가 나오고, 한 멀티캐스트 그룹에서 동시 전송을
        // 구분하는 키가 된다.
        let blob = message::encode_metadata(total_size, &entries);
        let transfer_id = *blake3::hash(&blob).as_bytes();

        Ok(Self {
            entries,
            total_size,
            root: root.as_ref().to_path_buf(),
            transfer_id,
            open_slot: None,
        })
    }

    /// 전체 가상 크기 (= Σ(size + 1))
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 정렬된 엔트리 목록 (메타데이터 블롭 구성에 사용)
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// 결정적 전송 식별자
    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// 가상 오프셋에서 버퍼 채우기, 채운 바이트 수 반환
    ///
    /// 종료 바이트 위치는 0x00으로 채워진다. 심볼릭 링크 구간도 마찬가지.
    /// 선언 크기보다 짧은 실제 파일은 0으로 채워 읽는다.
    /// `OutOfRange`는 끝 근처를 탐침하는 호출자에게 정상 상황이다.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        if offset >= self.total_size {
            return Err(Error::OutOfRange {
                offset,
                total_size: self.total_size,
            });
        }

        let start = self
            .entries
            .partition_point(|entry| entry.offset() + entry.span() <= offset);

        let mut offset = offset;
        let mut filled = 0usize;

        for idx in start..self.entries.len() {
            if filled == buf.len() {
                break;
            }

            let (entry_offset, entry_size, is_symlink) = {
                let entry = &self.entries[idx];
                (entry.offset(), entry.size, entry.is_symlink())
            };

            let mut local = offset - entry_offset;

            if local < entry_size {
                let want = (entry_size - local).min((buf.len() - filled) as u64) as usize;
                let dst = &mut buf[filled..filled + want];
                if is_symlink {
                    dst.fill(0);
                } else {
                    self.ensure_open(idx)?;
                    if let Some((_, file)) = &self.open_slot {
                        let mut done = 0usize;
                        while done < want {
                            let n = file.read_at(&mut dst[done..], local + done as u64)?;
                            if n == 0 {
                                break;
                            }
                            done += n;
                        }
                        // 선언 크기보다 짧은 파일은 0으로 채움
                        dst[done..].fill(0);
                    }
                }
                filled += want;
                offset += want as u64;
                local += want as u64;
            }

            if local == entry_size && filled < buf.len() {
                buf[filled] = 0;
                filled += 1;
                offset += 1;
            }
        }

        Ok(filled)
    }

    fn ensure_open(&mut self, idx: usize) -> Result<()> {
        if let Some((open_idx, _)) = &self.open_slot {
            if *open_idx == idx {
                return Ok(());
            }
        }
        let file = File::open(self.root.join(&self.entries[idx].path))?;
        self.open_slot = Some((idx, file));
        Ok(())
    }
}
