//! 가상 타르볼 쓰기
//!
//! 파일 집합을 하나의 평탄한 가상 바이트 공간으로 매핑하고, 임의 오프셋 쓰기를
//! 실제 파일 생성/쓰기로 변환한다. 컨테이너 파일은 만들지 않는다.
//!
//! - 한 번에 파일 핸들 하나만 연다 (현재 엔트리 전환 시 이전 파일 마무리)
//! - 첫 접근 시 디렉터리 생성 + 선언 크기만큼 공간 예약 → 순서 무관 쓰기 허용
//! - 각 파일의 가상 구간 끝에는 종료 바이트(0x00) 하나가 예약됨

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::file::{layout, FileEntry};
use crate::{Error, Result};

/// 가상 타르볼 쓰기 핸들
pub struct VirtualTarballWriter {
    entries: Vec<FileEntry>,
    total_size: u64,
    root: PathBuf,

    // 현재 열려 있는 파일 (엔트리 인덱스 + 핸들), 한 번에 하나만
    open_slot: Option<(usize, File)>,
}

impl VirtualTarballWriter {
    /// 엔트리 집합을 검증하고 레이아웃 계산
    ///
    /// 실제 파일은 `root` 아래에 상대 경로로 생성된다.
    pub fn new(entries: Vec<FileEntry>, root: impl AsRef<Path>) -> Result<Self> {
        let (entries, total_size) = layout(entries)?;
        Ok(Self {
            entries,
            total_size,
            root: root.as_ref().to_path_buf(),
            open_slot: None,
        })
    }

    /// 전체 가상 크기 (= Σ(size + 1))
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 정렬된 엔트리 목록
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// 가상 오프셋에 버퍼 쓰기, 소비한 바이트 수 반환
    ///
    /// 호출 하나가 여러 파일에 걸칠 수 있다. 종료 바이트 규약:
    /// - 종료 위치의 0x00은 소비되고 카운트된다
    /// - 같은 호출에서 그 파일의 내용을 쓴 뒤 만나는 비-영 바이트는 다음 파일의
    ///   내용이므로 종료 바이트를 건너뛴다 (버퍼 소비 없음)
    /// - 종료 위치를 직접 겨냥한 비-영 바이트는 `BadPaddingByte`
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
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
        let mut remainder = buf;
        let mut total = 0usize;

        for idx in start..self.entries.len() {
            if remainder.is_empty() {
                break;
            }

            let (entry_offset, entry_size, is_symlink) = {
                let entry = &self.entries[idx];
                (entry.offset(), entry.size, entry.is_symlink())
            };

            if is_symlink {
                self.make_symlink(idx)?;
            } else {
                // 종료 바이트만 겨냥해도 생성/예약 경로는 실행된다 (빈 파일 보장)
                self.ensure_open(idx)?;
            }

            let mut local = offset - entry_offset;
            let mut wrote_content = false;

            if local < entry_size {
                let want = (entry_size - local).min(remainder.len() as u64) as usize;
                if !is_symlink {
                    if let Some((_, file)) = &self.open_slot {
                        file.write_all_at(&remainder[..want], local)?;
                    }
                }
                total += want;
                offset += want as u64;
                local += want as u64;
                remainder = &remainder[want..];
                wrote_content = want > 0;
            }

            if local == entry_size && !remainder.is_empty() {
                if remainder[0] == 0 {
                    remainder = &remainder[1..];
                    offset += 1;
                    total += 1;
                } else if wrote_content {
                    // 내용을 흡수한 뒤의 비-영 바이트는 다음 파일 몫
                    offset += 1;
                } else {
                    return Err(Error::BadPaddingByte {
                        offset,
                        got: remainder[0],
                    });
                }
            }
        }

        Ok(total)
    }

    /// 열려 있는 파일 마무리 (선언된 퍼미션 적용 후 닫기)
    ///
    /// 아무것도 열려 있지 않아도 안전하다.
    pub fn close(&mut self) -> Result<()> {
        self.finalize_open()
    }

    fn ensure_open(&mut self, idx: usize) -> Result<()> {
        if let Some((open_idx, _)) = &self.open_slot {
            if *open_idx == idx {
                return Ok(());
            }
        }
        self.finalize_open()?;
        let file = self.open_entry(idx)?;
        self.open_slot = Some((idx, file));
        Ok(())
    }

    fn open_entry(&self, idx: usize) -> Result<File> {
        let entry = &self.entries[idx];
        let path = self.root.join(&entry.path);
        self.make_parent_dirs(&path, entry.permissions() | 0o700)?;

        let mode = entry.permissions() | 0o700;
        let mut options = OpenOptions::new();
        options.write(true).create(true).mode(mode);

        let file = match options.open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                // 기존 파일이 쓰기 불가면 소유자 rwx를 더해 한 번만 재시도
                fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
                options.open(&path)?
            }
            Err(err) => return Err(err.into()),
        };

        // 선언 크기만큼 예약. 이미 예약된 파일에 다시 호출해도 내용은 보존된다.
        file.set_len(entry.size)?;
        Ok(file)
    }

    fn finalize_open(&mut self) -> Result<()> {
        if let Some((idx, file)) = self.open_slot.take() {
            let permissions = self.entries[idx].permissions();
            file.set_permissions(fs::Permissions::from_mode(permissions))?;
        }
        Ok(())
    }

    fn make_symlink(&self, idx: usize) -> Result<()> {
        let entry = &self.entries[idx];
        let destination = match &entry.symlink_destination {
            Some(destination) => destination,
            // 링크 대상은 와이어로 전달되지 않으므로 모르면 건너뛴다
            None => return Ok(()),
        };

        let path = self.root.join(&entry.path);
        if fs::symlink_metadata(&path).is_ok() {
            // 이미 존재하면 다시 만들지 않는다
            return Ok(());
        }
        self.make_parent_dirs(&path, 0o755)?;
        std::os::unix::fs::symlink(destination, &path)?;
        Ok(())
    }

    fn make_parent_dirs(&self, path: &Path, mode: u32) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(mode & 0o7777)
                    .create(parent)?;
            }
        }
        Ok(())
    }
}

impl Drop for VirtualTarballWriter {
    fn drop(&mut self) {
        let _ = self.finalize_open();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(path: &str, size: u64, mode: u32) -> FileEntry {
        FileEntry::regular(path, size, mode, [0u8; 32])
    }

    fn writer(dir: &TempDir, entries: Vec<FileEntry>) -> VirtualTarballWriter {
        VirtualTarballWriter::new(entries, dir.path()).expect("writer")
    }

    #[test]
    fn test_write_at_one_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tb = writer(&dir, vec![entry("jim1.txt", 3, 0o644)]);

        let n = tb.write_at(b"hi\n", 0).expect("write_at");
        assert_eq!(n, 3);
        tb.close().expect("close");

        assert_eq!(fs::read(dir.path().join("jim1.txt")).expect("read"), b"hi\n");
    }

    #[test]
    fn test_write_at_spanning_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tb = writer(
            &dir,
            vec![entry("hello.txt", 7, 0o644), entry("world.txt", 7, 0o644)],
        );
        assert_eq!(tb.total_size(), 16);

        let n = tb.write_at(b"Hello, world!\n", 0).expect("write_at");
        assert_eq!(n, 14);
        tb.close().expect("close");

        assert_eq!(
            fs::read(dir.path().join("hello.txt")).expect("read"),
            b"Hello, "
        );
        assert_eq!(
            fs::read(dir.path().join("world.txt")).expect("read"),
            b"world!\n"
        );
    }

    #[test]
    fn test_write_canonical_stream_whole_and_chunked() {
        let contents: [&[u8]; 3] = [b"first file", b"", b"third"];
        let mut stream = Vec::new();
        for content in contents {
            stream.extend_from_slice(content);
            stream.push(0);
        }

        // 한 번에 쓰기와 임의 크기 분할 쓰기 모두 같은 결과여야 한다
        for chunk_size in [stream.len(), 1, 3, 7] {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut tb = writer(
                &dir,
                vec![
                    entry("a.bin", contents[0].len() as u64, 0o644),
                    entry("b.bin", 0, 0o600),
                    entry("c.bin", contents[2].len() as u64, 0o644),
                ],
            );
            assert_eq!(tb.total_size(), stream.len() as u64);

            let mut offset = 0u64;
            for chunk in stream.chunks(chunk_size) {
                let n = tb.write_at(chunk, offset).expect("write_at");
                assert_eq!(n, chunk.len());
                offset += n as u64;
            }
            tb.close().expect("close");

            assert_eq!(fs::read(dir.path().join("a.bin")).expect("read"), contents[0]);
            assert_eq!(fs::read(dir.path().join("b.bin")).expect("read"), contents[1]);
            assert_eq!(fs::read(dir.path().join("c.bin")).expect("read"), contents[2]);
        }
    }

    #[test]
    fn test_terminator_only_write_creates_empty_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tb = writer(&dir, vec![entry("empty.bin", 0, 0o644)]);

        let n = tb.write_at(&[0u8], 0).expect("write_at");
        assert_eq!(n, 1);
        tb.close().expect("close");

        let meta = fs::metadata(dir.path().join("empty.bin")).expect("metadata");
        assert_eq!(meta.len(), 0);
    }

    #[test]
    fn test_bad_padding_byte() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tb = writer(&dir, vec![entry("data.bin", 4, 0o644)]);

        // 종료 위치(4)를 직접 겨냥한 비-영 바이트는 거부되고 아무것도 진행되지 않음
        let result = tb.write_at(&[0xFF], 4);
        assert!(matches!(result, Err(Error::BadPaddingByte { offset: 4, .. })));

        // 0x00은 허용
        let n = tb.write_at(&[0x00], 4).expect("write_at");
        assert_eq!(n, 1);
    }

    #[test]
    fn test_out_of_range_and_empty_buffer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tb = writer(&dir, vec![entry("data.bin", 4, 0o644)]);

        assert!(matches!(
            tb.write_at(b"x", 5),
            Err(Error::OutOfRange { offset: 5, total_size: 5 })
        ));
        assert!(matches!(tb.write_at(b"", 0), Err(Error::EmptyBuffer)));
    }

    #[test]
    fn test_out_of_order_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tb = writer(&dir, vec![entry("a.bin", 4, 0o644), entry("b.bin", 4, 0o644)]);

        // 뒤쪽 파일 먼저, 그 다음 앞쪽 파일. 예약 덕에 내용이 보존된다.
        assert_eq!(tb.write_at(b"BBBB\x00", 5).expect("write_at"), 5);
        assert_eq!(tb.write_at(b"AAAA\x00", 0).expect("write_at"), 5);
        tb.close().expect("close");

        assert_eq!(fs::read(dir.path().join("a.bin")).expect("read"), b"AAAA");
        assert_eq!(fs::read(dir.path().join("b.bin")).expect("read"), b"BBBB");
    }

    #[test]
    fn test_permissions_applied_on_finalize() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tb = writer(&dir, vec![entry("locked.bin", 2, 0o444)]);

        tb.write_at(b"ok\x00", 0).expect("write_at");
        tb.close().expect("close");

        let meta = fs::metadata(dir.path().join("locked.bin")).expect("metadata");
        assert_eq!(meta.permissions().mode() & 0o7777, 0o444);
    }

    #[test]
    fn test_nested_dirs_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tb = writer(&dir, vec![entry("deep/nested/file.bin", 2, 0o640)]);

        tb.write_at(b"hi\x00", 0).expect("write_at");
        tb.close().expect("close");

        assert_eq!(
            fs::read(dir.path().join("deep/nested/file.bin")).expect("read"),
            b"hi"
        );
    }

    #[test]
    fn test_symlink_created_idempotently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tb = writer(
            &dir,
            vec![
                entry("target.bin", 2, 0o644),
                FileEntry::symlink("link", "target.bin"),
            ],
        );

        // 정렬상 "link"가 먼저: 스트림 = 링크 종료 + "hi" + 종료
        assert_eq!(tb.write_at(b"\x00hi\x00", 0).expect("write_at"), 4);
        // 같은 구간을 다시 써도 (재전송) 링크 생성은 멱등
        assert_eq!(tb.write_at(&[0x00], 0).expect("write_at"), 1);
        tb.close().expect("close");

        let link = dir.path().join("link");
        let meta = fs::symlink_metadata(&link).expect("symlink_metadata");
        assert!(meta.file_type().is_symlink());
        assert_eq!(
            fs::read_link(&link).expect("read_link"),
            PathBuf::from("target.bin")
        );
    }

    #[test]
    fn test_close_without_open_is_safe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tb = writer(&dir, vec![entry("a.bin", 1, 0o644)]);
        tb.close().expect("close");
        tb.close().expect("close again");
    }
}
