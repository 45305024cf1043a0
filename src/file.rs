//! 파일 엔트리와 가상 주소 공간 레이아웃
//!
//! - FileEntry: 논리 파일 하나의 불변 기술자
//! - layout: 경로 검증 + 정렬 + 오프셋 배정
//! - 파일마다 종료 바이트 1개가 가상 공간에 예약됨 (빈 파일도 최소 한 번 접근되도록)

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::{Error, Result};

/// mode 필드의 심볼릭 링크 플래그 비트
pub const MODE_SYMLINK: u32 = 1 << 31;

/// mode 필드의 퍼미션 비트 마스크
pub const MODE_PERM_MASK: u32 = 0o7777;

/// 논리 파일 하나의 기술자
///
/// 가상 오프셋은 레이아웃 시 배정되며, 동일한 엔트리 집합은 입력 순서와 무관하게
/// 항상 동일한 레이아웃을 만든다 (경로 기준 정렬).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// 슬래시 구분 상대 경로 (집합 내 유일)
    pub path: String,

    /// 내용 크기 (바이트)
    pub size: u64,

    /// 퍼미션 비트 + 심볼릭 링크 플래그
    pub mode: u32,

    /// BLAKE3 내용 해시
    pub hash: [u8; 32],

    /// 심볼릭 링크 대상 (와이어로는 전달되지 않음)
    pub symlink_destination: Option<String>,

    /// 가상 시작 오프셋 (레이아웃 시 배정)
    pub(crate) offset: u64,
}

impl FileEntry {
    /// 일반 파일 엔트리 생성
    pub fn regular(path: impl Into<String>, size: u64, mode: u32, hash: [u8; 32]) -> Self {
        Self {
            path: path.into(),
            size,
            mode: mode & MODE_PERM_MASK,
            hash,
            symlink_destination: None,
            offset: 0,
        }
    }

    /// 심볼릭 링크 엔트리 생성 (내용 크기 0, 가상 구간은 종료 바이트뿐)
    pub fn symlink(path: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            mode: MODE_SYMLINK | 0o777,
            hash: [0u8; 32],
            symlink_destination: Some(destination.into()),
            offset: 0,
        }
    }

    /// 와이어 필드에서 엔트리 복원 (링크 대상은 와이어에 없음)
    pub(crate) fn from_wire(path: String, size: u64, mode: u32, hash: [u8; 32]) -> Self {
        Self {
            path,
            size,
            mode,
            hash,
            symlink_destination: None,
            offset: 0,
        }
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & MODE_SYMLINK != 0
    }

    /// 퍼미션 비트만 추출
    pub fn permissions(&self) -> u32 {
        self.mode & MODE_PERM_MASK
    }

    /// 가상 시작 오프셋
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// 가상 구간 길이 (내용 + 종료 바이트)
    pub fn span(&self) -> u64 {
        self.size + 1
    }
}

fn validate_path(path: &str) -> Result<()> {
    let invalid = || Error::InvalidPath {
        path: path.to_string(),
    };
    if path.is_empty() || path.len() > u16::MAX as usize {
        return Err(invalid());
    }
    for segment in path.split('/') {
        // 빈 세그먼트는 절대 경로("/a")와 이중 슬래시("a//b")를 함께 걸러냄
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(invalid());
        }
    }
    Ok(())
}

/// 엔트리 집합 검증 + 정규 레이아웃 계산
///
/// 경로 기준으로 정렬한 뒤 오프셋을 배정하고 전체 가상 크기를 반환한다.
/// 송신측과 수신측이 같은 집합에서 독립적으로 동일한 레이아웃을 얻는다.
pub(crate) fn layout(mut entries: Vec<FileEntry>) -> Result<(Vec<FileEntry>, u64)> {
    let mut unique = HashSet::with_capacity(entries.len());
    for entry in &entries {
        validate_path(&entry.path)?;
        if !unique.insert(entry.path.clone()) {
            return Err(Error::DuplicatePaths {
                path: entry.path.clone(),
            });
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut total = 0u64;
    for entry in &mut entries {
        entry.offset = total;
        total += entry.span();
    }

    Ok((entries, total))
}

/// 파일 내용의 BLAKE3 해시 계산 (스트리밍)
pub fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(*hasher.finalize().as_bytes())
}

/// 디렉터리를 재귀 순회해서 엔트리 목록 생성
///
/// 일반 파일과 심볼릭 링크만 수집한다. 디렉터리 자체의 메타데이터는 보존하지
/// 않는다. 내용 해시는 수집 후 rayon으로 병렬 계산된다.
pub fn scan_dir(root: &Path) -> Result<Vec<FileEntry>> {
    use std::os::unix::fs::PermissionsExt;

    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for item in fs::read_dir(&dir)? {
            let item = item?;
            let path = item.path();
            let meta = fs::symlink_metadata(&path)?;
            let rel = relative_slash_path(root, &path)?;

            if meta.file_type().is_symlink() {
                let dest = fs::read_link(&path)?;
                let dest = dest.to_str().ok_or_else(|| Error::InvalidPath {
                    path: dest.to_string_lossy().into_owned(),
                })?;
                entries.push(FileEntry::symlink(rel, dest));
            } else if meta.is_dir() {
                pending.push(path);
            } else if meta.is_file() {
                entries.push(FileEntry::regular(
                    rel,
                    meta.len(),
                    meta.permissions().mode() & MODE_PERM_MASK,
                    [0u8; 32],
                ));
            }
        }
    }

    // 내용 해시 병렬 계산
    entries
        .par_iter_mut()
        .filter(|entry| !entry.is_symlink())
        .try_for_each(|entry| {
            entry.hash = hash_file(&root.join(&entry.path))?;
            Ok::<(), Error>(())
        })?;

    Ok(entries)
}

fn relative_slash_path(root: &Path, path: &Path) -> Result<String> {
    let rel: PathBuf = path
        .strip_prefix(root)
        .map_err(|_| Error::InvalidPath {
            path: path.to_string_lossy().into_owned(),
        })?
        .to_path_buf();
    let rel = rel.to_str().ok_or_else(|| Error::InvalidPath {
        path: rel.to_string_lossy().into_owned(),
    })?;
    Ok(rel.replace(std::path::MAIN_SEPARATOR, "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64) -> FileEntry {
        FileEntry::regular(path, size, 0o644, [0u8; 32])
    }

    #[test]
    fn test_layout_total_size() {
        let (entries, total) = layout(vec![entry("a.txt", 10), entry("b.txt", 0), entry("c", 5)])
            .expect("layout");
        assert_eq!(total, 11 + 1 + 6);
        assert_eq!(entries[0].offset(), 0);
        assert_eq!(entries[1].offset(), 11);
        assert_eq!(entries[2].offset(), 12);
    }

    #[test]
    fn test_layout_order_independent() {
        let forward = vec![entry("a", 1), entry("b", 2), entry("c", 3)];
        let backward = vec![entry("c", 3), entry("b", 2), entry("a", 1)];

        let (left, left_total) = layout(forward).expect("layout");
        let (right, right_total) = layout(backward).expect("layout");

        assert_eq!(left, right);
        assert_eq!(left_total, right_total);
    }

    #[test]
    fn test_layout_rejects_bad_paths() {
        for path in ["/abs", "a/../b", ".", "a//b", ""] {
            let result = layout(vec![entry(path, 1)]);
            assert!(
                matches!(result, Err(Error::InvalidPath { .. })),
                "path {:?} accepted",
                path
            );
        }
    }

    #[test]
    fn test_layout_rejects_duplicates() {
        let result = layout(vec![entry("same", 1), entry("same", 2)]);
        assert!(matches!(result, Err(Error::DuplicatePaths { .. })));
    }

    #[test]
    fn test_symlink_entry_is_terminator_only() {
        let link = FileEntry::symlink("link", "target");
        assert!(link.is_symlink());
        assert_eq!(link.size, 0);
        assert_eq!(link.span(), 1);
    }

    #[test]
    fn test_scan_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("sub")).expect("mkdir");
        fs::write(dir.path().join("top.bin"), b"hello").expect("write");
        fs::write(dir.path().join("sub/nested.bin"), b"world!").expect("write");
        std::os::unix::fs::symlink("top.bin", dir.path().join("link")).expect("symlink");

        let mut entries = scan_dir(dir.path()).expect("scan");
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["link", "sub/nested.bin", "top.bin"]);

        assert!(entries[0].is_symlink());
        assert_eq!(entries[0].symlink_destination.as_deref(), Some("top.bin"));
        assert_eq!(entries[1].size, 6);
        assert_eq!(entries[2].hash, *blake3::hash(b"hello").as_bytes());
    }
}
