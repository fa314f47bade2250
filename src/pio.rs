//! 位置指定I/Oと永続化バリアのアダプタ層.
//!
//! このモジュールは、上位層(ジャーナル・コミットエンジン)が必要とする
//! プリミティブ群を、プラットフォーム差異を吸収した形で提供する:
//!
//! - 要求バイト数を転送しきるまでリトライする位置指定の読み書き
//! - 範囲同期ないしファイル全体同期による永続化バリア
//! - ジャーナルファイルのrename/unlink後に用いるディレクトリ同期
//! - アドバイザリロック(バイト範囲ロックとファイル単位ロック)
use std::fs::File;
use std::path::Path;

use crate::{ErrorKind, Result};

/// データファイルの同期戦略.
///
/// どちらを使えるかはプラットフォーム依存のため、
/// オープン時に一度だけ[`probe`](#method.probe)で決定される.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncMode {
    /// 指定されたバイト範囲のみを安定ストレージに同期する.
    Range,

    /// ファイル全体を同期する.
    Full,
}
impl SyncMode {
    /// このファイルに対して利用可能な同期戦略を調べる.
    #[cfg(target_os = "linux")]
    pub fn probe(file: &File) -> SyncMode {
        use std::os::unix::io::AsRawFd;

        // 長さ0の範囲同期が通るかどうかで、sync_file_rangeの有無を判定する
        if unsafe { libc::sync_file_range(file.as_raw_fd(), 0, 0, 0) } == 0 {
            SyncMode::Range
        } else {
            SyncMode::Full
        }
    }
    #[cfg(not(target_os = "linux"))]
    pub fn probe(_file: &File) -> SyncMode {
        SyncMode::Full
    }
}

/// `offset`位置から`buf`が一杯になるまで読み込む.
///
/// EOFに達した場合はエラーとはならず、実際に読めたバイト数を返す
/// (返り値が`buf.len()`未満であればEOFに当たったことを意味する).
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match read_at(file, &mut buf[read..], offset + read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return track_io!(Err(e)),
        }
    }
    Ok(read)
}

/// `buf`の全バイトを`offset`位置に書き込む.
pub(crate) fn write_full_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match write_at(file, &buf[written..], offset + written as u64) {
            Ok(0) => track_panic!(ErrorKind::Other, "Zero-length write: offset={}", offset),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return track_io!(Err(e)),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}
#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}
#[cfg(not(unix))]
fn read_at(mut file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}
#[cfg(not(unix))]
fn write_at(mut file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write(buf)
}

/// ファイルの内容(データ)を安定ストレージに同期する.
///
/// メタデータ(ファイルサイズ等)の同期が必要な場合にもこちらを使う.
///
/// プラットフォーム毎の実体:
/// - Linux: `fdatasync(2)`
/// - Mac: `fcntl(F_FULLFSYNC)`
///   (MacのfsyncはディスクキャッシュまでしかフラッシュしないためF_FULLFSYNCを使う)
/// - その他: `File::sync_data`
#[cfg(target_os = "linux")]
pub(crate) fn sync_file(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    if unsafe { libc::fdatasync(file.as_raw_fd()) } != 0 {
        track_io!(Err(std::io::Error::last_os_error()))
    } else {
        Ok(())
    }
}
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) fn sync_file(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) } < 0 {
        track_io!(Err(std::io::Error::last_os_error()))
    } else {
        Ok(())
    }
}
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
pub(crate) fn sync_file(file: &File) -> Result<()> {
    track_io!(file.sync_data())
}

/// ファイルの指定範囲を安定ストレージに同期する.
///
/// `mode`が`SyncMode::Full`の場合、および範囲同期が使えない環境では、
/// ファイル全体の同期にフォールバックする.
#[cfg(target_os = "linux")]
pub(crate) fn sync_range(file: &File, mode: SyncMode, offset: u64, len: u64) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    match mode {
        SyncMode::Full => track!(sync_file(file)),
        SyncMode::Range => {
            track_assert!(offset <= i64::max_value() as u64, ErrorKind::InvalidInput);
            let flags = libc::SYNC_FILE_RANGE_WAIT_BEFORE
                | libc::SYNC_FILE_RANGE_WRITE
                | libc::SYNC_FILE_RANGE_WAIT_AFTER;
            let result =
                unsafe { libc::sync_file_range(file.as_raw_fd(), offset as i64, len as i64, flags) };
            if result != 0 {
                track_io!(Err(std::io::Error::last_os_error()))
            } else {
                Ok(())
            }
        }
    }
}
#[cfg(not(target_os = "linux"))]
pub(crate) fn sync_range(file: &File, _mode: SyncMode, _offset: u64, _len: u64) -> Result<()> {
    track!(sync_file(file))
}

/// ディレクトリエントリの変更(rename/unlink)を安定ストレージに同期する.
pub(crate) fn sync_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    let dir = track_io!(File::open(path.as_ref()))?;
    track_io!(dir.sync_all())?;
    Ok(())
}

/// `[start, start+len)`の範囲に対する排他バイト範囲ロックを取得する.
///
/// 競合するロックが解放されるまでブロックする.
/// ロックはアドバイザリであり、協調するプロセス同士でのみ意味を持つ.
#[cfg(unix)]
pub(crate) fn lock_range(file: &File, start: u64, len: u64) -> Result<()> {
    track!(fcntl_range(file, libc::F_WRLCK, start, len))
}
#[cfg(not(unix))]
pub(crate) fn lock_range(_file: &File, _start: u64, _len: u64) -> Result<()> {
    Ok(())
}

/// `lock_range`で取得したロックを解放する.
#[cfg(unix)]
pub(crate) fn unlock_range(file: &File, start: u64, len: u64) -> Result<()> {
    track!(fcntl_range(file, libc::F_UNLCK, start, len))
}
#[cfg(not(unix))]
pub(crate) fn unlock_range(_file: &File, _start: u64, _len: u64) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn fcntl_range(file: &File, lock_type: libc::c_int, start: u64, len: u64) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    track_assert!(start <= i64::max_value() as u64, ErrorKind::InvalidInput; start);
    track_assert!(len <= i64::max_value() as u64, ErrorKind::InvalidInput; len);

    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    loop {
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &fl) } == 0 {
            return Ok(());
        }
        let e = std::io::Error::last_os_error();
        if e.kind() != std::io::ErrorKind::Interrupted {
            return track_io!(Err(e));
        }
    }
}

/// ファイル単位ロックの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlockMode {
    /// 排他ロック(書き込み可能ハンドル用).
    Exclusive,

    /// 共有ロック(読み取り専用ハンドル用).
    Shared,
}

/// `flock(2)`によるファイル単位ロックを、ノンブロッキングで取得する.
///
/// 既に競合するロックが保持されている場合は`ErrorKind::Busy`を返す.
#[cfg(unix)]
pub(crate) fn flock_nonblocking(file: &File, mode: FlockMode) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let op = match mode {
        FlockMode::Exclusive => libc::LOCK_EX,
        FlockMode::Shared => libc::LOCK_SH,
    };
    if unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) } != 0 {
        let e = std::io::Error::last_os_error();
        if e.kind() == std::io::ErrorKind::WouldBlock {
            track_panic!(ErrorKind::Busy, "The file is locked by another handle");
        }
        track_io!(Err(e))
    } else {
        Ok(())
    }
}
#[cfg(not(unix))]
pub(crate) fn flock_nonblocking(_file: &File, _mode: FlockMode) -> Result<()> {
    Ok(())
}

/// `flock(2)`による排他ロックを、ブロッキングで取得する.
///
/// IDカウンタの更新のような短命のクリティカルセクション用.
#[cfg(unix)]
pub(crate) fn flock_exclusive(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
            return Ok(());
        }
        let e = std::io::Error::last_os_error();
        if e.kind() != std::io::ErrorKind::Interrupted {
            return track_io!(Err(e));
        }
    }
}
#[cfg(not(unix))]
pub(crate) fn flock_exclusive(_file: &File) -> Result<()> {
    Ok(())
}

/// `flock(2)`によるロックを解放する.
#[cfg(unix)]
pub(crate) fn funlock(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) } != 0 {
        track_io!(Err(std::io::Error::last_os_error()))
    } else {
        Ok(())
    }
}
#[cfg(not(unix))]
pub(crate) fn funlock(_file: &File) -> Result<()> {
    Ok(())
}
