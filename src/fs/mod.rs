//! ジャーナル付きファイルハンドル.
//!
//! [`JournalFs`](struct.JournalFs.html)は、開いたデータファイルと
//! そのジャーナルディレクトリ、lingering中のレコード群、autosyncタスクを
//! 束ねる、このcrateのルートオブジェクト.
//!
//! 生成には[`JournalFsBuilder`](struct.JournalFsBuilder.html)を使う:
//!
//! ```no_run
//! use jourio::fs::JournalFsBuilder;
//!
//! # fn main() -> jourio::Result<()> {
//! let fs = JournalFsBuilder::new().open("/tmp/example.db")?;
//! let mut trans = fs.transaction();
//! trans.add(b"hello", 0)?;
//! assert_eq!(trans.commit()?, 5);
//! # Ok(())
//! # }
//! ```
use std::collections::VecDeque;
use std::fs::File;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use trackable::error::ErrorKindExt;

use slog::Logger;

pub use self::builder::JournalFsBuilder;

use crate::journal::JournalDir;
use crate::lock::RangeLockSet;
use crate::metrics::JournalFsMetrics;
use crate::pio::{self, SyncMode};
use crate::trans::Transaction;
use crate::{ErrorKind, Result};

mod autosync;
mod builder;

/// DURABLE_JOURNALで停止したコミット状態機械の再開用文脈.
///
/// ジャーナルID、未反映の操作列、そして保持し続けている範囲ロック.
#[derive(Debug)]
pub(crate) struct LingerRecord {
    pub id: u32,
    pub ops: Vec<(Vec<u8>, u64)>,
    pub locks: RangeLockSet,
    pub grew: bool,
    pub bounds: (u64, u64),
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LingerQueue {
    records: VecDeque<LingerRecord>,
    bytes: u64,
}

/// ハンドルの共有部分.
///
/// autosyncタスクが`Arc`越しに参照するため、`JournalFs`本体から分離されている.
#[derive(Debug)]
pub(crate) struct JfsShared {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    pub(crate) journal: JournalDir,
    pub(crate) flags: u32,
    pub(crate) sync_mode: SyncMode,
    pub(crate) metrics: JournalFsMetrics,
    pub(crate) logger: Logger,
    pub(crate) linger: Mutex<LingerQueue>,
    pub(crate) autosync_waker: Mutex<Option<autosync::Waker>>,
    pub(crate) drain_lock: Mutex<()>,
}
impl JfsShared {
    fn lock_linger(&self) -> MutexGuard<'_, LingerQueue> {
        match self.linger.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn set_autosync_waker(&self, waker: Option<autosync::Waker>) {
        let mut slot = match self.autosync_waker.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = waker;
    }

    pub(crate) fn take_autosync_waker(&self) -> Option<autosync::Waker> {
        let mut slot = match self.autosync_waker.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take()
    }

    /// DURABLE_JOURNALで停止したレコードをキューに積む.
    ///
    /// バイト総量がautosyncの閾値を超えた場合は、タスクを起床させる.
    pub(crate) fn enqueue_linger(&self, record: LingerRecord) {
        let mut queue = self.lock_linger();
        queue.bytes += record.bytes;
        queue.records.push_back(record);
        self.metrics.lingering_records.set(queue.records.len() as f64);
        self.metrics.lingering_bytes.set(queue.bytes as f64);

        let bytes = queue.bytes;
        drop(queue);
        if let Ok(waker) = self.autosync_waker.lock() {
            if let Some(waker) = &*waker {
                if bytes > waker.max_bytes {
                    waker.wake();
                }
            }
        }
    }

    /// lingering中のレコードを全てDONEまで進める.
    ///
    /// キュー内の全レコードをID順(=コミット順)に適用した後、
    /// データファイルを一度だけ同期し、各レコードの削除とロック解放を行う.
    /// 途中で失敗した場合、未完了のレコードはキューに戻され、
    /// `ErrorKind::AtomicityBroken`が返される(ジャーナルは無傷のため、
    /// 再実行ないしリカバリでいつでも追い付ける).
    pub(crate) fn sync_lingering(&self) -> Result<()> {
        // syncとautosyncタスクが同時に走っても、適用がコミット順を
        // 追い越さないように、排出処理自体を直列化する
        let _drain = match self.drain_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pending = {
            let mut queue = self.lock_linger();
            queue.bytes = 0;
            mem::take(&mut queue.records)
        };
        if pending.is_empty() {
            return Ok(());
        }

        // APPLIED: 全レコードをコミット順に反映する
        let apply_result = (|| {
            for record in &pending {
                for (buf, offset) in &record.ops {
                    track!(pio::write_full_at(&self.file, buf, *offset))?;
                }
            }
            // DATA_DURABLE: バリアは一括で一度だけ
            self.metrics.data_syncs.increment();
            if pending.iter().any(|record| record.grew) {
                track!(pio::sync_file(&self.file))
            } else {
                let start = pending
                    .iter()
                    .map(|record| record.bounds.0)
                    .min()
                    .expect("Never fails");
                let end = pending
                    .iter()
                    .map(|record| record.bounds.0 + record.bounds.1)
                    .max()
                    .expect("Never fails");
                track!(pio::sync_range(&self.file, self.sync_mode, start, end - start))
            }
        })();
        if let Err(e) = apply_result {
            self.requeue_front(pending);
            return Err(ErrorKind::AtomicityBroken.cause(e).into());
        }

        // DONE: レコードを削除し、ロックを解放する
        let mut first_error = None;
        for mut record in pending {
            if let Err(e) = track_io!(std::fs::remove_file(self.journal.record_path(record.id))) {
                first_error.get_or_insert(e);
            }
            if let Err(e) = record.locks.release(&self.file) {
                warn!(self.logger, "Cannot release range locks: {}", e; "id" => record.id);
            }
        }
        if let Err(e) = track!(self.journal.sync()) {
            first_error.get_or_insert(e);
        }

        self.metrics.lingering_records.set(self.lock_linger().records.len() as f64);
        self.metrics.lingering_bytes.set(self.lock_linger().bytes as f64);

        if let Some(e) = first_error {
            // データは永続済み. 残骸のレコードは次のリカバリが冪等に処理する
            return Err(ErrorKind::AtomicityBroken.cause(e).into());
        }
        Ok(())
    }

    fn requeue_front(&self, pending: VecDeque<LingerRecord>) {
        let mut queue = self.lock_linger();
        let bytes: u64 = pending.iter().map(|record| record.bytes).sum();
        for record in pending.into_iter().rev() {
            queue.records.push_front(record);
        }
        queue.bytes += bytes;
        self.metrics.lingering_records.set(queue.records.len() as f64);
        self.metrics.lingering_bytes.set(queue.bytes as f64);
    }

    fn lingering_is_empty(&self) -> bool {
        self.lock_linger().records.is_empty()
    }
}

/// ジャーナル付きで開かれたデータファイルのハンドル.
///
/// 全ての公開操作の起点. 一つのデータファイルを同時に変更できる
/// ハンドルは一つだけで、二重オープンはセッションロックによって
/// `ErrorKind::Busy`として拒否される(読み取り専用ハンドル同士は共存可能).
///
/// ハンドルのドロップ時には、autosyncタスクの停止と
/// lingering中のレコードの反映がベストエフォートで行われる.
/// エラーを検知したい場合は明示的に[`close`](#method.close)を呼ぶこと.
#[derive(Debug)]
pub struct JournalFs {
    shared: Arc<JfsShared>,
    autosync: Option<autosync::AutosyncHandle>,
}
impl JournalFs {
    /// デフォルト設定でデータファイルを開く.
    ///
    /// 細かい設定が必要な場合は[`JournalFsBuilder`](struct.JournalFsBuilder.html)を使う.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<JournalFs> {
        track!(JournalFsBuilder::new().open(path))
    }

    pub(crate) fn shared(&self) -> &JfsShared {
        &self.shared
    }

    /// データファイルのパスを返す.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// ジャーナルディレクトリのパスを返す.
    pub fn journal_dir(&self) -> &Path {
        self.shared.journal.path()
    }

    /// このハンドルのメトリクスを返す.
    pub fn metrics(&self) -> &JournalFsMetrics {
        &self.shared.metrics
    }

    /// 空のトランザクションを生成する.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self, self.shared.flags)
    }

    /// lingering中のレコードを全てデータファイルに反映する.
    ///
    /// lingeringモードでないハンドルでは何もしない.
    pub fn sync(&self) -> Result<()> {
        track!(self.shared.sync_lingering())
    }

    /// autosyncタスクを起動する.
    ///
    /// タスクは`max_interval`毎、ないしlingering中のバイト総量が
    /// `max_bytes`を超える度に[`sync`](#method.sync)を実行する.
    ///
    /// # Errors
    ///
    /// 既にタスクが起動済みの場合、および読み取り専用ハンドルの場合には、
    /// 種類が`ErrorKind::InvalidInput`のエラーが返される.
    pub fn autosync_start(&mut self, max_interval: Duration, max_bytes: u64) -> Result<()> {
        track_assert!(
            self.autosync.is_none(),
            ErrorKind::InvalidInput,
            "The autosync task is already running"
        );
        track_assert_eq!(
            self.shared.flags & crate::journal::record::FLAG_RDONLY,
            0,
            ErrorKind::InvalidInput,
            "The handle is read-only"
        );
        let handle = autosync::start(Arc::clone(&self.shared), max_interval, max_bytes);
        self.autosync = Some(handle);
        Ok(())
    }

    /// autosyncタスクを停止する.
    ///
    /// タスクのスレッドがjoinされるまでブロックする.
    /// タスクが起動していない場合には`ErrorKind::InvalidInput`が返される.
    pub fn autosync_stop(&mut self) -> Result<()> {
        let handle = track_assert_some!(
            self.autosync.take(),
            ErrorKind::InvalidInput,
            "The autosync task is not running"
        );
        track!(handle.stop(&self.shared))
    }

    /// ジャーナルディレクトリを`new_dir`に移設する.
    ///
    /// ハンドルはquiescedでなければならない: autosyncタスクは停止済みで、
    /// lingering中のレコードも無いこと(そうでなければ
    /// `ErrorKind::InvalidInput`が返される).
    pub fn move_journal<P: AsRef<Path>>(&mut self, new_dir: P) -> Result<()> {
        track_assert!(
            self.autosync.is_none(),
            ErrorKind::InvalidInput,
            "Stop the autosync task first"
        );
        track_assert!(
            self.shared.lingering_is_empty(),
            ErrorKind::InvalidInput,
            "Flush the lingering records first"
        );
        let shared = track_assert_some!(
            Arc::get_mut(&mut self.shared),
            ErrorKind::InconsistentState
        );
        track!(shared.journal.move_to(new_dir))
    }

    /// ハンドルを閉じる.
    ///
    /// autosyncタスクを停止し、lingering中のレコードを反映してから解放する.
    /// ドロップでも同じ処理がベストエフォートで行われるが、
    /// エラーを検知するにはこちらを使う.
    pub fn close(mut self) -> Result<()> {
        if let Some(handle) = self.autosync.take() {
            track!(handle.stop(&self.shared))?;
        }
        track!(self.shared.sync_lingering())?;
        Ok(())
    }
}
impl Drop for JournalFs {
    fn drop(&mut self) {
        if let Some(handle) = self.autosync.take() {
            let _ = handle.stop(&self.shared);
        }
        if let Err(e) = self.shared.sync_lingering() {
            warn!(self.shared.logger, "Cannot flush the lingering records: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;
    use crate::journal::{COUNT_FILE_NAME, LOCK_FILE_NAME};
    use crate::ErrorKind;

    fn journal_records(fs: &JournalFs) -> Vec<u32> {
        track_try_unwrap!(fs.shared.journal.list_record_ids())
    }

    #[test]
    fn single_write_works() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        let fs = track!(JournalFs::open(&path))?;

        let mut trans = fs.transaction();
        track!(trans.add(b"hello", 0))?;
        assert_eq!(track!(trans.commit())?, 5);

        assert_eq!(track_io!(fs::read(&path))?, b"hello");
        assert_eq!(journal_records(&fs), vec![]);
        assert_eq!(fs.metrics().committed_transactions(), 1);
        assert_eq!(fs.metrics().written_bytes(), 5);
        Ok(())
    }

    #[test]
    fn overlapping_ops_in_one_transaction() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        let fs = track!(JournalFs::open(&path))?;

        let mut trans = fs.transaction();
        track!(trans.add(b"AAAA", 0))?;
        track!(trans.add(b"BB", 1))?;

        // 返り値は操作の総バイト数(4 + 2)
        assert_eq!(track!(trans.commit())?, 6);
        assert_eq!(track_io!(fs::read(&path))?, b"ABBA");
        Ok(())
    }

    #[test]
    fn commit_after_commit_is_rejected() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let fs = track!(JournalFs::open(dir.path().join("data")))?;

        let mut trans = fs.transaction();
        track!(trans.add(b"x", 0))?;
        track!(trans.commit())?;

        let e = trans.commit().err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::InvalidInput);

        // コミット済みトランザクションへの操作追加も拒否される
        let e = trans.add(b"y", 0).err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::InvalidInput);
        Ok(())
    }

    #[test]
    fn empty_transaction_is_rejected() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let fs = track!(JournalFs::open(dir.path().join("data")))?;

        let mut trans = fs.transaction();
        let e = trans.commit().err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::InvalidInput);

        // 長さゼロの操作も拒否される
        let e = trans.add(b"", 0).err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::InvalidInput);
        Ok(())
    }

    #[test]
    fn write_beyond_eof_extends_the_file() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        let fs = track!(JournalFs::open(&path))?;

        let mut trans = fs.transaction();
        track!(trans.add(b"tail", 10))?;
        assert_eq!(track!(trans.commit())?, 4);

        let contents = track_io!(fs::read(&path))?;
        assert_eq!(contents.len(), 14);
        assert_eq!(&contents[..10], &[0; 10][..]);
        assert_eq!(&contents[10..], b"tail");
        Ok(())
    }

    #[test]
    fn write_spanning_eof_works() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        track_io!(fs::write(&path, b"01234"))?;
        let fs = track!(JournalFs::open(&path))?;

        // 一部は上書き、一部は伸長
        let mut trans = fs.transaction();
        track!(trans.add(b"XXXX", 3))?;
        assert_eq!(track!(trans.commit())?, 4);
        assert_eq!(track_io!(fs::read(&path))?, b"012XXXX");
        Ok(())
    }

    #[test]
    fn rollback_restores_contents_and_length() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        track_io!(fs::write(&path, b"XXXXX"))?;
        let fs = track!(JournalFs::open(&path))?;

        let mut trans = fs.transaction();
        track!(trans.add(b"YYYYY", 0))?;
        assert_eq!(track!(trans.commit())?, 5);
        assert_eq!(track_io!(fs::read(&path))?, b"YYYYY");

        track!(trans.rollback())?;
        assert_eq!(track_io!(fs::read(&path))?, b"XXXXX");
        assert_eq!(journal_records(&fs), vec![]);
        assert_eq!(fs.metrics().rollbacked_transactions(), 1);
        Ok(())
    }

    #[test]
    fn rollback_of_growing_transaction_truncates() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        track_io!(fs::write(&path, b"base"))?;
        let fs = track!(JournalFs::open(&path))?;

        // 末尾2バイトの上書き + EOF越えの伸長
        let mut trans = fs.transaction();
        track!(trans.add(b"SE__grown", 2))?;
        track!(trans.commit())?;
        assert_eq!(track_io!(fs::read(&path))?, b"baSE__grown");

        track!(trans.rollback())?;
        assert_eq!(track_io!(fs::read(&path))?, b"base");
        Ok(())
    }

    #[test]
    fn rollback_of_pure_append_is_a_truncate() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        track_io!(fs::write(&path, b"base"))?;
        let fs = track!(JournalFs::open(&path))?;

        // 操作全体が元のEOFより先: 巻き戻しは切り詰めのみ
        let mut trans = fs.transaction();
        track!(trans.add(b"appendix", 4))?;
        track!(trans.commit())?;

        assert_eq!(track!(trans.rollback())?, 0);
        assert_eq!(track_io!(fs::read(&path))?, b"base");
        Ok(())
    }

    #[test]
    fn rollback_without_pre_images_is_rejected() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let fs = track!(JournalFsBuilder::new()
            .norollback(true)
            .open(dir.path().join("data")))?;

        let mut trans = fs.transaction();
        track!(trans.add(b"x", 0))?;
        track!(trans.commit())?;

        let e = trans.rollback().err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::InvalidInput);
        Ok(())
    }

    #[test]
    fn uncommitted_rollback_is_rejected() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let fs = track!(JournalFs::open(dir.path().join("data")))?;

        let mut trans = fs.transaction();
        track!(trans.add(b"x", 0))?;
        let e = trans.rollback().err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::InvalidInput);
        Ok(())
    }

    #[test]
    fn read_only_handle_rejects_mutations() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        track_io!(fs::write(&path, b"data"))?;

        let fs = track!(JournalFsBuilder::new().read_only(true).open(&path))?;
        let mut trans = fs.transaction();
        let e = trans.add(b"x", 0).err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::InvalidInput);

        // 読み取り専用ハンドル同士は共存できる
        let _other = track!(JournalFsBuilder::new().read_only(true).open(&path))?;
        Ok(())
    }

    #[test]
    fn double_open_is_busy() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        let _fs = track!(JournalFs::open(&path))?;
        if cfg!(unix) {
            let e = JournalFs::open(&path).err().unwrap();
            assert_eq!(*e.kind(), ErrorKind::Busy);
        }
        Ok(())
    }

    #[test]
    fn clean_close_leaves_only_the_bookkeeping_files() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        let journal_dir;
        {
            let fs = track!(JournalFs::open(&path))?;
            journal_dir = fs.journal_dir().to_path_buf();
            let mut trans = fs.transaction();
            track!(trans.add(b"hello", 0))?;
            track!(trans.commit())?;
            track!(fs.close())?;
        }
        let mut names: Vec<_> = track_io!(fs::read_dir(&journal_dir))?
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![COUNT_FILE_NAME.to_string(), LOCK_FILE_NAME.to_string()]
        );
        Ok(())
    }

    #[test]
    fn lingering_commit_defers_the_apply() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        track_io!(fs::write(&path, b"-----"))?;
        let fs = track!(JournalFsBuilder::new().linger(true).open(&path))?;

        let mut trans = fs.transaction();
        track!(trans.add(b"hello", 0))?;
        assert_eq!(track!(trans.commit())?, 5);

        // ジャーナルにはレコードが残り、データファイルは未反映
        assert_eq!(journal_records(&fs).len(), 1);
        assert_eq!(track_io!(fs::read(&path))?, b"-----");
        assert_eq!(fs.metrics().lingering_records(), 1);
        assert_eq!(fs.metrics().lingering_bytes(), 5);

        // syncで反映され、ジャーナルは空になる
        track!(fs.sync())?;
        assert_eq!(track_io!(fs::read(&path))?, b"hello");
        assert_eq!(journal_records(&fs), vec![]);
        assert_eq!(fs.metrics().lingering_records(), 0);
        Ok(())
    }

    #[test]
    fn lingering_records_are_applied_in_commit_order() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        let fs = track!(JournalFsBuilder::new().linger(true).open(&path))?;

        for (i, pattern) in [b"11111", b"22222", b"33333"].iter().enumerate() {
            let mut trans = fs.transaction();
            track!(trans.add(&pattern[..], i as u64))?;
            track!(trans.commit())?;
        }
        assert_eq!(journal_records(&fs).len(), 3);

        track!(fs.sync())?;
        assert_eq!(track_io!(fs::read(&path))?, b"1233333");
        Ok(())
    }

    #[test]
    fn close_flushes_lingering_records() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        {
            let fs = track!(JournalFsBuilder::new().linger(true).open(&path))?;
            let mut trans = fs.transaction();
            track!(trans.add(b"durable", 0))?;
            track!(trans.commit())?;
            track!(fs.close())?;
        }
        assert_eq!(track_io!(fs::read(&path))?, b"durable");
        Ok(())
    }

    #[test]
    fn reopen_completes_a_lingering_commit() -> TestResult {
        // lingering中(データ未反映)のままハンドルが消えた状況を作るため、
        // ジャーナルレコードを残したままロックだけ手放す
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        track_io!(fs::write(&path, b"-------"))?;
        {
            let fs = track!(JournalFsBuilder::new().linger(true).open(&path))?;
            let mut trans = fs.transaction();
            track!(trans.add(b"payload", 0))?;
            track!(trans.commit())?;

            // dropによるフラッシュを避けるために、キューを意図的に放棄する
            fs.shared.lock_linger().records.clear();
        }
        assert_eq!(track_io!(fs::read(&path))?, b"-------");

        // 再オープン時のリカバリがコミットを完遂する
        let fs = track!(JournalFs::open(&path))?;
        assert_eq!(track_io!(fs::read(&path))?, b"payload");
        assert_eq!(journal_records(&fs), vec![]);
        Ok(())
    }

    #[test]
    fn concurrent_disjoint_commits_from_two_threads() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        let fs = track!(JournalFs::open(&path))?;

        let barrier = std::sync::Barrier::new(2);
        let fs_ref = &fs;
        let barrier_ref = &barrier;
        thread::scope(|scope| {
            for (pattern, offset) in [(b'a', 0u64), (b'b', 4096u64)] {
                scope.spawn(move || {
                    barrier_ref.wait();
                    let mut trans = fs_ref.transaction();
                    track_try_unwrap!(trans.add(&[pattern; 4096], offset));
                    assert_eq!(track_try_unwrap!(trans.commit()), 4096);
                });
            }
        });

        let contents = track_io!(fs::read(&path))?;
        assert_eq!(contents.len(), 8192);
        assert!(contents[..4096].iter().all(|b| *b == b'a'));
        assert!(contents[4096..].iter().all(|b| *b == b'b'));
        assert_eq!(journal_records(&fs), vec![]);
        Ok(())
    }

    #[test]
    fn autosync_flushes_by_interval() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        let mut fs = track!(JournalFsBuilder::new().linger(true).open(&path))?;
        track!(fs.autosync_start(Duration::from_millis(20), u64::max_value()))?;

        let mut trans = fs.transaction();
        track!(trans.add(b"hello", 0))?;
        track!(trans.commit())?;

        let deadline = Instant::now() + Duration::from_secs(10);
        while fs.metrics().lingering_records() != 0 {
            assert!(Instant::now() < deadline, "The autosync task did not flush");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(track_io!(fs::read(&path))?, b"hello");

        track!(fs.autosync_stop())?;
        Ok(())
    }

    #[test]
    fn autosync_flushes_by_byte_threshold() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        let mut fs = track!(JournalFsBuilder::new().linger(true).open(&path))?;

        // 間隔は実質無効にして、バイト閾値だけで起床させる
        track!(fs.autosync_start(Duration::from_secs(3600), 8))?;

        let mut trans = fs.transaction();
        track!(trans.add(b"0123456789abcdef", 0))?;
        track!(trans.commit())?;

        let deadline = Instant::now() + Duration::from_secs(10);
        while fs.metrics().lingering_records() != 0 {
            assert!(Instant::now() < deadline, "The autosync task did not flush");
            thread::sleep(Duration::from_millis(10));
        }
        track!(fs.autosync_stop())?;
        Ok(())
    }

    #[test]
    fn autosync_double_start_is_rejected() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let mut fs = track!(JournalFs::open(dir.path().join("data")))?;
        track!(fs.autosync_start(Duration::from_secs(1), 0))?;

        let e = fs
            .autosync_start(Duration::from_secs(1), 0)
            .err()
            .unwrap();
        assert_eq!(*e.kind(), ErrorKind::InvalidInput);

        track!(fs.autosync_stop())?;
        let e = fs.autosync_stop().err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::InvalidInput);
        Ok(())
    }

    #[test]
    fn move_journal_works() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let path = dir.path().join("data");
        let mut fs = track!(JournalFs::open(&path))?;
        let old_dir = fs.journal_dir().to_path_buf();

        let mut trans = fs.transaction();
        track!(trans.add(b"hello", 0))?;
        track!(trans.commit())?;

        let new_dir = dir.path().join("relocated");
        track!(fs.move_journal(&new_dir))?;
        assert_eq!(fs.journal_dir(), new_dir.as_path());
        assert!(!old_dir.exists());

        // 移設後もコミットは通常通り動く
        let mut trans = fs.transaction();
        track!(trans.add(b"world", 5))?;
        track!(trans.commit())?;
        assert_eq!(track_io!(fs::read(&path))?, b"helloworld");
        Ok(())
    }

    #[test]
    fn move_journal_requires_a_quiesced_handle() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_fs"))?;
        let mut fs = track!(JournalFsBuilder::new()
            .linger(true)
            .open(dir.path().join("data")))?;

        let mut trans = fs.transaction();
        track!(trans.add(b"x", 0))?;
        track!(trans.commit())?;

        let new_dir = dir.path().join("relocated");
        let e = fs.move_journal(&new_dir).err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::InvalidInput);

        track!(fs.sync())?;
        track!(fs.move_journal(&new_dir))?;
        Ok(())
    }
}
