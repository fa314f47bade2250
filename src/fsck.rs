//! リカバリ(fsck)パス.
//!
//! ジャーナルディレクトリに生き残ったレコード群を列挙し、
//! ID昇順(=コミット順)に分類・処理する:
//!
//! - **committed**: 新データをデータファイルに再適用して同期した後、
//!   レコードを削除する. 同じ内容を同じ位置に書き直すだけなので、
//!   何度実行しても結果は変わらない(冪等).
//! - **in-progress / broken / corrupt / invalid**: 集計した上で削除する.
//!
//! このパスはハンドルのオープン時に暗黙に実行されるほか、
//! [`fsck`](fn.fsck.html)で単独実行もできる.
use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::journal::record::{self, RecordClass, TransRecord};
use crate::journal::{self, JournalDir};
use crate::metrics::FsckMetrics;
use crate::pio;
use crate::{ErrorKind, Result};

/// リカバリパスの集計結果.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FsckResult {
    /// 処理したレコードファイルの総数.
    pub total: u32,

    /// 意味的に不正だったレコードの数.
    pub invalid: u32,

    /// 書き込み途中だったレコードの数.
    pub in_progress: u32,

    /// 切り詰められていた・読めなかったレコードの数.
    pub broken: u32,

    /// マジックナンバーないしチェックサムが一致しなかったレコードの数.
    pub corrupt: u32,

    /// 再適用に失敗したレコードの数.
    pub apply_error: u32,

    /// 再適用に成功したコミット済みレコードの数.
    pub reapplied: u32,
}

/// データファイルとそのジャーナルディレクトリに対してリカバリを実行する.
///
/// `journal_dir`が`None`の場合は、データファイルから導出される
/// デフォルトのジャーナルディレクトリが対象となる.
///
/// # Errors
///
/// - `ErrorKind::NoSuchFile`: データファイルが存在しない
/// - `ErrorKind::NoJournal`: ジャーナルディレクトリが存在しないか、
///   レコードを一つも含んでいない
/// - `ErrorKind::Busy`: ジャーナルディレクトリが他のハンドルによって使用中
pub fn fsck<P: AsRef<Path>>(path: P, journal_dir: Option<&Path>) -> Result<FsckResult> {
    track!(fsck_with_logger(path, journal_dir, &Logger::root(Discard, o!())))
}

/// ロガーを指定して[`fsck`](fn.fsck.html)を実行する.
pub fn fsck_with_logger<P: AsRef<Path>>(
    path: P,
    journal_dir: Option<&Path>,
    logger: &Logger,
) -> Result<FsckResult> {
    let path = path.as_ref();
    track_assert!(path.is_file(), ErrorKind::NoSuchFile; path);
    let file = track_io!(OpenOptions::new().read(true).write(true).open(path))?;

    let journal_dir = match journal_dir {
        Some(dir) => dir.to_path_buf(),
        None => track!(journal::default_journal_dir(path))?,
    };
    let journal = track!(JournalDir::open(&journal_dir, false, false))?;

    let metrics = FsckMetrics::new(&MetricBuilder::new());
    track!(run(&journal, &file, &metrics, logger))
}

/// 保持済みのジャーナルディレクトリに対してリカバリ本体を実行する.
///
/// オープン時の暗黙のリカバリは、ハンドルが既に取得している
/// ディレクトリロックを流用してこちらを直接呼び出す.
pub(crate) fn run(
    journal: &JournalDir,
    file: &File,
    metrics: &FsckMetrics,
    logger: &Logger,
) -> Result<FsckResult> {
    let ids = track!(journal.list_record_ids())?;
    track_assert!(!ids.is_empty(), ErrorKind::NoJournal);

    let mut result = FsckResult::default();
    for id in ids {
        result.total += 1;
        let class = match File::open(journal.record_path(id)) {
            Ok(record_file) => record::classify_file(&record_file),
            Err(_) => RecordClass::Broken,
        };
        match class {
            RecordClass::Committed(record) => match track!(reapply(journal, file, &record)) {
                Ok(()) => {
                    result.reapplied += 1;
                    metrics.reapplied_records.increment();
                    info!(logger, "Reapplied a committed journal record";
                          "id" => id, "ops" => record.ops.len());
                }
                Err(e) => {
                    // 失敗したレコードは、後のパスで再試行できるように残す
                    result.apply_error += 1;
                    metrics.apply_errors.increment();
                    warn!(logger, "Cannot reapply a journal record: {}", e; "id" => id);
                }
            },
            RecordClass::InProgress => {
                result.in_progress += 1;
                metrics.discarded_in_progress.increment();
                discard(journal, id, "in_progress", logger);
            }
            RecordClass::Broken => {
                result.broken += 1;
                metrics.discarded_broken.increment();
                discard(journal, id, "broken", logger);
            }
            RecordClass::Corrupt => {
                result.corrupt += 1;
                metrics.discarded_corrupt.increment();
                discard(journal, id, "corrupt", logger);
            }
            RecordClass::Invalid => {
                result.invalid += 1;
                metrics.discarded_invalid.increment();
                discard(journal, id, "invalid", logger);
            }
        }
    }
    Ok(result)
}

/// コミット済みレコードの新データをデータファイルに書き直す.
fn reapply(journal: &JournalDir, file: &File, record: &TransRecord<Vec<u8>>) -> Result<()> {
    for op in &record.ops {
        track!(pio::write_full_at(file, &op.new, op.offset))?;
    }
    // 再適用はファイルの伸長を伴い得るため、常に全体を同期する
    track!(pio::sync_file(file))?;
    track!(journal.remove_record(record.id))?;
    Ok(())
}

fn discard(journal: &JournalDir, id: u32, class: &str, logger: &Logger) {
    match journal.remove_record(id) {
        Ok(()) => info!(logger, "Discarded a journal record"; "id" => id, "class" => class),
        Err(e) => warn!(logger, "Cannot unlink a discarded journal record: {}", e;
                        "id" => id, "class" => class),
    }
}
