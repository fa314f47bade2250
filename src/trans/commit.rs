//! コミットエンジン.
//!
//! 一つのトランザクションは、以下の状態機械を経てディスクに反映される:
//!
//! ```text
//! NEW ──add*──> STAGED ──ロック取得──> LOCKED
//!  LOCKED ──ジャーナル書き込み──> JOURNALED
//!  JOURNALED ──committedビット──> DURABLE_JOURNAL   (コミットポイント)
//!  DURABLE_JOURNAL ──データ書き込み──> APPLIED
//!  APPLIED ──データ同期──> DATA_DURABLE
//!  DATA_DURABLE ──レコード削除──> DONE
//! ```
//!
//! 各ステップの後には明示的な永続化バリアが置かれる.
//! DURABLE_JOURNALより前の失敗では書きかけのレコードが削除され、
//! ディスクは「何も起きなかった」状態に保たれる
//! ([`ErrorKind::CommitCancelled`]).
//! それ以降の失敗ではジャーナルがコミット済みとして残り、
//! 次のリカバリパスが反映を完遂する([`ErrorKind::AtomicityBroken`]).
//!
//! lingeringハンドルでは状態機械はDURABLE_JOURNALで停止し、
//! 「ジャーナルID・操作列・保持中のロック」という再開に必要な文脈が
//! ハンドルのlingeringキューに積まれる. 後続のsyncがDONEまでを再開する.
//!
//! [`ErrorKind::CommitCancelled`]: ../enum.ErrorKind.html#variant.CommitCancelled
//! [`ErrorKind::AtomicityBroken`]: ../enum.ErrorKind.html#variant.AtomicityBroken
use std::fs::File;
use std::mem;
use trackable::error::ErrorKindExt;

use super::Transaction;
use crate::fs::{JfsShared, LingerRecord};
use crate::journal::record::{
    RecordOp, TransRecord, FLAG_COMMITTED, FLAG_LINGER, FLAG_NOLOCK, FLAG_NOROLLBACK, FLAG_RDONLY,
    FLAG_ROLLBACKED, FLAG_ROLLBACKING,
};
use crate::lock::RangeLockSet;
use crate::pio;
use crate::{Error, ErrorKind, Result};

pub(crate) fn commit(trans: &mut Transaction<'_>) -> Result<u64> {
    track_assert!(!trans.ops.is_empty(), ErrorKind::InvalidInput, "Empty transaction");
    track_assert_eq!(
        trans.flags & (FLAG_COMMITTED | FLAG_ROLLBACKED),
        0,
        ErrorKind::InvalidInput,
        "The transaction was already committed or rollbacked"
    );
    track_assert_eq!(
        trans.flags & FLAG_RDONLY,
        0,
        ErrorKind::InvalidInput,
        "The handle is read-only"
    );

    let fs = trans.fs.shared();
    let extents: Vec<(u64, u64)> = trans.ops.iter().map(|op| (op.offset, op.len)).collect();

    // LOCKED: 操作範囲の和集合をオフセット昇順でロックする
    let mut locks = RangeLockSet::noop();
    let file_len = match track_io!(fs.file.metadata()) {
        Ok(metadata) => metadata.len(),
        Err(e) => return Err(cancelled(fs, &mut locks, None, e)),
    };
    if trans.flags & FLAG_NOLOCK == 0 {
        locks = match track!(RangeLockSet::acquire(&fs.file, &extents, file_len)) {
            Ok(locks) => locks,
            Err(e) => return Err(cancelled(fs, &mut locks, None, e)),
        };
    }
    let grew = extents.iter().any(|&(start, len)| start + len > file_len);
    let bounds = union_bounds(&extents);
    trans.orig_file_len = Some(file_len);
    trans.grew = grew;

    // 事前イメージの捕捉は、ロック取得後・ジャーナル書き込み前
    if trans.flags & FLAG_NOROLLBACK == 0 {
        if let Err(e) = track!(trans.capture_pre_images(&fs.file)) {
            return Err(cancelled(fs, &mut locks, None, e));
        }
    }

    let id = match track!(fs.journal.next_id()) {
        Ok(id) => id,
        Err(e) => return Err(cancelled(fs, &mut locks, None, e)),
    };
    trans.id = Some(id);

    {
        let record = TransRecord {
            id,
            flags: trans.flags & (FLAG_NOROLLBACK | FLAG_ROLLBACKING),
            ops: trans
                .ops
                .iter()
                .map(|op| RecordOp {
                    offset: op.offset,
                    new: &op.buf[..],
                    old: op
                        .pre
                        .map(|pre| &trans.pre_buf[pre.start..pre.start + op.buf.len()]),
                })
                .collect(),
        };

        // JOURNALED: レコード本体とディレクトリエントリを永続化する
        let record_file = match track!(stage_record(fs, &record)) {
            Ok(file) => file,
            Err(e) => return Err(cancelled(fs, &mut locks, Some(id), e)),
        };

        // DURABLE_JOURNAL: committedビットの永続化がコミットポイント
        if let Err(e) = track!(record.commit_to(&record_file)) {
            // ビットが永続化されたかどうかは不明だが、レコード自体を
            // 消せればディスクは未変更のままなのでアトミック性は保たれる
            if fs.journal.remove_record(id).is_ok() {
                return Err(cancelled(fs, &mut locks, None, e));
            }
            return Err(broken(fs, &mut locks, e));
        }
    }

    trans.flags |= FLAG_COMMITTED;
    fs.metrics.committed_transactions.increment();
    fs.metrics.written_bytes.add_u64(trans.total_bytes);

    // lingering: ジャーナルのみで論理コミットは永続済み.
    // データファイルへの反映はsync(ないしautosync)まで先送りし、
    // その間、取得済みのロックはレコードと共に保持され続ける.
    if trans.flags & FLAG_LINGER != 0 && trans.flags & FLAG_ROLLBACKING == 0 {
        let ops = trans
            .ops
            .iter_mut()
            .map(|op| (mem::take(&mut op.buf), op.offset))
            .collect();
        fs.enqueue_linger(LingerRecord {
            id,
            ops,
            locks,
            grew,
            bounds,
            bytes: trans.total_bytes,
        });
        return Ok(trans.total_bytes);
    }

    // APPLIED: 追加順に書き込む(重複範囲は後の操作が勝つ)
    for op in &trans.ops {
        if let Err(e) = track!(pio::write_full_at(&fs.file, &op.buf, op.offset)) {
            return Err(broken(fs, &mut locks, e));
        }
    }

    // DATA_DURABLE
    fs.metrics.data_syncs.increment();
    let sync_result = if grew {
        // ファイルを伸長した場合はサイズ(メタデータ)の永続化も必要
        track!(pio::sync_file(&fs.file))
    } else {
        track!(pio::sync_range(&fs.file, fs.sync_mode, bounds.0, bounds.1))
    };
    if let Err(e) = sync_result {
        return Err(broken(fs, &mut locks, e));
    }

    // DONE
    if let Err(e) = track!(fs.journal.remove_record(id)) {
        return Err(broken(fs, &mut locks, e));
    }
    track!(locks.release(&fs.file))?;
    Ok(trans.total_bytes)
}

/// レコードファイルを作成し、未コミット状態の全体像とディレクトリエントリを
/// 永続化する.
fn stage_record(fs: &JfsShared, record: &TransRecord<&[u8]>) -> Result<File> {
    let file = track!(fs.journal.create_record_file(record.id))?;
    track!(record.stage_to(&file))?;
    track!(fs.journal.sync())?;
    Ok(file)
}

fn union_bounds(extents: &[(u64, u64)]) -> (u64, u64) {
    let start = extents.iter().map(|&(start, _)| start).min().unwrap_or(0);
    let end = extents.iter().map(|&(start, len)| start + len).max().unwrap_or(0);
    (start, end - start)
}

/// コミットポイント前の失敗: 書きかけのレコードを消し、ロックを解放する.
/// ディスクは未変更のまま.
fn cancelled(fs: &JfsShared, locks: &mut RangeLockSet, record_id: Option<u32>, e: Error) -> Error {
    if let Some(id) = record_id {
        let _ = fs.journal.remove_record(id);
    }
    let _ = locks.release(&fs.file);
    fs.metrics.cancelled_transactions.increment();
    ErrorKind::CommitCancelled.cause(e).into()
}

/// コミットポイント後の失敗: ジャーナルはコミット済みとして残し、
/// 次のリカバリパスに反映の完遂を委ねる.
fn broken(fs: &JfsShared, locks: &mut RangeLockSet, e: Error) -> Error {
    let _ = locks.release(&fs.file);
    fs.metrics.broken_transactions.increment();
    ErrorKind::AtomicityBroken.cause(e).into()
}
