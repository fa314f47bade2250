//! ロールバックエンジン.
//!
//! コミット時に捕捉された事前イメージから「逆方向」のトランザクションを
//! 構築し、それを通常のコミットエンジンに流すことで、コミット済み
//! トランザクションをアトミックに取り消す. 逆方向トランザクションには
//! `FLAG_ROLLBACKING`が立てられ、事前イメージの捕捉は行われない.
use trackable::error::ErrorKindExt;

use super::{commit, Transaction};
use crate::fs::JfsShared;
use crate::journal::record::{FLAG_LINGER, FLAG_NOLOCK, FLAG_NOROLLBACK, FLAG_ROLLBACKED, FLAG_ROLLBACKING};
use crate::lock::RangeLockSet;
use crate::pio;
use crate::{ErrorKind, Result};

pub(crate) fn rollback(trans: &mut Transaction<'_>) -> Result<u64> {
    track_assert!(
        trans.is_committed(),
        ErrorKind::InvalidInput,
        "The transaction has not been committed"
    );
    track_assert!(
        !trans.is_rollbacked(),
        ErrorKind::InvalidInput,
        "The transaction was already rollbacked"
    );
    track_assert_eq!(
        trans.flags & FLAG_NOROLLBACK,
        0,
        ErrorKind::InvalidInput,
        "The transaction was committed without pre-images"
    );

    let fs = trans.fs.shared();

    // lingering中のレコードを先に流し切り、巻き戻しが追い越さないようにする
    if trans.flags & FLAG_LINGER != 0 {
        track!(fs.sync_lingering())?;
    }

    let orig_file_len = track_assert_some!(trans.orig_file_len, ErrorKind::InconsistentState);

    // 逆方向トランザクション: 事前イメージを逆順で書き戻す.
    // 元のEOFより先にあった操作(実在バイト数ゼロ)は切り詰めだけで戻る.
    let reverse_flags = (trans.flags & FLAG_NOLOCK) | FLAG_NOROLLBACK | FLAG_ROLLBACKING;
    let mut reverse = Transaction::new(trans.fs, reverse_flags);
    for op in trans.ops.iter().rev() {
        let pre = track_assert_some!(op.pre, ErrorKind::InconsistentState);
        if pre.actual_len > 0 {
            track!(reverse.add(
                &trans.pre_buf[pre.start..pre.start + pre.actual_len],
                op.offset
            ))?;
        }
    }
    let written = if reverse.ops.is_empty() {
        0
    } else {
        track!(commit::commit(&mut reverse))?
    };

    // 元のトランザクションがファイルを伸長していた場合は、
    // 元の長さまで切り詰めて初めて巻き戻しが完結する
    if trans.grew {
        track!(truncate_to_original(fs, trans.flags, orig_file_len))?;
    }

    trans.flags |= FLAG_ROLLBACKED;
    fs.metrics.rollbacked_transactions.increment();
    Ok(written)
}

fn truncate_to_original(fs: &JfsShared, flags: u32, orig_file_len: u64) -> Result<()> {
    let mut locks = if flags & FLAG_NOLOCK == 0 {
        track!(RangeLockSet::acquire_grow_only(&fs.file))?
    } else {
        RangeLockSet::noop()
    };
    let result = track_io!(fs.file.set_len(orig_file_len)).and_then(|()| {
        fs.metrics.data_syncs.increment();
        track!(pio::sync_file(&fs.file))
    });
    let _ = locks.release(&fs.file);
    result.map_err(|e| ErrorKind::AtomicityBroken.cause(e).into())
}
