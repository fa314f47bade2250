//! データファイルに対するバイト範囲ロックの管理.
//!
//! コミットエンジンは、データファイルへの書き込みに先立って、
//! トランザクションの操作範囲の和集合に対する排他ロックを取得する.
//! 取得は常にオフセット昇順で行われるため、同じ規律に従うプロセス同士で
//! デッドロックは発生しない.
//!
//! ファイルを伸長する操作は、さらに最大ファイルサイズの先の番兵バイトに対する
//! ロック(grow lock)も取得し、伸長操作同士を直列化する.
//!
//! ロックはアドバイザリであり、協調するプロセス同士でのみ意味を持つ.
//! また、POSIXの`fcntl`ロックの性質上、同一プロセス内の複数スレッド間では
//! 排他にならないことに注意.
use std::fs::File;

use crate::pio;
use crate::Result;

/// grow lock用の番兵バイトのオフセット.
///
/// `off_t`で表現可能な最大ファイルサイズの直前に置かれるため、
/// 通常の書き込み範囲と重なることはない.
const GROW_LOCK_OFFSET: u64 = i64::max_value() as u64 - 1;

/// 一操作が終端として取り得る最大のオフセット.
pub(crate) const MAX_FILE_SIZE: u64 = GROW_LOCK_OFFSET;

/// 一つのトランザクションが保持するロックの集合.
///
/// lingeringトランザクションの場合、この集合はレコードがデータファイルに
/// 反映されるまで(haltした状態機械の文脈の一部として)保持され続ける.
#[derive(Debug)]
pub(crate) struct RangeLockSet {
    extents: Vec<(u64, u64)>,
    grow: bool,
    released: bool,
}
impl RangeLockSet {
    /// 何もロックしない空の集合を返す(NOLOCKハンドル用).
    pub fn noop() -> RangeLockSet {
        RangeLockSet {
            extents: Vec::new(),
            grow: false,
            released: true,
        }
    }

    /// `extents`(オフセット, 長さ)の和集合に対する排他ロックを取得する.
    ///
    /// いずれかの範囲の終端が`file_len`を超える場合にはgrow lockも取得する.
    /// 途中で失敗した場合、取得済みのロックは解放された上でエラーが返される.
    pub fn acquire(file: &File, extents: &[(u64, u64)], file_len: u64) -> Result<RangeLockSet> {
        let extents = merge_extents(extents);
        let grow = extents.iter().any(|&(start, len)| start + len > file_len);

        let mut acquired = RangeLockSet {
            extents: Vec::with_capacity(extents.len()),
            grow,
            released: false,
        };
        for &(start, len) in &extents {
            if let Err(e) = track!(pio::lock_range(file, start, len)) {
                let _ = acquired.release(file);
                return Err(e);
            }
            acquired.extents.push((start, len));
        }
        if grow {
            if let Err(e) = track!(pio::lock_range(file, GROW_LOCK_OFFSET, 1)) {
                acquired.grow = false;
                let _ = acquired.release(file);
                return Err(e);
            }
        }
        Ok(acquired)
    }

    /// grow lockのみを取得する(ロールバック時の再切り詰め用).
    pub fn acquire_grow_only(file: &File) -> Result<RangeLockSet> {
        track!(pio::lock_range(file, GROW_LOCK_OFFSET, 1))?;
        Ok(RangeLockSet {
            extents: Vec::new(),
            grow: true,
            released: false,
        })
    }

    /// このロック集合がgrow lockを含んでいるかどうかを返す.
    ///
    /// 真の場合、対応するトランザクションはファイルを伸長する.
    pub fn grew(&self) -> bool {
        self.grow
    }

    /// ロック対象の全範囲を覆う`(オフセット, 長さ)`を返す.
    pub fn bounds(&self) -> Option<(u64, u64)> {
        let start = self.extents.first()?.0;
        let end = self.extents.iter().map(|&(s, l)| s + l).max()?;
        Some((start, end - start))
    }

    /// 保持している全ロックを解放する.
    pub fn release(&mut self, file: &File) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        for &(start, len) in &self.extents {
            track!(pio::unlock_range(file, start, len))?;
        }
        if self.grow {
            track!(pio::unlock_range(file, GROW_LOCK_OFFSET, 1))?;
        }
        Ok(())
    }
}

/// 範囲群をソートし、重なり合うもの・隣接するものを併合する.
fn merge_extents(extents: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut extents = extents.to_vec();
    extents.sort_unstable();

    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(extents.len());
    for (start, len) in extents {
        if let Some(last) = merged.last_mut() {
            if start <= last.0 + last.1 {
                let end = std::cmp::max(last.0 + last.1, start + len);
                last.1 = end - last.0;
                continue;
            }
        }
        merged.push((start, len));
    }
    merged
}
