//! トランザクションと、そのコミット・ロールバックエンジン.
//!
//! [`Transaction`](struct.Transaction.html)は「まだコミットされていない、
//! 位置指定書き込みのバッチ」を表現する. 空の状態で生成し、
//! [`add`](struct.Transaction.html#method.add)で操作を積み、
//! [`commit`](struct.Transaction.html#method.commit)で一括して永続化する.
//!
//! コミットの状態機械は[`commit`]サブモジュール、
//! 事前イメージからの巻き戻しは[`rollback`]サブモジュールが実装している.
//!
//! [`commit`]: ../fs/struct.JournalFs.html#method.transaction
//! [`rollback`]: struct.Transaction.html#method.rollback
use std::fs::File;

use crate::fs::JournalFs;
use crate::journal::record::{FLAG_COMMITTED, FLAG_RDONLY, FLAG_ROLLBACKED};
use crate::lock::MAX_FILE_SIZE;
use crate::pio;
use crate::{ErrorKind, Result};

mod commit;
mod rollback;

/// 事前イメージのアリーナ(`Transaction::pre_buf`)内での位置.
#[derive(Debug, Clone, Copy)]
struct PreImageIndex {
    /// アリーナ内での開始位置.
    start: usize,

    /// 書き込み前に実在していたバイト数.
    ///
    /// 操作の範囲がEOFを越えていた場合、操作の長さより短くなる.
    actual_len: usize,
}

/// トランザクション内の一操作.
#[derive(Debug)]
struct TransOp {
    /// 書き込まれる新しいバイト列.
    ///
    /// lingeringコミットでは、ジャーナル永続化後に
    /// 中身がlingeringキューへ移動される.
    buf: Vec<u8>,

    /// 操作の長さ(バイト単位). `buf`の中身が移動された後も保持される.
    len: u64,

    /// データファイル内の書き込み先オフセット.
    offset: u64,

    /// コミット時に捕捉された事前イメージの位置.
    pre: Option<PreImageIndex>,
}

/// 一括でアトミックに適用される、位置指定書き込みのバッチ.
///
/// 所有者は一人であることが前提で、同一インスタンスを複数スレッドから
/// 同時に操作することはできない(ハンドルが同じでも、別々のトランザクション
/// であれば並行してコミットできる).
#[derive(Debug)]
pub struct Transaction<'a> {
    fs: &'a JournalFs,
    flags: u32,
    ops: Vec<TransOp>,
    total_bytes: u64,
    id: Option<u32>,
    pre_buf: Vec<u8>,
    orig_file_len: Option<u64>,
    grew: bool,
}
impl<'a> Transaction<'a> {
    pub(crate) fn new(fs: &'a JournalFs, flags: u32) -> Transaction<'a> {
        Transaction {
            fs,
            flags,
            ops: Vec::new(),
            total_bytes: 0,
            id: None,
            pre_buf: Vec::new(),
            orig_file_len: None,
            grew: false,
        }
    }

    /// 操作を一つ追加する. `buf`の内容はコピーされる.
    ///
    /// 操作同士の範囲は重なっていても構わない. その場合、
    /// 後から追加された操作の内容が適用時に優先される.
    ///
    /// # Errors
    ///
    /// 以下の場合には、種類が`ErrorKind::InvalidInput`のエラーが返される:
    ///
    /// - `buf`が空
    /// - 書き込み範囲の終端が最大ファイルサイズを超えている
    /// - トランザクションが既にコミットないしロールバックされている
    /// - ハンドルが読み取り専用
    pub fn add(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        track_assert!(!buf.is_empty(), ErrorKind::InvalidInput);
        track_assert_eq!(
            self.flags & (FLAG_COMMITTED | FLAG_ROLLBACKED),
            0,
            ErrorKind::InvalidInput,
            "The transaction was already committed or rollbacked"
        );
        track_assert_eq!(
            self.flags & FLAG_RDONLY,
            0,
            ErrorKind::InvalidInput,
            "The handle is read-only"
        );
        let len = buf.len() as u64;
        track_assert!(
            offset.checked_add(len).map_or(false, |end| end <= MAX_FILE_SIZE),
            ErrorKind::InvalidInput;
            offset, len
        );

        self.ops.push(TransOp {
            buf: buf.to_vec(),
            len,
            offset,
            pre: None,
        });
        self.total_bytes += len;
        Ok(())
    }

    /// トランザクションをコミットする.
    ///
    /// 追加されたすべての操作が、追加された順序でディスクに書き込まれる.
    /// 成功時には書き込まれた新データの総バイト数が返り、それ以降
    /// データの永続性を信頼してよい(lingeringモードではジャーナルの永続化を
    /// もって成功となり、データファイルへの反映は後続のsyncに委ねられる).
    ///
    /// # Errors
    ///
    /// - `ErrorKind::CommitCancelled`:
    ///   コミットは失敗したが、データファイルは一切変更されていない
    /// - `ErrorKind::AtomicityBroken`:
    ///   コミットポイント通過後に失敗した. ジャーナルはコミット済みとして
    ///   残っているため、次のリカバリパスで反映が完遂される
    ///
    /// 呼び出し側はこの二つを区別して扱う必要がある
    /// (後者の場合のみリカバリが必須となる).
    pub fn commit(&mut self) -> Result<u64> {
        track!(commit::commit(self))
    }

    /// コミット済みのトランザクションをアトミックに巻き戻す.
    ///
    /// コミット時に捕捉した事前イメージから逆方向のトランザクションを構築し、
    /// 通常のコミットと同じ経路で適用する. トランザクションがファイルを
    /// 伸長していた場合には、最後に元の長さまで切り詰められる.
    ///
    /// 事前イメージ無し(norollback)でコミットされたトランザクション、
    /// および未コミット・ロールバック済みのトランザクションに対しては
    /// `ErrorKind::InvalidInput`が返される.
    ///
    /// 返り値の規約は[`commit`](#method.commit)と同様.
    pub fn rollback(&mut self) -> Result<u64> {
        track!(rollback::rollback(self))
    }

    /// このトランザクションがコミット済みかどうかを返す.
    pub fn is_committed(&self) -> bool {
        self.flags & FLAG_COMMITTED != 0
    }

    /// このトランザクションがロールバック済みかどうかを返す.
    pub fn is_rollbacked(&self) -> bool {
        self.flags & FLAG_ROLLBACKED != 0
    }

    /// 追加済みの操作の総バイト数を返す.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// ジャーナルレコードに割り当てられたIDを返す(未割り当てなら`None`).
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// 各操作の範囲の現在の内容をデータファイルから読み出して保存する.
    ///
    /// EOF近傍の短い読み込みは、実在したバイト数を記録した上で
    /// 操作の長さまで0でパディングされる(ディスク上のレイアウトを
    /// 一定に保つため). 事前イメージは単一の伸長バッファに連結して
    /// 保持され、操作毎にはその中の位置だけを記録する.
    fn capture_pre_images(&mut self, file: &File) -> Result<()> {
        let ops = &mut self.ops;
        let pre_buf = &mut self.pre_buf;
        for op in ops.iter_mut() {
            let start = pre_buf.len();
            pre_buf.resize(start + op.buf.len(), 0);
            let actual_len = track!(pio::read_full_at(file, &mut pre_buf[start..], op.offset))?;
            op.pre = Some(PreImageIndex { start, actual_len });
        }
        Ok(())
    }
}
