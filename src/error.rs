use std;
use trackable;
use trackable::error::ErrorKindExt;

/// crate固有のエラー型.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(trackable::error::TrackableError<ErrorKind>);
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if let Some(e) = e.get_ref().and_then(|e| e.downcast_ref::<Error>()).cloned() {
            e
        } else {
            match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NoSuchFile.cause(e).into(),
                std::io::ErrorKind::InvalidInput => ErrorKind::InvalidInput.cause(e).into(),
                _ => ErrorKind::Other.cause(e).into(),
            }
        }
    }
}
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        if *e.kind() == ErrorKind::InvalidInput {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        } else {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        }
    }
}
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ErrorKind::InconsistentState.cause(e.to_string()).into()
    }
}

/// 発生し得るエラーの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// コミットに失敗したが、データファイルは一切変更されていない.
    ///
    /// 書き込みかけのジャーナルレコードは削除済みであり、
    /// ディスク上は「何も起きなかった」状態に保たれている.
    ///
    /// # 典型的な対応策
    ///
    /// - 原因(I/Oエラー等)を取り除いた上で、トランザクションを再コミットする
    CommitCancelled,

    /// コミットが途中で失敗し、データファイルの内容は保証できない.
    ///
    /// ジャーナルレコード自体はコミット済みとしてディスク上に残っているため、
    /// 次のリカバリパスが反映を完遂すれば、可視状態はコミット後のものに揃う.
    ///
    /// # 典型的な対応策
    ///
    /// - ハンドルを閉じて開き直す(オープン時にリカバリが走る)か、
    ///   明示的に[`fsck`](../fsck/fn.fsck.html)を実行する
    AtomicityBroken,

    /// 対象のデータファイルが存在しない.
    NoSuchFile,

    /// ジャーナルディレクトリが存在しないか、レコードを一つも含んでいない.
    ///
    /// リカバリ対象が無いことを意味するだけなので、
    /// オープン処理はこのエラーを無視して構わない.
    NoJournal,

    /// ジャーナルディレクトリが他のハンドルないしプロセスによって使用中.
    ///
    /// # 典型的な対応策
    ///
    /// - 既存のハンドルを閉じてから再試行する
    Busy,

    /// ジャーナルディレクトリの構造が壊れている.
    ///
    /// 例えば、レコードファイルが存在するのにIDカウンタファイルが無い、等.
    /// (個々のレコードの破損はリカバリパスが分類・集計するため、
    /// このエラーにはならない.)
    ///
    /// # 典型的な対応策
    ///
    /// - もし人手で復旧可能な場合には復旧する
    /// - それが無理であれば、ジャーナルディレクトリを破棄して作り直す
    JournalCorrupted,

    /// 入力ないし操作手順が不正.
    ///
    /// 長さゼロの操作の追加、コミット済みトランザクションの再コミット、
    /// autosyncタスクの二重起動、読み取り専用ハンドルへの書き込み、等.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正する
    InvalidInput,

    /// 内部状態が不整合に陥っている.
    ///
    /// プログラムにバグがあることを示している.
    InconsistentState,

    /// その他エラー.
    ///
    /// E.g., I/Oエラー
    Other,
}
impl trackable::error::ErrorKind for ErrorKind {}
