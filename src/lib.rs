//! Journaled I/O.
//!
//! `jourio`は、通常のファイルに対して「アトミックかつ永続的な複数範囲書き込み」を
//! 追加するためのユーザ空間ライブラリ.
//!
//! # 特徴
//!
//! - 一つのデータファイルの横に**ジャーナルディレクトリ**を併設し、
//!   複数のバイト範囲への書き込みを一つの[トランザクション][Transaction]として扱う
//! - コミットは「全範囲がディスクに到達した」時点でのみ成功し、
//!   途中でクラッシュした場合には、次回オープン時の[リカバリ][fsck]で
//!   完遂ないし破棄のいずれかに倒される
//! - 協調するプロセス間の直列化には、データファイルに対する
//!   アドバイザリバイト範囲ロックを使用する
//! - 事前イメージ(pre-image)を記録しておくことで、
//!   コミット済みトランザクションのアトミックな巻き戻しも可能
//! - **lingering**モードでは、ジャーナルの永続化のみでコミットを完了扱いにし、
//!   データファイルへの反映は後続のsync(ないしautosyncタスク)に委ねる
//!
//! # モジュールの依存関係
//!
//! ```text
//! fs => trans => {journal, lock} => pio
//!       fsck  => {journal}       => pio
//! ```
//!
//! - [fs]モジュール:
//!   - 主に[JournalFs]構造体を提供
//!   - `jourio`の利用者が直接触るのはこの構造体
//!   - オープン中のデータファイルとジャーナルディレクトリ、
//!     lingering中のレコード群、autosyncタスクを束ねる
//! - [trans]モジュール:
//!   - 主に[Transaction]構造体とコミット・ロールバックエンジンを提供
//! - [journal]モジュール:
//!   - ジャーナルディレクトリの管理と、レコードのオンディスク表現を提供
//! - [fsck]モジュール:
//!   - クラッシュ後に生き残ったレコード群を分類し、
//!     完遂・破棄を行うリカバリパスを提供
//!
//! [Transaction]: ./trans/struct.Transaction.html
//! [JournalFs]: ./fs/struct.JournalFs.html
//! [fs]: ./fs/index.html
//! [trans]: ./trans/index.html
//! [journal]: ./journal/index.html
//! [fsck]: ./fsck/index.html
#![warn(missing_docs)]
extern crate adler32;
extern crate byteorder;
extern crate libc;
extern crate prometrics;
#[cfg(test)]
extern crate tempdir;
#[macro_use]
extern crate trackable;
#[macro_use]
extern crate slog;

pub use crate::error::{Error, ErrorKind};

macro_rules! track_io {
    ($expr:expr) => {
        $expr.map_err(|e: ::std::io::Error| track!(crate::Error::from(e)))
    };
}

pub mod fs;
pub mod fsck;
pub mod journal;
pub mod metrics;
pub mod trans;

mod error;
mod lock;
mod pio;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
