use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{JfsShared, JournalFs, LingerQueue};
use crate::fsck;
use crate::journal::record::{FLAG_LINGER, FLAG_NOLOCK, FLAG_NOROLLBACK, FLAG_RDONLY};
use crate::journal::{self, JournalDir};
use crate::metrics::{FsckMetrics, JournalFsMetrics};
use crate::pio::SyncMode;
use crate::{ErrorKind, Result};

/// [`JournalFs`](struct.JournalFs.html)のビルダ.
#[derive(Debug, Clone)]
pub struct JournalFsBuilder {
    create: bool,
    read_only: bool,
    nolock: bool,
    norollback: bool,
    linger: bool,
    journal_dir: Option<PathBuf>,
    logger: Logger,
    metrics: MetricBuilder,
}
impl JournalFsBuilder {
    /// デフォルト設定で`JournalFsBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        JournalFsBuilder {
            create: true,
            read_only: false,
            nolock: false,
            norollback: false,
            linger: false,
            journal_dir: None,
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// データファイルが存在しない場合に新規作成するかどうかを設定する.
    ///
    /// デフォルトでは作成する.
    pub fn create(&mut self, enabled: bool) -> &mut Self {
        self.create = enabled;
        self
    }

    /// 読み取り専用ハンドルとして開くかどうかを設定する.
    ///
    /// 読み取り専用ハンドルは全ての変更操作を拒否し、
    /// オープン時の暗黙のリカバリも行わない.
    /// セッションロックは共有モードで取得されるため、
    /// 読み取り専用ハンドル同士は共存できる.
    ///
    /// デフォルトでは読み書き両用.
    pub fn read_only(&mut self, enabled: bool) -> &mut Self {
        self.read_only = enabled;
        self
    }

    /// コミット時のバイト範囲ロックをスキップするかどうかを設定する.
    ///
    /// 有効にした場合、他プロセスとの直列化は呼び出し側の責任となる.
    ///
    /// デフォルトではロックを行う.
    pub fn nolock(&mut self, enabled: bool) -> &mut Self {
        self.nolock = enabled;
        self
    }

    /// 事前イメージの捕捉を省略するかどうかを設定する.
    ///
    /// 有効にした場合、コミットは速くなるがロールバックは不可能になる.
    ///
    /// デフォルトでは捕捉する.
    pub fn norollback(&mut self, enabled: bool) -> &mut Self {
        self.norollback = enabled;
        self
    }

    /// lingeringトランザクションを使うかどうかを設定する.
    ///
    /// 有効にした場合、コミットはジャーナルの永続化をもって成功となり、
    /// データファイルへの反映は後続の[`sync`]ないしautosyncタスクに
    /// 委ねられる. スループットと引き換えに、データファイル自体の
    /// 最新性は保証されなくなる(ジャーナルとの組で常に復元可能).
    ///
    /// デフォルトでは使わない.
    ///
    /// [`sync`]: struct.JournalFs.html#method.sync
    pub fn linger(&mut self, enabled: bool) -> &mut Self {
        self.linger = enabled;
        self
    }

    /// ジャーナルディレクトリのパスを設定する.
    ///
    /// デフォルトでは、データファイル`dir/name`に対して`dir/.name.jrn`が使われる.
    pub fn journal_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.journal_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// ハンドル用のロガーを登録する.
    ///
    /// リカバリ結果、autosyncのエラー等がこのロガーに出力される.
    ///
    /// デフォルトでは何も出力されない.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    ///
    /// デフォルト値は`MetricBuilder::new()`.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// データファイルを開き、`JournalFs`インスタンスを生成する.
    ///
    /// ジャーナルディレクトリが存在しない場合には作成される.
    /// 読み取り専用でなければ、生き残ったジャーナルレコードに対する
    /// リカバリパスがこの時点で実行される.
    ///
    /// # Errors
    ///
    /// - `ErrorKind::NoSuchFile`:
    ///   データファイルが存在せず、`create`も無効
    /// - `ErrorKind::Busy`:
    ///   同じジャーナルディレクトリが既に他のハンドルに使われている
    /// - `ErrorKind::JournalCorrupted`:
    ///   ジャーナルディレクトリの構造が壊れている
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<JournalFs> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true);
        if !self.read_only {
            options.write(true);
            if self.create {
                options.create(true);
            }
        }
        let file = track_io!(options.open(&path))?;
        let sync_mode = SyncMode::probe(&file);

        let journal_dir = match &self.journal_dir {
            Some(dir) => dir.clone(),
            None => track!(journal::default_journal_dir(&path))?,
        };
        let journal = track!(JournalDir::open(&journal_dir, true, self.read_only))?;

        let mut flags = 0;
        if self.nolock {
            flags |= FLAG_NOLOCK;
        }
        if self.norollback {
            flags |= FLAG_NOROLLBACK;
        }
        if self.linger {
            flags |= FLAG_LINGER;
        }
        if self.read_only {
            flags |= FLAG_RDONLY;
        }

        let shared = JfsShared {
            file,
            path,
            journal,
            flags,
            sync_mode,
            metrics: JournalFsMetrics::new(&self.metrics),
            logger: self.logger.clone(),
            linger: Mutex::new(LingerQueue::default()),
            autosync_waker: Mutex::new(None),
            drain_lock: Mutex::new(()),
        };

        if !self.read_only {
            let fsck_metrics = FsckMetrics::new(&self.metrics);
            match fsck::run(&shared.journal, &shared.file, &fsck_metrics, &shared.logger) {
                Ok(result) => {
                    info!(shared.logger, "Journal recovery finished";
                          "total" => result.total,
                          "reapplied" => result.reapplied,
                          "in_progress" => result.in_progress,
                          "broken" => result.broken,
                          "corrupt" => result.corrupt,
                          "invalid" => result.invalid,
                          "apply_error" => result.apply_error);
                    track_assert_eq!(result.apply_error, 0, ErrorKind::AtomicityBroken);
                }
                Err(e) => {
                    // リカバリ対象が無いのは正常(新規作成直後等)
                    if *e.kind() != ErrorKind::NoJournal {
                        return Err(track!(e));
                    }
                }
            }
        }

        Ok(JournalFs {
            shared: Arc::new(shared),
            autosync: None,
        })
    }
}
impl Default for JournalFsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
