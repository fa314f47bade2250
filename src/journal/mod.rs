//! ジャーナルディレクトリの管理と、レコードのオンディスク表現.
//!
//! データファイル一つにつき、一つのジャーナルディレクトリが対応する.
//! ディレクトリの中身は次の三種類のファイルのみ:
//!
//! - ライブなトランザクション毎のレコードファイル(ファイル名は10進数のレコードID)
//! - [`COUNT_FILE_NAME`](constant.COUNT_FILE_NAME.html):
//!   最後に割り当てたIDを保持するカウンタファイル
//! - [`LOCK_FILE_NAME`](constant.LOCK_FILE_NAME.html):
//!   オープン中のハンドルがセッションの間`flock(2)`で保持するロックファイル
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub use self::record::{RecordClass, RecordOp, TransRecord};

use crate::pio::{self, FlockMode};
use crate::{ErrorKind, Result};

pub mod record;

/// IDカウンタファイルの名前.
pub const COUNT_FILE_NAME: &str = "count";

/// セッションロックファイルの名前.
pub const LOCK_FILE_NAME: &str = "lock";

/// データファイルに対応するデフォルトのジャーナルディレクトリのパスを返す.
///
/// `dir/name`というデータファイルに対しては`dir/.name.jrn`となる.
pub fn default_journal_dir<P: AsRef<Path>>(data_path: P) -> Result<PathBuf> {
    let data_path = data_path.as_ref();
    let name = track_assert_some!(
        data_path.file_name().and_then(|n| n.to_str()),
        ErrorKind::InvalidInput,
        "Invalid data file path: {:?}",
        data_path
    );
    let parent = data_path.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!(".{}.jrn", name)))
}

/// 一つのデータファイルに紐づくジャーナルディレクトリ.
///
/// インスタンスが生きている間、セッションロックを保持し続ける.
#[derive(Debug)]
pub struct JournalDir {
    dir: PathBuf,
    _lock_file: File,
    count_file: Mutex<File>,
}
impl JournalDir {
    /// ジャーナルディレクトリを開く. 存在しない場合、`create`が真ならば作成する.
    ///
    /// セッションロックはノンブロッキングで取得され、競合する場合には
    /// `ErrorKind::Busy`が返される. `read_only`が真の場合は共有モードで
    /// 取得されるため、読み取り専用ハンドル同士は共存できる.
    ///
    /// # Errors
    ///
    /// - ディレクトリが存在せず`create`も偽の場合: `ErrorKind::NoJournal`
    /// - カウンタファイルが無いのにレコードファイルが存在する場合:
    ///   `ErrorKind::JournalCorrupted`
    ///   (次のIDを推測するよりも、オープンを拒否する方に倒している)
    pub fn open<P: AsRef<Path>>(dir: P, create: bool, read_only: bool) -> Result<JournalDir> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            track_assert!(create, ErrorKind::NoJournal; dir);
            track_io!(fs::create_dir_all(&dir))?;
        }

        let lock_file = track_io!(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(LOCK_FILE_NAME)))?;
        let mode = if read_only {
            FlockMode::Shared
        } else {
            FlockMode::Exclusive
        };
        track!(pio::flock_nonblocking(&lock_file, mode))?;

        let count_path = dir.join(COUNT_FILE_NAME);
        if !count_path.is_file() {
            let survivors = track!(list_record_ids(&dir))?;
            track_assert!(
                survivors.is_empty(),
                ErrorKind::JournalCorrupted,
                "The ID counter file is missing but {} record file(s) exist: {:?}",
                survivors.len(),
                dir
            );
            let count_file = track_io!(OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&count_path))?;
            track!(pio::write_full_at(&count_file, &[0; 4], 0))?;
        }
        let count_file = track_io!(OpenOptions::new().read(true).write(true).open(&count_path))?;

        Ok(JournalDir {
            dir,
            _lock_file: lock_file,
            count_file: Mutex::new(count_file),
        })
    }

    /// ジャーナルディレクトリのパスを返す.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// 新しいレコードIDを割り当てる.
    ///
    /// カウンタファイル上の排他ロックの下でインクリメントと書き戻しを行うため、
    /// 協調するプロセス間でも重複しない(プロセス内はミューテックスで直列化される).
    pub fn next_id(&self) -> Result<u32> {
        let count_file = self.count_file.lock().map_err(crate::Error::from)?;
        track!(pio::flock_exclusive(&count_file))?;
        let result = next_id_locked(&count_file);
        track!(pio::funlock(&count_file))?;
        result
    }

    /// 指定されたIDのレコードファイルのパスを返す.
    pub fn record_path(&self, id: u32) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// 指定されたIDのレコードファイルを新規に作成する.
    pub fn create_record_file(&self, id: u32) -> Result<File> {
        track_io!(OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.record_path(id)))
    }

    /// ディレクトリ内に存在するレコードファイルのIDを昇順で返す.
    ///
    /// IDの昇順はコミット順と一致するため、リカバリはこの順序で再適用を行う.
    pub fn list_record_ids(&self) -> Result<Vec<u32>> {
        track!(list_record_ids(&self.dir))
    }

    /// 指定されたIDのレコードファイルを削除し、ディレクトリを同期する.
    pub fn remove_record(&self, id: u32) -> Result<()> {
        track_io!(fs::remove_file(self.record_path(id)))?;
        track!(pio::sync_dir(&self.dir))?;
        Ok(())
    }

    /// ディレクトリエントリの変更を安定ストレージに同期する.
    pub fn sync(&self) -> Result<()> {
        track!(pio::sync_dir(&self.dir))
    }

    /// ジャーナルディレクトリを`new_dir`に移設する.
    ///
    /// レコードファイルとカウンタファイルをrenameで移し、
    /// 新しいディレクトリでセッションロックを取り直した後に、
    /// 古いディレクトリを削除する.
    ///
    /// 呼び出し側(ハンドル)は、実行中のトランザクションや
    /// lingering中のレコードが無いこと(quiesced)を保証する必要がある.
    pub fn move_to<P: AsRef<Path>>(&mut self, new_dir: P) -> Result<()> {
        let new_dir = new_dir.as_ref().to_path_buf();
        track_io!(fs::create_dir_all(&new_dir))?;

        let new_lock_file = track_io!(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(new_dir.join(LOCK_FILE_NAME)))?;
        track!(pio::flock_nonblocking(&new_lock_file, FlockMode::Exclusive))?;

        track_io!(fs::rename(
            self.dir.join(COUNT_FILE_NAME),
            new_dir.join(COUNT_FILE_NAME)
        ))?;
        for id in track!(list_record_ids(&self.dir))? {
            track_io!(fs::rename(
                self.dir.join(id.to_string()),
                new_dir.join(id.to_string())
            ))?;
        }
        track!(pio::sync_dir(&new_dir))?;

        track_io!(fs::remove_file(self.dir.join(LOCK_FILE_NAME)))?;
        track_io!(fs::remove_dir(&self.dir))?;
        if let Some(parent) = self.dir.parent() {
            track!(pio::sync_dir(parent))?;
        }

        // rename後もカウンタファイルのディスクリプタは同じinodeを指したままなので
        // 開き直しは不要
        self.dir = new_dir;
        self._lock_file = new_lock_file;
        Ok(())
    }
}

fn next_id_locked(count_file: &File) -> Result<u32> {
    let mut buf = [0; 4];
    let read = track!(pio::read_full_at(count_file, &mut buf, 0))?;
    track_assert_eq!(read, 4, ErrorKind::JournalCorrupted, "Truncated ID counter");

    let last = LittleEndian::read_u32(&buf);
    let id = track_assert_some!(
        last.checked_add(1),
        ErrorKind::Other,
        "The ID counter reached its maximum"
    );
    LittleEndian::write_u32(&mut buf, id);
    track!(pio::write_full_at(count_file, &buf, 0))?;
    Ok(id)
}

fn list_record_ids(dir: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in track_io!(fs::read_dir(dir))? {
        let entry = track_io!(entry)?;
        if let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
