//! lingeringレコードを定期的に反映するバックグラウンドタスク.
//!
//! タスクは「指定間隔の経過」か「lingering中のバイト総量の閾値超過」の
//! 早い方で起床し、ハンドルのsync(lingeringキューの排出)を実行する.
//! 停止要求は同期的で、スレッドのjoinを待ってから戻る.
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::JfsShared;
use crate::{ErrorKind, Result};

#[derive(Debug)]
pub(crate) enum Command {
    Wake,
    Stop,
}

/// コミットエンジン側からautosyncタスクへ通知を送るためのハンドル.
///
/// `mpsc::Sender`は`Sync`ではないため、ハンドル共有部のミューテックスの
/// 中にだけ置かれる(`JournalFs`自体を`Sync`に保つ).
#[derive(Debug)]
pub(crate) struct Waker {
    tx: mpsc::Sender<Command>,
    pub max_bytes: u64,
}
impl Waker {
    /// バイト閾値の超過をタスクに通知する(タスク停止後の通知は単に捨てられる).
    pub fn wake(&self) {
        let _ = self.tx.send(Command::Wake);
    }

    fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}

/// 起動済みのautosyncタスク.
#[derive(Debug)]
pub(crate) struct AutosyncHandle {
    thread: thread::JoinHandle<()>,
}
impl AutosyncHandle {
    /// タスクに停止を要求し、スレッドをjoinする.
    ///
    /// 停止通知が送れなかった場合でも、送信側の破棄によって
    /// チャネルが切断されるため、タスクは必ず抜けてくる.
    pub fn stop(self, shared: &JfsShared) -> Result<()> {
        if let Some(waker) = shared.take_autosync_waker() {
            waker.stop();
        }
        track_assert!(
            self.thread.join().is_ok(),
            ErrorKind::Other,
            "The autosync thread panicked"
        );
        Ok(())
    }
}

/// autosyncタスクを起動する.
pub(crate) fn start(shared: Arc<JfsShared>, max_interval: Duration, max_bytes: u64) -> AutosyncHandle {
    let (tx, rx) = mpsc::channel();
    shared.set_autosync_waker(Some(Waker { tx, max_bytes }));

    let thread = thread::spawn(move || loop {
        match rx.recv_timeout(max_interval) {
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Command::Wake) | Err(RecvTimeoutError::Timeout) => {
                // フラッシュの失敗は致命的ではない: ジャーナルは永続済みなので、
                // 後続のsyncないしリカバリが追い付ける
                if let Err(e) = shared.sync_lingering() {
                    warn!(shared.logger, "Autosync flush failed: {}", e);
                }
            }
        }
    });
    AutosyncHandle { thread }
}
