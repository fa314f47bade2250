//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, Gauge, MetricBuilder};

/// コミットエンジンとlingeringキューのメトリクス.
#[derive(Debug, Clone)]
pub struct JournalFsMetrics {
    pub(crate) committed_transactions: Counter,
    pub(crate) cancelled_transactions: Counter,
    pub(crate) broken_transactions: Counter,
    pub(crate) rollbacked_transactions: Counter,
    pub(crate) written_bytes: Counter,
    pub(crate) data_syncs: Counter,
    pub(crate) lingering_records: Gauge,
    pub(crate) lingering_bytes: Gauge,
}
impl JournalFsMetrics {
    /// コミットに成功したトランザクションの総数.
    ///
    /// lingeringモードでは、ジャーナルが永続化された時点でカウントされる.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// jourio_fs_committed_transactions_total <COUNTER>
    /// ```
    pub fn committed_transactions(&self) -> u64 {
        self.committed_transactions.value() as u64
    }

    /// データファイルを変更せずに失敗したコミットの総数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// jourio_fs_cancelled_transactions_total <COUNTER>
    /// ```
    pub fn cancelled_transactions(&self) -> u64 {
        self.cancelled_transactions.value() as u64
    }

    /// アトミック性の保証を失った状態で失敗したコミットの総数.
    ///
    /// この値が増えた場合、次のリカバリパスでの完遂が期待されている.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// jourio_fs_broken_transactions_total <COUNTER>
    /// ```
    pub fn broken_transactions(&self) -> u64 {
        self.broken_transactions.value() as u64
    }

    /// ロールバックされたトランザクションの総数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// jourio_fs_rollbacked_transactions_total <COUNTER>
    /// ```
    pub fn rollbacked_transactions(&self) -> u64 {
        self.rollbacked_transactions.value() as u64
    }

    /// コミットによって書き込まれた新データの総バイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// jourio_fs_written_bytes_total <COUNTER>
    /// ```
    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.value() as u64
    }

    /// データファイルに対する同期命令の発行回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// jourio_fs_data_syncs_total <COUNTER>
    /// ```
    pub fn data_syncs(&self) -> u64 {
        self.data_syncs.value() as u64
    }

    /// 現在lingering中のレコード数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// jourio_fs_lingering_records <GAUGE>
    /// ```
    pub fn lingering_records(&self) -> u64 {
        self.lingering_records.value() as u64
    }

    /// 現在lingering中のレコードの合計バイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// jourio_fs_lingering_bytes <GAUGE>
    /// ```
    pub fn lingering_bytes(&self) -> u64 {
        self.lingering_bytes.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("jourio").subsystem("fs");
        JournalFsMetrics {
            committed_transactions: builder
                .counter("committed_transactions_total")
                .help("Number of successfully committed transactions")
                .finish()
                .expect("Never fails"),
            cancelled_transactions: builder
                .counter("cancelled_transactions_total")
                .help("Number of commits that failed with the data file untouched")
                .finish()
                .expect("Never fails"),
            broken_transactions: builder
                .counter("broken_transactions_total")
                .help("Number of commits that failed after the commit point")
                .finish()
                .expect("Never fails"),
            rollbacked_transactions: builder
                .counter("rollbacked_transactions_total")
                .help("Number of rollbacked transactions")
                .finish()
                .expect("Never fails"),
            written_bytes: builder
                .counter("written_bytes_total")
                .help("Number of new bytes written by commits")
                .finish()
                .expect("Never fails"),
            data_syncs: builder
                .counter("data_syncs_total")
                .help("Number of sync operations issued to the data file")
                .finish()
                .expect("Never fails"),
            lingering_records: builder
                .gauge("lingering_records")
                .help("Number of records waiting to be applied to the data file")
                .finish()
                .expect("Never fails"),
            lingering_bytes: builder
                .gauge("lingering_bytes")
                .help("Total bytes of the records waiting to be applied")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// リカバリパスのメトリクス.
#[derive(Debug, Clone)]
pub struct FsckMetrics {
    pub(crate) reapplied_records: Counter,
    pub(crate) apply_errors: Counter,
    pub(crate) discarded_invalid: Counter,
    pub(crate) discarded_in_progress: Counter,
    pub(crate) discarded_broken: Counter,
    pub(crate) discarded_corrupt: Counter,
}
impl FsckMetrics {
    /// 再適用されたコミット済みレコードの総数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// jourio_fsck_reapplied_records_total <COUNTER>
    /// ```
    pub fn reapplied_records(&self) -> u64 {
        self.reapplied_records.value() as u64
    }

    /// 再適用に失敗したレコードの総数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// jourio_fsck_apply_errors_total <COUNTER>
    /// ```
    pub fn apply_errors(&self) -> u64 {
        self.apply_errors.value() as u64
    }

    /// 破棄されたレコードの総数(分類別の合計).
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// jourio_fsck_discarded_records_total { class="invalid|in_progress|broken|corrupt" } <COUNTER>
    /// ```
    pub fn discarded_records(&self) -> u64 {
        self.discarded_invalid.value() as u64
            + self.discarded_in_progress.value() as u64
            + self.discarded_broken.value() as u64
            + self.discarded_corrupt.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("jourio").subsystem("fsck");
        let discarded = |class: &str| {
            builder
                .counter("discarded_records_total")
                .help("Number of discarded journal records")
                .label("class", class)
                .finish()
                .expect("Never fails")
        };
        FsckMetrics {
            reapplied_records: builder
                .counter("reapplied_records_total")
                .help("Number of committed journal records reapplied to the data file")
                .finish()
                .expect("Never fails"),
            apply_errors: builder
                .counter("apply_errors_total")
                .help("Number of journal records that failed to reapply")
                .finish()
                .expect("Never fails"),
            discarded_invalid: discarded("invalid"),
            discarded_in_progress: discarded("in_progress"),
            discarded_broken: discarded("broken"),
            discarded_corrupt: discarded("corrupt"),
        }
    }
}
