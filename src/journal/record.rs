//! ジャーナルレコードのオンディスク表現.
//!
//! 一つのレコードは一つのトランザクションに対応し、ジャーナルディレクトリ内の
//! 独立したファイルとして保存される. レイアウトは以下の通り(リトルエンディアン):
//!
//! ```text
//! header:
//!   magic     u32
//!   version   u32
//!   flags     u32   (FLAG_COMMITTEDビットがコミットポイント)
//!   num_ops   u32
//!   trans_id  u32
//! 操作(num_ops個):
//!   length    u64
//!   offset    u64
//!   new_bytes [length]
//!   old_bytes [length]   (事前イメージ; FLAG_NOROLLBACK時は省略)
//! trailer:
//!   checksum  u32
//! ```
//!
//! 書き込みは二段階で行われる: まずFLAG_COMMITTEDを落とした全体像を書いて
//! `fdatasync`し、その後ヘッダだけをFLAG_COMMITTED付きで書き直して再度
//! `fdatasync`する. チェックサムはコミット後のヘッダを前提に計算されるため、
//! 「committedビットが立っていて、かつチェックサムが一致する」レコードだけが
//! 再適用の対象となる.
use adler32::RollingAdler32;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::Read;

use crate::pio;
use crate::{ErrorKind, Result};

/// レコードファイルの先頭に書き込まれるマジックナンバー.
///
/// リトルエンディアンで`"JRN1"`というバイト列になる.
pub const MAGIC_NUMBER: u32 = 0x314E_524A;

/// レコードフォーマットの現在のバージョン.
///
/// バージョンが異なるレコード同士のデータ形式には互換性が無い.
pub const VERSION: u32 = 1;

/// ヘッダのサイズ(バイト単位).
pub const HEADER_SIZE: usize = 4 /* magic */ + 4 /* version */ + 4 /* flags */
    + 4 /* num_ops */ + 4 /* trans_id */;

/// 操作一つあたりの固定部のサイズ(バイト単位).
pub const OP_FIXED_SIZE: usize = 8 /* length */ + 8 /* offset */;

/// トレイラ(チェックサム)のサイズ(バイト単位).
pub const TRAILER_SIZE: usize = 4;

/// 範囲ロックをスキップする(ハンドル用; レコードには現れない).
pub const FLAG_NOLOCK: u32 = 1;

/// 事前イメージを記録しない.
///
/// レコードのヘッダにこのビットが立っている場合、
/// 各操作の`old_bytes`は存在しない.
pub const FLAG_NOROLLBACK: u32 = 2;

/// lingeringトランザクションを使う(ハンドル用; レコードには現れない).
pub const FLAG_LINGER: u32 = 4;

/// コミット済みであることを示す.
///
/// このビットの0から1への遷移(とその永続化)がアトミックなコミットポイント.
pub const FLAG_COMMITTED: u32 = 8;

/// ロールバック済みであることを示す(インメモリ専用).
pub const FLAG_ROLLBACKED: u32 = 16;

/// ロールバックのために生成された逆方向トランザクションであることを示す.
pub const FLAG_ROLLBACKING: u32 = 32;

/// 読み取り専用ハンドルであることを示す(ハンドル用; レコードには現れない).
pub const FLAG_RDONLY: u32 = 64;

/// トランザクション内の一操作のオンディスク表現.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOp<T> {
    /// データファイル内の書き込み先オフセット.
    pub offset: u64,

    /// 書き込まれる新しいバイト列.
    pub new: T,

    /// 書き込み前に同じ範囲に存在したバイト列(事前イメージ).
    ///
    /// 書き込みがEOFを越えてファイルを伸長する場合、
    /// 実在したバイト列の後ろは0でパディングされ、長さは`new`と揃えられる.
    /// `FLAG_NOROLLBACK`時は`None`.
    pub old: Option<T>,
}

/// 一つのトランザクションのオンディスク表現.
///
/// 書き込み時にはデータのコピーを避けるために`T = &[u8]`で、
/// 読み込み(リカバリ)時には`T = Vec<u8>`でインスタンス化される.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransRecord<T> {
    /// ジャーナルディレクトリ内で一意なレコードID.
    pub id: u32,

    /// フラグ(`FLAG_*`のビット集合).
    ///
    /// `stage_to`時点では`FLAG_COMMITTED`は含まれていてはならない.
    pub flags: u32,

    /// 操作列. 適用はこの順序で行われる.
    pub ops: Vec<RecordOp<T>>,
}
impl<T: AsRef<[u8]>> TransRecord<T> {
    /// このレコードが事前イメージを保持しているかどうかを返す.
    pub fn has_pre_images(&self) -> bool {
        self.flags & FLAG_NOROLLBACK == 0
    }

    /// レコードファイル全体のサイズ(バイト単位)を返す.
    pub fn external_size(&self) -> u64 {
        let data_factor = if self.has_pre_images() { 2 } else { 1 };
        let ops: u64 = self
            .ops
            .iter()
            .map(|op| OP_FIXED_SIZE as u64 + op.new.as_ref().len() as u64 * data_factor)
            .sum();
        HEADER_SIZE as u64 + ops + TRAILER_SIZE as u64
    }

    /// レコードの未コミット状態の全体像を`file`に書き込み、`fdatasync`する.
    ///
    /// トレイラのチェックサムは、ヘッダに`FLAG_COMMITTED`が立った
    /// コミット後の姿に対して計算されたものが書き込まれる.
    pub fn stage_to(&self, file: &File) -> Result<()> {
        track_assert_eq!(self.flags & FLAG_COMMITTED, 0, ErrorKind::InconsistentState);
        track_assert!(!self.ops.is_empty(), ErrorKind::InvalidInput);

        let mut image = track!(self.serialize())?;

        // チェックサム計算後に、ディスク上の初期状態としてcommittedビットを落とす
        LittleEndian::write_u32(&mut image[8..12], self.flags);
        track!(pio::write_full_at(file, &image, 0))?;
        track!(pio::sync_file(file))?;
        Ok(())
    }

    /// ヘッダを`FLAG_COMMITTED`付きで書き直し、`fdatasync`する.
    ///
    /// この呼び出しが返った時点が、トランザクションのアトミックなコミットポイント.
    pub fn commit_to(&self, file: &File) -> Result<()> {
        let mut header = [0; HEADER_SIZE];
        self.write_header(&mut header, self.flags | FLAG_COMMITTED);
        track!(pio::write_full_at(file, &header, 0))?;
        track!(pio::sync_file(file))?;
        Ok(())
    }

    fn write_header(&self, buf: &mut [u8], flags: u32) {
        LittleEndian::write_u32(&mut buf[0..4], MAGIC_NUMBER);
        LittleEndian::write_u32(&mut buf[4..8], VERSION);
        LittleEndian::write_u32(&mut buf[8..12], flags);
        LittleEndian::write_u32(&mut buf[12..16], self.ops.len() as u32);
        LittleEndian::write_u32(&mut buf[16..20], self.id);
    }

    /// コミット後の姿(committedビット付き、チェックサム込み)にシリアライズする.
    fn serialize(&self) -> Result<Vec<u8>> {
        let mut image = Vec::with_capacity(self.external_size() as usize);
        let mut header = [0; HEADER_SIZE];
        self.write_header(&mut header, self.flags | FLAG_COMMITTED);
        image.extend_from_slice(&header);

        for op in &self.ops {
            let new = op.new.as_ref();
            track_assert!(!new.is_empty(), ErrorKind::InvalidInput);
            track_io!(image.write_u64::<LittleEndian>(new.len() as u64))?;
            track_io!(image.write_u64::<LittleEndian>(op.offset))?;
            image.extend_from_slice(new);
            if self.has_pre_images() {
                let old = track_assert_some!(op.old.as_ref(), ErrorKind::InconsistentState);
                track_assert_eq!(old.as_ref().len(), new.len(), ErrorKind::InconsistentState);
                image.extend_from_slice(old.as_ref());
            }
        }

        let mut adler32 = RollingAdler32::new();
        adler32.update_buffer(&image);
        track_io!(image.write_u32::<LittleEndian>(adler32.hash()))?;
        Ok(image)
    }
}

/// リカバリパスによるレコードの分類結果.
#[derive(Debug)]
pub enum RecordClass {
    /// コミット済み. データファイルへの再適用が必要(再適用は冪等).
    Committed(TransRecord<Vec<u8>>),

    /// 書き込み途中(committedビットが立っていない). 破棄対象.
    InProgress,

    /// 切り詰められている、ないし読み出せない. 破棄対象.
    Broken,

    /// マジックナンバーかチェックサムが一致しない. 破棄対象.
    Corrupt,

    /// 構造としては読めるが意味的に不正(バージョン不一致、操作数ゼロ等). 破棄対象.
    Invalid,
}

/// レコードファイルを読み込んで分類する.
///
/// ファイル自体が読み出せない場合も`RecordClass::Broken`に分類される.
pub fn classify_file(file: &File) -> RecordClass {
    let mut bytes = Vec::new();
    let mut reader = file;
    if reader.read_to_end(&mut bytes).is_err() {
        return RecordClass::Broken;
    }
    classify(&bytes)
}

/// レコードのバイト列を分類する.
pub fn classify(bytes: &[u8]) -> RecordClass {
    if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
        return RecordClass::Broken;
    }

    let magic = LittleEndian::read_u32(&bytes[0..4]);
    if magic != MAGIC_NUMBER {
        return RecordClass::Corrupt;
    }
    let version = LittleEndian::read_u32(&bytes[4..8]);
    if version != VERSION {
        return RecordClass::Invalid;
    }
    let flags = LittleEndian::read_u32(&bytes[8..12]);
    let num_ops = LittleEndian::read_u32(&bytes[12..16]);
    let id = LittleEndian::read_u32(&bytes[16..20]);
    if num_ops == 0 {
        return RecordClass::Invalid;
    }

    // 操作列を走査してサイズの整合性を検証する
    let has_pre_images = flags & FLAG_NOROLLBACK == 0;
    let data_factor = if has_pre_images { 2 } else { 1 };
    let mut ops = Vec::with_capacity(num_ops as usize);
    let mut pos = HEADER_SIZE;
    for _ in 0..num_ops {
        if bytes.len() - pos < OP_FIXED_SIZE + TRAILER_SIZE {
            return RecordClass::Broken;
        }
        let len64 = LittleEndian::read_u64(&bytes[pos..]);
        let offset = LittleEndian::read_u64(&bytes[pos + 8..]);
        pos += OP_FIXED_SIZE;
        if len64 == 0 {
            return RecordClass::Invalid;
        }
        // ファイルサイズを超える長さは(乗算のオーバーフローを防ぐためにも)即座に弾く
        if len64 > bytes.len() as u64 {
            return RecordClass::Broken;
        }
        let len = len64 as usize;
        if bytes.len() - pos < len * data_factor + TRAILER_SIZE {
            return RecordClass::Broken;
        }
        let new = bytes[pos..pos + len].to_vec();
        pos += len;
        let old = if has_pre_images {
            let old = bytes[pos..pos + len].to_vec();
            pos += len;
            Some(old)
        } else {
            None
        };
        ops.push(RecordOp { offset, new, old });
    }
    if bytes.len() != pos + TRAILER_SIZE {
        return RecordClass::Invalid;
    }

    if flags & FLAG_COMMITTED == 0 {
        return RecordClass::InProgress;
    }

    let mut adler32 = RollingAdler32::new();
    adler32.update_buffer(&bytes[..pos]);
    let checksum = LittleEndian::read_u32(&bytes[pos..]);
    if adler32.hash() != checksum {
        return RecordClass::Corrupt;
    }

    RecordClass::Committed(TransRecord { id, flags, ops })
}

#[cfg(test)]
mod tests {
    use byteorder::{ByteOrder, LittleEndian};
    use std::fs::OpenOptions;
    use std::io::Read;
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;

    fn record() -> TransRecord<Vec<u8>> {
        TransRecord {
            id: 7,
            flags: 0,
            ops: vec![
                RecordOp {
                    offset: 0,
                    new: b"hello".to_vec(),
                    old: Some(b"HELLO".to_vec()),
                },
                RecordOp {
                    offset: 3,
                    new: b"xy".to_vec(),
                    old: Some(b"lo".to_vec()),
                },
            ],
        }
    }

    fn staged_image(record: &TransRecord<Vec<u8>>) -> crate::Result<Vec<u8>> {
        let dir = track_io!(TempDir::new("jourio_record"))?;
        let file = track_io!(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("1")))?;
        track!(record.stage_to(&file))?;
        let mut bytes = Vec::new();
        track_io!((&file).read_to_end(&mut bytes))?;
        Ok(bytes)
    }

    #[test]
    fn roundtrip_works() -> TestResult {
        let record = record();
        assert_eq!(record.external_size(), 20 + (16 + 10) + (16 + 4) + 4);

        let mut bytes = staged_image(&record)?;
        assert_eq!(bytes.len() as u64, record.external_size());

        // 段階書き込みの直後はin-progress
        assert!(matches!(classify(&bytes), RecordClass::InProgress));

        // committedビットを立てると、コミット済みとして元のレコードが得られる
        LittleEndian::write_u32(&mut bytes[8..12], record.flags | FLAG_COMMITTED);
        match classify(&bytes) {
            RecordClass::Committed(parsed) => {
                assert_eq!(parsed.id, record.id);
                assert_eq!(parsed.flags, record.flags | FLAG_COMMITTED);
                assert_eq!(parsed.ops, record.ops);
            }
            class => panic!("Unexpected class: {:?}", class),
        }
        Ok(())
    }

    #[test]
    fn borrowed_and_owned_records_share_the_layout() -> TestResult {
        let owned = record();
        let borrowed = TransRecord {
            id: owned.id,
            flags: owned.flags,
            ops: owned
                .ops
                .iter()
                .map(|op| RecordOp {
                    offset: op.offset,
                    new: &op.new[..],
                    old: op.old.as_ref().map(|old| &old[..]),
                })
                .collect::<Vec<_>>(),
        };
        assert_eq!(track!(owned.serialize())?, track!(borrowed.serialize())?);
        Ok(())
    }

    #[test]
    fn commit_to_flips_the_bit() -> TestResult {
        let dir = track_io!(TempDir::new("jourio_record"))?;
        let record = record();
        let file = track_io!(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("1")))?;
        track!(record.stage_to(&file))?;
        track!(record.commit_to(&file))?;

        let mut bytes = Vec::new();
        track_io!((&file).read_to_end(&mut bytes))?;
        assert!(matches!(classify(&bytes), RecordClass::Committed(_)));
        Ok(())
    }

    #[test]
    fn truncated_record_is_broken() -> TestResult {
        let mut bytes = staged_image(&record())?;
        LittleEndian::write_u32(&mut bytes[8..12], FLAG_COMMITTED);
        for cut in &[1, TRAILER_SIZE, TRAILER_SIZE + 5, bytes.len() - HEADER_SIZE] {
            let truncated = &bytes[..bytes.len() - cut];
            assert!(
                matches!(classify(truncated), RecordClass::Broken),
                "cut={}",
                cut
            );
        }
        Ok(())
    }

    #[test]
    fn bad_magic_is_corrupt() -> TestResult {
        let mut bytes = staged_image(&record())?;
        bytes[0] ^= 0xFF;
        assert!(matches!(classify(&bytes), RecordClass::Corrupt));
        Ok(())
    }

    #[test]
    fn bad_checksum_is_corrupt() -> TestResult {
        let mut bytes = staged_image(&record())?;
        LittleEndian::write_u32(&mut bytes[8..12], FLAG_COMMITTED);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(classify(&bytes), RecordClass::Corrupt));
        Ok(())
    }

    #[test]
    fn semantic_violations_are_invalid() -> TestResult {
        // バージョン不一致
        let mut bytes = staged_image(&record())?;
        LittleEndian::write_u32(&mut bytes[4..8], VERSION + 1);
        assert!(matches!(classify(&bytes), RecordClass::Invalid));

        // 操作数ゼロ
        let mut bytes = staged_image(&record())?;
        LittleEndian::write_u32(&mut bytes[12..16], 0);
        assert!(matches!(classify(&bytes), RecordClass::Invalid));

        // 末尾にゴミ
        let mut bytes = staged_image(&record())?;
        bytes.push(0);
        assert!(matches!(classify(&bytes), RecordClass::Invalid));
        Ok(())
    }

    #[test]
    fn norollback_record_has_no_pre_images() -> TestResult {
        let record = TransRecord {
            id: 1,
            flags: FLAG_NOROLLBACK,
            ops: vec![RecordOp {
                offset: 8,
                new: b"abc".to_vec(),
                old: None,
            }],
        };
        assert_eq!(record.external_size(), 20 + 16 + 3 + 4);

        let mut bytes = staged_image(&record)?;
        LittleEndian::write_u32(&mut bytes[8..12], record.flags | FLAG_COMMITTED);
        match classify(&bytes) {
            RecordClass::Committed(parsed) => assert_eq!(parsed.ops[0].old, None),
            class => panic!("Unexpected class: {:?}", class),
        }
        Ok(())
    }
}
