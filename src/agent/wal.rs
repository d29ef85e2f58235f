//! Durable write-ahead log backing an agent: a flat file of length-framed
//! MessagePack records, replayed in full at startup. The agent layers its
//! own record kinds (entries, truncations, metadata snapshots) on top.

use std::fmt;
use std::io::SeekFrom;
use std::marker::PhantomData;
use std::path::Path;

use crate::utils::ConclaveError;

use bytes::{Buf, BytesMut};

use serde::{de::DeserializeOwned, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Length-framed append-only record file.
pub(crate) struct WriteAheadLog<Rec> {
    /// Backing file, cursor kept at EOF between operations.
    backer: File,

    /// Current file size in bytes.
    file_size: usize,

    _marker: PhantomData<Rec>,
}

impl<Rec> WriteAheadLog<Rec>
where
    Rec: fmt::Debug + Serialize + DeserializeOwned,
{
    /// Opens (creating if needed) the log file at the given path.
    pub(crate) async fn open(path: &Path) -> Result<Self, ConclaveError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!("wal"; "created backer file '{}'", path.display());
        }
        let mut backer =
            OpenOptions::new().read(true).write(true).open(path).await?;
        let file_size = backer.metadata().await?.len() as usize;
        backer.seek(SeekFrom::End(0)).await?;

        Ok(WriteAheadLog {
            backer,
            file_size,
            _marker: PhantomData,
        })
    }

    /// Appends one record at EOF; optionally fsyncs the data.
    pub(crate) async fn append(
        &mut self,
        record: &Rec,
        sync: bool,
    ) -> Result<(), ConclaveError> {
        let bytes = encode_to_vec(record)?;
        self.backer.write_u64(bytes.len() as u64).await?;
        self.backer.write_all(&bytes[..]).await?;
        if sync {
            self.backer.sync_data().await?;
        }
        self.file_size += 8 + bytes.len();
        Ok(())
    }

    /// Reads all records from the beginning of the file. A torn final frame
    /// (e.g., from a crash mid-append) is dropped with a warning; everything
    /// before it is returned.
    pub(crate) async fn load_all(
        &mut self,
    ) -> Result<Vec<Rec>, ConclaveError> {
        let mut buf = BytesMut::with_capacity(self.file_size);
        buf.resize(self.file_size, 0);
        self.backer.seek(SeekFrom::Start(0)).await?;
        self.backer.read_exact(&mut buf[..]).await?;
        self.backer.seek(SeekFrom::End(0)).await?;

        let mut records = Vec::new();
        while buf.remaining() >= 8 {
            let frame_len = (&buf[..8]).get_u64() as usize;
            if buf.remaining() < 8 + frame_len {
                break; // torn frame below
            }
            buf.advance(8);
            let record = decode_from_slice(&buf[..frame_len])?;
            buf.advance(frame_len);
            records.push(record);
        }
        if buf.has_remaining() {
            pf_warn!("wal"; "dropping torn tail frame of {} bytes",
                            buf.remaining());
        }
        Ok(records)
    }

    /// Wipes the log file to empty (used when re-provisioning a node).
    pub(crate) async fn reset(&mut self) -> Result<(), ConclaveError> {
        self.backer.set_len(0).await?;
        self.backer.seek(SeekFrom::End(0)).await?;
        self.backer.sync_all().await?;
        self.file_size = 0;
        Ok(())
    }
}

#[cfg(test)]
mod wal_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestRecord(String, u64);

    async fn fresh_wal(
        path: &str,
    ) -> Result<WriteAheadLog<TestRecord>, ConclaveError> {
        let mut wal = WriteAheadLog::open(Path::new(path)).await?;
        wal.reset().await?;
        Ok(wal)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn append_then_load() -> Result<(), ConclaveError> {
        let path = "/tmp/test-conclave-wal-0.log";
        let mut wal = fresh_wal(path).await?;
        wal.append(&TestRecord("alpha".into(), 1), false).await?;
        wal.append(&TestRecord("beta".into(), 2), true).await?;

        // reopen and replay
        let mut wal: WriteAheadLog<TestRecord> =
            WriteAheadLog::open(Path::new(path)).await?;
        assert_eq!(
            wal.load_all().await?,
            vec![
                TestRecord("alpha".into(), 1),
                TestRecord("beta".into(), 2)
            ]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn load_empty() -> Result<(), ConclaveError> {
        let mut wal = fresh_wal("/tmp/test-conclave-wal-1.log").await?;
        assert!(wal.load_all().await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn reset_discards() -> Result<(), ConclaveError> {
        let mut wal = fresh_wal("/tmp/test-conclave-wal-2.log").await?;
        wal.append(&TestRecord("gone".into(), 9), true).await?;
        wal.reset().await?;
        assert!(wal.load_all().await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn torn_tail_dropped() -> Result<(), ConclaveError> {
        let path = "/tmp/test-conclave-wal-3.log";
        let mut wal = fresh_wal(path).await?;
        wal.append(&TestRecord("kept".into(), 1), true).await?;
        // simulate a torn append: a frame header promising more bytes than
        // are present
        wal.backer.write_u64(1024).await?;
        wal.backer.write_all(b"partial").await?;
        wal.backer.sync_data().await?;
        wal.file_size += 8 + 7;

        let mut wal: WriteAheadLog<TestRecord> =
            WriteAheadLog::open(Path::new(path)).await?;
        assert_eq!(wal.load_all().await?, vec![TestRecord("kept".into(), 1)]);
        Ok(())
    }
}
