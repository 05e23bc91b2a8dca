//! Durable block writer used by the leader pipeline and the follower apply task.
//!
//! A journal is append-only. Each block lands on disk as
//! `[body type: u8][length: u32 BE][body]` and is fsynced before the write
//! returns.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt journal: {0}")]
    Corrupt(String),
}

/// Tag telling a reader how to decode a block body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BodyType {
    LogEntry = 1,
}

impl TryFrom<u8> for BodyType {
    type Error = JournalError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(BodyType::LogEntry),
            other => Err(JournalError::Corrupt(format!("unknown body type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMetadata {
    pub body_type: BodyType,
}

impl BlockMetadata {
    pub fn log_entry() -> Self {
        Self {
            body_type: BodyType::LogEntry,
        }
    }
}

pub trait Journal: Send + Sync + 'static {
    fn write_block(&self, bytes: &[u8], metadata: BlockMetadata) -> Result<(), JournalError>;

    /// Write several blocks with a single flush.
    fn write_blocks(&self, blocks: &[(Vec<u8>, BlockMetadata)]) -> Result<(), JournalError> {
        for (bytes, metadata) in blocks {
            self.write_block(bytes, *metadata)?;
        }
        Ok(())
    }
}

/// Journal backed by a single append-only file inside `dir`.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    /// Open (or create) `dir/journal.bin` for appending.
    pub fn open(dir: &Path) -> Result<Self, JournalError> {
        fs::create_dir_all(dir)?;
        let path = dir.join("journal.bin");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "journal opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every block back in write order.
    pub fn read_all(&self) -> Result<Vec<(BlockMetadata, Vec<u8>)>, JournalError> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut blocks = Vec::new();
        loop {
            let mut tag = [0u8; 1];
            match reader.read_exact(&mut tag) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let body_type = BodyType::try_from(tag[0])?;

            let mut len = [0u8; 4];
            reader
                .read_exact(&mut len)
                .map_err(|_| JournalError::Corrupt("truncated block header".into()))?;
            let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
            reader
                .read_exact(&mut body)
                .map_err(|_| JournalError::Corrupt("truncated block body".into()))?;

            blocks.push((BlockMetadata { body_type }, body));
        }
        Ok(blocks)
    }
}

fn write_frame(out: &mut impl Write, bytes: &[u8], metadata: BlockMetadata) -> Result<(), JournalError> {
    let Ok(len) = u32::try_from(bytes.len()) else {
        return Err(JournalError::Corrupt("block exceeds 4 GiB".into()));
    };
    out.write_all(&[metadata.body_type as u8])?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(bytes)?;
    Ok(())
}

/// Run `write` against the end of `file` and fsync. A failed write is cut back
/// to the previous end so no partial frame is left behind.
fn append_or_rollback(
    file: &mut File,
    write: impl FnOnce(&mut File) -> Result<(), JournalError>,
) -> Result<(), JournalError> {
    let start = file.metadata()?.len();
    let written = write(file).and_then(|()| file.sync_data().map_err(JournalError::from));
    if let Err(err) = written {
        if let Err(cut) = file.set_len(start) {
            error!(error = %cut, len = start, "could not roll back partial journal write");
        }
        return Err(err);
    }
    Ok(())
}

impl Journal for FileJournal {
    fn write_block(&self, bytes: &[u8], metadata: BlockMetadata) -> Result<(), JournalError> {
        let mut file = self.file.lock();
        append_or_rollback(&mut file, |file| write_frame(file, bytes, metadata))
    }

    fn write_blocks(&self, blocks: &[(Vec<u8>, BlockMetadata)]) -> Result<(), JournalError> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock();
        append_or_rollback(&mut file, |file| {
            let mut out = BufWriter::new(file);
            for (bytes, metadata) in blocks {
                write_frame(&mut out, bytes, *metadata)?;
            }
            out.flush()?;
            Ok(())
        })?;
        debug!(blocks = blocks.len(), "journal batch flushed");
        Ok(())
    }
}

/// Journal that keeps blocks in memory.
#[derive(Default)]
pub struct MemoryJournal {
    blocks: Mutex<Vec<(BlockMetadata, Vec<u8>)>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> Vec<(BlockMetadata, Vec<u8>)> {
        self.blocks.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }
}

impl Journal for MemoryJournal {
    fn write_block(&self, bytes: &[u8], metadata: BlockMetadata) -> Result<(), JournalError> {
        self.blocks.lock().push((metadata, bytes.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_survive_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let journal = FileJournal::open(tmp.path()).expect("open");
            journal
                .write_block(b"first", BlockMetadata::log_entry())
                .expect("write");
            journal
                .write_blocks(&[
                    (b"second".to_vec(), BlockMetadata::log_entry()),
                    (b"third".to_vec(), BlockMetadata::log_entry()),
                ])
                .expect("write batch");
        }

        let journal = FileJournal::open(tmp.path()).expect("reopen");
        let bodies: Vec<Vec<u8>> = journal
            .read_all()
            .expect("read")
            .into_iter()
            .map(|(meta, body)| {
                assert_eq!(meta.body_type, BodyType::LogEntry);
                body
            })
            .collect();
        assert_eq!(
            bodies,
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[test]
    fn frame_layout_is_type_length_body() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let journal = FileJournal::open(tmp.path()).expect("open");
        journal
            .write_block(&[0xAB, 0xCD], BlockMetadata::log_entry())
            .expect("write");

        let raw = fs::read(journal.path()).expect("read file");
        assert_eq!(raw, vec![1, 0, 0, 0, 2, 0xAB, 0xCD]);
    }

    #[test]
    fn truncated_tail_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let journal = FileJournal::open(tmp.path()).expect("open");
        journal
            .write_block(b"whole", BlockMetadata::log_entry())
            .expect("write");

        let mut raw = fs::read(journal.path()).expect("read file");
        raw.truncate(raw.len() - 2);
        fs::write(journal.path(), raw).expect("rewrite");

        assert!(matches!(journal.read_all(), Err(JournalError::Corrupt(_))));
    }

    #[test]
    fn failed_write_leaves_no_partial_frame() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let journal = FileJournal::open(tmp.path()).expect("open");
        journal
            .write_block(b"kept", BlockMetadata::log_entry())
            .expect("write");

        let interrupted = append_or_rollback(&mut journal.file.lock(), |file| {
            file.write_all(&[1, 0, 0, 0, 9, b'x'])?;
            Err(JournalError::Io(io::Error::other("disk full")))
        });
        assert!(interrupted.is_err());

        journal
            .write_block(b"after", BlockMetadata::log_entry())
            .expect("write after failure");
        let bodies: Vec<Vec<u8>> = journal
            .read_all()
            .expect("read")
            .into_iter()
            .map(|(_, body)| body)
            .collect();
        assert_eq!(bodies, vec![b"kept".to_vec(), b"after".to_vec()]);
    }

    #[test]
    fn memory_journal_keeps_order() {
        let journal = MemoryJournal::new();
        journal
            .write_blocks(&[
                (vec![1], BlockMetadata::log_entry()),
                (vec![2], BlockMetadata::log_entry()),
            ])
            .expect("write");

        let bodies: Vec<Vec<u8>> = journal.blocks().into_iter().map(|(_, b)| b).collect();
        assert_eq!(bodies, vec![vec![1], vec![2]]);
    }
}
