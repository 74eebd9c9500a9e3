//! Binary shadow stack format
//!
//! One block per thread, little-endian:
//!
//! ```text
//! ┌──────────────────┬──────────────────┐
//! │ thread_id: i64   │ frame_count: i64 │   header, count patched after the block
//! ├──────────────────┼──────────────────┼──────────────┐
//! │ timestamp: i64   │ function_id: u64 │ kind_tag: u8 │   × frame_count
//! └──────────────────┴──────────────────┴──────────────┘
//! ```
//!
//! `frame_count` is only known once filtering has run over the thread's
//! events, so a placeholder is written first and overwritten afterwards.
//! Blocks are concatenated into one file, or written one file per thread
//! (`<stem>_<thread_id>[.<ext>]` next to the base path).

use super::{parent_exists, SerializeStats, ShadowStackSerializer};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::event::{EventTag, ThreadId, TraceEvent};
use crate::method_filter::MethodFilter;
use crate::shadow_stack::SessionSnapshot;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Bytes in a thread block header
pub const HEADER_SIZE: u64 = 16;

/// Bytes in one event record
pub const RECORD_SIZE: u64 = 17;

/// Writes snapshots in the binary capture format
#[derive(Debug)]
pub struct BinarySerializer {
    filter: MethodFilter,
    save_path: Option<PathBuf>,
    split_files: bool,
}

impl BinarySerializer {
    pub fn new(filter: MethodFilter) -> Self {
        Self {
            filter,
            save_path: None,
            split_files: false,
        }
    }

    pub fn save_path(&self) -> Option<&Path> {
        self.save_path.as_deref()
    }

    fn serialize_single_file(&self, path: &Path, snapshot: &SessionSnapshot) -> Result<SerializeStats> {
        tracing::info!(path = %path.display(), "Started serializing shadow stacks to binary file");
        let filter = self.filter.fresh();
        let mut out = BufWriter::new(File::create(path)?);
        let mut stats = SerializeStats::default();

        for (thread_id, events) in snapshot.threads() {
            let (written, filtered) = write_thread_stack(&mut out, thread_id, events, &filter)?;
            stats.absorb(written, filtered);
        }

        out.flush()?;
        stats.files.push(path.to_path_buf());
        Ok(stats)
    }

    fn serialize_per_thread(&self, base: &Path, snapshot: &SessionSnapshot) -> Result<SerializeStats> {
        tracing::info!(base = %base.display(), "Started serializing shadow stacks to per-thread binary files");
        let filter = self.filter.fresh();
        let mut stats = SerializeStats::default();

        for (thread_id, events) in snapshot.threads() {
            let path = thread_file_path(base, thread_id);
            let mut out = BufWriter::new(File::create(&path)?);
            let (written, filtered) = write_thread_stack(&mut out, thread_id, events, &filter)?;
            out.flush()?;

            stats.absorb(written, filtered);
            stats.files.push(path);
        }

        Ok(stats)
    }
}

impl ShadowStackSerializer for BinarySerializer {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn init(&mut self, config: &CaptureConfig) {
        self.split_files = config.split_binary_files;
        self.save_path = match &config.binary_path {
            None => {
                tracing::error!("Binary shadow stack save path was not defined");
                None
            }
            Some(path) if !parent_exists(path) => {
                tracing::error!(
                    path = %path.display(),
                    "Directory of the binary shadow stack save path does not exist"
                );
                None
            }
            Some(path) => Some(path.clone()),
        };
    }

    fn is_enabled(&self) -> bool {
        self.save_path.is_some()
    }

    fn serialize(&self, snapshot: &SessionSnapshot) -> Result<SerializeStats> {
        let Some(path) = &self.save_path else {
            tracing::error!("Will not serialize shadow stacks to binary format as save path was not provided");
            return Err(CaptureError::SerializerDisabled("binary"));
        };

        let stats = if self.split_files {
            self.serialize_per_thread(path, snapshot)?
        } else {
            self.serialize_single_file(path, snapshot)?
        };

        tracing::info!(
            threads = stats.threads,
            written = stats.events_written,
            filtered = stats.events_filtered,
            "Finished serializing shadow stacks to binary format"
        );
        Ok(stats)
    }
}

/// Write one thread block, returning `(written, filtered)` event counts
pub fn write_thread_stack<W: Write + Seek>(
    out: &mut W,
    thread_id: ThreadId,
    events: &[TraceEvent],
    filter: &MethodFilter,
) -> io::Result<(u64, u64)> {
    out.write_i64::<LittleEndian>(thread_id as i64)?;

    let count_pos = out.stream_position()?;
    out.write_i64::<LittleEndian>(events.len() as i64)?;

    let mut written = 0u64;
    let mut filtered = 0u64;
    for event in events {
        if !filter.should_record(event.function_id()) {
            filtered += 1;
            continue;
        }

        write_event(out, event)?;
        written += 1;
    }

    let end_pos = out.stream_position()?;
    out.seek(SeekFrom::Start(count_pos))?;
    out.write_i64::<LittleEndian>(written as i64)?;
    out.seek(SeekFrom::Start(end_pos))?;

    Ok((written, filtered))
}

fn write_event<W: Write>(out: &mut W, event: &TraceEvent) -> io::Result<()> {
    out.write_i64::<LittleEndian>(event.timestamp())?;
    out.write_u64::<LittleEndian>(event.function_id())?;
    out.write_u8(event.tag() as u8)
}

/// Per-thread file for split mode: `dir/stacks.bin` -> `dir/stacks_42.bin`
pub fn thread_file_path(base: &Path, thread_id: ThreadId) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match base.extension() {
        Some(ext) => format!("{}_{}.{}", stem, thread_id, ext.to_string_lossy()),
        None => format!("{}_{}", stem, thread_id),
    };
    base.with_file_name(file_name)
}

/// One parsed thread block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadBlock {
    pub thread_id: i64,
    pub frame_count: i64,
    pub events: Vec<TraceEvent>,
}

/// Parse every thread block from a binary capture stream
pub fn read_capture<R: Read>(reader: &mut R) -> Result<Vec<ThreadBlock>> {
    let mut blocks = Vec::new();

    while let Some(thread_id) = read_block_start(reader)? {
        let frame_count = reader
            .read_i64::<LittleEndian>()
            .map_err(|e| truncated(e, format!("frame count of thread {thread_id}")))?;
        if frame_count < 0 {
            return Err(CaptureError::NegativeFrameCount {
                count: frame_count,
                thread_id,
            });
        }

        let mut events = Vec::new();
        for index in 0..frame_count {
            let context = || format!("record {index} of thread {thread_id}");
            let timestamp = reader
                .read_i64::<LittleEndian>()
                .map_err(|e| truncated(e, context()))?;
            let function_id = reader
                .read_u64::<LittleEndian>()
                .map_err(|e| truncated(e, context()))?;
            let tag = reader.read_u8().map_err(|e| truncated(e, context()))?;

            let tag = EventTag::from_u8(tag)
                .ok_or(CaptureError::UnknownEventTag { tag, thread_id })?;
            events.push(tag.to_event(function_id, timestamp));
        }

        blocks.push(ThreadBlock {
            thread_id,
            frame_count,
            events,
        });
    }

    Ok(blocks)
}

/// Parse a capture file from disk
pub fn read_capture_file(path: &Path) -> Result<Vec<ThreadBlock>> {
    let mut reader = BufReader::new(File::open(path)?);
    read_capture(&mut reader)
}

/// Rebuild a snapshot from parsed blocks
pub fn blocks_to_snapshot(blocks: Vec<ThreadBlock>) -> SessionSnapshot {
    SessionSnapshot::from_threads(
        blocks
            .into_iter()
            .map(|block| (block.thread_id as ThreadId, block.events)),
    )
}

/// Thread id of the next block, or `None` at a clean end of stream
fn read_block_start<R: Read>(reader: &mut R) -> Result<Option<i64>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    match filled {
        0 => Ok(None),
        8 => Ok(Some(i64::from_le_bytes(buf))),
        n => Err(CaptureError::Truncated(format!(
            "thread header cut after {n} bytes"
        ))),
    }
}

fn truncated(error: io::Error, what: String) -> CaptureError {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        CaptureError::Truncated(what)
    } else {
        CaptureError::Io(error)
    }
}
