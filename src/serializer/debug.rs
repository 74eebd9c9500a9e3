//! Human-readable shadow stack dump
//!
//! ```text
//! [START]: Thread(7)
//!   [START]: MyApp.Main
//!     [START]: MyApp.Worker.Run
//!   [ END ]: MyApp.Worker.Run
//!   [ END ]: MyApp.Main
//! [ END ]: Thread(7)
//! ```
//!
//! Depth goes up after a `[START]` line is written and down before an
//! `[ END ]` line is written, and an end line sits one level left of the
//! frame it closes (never below zero).

use super::{parent_exists, SerializeStats, ShadowStackSerializer};
use crate::collaborators::NameResolver;
use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::event::{CallEvent, FunctionEventKind, FunctionId, ThreadId, TraceEvent};
use crate::method_filter::MethodFilter;
use crate::shadow_stack::SessionSnapshot;
use fnv::FnvHashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

const START_PREFIX: &str = "[START]: ";
const END_PREFIX: &str = "[ END ]: ";
const CATCH_PREFIX: &str = "[CATCH]: ";
const INDENT: &str = "  ";

/// Line marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Start,
    End,
    Catch,
}

impl Marker {
    fn prefix(self) -> &'static str {
        match self {
            Marker::Start => START_PREFIX,
            Marker::End => END_PREFIX,
            Marker::Catch => CATCH_PREFIX,
        }
    }
}

/// One rendered event line before formatting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugLine {
    pub depth: usize,
    pub marker: Marker,
    pub function_id: FunctionId,
}

/// Compute marker and nesting depth for every event of one thread
pub fn layout_thread<'a>(events: impl IntoIterator<Item = &'a TraceEvent>) -> Vec<DebugLine> {
    let mut depth = 0usize;
    let mut lines = Vec::new();

    for event in events {
        match event {
            TraceEvent::Call(call) => match call.kind {
                FunctionEventKind::Started => {
                    lines.push(DebugLine {
                        depth,
                        marker: Marker::Start,
                        function_id: call.function_id,
                    });
                    depth += 1;
                }
                FunctionEventKind::Finished => {
                    depth = depth.saturating_sub(1);
                    lines.push(DebugLine {
                        depth: depth.saturating_sub(1),
                        marker: Marker::End,
                        function_id: call.function_id,
                    });
                }
            },
            TraceEvent::ExceptionCatch(catch) => lines.push(DebugLine {
                depth,
                marker: Marker::Catch,
                function_id: catch.function_id,
            }),
        }
    }

    lines
}

/// Writes snapshots as indented text
pub struct DebugSerializer {
    filter: MethodFilter,
    resolver: Arc<dyn NameResolver>,
    save_path: Option<PathBuf>,
}

impl DebugSerializer {
    pub fn new(filter: MethodFilter, resolver: Arc<dyn NameResolver>) -> Self {
        Self {
            filter,
            resolver,
            save_path: None,
        }
    }

    /// Render the whole snapshot into a writer
    pub fn write_snapshot<W: Write>(&self, out: &mut W, snapshot: &SessionSnapshot) -> Result<SerializeStats> {
        let filter = self.filter.fresh();
        let mut names = NameCache::new(self.resolver.as_ref());
        let mut stats = SerializeStats::default();

        for (thread_id, events) in snapshot.threads() {
            let retained: Vec<&TraceEvent> = events
                .iter()
                .filter(|event| filter.should_record(event.function_id()))
                .collect();
            let filtered = (events.len() - retained.len()) as u64;

            write_thread(out, thread_id, &retained, &mut names)?;
            stats.absorb(retained.len() as u64, filtered);
        }

        Ok(stats)
    }
}

fn write_thread<W: Write>(
    out: &mut W,
    thread_id: ThreadId,
    events: &[&TraceEvent],
    names: &mut NameCache<'_>,
) -> Result<()> {
    let thread_frame = format!("Thread({thread_id})");
    writeln!(out, "{START_PREFIX}{thread_frame}")?;

    let lines = layout_thread(events.iter().copied());
    for (line, event) in lines.iter().zip(events) {
        let indent = INDENT.repeat(line.depth + 1);
        let name = names.get(line.function_id);
        match event {
            TraceEvent::Call(CallEvent {
                receiver: Some(receiver),
                ..
            }) => writeln!(
                out,
                "{indent}{}{name} (this=#{receiver})",
                line.marker.prefix()
            )?,
            _ => writeln!(out, "{indent}{}{name}", line.marker.prefix())?,
        }
    }

    writeln!(out, "{END_PREFIX}{thread_frame}")?;
    write!(out, "\n\n\n")?;
    Ok(())
}

/// Memoized function names for one pass
struct NameCache<'a> {
    resolver: &'a dyn NameResolver,
    names: FnvHashMap<FunctionId, String>,
}

impl<'a> NameCache<'a> {
    fn new(resolver: &'a dyn NameResolver) -> Self {
        Self {
            resolver,
            names: FnvHashMap::default(),
        }
    }

    fn get(&mut self, function_id: FunctionId) -> &str {
        let resolver = self.resolver;
        self.names.entry(function_id).or_insert_with(|| {
            resolver
                .resolve_name(function_id)
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| format!("<unresolved 0x{function_id:x}>"))
        })
    }
}

impl ShadowStackSerializer for DebugSerializer {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn init(&mut self, config: &CaptureConfig) {
        self.save_path = match &config.debug_path {
            None => {
                tracing::error!("Debug shadow stack save path was not defined");
                None
            }
            Some(path) if !parent_exists(path) => {
                tracing::error!(
                    path = %path.display(),
                    "Directory of the debug shadow stack save path does not exist"
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
            return Err(CaptureError::SerializerDisabled("debug"));
        };
        tracing::info!(
            path = %path.display(),
            "Started serializing shadow stacks to debug file"
        );

        let mut out = BufWriter::new(File::create(path)?);
        let mut stats = self.write_snapshot(&mut out, snapshot)?;
        out.flush()?;
        stats.files.push(path.clone());

        tracing::info!(
            path = %path.display(),
            threads = stats.threads,
            written = stats.events_written,
            "Finished writing debug shadow stacks"
        );
        Ok(stats)
    }
}

impl std::fmt::Debug for DebugSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSerializer")
            .field("filter", &self.filter)
            .field("save_path", &self.save_path)
            .finish()
    }
}
