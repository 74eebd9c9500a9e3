use anyhow::{Context, Result};
use clap::Parser;
use shadowtrace::cli::{Cli, Command, DemoSerializer, OutputFormat};
use shadowtrace::config::{CaptureConfig, SerializerKind};
use shadowtrace::event::{EventTag, FunctionId, ThreadId};
use shadowtrace::serializer::binary::{read_capture_file, ThreadBlock};
use shadowtrace::session::{CaptureSession, SerializeOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    } else if std::env::var_os("RUST_LOG").is_some() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Per-tag counts of one thread block
fn tag_counts(block: &ThreadBlock) -> (usize, usize, usize) {
    block
        .events
        .iter()
        .fold((0, 0, 0), |(started, finished, catches), event| match event.tag() {
            EventTag::Started => (started + 1, finished, catches),
            EventTag::Finished => (started, finished + 1, catches),
            EventTag::ExceptionCatchEnter => (started, finished, catches + 1),
        })
}

fn inspect(file: &Path, format: OutputFormat, filter_thread: Option<i64>) -> Result<()> {
    let blocks = read_capture_file(file)
        .with_context(|| format!("Failed to read capture file {}", file.display()))?;
    let blocks: Vec<ThreadBlock> = blocks
        .into_iter()
        .filter(|block| filter_thread.map_or(true, |id| block.thread_id == id))
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&blocks)?);
        }
        OutputFormat::Text => {
            for block in &blocks {
                let (started, finished, catches) = tag_counts(block);
                let span = match (block.events.first(), block.events.last()) {
                    (Some(first), Some(last)) => last.timestamp() - first.timestamp(),
                    _ => 0,
                };
                println!(
                    "Thread({}): {} events ({} started, {} finished, {} catches) over {} ns",
                    block.thread_id, block.frame_count, started, finished, catches, span
                );
            }
            println!(
                "{} thread blocks, {} events",
                blocks.len(),
                blocks.iter().map(|b| b.frame_count).sum::<i64>()
            );
        }
    }

    Ok(())
}

/// Synthetic display name used by `demo`
fn demo_name(function_id: FunctionId) -> Option<String> {
    Some(format!("Demo.Namespace.Method{function_id}"))
}

/// Nested call chain `Method1 -> Method2 -> ... -> Method<depth>`, with a
/// catch recorded in the innermost frame
fn demo_call_tree(session: &CaptureSession, thread_id: ThreadId, depth: usize) {
    let depth = depth as FunctionId;
    for function_id in 1..=depth {
        session.on_function_enter(function_id, thread_id);
    }
    if depth > 0 {
        session.on_exception_catcher_enter(depth, thread_id);
    }
    for function_id in (1..=depth).rev() {
        session.on_function_leave(function_id, thread_id);
    }
}

fn demo(
    threads: usize,
    depth: usize,
    serializer: DemoSerializer,
    output: PathBuf,
    filter: Option<String>,
    split: bool,
) -> Result<()> {
    let mut config = CaptureConfig {
        method_filter: filter,
        split_binary_files: split,
        ..CaptureConfig::default()
    };
    match serializer {
        DemoSerializer::Binary => {
            config.serializer = SerializerKind::Binary;
            config.binary_path = Some(output);
        }
        DemoSerializer::Debug => {
            config.serializer = SerializerKind::Debug;
            config.debug_path = Some(output);
        }
    }

    let session = CaptureSession::builder(config)
        .names(Arc::new(demo_name))
        .build();

    std::thread::scope(|scope| {
        for thread_id in 1..=threads as ThreadId {
            let session = &session;
            scope.spawn(move || demo_call_tree(session, thread_id, depth));
        }
    });

    let report = session.shutdown();
    match &report.outcome {
        SerializeOutcome::Written(stats) => {
            println!(
                "Captured {} events from {} threads, wrote {} ({} filtered) with the {} serializer",
                report.events_captured,
                report.threads,
                stats.events_written,
                stats.events_filtered,
                report.serializer
            );
            for file in &stats.files {
                println!("{}", file.display());
            }
            Ok(())
        }
        SerializeOutcome::Skipped => anyhow::bail!(
            "The {} serializer is disabled, check that the output directory exists",
            report.serializer
        ),
        SerializeOutcome::Failed(error) => {
            anyhow::bail!("The {} serializer failed: {}", report.serializer, error)
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match args.command {
        Command::Inspect {
            file,
            format,
            filter_thread,
        } => inspect(&file, format, filter_thread),
        Command::Demo {
            threads,
            depth,
            serializer,
            output,
            filter,
            split,
        } => demo(threads, depth, serializer, output, filter, split),
    }
}
