//! CLI argument parsing for Shadowtrace

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for `inspect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One summary line per thread block (default)
    Text,
    /// Full thread blocks as JSON
    Json,
}

/// Serializers the `demo` command can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DemoSerializer {
    Binary,
    Debug,
}

#[derive(Parser, Debug)]
#[command(name = "shadowtrace")]
#[command(version)]
#[command(about = "Shadow stack call-trace capture and inspection", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the thread blocks of a binary capture file
    Inspect {
        /// Binary capture file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output format (text or json)
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,

        /// Only show the block of this thread
        #[arg(long = "filter-thread", value_name = "ID")]
        filter_thread: Option<i64>,
    },

    /// Run a synthetic capture session end to end
    Demo {
        /// Number of producer threads
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Depth of each thread's call tree
        #[arg(long, default_value = "3")]
        depth: usize,

        /// Serializer to run at shutdown
        #[arg(long, value_enum, default_value = "binary")]
        serializer: DemoSerializer,

        /// Output file (base path when splitting)
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,

        /// Regex over method names (e.g. `Method[12]$`)
        #[arg(long, value_name = "REGEX")]
        filter: Option<String>,

        /// Write one binary file per thread
        #[arg(long)]
        split: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_inspect_defaults() {
        let cli = Cli::parse_from(["shadowtrace", "inspect", "capture.bin"]);
        match cli.command {
            Command::Inspect {
                file,
                format,
                filter_thread,
            } => {
                assert_eq!(file, PathBuf::from("capture.bin"));
                assert_eq!(format, OutputFormat::Text);
                assert!(filter_thread.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_inspect_json_with_thread() {
        let cli = Cli::parse_from([
            "shadowtrace",
            "inspect",
            "capture.bin",
            "--format",
            "json",
            "--filter-thread",
            "7",
        ]);
        assert!(matches!(
            cli.command,
            Command::Inspect {
                format: OutputFormat::Json,
                filter_thread: Some(7),
                ..
            }
        ));
    }

    #[test]
    fn test_cli_demo_flags() {
        let cli = Cli::parse_from([
            "shadowtrace",
            "demo",
            "--threads",
            "2",
            "--depth",
            "5",
            "--serializer",
            "debug",
            "--output",
            "out.txt",
            "--filter",
            "Method1",
        ]);
        match cli.command {
            Command::Demo {
                threads,
                depth,
                serializer,
                output,
                filter,
                split,
            } => {
                assert_eq!(threads, 2);
                assert_eq!(depth, 5);
                assert_eq!(serializer, DemoSerializer::Debug);
                assert_eq!(output, PathBuf::from("out.txt"));
                assert_eq!(filter.as_deref(), Some("Method1"));
                assert!(!split);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_debug_flag_is_global() {
        let cli = Cli::parse_from(["shadowtrace", "inspect", "x.bin", "--debug"]);
        assert!(cli.debug);
    }

    #[test]
    fn test_cli_demo_requires_output() {
        assert!(Cli::try_parse_from(["shadowtrace", "demo"]).is_err());
    }
}
