use std::path::PathBuf;

use clap::Parser;

/// Reconstructs INSERT/DELETE/UPDATE statements from the on-disk files of
/// an offline SQL Server database.
#[derive(Parser)]
pub struct Config {
    #[clap(long = "data", help = "Path to the primary data file (MDF)")]
    pub data_file: Option<PathBuf>,

    #[clap(long = "log", help = "Path to the transaction log file (LDF)")]
    pub log_file: PathBuf,

    #[clap(
        long,
        default_value_t = 0,
        help = "Bit 0: decode rows against the MDF schema; bit 1: carve the LDF instead of walking VLFs"
    )]
    pub mode: u8,

    #[clap(long, default_value = "recovered.csv", help = "CSV output path")]
    pub output: PathBuf,

    #[clap(long, default_value_t = 10, help = "Carving worker threads")]
    pub jobs: usize,

    #[clap(
        default_value = "false",
        long,
        help = "Dump the prologue of every reconstructed DML record under result/"
    )]
    pub extract_records: bool,
}

impl Config {
    /// An MDF is available and rows are decoded against its schema.
    pub fn with_schema(&self) -> bool {
        self.mode & 1 != 0
    }

    /// Carve the LDF by record signature instead of the structured VLF walk.
    pub fn carving(&self) -> bool {
        self.mode & 2 != 0
    }
}
