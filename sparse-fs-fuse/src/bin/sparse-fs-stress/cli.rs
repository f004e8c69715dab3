use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Cli {
    /// Image file backing the filesystem
    #[arg(long, short)]
    pub image: PathBuf,

    /// Image size in sectors
    #[arg(long, short, default_value_t = 16 * 2048)]
    pub sectors: usize,

    /// Worker thread count
    #[arg(long, short, default_value_t = 4)]
    pub threads: usize,

    /// Write/read rounds per worker
    #[arg(long, short, default_value_t = 256)]
    pub rounds: usize,
}
