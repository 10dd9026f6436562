//! The flag set every demo NF shares, matching the common/per-NF split in
//! `original_source/lib/flash/params/flash_params.c`. Demo binaries
//! `#[command(flatten)]` this into their own `clap::Parser` struct and add
//! whatever flags their own logic needs.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
pub struct CommonArgs {
    /// Topology file describing this NF's UMEM, threads, and routing.
    #[arg(long)]
    pub topology: PathBuf,

    /// This NF's id within the topology file.
    #[arg(long)]
    pub nf_id: u16,

    /// UMEM group id this NF attaches to.
    #[arg(long)]
    pub umem_id: u16,

    /// The first NF to attach to a UMEM group creates it (`CREATE_UMEM`);
    /// every other NF only attaches (`GET_UMEM`).
    #[arg(long)]
    pub primary: bool,

    /// First CPU of the worker thread pinning range.
    #[arg(short = 'c', long, default_value_t = 0)]
    pub cpu_start: usize,

    /// Last CPU of the worker thread pinning range, inclusive (defaults to
    /// `cpu_start` alone, i.e. a single pinned CPU).
    #[arg(short = 'e', long)]
    pub cpu_end: Option<usize>,

    /// CPU the stats thread is pinned to; unset leaves it unpinned.
    #[arg(short = 's', long)]
    pub stats_cpu: Option<usize>,

    /// Stats print interval, in seconds.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub stats_interval_secs: u64,
}

impl CommonArgs {
    /// The inclusive CPU range worker threads are pinned across, one CPU
    /// per thread in round-robin if there are more threads than CPUs.
    pub fn cpu_range(&self) -> std::ops::RangeInclusive<usize> {
        self.cpu_start..=self.cpu_end.unwrap_or(self.cpu_start)
    }
}
