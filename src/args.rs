//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;

use crate::instrument::WindowKind;

/// Which pipeline shape to run
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Deployment {
    /// Instrument sweeps are averaged in the capture stage and stored directly
    Sweep,
    /// Raw sample blocks go through the in-process FFT worker pool
    Raw,
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Center frequency of the acquisition scan in Hz
    #[clap(long, default_value_t = 152e6)]
    pub center_freq: f64,
    /// Width of the acquisition window in Hz; spans wider than the 20 MHz
    /// native bandwidth run as an overlapped band sweep
    #[clap(long, default_value_t = 27e6)]
    pub span: f64,
    /// Reference level in dBm
    #[clap(long, default_value_t = -60.0)]
    pub ref_level: f64,
    /// Attenuation in dB
    #[clap(long, default_value_t = 10.0)]
    pub attenuation: f64,
    /// Frontend gain setting (0-3)
    #[clap(long, default_value_t = 3)]
    pub gain: i32,
    /// Resolution bandwidth in Hz (also used as the video bandwidth)
    #[clap(long, default_value_t = 2.465e3)]
    pub rbw: f64,
    /// Sweep time in seconds
    #[clap(long, default_value_t = 0.01)]
    pub sweep_time: f64,
    /// FFT windowing function
    #[clap(long, value_enum, default_value_t = WindowKind::Hamming)]
    pub window: WindowKind,
    /// Sweeps averaged into each stored row
    #[clap(short = 'n', long, default_value_t = 600)]
    pub num_average: u32,
    /// Overlap fraction between adjacent sub-bands in band-sweep mode
    #[clap(long, default_value_t = 0.5)]
    pub overlap: f64,
    /// Sweeps taken at each sub-band center before retuning
    #[clap(long, default_value_t = 600)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub bin_samples: u64,
    /// Sweeps between diagnostics readouts / calibration checks
    #[clap(long, default_value_t = 5000)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub cal_check: u64,
    /// Ring buffer capacity in slots
    #[clap(short, long, default_value_t = 256)]
    pub capacity: usize,
    /// FFT worker count (raw deployment)
    #[clap(short, long, default_value_t = 2)]
    pub workers: usize,
    /// FFT window length in samples (raw deployment)
    #[clap(long, default_value_t = 2048)]
    pub window_len: usize,
    /// FFT window overlap divisor: consecutive windows start window-len/v apart
    #[clap(long, default_value_t = 2)]
    pub window_overlap: usize,
    /// TCP port the live feed listens on
    #[clap(short, long, default_value_t = 50007)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,
    /// Directory the data and event logs are written to
    #[clap(short, long, default_value = "./data")]
    pub out_dir: PathBuf,
    /// Log rotation interval in seconds
    #[clap(long, default_value_t = 3600)]
    pub rotate_secs: u64,
    /// Pipeline deployment
    #[clap(long, value_enum, default_value_t = Deployment::Sweep)]
    pub mode: Deployment,
    /// Probability per call that the simulated instrument faults
    #[clap(long, default_value_t = 0.0)]
    pub fault_rate: f64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(["sweep_slurper"]);
        assert_eq!(args.mode, Deployment::Sweep);
        assert_eq!(args.num_average, 600);
        assert_eq!(args.port, 50007);
    }

    #[test]
    fn zero_cycle_intervals_are_rejected() {
        assert!(Args::try_parse_from(["sweep_slurper", "--cal-check", "0"]).is_err());
        assert!(Args::try_parse_from(["sweep_slurper", "--bin-samples", "0"]).is_err());
    }

    #[test]
    fn raw_mode_flags_parse() {
        let args = Args::parse_from([
            "sweep_slurper",
            "--mode",
            "raw",
            "--workers",
            "4",
            "--window-len",
            "4096",
        ]);
        assert_eq!(args.mode, Deployment::Raw);
        assert_eq!(args.workers, 4);
        assert_eq!(args.window_len, 4096);
    }
}
