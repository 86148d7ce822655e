use anyhow::{anyhow, Result};
use clap::Parser;
use crossbeam_channel::tick;
use log::{info, warn, LevelFilter};
use psd_daq::*;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode, WriteLogger};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Parser, Debug)]
#[command(version, about = "Digitizer waveform acquisition with online PSD analysis")]
struct Cli {
    /// TOML run configuration
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log progress to the terminal instead of drawing the status screen
    #[arg(long)]
    headless: bool,

    /// Seed for the simulated digitizer
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Stop after this many readouts
    #[arg(long)]
    max_reads: Option<usize>,

    /// Log file used while the status screen is active
    #[arg(long, default_value = "psd_daq.log")]
    log_file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let conf = Conf::load(&cli.config).map_err(|e| anyhow!("loading {}: {e}", cli.config))?;
    let config = conf.session_config()?;
    fs::create_dir_all(&conf.run_settings.output_dir)?;

    let traces = config.records.iter().any(|r| r.raw_trace);
    let device = SimulatedDigitizer::new(config.board_id, config.mode, cli.seed)
        .with_zle(config.zle)
        .with_traces(traces)
        .with_max_reads(cli.max_reads);

    let sink = record_sink(&conf, &config)?;
    let mut session = AcquisitionSession::new(config, device, sink)?;
    for (channel, path) in conf.calibration_files()? {
        let n = session.load_calibration(channel, &path)?;
        info!("Loaded {n} calibration points for channel {channel}");
        if conf.calibration_settings.activate {
            if let Err(e) = session.activate_calibration(channel) {
                warn!("Calibration of channel {channel} not activated: {e}");
            }
        }
    }

    session.prepare()?;
    let metadata = if cli.headless {
        let ticker = tick(Duration::from_secs(5));
        let mut progress = move |view: &SessionView<'_>| {
            if ticker.try_recv().is_ok() {
                info!(
                    "{} s: {} events, {} skipped, {:.2} MB/s",
                    view.elapsed.as_secs(),
                    view.events,
                    view.skipped,
                    view.counter.rate()
                );
            }
        };
        session.start(&mut progress)
    } else {
        let mut status = Status::new(ratatui::init(), session.enable_flag());
        let result = session.start(&mut status);
        ratatui::restore();
        result
    }?;

    info!(
        "Run finished after {:.1} s: {} reads, {} events, {} skipped, {} bytes{}",
        metadata.actual_duration.as_secs_f64(),
        session.device().reads(),
        metadata.events,
        metadata.skipped,
        metadata.bytes,
        if metadata.timed_out { " (timed out)" } else { "" }
    );

    for file in &conf.run_settings.spectrum_exports {
        let path = conf.output_path(file);
        for ch in session.config().enabled_channels() {
            let histograms = session.histograms();
            if let Some(spectrum) = histograms.spectrum(ch.channel) {
                if !export_spectrum(spectrum, &channel_path(&path, "", ch.channel))? {
                    warn!("Unsupported spectrum format: {}", path.display());
                    break;
                }
            }
            if let Some(psd) = histograms.psd(ch.channel) {
                export_psd(psd, &channel_path(&path, "_psd", ch.channel))?;
            }
        }
    }
    Ok(())
}

fn init_logging(cli: &Cli) -> Result<()> {
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .build();
    if cli.headless {
        TermLogger::init(
            LevelFilter::Info,
            config,
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )?;
    } else {
        WriteLogger::init(LevelFilter::Debug, config, File::create(&cli.log_file)?)?;
    }
    Ok(())
}

#[cfg(feature = "hdf5")]
fn record_sink(conf: &Conf, config: &SessionConfig) -> Result<Option<Box<dyn RecordSink>>> {
    let rec = &conf.record_settings;
    if !rec.enabled {
        return Ok(None);
    }
    let sink = Hdf5RecordSink::create(
        &conf.output_path(&rec.output_file),
        config,
        rec.max_events,
        rec.buffer_capacity,
    )?;
    Ok(Some(Box::new(sink)))
}

#[cfg(not(feature = "hdf5"))]
fn record_sink(conf: &Conf, _config: &SessionConfig) -> Result<Option<Box<dyn RecordSink>>> {
    if conf.record_settings.enabled {
        warn!("Built without HDF5 support, records are not saved");
    }
    Ok(None)
}

/// `spectra.csv` for channel 3 becomes `spectra_ch3.csv`.
fn channel_path(path: &Path, tag: &str, channel: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{tag}_ch{channel}.{}", ext.to_string_lossy()),
        None => format!("{stem}{tag}_ch{channel}"),
    };
    path.with_file_name(name)
}
