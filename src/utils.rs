use crate::SessionConfig;
use log::info;
use std::{
    collections::VecDeque,
    fmt::Write,
    time::{Duration, Instant},
};

/// A helper structure to track readout statistics, with both
/// *all-time* counters and a *sliding 1 s window* rate.
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time total bytes
    pub total_size: usize,
    /// All-time number of readout buffers
    pub n_reads: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    reads: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_size: 0,
            n_reads: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            reads: VecDeque::new(),
            bytes_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average rate since t_begin, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_size as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Sliding-window rate over the last second, in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Record a readout of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        let now = Instant::now();

        self.total_size += size;
        self.n_reads += 1;

        self.reads.push_back((now, size));
        self.bytes_in_window += size;

        while let Some(&(ts, sz)) = self.reads.front() {
            if now.duration_since(ts) > self.window {
                self.reads.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_size = 0;
        self.n_reads = 0;
        self.t_begin = Instant::now();

        self.reads.clear();
        self.bytes_in_window = 0;
    }
}

/// Dump the resolved run configuration to the log, one parameter per line.
pub fn log_session_config(config: &SessionConfig) {
    let mut param_log = String::new();
    let _ = writeln!(param_log, "Mode: {:?}", config.mode);
    let _ = writeln!(param_log, "ControlStyle: {:?}", config.control_style);
    let _ = writeln!(param_log, "ZeroLengthEncoding: {}", config.zle);
    match config.run_duration {
        Some(d) => {
            let _ = writeln!(param_log, "RunDuration: {} s", d.as_secs_f64());
        }
        None => {
            let _ = writeln!(param_log, "RunDuration: until stopped");
        }
    }

    let hist = &config.histograms;
    let _ = writeln!(
        param_log,
        "Spectrum: {:?} {} bins [{}, {})",
        hist.quantity, hist.spectrum.bins, hist.spectrum.min, hist.spectrum.max
    );
    let _ = writeln!(
        param_log,
        "PSD: {:?} above {}, total {} bins [{}, {}), parameter {} bins [{}, {})",
        hist.psd_parameter,
        hist.psd_threshold,
        hist.psd_total.bins,
        hist.psd_total.min,
        hist.psd_total.max,
        hist.psd_param.bins,
        hist.psd_param.min,
        hist.psd_param.max
    );
    if let Some(trigger) = hist.trigger_channel {
        let _ = writeln!(param_log, "TriggerChannel: {trigger}");
    }

    for ch in config.enabled_channels() {
        let c = ch.channel;
        let _ = writeln!(param_log, "Polarity[{c}]: {:?}", ch.polarity);
        let _ = writeln!(param_log, "TriggerThr[{c}]: {}", ch.trigger_threshold);
        let _ = writeln!(param_log, "DCOffset[{c}]: {}", ch.dc_offset);
        let _ = writeln!(
            param_log,
            "RecordLength[{c}]: {} (pre-trigger {})",
            ch.record_length, ch.pre_trigger
        );
        let _ = writeln!(
            param_log,
            "Baseline[{c}]: [{}, {})",
            ch.baseline.start, ch.baseline.stop
        );
        let _ = writeln!(
            param_log,
            "PSDGates[{c}]: total [{}, {}) tail [{}, {})",
            ch.psd_total.start, ch.psd_total.stop, ch.psd_tail.start, ch.psd_tail.stop
        );
        if let Some(n) = ch.data_reduction {
            let _ = writeln!(param_log, "DataReduction[{c}]: {n}");
        }
        if let Some(zle) = &ch.zle {
            let _ = writeln!(
                param_log,
                "ZLE[{c}]: threshold {} look back {} look forward {} {:?}",
                zle.threshold, zle.look_back, zle.look_forward, zle.edge
            );
        }
        if let Some(window) = hist.windows.get(c).copied().flatten() {
            let _ = writeln!(param_log, "Discriminator[{c}]: ({}, {})", window.low, window.high);
        }
        if let Some(fields) = config.records.get(c) {
            let _ = writeln!(
                param_log,
                "Record[{c}]: trace {} derived {}",
                fields.raw_trace, fields.derived
            );
        }
    }

    if param_log.ends_with('\n') {
        param_log.pop();
    }
    info!("Board {} configuration:\n{}", config.board_id, param_log);
}
