use crate::{AxisSpec, DaqError, DaqResult, DiscriminatorWindow, HistogramConfig, RecordFields};
use confique::Config;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// Hardware channels per board.
pub const MAX_CHANNELS: usize = 16;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub channel_settings: ChannelSettings,
    #[config(nested)]
    pub histogram_settings: HistogramSettings,
    #[config(nested)]
    pub record_settings: RecordSettings,
    #[config(nested)]
    pub calibration_settings: CalibrationSettings,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = 0)]
    pub board_id: usize,
    #[config(default = "FullWaveform")]
    pub mode: OperatingMode,
    #[config(default = "SoftwareStart")]
    pub control_style: ControlStyle,
    /// Seconds; 0 runs until stopped.
    #[config(default = 0)]
    pub run_duration: u64,
    #[config(default = "data")]
    pub output_dir: String,
    /// Zero-length encoding of Full-Waveform records.
    #[config(default = false)]
    pub zle: bool,
    /// File names (relative to `output_dir`) the spectra are exported to after the run.
    #[config(default = [])]
    pub spectrum_exports: Vec<String>,
}

#[derive(Config, Debug, Clone)]
pub struct ChannelSettings {
    #[config(default = 8)]
    pub num_channels: usize,
    pub en_chans: EnabledChannels,
    pub polarity: Option<ChannelValue<Polarity>>,
    pub trig_thr: Option<ChannelValue<u16>>,
    pub dc_offset: Option<ChannelValue<f64>>,
    #[config(default = 1024)]
    pub record_len: usize,
    #[config(default = 100)]
    pub pre_trig_len: usize,
    #[config(default = 0)]
    pub baseline_start: usize,
    #[config(default = 50)]
    pub baseline_stop: usize,
    #[config(default = 0)]
    pub psd_total_start: i64,
    #[config(default = 150)]
    pub psd_total_stop: i64,
    #[config(default = 10)]
    pub psd_tail_start: i64,
    #[config(default = 150)]
    pub psd_tail_stop: i64,
    pub data_reduction: Option<ChannelValue<usize>>,
    pub zle_threshold: Option<ChannelValue<u16>>,
    #[config(default = 8)]
    pub zle_look_back: usize,
    #[config(default = 8)]
    pub zle_look_forward: usize,
    #[config(default = "Fall")]
    pub zle_edge: ZeroSuppressionEdge,
}

#[derive(Config, Debug, Clone)]
pub struct HistogramSettings {
    #[config(default = "PulseHeight")]
    pub spectrum_quantity: SpectrumQuantity,
    #[config(default = 200)]
    pub spectrum_bins: usize,
    #[config(default = 0.0)]
    pub spectrum_min: f64,
    #[config(default = 4096.0)]
    pub spectrum_max: f64,
    #[config(default = 150)]
    pub psd_total_bins: usize,
    #[config(default = 0.0)]
    pub psd_total_min: f64,
    #[config(default = 60000.0)]
    pub psd_total_max: f64,
    #[config(default = 150)]
    pub psd_param_bins: usize,
    #[config(default = 0.0)]
    pub psd_param_min: f64,
    #[config(default = 1.0)]
    pub psd_param_max: f64,
    #[config(default = "TailToTotal")]
    pub psd_parameter: PsdParameter,
    #[config(default = 0.0)]
    pub psd_threshold: f64,
    /// Lower discriminator level; without `uld` the window is open above.
    pub lld: Option<ChannelValue<f64>>,
    /// Upper discriminator level; without `lld` the window is open below.
    pub uld: Option<ChannelValue<f64>>,
    pub trigger_channel: Option<usize>,
}

#[derive(Config, Debug, Clone)]
pub struct RecordSettings {
    #[config(default = true)]
    pub enabled: bool,
    #[config(default = "run.h5")]
    pub output_file: String,
    #[config(default = 100000)]
    pub max_events: usize,
    #[config(default = 50)]
    pub buffer_capacity: usize,
    pub raw_trace: Option<ChannelValue<bool>>,
    pub derived: Option<ChannelValue<bool>>,
}

#[derive(Config, Debug, Clone)]
pub struct CalibrationSettings {
    /// Channel number to calibration point file.
    pub files: Option<HashMap<String, String>>,
    #[config(default = true)]
    pub activate: bool,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum EnabledChannels {
    All(bool),
    List(Vec<usize>),
}

impl EnabledChannels {
    pub fn contains(&self, channel: usize) -> bool {
        match self {
            EnabledChannels::All(all) => *all,
            EnabledChannels::List(channels) => channels.contains(&channel),
        }
    }
}

/// A setting given either once for the board or as a `{ "<channel>" = value }` table.
#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum ChannelValue<T> {
    Global(T),
    PerChannel(HashMap<String, T>),
}

impl<T: Clone> ChannelValue<T> {
    pub fn get(&self, channel: usize) -> Option<T> {
        match self {
            ChannelValue::Global(value) => Some(value.clone()),
            ChannelValue::PerChannel(map) => map.get(&channel.to_string()).cloned(),
        }
    }
}

fn channel_value<T: Clone>(value: &Option<ChannelValue<T>>, channel: usize) -> Option<T> {
    value.as_ref().and_then(|v| v.get(channel))
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatingMode {
    FullWaveform,
    FeatureList,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlStyle {
    /// Arm, then start with a software command.
    SoftwareStart,
    /// Arm and let an external gate start the board.
    ExternalGate,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    Positive,
    Negative,
}

impl Polarity {
    pub fn sign(self) -> f64 {
        match self {
            Polarity::Positive => 1.0,
            Polarity::Negative => -1.0,
        }
    }
}

/// Which side of the zero-suppression threshold is kept.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZeroSuppressionEdge {
    /// Keep samples at or below the threshold (negative pulses).
    Fall,
    /// Keep samples at or above the threshold.
    Rise,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpectrumQuantity {
    PulseHeight,
    PulseArea,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PsdParameter {
    /// Tail integral on the y axis.
    Tail,
    /// Tail over total on the y axis.
    TailToTotal,
}

/// Half-open sample index window `[start, stop)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleWindow {
    pub start: usize,
    pub stop: usize,
}

/// Signed gate offsets `[start, stop)` relative to an anchor sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateWindow {
    pub start: i64,
    pub stop: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZleSettings {
    pub threshold: u16,
    pub look_back: usize,
    pub look_forward: usize,
    pub edge: ZeroSuppressionEdge,
}

/// Per-channel acquisition and analysis settings, fixed for the duration of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    pub channel: usize,
    pub enabled: bool,
    pub polarity: Polarity,
    pub trigger_threshold: u16,
    pub dc_offset: f64,
    pub baseline: SampleWindow,
    pub psd_total: GateWindow,
    pub psd_tail: GateWindow,
    pub record_length: usize,
    pub pre_trigger: usize,
    /// Persist the raw trace of only every Nth event.
    pub data_reduction: Option<usize>,
    pub zle: Option<ZleSettings>,
}

impl ChannelConfig {
    /// An enabled channel with the board defaults.
    pub fn new(channel: usize) -> Self {
        Self {
            channel,
            enabled: true,
            polarity: Polarity::Positive,
            trigger_threshold: 100,
            dc_offset: 50.0,
            baseline: SampleWindow { start: 0, stop: 50 },
            psd_total: GateWindow {
                start: -10,
                stop: 150,
            },
            psd_tail: GateWindow {
                start: 10,
                stop: 150,
            },
            record_length: 1024,
            pre_trigger: 100,
            data_reduction: None,
            zle: None,
        }
    }
}

/// Everything a session needs for one run, resolved from the configuration file.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub board_id: usize,
    pub mode: OperatingMode,
    pub control_style: ControlStyle,
    /// Zero-length encoded readout (Full-Waveform only).
    pub zle: bool,
    pub run_duration: Option<Duration>,
    pub channels: Vec<ChannelConfig>,
    pub histograms: HistogramConfig,
    pub records: Vec<RecordFields>,
}

impl SessionConfig {
    /// A software-started, untimed configuration with `num_channels` default channels.
    pub fn new(mode: OperatingMode, num_channels: usize) -> Self {
        Self {
            board_id: 0,
            mode,
            control_style: ControlStyle::SoftwareStart,
            zle: false,
            run_duration: None,
            channels: (0..num_channels).map(ChannelConfig::new).collect(),
            histograms: HistogramConfig::new(num_channels),
            records: vec![RecordFields::default(); num_channels],
        }
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }

    pub fn validate(&self) -> DaqResult<()> {
        if self.channels.is_empty() || self.channels.len() > MAX_CHANNELS {
            return Err(DaqError::Config(format!(
                "number of channels must be 1..={MAX_CHANNELS}, got {}",
                self.channels.len()
            )));
        }
        if self.histograms.windows.len() != self.channels.len()
            || self.records.len() != self.channels.len()
        {
            return Err(DaqError::Config(
                "per-channel histogram and record settings must cover every channel".into(),
            ));
        }
        if self.zle && self.mode == OperatingMode::FeatureList {
            return Err(DaqError::Config(
                "zero-length encoding is only available in FullWaveform mode".into(),
            ));
        }
        for ch in self.enabled_channels() {
            if ch.record_length == 0 || ch.record_length % 2 != 0 {
                return Err(DaqError::Config(format!(
                    "channel {}: record length must be even and non-zero, got {}",
                    ch.channel, ch.record_length
                )));
            }
            if ch.baseline.start >= ch.baseline.stop {
                return Err(DaqError::Config(format!(
                    "channel {}: empty baseline window [{}, {})",
                    ch.channel, ch.baseline.start, ch.baseline.stop
                )));
            }
            if self.zle && ch.zle.is_none() {
                return Err(DaqError::Config(format!(
                    "channel {}: zero-length encoding enabled without a threshold",
                    ch.channel
                )));
            }
        }
        if let Some(trigger) = self.histograms.trigger_channel {
            match self.channels.get(trigger) {
                None => {
                    return Err(DaqError::Config(format!(
                        "trigger channel {trigger} does not exist"
                    )))
                }
                Some(ch) if !ch.enabled => {
                    return Err(DaqError::Config(format!(
                        "trigger channel {trigger} is not enabled"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl Conf {
    pub fn load(path: &str) -> Result<Self, confique::Error> {
        Conf::builder().file(path).load()
    }

    pub fn session_config(&self) -> DaqResult<SessionConfig> {
        let run = &self.run_settings;
        let chans = &self.channel_settings;
        let hist = &self.histogram_settings;
        let rec = &self.record_settings;

        let channels = (0..chans.num_channels)
            .map(|ch| ChannelConfig {
                channel: ch,
                enabled: chans.en_chans.contains(ch),
                polarity: channel_value(&chans.polarity, ch).unwrap_or_default(),
                trigger_threshold: channel_value(&chans.trig_thr, ch).unwrap_or(100),
                dc_offset: channel_value(&chans.dc_offset, ch).unwrap_or(50.0),
                baseline: SampleWindow {
                    start: chans.baseline_start,
                    stop: chans.baseline_stop,
                },
                psd_total: GateWindow {
                    start: chans.psd_total_start,
                    stop: chans.psd_total_stop,
                },
                psd_tail: GateWindow {
                    start: chans.psd_tail_start,
                    stop: chans.psd_tail_stop,
                },
                record_length: chans.record_len,
                pre_trigger: chans.pre_trig_len,
                data_reduction: channel_value(&chans.data_reduction, ch).filter(|&n| n > 1),
                zle: channel_value(&chans.zle_threshold, ch).map(|threshold| ZleSettings {
                    threshold,
                    look_back: chans.zle_look_back,
                    look_forward: chans.zle_look_forward,
                    edge: chans.zle_edge,
                }),
            })
            .collect();

        let windows = (0..chans.num_channels)
            .map(|ch| {
                match (channel_value(&hist.lld, ch), channel_value(&hist.uld, ch)) {
                    (None, None) => None,
                    (low, high) => Some(DiscriminatorWindow {
                        low: low.unwrap_or(f64::NEG_INFINITY),
                        high: high.unwrap_or(f64::INFINITY),
                    }),
                }
            })
            .collect();

        let histograms = HistogramConfig {
            spectrum: AxisSpec::new(hist.spectrum_bins, hist.spectrum_min, hist.spectrum_max),
            psd_total: AxisSpec::new(hist.psd_total_bins, hist.psd_total_min, hist.psd_total_max),
            psd_param: AxisSpec::new(hist.psd_param_bins, hist.psd_param_min, hist.psd_param_max),
            psd_threshold: hist.psd_threshold,
            psd_parameter: hist.psd_parameter,
            quantity: hist.spectrum_quantity,
            windows,
            trigger_channel: hist.trigger_channel,
        };

        if rec.enabled && rec.max_events == 0 {
            return Err(DaqError::Config(
                "record_settings.max_events must be at least 1".into(),
            ));
        }
        let records = (0..chans.num_channels)
            .map(|ch| {
                if rec.enabled {
                    RecordFields {
                        raw_trace: channel_value(&rec.raw_trace, ch).unwrap_or(false),
                        derived: channel_value(&rec.derived, ch).unwrap_or(true),
                    }
                } else {
                    RecordFields::none()
                }
            })
            .collect();

        let config = SessionConfig {
            board_id: run.board_id,
            mode: run.mode,
            control_style: run.control_style,
            zle: run.zle,
            run_duration: (run.run_duration > 0).then(|| Duration::from_secs(run.run_duration)),
            channels,
            histograms,
            records,
        };
        config.validate()?;
        Ok(config)
    }

    /// Calibration point files keyed by channel.
    pub fn calibration_files(&self) -> DaqResult<Vec<(usize, PathBuf)>> {
        let Some(files) = &self.calibration_settings.files else {
            return Ok(Vec::new());
        };
        let mut out = files
            .iter()
            .map(|(ch, path)| {
                ch.parse::<usize>()
                    .map(|ch| (ch, PathBuf::from(path)))
                    .map_err(|_| DaqError::Config(format!("bad calibration channel {ch:?}")))
            })
            .collect::<DaqResult<Vec<_>>>()?;
        out.sort();
        Ok(out)
    }

    pub fn output_path(&self, file: &str) -> PathBuf {
        PathBuf::from(&self.run_settings.output_dir).join(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
[run_settings]
mode = "FeatureList"
control_style = "ExternalGate"
run_duration = 30
spectrum_exports = ["spectra.csv"]

[channel_settings]
num_channels = 4
en_chans = [0, 2]
polarity = "Negative"
trig_thr = { "0" = 200, "2" = 300 }
data_reduction = { "2" = 10 }

[histogram_settings]
lld = 100.0
uld = { "0" = 900.0 }
trigger_channel = 0

[record_settings]
raw_trace = { "2" = true }

[calibration_settings]
files = { "2" = "cal/ch2.txt", "0" = "cal/ch0.txt" }
"#;

    fn load(text: &str) -> Conf {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        Conf::load(file.path().to_str().unwrap()).unwrap()
    }

    #[test]
    fn resolves_per_channel_values() {
        let conf = load(CONFIG);
        let session = conf.session_config().unwrap();

        assert_eq!(session.mode, OperatingMode::FeatureList);
        assert_eq!(session.control_style, ControlStyle::ExternalGate);
        assert_eq!(session.run_duration, Some(Duration::from_secs(30)));
        assert_eq!(session.channels.len(), 4);
        assert!(session.channels[0].enabled);
        assert!(!session.channels[1].enabled);
        assert_eq!(session.channels[2].polarity, Polarity::Negative);
        assert_eq!(session.channels[0].trigger_threshold, 200);
        assert_eq!(session.channels[1].trigger_threshold, 100);
        assert_eq!(session.channels[2].data_reduction, Some(10));
        assert_eq!(session.channels[0].data_reduction, None);

        assert_eq!(
            session.histograms.windows[0],
            Some(DiscriminatorWindow {
                low: 100.0,
                high: 900.0
            })
        );
        assert_eq!(
            session.histograms.windows[2],
            Some(DiscriminatorWindow {
                low: 100.0,
                high: f64::INFINITY
            })
        );
        assert_eq!(session.histograms.trigger_channel, Some(0));

        assert!(session.records[2].raw_trace);
        assert!(!session.records[0].raw_trace);
        assert!(session.records[0].derived);

        let files = conf.calibration_files().unwrap();
        assert_eq!(files[0], (0, PathBuf::from("cal/ch0.txt")));
        assert_eq!(files[1], (2, PathBuf::from("cal/ch2.txt")));
    }

    #[test]
    fn rejects_zle_in_feature_list_mode() {
        let conf = load(&CONFIG.replace(
            "run_duration = 30",
            "run_duration = 30\nzle = true",
        ));
        assert!(matches!(conf.session_config(), Err(DaqError::Config(_))));
    }

    #[test]
    fn lone_upper_level_opens_the_window_below() {
        let conf = load(&CONFIG.replace("lld = 100.0\n", ""));
        let session = conf.session_config().unwrap();
        assert_eq!(
            session.histograms.windows[0],
            Some(DiscriminatorWindow {
                low: f64::NEG_INFINITY,
                high: 900.0
            })
        );
        assert_eq!(session.histograms.windows[2], None);
    }

    #[test]
    fn rejects_disabled_trigger_channel() {
        let conf = load(&CONFIG.replace("trigger_channel = 0", "trigger_channel = 1"));
        assert!(matches!(conf.session_config(), Err(DaqError::Config(_))));

        let mut config = SessionConfig::new(OperatingMode::FullWaveform, 2);
        config.histograms.trigger_channel = Some(1);
        assert!(config.validate().is_ok());
        config.channels[1].enabled = false;
        assert!(config.validate().is_err());
        config.histograms.trigger_channel = Some(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_events_when_recording() {
        let text = CONFIG.replace(
            "[record_settings]\n",
            "[record_settings]\nmax_events = 0\n",
        );
        assert!(matches!(load(&text).session_config(), Err(DaqError::Config(_))));
        let disabled = text.replace("max_events = 0", "max_events = 0\nenabled = false");
        assert!(load(&disabled).session_config().is_ok());
    }

    #[test]
    fn rejects_odd_record_length() {
        let mut config = SessionConfig::new(OperatingMode::FullWaveform, 2);
        config.channels[1].record_length = 1023;
        assert!(config.validate().is_err());
        config.channels[1].enabled = false;
        assert!(config.validate().is_ok());
    }
}
