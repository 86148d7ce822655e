use crate::{AnalyzedEvent, RawEvent, RunMetadata, SessionConfig};
use anyhow::Result;

/// Which parts of a channel event are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFields {
    pub raw_trace: bool,
    pub derived: bool,
}

impl Default for RecordFields {
    fn default() -> Self {
        Self {
            raw_trace: false,
            derived: true,
        }
    }
}

impl RecordFields {
    pub fn none() -> Self {
        Self {
            raw_trace: false,
            derived: false,
        }
    }

    pub fn any(&self) -> bool {
        self.raw_trace || self.derived
    }
}

/// Quantities computed for a channel event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedFields {
    pub board_id: usize,
    pub channel: usize,
    pub timestamp: u64,
    pub baseline: f64,
    pub height: f64,
    pub area: f64,
    pub psd_total: f64,
    pub psd_tail: f64,
}

impl From<&AnalyzedEvent> for DerivedFields {
    fn from(event: &AnalyzedEvent) -> Self {
        Self {
            board_id: event.board_id,
            channel: event.channel,
            timestamp: event.timestamp,
            baseline: event.baseline,
            height: event.height,
            area: event.area,
            psd_total: event.psd_total,
            psd_tail: event.psd_tail,
        }
    }
}

/// One persisted channel event. At least one of the fields is set.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord<'a> {
    pub channel: usize,
    pub trace: Option<&'a [u16]>,
    pub derived: Option<DerivedFields>,
}

/// Destination for event records.
pub trait RecordSink {
    /// Called before the first record of run `run` (counted from 0).
    fn begin_run(&mut self, _run: usize) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, record: &EventRecord) -> Result<()>;

    /// Called once when the run stops.
    fn finalize(&mut self, metadata: &RunMetadata) -> Result<()>;
}

/// Applies the per-channel field selection and data reduction before handing
/// records to the sink.
pub struct RecordEmitter {
    fields: Vec<RecordFields>,
    reduction: Vec<Option<usize>>,
    traces_seen: Vec<u64>,
    written: u64,
    runs: usize,
    sink: Option<Box<dyn RecordSink>>,
}

impl RecordEmitter {
    pub fn new(config: &SessionConfig, sink: Option<Box<dyn RecordSink>>) -> Self {
        Self {
            fields: config.records.clone(),
            reduction: config.channels.iter().map(|c| c.data_reduction).collect(),
            traces_seen: vec![0; config.channels.len()],
            written: 0,
            runs: 0,
            sink,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Pick up new field selections and clear the reduction counters.
    pub fn reset(&mut self, config: &SessionConfig) {
        self.fields = config.records.clone();
        self.reduction = config.channels.iter().map(|c| c.data_reduction).collect();
        self.traces_seen = vec![0; config.channels.len()];
        self.written = 0;
    }

    /// Open the next run on the sink. Run numbers are not reused, even when
    /// opening fails.
    pub fn begin_run(&mut self) -> Result<()> {
        let run = self.runs;
        self.runs += 1;
        match self.sink.as_mut() {
            Some(sink) => sink.begin_run(run),
            None => Ok(()),
        }
    }

    /// Persist one channel event. Returns whether anything was written.
    pub fn emit(&mut self, raw: &RawEvent, event: &AnalyzedEvent) -> Result<bool> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(false);
        };
        let channel = event.channel;
        let fields = self
            .fields
            .get(channel)
            .copied()
            .unwrap_or_else(RecordFields::none);

        let mut keep_trace = fields.raw_trace && !raw.samples.is_empty();
        if keep_trace {
            if let Some(n) = self.reduction.get(channel).copied().flatten() {
                self.traces_seen[channel] += 1;
                keep_trace = self.traces_seen[channel] % n as u64 == 0;
            }
        }

        let record = EventRecord {
            channel,
            trace: keep_trace.then_some(raw.samples.as_slice()),
            derived: fields.derived.then(|| DerivedFields::from(event)),
        };
        if record.trace.is_none() && record.derived.is_none() {
            return Ok(false);
        }
        sink.write(&record)?;
        self.written += 1;
        Ok(true)
    }

    pub fn finalize(&mut self, metadata: &RunMetadata) -> Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.finalize(metadata),
            None => Ok(()),
        }
    }
}

#[cfg(feature = "hdf5")]
pub use self::h5::Hdf5RecordSink;

#[cfg(feature = "hdf5")]
mod h5 {
    use super::{EventRecord, RecordSink};
    use crate::{RunMetadata, SessionConfig};
    use anyhow::{anyhow, ensure, Result};
    use hdf5::{Dataset, File, Group, H5Type};
    use log::{info, warn};
    use ndarray::{s, Array2};
    use std::path::Path;

    /// HDF5 record sink: one `run{n}` group per run holding a `ch{n}` group
    /// per recorded channel.
    ///
    /// Traces go to `waveforms` (`max_events` x record length, zero padded) with
    /// their true length in `trace_lengths`. Derived fields go to `features`
    /// (baseline, height, area, psd total, psd tail), `timestamps` and `ids`
    /// (board, channel). Run metadata is stored as attributes of the run group.
    pub struct Hdf5RecordSink {
        pub file: File,
        layout: Vec<Option<ChannelLayout>>,
        max_events: usize,
        capacity: usize,
        run: Option<RunData>,
    }

    #[derive(Debug, Clone, Copy)]
    struct ChannelLayout {
        channel: usize,
        record_length: Option<usize>,
        derived: bool,
    }

    struct RunData {
        group: Group,
        channels: Vec<Option<ChannelData>>,
    }

    impl Hdf5RecordSink {
        pub fn create(
            path: &Path,
            config: &SessionConfig,
            max_events: usize,
            buffer_capacity: usize,
        ) -> Result<Self> {
            ensure!(max_events > 0, "max_events must be at least 1");
            let file = File::create(path)?;
            let layout = config
                .channels
                .iter()
                .zip(&config.records)
                .map(|(ch, fields)| {
                    (ch.enabled && fields.any()).then(|| ChannelLayout {
                        channel: ch.channel,
                        record_length: fields.raw_trace.then_some(ch.record_length),
                        derived: fields.derived,
                    })
                })
                .collect();
            info!("Recording to {}", path.display());
            Ok(Self {
                file,
                layout,
                max_events,
                capacity: buffer_capacity.clamp(1, max_events),
                run: None,
            })
        }

        pub fn flush_all(&mut self) -> Result<()> {
            if let Some(run) = &mut self.run {
                for data in run.channels.iter_mut().flatten() {
                    data.flush()?;
                }
            }
            Ok(())
        }
    }

    impl RecordSink for Hdf5RecordSink {
        fn begin_run(&mut self, run: usize) -> Result<()> {
            if self.run.is_some() {
                warn!("run {run} opened before the previous run was finalized");
                self.flush_all()?;
            }
            let group = self.file.create_group(&format!("run{run}"))?;
            let channels = self
                .layout
                .iter()
                .map(|layout| -> Result<Option<ChannelData>> {
                    let Some(layout) = layout else {
                        return Ok(None);
                    };
                    let ch_group = group.create_group(&format!("ch{}", layout.channel))?;
                    ChannelData::new(
                        &ch_group,
                        layout.record_length,
                        layout.derived,
                        self.max_events,
                        self.capacity,
                    )
                    .map(Some)
                })
                .collect::<Result<Vec<_>>>()?;
            self.run = Some(RunData { group, channels });
            Ok(())
        }

        fn write(&mut self, record: &EventRecord) -> Result<()> {
            let run = self
                .run
                .as_mut()
                .ok_or_else(|| anyhow!("no run open for recording"))?;
            let data = run
                .channels
                .get_mut(record.channel)
                .and_then(Option::as_mut)
                .ok_or_else(|| anyhow!("channel {} is not being recorded", record.channel))?;
            data.append(record)
        }

        fn finalize(&mut self, metadata: &RunMetadata) -> Result<()> {
            self.flush_all()?;
            let Some(run) = self.run.take() else {
                return Ok(());
            };
            for data in run.channels.iter().flatten() {
                data.write_entries()?;
            }
            let group = &run.group;
            scalar_attr(group, "start_unix", metadata.start.unix_timestamp())?;
            if let Some(stop) = metadata.stop {
                scalar_attr(group, "stop_unix", stop.unix_timestamp())?;
            }
            scalar_attr(group, "duration_s", metadata.actual_duration.as_secs_f64())?;
            scalar_attr(group, "timed_out", u8::from(metadata.timed_out))?;
            scalar_attr(group, "events", metadata.events)?;
            scalar_attr(group, "skipped", metadata.skipped)?;
            self.file.flush()?;
            Ok(())
        }
    }

    fn scalar_attr<T: H5Type>(location: &Group, name: &str, value: T) -> Result<()> {
        location
            .new_attr::<T>()
            .shape(())
            .create(name)?
            .write_scalar(&value)?;
        Ok(())
    }

    struct ChannelData {
        group: Group,
        waveforms: Option<(BufferedDataset<u16>, BufferedDataset<u32>)>,
        derived: Option<DerivedData>,
    }

    struct DerivedData {
        features: BufferedDataset<f64>,
        timestamps: BufferedDataset<u64>,
        ids: BufferedDataset<u32>,
    }

    impl ChannelData {
        fn new(
            group: &Group,
            record_length: Option<usize>,
            derived: bool,
            max_events: usize,
            capacity: usize,
        ) -> Result<Self> {
            let waveforms = match record_length {
                Some(len) => Some((
                    BufferedDataset::new(group, "waveforms", len, max_events, capacity)?,
                    BufferedDataset::new(group, "trace_lengths", 1, max_events, capacity)?,
                )),
                None => None,
            };
            let derived = if derived {
                Some(DerivedData {
                    features: BufferedDataset::new(group, "features", 5, max_events, capacity)?,
                    timestamps: BufferedDataset::new(group, "timestamps", 1, max_events, capacity)?,
                    ids: BufferedDataset::new(group, "ids", 2, max_events, capacity)?,
                })
            } else {
                None
            };
            Ok(Self {
                group: group.clone(),
                waveforms,
                derived,
            })
        }

        fn append(&mut self, record: &EventRecord) -> Result<()> {
            if let (Some(trace), Some((waveforms, lengths))) = (record.trace, &mut self.waveforms) {
                waveforms.append(trace)?;
                lengths.append(&[trace.len() as u32])?;
            }
            if let (Some(d), Some(data)) = (&record.derived, &mut self.derived) {
                data.features
                    .append(&[d.baseline, d.height, d.area, d.psd_total, d.psd_tail])?;
                data.timestamps.append(&[d.timestamp])?;
                data.ids.append(&[d.board_id as u32, d.channel as u32])?;
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            if let Some((waveforms, lengths)) = &mut self.waveforms {
                waveforms.flush()?;
                lengths.flush()?;
            }
            if let Some(data) = &mut self.derived {
                data.features.flush()?;
                data.timestamps.flush()?;
                data.ids.flush()?;
            }
            Ok(())
        }

        /// Number of valid rows, since the datasets are preallocated.
        fn write_entries(&self) -> Result<()> {
            if let Some((waveforms, _)) = &self.waveforms {
                scalar_attr(&self.group, "trace_entries", waveforms.current as u64)?;
            }
            if let Some(data) = &self.derived {
                scalar_attr(&self.group, "derived_entries", data.features.current as u64)?;
            }
            Ok(())
        }
    }

    /// A `(max_events, width)` dataset filled through an in-memory chunk buffer.
    struct BufferedDataset<T> {
        dataset: Dataset,
        buffer: Array2<T>,
        count: usize,
        current: usize,
        max_events: usize,
        full: bool,
    }

    impl<T: H5Type + Copy + Default> BufferedDataset<T> {
        fn new(
            group: &Group,
            name: &str,
            width: usize,
            max_events: usize,
            capacity: usize,
        ) -> Result<Self> {
            let dataset = group
                .new_dataset::<T>()
                .shape((max_events, width))
                .chunk((capacity, width))
                .create(name)?;
            Ok(Self {
                dataset,
                buffer: Array2::from_elem((capacity, width), T::default()),
                count: 0,
                current: 0,
                max_events,
                full: false,
            })
        }

        /// Rows longer than the width are truncated, shorter ones zero padded.
        fn append(&mut self, row: &[T]) -> Result<()> {
            if self.current + self.count >= self.max_events {
                if !self.full {
                    warn!(
                        "{}: maximum number of events ({}) reached, dropping further rows",
                        self.dataset.name(),
                        self.max_events
                    );
                    self.full = true;
                }
                return Ok(());
            }
            let width = self.buffer.ncols();
            let n = row.len().min(width);
            let mut slot = self.buffer.row_mut(self.count);
            slot.fill(T::default());
            slot.slice_mut(s![..n])
                .iter_mut()
                .zip(&row[..n])
                .for_each(|(dst, src)| *dst = *src);
            self.count += 1;

            if self.count == self.buffer.nrows() {
                self.flush()?;
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            if self.count == 0 {
                return Ok(());
            }
            let rows = self.buffer.slice(s![0..self.count, ..]).to_owned();
            self.dataset
                .write_slice(&rows, (self.current..self.current + self.count, ..))?;
            self.current += self.count;
            self.count = 0;
            Ok(())
        }
    }
}
