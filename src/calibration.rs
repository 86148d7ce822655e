use crate::{AnalyzedEvent, CalibratedValues, CalibrationError};
use log::{info, warn};
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

/// One (raw unit, energy) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationPoint {
    pub raw: f64,
    pub energy: f64,
}

/// Piecewise-linear map over points sorted jointly by raw unit. The first
/// and last segments extend past the end points.
#[derive(Debug, Clone, PartialEq)]
struct Interpolant {
    knots: Vec<CalibrationPoint>,
}

impl Interpolant {
    fn build(points: &[CalibrationPoint]) -> Option<Self> {
        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| a.raw.total_cmp(&b.raw));

        // On repeated raw units the later entry wins.
        let mut knots: Vec<CalibrationPoint> = Vec::with_capacity(sorted.len());
        for p in sorted {
            match knots.last_mut() {
                Some(last) if last.raw == p.raw => *last = p,
                _ => knots.push(p),
            }
        }
        (knots.len() >= 2).then_some(Self { knots })
    }

    fn eval(&self, x: f64) -> f64 {
        let k = &self.knots;
        let i = k.partition_point(|p| p.raw < x).clamp(1, k.len() - 1);
        let (a, b) = (k[i - 1], k[i]);
        a.energy + (x - a.raw) * (b.energy - a.energy) / (b.raw - a.raw)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationCurve {
    points: Vec<CalibrationPoint>,
    interpolant: Option<Interpolant>,
    enabled: bool,
    out_of_order: bool,
}

impl CalibrationCurve {
    /// Points in index order, as entered.
    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True once a point was entered with a raw unit not above its predecessor.
    pub fn out_of_order(&self) -> bool {
        self.out_of_order
    }

    fn rebuild(&mut self) {
        self.interpolant = Interpolant::build(&self.points);
        if self.enabled && self.interpolant.is_none() {
            warn!("calibration lost its second distinct point, disabling it");
            self.enabled = false;
        }
    }

    fn check_order(&mut self, index: usize) -> bool {
        let raw = self.points[index].raw;
        let before = index
            .checked_sub(1)
            .and_then(|i| self.points.get(i))
            .is_some_and(|p| p.raw >= raw);
        let after = self.points.get(index + 1).is_some_and(|p| p.raw <= raw);
        let ordered = !(before || after);
        self.out_of_order |= !ordered;
        ordered
    }
}

/// Per-channel energy calibration.
#[derive(Debug, Clone, Default)]
pub struct CalibrationEngine {
    curves: Vec<CalibrationCurve>,
}

impl CalibrationEngine {
    pub fn new(num_channels: usize) -> Self {
        Self {
            curves: vec![CalibrationCurve::default(); num_channels],
        }
    }

    /// Match a new channel count. Curves of surviving channels are kept.
    pub fn resize(&mut self, num_channels: usize) {
        self.curves.resize_with(num_channels, CalibrationCurve::default);
    }

    pub fn curve(&self, channel: usize) -> Option<&CalibrationCurve> {
        self.curves.get(channel)
    }

    fn curve_mut(&mut self, channel: usize) -> Result<&mut CalibrationCurve, CalibrationError> {
        self.curves
            .get_mut(channel)
            .ok_or(CalibrationError::NoSuchChannel(channel))
    }

    pub fn is_enabled(&self, channel: usize) -> bool {
        self.curve(channel).is_some_and(CalibrationCurve::is_enabled)
    }

    /// Append the point when `index` equals the current size, overwrite it when smaller.
    pub fn add_point(
        &mut self,
        channel: usize,
        index: usize,
        raw: f64,
        energy: f64,
    ) -> Result<(), CalibrationError> {
        let curve = self.curve_mut(channel)?;
        let size = curve.points.len();
        let point = CalibrationPoint { raw, energy };
        if index == size {
            curve.points.push(point);
        } else if index < size {
            curve.points[index] = point;
        } else {
            return Err(CalibrationError::IndexOutOfRange {
                channel,
                index,
                size,
            });
        }

        if !curve.check_order(index) {
            warn!(
                "channel {channel}: calibration point {index} ({raw}, {energy}) is out of raw-unit order, points are sorted by raw unit for interpolation"
            );
        }
        curve.rebuild();
        Ok(())
    }

    pub fn activate(&mut self, channel: usize) -> Result<(), CalibrationError> {
        let curve = self.curve_mut(channel)?;
        curve.rebuild();
        if curve.interpolant.is_none() {
            curve.enabled = false;
            return Err(CalibrationError::InsufficientPoints {
                channel,
                points: curve.points.len(),
            });
        }
        curve.enabled = true;
        info!(
            "channel {channel}: calibration active with {} points",
            curve.points.len()
        );
        Ok(())
    }

    pub fn reset(&mut self, channel: usize) -> Result<(), CalibrationError> {
        *self.curve_mut(channel)? = CalibrationCurve::default();
        Ok(())
    }

    /// Calibrated value of `raw`, or `None` while the channel is not calibrated.
    pub fn apply(&self, channel: usize, raw: f64) -> Option<f64> {
        let curve = self.curve(channel).filter(|c| c.enabled)?;
        curve.interpolant.as_ref().map(|i| i.eval(raw))
    }

    pub fn calibrate(&self, event: &AnalyzedEvent) -> Option<CalibratedValues> {
        Some(CalibratedValues {
            height: self.apply(event.channel, event.height)?,
            area: self.apply(event.channel, event.area)?,
        })
    }

    /// Replace the channel's points with `<energy> <raw unit>` lines read to
    /// end of stream. Returns the number of points read.
    pub fn load_from<R: BufRead>(
        &mut self,
        channel: usize,
        reader: R,
    ) -> Result<usize, CalibrationError> {
        let mut points = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            let content = line.trim();
            if content.is_empty() || content.starts_with('#') {
                continue;
            }
            let parse_error = || CalibrationError::Parse {
                line: n + 1,
                content: content.to_string(),
            };
            let mut fields = content.split_whitespace();
            let (Some(energy), Some(raw), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(parse_error());
            };
            let energy: f64 = energy.parse().map_err(|_| parse_error())?;
            let raw: f64 = raw.parse().map_err(|_| parse_error())?;
            points.push((raw, energy));
        }

        self.reset(channel)?;
        for (index, &(raw, energy)) in points.iter().enumerate() {
            self.add_point(channel, index, raw, energy)?;
        }
        Ok(points.len())
    }

    pub fn load(&mut self, channel: usize, path: &Path) -> Result<usize, CalibrationError> {
        let n = self.load_from(channel, BufReader::new(File::open(path)?))?;
        info!("channel {channel}: loaded {n} calibration points from {path:?}");
        Ok(n)
    }

    pub fn write_to<W: Write>(&self, channel: usize, mut writer: W) -> Result<(), CalibrationError> {
        let curve = self
            .curve(channel)
            .ok_or(CalibrationError::NoSuchChannel(channel))?;
        for p in &curve.points {
            writeln!(writer, "{:>14.6} {:>14.6}", p.energy, p.raw)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write(&self, channel: usize, path: &Path) -> Result<(), CalibrationError> {
        self.write_to(channel, BufWriter::new(File::create(path)?))?;
        info!("channel {channel}: calibration points written to {path:?}");
        Ok(())
    }
}
