//! Spectrum export, format picked by file extension.
//!
//! `.dat` (tab separated) and `.csv` (comma separated) hold `(bin center,
//! content)` rows for a spectrum. A PSD histogram starts with the
//! `bins, min, max` line of the x axis and then of the y axis, followed by one
//! row of contents per x bin. `.h5`/`.hdf5` store the counts as a dataset with
//! the axes as attributes.

use crate::{AxisSpec, PsdHistogram, Spectrum};
use anyhow::Result;
use log::{debug, info};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text(char),
    #[cfg(feature = "hdf5")]
    Hdf5,
}

fn format_for(path: &Path) -> Option<Format> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "dat" => Some(Format::Text('\t')),
        "csv" => Some(Format::Text(',')),
        #[cfg(feature = "hdf5")]
        "h5" | "hdf5" => Some(Format::Hdf5),
        _ => None,
    }
}

/// Write `spectrum` to `path`. Returns `Ok(false)` for an unsupported extension.
pub fn export_spectrum(spectrum: &Spectrum, path: &Path) -> Result<bool> {
    let Some(format) = format_for(path) else {
        debug!("no spectrum exporter for {}", path.display());
        return Ok(false);
    };
    match format {
        Format::Text(sep) => {
            let mut out = BufWriter::new(File::create(path)?);
            for (center, count) in spectrum.rows() {
                writeln!(out, "{center}{sep}{count}")?;
            }
            out.flush()?;
        }
        #[cfg(feature = "hdf5")]
        Format::Hdf5 => h5::write_spectrum(spectrum, path)?,
    }
    info!("Spectrum written to {}", path.display());
    Ok(true)
}

/// Write `hist` to `path`. Returns `Ok(false)` for an unsupported extension.
pub fn export_psd(hist: &PsdHistogram, path: &Path) -> Result<bool> {
    let Some(format) = format_for(path) else {
        debug!("no PSD exporter for {}", path.display());
        return Ok(false);
    };
    match format {
        Format::Text(sep) => {
            let mut out = BufWriter::new(File::create(path)?);
            write_axis(&mut out, hist.x_axis(), sep)?;
            write_axis(&mut out, hist.y_axis(), sep)?;
            for row in hist.counts().rows() {
                let line: Vec<String> = row.iter().map(u64::to_string).collect();
                writeln!(out, "{}", line.join(&sep.to_string()))?;
            }
            out.flush()?;
        }
        #[cfg(feature = "hdf5")]
        Format::Hdf5 => h5::write_psd(hist, path)?,
    }
    info!("PSD histogram written to {}", path.display());
    Ok(true)
}

fn write_axis<W: Write>(out: &mut W, axis: &AxisSpec, sep: char) -> Result<()> {
    writeln!(out, "{}{sep}{}{sep}{}", axis.bins, axis.min, axis.max)?;
    Ok(())
}

#[cfg(feature = "hdf5")]
mod h5 {
    use crate::{AxisSpec, PsdHistogram, Spectrum};
    use anyhow::Result;
    use hdf5::{Dataset, File, H5Type};
    use std::path::Path;

    pub(super) fn write_spectrum(spectrum: &Spectrum, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let dataset = file
            .new_dataset::<u64>()
            .shape(spectrum.counts().len())
            .create("Spectrum")?;
        dataset.write(spectrum.counts())?;
        axis_attrs(&dataset, "", spectrum.axis())?;
        attr(&dataset, "underflow", spectrum.underflow())?;
        attr(&dataset, "overflow", spectrum.overflow())?;
        Ok(())
    }

    pub(super) fn write_psd(hist: &PsdHistogram, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let dataset = file
            .new_dataset::<u64>()
            .shape(hist.counts().dim())
            .create("PSDHistogram")?;
        dataset.write(hist.counts())?;
        axis_attrs(&dataset, "x_", hist.x_axis())?;
        axis_attrs(&dataset, "y_", hist.y_axis())?;
        Ok(())
    }

    fn axis_attrs(dataset: &Dataset, prefix: &str, axis: &AxisSpec) -> Result<()> {
        attr(dataset, &format!("{prefix}bins"), axis.bins as u64)?;
        attr(dataset, &format!("{prefix}min"), axis.min)?;
        attr(dataset, &format!("{prefix}max"), axis.max)?;
        Ok(())
    }

    fn attr<T: H5Type>(dataset: &Dataset, name: &str, value: T) -> Result<()> {
        dataset
            .new_attr::<T>()
            .shape(())
            .create(name)?
            .write_scalar(&value)?;
        Ok(())
    }
}
