use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use flate2::read::GzDecoder;
use log::info;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

///
/// Open a file for reading, and return a buffered reader
/// * `path` - file name--either gzipped or not
pub fn open_buf_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    match path.extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

fn is_data_line(line: &str) -> bool {
    !(line.trim().is_empty() || line.starts_with('#') || line.starts_with('%'))
}

fn data_lines(path: &Path) -> Result<Vec<String>> {
    Ok(open_buf_reader(path)?
        .lines()
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .filter(|x| is_data_line(x))
        .collect())
}

///
/// Read a dense whitespace- or tab-separated matrix, one example per row
/// * `path` - file name--either gzipped or not
/// * `dtype` - element type of the returned tensor
/// * `device` - where the tensor lives
pub fn read_matrix(path: &Path, dtype: DType, device: &Device) -> Result<Tensor> {
    let lines = data_lines(path)?;

    // parsing dominates, so rows are parsed in parallel
    let rows: Vec<Vec<f64>> = lines
        .par_iter()
        .enumerate()
        .map(|(i, line)| {
            line.split_whitespace()
                .map(|x| {
                    x.parse::<f64>()
                        .map_err(|e| anyhow::anyhow!("row {}: {:?}: {}", i + 1, x, e))
                })
                .collect::<Result<Vec<f64>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    let ncol = match rows.first() {
        Some(r) => r.len(),
        None => anyhow::bail!("{} holds no data", path.display()),
    };
    if let Some(i) = rows.iter().position(|r| r.len() != ncol) {
        anyhow::bail!(
            "{}: row {} has {} columns, expected {}",
            path.display(),
            i + 1,
            rows[i].len(),
            ncol
        );
    }
    let nrow = rows.len();
    info!("read {} x {} matrix from {}", nrow, ncol, path.display());

    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, (nrow, ncol), &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)?)
}

///
/// Read one integer class label per line and return one-hot rows
/// * `path` - file name--either gzipped or not
/// * `n_classes` - number of classes; labels must lie in `[0, n_classes)`
pub fn read_one_hot_labels(
    path: &Path,
    n_classes: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let labels = data_lines(path)?
        .iter()
        .map(|x| x.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if let Some(bad) = labels.iter().find(|&&k| k >= n_classes) {
        anyhow::bail!("label {} is outside [0, {})", bad, n_classes);
    }
    let mut one_hot = vec![0f64; labels.len() * n_classes];
    for (i, &k) in labels.iter().enumerate() {
        one_hot[i * n_classes + k] = 1.0;
    }
    Ok(Tensor::from_vec(one_hot, (labels.len(), n_classes), &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)?)
}
