//! Binary PPM (P6) output for decoded frames.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::{BackendError, DecodedFrame, OutputFormat};

/// Writes `frame` as a P6 image. Row padding is dropped and BGR is swapped to RGB.
pub fn write_ppm<W: Write>(mut writer: W, frame: &DecodedFrame) -> Result<(), BackendError> {
    let row_bytes = frame.row_bytes();
    if frame.linesize < row_bytes || frame.data.len() < frame.linesize * frame.dims.height_usize()
    {
        return Err(BackendError::InvalidInput(format!(
            "frame buffer of {} bytes does not hold {} rows of linesize {}",
            frame.data.len(),
            frame.height(),
            frame.linesize
        )));
    }

    write!(writer, "P6\n{} {}\n255\n", frame.width(), frame.height())?;
    let mut rgb = vec![0u8; row_bytes];
    for row in frame.rows() {
        match frame.format {
            OutputFormat::Rgb24 => writer.write_all(row)?,
            OutputFormat::Bgr24 => {
                for (dst, src) in rgb.chunks_exact_mut(3).zip(row.chunks_exact(3)) {
                    dst.copy_from_slice(&[src[2], src[1], src[0]]);
                }
                writer.write_all(&rgb)?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn save_ppm(path: impl AsRef<Path>, frame: &DecodedFrame) -> Result<(), BackendError> {
    let file = File::create(path.as_ref())?;
    write_ppm(BufWriter::new(file), frame)
}
