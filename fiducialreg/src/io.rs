//! Multi-page grayscale TIFF stacks as `(z, y, x)` volumes.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::debug;
use ndarray::{Array3, ArrayView3, Axis};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};

use crate::error::{RegistrationError, Result};

fn to_f64(image: DecodingResult) -> Result<Vec<f64>> {
    Ok(match image {
        DecodingResult::U8(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I8(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::F32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::F64(buf) => buf,
        _ => {
            return Err(RegistrationError::InvalidVolume(
                "unsupported TIFF sample format".to_string(),
            ))
        }
    })
}

/// Reads every page of a grayscale TIFF into one volume.
///
/// All pages must share the size of the first one.
pub fn read_tiff_stack(path: &Path) -> Result<Array3<f64>> {
    let file = BufReader::new(File::open(path)?);
    let mut decoder = Decoder::new(file)?.with_limits(Limits::unlimited());

    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);
    let mut voxels = Vec::with_capacity(width * height);
    let mut planes = 0;

    loop {
        match decoder.colortype()? {
            tiff::ColorType::Gray(_) => {}
            other => {
                return Err(RegistrationError::InvalidVolume(format!(
                    "expected a grayscale stack, page {planes} is {other:?}"
                )))
            }
        }
        let page_size = decoder.dimensions()?;
        if (page_size.0 as usize, page_size.1 as usize) != (width, height) {
            return Err(RegistrationError::InvalidVolume(format!(
                "page {planes} is {}x{}, expected {width}x{height}",
                page_size.0, page_size.1
            )));
        }

        voxels.extend(to_f64(decoder.read_image()?)?);
        planes += 1;

        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    debug!("read {planes} pages of {width}x{height} from {}", path.display());
    Array3::from_shape_vec((planes, height, width), voxels)
        .map_err(|e| RegistrationError::InvalidVolume(e.to_string()))
}

/// Writes a volume as 32-bit float pages, one per z plane.
pub fn write_tiff_stack(path: &Path, volume: ArrayView3<f64>) -> Result<()> {
    let (_, height, width) = volume.dim();
    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    for plane in volume.axis_iter(Axis(0)) {
        let pixels: Vec<f32> = plane.iter().map(|v| *v as f32).collect();
        encoder.write_image::<colortype::Gray32Float>(width as u32, height as u32, &pixels)?;
    }
    Ok(())
}
