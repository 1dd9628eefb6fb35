use anyhow::{Result, anyhow};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgb, yuyv422_to_rgb,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

/// Pixel layouts a camera driver may hand us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Nv12,
    Yuyv,
    Mjpeg,
    Rgb,
    Bgr,
    Gray,
}

#[derive(Debug)]
pub struct RgbImage {
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Converts a raw driver buffer to packed RGB, optionally mirrored.
pub fn convert_to_rgb(
    layout: PixelLayout,
    data: &[u8],
    width: u32,
    height: u32,
    mirror: bool,
) -> Result<RgbImage> {
    let (mut rgb, width, height) = match layout {
        PixelLayout::Nv12 => (nv12_to_rgb(data, width, height)?, width, height),
        PixelLayout::Yuyv => (yuyv_to_rgb(data, width, height)?, width, height),
        PixelLayout::Mjpeg => mjpeg_to_rgb(data)?,
        PixelLayout::Rgb => (packed_to_rgb(data, width, height, false)?, width, height),
        PixelLayout::Bgr => (packed_to_rgb(data, width, height, true)?, width, height),
        PixelLayout::Gray => (gray_to_rgb(data, width, height)?, width, height),
    };

    if mirror {
        mirror_rows(&mut rgb, width);
    }

    Ok(RgbImage { rgb, width, height })
}

/// Flips every row of a packed RGB buffer horizontally in place.
pub fn mirror_rows(rgb: &mut [u8], width: u32) {
    let stride = width as usize * 3;
    if stride == 0 {
        return;
    }
    rgb.par_chunks_exact_mut(stride).for_each(|row| {
        let mut left = 0;
        let mut right = width as usize - 1;
        while left < right {
            for c in 0..3 {
                row.swap(left * 3 + c, right * 3 + c);
            }
            left += 1;
            right -= 1;
        }
    });
}

fn nv12_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let y_plane_len = width as usize * height as usize;
    let uv_plane_len = y_plane_len / 2;

    if data.len() < y_plane_len + uv_plane_len {
        return Err(anyhow!(
            "NV12 buffer too small: got {}, expected {}",
            data.len(),
            y_plane_len + uv_plane_len
        ));
    }

    let image = YuvBiPlanarImage {
        y_plane: &data[..y_plane_len],
        y_stride: width,
        uv_plane: &data[y_plane_len..y_plane_len + uv_plane_len],
        uv_stride: width,
        width,
        height,
    };

    let mut rgb = vec![0u8; y_plane_len * 3];
    yuv_nv12_to_rgb(
        &image,
        &mut rgb,
        width * 3,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12→RGB failed: {err:?}"))?;

    Ok(rgb)
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize * 2;
    if data.len() < expected_len {
        return Err(anyhow!(
            "YUYV buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: width * 2,
        width,
        height,
    };

    let mut rgb = vec![0u8; width as usize * height as usize * 3];
    yuyv422_to_rgb(
        &packed,
        &mut rgb,
        width * 3,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV422→RGB failed: {err:?}"))?;

    Ok(rgb)
}

/// MJPEG frames carry their own dimensions, which win over the driver's.
fn mjpeg_to_rgb(data: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgb = decoder
        .decode()
        .map_err(|err| anyhow!("MJPEG decode failed: {err:?}"))?;
    let info = decoder
        .info()
        .ok_or_else(|| anyhow!("MJPEG decoder returned no image info"))?;

    let (width, height) = (info.width as u32, info.height as u32);
    let expected_len = width as usize * height as usize * 3;
    if rgb.len() < expected_len {
        return Err(anyhow!(
            "MJPEG decode produced too few bytes: got {}, expected {}",
            rgb.len(),
            expected_len
        ));
    }

    Ok((rgb, width, height))
}

fn packed_to_rgb(data: &[u8], width: u32, height: u32, swap_rb: bool) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize * 3;
    if data.len() < expected_len {
        return Err(anyhow!(
            "RGB buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let mut rgb = data[..expected_len].to_vec();
    if swap_rb {
        rgb.par_chunks_exact_mut(3).for_each(|px| px.swap(0, 2));
    }
    Ok(rgb)
}

fn gray_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize;
    if data.len() < expected_len {
        return Err(anyhow!(
            "GRAY buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let mut rgb = vec![0u8; expected_len * 3];
    rgb.par_chunks_exact_mut(3)
        .zip(data[..expected_len].par_iter().copied())
        .for_each(|(dst, value)| dst.fill(value));

    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let out = convert_to_rgb(PixelLayout::Bgr, &[3, 2, 1, 6, 5, 4], 2, 1, false).unwrap();
        assert_eq!(out.rgb, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn gray_is_replicated() {
        let out = convert_to_rgb(PixelLayout::Gray, &[9, 200], 2, 1, false).unwrap();
        assert_eq!(out.rgb, vec![9, 9, 9, 200, 200, 200]);
    }

    #[test]
    fn mirror_reverses_pixels_per_row() {
        let data = [1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4, 5, 5, 5, 6, 6, 6];
        let out = convert_to_rgb(PixelLayout::Rgb, &data, 3, 2, true).unwrap();
        assert_eq!(
            out.rgb,
            vec![3, 3, 3, 2, 2, 2, 1, 1, 1, 6, 6, 6, 5, 5, 5, 4, 4, 4]
        );
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(convert_to_rgb(PixelLayout::Rgb, &[0; 5], 2, 1, false).is_err());
        assert!(convert_to_rgb(PixelLayout::Yuyv, &[0; 3], 2, 1, false).is_err());
        assert!(convert_to_rgb(PixelLayout::Nv12, &[0; 4], 2, 2, false).is_err());
    }

    #[test]
    fn mjpeg_round_trip_keeps_dimensions() {
        let mut jpeg = Vec::new();
        let pixels = vec![128u8; 8 * 4 * 3];
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode(&pixels, 8, 4, image::ExtendedColorType::Rgb8)
            .unwrap();

        let out = convert_to_rgb(PixelLayout::Mjpeg, &jpeg, 0, 0, false).unwrap();
        assert_eq!((out.width, out.height), (8, 4));
        assert_eq!(out.rgb.len(), 8 * 4 * 3);
    }
}
