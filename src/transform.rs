use crate::{
    BackendError, ColorMatrix, DecodedFrame, Dimensions, OutputConfig, OutputFormat,
    PlanarFormat, PlanarPicture, Plane,
};

/// 8-bit fixed-point coefficients for limited-range YCbCr -> RGB.
#[derive(Debug, Clone, Copy)]
struct Coefficients {
    y: i32,
    r_v: i32,
    g_u: i32,
    g_v: i32,
    b_u: i32,
}

impl Coefficients {
    fn for_matrix(matrix: ColorMatrix) -> Self {
        match matrix {
            ColorMatrix::Bt601 => Self {
                y: 298,
                r_v: 409,
                g_u: 100,
                g_v: 208,
                b_u: 516,
            },
            ColorMatrix::Bt709 => Self {
                y: 298,
                r_v: 459,
                g_u: 55,
                g_v: 136,
                b_u: 541,
            },
        }
    }

    #[inline]
    fn to_rgb(self, y: u8, u: u8, v: u8) -> [u8; 3] {
        let c = self.y * (i32::from(y) - 16).max(0);
        let d = i32::from(u) - 128;
        let e = i32::from(v) - 128;
        [
            clip_to_u8((c + self.r_v * e + 128) >> 8),
            clip_to_u8((c - self.g_u * d - self.g_v * e + 128) >> 8),
            clip_to_u8((c + self.b_u * d + 128) >> 8),
        ]
    }
}

/// Turns backend-native planar pictures into packed 24-bit frames.
#[derive(Debug, Clone)]
pub struct Converter {
    config: OutputConfig,
    coefficients: Coefficients,
}

impl Converter {
    pub fn new(config: OutputConfig) -> Self {
        Self {
            coefficients: Coefficients::for_matrix(config.matrix),
            config,
        }
    }

    pub fn linesize(&self, width: usize) -> usize {
        let row = width.saturating_mul(self.config.format.bytes_per_pixel());
        let align = self.config.row_alignment.max(1);
        row.div_ceil(align).saturating_mul(align)
    }

    /// Bytes a converted `width x height` frame occupies, row padding included.
    pub fn predict_size(&self, width: usize, height: usize) -> usize {
        self.linesize(width).saturating_mul(height)
    }

    pub fn convert(&self, picture: &PlanarPicture) -> Result<DecodedFrame, BackendError> {
        let mut data = Vec::new();
        let linesize = self.convert_into(picture, &mut data)?;
        Ok(DecodedFrame {
            dims: picture.dims,
            linesize,
            format: self.config.format,
            pts_90k: picture.pts_90k,
            data,
        })
    }

    /// Converts into `out`, replacing its contents, and returns the linesize used.
    pub fn convert_into(
        &self,
        picture: &PlanarPicture,
        out: &mut Vec<u8>,
    ) -> Result<usize, BackendError> {
        let width = picture.dims.width_usize();
        let height = picture.dims.height_usize();
        let linesize = self.linesize(width);
        let total = linesize
            .checked_mul(height)
            .ok_or_else(|| BackendError::InvalidInput("output size overflow".to_string()))?;
        validate_planes(picture)?;

        out.clear();
        out.resize(total, 0);

        let swap = self.config.format == OutputFormat::Bgr24;
        let luma = &picture.planes[0];
        for y in 0..height {
            let y_row = &luma.data[y * luma.stride..y * luma.stride + width];
            let dst_row = &mut out[y * linesize..y * linesize + width * 3];
            let chroma_y = y / 2;
            for (x, (dst, &y_value)) in dst_row.chunks_exact_mut(3).zip(y_row).enumerate() {
                let (u_value, v_value) = match picture.format {
                    PlanarFormat::Nv12 => {
                        let uv = &picture.planes[1];
                        let index = chroma_y * uv.stride + (x / 2) * 2;
                        (uv.data[index], uv.data[index + 1])
                    }
                    PlanarFormat::I420 => {
                        let (u, v) = (&picture.planes[1], &picture.planes[2]);
                        (
                            u.data[chroma_y * u.stride + x / 2],
                            v.data[chroma_y * v.stride + x / 2],
                        )
                    }
                };
                let [r, g, b] = self.coefficients.to_rgb(y_value, u_value, v_value);
                if swap {
                    dst.copy_from_slice(&[b, g, r]);
                } else {
                    dst.copy_from_slice(&[r, g, b]);
                }
            }
        }

        Ok(linesize)
    }

    /// Re-lays out a frame that a backend already packed, fixing channel order and
    /// row alignment to match this converter.
    pub fn repack(&self, frame: DecodedFrame) -> Result<DecodedFrame, BackendError> {
        let height = frame.dims.height_usize();
        let row_bytes = frame.row_bytes();
        let span = frame
            .linesize
            .checked_mul(height - 1)
            .and_then(|v| v.checked_add(row_bytes))
            .ok_or_else(|| BackendError::InvalidInput("packed frame size overflow".to_string()))?;
        if frame.linesize < row_bytes || frame.data.len() < span {
            return Err(BackendError::InvalidInput(format!(
                "packed frame holds {} bytes, expected at least {span}",
                frame.data.len()
            )));
        }

        let linesize = self.linesize(frame.dims.width_usize());
        let total = linesize
            .checked_mul(height)
            .ok_or_else(|| BackendError::InvalidInput("output size overflow".to_string()))?;
        if frame.format == self.config.format
            && frame.linesize == linesize
            && frame.data.len() >= total
        {
            return Ok(frame);
        }

        let swap = frame.format != self.config.format;
        let mut data = vec![0_u8; total];
        for y in 0..height {
            let src = &frame.data[y * frame.linesize..y * frame.linesize + row_bytes];
            let dst = &mut data[y * linesize..y * linesize + row_bytes];
            if swap {
                for (d, s) in dst.chunks_exact_mut(3).zip(src.chunks_exact(3)) {
                    d.copy_from_slice(&[s[2], s[1], s[0]]);
                }
            } else {
                dst.copy_from_slice(src);
            }
        }

        Ok(DecodedFrame {
            dims: frame.dims,
            linesize,
            format: self.config.format,
            pts_90k: frame.pts_90k,
            data,
        })
    }
}

fn validate_planes(picture: &PlanarPicture) -> Result<(), BackendError> {
    let width = picture.dims.width_usize();
    let height = picture.dims.height_usize();
    let chroma_width = width.div_ceil(2);
    let chroma_height = height.div_ceil(2);

    let expected = match picture.format {
        PlanarFormat::Nv12 => vec![("y", width, height), ("uv", chroma_width * 2, chroma_height)],
        PlanarFormat::I420 => vec![
            ("y", width, height),
            ("u", chroma_width, chroma_height),
            ("v", chroma_width, chroma_height),
        ],
    };
    if picture.planes.len() < expected.len() {
        return Err(BackendError::InvalidInput(format!(
            "{:?} picture needs {} planes, got {}",
            picture.format,
            expected.len(),
            picture.planes.len()
        )));
    }

    for ((name, row_bytes, rows), plane) in expected.into_iter().zip(&picture.planes) {
        if plane.stride < row_bytes {
            return Err(BackendError::InvalidInput(format!(
                "{name} plane stride {} is smaller than row width {row_bytes}",
                plane.stride
            )));
        }
        let span = plane
            .stride
            .checked_mul(rows - 1)
            .and_then(|v| v.checked_add(row_bytes))
            .ok_or_else(|| BackendError::InvalidInput(format!("{name} plane size overflow")))?;
        if plane.data.len() < span {
            return Err(BackendError::InvalidInput(format!(
                "{name} plane holds {} bytes, expected at least {span}",
                plane.data.len()
            )));
        }
    }
    Ok(())
}

#[inline]
fn clip_to_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// A tightly packed NV12 picture with a diagonal luma ramp and neutral chroma.
pub fn make_nv12_gradient(width: u32, height: u32) -> Option<PlanarPicture> {
    let dims = Dimensions::new(width, height)?;
    let (w, h) = (dims.width_usize(), dims.height_usize());
    let mut luma = vec![0_u8; w * h];
    for y in 0..h {
        for x in 0..w {
            luma[y * w + x] = ((x + y) % 256) as u8;
        }
    }
    let chroma_stride = w.div_ceil(2) * 2;
    Some(PlanarPicture {
        format: PlanarFormat::Nv12,
        dims,
        pts_90k: None,
        planes: vec![
            Plane {
                stride: w,
                data: luma,
            },
            Plane {
                stride: chroma_stride,
                data: vec![128; chroma_stride * h.div_ceil(2)],
            },
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_i420(width: u32, height: u32, y: u8, u: u8, v: u8) -> PlanarPicture {
        let dims = Dimensions::new(width, height).unwrap();
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        PlanarPicture {
            format: PlanarFormat::I420,
            dims,
            pts_90k: None,
            planes: vec![
                Plane {
                    stride: w,
                    data: vec![y; w * h],
                },
                Plane {
                    stride: cw,
                    data: vec![u; cw * ch],
                },
                Plane {
                    stride: cw,
                    data: vec![v; cw * ch],
                },
            ],
        }
    }

    #[test]
    fn nv12_to_bgr_returns_expected_size() {
        let converter = Converter::new(OutputConfig::default());
        let frame = converter
            .convert(&make_nv12_gradient(64, 36).unwrap())
            .unwrap();
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 36);
        assert_eq!(frame.linesize, 64 * 3);
        assert_eq!(frame.data.len(), 64 * 36 * 3);
        assert_eq!(frame.data.len(), converter.predict_size(64, 36));
    }

    #[test]
    fn predict_size_honours_row_alignment() {
        let converter = Converter::new(OutputConfig {
            row_alignment: 16,
            ..OutputConfig::default()
        });
        assert_eq!(converter.linesize(5), 16);
        assert_eq!(converter.predict_size(5, 2), 32);

        let unaligned = Converter::new(OutputConfig {
            row_alignment: 0,
            ..OutputConfig::default()
        });
        assert_eq!(unaligned.predict_size(5, 2), 30);
    }

    #[test]
    fn limited_range_extremes_map_to_black_and_white() {
        let converter = Converter::new(OutputConfig::default());
        let black = converter.convert(&solid_i420(2, 2, 16, 128, 128)).unwrap();
        assert!(black.data.iter().all(|&b| b == 0));
        let white = converter.convert(&solid_i420(2, 2, 235, 128, 128)).unwrap();
        assert!(white.data.iter().all(|&b| b == 255));
    }

    #[test]
    fn output_format_controls_channel_order() {
        let red = solid_i420(2, 2, 81, 90, 240);
        let bgr = Converter::new(OutputConfig::default()).convert(&red).unwrap();
        assert_eq!(&bgr.data[..3], &[0, 0, 255]);

        let rgb = Converter::new(OutputConfig {
            format: OutputFormat::Rgb24,
            ..OutputConfig::default()
        })
        .convert(&red)
        .unwrap();
        assert_eq!(&rgb.data[..3], &[255, 0, 0]);
    }

    #[test]
    fn matrix_selects_coefficients() {
        let cases = [
            (ColorMatrix::Bt601, [234, 0, 2], [86, 141, 195]),
            (ColorMatrix::Bt709, [255, 1, 0], [80, 138, 198]),
        ];
        for (matrix, red, tinted) in cases {
            let converter = Converter::new(OutputConfig {
                format: OutputFormat::Rgb24,
                row_alignment: 1,
                matrix,
            });
            let frame = converter.convert(&solid_i420(2, 2, 63, 102, 240)).unwrap();
            assert_eq!(&frame.data[..3], &red, "{matrix}");
            let frame = converter.convert(&solid_i420(2, 2, 128, 160, 100)).unwrap();
            assert_eq!(&frame.data[..3], &tinted, "{matrix}");
        }
    }

    #[test]
    fn nv12_and_i420_agree_for_odd_dimensions() {
        let i420 = solid_i420(3, 3, 120, 100, 160);
        let nv12 = PlanarPicture {
            format: PlanarFormat::Nv12,
            dims: i420.dims,
            pts_90k: None,
            planes: vec![
                i420.planes[0].clone(),
                Plane {
                    stride: 4,
                    data: [100, 160].repeat(4),
                },
            ],
        };
        let converter = Converter::new(OutputConfig::default());
        assert_eq!(
            converter.convert(&i420).unwrap().data,
            converter.convert(&nv12).unwrap().data
        );
    }

    #[test]
    fn short_planes_are_rejected() {
        let mut picture = make_nv12_gradient(8, 4).unwrap();
        picture.planes[1].data.truncate(4);
        let result = Converter::new(OutputConfig::default()).convert(&picture);
        assert!(matches!(result, Err(BackendError::InvalidInput(_))));

        picture.planes.pop();
        let result = Converter::new(OutputConfig::default()).convert(&picture);
        assert!(matches!(result, Err(BackendError::InvalidInput(_))));
    }

    #[test]
    fn repack_rejects_short_buffer_even_when_layout_matches() {
        let frame = DecodedFrame {
            dims: Dimensions::new(2, 2).unwrap(),
            linesize: 6,
            format: OutputFormat::Bgr24,
            pts_90k: None,
            data: vec![1, 2, 3, 4, 5, 6],
        };
        let converter = Converter::new(OutputConfig::default());
        assert!(matches!(
            converter.repack(frame),
            Err(BackendError::InvalidInput(_))
        ));

        let huge = DecodedFrame {
            dims: Dimensions::new(1, 3).unwrap(),
            linesize: usize::MAX,
            format: OutputFormat::Bgr24,
            pts_90k: None,
            data: vec![0; 3],
        };
        assert!(matches!(
            converter.repack(huge),
            Err(BackendError::InvalidInput(_))
        ));
    }

    #[test]
    fn repack_swaps_channels_and_pads_rows() {
        let frame = DecodedFrame {
            dims: Dimensions::new(2, 1).unwrap(),
            linesize: 6,
            format: OutputFormat::Rgb24,
            pts_90k: None,
            data: vec![1, 2, 3, 4, 5, 6],
        };
        let converter = Converter::new(OutputConfig {
            row_alignment: 8,
            ..OutputConfig::default()
        });
        let repacked = converter.repack(frame).unwrap();
        assert_eq!(repacked.format, OutputFormat::Bgr24);
        assert_eq!(repacked.linesize, 8);
        assert_eq!(repacked.data, vec![3, 2, 1, 6, 5, 4, 0, 0]);
    }
}
