use std::num::NonZeroU32;
use std::{fmt, fmt::Display};

use crate::bitstream::AccessUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Hevc,
}

impl Codec {
    /// Resolves a loose codec name such as `"h264"`, `"x264"`, `"h265"` or `"HEVC"`.
    pub fn from_name(name: &str) -> Result<Self, BackendError> {
        if name.contains("264") {
            Ok(Self::H264)
        } else if name.contains("265") || name.contains("hevc") || name.contains("HEVC") {
            Ok(Self::Hevc)
        } else {
            Err(BackendError::UnsupportedCodec(name.to_string()))
        }
    }
}

impl Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => f.write_str("h264"),
            Self::Hevc => f.write_str("hevc"),
        }
    }
}

/// Hardware device families, named the way libav names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwDeviceType {
    Cuda,
    Vaapi,
    Vdpau,
    Dxva2,
    D3d11va,
    Qsv,
    VideoToolbox,
    Drm,
    OpenCl,
    MediaCodec,
    Vulkan,
}

impl HwDeviceType {
    pub const ALL: [HwDeviceType; 11] = [
        Self::Cuda,
        Self::Vaapi,
        Self::Vdpau,
        Self::Dxva2,
        Self::D3d11va,
        Self::Qsv,
        Self::VideoToolbox,
        Self::Drm,
        Self::OpenCl,
        Self::MediaCodec,
        Self::Vulkan,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Vaapi => "vaapi",
            Self::Vdpau => "vdpau",
            Self::Dxva2 => "dxva2",
            Self::D3d11va => "d3d11va",
            Self::Qsv => "qsv",
            Self::VideoToolbox => "videotoolbox",
            Self::Drm => "drm",
            Self::OpenCl => "opencl",
            Self::MediaCodec => "mediacodec",
            Self::Vulkan => "vulkan",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, BackendError> {
        let lowered = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| {
                let available = Self::ALL
                    .iter()
                    .map(|kind| kind.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                BackendError::UnsupportedConfig(format!(
                    "device type {name} is not supported; available device types: {available}"
                ))
            })
    }
}

impl Display for HwDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    pub fn width_usize(&self) -> usize {
        self.width.get() as usize
    }

    pub fn height_usize(&self) -> usize {
        self.height.get() as usize
    }
}

impl Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp90k(pub i64);

impl Display for Timestamp90k {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@90k", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Bgr24,
    Rgb24,
}

impl OutputFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        3
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bgr24 => f.write_str("bgr24"),
            Self::Rgb24 => f.write_str("rgb24"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMatrix {
    #[default]
    Bt601,
    Bt709,
}

impl Display for ColorMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bt601 => f.write_str("bt601"),
            Self::Bt709 => f.write_str("bt709"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BitstreamInput {
    AnnexBChunk {
        chunk: Vec<u8>,
        pts_90k: Option<Timestamp90k>,
    },
    AccessUnitRawNal {
        nalus: Vec<Vec<u8>>,
        pts_90k: Option<Timestamp90k>,
    },
    LengthPrefixedSample {
        sample: Vec<u8>,
        pts_90k: Option<Timestamp90k>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanarFormat {
    /// Full-resolution Y plane followed by one interleaved UV plane.
    Nv12,
    /// Y, U and V in three separate planes.
    I420,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub stride: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PlanarPicture {
    pub format: PlanarFormat,
    pub dims: Dimensions,
    pub pts_90k: Option<Timestamp90k>,
    pub planes: Vec<Plane>,
}

/// What a backend hands back for one decoded picture.
#[derive(Debug, Clone)]
pub enum Picture {
    Planar(PlanarPicture),
    Packed(DecodedFrame),
}

/// A packed 3-channel frame. `data` holds `height` rows of `linesize` bytes each,
/// and the first `width * 3` bytes of every row are pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub dims: Dimensions,
    pub linesize: usize,
    pub format: OutputFormat,
    pub pts_90k: Option<Timestamp90k>,
    pub data: Vec<u8>,
}

impl DecodedFrame {
    pub fn width(&self) -> u32 {
        self.dims.width.get()
    }

    pub fn height(&self) -> u32 {
        self.dims.height.get()
    }

    pub fn row_bytes(&self) -> usize {
        self.dims.width_usize() * self.format.bytes_per_pixel()
    }

    pub fn is_tightly_packed(&self) -> bool {
        self.linesize == self.row_bytes()
    }

    pub fn row(&self, y: usize) -> Option<&[u8]> {
        if y >= self.dims.height_usize() {
            return None;
        }
        let start = y * self.linesize;
        self.data.get(start..start + self.row_bytes())
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        let row_bytes = self.row_bytes();
        self.data
            .chunks(self.linesize.max(1))
            .take(self.dims.height_usize())
            .map(move |row| &row[..row_bytes.min(row.len())])
    }

    /// Copy without row padding; `len() == width * height * 3`.
    pub fn to_packed(&self) -> Vec<u8> {
        if self.is_tightly_packed() {
            return self.data.clone();
        }
        let mut out = Vec::with_capacity(self.row_bytes() * self.dims.height_usize());
        for row in self.rows() {
            out.extend_from_slice(row);
        }
        out
    }

    /// `(buffer, width, height, linesize)`
    pub fn into_parts(self) -> (Vec<u8>, u32, u32, usize) {
        let width = self.width();
        let height = self.height();
        (self.data, width, height, self.linesize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub row_alignment: usize,
    pub matrix: ColorMatrix,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Bgr24,
            row_alignment: 1,
            matrix: ColorMatrix::Bt601,
        }
    }
}

impl Display for OutputConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OutputConfig(format={}, row_alignment={}, matrix={})",
            self.format, self.row_alignment, self.matrix
        )
    }
}

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub codec: Codec,
    pub device: HwDeviceType,
    pub device_path: Option<String>,
    pub fps: i32,
    pub require_hardware: bool,
    pub output: OutputConfig,
    pub backend_options: BackendDecoderOptions,
}

impl DecoderConfig {
    #[must_use]
    pub fn new(codec: Codec, device: HwDeviceType) -> Self {
        Self {
            codec,
            device,
            device_path: None,
            fps: 30,
            require_hardware: false,
            output: OutputConfig::default(),
            backend_options: BackendDecoderOptions::default(),
        }
    }

    /// Builds a config from the loose names the command line and bindings pass around.
    pub fn from_names(codec: &str, device: &str) -> Result<Self, BackendError> {
        Ok(Self::new(Codec::from_name(codec)?, HwDeviceType::from_name(device)?))
    }
}

impl Display for DecoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DecoderConfig(codec={}, device={}, fps={}, require_hardware={}, output={})",
            self.codec, self.device, self.fps, self.require_hardware, self.output
        )
    }
}

#[derive(Debug, Clone, Default)]
pub enum BackendDecoderOptions {
    #[default]
    Default,
    Libav(LibavDecoderOptions),
}

#[derive(Debug, Clone, Default)]
pub struct LibavDecoderOptions {
    pub thread_count: Option<usize>,
    pub quiet: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DecodeSummary {
    pub decoded_frames: usize,
    pub dropped_access_units: usize,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub pixel_format: Option<String>,
}

impl Display for DecodeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DecodeSummary(decoded_frames={}, dropped_access_units={}, width={:?}, height={:?}, pixel_format={:?})",
            self.decoded_frames,
            self.dropped_access_units,
            self.width,
            self.height,
            self.pixel_format
        )
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityReport {
    pub codec: Codec,
    pub decode_supported: bool,
    pub hardware_acceleration: bool,
}

impl Display for CapabilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CapabilityReport(codec={}, decode_supported={}, hardware_acceleration={})",
            self.codec, self.decode_supported, self.hardware_acceleration
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unsupported codec type: {0}")]
    UnsupportedCodec(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("invalid bitstream: {0}")]
    InvalidBitstream(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoding backend. Access units arrive complete and in decode order.
pub trait VideoDecoder {
    fn query_capability(&self, codec: Codec) -> Result<CapabilityReport, BackendError>;

    fn decode_access_unit(
        &mut self,
        access_unit: &AccessUnit,
    ) -> Result<Vec<Picture>, BackendError>;

    /// Drains pictures still held by the backend and readies it for a new stream.
    fn flush(&mut self) -> Result<Vec<Picture>, BackendError>;

    fn decode_summary(&self) -> DecodeSummary;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_name_matching_follows_substrings() {
        assert_eq!(Codec::from_name("h264").unwrap(), Codec::H264);
        assert_eq!(Codec::from_name("libx264").unwrap(), Codec::H264);
        assert_eq!(Codec::from_name("h265").unwrap(), Codec::Hevc);
        assert_eq!(Codec::from_name("HEVC").unwrap(), Codec::Hevc);
        match Codec::from_name("vp9") {
            Err(BackendError::UnsupportedCodec(name)) => assert_eq!(name, "vp9"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unknown_device_lists_available_types() {
        assert_eq!(HwDeviceType::from_name("DXVA2").unwrap(), HwDeviceType::Dxva2);
        match HwDeviceType::from_name("glide") {
            Err(BackendError::UnsupportedConfig(message)) => {
                assert!(message.contains("glide"));
                assert!(message.contains("cuda"));
                assert!(message.contains("videotoolbox"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn decoded_frame_strips_row_padding() {
        let frame = DecodedFrame {
            dims: Dimensions::new(2, 2).unwrap(),
            linesize: 8,
            format: OutputFormat::Bgr24,
            pts_90k: None,
            data: vec![
                1, 2, 3, 4, 5, 6, 0, 0, //
                7, 8, 9, 10, 11, 12, 0, 0,
            ],
        };
        assert!(!frame.is_tightly_packed());
        assert_eq!(frame.row(1).unwrap(), &[7, 8, 9, 10, 11, 12]);
        assert!(frame.row(2).is_none());
        assert_eq!(frame.to_packed(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);

        let (data, w, h, linesize) = frame.into_parts();
        assert_eq!((w, h, linesize), (2, 2, 8));
        assert_eq!(data.len(), 16);
    }
}
