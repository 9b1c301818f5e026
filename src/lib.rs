use std::collections::VecDeque;
use std::fmt::{self, Display};
use std::time::Instant;

mod bitstream;
mod contract;
pub mod feed;
#[cfg(feature = "backend-ffmpeg")]
mod libav_backend;
mod pipeline;
pub mod ppm;
mod transform;

pub use bitstream::{
    AccessUnit, AccessUnitAssembler, ParameterSetCache, pack_annexb, split_length_prefixed,
    unpack_length_prefixed,
};
pub use contract::{
    BackendDecoderOptions, BackendError, BitstreamInput, CapabilityReport, Codec, ColorMatrix,
    DecodeSummary, DecodedFrame, DecoderConfig, Dimensions, HwDeviceType, LibavDecoderOptions,
    OutputConfig, OutputFormat, Picture, PlanarFormat, PlanarPicture, Plane, Timestamp90k,
    VideoDecoder,
};
#[cfg(feature = "backend-ffmpeg")]
pub use libav_backend::LibavDecoder;
pub use pipeline::{
    BoundedQueueRx, BoundedQueueTx, QueueRecvError, QueueSendError, QueueStats, bounded_queue,
};
pub use transform::{Converter, make_nv12_gradient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Auto,
    Libav,
}

pub type Backend = BackendKind;

impl BackendKind {
    pub fn from_name(name: &str) -> Result<Self, BackendError> {
        match name.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "libav" | "ffmpeg" => Ok(Self::Libav),
            other => Err(BackendError::UnsupportedConfig(format!(
                "unknown backend {other}; expected auto or libav"
            ))),
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Libav => f.write_str("libav"),
        }
    }
}

/// Silences (or restores) the native decoder library's own console logging.
pub fn set_backend_log_level(quiet: bool) {
    #[cfg(feature = "backend-ffmpeg")]
    libav_backend::set_log_level(quiet);
    #[cfg(not(feature = "backend-ffmpeg"))]
    let _ = quiet;
}

fn should_report_metrics() -> bool {
    std::env::var("HWDECODER_METRICS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Chunk-in, frames-out decoding: Annex-B bytes are split into access units, decoded by
/// the backend and converted to packed 24-bit frames in decode order.
pub struct DecodeSession {
    config: DecoderConfig,
    decoder_inner: Box<dyn VideoDecoder>,
    assembler: AccessUnitAssembler,
    converter: Converter,
    ready: VecDeque<DecodedFrame>,
    report_metrics: bool,
}

impl DecodeSession {
    /// Never fails: a backend that cannot be built is replaced by one whose every
    /// decode call reports why.
    pub fn new(backend: Backend, config: DecoderConfig) -> Self {
        let decoder_inner = match build_decoder_inner(backend, &config) {
            Ok(decoder) => decoder,
            Err(err) => {
                log::warn!("{backend} decoder unavailable: {err}");
                Box::new(UnsupportedDecoderAdapter::new(err.to_string()))
            }
        };
        Self::from_parts(decoder_inner, config)
    }

    pub fn try_new(backend: Backend, config: DecoderConfig) -> Result<Self, BackendError> {
        let decoder_inner = build_decoder_inner(backend, &config)?;
        Ok(Self::from_parts(decoder_inner, config))
    }

    pub fn with_decoder(decoder: Box<dyn VideoDecoder>, config: DecoderConfig) -> Self {
        Self::from_parts(decoder, config)
    }

    fn from_parts(decoder_inner: Box<dyn VideoDecoder>, config: DecoderConfig) -> Self {
        Self {
            assembler: AccessUnitAssembler::with_codec(config.codec),
            converter: Converter::new(config.output),
            decoder_inner,
            config,
            ready: VecDeque::new(),
            report_metrics: should_report_metrics(),
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn submit(&mut self, input: BitstreamInput) -> Result<(), BackendError> {
        match input {
            BitstreamInput::AnnexBChunk { chunk, pts_90k } => self.push_annexb(&chunk, pts_90k),
            BitstreamInput::AccessUnitRawNal { nalus, pts_90k } => {
                self.push_access_unit(nalus, pts_90k)
            }
            BitstreamInput::LengthPrefixedSample { sample, pts_90k } => {
                let nalus = split_length_prefixed(&sample)?;
                self.push_access_unit(nalus, pts_90k)
            }
        }
    }

    /// Feeds one Annex-B chunk and returns every frame that became ready.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<DecodedFrame>, BackendError> {
        self.decode_with_pts(chunk, None)
    }

    pub fn decode_with_pts(
        &mut self,
        chunk: &[u8],
        pts_90k: Option<Timestamp90k>,
    ) -> Result<Vec<DecodedFrame>, BackendError> {
        self.push_annexb(chunk, pts_90k)?;
        Ok(self.ready.drain(..).collect())
    }

    pub fn try_reap(&mut self) -> Result<Option<DecodedFrame>, BackendError> {
        Ok(self.ready.pop_front())
    }

    /// Drains queued frames, the buffered stream tail and the backend, in that order.
    /// The session accepts a new stream afterwards.
    pub fn flush(&mut self) -> Result<Vec<DecodedFrame>, BackendError> {
        let tail = self.assembler.flush()?;
        self.decode_access_units(&tail)?;
        let pictures = self.decoder_inner.flush()?;
        self.enqueue(pictures)?;
        Ok(self.ready.drain(..).collect())
    }

    /// Annex-B bytes buffered until the access unit they belong to is complete.
    pub fn pending_bytes(&self) -> usize {
        self.assembler.pending_bytes()
    }

    pub fn summary(&self) -> DecodeSummary {
        self.decoder_inner.decode_summary()
    }

    pub fn query_capability(&self, codec: Codec) -> Result<CapabilityReport, BackendError> {
        self.decoder_inner.query_capability(codec)
    }

    fn push_annexb(
        &mut self,
        chunk: &[u8],
        pts_90k: Option<Timestamp90k>,
    ) -> Result<(), BackendError> {
        let started = Instant::now();
        let access_units = self
            .assembler
            .push_chunk(chunk, self.config.codec, pts_90k)?;
        let assembled = started.elapsed();
        let produced = self.decode_access_units(&access_units)?;
        if self.report_metrics {
            log::info!(
                "chunk {} bytes: assemble={:?} decode+convert={:?} access_units={} frames={} pending={}",
                chunk.len(),
                assembled,
                started.elapsed().saturating_sub(assembled),
                access_units.len(),
                produced,
                self.assembler.pending_bytes()
            );
        }
        Ok(())
    }

    fn push_access_unit(
        &mut self,
        nalus: Vec<Vec<u8>>,
        pts_90k: Option<Timestamp90k>,
    ) -> Result<(), BackendError> {
        if self.assembler.pending_bytes() > 0 {
            return Err(BackendError::InvalidInput(
                "complete access unit submitted while Annex-B bytes are still buffered; flush first"
                    .to_string(),
            ));
        }
        let nalus: Vec<Vec<u8>> = nalus.into_iter().filter(|nal| !nal.is_empty()).collect();
        if nalus.is_empty() {
            return Err(BackendError::InvalidInput(
                "access unit has no NAL units".to_string(),
            ));
        }
        let access_unit = AccessUnit::from_nalus(self.config.codec, nalus, pts_90k);
        self.decode_access_units(std::slice::from_ref(&access_unit))?;
        Ok(())
    }

    fn decode_access_units(&mut self, access_units: &[AccessUnit]) -> Result<usize, BackendError> {
        let mut produced = 0;
        for access_unit in access_units {
            log::debug!(
                "decode access unit: nalus={} bytes={} keyframe={} pts={:?}",
                access_unit.nalus.len(),
                access_unit.payload_len(),
                access_unit.is_keyframe,
                access_unit.pts_90k.map(|pts| pts.0)
            );
            let pictures = self.decoder_inner.decode_access_unit(access_unit)?;
            produced += self.enqueue(pictures)?;
        }
        Ok(produced)
    }

    fn enqueue(&mut self, pictures: Vec<Picture>) -> Result<usize, BackendError> {
        let count = pictures.len();
        for picture in pictures {
            let frame = match picture {
                Picture::Planar(planar) => self.converter.convert(&planar)?,
                Picture::Packed(packed) => self.converter.repack(packed)?,
            };
            self.ready.push_back(frame);
        }
        Ok(count)
    }
}

struct UnsupportedDecoderAdapter {
    message: String,
}

impl UnsupportedDecoderAdapter {
    fn new(message: String) -> Self {
        Self { message }
    }
}

impl VideoDecoder for UnsupportedDecoderAdapter {
    fn query_capability(&self, codec: Codec) -> Result<CapabilityReport, BackendError> {
        Ok(CapabilityReport {
            codec,
            decode_supported: false,
            hardware_acceleration: false,
        })
    }

    fn decode_access_unit(
        &mut self,
        _access_unit: &AccessUnit,
    ) -> Result<Vec<Picture>, BackendError> {
        Err(BackendError::UnsupportedConfig(self.message.clone()))
    }

    fn flush(&mut self) -> Result<Vec<Picture>, BackendError> {
        Err(BackendError::UnsupportedConfig(self.message.clone()))
    }

    fn decode_summary(&self) -> DecodeSummary {
        DecodeSummary::default()
    }
}

fn preferred_backend_order() -> Vec<BackendKind> {
    vec![BackendKind::Libav]
}

fn build_decoder_inner(
    backend: BackendKind,
    config: &DecoderConfig,
) -> Result<Box<dyn VideoDecoder>, BackendError> {
    match backend {
        BackendKind::Auto => resolve_auto_decoder(config),
        BackendKind::Libav => build_libav_decoder(config),
    }
}

fn resolve_auto_decoder(config: &DecoderConfig) -> Result<Box<dyn VideoDecoder>, BackendError> {
    let mut diagnostics = Vec::new();
    for candidate in preferred_backend_order() {
        let probe = match build_decoder_inner(candidate, config) {
            Ok(probe) => probe,
            Err(err) => {
                diagnostics.push(format!("{candidate}: {err}"));
                continue;
            }
        };
        match probe.query_capability(config.codec) {
            Ok(capability) => {
                if capability.decode_supported
                    && (!config.require_hardware || capability.hardware_acceleration)
                {
                    log::info!(
                        "auto backend selected {candidate} for {} (hw_accel={})",
                        config.codec,
                        capability.hardware_acceleration
                    );
                    return Ok(probe);
                }
                diagnostics.push(format!(
                    "{candidate}: decode_supported={}, hw_accel={}",
                    capability.decode_supported, capability.hardware_acceleration
                ));
            }
            Err(err) => diagnostics.push(format!("{candidate}: {err}")),
        }
    }
    let detail = if diagnostics.is_empty() {
        "no eligible backend candidate".to_string()
    } else {
        diagnostics.join("; ")
    };
    Err(BackendError::UnsupportedConfig(format!(
        "auto backend selection failed for decode ({}): {}",
        config.codec, detail
    )))
}

#[cfg(feature = "backend-ffmpeg")]
fn build_libav_decoder(config: &DecoderConfig) -> Result<Box<dyn VideoDecoder>, BackendError> {
    Ok(Box::new(LibavDecoder::new(config.clone())?))
}

#[cfg(not(feature = "backend-ffmpeg"))]
fn build_libav_decoder(_config: &DecoderConfig) -> Result<Box<dyn VideoDecoder>, BackendError> {
    Err(BackendError::UnsupportedConfig(
        "libav backend requires backend-ffmpeg feature".to_string(),
    ))
}
