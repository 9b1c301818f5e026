use std::ffi::{CStr, CString, c_void};
use std::ptr;

use ffmpeg::ffi;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use ffmpeg_next as ffmpeg;

use crate::bitstream::AccessUnit;
use crate::{
    BackendDecoderOptions, BackendError, CapabilityReport, Codec, DecodeSummary, DecodedFrame,
    DecoderConfig, Dimensions, HwDeviceType, OutputFormat, Picture, PlanarFormat, PlanarPicture,
    Plane, Timestamp90k, VideoDecoder,
};

// AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX
const HW_CONFIG_METHOD_HW_DEVICE_CTX: i32 = 0x01;

pub(crate) fn set_log_level(quiet: bool) {
    let level = if quiet {
        ffmpeg::util::log::Level::Quiet
    } else {
        ffmpeg::util::log::Level::Warning
    };
    ffmpeg::util::log::set_level(level);
}

/// Owns the hardware device context and the surface format `get_format` must pick.
struct HwDevice {
    kind: HwDeviceType,
    device_ctx: *mut ffi::AVBufferRef,
    // Target of the codec context's `opaque` pointer.
    pix_fmt: Box<ffi::AVPixelFormat>,
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        unsafe { ffi::av_buffer_unref(&mut self.device_ctx) };
    }
}

struct CachedScaler {
    key: (Pixel, u32, u32, Pixel),
    context: scaling::Context,
}

pub struct LibavDecoder {
    config: DecoderConfig,
    // Dropped before `hw`.
    decoder: ffmpeg::decoder::Video,
    hw: Option<HwDevice>,
    scaler: Option<CachedScaler>,
    summary: DecodeSummary,
}

impl LibavDecoder {
    pub fn new(config: DecoderConfig) -> Result<Self, BackendError> {
        ffmpeg::init().map_err(|err| {
            BackendError::UnsupportedConfig(format!("libav initialisation failed: {err}"))
        })?;

        let options = match &config.backend_options {
            BackendDecoderOptions::Libav(options) => options.clone(),
            BackendDecoderOptions::Default => Default::default(),
        };
        if options.quiet {
            set_log_level(true);
        }

        let codec = ffmpeg::decoder::find(codec_id(config.codec)).ok_or_else(|| {
            BackendError::UnsupportedConfig(format!("cannot find decoder for {}", config.codec))
        })?;
        let mut context = ffmpeg::codec::context::Context::new_with_codec(codec);
        if let Some(count) = options.thread_count {
            context.set_threading(ffmpeg::threading::Config {
                kind: ffmpeg::threading::Type::Frame,
                count,
            });
        }

        set_timing(&mut context, config.fps);

        let hw = match attach_hw_device(&mut context, codec, &config) {
            Ok(hw) => Some(hw),
            Err(err) if config.require_hardware => return Err(err),
            Err(err) => {
                log::warn!("{err}; falling back to software decode");
                None
            }
        };

        let decoder = context.decoder().video().map_err(|err| {
            BackendError::UnsupportedConfig(format!("failed to open {} decoder: {err}", codec.name()))
        })?;
        log::info!(
            "libav {} decoder opened ({})",
            codec.name(),
            hw.as_ref()
                .map_or("software".to_string(), |hw| hw.kind.to_string())
        );

        Ok(Self {
            config,
            decoder,
            hw,
            scaler: None,
            summary: DecodeSummary::default(),
        })
    }

    fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<Vec<Picture>, BackendError> {
        match self.decoder.send_packet(packet) {
            Ok(()) => self.receive_pictures(),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                // Output queue is full: drain it, then the packet is accepted.
                let mut pictures = self.receive_pictures()?;
                self.decoder
                    .send_packet(packet)
                    .map_err(|err| map_libav_error("avcodec_send_packet", err))?;
                pictures.extend(self.receive_pictures()?);
                Ok(pictures)
            }
            Err(ffmpeg::Error::InvalidData) => {
                self.summary.dropped_access_units += 1;
                log::warn!("decoder rejected access unit as invalid data; skipping");
                self.receive_pictures()
            }
            Err(err) => Err(map_libav_error("avcodec_send_packet", err)),
        }
    }

    fn receive_pictures(&mut self) -> Result<Vec<Picture>, BackendError> {
        let mut pictures = Vec::new();
        loop {
            let mut frame = ffmpeg::frame::Video::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => pictures.push(self.to_picture(frame)?),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    break;
                }
                Err(ffmpeg::Error::Eof) => break,
                Err(ffmpeg::Error::InvalidData) => {
                    self.summary.dropped_access_units += 1;
                    log::warn!("decoder produced a corrupt picture; skipping");
                    break;
                }
                Err(err) => return Err(map_libav_error("avcodec_receive_frame", err)),
            }
        }
        Ok(pictures)
    }

    fn to_picture(&mut self, frame: ffmpeg::frame::Video) -> Result<Picture, BackendError> {
        let frame = match &self.hw {
            Some(hw) if unsafe { (*frame.as_ptr()).format } == *hw.pix_fmt as i32 => {
                let mut system = ffmpeg::frame::Video::empty();
                let ret =
                    unsafe { ffi::av_hwframe_transfer_data(system.as_mut_ptr(), frame.as_ptr(), 0) };
                if ret < 0 {
                    return Err(BackendError::Backend(format!(
                        "error transferring the frame to system memory: {}",
                        ffmpeg::Error::from(ret)
                    )));
                }
                system.set_pts(frame.pts());
                system
            }
            _ => frame,
        };

        let dims = Dimensions::new(frame.width(), frame.height()).ok_or_else(|| {
            BackendError::Backend("decoder produced a frame without dimensions".to_string())
        })?;
        let pts_90k = frame.pts().map(Timestamp90k);
        let format = frame.format();

        self.summary.decoded_frames += 1;
        self.summary.width = Some(dims.width_usize());
        self.summary.height = Some(dims.height_usize());
        self.summary.pixel_format = Some(format!("{format:?}").to_ascii_lowercase());

        let chroma_rows = dims.height_usize().div_ceil(2);
        match format {
            Pixel::NV12 => Ok(Picture::Planar(PlanarPicture {
                format: PlanarFormat::Nv12,
                dims,
                pts_90k,
                planes: vec![
                    copy_plane(&frame, 0, dims.height_usize()),
                    copy_plane(&frame, 1, chroma_rows),
                ],
            })),
            Pixel::YUV420P => Ok(Picture::Planar(PlanarPicture {
                format: PlanarFormat::I420,
                dims,
                pts_90k,
                planes: vec![
                    copy_plane(&frame, 0, dims.height_usize()),
                    copy_plane(&frame, 1, chroma_rows),
                    copy_plane(&frame, 2, chroma_rows),
                ],
            })),
            other => self.scale_to_packed(&frame, other, dims, pts_90k),
        }
    }

    fn scale_to_packed(
        &mut self,
        frame: &ffmpeg::frame::Video,
        format: Pixel,
        dims: Dimensions,
        pts_90k: Option<Timestamp90k>,
    ) -> Result<Picture, BackendError> {
        let output = self.config.output.format;
        let target = match output {
            OutputFormat::Bgr24 => Pixel::BGR24,
            OutputFormat::Rgb24 => Pixel::RGB24,
        };
        let key = (format, frame.width(), frame.height(), target);

        if self.scaler.as_ref().is_none_or(|cached| cached.key != key) {
            log::debug!("building swscale context for {format:?} -> {target:?} at {dims}");
            let context = scaling::Context::get(
                format,
                key.1,
                key.2,
                target,
                key.1,
                key.2,
                scaling::Flags::BILINEAR,
            )
            .map_err(|err| BackendError::Backend(format!("cannot allocate scaler: {err}")))?;
            self.scaler = Some(CachedScaler { key, context });
        }
        let Some(scaler) = self.scaler.as_mut() else {
            return Err(BackendError::Backend("scaler is missing".to_string()));
        };

        let mut packed = ffmpeg::frame::Video::empty();
        scaler
            .context
            .run(frame, &mut packed)
            .map_err(|err| BackendError::Backend(format!("sws_scale failed: {err}")))?;

        Ok(Picture::Packed(DecodedFrame {
            dims,
            linesize: packed.stride(0),
            format: output,
            pts_90k,
            data: packed.data(0).to_vec(),
        }))
    }
}

impl VideoDecoder for LibavDecoder {
    fn query_capability(&self, codec: Codec) -> Result<CapabilityReport, BackendError> {
        let same_codec = codec == self.config.codec;
        Ok(CapabilityReport {
            codec,
            decode_supported: same_codec || ffmpeg::decoder::find(codec_id(codec)).is_some(),
            hardware_acceleration: same_codec && self.hw.is_some(),
        })
    }

    fn decode_access_unit(
        &mut self,
        access_unit: &AccessUnit,
    ) -> Result<Vec<Picture>, BackendError> {
        let mut packet = ffmpeg::Packet::copy(&access_unit.to_annexb());
        packet.set_pts(access_unit.pts_90k.map(|pts| pts.0));
        if access_unit.is_keyframe {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        self.send_packet(&packet)
    }

    fn flush(&mut self) -> Result<Vec<Picture>, BackendError> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => {}
            Err(err) => return Err(map_libav_error("avcodec_send_packet(eof)", err)),
        }
        let pictures = self.receive_pictures()?;
        self.decoder.flush();
        Ok(pictures)
    }

    fn decode_summary(&self) -> DecodeSummary {
        self.summary.clone()
    }
}

fn attach_hw_device(
    context: &mut ffmpeg::codec::context::Context,
    codec: ffmpeg::Codec,
    config: &DecoderConfig,
) -> Result<HwDevice, BackendError> {
    let name = CString::new(config.device.as_str())
        .map_err(|_| BackendError::InvalidInput("device name contains a NUL byte".to_string()))?;
    let device_type = unsafe { ffi::av_hwdevice_find_type_by_name(name.as_ptr()) };
    if device_type == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
        return Err(BackendError::UnsupportedConfig(format!(
            "device type {} is not supported; available device types: {}",
            config.device,
            available_device_types()
        )));
    }

    let pix_fmt = find_hw_pixel_format(codec, device_type).ok_or_else(|| {
        BackendError::UnsupportedConfig(format!(
            "decoder {} does not support device type {}",
            codec.name(),
            config.device
        ))
    })?;

    let device_path = config
        .device_path
        .as_deref()
        .map(CString::new)
        .transpose()
        .map_err(|_| BackendError::InvalidInput("device path contains a NUL byte".to_string()))?;
    let mut device_ctx: *mut ffi::AVBufferRef = ptr::null_mut();
    let ret = unsafe {
        ffi::av_hwdevice_ctx_create(
            &mut device_ctx,
            device_type,
            device_path.as_ref().map_or(ptr::null(), |path| path.as_ptr()),
            ptr::null_mut(),
            0,
        )
    };
    if ret < 0 {
        return Err(BackendError::UnsupportedConfig(format!(
            "failed to create specified {} device: {}",
            config.device,
            ffmpeg::Error::from(ret)
        )));
    }

    let mut hw = HwDevice {
        kind: config.device,
        device_ctx,
        pix_fmt: Box::new(pix_fmt),
    };
    unsafe {
        let ctx = context.as_mut_ptr();
        (*ctx).hw_device_ctx = ffi::av_buffer_ref(hw.device_ctx);
        (*ctx).opaque = (&mut *hw.pix_fmt as *mut ffi::AVPixelFormat).cast::<c_void>();
        (*ctx).get_format = Some(select_hw_format);
    }
    Ok(hw)
}

fn find_hw_pixel_format(
    codec: ffmpeg::Codec,
    device_type: ffi::AVHWDeviceType,
) -> Option<ffi::AVPixelFormat> {
    let mut index = 0;
    loop {
        let config = unsafe { ffi::avcodec_get_hw_config(codec.as_ptr(), index) };
        if config.is_null() {
            return None;
        }
        let config = unsafe { &*config };
        if (config.methods & HW_CONFIG_METHOD_HW_DEVICE_CTX) != 0
            && config.device_type == device_type
        {
            return Some(config.pix_fmt);
        }
        index += 1;
    }
}

fn available_device_types() -> String {
    let mut names = Vec::new();
    let mut kind = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;
    loop {
        kind = unsafe { ffi::av_hwdevice_iterate_types(kind) };
        if kind == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            break;
        }
        let name = unsafe { ffi::av_hwdevice_get_type_name(kind) };
        if !name.is_null() {
            names.push(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned());
        }
    }
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(" ")
    }
}

unsafe extern "C" fn select_hw_format(
    ctx: *mut ffi::AVCodecContext,
    formats: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    unsafe {
        let wanted = *((*ctx).opaque as *const ffi::AVPixelFormat);
        let mut cursor = formats;
        while *cursor != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
            if *cursor == wanted {
                return wanted;
            }
            cursor = cursor.add(1);
        }
    }
    log::error!("failed to get hardware surface format");
    ffi::AVPixelFormat::AV_PIX_FMT_NONE
}

fn copy_plane(frame: &ffmpeg::frame::Video, index: usize, rows: usize) -> Plane {
    let stride = frame.stride(index);
    let data = frame.data(index);
    let len = stride.saturating_mul(rows).min(data.len());
    Plane {
        stride,
        data: data[..len].to_vec(),
    }
}

fn codec_id(codec: Codec) -> ffmpeg::codec::Id {
    match codec {
        Codec::H264 => ffmpeg::codec::Id::H264,
        Codec::Hevc => ffmpeg::codec::Id::HEVC,
    }
}

fn set_timing(context: &mut ffmpeg::codec::context::Context, fps: i32) {
    unsafe {
        let raw = context.as_mut_ptr();
        (*raw).pkt_timebase = ffi::AVRational {
            num: 1,
            den: 90_000,
        };
        if fps > 0 {
            (*raw).framerate = ffi::AVRational { num: fps, den: 1 };
        }
    }
}

fn map_libav_error(context: &str, err: ffmpeg::Error) -> BackendError {
    match err {
        ffmpeg::Error::InvalidData => BackendError::InvalidBitstream(format!("{context}: {err}")),
        _ => BackendError::Backend(format!("{context}: {err}")),
    }
}
