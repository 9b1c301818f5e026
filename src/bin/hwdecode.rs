use std::fs::{self, File};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use hwdecoder::feed::{self, FeedOptions};
use hwdecoder::{
    BackendDecoderOptions, BackendError, BackendKind, Codec, ColorMatrix, DecodeSession,
    DecodedFrame, DecoderConfig, HwDeviceType, LibavDecoderOptions, OutputConfig, OutputFormat,
    ppm,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Bgr24,
    Rgb24,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MatrixArg {
    Bt601,
    Bt709,
}

#[derive(Parser, Debug)]
#[command(about = "Decode a raw H.264/HEVC elementary stream with hardware acceleration")]
struct Args {
    #[arg(long)]
    input: PathBuf,
    #[arg(long, default_value = "h264")]
    codec: String,
    #[arg(long, default_value = "dxva2")]
    device: String,
    /// Device string handed to the driver, e.g. /dev/dri/renderD128.
    #[arg(long)]
    device_path: Option<String>,
    #[arg(long, default_value = "auto")]
    backend: String,
    #[arg(long, default_value_t = feed::DEFAULT_CHUNK_SIZE)]
    chunk_bytes: usize,
    #[arg(long, value_enum, default_value = "bgr24")]
    format: FormatArg,
    #[arg(long, default_value_t = 1)]
    align: usize,
    #[arg(long, value_enum, default_value = "bt601")]
    matrix: MatrixArg,
    #[arg(long, default_value_t = false)]
    require_hardware: bool,
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long, default_value_t = 30)]
    fps: i32,
    /// Write every decoded frame as frameN.ppm into this directory.
    #[arg(long)]
    save_frames: Option<PathBuf>,
    #[arg(long)]
    max_frames: Option<usize>,
    #[arg(long, default_value_t = false)]
    threaded_reader: bool,
    #[arg(long, default_value_t = 8)]
    reader_queue: usize,
    #[arg(long, default_value_t = false)]
    quiet_backend: bool,
    #[arg(long, default_value_t = false)]
    print_frames: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let codec = Codec::from_name(&args.codec).context("invalid --codec")?;
    let device = HwDeviceType::from_name(&args.device).context("invalid --device")?;
    let backend = BackendKind::from_name(&args.backend).context("invalid --backend")?;
    if args.quiet_backend {
        hwdecoder::set_backend_log_level(true);
    }

    let mut config = DecoderConfig::new(codec, device);
    config.device_path = args.device_path.clone();
    config.fps = args.fps;
    config.require_hardware = args.require_hardware;
    config.output = OutputConfig {
        format: match args.format {
            FormatArg::Bgr24 => OutputFormat::Bgr24,
            FormatArg::Rgb24 => OutputFormat::Rgb24,
        },
        row_alignment: args.align,
        matrix: match args.matrix {
            MatrixArg::Bt601 => ColorMatrix::Bt601,
            MatrixArg::Bt709 => ColorMatrix::Bt709,
        },
    };
    config.backend_options = BackendDecoderOptions::Libav(LibavDecoderOptions {
        thread_count: args.threads,
        quiet: args.quiet_backend,
    });
    log::info!("{config}");

    let mut session = DecodeSession::try_new(backend, config)
        .with_context(|| format!("failed to open {backend} decoder for {codec} on {device}"))?;

    if let Some(dir) = &args.save_frames {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory: {}", dir.display()))?;
    }

    let input = File::open(&args.input)
        .with_context(|| format!("failed to open input stream: {}", args.input.display()))?;
    let options = FeedOptions {
        chunk_size: args.chunk_bytes,
        max_frames: args.max_frames,
    };

    let mut index = 0usize;
    let sink = |frame: &DecodedFrame| -> Result<(), BackendError> {
        if args.print_frames {
            println!("{} {} {}", frame.width(), frame.height(), frame.linesize);
        }
        if let Some(dir) = &args.save_frames {
            ppm::save_ppm(dir.join(format!("frame{index}.ppm")), frame)?;
        }
        index += 1;
        Ok(())
    };

    let stats = if args.threaded_reader {
        feed::run_threaded(input, &mut session, &options, args.reader_queue, sink)
    } else {
        feed::run(input, &mut session, &options, sink)
    }
    .context("decode failed")?;

    let summary = session.summary();
    println!(
        "decoded_frames={}, dropped_access_units={}, width={:?}, height={:?}, pixel_format={:?}, chunks={}, bytes={}, fps={:.1}, input={}",
        stats.frames,
        summary.dropped_access_units,
        summary.width,
        summary.height,
        summary.pixel_format,
        stats.chunks,
        stats.bytes,
        stats.frames_per_second(),
        args.input.display()
    );

    Ok(())
}
