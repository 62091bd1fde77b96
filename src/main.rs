//! gralloc-probe - Exercise the allocator module end to end
//!
//! Opens the allocation device, allocates a buffer, fills it through a CPU
//! mapping, imports the handle into a second module instance the way a
//! consumer process would, checks the contents there and releases
//! everything again.

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, ValueEnum};
use gralloc_gbm::memfd::{MemfdBackend, MemfdConfig};
use gralloc_gbm::{
    Backend, GrallocModule, PerformRequest, PerformResponse, PixelFormat, Region, Usage, GPU0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Anonymous shared memory
    Memfd,
    /// GBM on a DRM render node (requires the `gbm` feature)
    Gbm,
}

/// Command line arguments for the allocator probe
#[derive(Parser, Debug)]
#[clap(
    name = "gralloc-probe",
    about = "Allocate, map, share and free a graphics buffer through the gralloc module.",
    version
)]
struct Args {
    /// Buffer width in pixels
    #[clap(short = 'W', long, default_value = "64")]
    width: u32,

    /// Buffer height in pixels
    #[clap(short = 'H', long, default_value = "64")]
    height: u32,

    /// Pixel format (see --list-formats)
    #[clap(short, long, value_parser = parse_format, default_value = "rgba8888")]
    format: PixelFormat,

    /// Allocation usage flags (e.g. 0x33)
    #[clap(short, long, value_parser = parse_usage, default_value = "0x33")]
    usage: Usage,

    /// Buffer backend
    #[clap(short, long, value_enum, default_value = "memfd")]
    backend: BackendKind,

    /// DRM node for the gbm backend (defaults to $GRALLOC_GBM_DEVICE or renderD128)
    #[clap(short, long)]
    device: Option<std::path::PathBuf>,

    /// Row alignment in pixels for the memfd backend
    #[clap(long, default_value = "16")]
    stride_align: u32,

    /// Enable verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// List known pixel formats and exit
    #[clap(long)]
    list_formats: bool,
}

/// Parses a format name ("rgba8888") or a raw numeric code ("1", "0x32315659").
fn parse_format(s: &str) -> Result<PixelFormat> {
    if let Some(format) = PixelFormat::from_name(s) {
        return Ok(format);
    }
    let code = parse_number(s).with_context(|| format!("Unknown pixel format: '{}'", s))?;
    let format = PixelFormat(code as i32);
    if !format.is_known() {
        bail!("Unsupported pixel format code: {:#x}", code);
    }
    Ok(format)
}

fn parse_usage(s: &str) -> Result<Usage> {
    let bits = parse_number(s).context("Invalid usage flags")?;
    Ok(Usage::from_bits_retain(bits))
}

fn parse_number(s: &str) -> Result<u32> {
    let s = s.trim();
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    Ok(value)
}

fn list_formats() {
    println!("Known pixel formats:");
    for format in PixelFormat::KNOWN {
        println!(
            "  {:<10} code {:#010x}  {} byte(s) per pixel",
            format,
            format.0,
            format.bytes_per_pixel()
        );
    }
}

/// Value written to byte `x` of row `y`.
fn pattern(x: usize, y: usize) -> u8 {
    (x.wrapping_mul(7) ^ y.wrapping_mul(13)) as u8
}

fn probe<B: Backend>(producer: GrallocModule<B>, consumer: GrallocModule<B>, args: &Args) -> Result<()> {
    let info = producer.info();
    log::info!(
        "Module '{}' ({}) v{}.{}",
        info.name,
        info.id,
        info.version_major,
        info.version_minor
    );

    let device = producer
        .open(GPU0)
        .context("Failed to open allocation device")?;

    match producer.perform(PerformRequest::GetDeviceFd)? {
        PerformResponse::DeviceFd(fd) => log::info!("Device descriptor: {}", fd),
        PerformResponse::Done => log::warn!("Device descriptor query returned no value"),
    }

    let (handle, pixel_stride) = device
        .allocate(args.width, args.height, args.format, args.usage)
        .with_context(|| {
            format!(
                "Failed to allocate {}x{} {} buffer",
                args.width, args.height, args.format
            )
        })?;
    log::info!(
        "Allocated buffer {}: {}x{} {} stride {} px ({} bytes), {} bytes total",
        handle.id(),
        handle.width(),
        handle.height(),
        handle.format(),
        pixel_stride,
        handle.stride(),
        handle.size()
    );

    let row_bytes = (args.width * args.format.bytes_per_pixel()) as usize;
    let row_stride = handle.stride() as usize;
    let full = Region::full(args.width, args.height);

    let ptr = producer
        .lock(&handle, Usage::SW_WRITE_OFTEN, full)
        .context("Failed to lock buffer for writing")?;
    for y in 0..args.height as usize {
        // SAFETY: the mapping covers `height` rows of `stride` bytes.
        let row = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr().add(y * row_stride), row_bytes) };
        for (x, byte) in row.iter_mut().enumerate() {
            *byte = pattern(x, y);
        }
    }
    producer.unlock(&handle)?;
    log::info!("Wrote test pattern ({} bytes per row)", row_bytes);

    let shared = handle.try_clone().context("Failed to duplicate handle")?;
    consumer
        .register_buffer(&shared)
        .context("Consumer failed to register buffer")?;
    let ptr = consumer
        .lock(&shared, Usage::SW_READ_OFTEN, full)
        .context("Consumer failed to lock buffer")?;
    let mut mismatches = 0usize;
    for y in 0..args.height as usize {
        // SAFETY: as above, in the consumer's own mapping.
        let row = unsafe { std::slice::from_raw_parts(ptr.as_ptr().add(y * row_stride), row_bytes) };
        mismatches += row
            .iter()
            .enumerate()
            .filter(|&(x, &byte)| byte != pattern(x, y))
            .count();
    }
    consumer.unlock(&shared)?;
    consumer.unregister_buffer(&shared)?;
    ensure!(mismatches == 0, "Consumer saw {} mismatching bytes", mismatches);
    log::info!("Consumer read back the pattern through its own mapping");

    device.free(handle).context("Failed to free buffer")?;
    device.close();
    log::info!("Buffer freed and device closed");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_formats {
        list_formats();
        return Ok(());
    }

    if args.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match args.backend {
        BackendKind::Memfd => {
            let backend = MemfdBackend::new(MemfdConfig {
                stride_align: args.stride_align,
                ..MemfdConfig::default()
            });
            probe(
                GrallocModule::new(backend.clone()),
                GrallocModule::new(backend),
                &args,
            )
        }
        #[cfg(feature = "gbm")]
        BackendKind::Gbm => {
            use gralloc_gbm::gbm_node::{GbmBackend, GbmConfig};
            let mut config = GbmConfig::from_env();
            if let Some(path) = &args.device {
                config.device_path = path.clone();
            }
            log::info!("Using render node {}", config.device_path.display());
            let backend = GbmBackend::new(config);
            probe(
                GrallocModule::new(backend.clone()),
                GrallocModule::new(backend),
                &args,
            )
        }
        #[cfg(not(feature = "gbm"))]
        BackendKind::Gbm => {
            let _ = &args.device;
            bail!("gralloc-probe was built without the `gbm` feature")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!(parse_format("rgb565").unwrap(), PixelFormat::RGB_565);
        assert_eq!(parse_format("0x32315659").unwrap(), PixelFormat::YV12);
        assert_eq!(parse_format("1").unwrap(), PixelFormat::RGBA_8888);
        assert!(parse_format("0x999").is_err());
        assert!(parse_format("argb").is_err());
    }

    #[test]
    fn parses_usage() {
        assert_eq!(
            parse_usage("0x33").unwrap(),
            Usage::SW_READ_OFTEN | Usage::SW_WRITE_OFTEN
        );
        assert_eq!(parse_usage("256").unwrap(), Usage::HW_TEXTURE);
        assert!(parse_usage("lots").is_err());
    }

    #[test]
    fn memfd_probe_succeeds() {
        let args = Args::parse_from(["gralloc-probe", "-W", "33", "-H", "9", "-f", "rgb888"]);
        let backend = MemfdBackend::default();
        probe(
            GrallocModule::new(backend.clone()),
            GrallocModule::new(backend),
            &args,
        )
        .unwrap();
    }
}
