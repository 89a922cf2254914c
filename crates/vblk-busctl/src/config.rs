use clap::Parser;
use std::{env, path::PathBuf};

#[derive(Debug, Clone, Parser)]
#[command(name = "vblk-busctl", version, about)]
struct Args {
    /// Product name; the bus reports itself as "<product> Bus".
    ///
    /// Environment variable: `VBLK_PRODUCT`.
    #[arg(long, env = "VBLK_PRODUCT")]
    product: Option<String>,

    /// Disk image files to attach through the file backend.
    #[arg(long = "file", value_name = "PATH")]
    files: Vec<PathBuf>,

    /// Sizes (bytes) of dummy disks to attach.
    ///
    /// Environment variable: `VBLK_DUMMY_SIZES` (comma separated).
    #[arg(long = "dummy", value_name = "BYTES", env = "VBLK_DUMMY_SIZES", value_delimiter = ',')]
    dummy_sizes: Vec<u64>,

    /// Raw low-memory dump to scan for a MEMDISK boot disk.
    ///
    /// Environment variable: `VBLK_MEMDISK_IMAGE`.
    #[arg(long, env = "VBLK_MEMDISK_IMAGE")]
    memdisk_image: Option<PathBuf>,

    /// Physical address the MEMDISK dump starts at.
    #[arg(long, value_parser = parse_address)]
    memdisk_base: Option<u32>,

    /// Unit number to detach before removing the bus.
    ///
    /// Environment variable: `VBLK_DETACH_UNIT`.
    #[arg(long, env = "VBLK_DETACH_UNIT")]
    detach: Option<u32>,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `VBLK_LOG_LEVEL`.
    #[arg(long, env = "VBLK_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub product: String,
    pub files: Vec<PathBuf>,
    pub dummy_sizes: Vec<u64>,
    pub memdisk_image: Option<PathBuf>,
    pub memdisk_base: u32,
    pub detach: Option<u32>,
    pub log_level: String,
}

impl Config {
    pub fn load() -> Self {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> Self {
        let product = args
            .product
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "VBlk".to_string());

        let log_level = args
            .log_level
            .or_else(|| env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "info".to_string());

        Self {
            product,
            files: args.files,
            dummy_sizes: args.dummy_sizes,
            memdisk_image: args.memdisk_image,
            // Start of the low-memory window MEMDISK installs into.
            memdisk_base: args.memdisk_base.unwrap_or(0x8_0000),
            detach: args.detach,
            log_level,
        }
    }
}

fn parse_address(value: &str) -> Result<u32, String> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| format!("invalid address {value:?}: {err}"))
}
