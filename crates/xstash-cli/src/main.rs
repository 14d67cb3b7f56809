//! xstash: chunked, passphrase-encrypted stashes
//!
//! Commands:
//!   encrypt <input>     - pack a file or folder, split it into chunks, encrypt each chunk
//!   decrypt <stash>     - reassemble, decrypt and unpack a stash
//!   verify <stash>      - authenticate every chunk without writing plaintext
//!   inspect <stash>     - print the manifest summary or its JSON
//!   clean <stash>       - delete files the manifest does not reference
//!   config show         - display current configuration

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use xstash_core::config::XstashConfig;
use xstash_core::CompressionMethod;
use xstash_crypto::BinaryEncoding;
use xstash_engine::{
    clean_stash, encode_stash, load_manifest, open_stash, verify_stash, DecodeOptions, EncodeOptions, ProgressFn,
};
use xstash_pack::{pack, unpack, PackMode};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "xstash",
    version,
    about = "Chunked, passphrase-encrypted stashes",
    long_about = "xstash: split a file or folder into AES-256-GCM encrypted chunk files plus a .xmap manifest, and put it back together"
)]
struct Cli {
    /// Path to the xstash configuration file
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "XSTASH_CONFIG",
        default_value = "~/.config/xstash/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, global = true, env = "XSTASH_LOG")]
    log: Option<String>,

    /// Log format; overrides [log] format
    #[arg(long, global = true, env = "XSTASH_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Passphrase (prompted for when unset)
    #[arg(long, global = true, env = "XSTASH_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Do not draw progress bars
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pack, chunk and encrypt a file or folder into a stash directory
    Encrypt(EncryptArgs),

    /// Decrypt a stash directory back into the original file or folder
    Decrypt {
        /// Stash directory
        stash: PathBuf,
        /// Output path (default: stash path without its .xstash extension)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Authenticate every chunk of a stash without writing plaintext
    Verify {
        /// Stash directory
        stash: PathBuf,
    },

    /// Show the manifest of a stash
    Inspect {
        /// Stash directory
        stash: PathBuf,
        /// Encoding for binary fields
        #[arg(long, default_value = "hex")]
        encoding: BinaryEncoding,
        /// Print the manifest as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Delete files in a stash directory that the manifest does not reference
    Clean {
        /// Stash directory
        stash: PathBuf,
        /// Only list what would be deleted
        #[arg(long)]
        dry_run: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
struct EncryptArgs {
    /// File or folder to stash
    input: PathBuf,

    /// Stash directory (default: <input>.xstash next to the input)
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Number of chunks (overrides stash.chunks)
    #[arg(long, conflicts_with = "chunk_size")]
    chunks: Option<u64>,

    /// Chunk size, e.g. 4M or 512KiB (overrides stash.chunk_size)
    #[arg(long, value_parser = parse_bytes)]
    chunk_size: Option<u64>,

    /// Chunks sharing one derived key (overrides stash.group_by)
    #[arg(long)]
    group_by: Option<usize>,

    /// Put the size remainder in its own final chunk instead of the last one
    #[arg(long)]
    no_append_overflow: bool,

    /// Compression before chunking: none, gzip or lz4 (overrides pack.compression)
    #[arg(long)]
    compression: Option<CompressionMethod>,

    /// Stream the packed input instead of spooling it to learn its size
    /// (requires a chunk size)
    #[arg(long)]
    stream: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = match &cli.log_format {
        Some(format) => format.clone(),
        None => LogFormat::from_str(&config.log.format, true)
            .map_err(|e| anyhow::anyhow!("config [log] format: {e}"))?,
    };
    init_logging(&level, &format);
    debug!(config = %config_path.display(), found = config_path.exists(), "configuration loaded");

    let ui = Ui {
        progress: !cli.no_progress,
    };
    let passphrase = cli.passphrase;

    match cli.command {
        Commands::Encrypt(args) => cmd_encrypt(&config, &ui, passphrase, args),
        Commands::Decrypt { stash, output } => {
            cmd_decrypt(&config, &ui, passphrase, &stash, output.as_deref())
        }
        Commands::Verify { stash } => cmd_verify(&config, &ui, passphrase, &stash),
        Commands::Inspect { stash, encoding, json } => cmd_inspect(&stash, encoding, json),
        Commands::Clean { stash, dry_run } => cmd_clean(&stash, dry_run),
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<XstashConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(XstashConfig::default())
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

// ── Passphrase ────────────────────────────────────────────────────────────────

fn read_passphrase(given: Option<String>, confirm: bool) -> Result<SecretString> {
    let passphrase = match given {
        Some(passphrase) => passphrase,
        None => {
            let first = rpassword::prompt_password("Passphrase: ").context("reading passphrase")?;
            if confirm {
                let second =
                    rpassword::prompt_password("Confirm passphrase: ").context("reading passphrase")?;
                if first != second {
                    anyhow::bail!("passphrases do not match");
                }
            }
            first
        }
    };
    if passphrase.is_empty() {
        anyhow::bail!("passphrase must not be empty");
    }
    Ok(SecretString::from(passphrase))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

struct Ui {
    progress: bool,
}

impl Ui {
    /// A byte bar when the total is known, a spinner otherwise.
    fn bar(&self, total: Option<u64>, prefix: &str) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        match total {
            Some(total) => make_progress_bar(total, prefix),
            None => make_spinner(prefix),
        }
    }
}

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}"
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn progress_callback(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Arc::new(move |done, total, msg| {
        if let Some(total) = total {
            pb.set_length(total);
        }
        pb.set_position(done);
        pb.set_message(msg.to_string());
    })
}

// ── `xstash encrypt` ──────────────────────────────────────────────────────────

fn cmd_encrypt(config: &XstashConfig, ui: &Ui, passphrase: Option<String>, args: EncryptArgs) -> Result<()> {
    let mut stash = config.stash.clone();
    if let Some(chunks) = args.chunks {
        stash.chunks = chunks;
        stash.chunk_size = None;
    }
    if let Some(chunk_size) = args.chunk_size {
        stash.chunk_size = Some(chunk_size);
    }
    if let Some(group_by) = args.group_by {
        stash.group_by = group_by;
    }
    if args.no_append_overflow {
        stash.append_overflow = false;
    }
    if args.stream && stash.chunk_size.is_none() {
        anyhow::bail!("--stream needs a chunk size (--chunk-size or stash.chunk_size)");
    }
    let mut options = EncodeOptions::from_config(&stash).context("invalid stash settings")?;

    let compression = match args.compression {
        Some(method) => method,
        None => config.pack.compression_method().context("config [pack] compression")?,
    };
    let mode = if args.stream {
        PackMode::Streaming
    } else {
        PackMode::Sized {
            spool_dir: config.pack.spool_dir.as_deref().map(expand_tilde),
        }
    };
    let out = match args.output {
        Some(out) => out,
        None => default_stash_dir(&args.input)?,
    };

    let passphrase = read_passphrase(passphrase, true)?;

    let packed = pack(&args.input, compression, &mode)
        .with_context(|| format!("packing {}", args.input.display()))?;
    options.kind = packed.kind;
    options.compression = packed.compression;
    if options.chunk_size.is_none() {
        if let Some(total) = packed.total {
            let count = clamp_chunk_count(options.chunk_count, total);
            if count != options.chunk_count {
                debug!(requested = options.chunk_count, count, total, "fewer bytes than chunks, lowering chunk count");
                options.chunk_count = count;
            }
        }
    }

    println!(
        "Stashing {} ({}, {}) → {}",
        args.input.display(),
        packed.kind,
        packed.compression,
        out.display()
    );

    let pb = ui.bar(packed.total, "encrypt");
    let progress = progress_callback(&pb);
    let report = encode_stash(packed.reader, packed.total, &out, &passphrase, &options, Some(&progress))
        .with_context(|| format!("encoding stash {}", out.display()))?;
    pb.finish_with_message("done");

    println!("  chunks:  {}", report.chunks);
    println!("  groups:  {}", report.groups);
    println!("  bytes:   {}", fmt_bytes(report.bytes));
    println!("  stash:   {}", report.dir.display());
    Ok(())
}

/// A chunk holds at least one byte, so a stream shorter than the requested
/// count gets one chunk per byte.
fn clamp_chunk_count(requested: u64, total: u64) -> u64 {
    requested.min(total.max(1))
}

/// `<input>.xstash` next to the input.
fn default_stash_dir(input: &Path) -> Result<PathBuf> {
    let input = input
        .canonicalize()
        .with_context(|| format!("resolving {}", input.display()))?;
    let mut name = input
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("stash"));
    name.push(".xstash");
    Ok(input.with_file_name(name))
}

// ── `xstash decrypt` ──────────────────────────────────────────────────────────

fn cmd_decrypt(
    config: &XstashConfig,
    ui: &Ui,
    passphrase: Option<String>,
    stash: &Path,
    output: Option<&Path>,
) -> Result<()> {
    let out = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output(stash));
    if out.exists() {
        anyhow::bail!("output already exists: {}", out.display());
    }

    let passphrase = read_passphrase(passphrase, false)?;
    let options = decode_options(config);

    let manifest = load_manifest(stash).with_context(|| format!("reading stash {}", stash.display()))?;
    let pb = ui.bar(Some(manifest.size), "decrypt");
    let reader = open_stash(stash, &passphrase, &options, Some(&progress_callback(&pb)))
        .with_context(|| format!("opening stash {}", stash.display()))?;

    let unpacked = unpack(reader, manifest.kind, manifest.compress.method, &out)
        .with_context(|| format!("decrypting {} into {}", stash.display(), out.display()))?;
    pb.finish_with_message("done");
    info!(stash = %stash.display(), out = %out.display(), files = unpacked.files, "stash restored");

    println!("Restored {} → {}", stash.display(), out.display());
    println!("  kind:    {}", manifest.kind);
    println!("  files:   {}", unpacked.files);
    println!("  bytes:   {}", fmt_bytes(unpacked.bytes));
    Ok(())
}

/// Stash path without its `.xstash` extension, or with `.out` appended.
fn default_output(stash: &Path) -> PathBuf {
    if stash.extension().is_some_and(|ext| ext == "xstash") {
        stash.with_extension("")
    } else {
        let mut name = stash.as_os_str().to_os_string();
        name.push(".out");
        PathBuf::from(name)
    }
}

fn decode_options(config: &XstashConfig) -> DecodeOptions {
    DecodeOptions {
        read_buffer: config.stash.read_buffer,
        ..DecodeOptions::default()
    }
}

// ── `xstash verify` ───────────────────────────────────────────────────────────

fn cmd_verify(config: &XstashConfig, ui: &Ui, passphrase: Option<String>, stash: &Path) -> Result<()> {
    let manifest = load_manifest(stash).with_context(|| format!("reading stash {}", stash.display()))?;
    let passphrase = read_passphrase(passphrase, false)?;

    let pb = ui.bar(Some(manifest.size), "verify");
    let report = verify_stash(stash, &passphrase, &decode_options(config), Some(&progress_callback(&pb)))
        .with_context(|| format!("verifying stash {}", stash.display()))?;
    pb.finish_with_message("ok");

    println!("Stash OK: {}", stash.display());
    println!("  chunks:  {}", report.manifest.chunks().len());
    println!("  groups:  {}", report.manifest.group_count());
    println!("  bytes:   {}", fmt_bytes(report.bytes));
    Ok(())
}

// ── `xstash inspect` ──────────────────────────────────────────────────────────

fn cmd_inspect(stash: &Path, encoding: BinaryEncoding, json: bool) -> Result<()> {
    let manifest = load_manifest(stash).with_context(|| format!("reading stash {}", stash.display()))?;

    if json {
        let text = manifest.stringify(encoding, true)?;
        println!("{text}");
        return Ok(());
    }

    println!("Stash: {}", stash.display());
    println!("  kind:        {}", manifest.kind);
    println!("  size:        {} ({} bytes)", fmt_bytes(manifest.size), manifest.size);
    println!(
        "  compression: {} ({} packed)",
        manifest.compress.method,
        fmt_bytes(manifest.compress.size)
    );
    println!("  chunks:      {}", manifest.chunks().len());
    println!("  groups:      {}", manifest.group_count());
    println!();

    let mut group = 0usize;
    for (index, chunk) in manifest.chunks().iter().enumerate() {
        if index > 0 && manifest.chunks()[index - 1].salt != chunk.salt {
            group += 1;
        }
        println!(
            "  {index:>5}  group {group:<4} {:>10}  iv {}  {}",
            fmt_bytes(chunk.size),
            encoding.encode(&chunk.iv),
            chunk.file
        );
    }
    Ok(())
}

// ── `xstash clean` ────────────────────────────────────────────────────────────

fn cmd_clean(stash: &Path, dry_run: bool) -> Result<()> {
    let report = clean_stash(stash, dry_run).with_context(|| format!("cleaning stash {}", stash.display()))?;

    if report.interrupted {
        println!("No manifest in {}: treating *.xpart files as leftovers of an interrupted encode", stash.display());
    }
    let verb = if dry_run { "would remove" } else { "removed" };
    for path in &report.removed {
        println!("  {verb}: {}", path.display());
    }
    println!(
        "{} {} file(s), kept {} chunk file(s)",
        if dry_run { "Would remove" } else { "Removed" },
        report.removed.len(),
        report.kept
    );
    Ok(())
}

// ── `xstash config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &XstashConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Utilities ─────────────────────────────────────────────────────────────────

/// Parse a byte size with an optional binary suffix: `512`, `64K`, `4MiB`, `1G`.
fn parse_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid byte size: {s:?}"))?;
    let unit: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        other => return Err(format!("unknown size suffix {other:?} (use K, M or G)")),
    };
    value
        .checked_mul(unit)
        .ok_or_else(|| format!("byte size too large: {s:?}"))
}

fn fmt_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64); 3] = [("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10)];
    UNITS
        .iter()
        .find(|(_, scale)| bytes >= *scale)
        .map(|(unit, scale)| format!("{:.1} {unit}", bytes as f64 / *scale as f64))
        .unwrap_or_else(|| format!("{bytes} B"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bytes_suffixes() {
        assert_eq!(parse_bytes("512").unwrap(), 512);
        assert_eq!(parse_bytes("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_bytes("64kb").unwrap(), 64 * 1024);
        assert_eq!(parse_bytes("4MiB").unwrap(), 4 << 20);
        assert_eq!(parse_bytes("1 G").unwrap(), 1 << 30);
        assert_eq!(parse_bytes("10b").unwrap(), 10);
    }

    #[test]
    fn parse_bytes_rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("K").is_err());
        assert!(parse_bytes("12T").is_err());
        assert!(parse_bytes("-5").is_err());
        assert!(parse_bytes("99999999999999999999G").is_err());
    }

    #[test]
    fn fmt_bytes_units() {
        assert_eq!(fmt_bytes(0), "0 B");
        assert_eq!(fmt_bytes(1023), "1023 B");
        assert_eq!(fmt_bytes(1536), "1.5 KB");
        assert_eq!(fmt_bytes(3 << 20), "3.0 MB");
        assert_eq!(fmt_bytes(5 << 30), "5.0 GB");
    }

    #[test]
    fn small_streams_get_fewer_chunks() {
        assert_eq!(clamp_chunk_count(50, 23), 23);
        assert_eq!(clamp_chunk_count(50, 1_000), 50);
        assert_eq!(clamp_chunk_count(50, 0), 1);
        assert_eq!(clamp_chunk_count(4, 4), 4);
    }

    #[test]
    fn default_output_strips_stash_extension() {
        assert_eq!(default_output(Path::new("/tmp/photos.xstash")), PathBuf::from("/tmp/photos"));
        assert_eq!(default_output(Path::new("/tmp/photos")), PathBuf::from("/tmp/photos.out"));
    }

    #[test]
    fn expand_tilde_uses_home() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(
            expand_tilde(Path::new("~/.config/xstash/config.toml")),
            PathBuf::from(home).join(".config/xstash/config.toml")
        );
        assert_eq!(expand_tilde(Path::new("/etc/x.toml")), PathBuf::from("/etc/x.toml"));
    }

    #[test]
    fn cli_parses_encrypt_flags() {
        let cli = Cli::try_parse_from([
            "xstash",
            "encrypt",
            "data",
            "--chunk-size",
            "1M",
            "--group-by",
            "3",
            "--compression",
            "lz4",
            "--stream",
            "--no-progress",
        ])
        .unwrap();
        assert!(cli.no_progress);
        match cli.command {
            Commands::Encrypt(args) => {
                assert_eq!(args.chunk_size, Some(1 << 20));
                assert_eq!(args.group_by, Some(3));
                assert_eq!(args.compression, Some(CompressionMethod::Lz4));
                assert!(args.stream);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_rejects_chunks_with_chunk_size() {
        assert!(Cli::try_parse_from(["xstash", "encrypt", "data", "--chunks", "4", "--chunk-size", "1M"]).is_err());
    }
}
