pub mod args;

use anyhow::Context;
use arc_tool::detect::{self, Probe};
use arc_tool::formats::{self, Archive, PackItem, WriteOptions};
use arc_tool::reader::BinaryReader;
use arc_tool::types::*;
use arc_tool::utils::counter::Counter;
use arc_tool::utils::files;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

lazy_static::lazy_static! {
    static ref COUNTER: Counter = Counter::new();
}

const LOG_ENV: &str = "ARC_TOOL_LOG";

fn init_logging(verbose: bool) {
    let fallback = if verbose {
        "warn,arc_tool=debug"
    } else {
        "warn,arc_tool=info"
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_config(arg: &args::Arg) -> ExtraConfig {
    let mut cfg = ExtraConfig {
        encoding: arg.encoding.and_then(TextEncoding::to_encoding),
        read_ahead: arg.read_ahead,
        zlib_compression_level: arg.zlib_compression_level,
        ..Default::default()
    };
    #[cfg(feature = "xp3")]
    {
        cfg.xp3_compress_files = !arg.xp3_no_compress_files;
        cfg.xp3_compress_index = !arg.xp3_no_compress_index;
        cfg.xp3_mdf_decompress = arg.xp3_mdf_decompress;
    }
    #[cfg(feature = "pfs")]
    {
        cfg.pfs_disable_xor = arg.pfs_disable_xor;
    }
    #[cfg(feature = "escude")]
    {
        cfg.escude_key = arg.escude_key;
        cfg.escude_fake_compress = arg.escude_fake_compress;
    }
    cfg
}

/// Runs `f` on every archive below `input`, counting failures instead of stopping.
///
/// `f` returns `false` for inputs it skipped.
fn for_each_archive(input: &str, recursive: bool, mut f: impl FnMut(&Path, bool) -> anyhow::Result<bool>) {
    let (inputs, is_dir) = match files::collect_arc_files(Path::new(input), recursive) {
        Ok(found) => found,
        Err(e) => {
            tracing::error!("{}: {}", input, e);
            COUNTER.inc_error();
            return;
        }
    };
    if is_dir && inputs.is_empty() {
        tracing::warn!("no archives found in {}", input);
    }
    for path in inputs {
        match f(&path, is_dir) {
            Ok(true) => COUNTER.inc_ok(),
            Ok(false) => COUNTER.inc_skipped(),
            Err(e) => {
                tracing::error!("{}: {:#}", path.display(), e);
                COUNTER.inc_error();
            }
        }
    }
}

fn open_archive(path: &Path, arg: &args::Arg, cfg: &ExtraConfig) -> anyhow::Result<Archive> {
    Archive::open(path, arg.archive_type, cfg).with_context(|| format!("failed to decode {}", path.display()))
}

fn list_formats() {
    for builder in formats::BUILDER.iter() {
        println!(
            "{:<12} {:<3} {:<28} {}",
            builder.archive_type(),
            if builder.can_create() { "rw" } else { "r" },
            builder.extensions().join(","),
            builder.games().join(", ")
        );
    }
}

fn detect_file(path: &Path, cfg: &ExtraConfig) -> anyhow::Result<bool> {
    let file = std::fs::File::open(path)?;
    let mut reader = BinaryReader::with_read_ahead(file, cfg.read_ahead)?;
    let probe = Probe::from_reader(path.to_string_lossy(), &mut reader)?;
    let mut scores: Vec<_> = detect::scores(&probe).into_iter().filter(|(_, s)| *s > 0).collect();
    scores.sort_by(|a, b| b.1.cmp(&a.1));
    let selected = detect::detect(&probe).ok().map(|b| *b.archive_type());
    println!("{}", path.display());
    for (typ, score) in &scores {
        let mark = if Some(*typ) == selected { "*" } else { " " };
        println!("  {} {:<12} {:>3}", mark, typ, score);
    }
    if selected.is_none() {
        println!("  no format matched");
    }
    Ok(selected.is_some())
}

fn transform_label(transform: &Transform) -> &'static str {
    match transform {
        Transform::None => "-",
        Transform::Zlib => "zlib",
        Transform::ZlibUnknownSize => "zlib?",
        Transform::Lzss => "lzss",
        Transform::Lzo => "lzo",
        Transform::Lzw => "lzw",
        Transform::Xor { .. } => "xor",
        Transform::RollingXor { .. } => "rolling-xor",
        Transform::Preload { .. } => "preload",
        Transform::Chunked { .. } => "chunked",
        Transform::Variable { .. } => "variable",
    }
}

fn list_archive(path: &Path, json: bool, arg: &args::Arg, cfg: &ExtraConfig) -> anyhow::Result<bool> {
    let archive = open_archive(path, arg, cfg)?;
    let table = archive.table();
    if json {
        println!("{}", serde_json::to_string_pretty(table)?);
        return Ok(true);
    }
    println!("{} ({}, {} entries)", path.display(), table.format, table.len());
    for entry in table.iter() {
        println!(
            "{:>12} {:>12} {:<12} {}",
            entry.decompressed_length,
            entry.stored_length,
            transform_label(&entry.transform),
            entry.name
        );
    }
    println!(
        "{:>12} {:>12} total",
        table.total_decompressed(),
        table.total_stored()
    );
    Ok(true)
}

fn extract_dir(path: &Path, output: Option<&str>, is_dir: bool) -> PathBuf {
    let stem = PathBuf::from(path.file_stem().unwrap_or(path.as_os_str()));
    match output {
        Some(output) if is_dir => Path::new(output).join(stem),
        Some(output) => PathBuf::from(output),
        None => path.with_file_name(stem),
    }
}

fn extract_archive(
    path: &Path,
    output: Option<&str>,
    is_dir: bool,
    workers: usize,
    arg: &args::Arg,
    cfg: &ExtraConfig,
) -> anyhow::Result<bool> {
    let archive = open_archive(path, arg, cfg)?;
    if archive.table().is_empty() {
        tracing::warn!("{} holds no entries", path.display());
        return Ok(false);
    }
    let dir = extract_dir(path, output, is_dir);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    tracing::info!("extracting {} entries of {} to {}", archive.table().len(), path.display(), dir.display());
    let mut failed = 0usize;
    for extracted in archive.extract_all(&dir, workers)? {
        match extracted.result {
            Ok(len) => tracing::debug!("{}: {} bytes", extracted.name, len),
            Err(e) => {
                tracing::error!("{}: {}", extracted.name, e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} entries failed", failed, archive.table().len());
    }
    Ok(true)
}

fn create_archive(input: &str, output: &str, arg: &args::Arg, cfg: &ExtraConfig) -> anyhow::Result<()> {
    let typ = arg
        .archive_type
        .ok_or_else(|| anyhow::anyhow!("creating an archive needs an archive type (-t)"))?;
    let builder = formats::find_builder(typ)?;
    let files = files::collect_pack_files(Path::new(input))
        .with_context(|| format!("failed to read {}", input))?;
    if files.is_empty() {
        anyhow::bail!("{} holds no files", input);
    }
    let items: Vec<PackItem> = files.into_iter().map(|(name, path)| PackItem::file(name, path)).collect();
    let options = WriteOptions {
        encoding: cfg.encoding.unwrap_or_else(|| builder.default_encoding()),
        config: cfg.clone(),
        preserved_header: None,
    };
    formats::serialize(builder, &items, Path::new(output), &options)?;
    Ok(())
}

fn main() {
    let arg = args::parse_args();
    init_logging(arg.verbose);
    let cfg = build_config(&arg);
    match &arg.command {
        args::Command::Formats => list_formats(),
        args::Command::Detect { inputs } => {
            for input in inputs {
                for_each_archive(input, arg.recursive, |path, _| detect_file(path, &cfg));
            }
        }
        args::Command::List { input, json } => {
            for_each_archive(input, arg.recursive, |path, _| list_archive(path, *json, &arg, &cfg));
        }
        args::Command::Extract { input, output, jobs } => {
            let workers = jobs.unwrap_or(cfg.workers).max(1);
            for_each_archive(input, arg.recursive, |path, is_dir| {
                extract_archive(path, output.as_deref(), is_dir, workers, &arg, &cfg)
            });
        }
        args::Command::Create { input, output } => match create_archive(input, output, &arg, &cfg) {
            Ok(()) => COUNTER.inc_ok(),
            Err(e) => {
                tracing::error!("{:#}", e);
                COUNTER.inc_error();
            }
        },
    }
    if !matches!(arg.command, args::Command::Formats) {
        eprintln!("{}", *COUNTER);
    }
    if COUNTER.errors() > 0 {
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_dir_defaults_next_to_the_archive() {
        let path = Path::new("/games/data/Graphic.pak");
        assert_eq!(extract_dir(path, None, false), PathBuf::from("/games/data/Graphic"));
        assert_eq!(extract_dir(path, Some("/out"), false), PathBuf::from("/out"));
        assert_eq!(extract_dir(path, Some("/out"), true), PathBuf::from("/out/Graphic"));
    }

    #[cfg(feature = "pak")]
    #[test]
    fn create_then_extract_a_directory() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("maps")).unwrap();
        std::fs::write(src.path().join("maps").join("e1m1.bsp"), b"bsp data").unwrap();
        std::fs::write(src.path().join("default.cfg"), b"bind w +forward").unwrap();
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("pak0.pak");

        let arg = <args::Arg as clap::Parser>::try_parse_from(["arc_tool", "-t", "pak", "create", "x", "y"]).unwrap();
        let cfg = build_config(&arg);
        create_archive(&src.path().to_string_lossy(), &target.to_string_lossy(), &arg, &cfg).unwrap();

        let listed = Archive::open(&target, None, &cfg).unwrap();
        assert_eq!(listed.table().format, ArchiveType::Pak);
        let dir = out.path().join("extracted");
        assert!(extract_archive(&target, Some(&dir.to_string_lossy()), false, 2, &arg, &cfg).unwrap());
        assert_eq!(std::fs::read(dir.join("maps").join("e1m1.bsp")).unwrap(), b"bsp data");
        assert_eq!(std::fs::read(dir.join("default.cfg")).unwrap(), b"bind w +forward");
    }
}
