use arc_tool::types::*;
use clap::{ArgAction, Parser, Subcommand};

/// Tools for detecting, listing, extracting and packing game archives
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Arg {
    #[arg(short = 't', long, value_enum, global = true)]
    /// Archive type. Skips detection when given.
    pub archive_type: Option<ArchiveType>,
    #[arg(short = 'e', long, value_enum, global = true)]
    /// Encoding of names inside the archive
    pub encoding: Option<TextEncoding>,
    #[arg(short, long, action = ArgAction::SetTrue, global = true)]
    /// Print debug logs
    pub verbose: bool,
    #[arg(short, long, action = ArgAction::SetTrue, global = true)]
    /// Search for archives in the directory recursively
    pub recursive: bool,
    #[arg(long, global = true, default_value_t = arc_tool::reader::DEFAULT_READ_AHEAD)]
    /// Read-ahead cache size of the directory reader. 0 disables the cache.
    pub read_ahead: usize,
    #[arg(long, global = true, default_value_t = 6, value_parser = clap::value_parser!(u32).range(0..=9))]
    /// Zlib compression level used when packing
    pub zlib_compression_level: u32,
    #[cfg(feature = "xp3")]
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    /// Store XP3 segments uncompressed
    pub xp3_no_compress_files: bool,
    #[cfg(feature = "xp3")]
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    /// Store the XP3 index uncompressed
    pub xp3_no_compress_index: bool,
    #[cfg(feature = "xp3")]
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    /// Unwrap mdf zlib payloads inside XP3 archives
    pub xp3_mdf_decompress: bool,
    #[cfg(feature = "pfs")]
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    /// Write pf6 archives without payload XOR
    pub pfs_disable_xor: bool,
    #[cfg(feature = "escude")]
    #[arg(long, global = true, value_parser = parse_u32)]
    /// Key seed for ESC-ARC2 archives. Derived from the name table when unset.
    pub escude_key: Option<u32>,
    #[cfg(feature = "escude")]
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    /// Wrap ESC-ARC2 payloads in uncompressed LZW blocks
    pub escude_fake_compress: bool,
    #[command(subcommand)]
    /// Command
    pub command: Command,
}

#[derive(Subcommand, Debug)]
/// Commands
pub enum Command {
    /// List supported archive formats
    Formats,
    /// Rate files against every supported format
    Detect {
        /// Input files or directories
        #[arg(required = true)]
        inputs: Vec<String>,
    },
    /// List the entries of an archive
    List {
        /// Input archive or directory
        input: String,
        #[arg(long, action = ArgAction::SetTrue)]
        /// Print the decoded table as JSON
        json: bool,
    },
    /// Extract every entry of an archive
    Extract {
        /// Input archive or directory
        input: String,
        #[arg(short, long)]
        /// Output directory. Defaults to the archive path without extension.
        output: Option<String>,
        #[arg(short = 'j', long)]
        /// Number of extraction workers. Defaults to the CPU count.
        jobs: Option<usize>,
    },
    /// Pack a directory into a new archive
    Create {
        /// Input directory
        input: String,
        /// Output archive
        output: String,
    },
}

#[cfg(feature = "escude")]
fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid key '{}': {}", s, e))
}

pub fn parse_args() -> Arg {
    Arg::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_follow_the_subcommand() {
        let arg = Arg::try_parse_from(["arc_tool", "extract", "data.pak", "-o", "out", "-j", "2", "-v"]).unwrap();
        assert!(arg.verbose);
        match arg.command {
            Command::Extract { input, output, jobs } => {
                assert_eq!(input, "data.pak");
                assert_eq!(output.as_deref(), Some("out"));
                assert_eq!(jobs, Some(2));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[cfg(feature = "escude")]
    #[test]
    fn escude_key_accepts_hex() {
        assert_eq!(parse_u32("0x12345678"), Ok(0x1234_5678));
        assert_eq!(parse_u32("42"), Ok(42));
        assert!(parse_u32("0xZZ").is_err());
    }
}
