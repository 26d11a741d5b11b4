//! Shared types: encodings, archive types, resource descriptors and configuration.
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
/// Encoding of names stored inside a container
pub enum Encoding {
    /// UTF-8 encoding
    #[default]
    Utf8,
    /// Shift-JIS encoding
    Cp932,
    /// GB2312 encoding
    Gb2312,
    /// UTF-16 little endian
    Utf16Le,
}

impl Encoding {
    pub fn is_jis(&self) -> bool {
        matches!(self, Self::Cp932)
    }

    /// Width in bytes of one code unit.
    pub fn unit_len(&self) -> usize {
        match self {
            Self::Utf16Le => 2,
            _ => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
/// Name encoding requested on the command line
pub enum TextEncoding {
    /// Use the archive format's default encoding
    Default,
    /// UTF-8 encoding
    Utf8,
    #[value(alias("jis"), alias("sjis"))]
    /// Shift-JIS encoding
    Cp932,
    #[value(alias("gbk"))]
    /// GB2312 encoding
    Gb2312,
}

impl TextEncoding {
    pub fn to_encoding(self) -> Option<Encoding> {
        match self {
            TextEncoding::Default => None,
            TextEncoding::Utf8 => Some(Encoding::Utf8),
            TextEncoding::Cp932 => Some(Encoding::Cp932),
            TextEncoding::Gb2312 => Some(Encoding::Gb2312),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq, PartialOrd, Ord, Serialize, Hash)]
#[serde(rename_all = "kebab-case")]
/// Container format
pub enum ArchiveType {
    #[cfg(feature = "pak")]
    /// Quake PACK archive
    Pak,
    #[cfg(feature = "wad")]
    #[value(alias("iwad"), alias("pwad"))]
    /// Doom WAD archive
    Wad,
    #[cfg(feature = "grp")]
    /// Build engine GRP archive
    Grp,
    #[cfg(feature = "afs")]
    /// CRI AFS archive
    Afs,
    #[cfg(feature = "lnk")]
    /// KID LNK archive
    Lnk,
    #[cfg(feature = "gcm")]
    #[value(alias("iso"))]
    /// GameCube disc image file system
    Gcm,
    #[cfg(feature = "bsa")]
    /// Bethesda BSA archive
    Bsa,
    #[cfg(feature = "vpk")]
    /// Valve VPK archive
    Vpk,
    #[cfg(feature = "pfs")]
    #[value(alias("artemis"))]
    /// Artemis PFS archive
    Pfs,
    #[cfg(feature = "xp3")]
    #[value(alias("kirikiri"))]
    /// Kirikiri XP3 archive
    Xp3,
    #[cfg(feature = "rgssad")]
    #[value(alias("rgss"), alias("rgss3a"))]
    /// RPG Maker RGSSAD archive
    Rgssad,
    #[cfg(feature = "escude")]
    #[value(alias("esc-arc2"))]
    /// Escude ESC-ARC2 archive
    Escude,
    #[cfg(feature = "tfc")]
    /// Unreal Engine 3 texture file cache
    Tfc,
    #[cfg(feature = "circus-dat")]
    /// Circus DAT archive
    CircusDat,
}

impl AsRef<str> for ArchiveType {
    fn as_ref(&self) -> &str {
        match self {
            #[cfg(feature = "pak")]
            ArchiveType::Pak => "pak",
            #[cfg(feature = "wad")]
            ArchiveType::Wad => "wad",
            #[cfg(feature = "grp")]
            ArchiveType::Grp => "grp",
            #[cfg(feature = "afs")]
            ArchiveType::Afs => "afs",
            #[cfg(feature = "lnk")]
            ArchiveType::Lnk => "lnk",
            #[cfg(feature = "gcm")]
            ArchiveType::Gcm => "gcm",
            #[cfg(feature = "bsa")]
            ArchiveType::Bsa => "bsa",
            #[cfg(feature = "vpk")]
            ArchiveType::Vpk => "vpk",
            #[cfg(feature = "pfs")]
            ArchiveType::Pfs => "pfs",
            #[cfg(feature = "xp3")]
            ArchiveType::Xp3 => "xp3",
            #[cfg(feature = "rgssad")]
            ArchiveType::Rgssad => "rgssad",
            #[cfg(feature = "escude")]
            ArchiveType::Escude => "escude",
            #[cfg(feature = "tfc")]
            ArchiveType::Tfc => "tfc",
            #[cfg(feature = "circus-dat")]
            ArchiveType::CircusDat => "circus-dat",
        }
    }
}

impl std::fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Codec of one independently stored chunk.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Raw,
    Zlib,
    Lzss,
    Lzo,
}

/// One independently stored sub-unit of an entry.
///
/// `offset` is absolute within the entry's backing file.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub stored_length: u64,
    pub decompressed_length: u64,
}

impl Chunk {
    pub fn new(offset: u64, stored_length: u64, decompressed_length: u64) -> Self {
        Chunk {
            offset,
            stored_length,
            decompressed_length,
        }
    }
}

/// How the stored bytes of an entry become its logical content.
#[derive(Clone, Debug, Serialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Copy bytes verbatim.
    #[default]
    None,
    /// One zlib stream producing exactly the decompressed length.
    Zlib,
    /// One zlib stream whose output size is only discovered by draining it.
    ZlibUnknownSize,
    /// Okumura LZSS, output size taken from the entry.
    Lzss,
    /// A single LZO1X block.
    Lzo,
    /// Escude "acp" LZW block.
    Lzw,
    /// Repeating key XOR, position relative to the entry start.
    Xor { key: Vec<u8> },
    /// RGSSAD rolling 32-bit key: every 4 bytes the key becomes `key * 7 + 3`.
    RollingXor { seed: u32 },
    /// Bytes stored in the directory itself, followed by the stored bytes.
    Preload { data: Vec<u8> },
    /// Chunks sharing one codec, concatenated in order.
    Chunked { codec: Codec, chunks: Vec<Chunk> },
    /// Chunks with per-chunk codec selection.
    Variable { chunks: Vec<(Codec, Chunk)> },
}

impl Transform {
    pub fn chunks(&self) -> Option<Vec<Chunk>> {
        match self {
            Transform::Chunked { chunks, .. } => Some(chunks.clone()),
            Transform::Variable { chunks } => Some(chunks.iter().map(|(_, c)| *c).collect()),
            _ => None,
        }
    }

    /// Whether the decompressed length is authoritative for this transform.
    pub fn has_exact_length(&self) -> bool {
        !matches!(self, Transform::ZlibUnknownSize)
    }

    pub fn is_compressed(&self) -> bool {
        match self {
            Transform::None
            | Transform::Xor { .. }
            | Transform::RollingXor { .. }
            | Transform::Preload { .. } => false,
            Transform::Variable { chunks } => chunks.iter().any(|(c, _)| *c != Codec::Raw),
            Transform::Chunked { codec, .. } => *codec != Codec::Raw,
            _ => true,
        }
    }
}

/// Which file holds an entry's stored bytes.
#[derive(Clone, Debug, Serialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntrySource {
    /// The container that holds the directory.
    #[default]
    Container,
    /// A sibling file of a split archive.
    Companion { path: PathBuf, size: u64 },
}

/// One logical file inside a container.
#[derive(Clone, Debug, Serialize, PartialEq, Eq, Default)]
pub struct ArchiveEntry {
    pub name: String,
    pub source: EntrySource,
    pub source_offset: u64,
    pub stored_length: u64,
    pub decompressed_length: u64,
    pub transform: Transform,
}

impl ArchiveEntry {
    /// A stored entry whose content is copied verbatim.
    pub fn stored(name: impl Into<String>, offset: u64, length: u64) -> Self {
        ArchiveEntry {
            name: name.into(),
            source_offset: offset,
            stored_length: length,
            decompressed_length: length,
            ..Default::default()
        }
    }

    pub fn with_transform(mut self, transform: Transform, decompressed_length: u64) -> Self {
        self.transform = transform;
        self.decompressed_length = decompressed_length;
        self
    }

    pub fn is_blank(&self) -> bool {
        self.stored_length == 0 && self.source_offset == 0
    }
}

/// A folder met while walking a tree-structured directory.
///
/// Parents are referenced by index into the walk's node list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryNode {
    pub name: String,
    pub parent: Option<usize>,
    /// Child files and folders declared by this node.
    pub children: u64,
    /// Number of folders from the root down to and including this one.
    pub depth: usize,
}

#[derive(Debug, Clone)]
/// Extra configuration options for decoders and writers
pub struct ExtraConfig {
    /// Overrides the per-format name encoding.
    pub encoding: Option<Encoding>,
    /// Read-ahead cache size of the binary reader. 0 disables the cache.
    pub read_ahead: usize,
    /// Number of extraction workers.
    pub workers: usize,
    /// Zlib compression level used by writers.
    pub zlib_compression_level: u32,
    #[cfg(feature = "xp3")]
    /// Compress XP3 segments when that makes them smaller.
    pub xp3_compress_files: bool,
    #[cfg(feature = "xp3")]
    /// Compress the XP3 index.
    pub xp3_compress_index: bool,
    #[cfg(feature = "xp3")]
    /// Unwrap `mdf` zlib payloads while decoding XP3 archives.
    pub xp3_mdf_decompress: bool,
    #[cfg(feature = "pfs")]
    /// Write `pf6` archives without index XOR.
    pub pfs_disable_xor: bool,
    #[cfg(feature = "escude")]
    /// Seed of the ESC-ARC2 header key. Derived from the name table when unset.
    pub escude_key: Option<u32>,
    #[cfg(feature = "escude")]
    /// Wrap ESC-ARC2 payloads in literal-only LZW blocks.
    pub escude_fake_compress: bool,
}

impl Default for ExtraConfig {
    fn default() -> Self {
        ExtraConfig {
            encoding: None,
            read_ahead: crate::reader::DEFAULT_READ_AHEAD,
            workers: num_cpus::get(),
            zlib_compression_level: 6,
            #[cfg(feature = "xp3")]
            xp3_compress_files: true,
            #[cfg(feature = "xp3")]
            xp3_compress_index: true,
            #[cfg(feature = "xp3")]
            xp3_mdf_decompress: false,
            #[cfg(feature = "pfs")]
            pfs_disable_xor: false,
            #[cfg(feature = "escude")]
            escude_key: None,
            #[cfg(feature = "escude")]
            escude_fake_compress: false,
        }
    }
}
