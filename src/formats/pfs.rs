//! Artemis engine PFS archives (`pf6` and `pf8`).
//!
//! `pf8` payloads are XORed with the SHA-1 digest of the index.
use super::base::*;
use crate::decode::DecodeContext;
use crate::detect::Probe;
use crate::error::{ArcError, Result};
use crate::ext::io::*;
use crate::reader::SourceReader;
use crate::types::*;
use crate::utils::struct_pack::*;
use crate::validate::*;
use arc_tool_macro::{StructPack, StructUnpack};
use sha1::{Digest, Sha1};
use std::io::{Read, SeekFrom};

const INDEX_START: u64 = 7;
/// Smallest possible index record: empty name plus three fields.
const MIN_RECORD_LEN: u64 = 16;

#[derive(Debug, Clone, StructPack, StructUnpack)]
struct PfsEntryHeader {
    #[pstring(u32)]
    name: String,
    _unk: u32,
    offset: u32,
    size: u32,
}

fn index_key(index: &[u8]) -> Vec<u8> {
    Sha1::digest(index).to_vec()
}

#[derive(Debug)]
pub struct PfsArchiveBuilder {}

impl PfsArchiveBuilder {
    pub const fn new() -> Self {
        PfsArchiveBuilder {}
    }
}

impl ArchiveBuilder for PfsArchiveBuilder {
    fn archive_type(&self) -> &'static ArchiveType {
        &ArchiveType::Pfs
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["pfs", "pfs.000", "pfs.001", "pfs.002"]
    }

    fn games(&self) -> &'static [&'static str] {
        &["Sakura no Toki", "Hanasaku Manimani"]
    }

    fn is_this_format(&self, probe: &Probe) -> Option<u8> {
        if !probe.starts_with(b"pf6") && !probe.starts_with(b"pf8") {
            return None;
        }
        let mut score = 40;
        let index_size = probe.u32_at(3)? as u64;
        if check_offset(INDEX_START + index_size, probe.file_len) {
            score += 15;
        }
        let count = probe.u32_at(INDEX_START)? as u64;
        if count * MIN_RECORD_LEN <= index_size {
            score += 15;
        }
        Some(score)
    }

    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>> {
        let magic = reader.read_array::<3>()?;
        let xor = match &magic {
            b"pf6" => false,
            b"pf8" => true,
            _ if magic.starts_with(b"pf") => {
                return Err(ArcError::UnsupportedVariant(format!(
                    "Artemis archive version {}",
                    magic[2] as char
                )));
            }
            _ => return Err(ArcError::corrupt(0, "magic", format!("found {:02x?}", magic))),
        };
        let index_size = reader.read_u32()? as u64;
        let index_end = INDEX_START + index_size;
        ensure_offset(index_end, reader.len(), 3)?;
        let count = ensure_num_files(reader.read_u32()? as i64, INDEX_START)?;
        if count as u64 * MIN_RECORD_LEN > index_size {
            return Err(ArcError::corrupt(
                INDEX_START,
                "num_files",
                format!("{} entries do not fit an index of {:#x} bytes", count, index_size),
            ));
        }
        let transform = if xor {
            Transform::Xor {
                key: index_key(&reader.read_at(INDEX_START, index_size)?),
            }
        } else {
            Transform::None
        };
        let mut entries = Vec::with_capacity(capacity_hint(count));
        for _ in 0..count {
            let at = reader.position();
            let header: PfsEntryHeader = reader.read_struct(false, ctx.encoding)?;
            if reader.position() > index_end {
                return Err(ArcError::corrupt(at, "extent", "index entry crosses the end of the index"));
            }
            let (offset, size) = (header.offset as u64, header.size as u64);
            ensure_extent(offset, size, reader.len(), reader.position() - 8)?;
            entries.push(ArchiveEntry::stored(header.name, offset, size).with_transform(transform.clone(), size));
        }
        Ok(entries)
    }

    fn can_create(&self) -> bool {
        true
    }

    fn create_archive<'a>(
        &self,
        output: &'a mut dyn ReadWriteSeek,
        files: &[&str],
        options: &WriteOptions,
    ) -> Result<Box<dyn ArchiveWriter + 'a>> {
        let xor = match options.preserved_header.as_deref() {
            Some(b"pf6") => false,
            Some(b"pf8") => true,
            _ => !options.config.pfs_disable_xor,
        };
        Ok(Box::new(PfsArchiveWriter::new(output, files, options.encoding, xor)?))
    }

    fn preserved_header(&self, reader: &mut SourceReader) -> Result<Option<Vec<u8>>> {
        Ok(Some(reader.read_at(0, 3)?))
    }
}

pub struct PfsArchiveWriter<'w> {
    writer: &'w mut dyn ReadWriteSeek,
    headers: Vec<PfsEntryHeader>,
    slots: Slots,
    encoding: Encoding,
    xor: bool,
    index_size: u32,
}

impl<'w> PfsArchiveWriter<'w> {
    pub fn new(mut writer: &'w mut dyn ReadWriteSeek, files: &[&str], encoding: Encoding, xor: bool) -> Result<Self> {
        writer.write_all(if xor { b"pf8" } else { b"pf6" })?;
        // index size, patched once the placeholder index is written
        writer.write_u32(0)?;
        writer.write_u32(files.len() as u32)?;
        let mut headers = Vec::with_capacity(files.len());
        for file in files {
            let header = PfsEntryHeader {
                name: file.to_string(),
                _unk: 0,
                offset: 0,
                size: 0,
            };
            header.pack(&mut writer, false, encoding)?;
            headers.push(header);
        }
        let index_size = u32::try_from(writer.stream_position()? - INDEX_START)
            .map_err(|_| ArcError::InvalidInput("index larger than 4 GiB".into()))?;
        writer.patch_u32(3, index_size)?;
        Ok(PfsArchiveWriter {
            writer,
            headers,
            slots: Slots::new(files)?,
            encoding,
            xor,
            index_size,
        })
    }

    /// XORs every payload in place with the index digest.
    fn encrypt_payloads(&mut self) -> Result<()> {
        self.writer.seek(SeekFrom::Start(INDEX_START))?;
        let mut index = Vec::with_capacity(self.index_size as usize);
        (&mut self.writer).take(self.index_size as u64).read_to_end(&mut index)?;
        let key = index_key(&index);
        let mut buf = [0u8; 1024];
        for header in &self.headers {
            self.writer.seek(SeekFrom::Start(header.offset as u64))?;
            let mut pos = 0u32;
            while pos < header.size {
                let want = (header.size - pos).min(buf.len() as u32) as usize;
                self.writer.read_exact(&mut buf[..want])?;
                for (i, b) in buf[..want].iter_mut().enumerate() {
                    *b ^= key[(pos as usize + i) % key.len()];
                }
                self.writer.seek(SeekFrom::Current(-(want as i64)))?;
                self.writer.write_all(&buf[..want])?;
                pos += want as u32;
            }
        }
        Ok(())
    }
}

fn field(name: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| ArcError::InvalidInput(format!("'{}' lies beyond 4 GiB", name)))
}

impl ArchiveWriter for PfsArchiveWriter<'_> {
    fn new_file<'a>(&'a mut self, name: &str) -> Result<Box<dyn WriteSeek + 'a>> {
        let i = self.slots.claim(name)?;
        Ok(Box::new(self.slots.open_at_end(self.writer, i, 1)?))
    }

    fn write_header(&mut self) -> Result<()> {
        for (header, (name, offset, size)) in self.headers.iter_mut().zip(self.slots.iter()) {
            header.offset = field(name, offset)?;
            header.size = field(name, size)?;
        }
        self.writer.seek(SeekFrom::Start(INDEX_START + 4))?;
        for header in &self.headers {
            header.pack(&mut self.writer, false, self.encoding)?;
        }
        if self.xor {
            self.encrypt_payloads()?;
        }
        Ok(())
    }
}
