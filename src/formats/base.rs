use crate::decode::DecodeContext;
use crate::detect::{self, Probe};
use crate::error::{ArcError, Result};
use crate::ext::io::*;
use crate::reader::SourceReader;
use crate::table::ResourceTable;
use crate::transform::EntryStream;
use crate::types::*;
use crate::utils::files::{sanitize_entry_path, write_atomic};
use crate::utils::threadpool::ThreadPool;
use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Registration data and procedures of one container format.
pub trait ArchiveBuilder: std::fmt::Debug + Sync + Send {
    fn archive_type(&self) -> &'static ArchiveType;

    /// Extensions without the leading dot. Multi-part extensions such as
    /// `pfs.000` are allowed.
    fn extensions(&self) -> &'static [&'static str];

    /// Games known to ship this container.
    fn games(&self) -> &'static [&'static str] {
        &[]
    }

    fn default_encoding(&self) -> Encoding {
        Encoding::Utf8
    }

    /// Content score for `probe`, or `None` when the file cannot be this format.
    ///
    /// Must not fail on any input.
    fn is_this_format(&self, probe: &Probe) -> Option<u8>;

    /// Walks the directory and returns the entries in directory order.
    fn decode(&self, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<Vec<ArchiveEntry>>;

    fn can_create(&self) -> bool {
        false
    }

    /// Starts a new archive in `output` that will hold `files`.
    fn create_archive<'a>(
        &self,
        _output: &'a mut dyn ReadWriteSeek,
        _files: &[&str],
        _options: &WriteOptions,
    ) -> Result<Box<dyn ArchiveWriter + 'a>> {
        Err(ArcError::UnsupportedVariant(format!(
            "{} archives cannot be created",
            self.archive_type()
        )))
    }

    /// Opaque header bytes a rewrite passes through unchanged.
    fn preserved_header(&self, _reader: &mut SourceReader) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Writes one archive. Files are added with [ArchiveWriter::new_file] in any
/// order allowed by the format; [ArchiveWriter::write_header] finishes it.
pub trait ArchiveWriter {
    fn new_file<'a>(&'a mut self, name: &str) -> Result<Box<dyn WriteSeek + 'a>>;
    fn write_header(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub encoding: Encoding,
    pub config: ExtraConfig,
    /// Result of [ArchiveBuilder::preserved_header] on the archive being rewritten.
    pub preserved_header: Option<Vec<u8>>,
}

/// Writes into a slot of the output that starts at `start`. The slot grows as
/// data is written; `len` tracks its size.
pub struct SlotWriter<'a> {
    writer: &'a mut dyn ReadWriteSeek,
    start: u64,
    pos: u64,
    len: &'a mut u64,
}

impl<'a> SlotWriter<'a> {
    pub fn new(writer: &'a mut dyn ReadWriteSeek, start: u64, len: &'a mut u64) -> Self {
        SlotWriter {
            writer,
            start,
            pos: 0,
            len,
        }
    }
}

impl Write for SlotWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.seek(SeekFrom::Start(self.start + self.pos))?;
        let written = self.writer.write(buf)?;
        self.pos += written as u64;
        *self.len = (*self.len).max(self.pos);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for SlotWriter<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => self.len.checked_add_signed(offset),
            SeekFrom::Current(offset) => self.pos.checked_add_signed(offset),
        };
        self.pos = target.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        Ok(self.pos)
    }

    fn stream_position(&mut self) -> std::io::Result<u64> {
        Ok(self.pos)
    }
}

/// Placement of the files of an archive being written, in declared order.
#[derive(Debug, Default)]
pub struct Slots {
    names: Vec<String>,
    index: HashMap<String, usize>,
    written: Vec<bool>,
    pub offsets: Vec<u64>,
    pub sizes: Vec<u64>,
}

impl Slots {
    pub fn new(files: &[&str]) -> Result<Self> {
        let mut slots = Slots::default();
        for (i, name) in files.iter().enumerate() {
            if slots.index.insert(name.to_string(), i).is_some() {
                return Err(ArcError::InvalidInput(format!("file '{}' declared twice", name)));
            }
            slots.names.push(name.to_string());
        }
        slots.written = vec![false; files.len()];
        slots.offsets = vec![0; files.len()];
        slots.sizes = vec![0; files.len()];
        Ok(slots)
    }

    /// Marks `name` as written and returns its index. Each file is written once.
    pub fn claim(&mut self, name: &str) -> Result<usize> {
        let i = *self
            .index
            .get(name)
            .ok_or_else(|| ArcError::InvalidInput(format!("file '{}' was not declared for this archive", name)))?;
        if self.written[i] {
            return Err(ArcError::InvalidInput(format!("file '{}' already written", name)));
        }
        self.written[i] = true;
        Ok(i)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, i: usize) -> &str {
        &self.names[i]
    }

    /// `(name, offset, size)` of every file in declared order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64, u64)> + '_ {
        self.names
            .iter()
            .zip(self.offsets.iter().zip(&self.sizes))
            .map(|(n, (o, s))| (n.as_str(), *o, *s))
    }

    /// Opens the slot of file `i` at the end of `writer`, after padding to `align`.
    pub fn open_at_end<'a>(
        &'a mut self,
        writer: &'a mut dyn ReadWriteSeek,
        i: usize,
        align: u64,
    ) -> Result<SlotWriter<'a>> {
        writer.seek(SeekFrom::End(0))?;
        let start = writer.pad_to(align)?;
        self.offsets[i] = start;
        Ok(SlotWriter::new(writer, start, &mut self.sizes[i]))
    }
}

/// Where the bytes of a container live.
#[derive(Debug, Clone)]
pub enum ContainerSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl ContainerSource {
    pub fn open(&self) -> Result<Box<dyn ReadSeek>> {
        match self {
            ContainerSource::File(path) => {
                let f = std::fs::File::open(path)?;
                Ok(Box::new(std::io::BufReader::new(f)))
            }
            ContainerSource::Memory(data) => Ok(Box::new(MemReader::new(data.clone()))),
        }
    }

    /// Opens the file holding the bytes of `entry`.
    pub fn open_for(&self, entry: &ArchiveEntry) -> Result<Box<dyn ReadSeek>> {
        match &entry.source {
            EntrySource::Container => self.open(),
            EntrySource::Companion { path, .. } => match std::fs::File::open(path) {
                Ok(f) => Ok(Box::new(std::io::BufReader::new(f))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(ArcError::MissingCompanionFile(path.clone()))
                }
                Err(e) => Err(e.into()),
            },
        }
    }
}

/// Content of one file to pack.
#[derive(Debug, Clone)]
pub enum PackSource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct PackItem {
    pub name: String,
    pub source: PackSource,
}

impl PackItem {
    pub fn bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        PackItem {
            name: name.into(),
            source: PackSource::Bytes(data),
        }
    }

    pub fn file(name: impl Into<String>, path: PathBuf) -> Self {
        PackItem {
            name: name.into(),
            source: PackSource::File(path),
        }
    }

    fn copy_to(&self, out: &mut dyn Write) -> Result<u64> {
        match &self.source {
            PackSource::File(path) => {
                let mut f = std::fs::File::open(path)?;
                Ok(std::io::copy(&mut f, out)?)
            }
            PackSource::Bytes(data) => {
                out.write_all(data)?;
                Ok(data.len() as u64)
            }
        }
    }
}

fn write_items(
    builder: &dyn ArchiveBuilder,
    output: &mut dyn ReadWriteSeek,
    items: &[PackItem],
    options: &WriteOptions,
) -> Result<()> {
    let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
    let mut writer = builder.create_archive(output, &names, options)?;
    for item in items {
        let mut file = writer.new_file(&item.name)?;
        item.copy_to(&mut file)?;
        file.flush()?;
    }
    writer.write_header()
}

/// Packs `items` into `target`.
///
/// The archive is written to a temporary file next to `target`, which is
/// replaced only once the whole archive was written.
pub fn serialize(
    builder: &dyn ArchiveBuilder,
    items: &[PackItem],
    target: &Path,
    options: &WriteOptions,
) -> Result<()> {
    if !builder.can_create() {
        return Err(ArcError::UnsupportedVariant(format!(
            "{} archives cannot be created",
            builder.archive_type()
        )));
    }
    write_atomic(target, |file| write_items(builder, file, items, options))?;
    tracing::info!("packed {} files into {}", items.len(), target.display());
    Ok(())
}

/// Packs `items` into memory.
pub fn serialize_to_vec(builder: &dyn ArchiveBuilder, items: &[PackItem], options: &WriteOptions) -> Result<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    write_items(builder, &mut out, items, options)?;
    Ok(out.into_inner())
}

/// Looks up the registered builder for `typ`.
pub fn find_builder(typ: ArchiveType) -> Result<&'static dyn ArchiveBuilder> {
    super::BUILDER
        .iter()
        .find(|b| *b.archive_type() == typ)
        .map(|b| b.as_ref())
        .ok_or_else(|| ArcError::UnsupportedVariant(format!("{} is not registered", typ)))
}

/// Decodes the directory in `reader` with `builder`.
///
/// All or nothing: either every entry passes validation or an error naming the
/// offending offset and check is returned.
pub fn decode_table(builder: &dyn ArchiveBuilder, reader: &mut SourceReader, ctx: &DecodeContext) -> Result<ResourceTable> {
    let entries = builder
        .decode(reader, ctx)
        .map_err(ArcError::into_decode_error)?;
    tracing::debug!("{}: {} entries", ctx.filename, entries.len());
    ResourceTable::new(*builder.archive_type(), ctx.container_size, entries)
}

/// Outcome of materializing one entry during [Archive::extract_all].
#[derive(Debug)]
pub struct Extracted {
    pub name: String,
    pub result: Result<u64>,
}

/// A decoded archive together with the source of its bytes.
#[derive(Debug)]
pub struct Archive {
    builder: &'static dyn ArchiveBuilder,
    source: ContainerSource,
    table: ResourceTable,
}

impl Archive {
    /// Opens and decodes the archive at `path`. Without `typ` the format is detected.
    pub fn open(path: &Path, typ: Option<ArchiveType>, config: &ExtraConfig) -> Result<Self> {
        Self::load(ContainerSource::File(path.to_path_buf()), &path.to_string_lossy(), Some(path), typ, config)
    }

    pub fn from_bytes(filename: &str, data: Vec<u8>, typ: Option<ArchiveType>, config: &ExtraConfig) -> Result<Self> {
        Self::load(ContainerSource::Memory(data.into()), filename, None, typ, config)
    }

    fn load(
        source: ContainerSource,
        filename: &str,
        path: Option<&Path>,
        typ: Option<ArchiveType>,
        config: &ExtraConfig,
    ) -> Result<Self> {
        let mut reader = SourceReader::boxed(source.open()?, config.read_ahead)?;
        let builder = match typ {
            Some(typ) => find_builder(typ)?,
            None => detect::detect(&Probe::from_reader(filename, &mut reader)?)?,
        };
        let encoding = config.encoding.unwrap_or_else(|| builder.default_encoding());
        let mut ctx = DecodeContext::new(filename, reader.len(), config, encoding);
        if let Some(path) = path {
            ctx = ctx.with_path(path);
        }
        let table = decode_table(builder, &mut reader, &ctx)?;
        Ok(Archive {
            builder,
            source,
            table,
        })
    }

    pub fn builder(&self) -> &'static dyn ArchiveBuilder {
        self.builder
    }

    pub fn table(&self) -> &ResourceTable {
        &self.table
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        self.table.entries()
    }

    fn entry(&self, index: usize) -> Result<&ArchiveEntry> {
        self.table.get(index).ok_or_else(|| {
            ArcError::InvalidInput(format!(
                "entry index {} out of range ({} entries)",
                index,
                self.table.len()
            ))
        })
    }

    /// Opens entry `index` on its own source handle.
    pub fn open_entry(&self, index: usize) -> Result<EntryStream> {
        let entry = self.entry(index)?;
        entry.open(self.source.open_for(entry)?)
    }

    pub fn read_entry(&self, index: usize) -> Result<Vec<u8>> {
        self.open_entry(index)?.read_all()
    }

    /// Extracts every entry below `dir` using `workers` threads.
    ///
    /// Failures are reported per entry; one broken entry does not stop the rest.
    pub fn extract_all(&self, dir: &Path, workers: usize) -> Result<Vec<Extracted>> {
        let mut names: Vec<String> = self
            .entries()
            .iter()
            .map(|e| sanitize_entry_path(&e.name).to_string_lossy().replace('\\', "/"))
            .collect();
        crate::decode::dedupe_names(&mut names);
        let pool = ThreadPool::new(workers.max(1), "extract")?;
        for (entry, name) in self.entries().iter().zip(names) {
            let entry = entry.clone();
            let source = self.source.clone();
            let target = dir.join(&name);
            pool.execute(move || {
                let result = extract_one(&source, &entry, &target);
                Extracted { name, result }
            })?;
        }
        Ok(pool.into_results())
    }

    /// Re-packs this archive into `target`, replacing the content of the entries
    /// named in `replacements`. Opaque header fields of the source are kept.
    pub fn rewrite(&self, replacements: &HashMap<String, Vec<u8>>, target: &Path, config: &ExtraConfig) -> Result<()> {
        let mut reader = SourceReader::boxed(self.source.open()?, config.read_ahead)?;
        let options = WriteOptions {
            encoding: config.encoding.unwrap_or_else(|| self.builder.default_encoding()),
            config: config.clone(),
            preserved_header: self.builder.preserved_header(&mut reader)?,
        };
        let mut items = Vec::with_capacity(self.table.len());
        for (i, entry) in self.entries().iter().enumerate() {
            let data = match replacements.get(&entry.name) {
                Some(data) => data.clone(),
                None => self.read_entry(i)?,
            };
            items.push(PackItem::bytes(entry.name.clone(), data));
        }
        serialize(self.builder, &items, target, &options)
    }
}

fn extract_one(source: &ContainerSource, entry: &ArchiveEntry, target: &Path) -> Result<u64> {
    let data = entry.open(source.open_for(entry)?)?.read_all()?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(target, &data)?;
    Ok(data.len() as u64)
}
