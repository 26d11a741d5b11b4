//! File system helpers: input collection, safe output paths, atomic writes.
use crate::error::Result;
use crate::formats::ALL_EXTS;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

fn has_archive_ext(path: &Path) -> bool {
    let Some(name) = path.file_name() else {
        return false;
    };
    crate::validate::check_extension(&name.to_string_lossy(), &ALL_EXTS_REF)
}

lazy_static::lazy_static! {
    static ref ALL_EXTS_REF: Vec<&'static str> = ALL_EXTS.iter().map(|s| s.as_str()).collect();
}

/// Archives under `path` recognized by extension.
pub fn find_arc_files(path: &Path, recursive: bool) -> io::Result<Vec<PathBuf>> {
    let mut result = Vec::new();
    for entry in fs::read_dir(path)? {
        let path = entry?.path();
        if path.is_file() && has_archive_ext(&path) {
            result.push(path);
        } else if recursive && path.is_dir() {
            result.append(&mut find_arc_files(&path, recursive)?);
        }
    }
    result.sort();
    Ok(result)
}

/// Expands `path` to archive inputs. The flag tells whether `path` was a directory.
pub fn collect_arc_files(path: &Path, recursive: bool) -> io::Result<(Vec<PathBuf>, bool)> {
    if path.is_dir() {
        return Ok((find_arc_files(path, recursive)?, true));
    }
    if path.is_file() {
        return Ok((vec![path.to_path_buf()], false));
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("Path {} is neither a file nor a directory", path.display()),
    ))
}

/// Every file below `root` with its `/` separated path relative to `root`, sorted by name.
pub fn collect_pack_files(root: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else if path.is_file() {
                let rel = path.strip_prefix(root).unwrap_or(&path);
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((name, path));
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

pub fn read_file<F: AsRef<Path> + ?Sized>(f: &F) -> io::Result<Vec<u8>> {
    let mut content = Vec::new();
    if f.as_ref() == Path::new("-") {
        io::stdin().read_to_end(&mut content)?;
    } else {
        content = fs::read(f)?;
    }
    Ok(content)
}

/// Maps an entry name to a relative output path.
///
/// Absolute prefixes, `.` and `..` components are dropped so an entry can never
/// land outside the output directory.
pub fn sanitize_entry_path(name: &str) -> PathBuf {
    let normalized = name.replace('\\', "/");
    let mut out = PathBuf::new();
    for comp in Path::new(&normalized).components() {
        if let Component::Normal(part) = comp {
            let part = part.to_string_lossy();
            // drive letters such as `C:` are not components on unix
            if part.ends_with(':') {
                continue;
            }
            out.push(part.as_ref());
        }
    }
    if out.as_os_str().is_empty() {
        out.push("_");
    }
    out
}

/// Writes `target` through a temporary file in the same directory.
///
/// The target is replaced only after `write` returns successfully; on error the
/// temporary file is removed and an existing target stays untouched.
pub fn write_atomic<T>(target: &Path, write: impl FnOnce(&mut fs::File) -> Result<T>) -> Result<T> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let value = write(tmp.as_file_mut())?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(value)
}
