//! The ZIP archive backend.
//!
//! `ZipBackend` keeps a session-stable entry table over a `zip::ZipArchive`.
//! Mutations (add, replace, delete, rename, metadata) only update the table;
//! the archive file itself is rewritten once, at [`ZipBackend::close`], by
//! streaming every live entry into a temporary file and atomically renaming
//! it over the original. Entries that were not touched are raw-copied
//! without recompression.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use zip::read::ZipArchive;
use zip::write::{FullFileOptions, ZipWriter};
use zip::CompressionMethod;

use crate::extra::{self, UnixExtra};
use crate::{Error, Result};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Pull-style content source for a pending entry write.
///
/// The backend owns the source from the moment it is registered until the
/// archive is committed, so the staged bytes outlive every intermediate
/// failure. `open` must yield a fresh reader positioned at byte zero.
pub trait EntrySource: Send {
    /// Total number of bytes the source will yield.
    fn len(&self) -> u64;

    /// Whether the source is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Modification time recorded for the entry, seconds since the epoch.
    fn mtime(&self) -> i64;

    /// Open a reader over the full content.
    fn open(&self) -> Box<dyn Read + '_>;
}

/// What an added or replaced entry persists as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Symlink,
    Directory,
}

/// Metadata snapshot written into an entry's headers at commit.
#[derive(Debug, Clone, Copy)]
pub struct EntryMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub cretime: Option<i64>,
}

/// Decoded per-entry attributes, as stored in the archive.
#[derive(Debug, Clone, Default)]
pub struct EntryStat {
    pub size: u64,
    pub is_dir: bool,
    /// Full Unix mode from the external attributes, when present.
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
    pub cretime: Option<i64>,
}

struct Entry {
    /// Index in the on-disk archive; `None` for entries added this session.
    source_index: Option<usize>,
    /// Current name, with renames already applied.
    name: String,
    stat: EntryStat,
    encrypted: bool,
    kind: EntryKind,
    deleted: bool,
    data: Option<Box<dyn EntrySource>>,
    metadata: Option<EntryMetadata>,
}

/// A ZIP archive opened for a mount session.
pub struct ZipBackend {
    path: PathBuf,
    zip: Option<ZipArchive<File>>,
    entries: Vec<Entry>,
    password: Option<String>,
    read_only: bool,
    dirty: bool,
}

impl ZipBackend {
    /// Open an archive. A missing file is an error in read-only mode and
    /// an empty new archive otherwise.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let mut zip = match File::open(path) {
            Ok(file) => Some(ZipArchive::new(file)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !read_only => None,
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        if let Some(zip) = zip.as_mut() {
            for index in 0..zip.len() {
                let file = zip.by_index_raw(index)?;
                let unix: UnixExtra = file.extra_data().map(extra::parse).unwrap_or_default();
                let dos_mtime = file.last_modified().and_then(|dt| extra::dos_to_unix(&dt));
                let stat = EntryStat {
                    size: file.size(),
                    is_dir: file.is_dir(),
                    mode: file.unix_mode(),
                    uid: unix.uid,
                    gid: unix.gid,
                    atime: unix.atime,
                    mtime: unix.mtime.or(dos_mtime),
                    cretime: unix.cretime,
                };
                let kind = if stat.is_dir {
                    EntryKind::Directory
                } else if stat.mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
                    EntryKind::Symlink
                } else {
                    EntryKind::File
                };
                entries.push(Entry {
                    source_index: Some(index),
                    name: file.name().to_string(),
                    stat,
                    encrypted: file.encrypted(),
                    kind,
                    deleted: false,
                    data: None,
                    metadata: None,
                });
            }
        }
        debug!("opened archive {} with {} entries", path.display(), entries.len());

        Ok(Self {
            path: path.to_path_buf(),
            zip,
            entries,
            password: None,
            read_only,
            dirty: false,
        })
    }

    /// Path of the backing archive file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries in the table, dead ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any pending operation will rewrite the archive at close.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The raw (un-normalized) name of an entry.
    pub fn raw_name(&self, index: usize) -> Result<&str> {
        self.live(index).map(|e| e.name.as_str())
    }

    /// Decoded attributes of an entry.
    pub fn stat(&self, index: usize) -> Result<&EntryStat> {
        self.live(index).map(|e| &e.stat)
    }

    /// Validate `password` by opening the first entry, mirroring the way
    /// archive tools probe encrypted archives. The first password that
    /// unlocks the archive sticks; later calls cannot overwrite it.
    pub fn try_password(&mut self, password: &str) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let encrypted = self.entries[0].encrypted;
        let Some(zip) = self.zip.as_mut() else {
            return false;
        };
        if !encrypted {
            return zip.by_index(0).is_ok();
        }
        match zip.by_index_decrypt(0, password.as_bytes()) {
            Ok(_) => {
                self.password.get_or_insert_with(|| password.to_string());
                true
            }
            Err(_) => false,
        }
    }

    /// Run `f` over a decompressing (and, if needed, decrypting) reader
    /// for the entry's current on-disk content.
    pub fn with_entry_reader<T>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut dyn Read) -> io::Result<T>,
    ) -> Result<T> {
        let entry = self.live(index)?;
        let source = entry.source_index.ok_or(Error::InvalidEntry(index))?;
        let encrypted = entry.encrypted;
        let zip = self.zip.as_mut().ok_or(Error::InvalidEntry(index))?;
        let mut file = if encrypted {
            let password = self.password.as_ref().ok_or(Error::PasswordRequired)?;
            zip.by_index_decrypt(source, password.as_bytes())?
        } else {
            zip.by_index(source)?
        };
        f(&mut file).map_err(Error::Io)
    }

    /// Register a new entry whose content is pulled from `source` at commit.
    pub fn add_entry(
        &mut self,
        name: &str,
        kind: EntryKind,
        source: Box<dyn EntrySource>,
    ) -> Result<usize> {
        self.check_writable()?;
        let stat = EntryStat {
            size: source.len(),
            mtime: Some(source.mtime()),
            ..EntryStat::default()
        };
        self.entries.push(Entry {
            source_index: None,
            name: name.to_string(),
            stat,
            encrypted: false,
            kind,
            deleted: false,
            data: Some(source),
            metadata: None,
        });
        self.dirty = true;
        Ok(self.entries.len() - 1)
    }

    /// Replace an existing entry's content.
    pub fn replace_entry(
        &mut self,
        index: usize,
        kind: EntryKind,
        source: Box<dyn EntrySource>,
    ) -> Result<()> {
        self.check_writable()?;
        let entry = self.live_mut(index)?;
        entry.stat.size = source.len();
        entry.kind = kind;
        entry.data = Some(source);
        self.dirty = true;
        Ok(())
    }

    /// Mark an entry dead; it is dropped from the archive at commit.
    pub fn delete_entry(&mut self, index: usize) -> Result<()> {
        self.check_writable()?;
        self.live_mut(index)?.deleted = true;
        self.dirty = true;
        Ok(())
    }

    /// Rename an entry in place.
    pub fn rename_entry(&mut self, index: usize, new_name: &str) -> Result<()> {
        self.check_writable()?;
        let entry = self.live_mut(index)?;
        entry.name.clear();
        entry.name.push_str(new_name);
        self.dirty = true;
        Ok(())
    }

    /// Register a directory entry.
    pub fn add_directory(&mut self, name: &str) -> Result<usize> {
        self.check_writable()?;
        let mut name = name.trim_end_matches('/').to_string();
        name.push('/');
        self.entries.push(Entry {
            source_index: None,
            name,
            stat: EntryStat {
                is_dir: true,
                ..EntryStat::default()
            },
            encrypted: false,
            kind: EntryKind::Directory,
            deleted: false,
            data: None,
            metadata: None,
        });
        self.dirty = true;
        Ok(self.entries.len() - 1)
    }

    /// Schedule a metadata rewrite for the entry's headers.
    pub fn set_metadata(&mut self, index: usize, metadata: EntryMetadata) -> Result<()> {
        self.check_writable()?;
        self.live_mut(index)?.metadata = Some(metadata);
        self.dirty = true;
        Ok(())
    }

    /// Commit all pending operations and release the archive.
    ///
    /// Without pending operations the file is left untouched, byte for
    /// byte. Otherwise the surviving entries are streamed into a
    /// temporary file which then atomically replaces the original.
    pub fn close(mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let tmp_path = self.path.with_extension("zip.tmp");
        let tmp = File::create(&tmp_path)?;
        let mut writer = ZipWriter::new(tmp);

        let result = self.write_entries(&mut writer);
        match result.and_then(|()| writer.finish().map_err(Error::Zip)) {
            Ok(_) => {
                fs::rename(&tmp_path, &self.path)?;
                info!("committed archive {}", self.path.display());
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn write_entries(&mut self, writer: &mut ZipWriter<File>) -> Result<()> {
        for index in 0..self.entries.len() {
            let (name, kind, deleted, source_index, metadata, data, fallback_mtime) = {
                let entry = &mut self.entries[index];
                (
                    entry.name.clone(),
                    entry.kind,
                    entry.deleted,
                    entry.source_index,
                    entry.metadata,
                    entry.data.take(),
                    entry.stat.mtime.unwrap_or(0),
                )
            };
            if deleted {
                continue;
            }

            if let Some(data) = data {
                let options = entry_options(metadata.as_ref(), data.mtime(), data.len())?;
                match kind {
                    EntryKind::File => {
                        writer.start_file(name.as_str(), options)?;
                        io::copy(&mut data.open(), writer)?;
                    }
                    EntryKind::Symlink => {
                        let mut target = String::new();
                        data.open().read_to_string(&mut target)?;
                        writer.add_symlink(name.as_str(), target.as_str(), options)?;
                    }
                    EntryKind::Directory => {
                        debug_assert!(false, "directory entries carry no content");
                    }
                }
            } else if source_index.is_none() {
                // directory added this session
                let options = entry_options(metadata.as_ref(), fallback_mtime, 0)?;
                writer.add_directory(name.trim_end_matches('/'), options)?;
            } else if metadata.is_some() {
                // content untouched, headers rewritten
                let body = self.with_entry_reader(index, |reader| {
                    let mut body = Vec::new();
                    reader.read_to_end(&mut body)?;
                    Ok(body)
                })?;
                let options = entry_options(metadata.as_ref(), fallback_mtime, body.len() as u64)?;
                match kind {
                    EntryKind::Directory => {
                        writer.add_directory(name.trim_end_matches('/'), options)?;
                    }
                    EntryKind::Symlink => {
                        let target = String::from_utf8_lossy(&body);
                        writer.add_symlink(name.as_str(), target.as_ref(), options)?;
                    }
                    EntryKind::File => {
                        writer.start_file(name.as_str(), options)?;
                        writer.write_all(&body)?;
                    }
                }
            } else {
                let source = source_index.ok_or(Error::InvalidEntry(index))?;
                let zip = self.zip.as_mut().ok_or(Error::InvalidEntry(index))?;
                let file = zip.by_index_raw(source)?;
                writer.raw_copy_file_rename(file, name.as_str())?;
            }
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn live(&self, index: usize) -> Result<&Entry> {
        match self.entries.get(index) {
            Some(entry) if !entry.deleted => Ok(entry),
            _ => Err(Error::InvalidEntry(index)),
        }
    }

    fn live_mut(&mut self, index: usize) -> Result<&mut Entry> {
        match self.entries.get_mut(index) {
            Some(entry) if !entry.deleted => Ok(entry),
            _ => Err(Error::InvalidEntry(index)),
        }
    }
}

fn entry_options(
    metadata: Option<&EntryMetadata>,
    fallback_mtime: i64,
    len: u64,
) -> Result<FullFileOptions<'static>> {
    let mtime = metadata.map(|m| m.mtime).unwrap_or(fallback_mtime);
    let mut options = FullFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(extra::unix_to_dos(mtime))
        .large_file(len >= u32::MAX as u64);
    if let Some(meta) = metadata {
        options = options.unix_permissions(meta.mode);
        options.add_extra_data(
            extra::EXTENDED_TIMESTAMP,
            extra::timestamp_field(meta.mtime, meta.atime, meta.cretime).into_boxed_slice(),
            false,
        )?;
        options.add_extra_data(
            extra::INFOZIP_UNIX_NEW,
            extra::unix_field(meta.uid, meta.gid).into_boxed_slice(),
            false,
        )?;
    }
    Ok(options)
}
