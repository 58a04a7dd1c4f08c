//! Storage backend abstraction
//!
//! The engine talks to its backing store through a small capability set:
//! sequential read, random read, writable append, sync, list, rename,
//! and an exclusive lock. Backends are trait objects chosen at runtime;
//! the filesystem backend is the default and an in-memory backend backs
//! tests and scratch instances.

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use shardfs_common::{Error, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A file read front to back
pub trait SequentialFile: Send {
    /// Read up to `buf.len()` bytes; returns the number read, 0 at EOF.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn skip(&mut self, n: u64) -> Result<()>;
}

/// A file read at arbitrary offsets, shareable across threads
pub trait RandomAccessFile: Send + Sync {
    /// Read up to `n` bytes starting at `offset`; short reads only at EOF.
    fn read_at(&self, offset: u64, n: usize) -> Result<Vec<u8>>;
}

/// An append-only output file
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    /// Durably persist everything appended so far.
    fn sync(&mut self) -> Result<()>;
}

/// Held for the lifetime of a read-write engine on a data directory
pub trait StorageLock: Send {}

/// Runtime-selected storage backend
pub trait Storage: Send + Sync {
    fn new_sequential(&self, path: &Path) -> Result<Box<dyn SequentialFile>>;
    fn new_random_access(&self, path: &Path) -> Result<Arc<dyn RandomAccessFile>>;
    /// Create or truncate a writable file.
    fn new_writable(&self, path: &Path) -> Result<Box<dyn WritableFile>>;
    /// Open a writable file preserving existing contents.
    fn new_appendable(&self, path: &Path) -> Result<Box<dyn WritableFile>>;
    fn exists(&self, path: &Path) -> bool;
    /// Base names of the children of `dir`.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;
    fn remove(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn mkdirs(&self, dir: &Path) -> Result<()>;
    fn file_size(&self, path: &Path) -> Result<u64>;
    /// Take the exclusive lock guarding a data directory.
    fn lock(&self, path: &Path) -> Result<Box<dyn StorageLock>>;
}

/// Read a whole file into a byte vector.
pub fn read_file_to_vec(storage: &dyn Storage, path: &Path) -> Result<Vec<u8>> {
    let mut file = storage.new_sequential(path)?;
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

/// Atomically replace `path` with `contents` via a side file and rename.
pub fn write_string_atomic(storage: &dyn Storage, path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("dbtmp");
    {
        let mut file = storage.new_writable(&tmp)?;
        file.append(contents.as_bytes())?;
        file.sync()?;
    }
    storage.rename(&tmp, path)
}

// ---------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------

/// Local-filesystem backend
#[derive(Default)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Arc<dyn Storage> {
        Arc::new(Self)
    }
}

struct FsSequential(File);

impl SequentialFile for FsSequential {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.0.read(buf)?)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.0.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }
}

struct FsRandom(File);

impl RandomAccessFile for FsRandom {
    fn read_at(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let mut done = 0;
        while done < n {
            #[cfg(unix)]
            let r = {
                use std::os::unix::fs::FileExt as UnixFileExt;
                self.0.read_at(&mut buf[done..], offset + done as u64)?
            };
            #[cfg(not(unix))]
            let r = {
                let mut f = &self.0;
                f.seek(SeekFrom::Start(offset + done as u64))?;
                f.read(&mut buf[done..])?
            };
            if r == 0 {
                break;
            }
            done += r;
        }
        buf.truncate(done);
        Ok(buf)
    }
}

struct FsWritable(File);

impl WritableFile for FsWritable {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.0.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.0.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.0.flush()?;
        self.0.sync_data()?;
        Ok(())
    }
}

struct FsLock {
    file: File,
    #[allow(dead_code)]
    path: PathBuf,
}

impl StorageLock for FsLock {}

impl Drop for FsLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl Storage for FsStorage {
    fn new_sequential(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        Ok(Box::new(FsSequential(File::open(path)?)))
    }

    fn new_random_access(&self, path: &Path) -> Result<Arc<dyn RandomAccessFile>> {
        Ok(Arc::new(FsRandom(File::open(path)?)))
    }

    fn new_writable(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(FsWritable(file)))
    }

    fn new_appendable(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(FsWritable(file)))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn mkdirs(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn lock(&self, path: &Path) -> Result<Box<dyn StorageLock>> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        file.try_lock_exclusive().map_err(|e| {
            Error::io(format!(
                "data directory already locked ({}): {e}",
                path.display()
            ))
        })?;
        Ok(Box::new(FsLock {
            file,
            path: path.to_path_buf(),
        }))
    }
}

/// A writable file over a shared byte buffer, for building table images
/// destined for the wire rather than the local store.
pub struct BufferFile(pub Arc<Mutex<Vec<u8>>>);

impl BufferFile {
    pub fn new() -> (Box<dyn WritableFile>, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        (Box::new(BufferFile(buf.clone())), buf)
    }
}

impl WritableFile for BufferFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.0.lock().extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------

type MemFile = Arc<RwLock<Vec<u8>>>;

/// In-memory backend for tests and throwaway instances
pub struct MemStorage {
    files: Mutex<HashMap<PathBuf, MemFile>>,
    locks: Arc<Mutex<std::collections::HashSet<PathBuf>>>,
}

impl MemStorage {
    pub fn new() -> Arc<MemStorage> {
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            locks: Arc::new(Mutex::new(std::collections::HashSet::new())),
        })
    }
}

struct MemSequential {
    file: MemFile,
    pos: usize,
}

impl SequentialFile for MemSequential {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = self.file.read();
        if self.pos >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - self.pos);
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.pos = self.pos.saturating_add(n as usize);
        Ok(())
    }
}

struct MemRandom(MemFile);

impl RandomAccessFile for MemRandom {
    fn read_at(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        let data = self.0.read();
        let start = (offset as usize).min(data.len());
        let end = (start + n).min(data.len());
        Ok(data[start..end].to_vec())
    }
}

struct MemWritable(MemFile);

impl WritableFile for MemWritable {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.0.write().extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemLock {
    locks: Arc<Mutex<std::collections::HashSet<PathBuf>>>,
    path: PathBuf,
}

impl StorageLock for MemLock {}

impl Drop for MemLock {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.path);
    }
}

impl Storage for MemStorage {
    fn new_sequential(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        let files = self.files.lock();
        let file = files
            .get(path)
            .ok_or_else(|| Error::not_found(path.display().to_string()))?;
        Ok(Box::new(MemSequential {
            file: file.clone(),
            pos: 0,
        }))
    }

    fn new_random_access(&self, path: &Path) -> Result<Arc<dyn RandomAccessFile>> {
        let files = self.files.lock();
        let file = files
            .get(path)
            .ok_or_else(|| Error::not_found(path.display().to_string()))?;
        Ok(Arc::new(MemRandom(file.clone())))
    }

    fn new_writable(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file: MemFile = Arc::new(RwLock::new(Vec::new()));
        self.files.lock().insert(path.to_path_buf(), file.clone());
        Ok(Box::new(MemWritable(file)))
    }

    fn new_appendable(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let mut files = self.files.lock();
        let file = files
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
            .clone();
        Ok(Box::new(MemWritable(file)))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let files = self.files.lock();
        let mut names = Vec::new();
        for path in files.keys() {
            if path.parent() == Some(dir) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(path.display().to_string()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.lock();
        let file = files
            .remove(from)
            .ok_or_else(|| Error::not_found(from.display().to_string()))?;
        files.insert(to.to_path_buf(), file);
        Ok(())
    }

    fn mkdirs(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let files = self.files.lock();
        let file = files
            .get(path)
            .ok_or_else(|| Error::not_found(path.display().to_string()))?;
        let len = file.read().len() as u64;
        Ok(len)
    }

    fn lock(&self, path: &Path) -> Result<Box<dyn StorageLock>> {
        let mut locks = self.locks.lock();
        if !locks.insert(path.to_path_buf()) {
            return Err(Error::io(format!(
                "data directory already locked ({})",
                path.display()
            )));
        }
        Ok(Box::new(MemLock {
            locks: self.locks.clone(),
            path: path.to_path_buf(),
        }))
    }
}
