//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SortMergeError};
use crate::storage::{Storage, StorageError, StorageInput, StorageOutput};

/// Suffix of files still being written.
const PENDING_SUFFIX: &str = ".tmp";

/// Configuration for file-based storage.
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// Root directory holding the files.
    pub path: PathBuf,

    /// Buffer size for readers and writers, in bytes.
    pub buffer_size: usize,

    /// Whether to fsync every file, and the directory entry naming it, when
    /// it is closed.
    pub sync_writes: bool,
}

impl FileStorageConfig {
    /// Create a configuration rooted at `path` with default settings.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            buffer_size: 65536,
            sync_writes: false,
        }
    }
}

/// A file-based storage implementation.
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    config: FileStorageConfig,
}

impl FileStorage {
    /// Create a new file storage, creating its directory if needed.
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        let directory = config.path.clone();

        if !directory.exists() {
            std::fs::create_dir_all(&directory).map_err(|e| {
                SortMergeError::storage(format!("Failed to create directory: {e}"))
            })?;
        }

        if !directory.is_dir() {
            return Err(SortMergeError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage { directory, config })
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }
}

fn map_not_found(name: &str, e: io::Error) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::FileNotFound(name.to_string())
    } else {
        StorageError::IoError(e.to_string())
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let file = File::open(self.file_path(name)).map_err(|e| map_not_found(name, e))?;
        Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let final_path = self.file_path(name);
        let pending_path = self.file_path(&format!("{name}{PENDING_SUFFIX}"));

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&pending_path)
            .map_err(|e| StorageError::IoError(e.to_string()))?;

        Ok(Box::new(FileOutput {
            writer: Some(BufWriter::with_capacity(self.config.buffer_size, file)),
            pending_path,
            final_path,
            directory: self.directory.clone(),
            sync_writes: self.config.sync_writes,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| StorageError::IoError(format!("Failed to delete file: {e}")))?;
        }

        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();

        for entry in
            std::fs::read_dir(&self.directory).map_err(|e| StorageError::IoError(e.to_string()))?
        {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let path = entry.path();

            if path.is_file()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
                && !name.ends_with(PENDING_SUFFIX)
            {
                files.push(name.to_string());
            }
        }

        files.sort();
        Ok(files)
    }

    fn sync(&self) -> Result<()> {
        sync_directory(&self.directory)
            .map_err(|e| StorageError::IoError(format!("Failed to sync directory: {e}")))?;

        Ok(())
    }
}

/// Flush directory entries (creations, renames, removals) to disk.
#[cfg(unix)]
fn sync_directory(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Directory handles cannot be opened for syncing on this platform.
#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let size = file
            .metadata()
            .map_err(|e| SortMergeError::storage(format!("Failed to get file metadata: {e}")))?
            .len();

        Ok(FileInput {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
        })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

/// A file output implementation.
///
/// Writes go to `<name>.tmp`; closing renames it to `<name>`. Dropping an
/// unclosed output removes the pending file.
#[derive(Debug)]
pub struct FileOutput {
    writer: Option<BufWriter<File>>,
    pending_path: PathBuf,
    final_path: PathBuf,
    directory: PathBuf,
    sync_writes: bool,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("Output is closed"))?;

        writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl StorageOutput for FileOutput {
    fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };

        let written = writer.flush().and_then(|()| {
            if self.sync_writes {
                writer.get_ref().sync_all()
            } else {
                Ok(())
            }
        });
        // Drop the handle before renaming so the file is fully released.
        drop(writer);
        if let Err(e) = written {
            let _ = std::fs::remove_file(&self.pending_path);
            return Err(SortMergeError::storage(format!("Failed to flush: {e}")));
        }

        if let Err(e) = std::fs::rename(&self.pending_path, &self.final_path) {
            let _ = std::fs::remove_file(&self.pending_path);
            return Err(StorageError::IoError(format!("Failed to publish file: {e}")).into());
        }

        if self.sync_writes {
            sync_directory(&self.directory)
                .map_err(|e| StorageError::IoError(format!("Failed to sync directory: {e}")))?;
        }

        Ok(())
    }
}

impl Drop for FileOutput {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = std::fs::remove_file(&self.pending_path);
        }
    }
}
