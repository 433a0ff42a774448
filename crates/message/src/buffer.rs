use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// A re-openable byte source for message bodies.
///
/// Every call to `open` yields a fresh reader positioned at byte zero:
/// the pipeline reads the body once per delivery target and never
/// assumes a single-pass stream.
pub trait Buffer: Send + Sync {
    fn open(&self) -> std::io::Result<Box<dyn Read + Send>>;
    fn len(&self) -> std::io::Result<u64>;
}

/// Body held in memory, shared cheaply between deliveries.
#[derive(Debug, Clone)]
pub struct MemoryBuffer {
    data: Arc<[u8]>,
}

impl MemoryBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl Buffer for MemoryBuffer {
    fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::io::Cursor::new(Arc::clone(&self.data))))
    }

    fn len(&self) -> std::io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}

/// Body backed by a file on disk; the retry queue hands these out so
/// a spooled message is not copied back into memory for every attempt.
#[derive(Debug, Clone)]
pub struct FileBuffer {
    path: PathBuf,
}

impl FileBuffer {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Buffer for FileBuffer {
    fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(&self.path)?))
    }

    fn len(&self) -> std::io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

pub fn read_all(buffer: &dyn Buffer) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::new();
    buffer.open()?.read_to_end(&mut data)?;
    Ok(data)
}
