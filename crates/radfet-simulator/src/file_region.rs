//! Flash region backed by a file on the host.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use radfet_core::storage::Storage;

/// A file standing in for the payload flash. Bytes never written read back
/// as `0xFF`, like erased NOR flash.
pub struct FileRegion {
    file: File,
    size: u32,
}

impl FileRegion {
    /// Open `path`, creating it or growing it to `size` bytes as needed.
    pub fn open(path: &Path, size: u32) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len < size as u64 {
            file.seek(SeekFrom::Start(len))?;
            file.write_all(&vec![0xFF; (size as u64 - len) as usize])?;
            file.sync_data()?;
        }

        Ok(Self { file, size })
    }

    fn check_bounds(&self, address: u32, len: usize) -> io::Result<()> {
        let end = address as u64 + len as u64;
        if end > self.size as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{len} bytes @ {address:#010x} past region end {:#010x}", self.size),
            ));
        }
        Ok(())
    }
}

impl Storage for FileRegion {
    type Error = io::Error;

    fn size(&self) -> u32 {
        self.size
    }

    async fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), io::Error> {
        self.check_bounds(address, buf.len())?;
        self.file.seek(SeekFrom::Start(address as u64))?;
        self.file.read_exact(buf)
    }

    async fn write(&mut self, address: u32, data: &[u8]) -> Result<(), io::Error> {
        self.check_bounds(address, data.len())?;
        self.file.seek(SeekFrom::Start(address as u64))?;
        self.file.write_all(data)?;
        self.file.sync_data()
    }
}
