//! Block-device backends.
//!
//! Backends operate on fixed 1 KiB units addressed by index. I/O is
//! deterministic full-unit only: short reads and writes are errors, and
//! reading past end-of-file is an error rather than a zero fill (the engine
//! above decides what out-of-range means).

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Backend unit size in bytes (one Forth block).
pub const UNIT_SIZE: usize = 1024;

/// Block-device errors.
#[derive(Debug)]
pub enum Error {
    /// Unit index outside the device.
    OutOfRange(u32),
    /// Device was opened read-only.
    ReadOnly,
    /// Device geometry is invalid (size not a unit multiple, zero units).
    Geometry(u64),
    /// Underlying I/O failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange(unit) => write!(f, "unit {unit} out of range"),
            Self::ReadOnly => f.write_str("device is read-only"),
            Self::Geometry(size) => write!(f, "bad device geometry ({size} bytes)"),
            Self::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Device geometry and capability report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub unit_size: u32,
    pub total_units: u32,
    /// Best-effort physical sector size; 0 if unknown.
    pub physical_sector_size: u32,
    /// Best-effort backing size in bytes; 0 if unknown.
    pub physical_size_bytes: u64,
    pub read_only: bool,
}

/// A block device: fixed-size units, whole-unit reads and writes.
pub trait BlockDevice {
    /// Read unit `unit` into `dst`. `dst` must be exactly [`UNIT_SIZE`] bytes.
    fn read(&self, unit: u32, dst: &mut [u8]) -> Result<(), Error>;

    /// Write unit `unit` from `src`. `src` must be exactly [`UNIT_SIZE`] bytes.
    fn write(&mut self, unit: u32, src: &[u8]) -> Result<(), Error>;

    /// Persist all completed writes.
    fn flush(&mut self) -> Result<(), Error>;

    fn info(&self) -> DeviceInfo;

    fn total_units(&self) -> u32 {
        self.info().total_units
    }
}

/// File-backed device over a raw image.
///
/// All I/O is positioned and full-length; an unexpected EOF mid-read
/// surfaces as an error, never as a short transfer.
pub struct FileDevice {
    file: File,
    path: PathBuf,
    total_units: u32,
    read_only: bool,
}

impl FileDevice {
    /// Open (or create) an image file.
    ///
    /// When `total_units` is 0 the unit count is derived from the file
    /// size, which must be a whole multiple of [`UNIT_SIZE`]. When it is
    /// non-zero a shorter file is extended to match.
    pub fn open(path: &Path, total_units: u32, read_only: bool) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)?;
        let size = file.metadata()?.len();

        let total_units = if total_units == 0 {
            if size == 0 || size % UNIT_SIZE as u64 != 0 {
                return Err(Error::Geometry(size));
            }
            let units = size / UNIT_SIZE as u64;
            u32::try_from(units).map_err(|_| Error::Geometry(size))?
        } else {
            let want = u64::from(total_units) * UNIT_SIZE as u64;
            if size < want {
                if read_only {
                    return Err(Error::Geometry(size));
                }
                file.set_len(want)?;
            }
            total_units
        };

        Ok(Self {
            file,
            path: path.to_path_buf(),
            total_units,
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, unit: u32) -> Result<u64, Error> {
        if unit >= self.total_units {
            return Err(Error::OutOfRange(unit));
        }
        Ok(u64::from(unit) * UNIT_SIZE as u64)
    }
}

impl BlockDevice for FileDevice {
    fn read(&self, unit: u32, dst: &mut [u8]) -> Result<(), Error> {
        debug_assert_eq!(dst.len(), UNIT_SIZE);
        let off = self.offset(unit)?;
        self.file.read_exact_at(dst, off)?;
        Ok(())
    }

    fn write(&mut self, unit: u32, src: &[u8]) -> Result<(), Error> {
        debug_assert_eq!(src.len(), UNIT_SIZE);
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let off = self.offset(unit)?;
        self.file.write_all_at(src, off)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.file.sync_data()?;
        Ok(())
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            unit_size: UNIT_SIZE as u32,
            total_units: self.total_units,
            physical_sector_size: 512,
            physical_size_bytes: u64::from(self.total_units) * UNIT_SIZE as u64,
            read_only: self.read_only,
        }
    }
}

/// Memory-backed device used when no image file is available.
pub struct RamDevice {
    store: Vec<u8>,
    total_units: u32,
}

impl RamDevice {
    /// Create a device holding `total_units` zeroed units.
    #[must_use]
    pub fn new(total_units: u32) -> Self {
        Self {
            store: vec![0u8; total_units as usize * UNIT_SIZE],
            total_units,
        }
    }

    /// Create a device sized in whole mebibytes (at least one unit).
    #[must_use]
    pub fn with_mebibytes(mb: u32) -> Self {
        let units = (u64::from(mb.max(1)) * 1024 * 1024 / UNIT_SIZE as u64) as u32;
        Self::new(units.max(1))
    }

    fn span(&self, unit: u32) -> Result<std::ops::Range<usize>, Error> {
        if unit >= self.total_units {
            return Err(Error::OutOfRange(unit));
        }
        let start = unit as usize * UNIT_SIZE;
        Ok(start..start + UNIT_SIZE)
    }
}

impl BlockDevice for RamDevice {
    fn read(&self, unit: u32, dst: &mut [u8]) -> Result<(), Error> {
        debug_assert_eq!(dst.len(), UNIT_SIZE);
        dst.copy_from_slice(&self.store[self.span(unit)?]);
        Ok(())
    }

    fn write(&mut self, unit: u32, src: &[u8]) -> Result<(), Error> {
        debug_assert_eq!(src.len(), UNIT_SIZE);
        let span = self.span(unit)?;
        self.store[span].copy_from_slice(src);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            unit_size: UNIT_SIZE as u32,
            total_units: self.total_units,
            physical_sector_size: 0,
            physical_size_bytes: self.store.len() as u64,
            read_only: false,
        }
    }
}

/// Open the backend selected by CLI configuration: a file image when a
/// path is given and accessible, otherwise a RAM disk of `ram_mb`.
///
/// Returns the device and whether the file backend was used.
pub fn open_backend(
    disk_img: Option<&Path>,
    ram_mb: u32,
) -> Result<(Box<dyn BlockDevice>, bool), Error> {
    if let Some(path) = disk_img {
        match FileDevice::open(path, 0, false) {
            Ok(dev) => return Ok((Box::new(dev), true)),
            Err(err) => {
                log::warn!("disk image {path:?} unusable ({err}); falling back to RAM disk");
            }
        }
    }
    Ok((Box::new(RamDevice::with_mebibytes(ram_mb)), false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_device_round_trip() {
        let mut dev = RamDevice::new(8);
        let mut unit = [0u8; UNIT_SIZE];
        unit[0] = 0xAB;
        unit[UNIT_SIZE - 1] = 0xCD;
        dev.write(3, &unit).unwrap();

        let mut back = [0xFFu8; UNIT_SIZE];
        dev.read(3, &mut back).unwrap();
        assert_eq!(unit, back);

        assert!(matches!(dev.read(8, &mut back), Err(Error::OutOfRange(8))));
        assert!(matches!(dev.write(9, &unit), Err(Error::OutOfRange(9))));
    }

    #[test]
    fn ram_device_geometry() {
        let dev = RamDevice::with_mebibytes(2);
        let info = dev.info();
        assert_eq!(2048, info.total_units);
        assert_eq!(UNIT_SIZE as u32, info.unit_size);
        assert!(!info.read_only);
    }

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");

        {
            let mut dev = FileDevice::open(&path, 64, false).unwrap();
            assert_eq!(64, dev.total_units());
            let unit = [0x5Au8; UNIT_SIZE];
            dev.write(17, &unit).unwrap();
            dev.flush().unwrap();
        }

        // Reopen deriving geometry from the file size.
        let dev = FileDevice::open(&path, 0, false).unwrap();
        assert_eq!(64, dev.total_units());
        let mut back = [0u8; UNIT_SIZE];
        dev.read(17, &mut back).unwrap();
        assert_eq!([0x5Au8; UNIT_SIZE], back);
    }

    #[test]
    fn file_device_rejects_ragged_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.img");
        std::fs::write(&path, vec![0u8; UNIT_SIZE + 17]).unwrap();
        assert!(matches!(
            FileDevice::open(&path, 0, false),
            Err(Error::Geometry(_))
        ));
    }
}
