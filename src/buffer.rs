use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use memmap2::MmapMut;
use nix::sys::{memfd, mman, stat};
use nix::{fcntl, unistd};
use thiserror::Error;

use crate::format::PixelFormat;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("invalid buffer size {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("stride {stride} is shorter than a {width} pixel row of {format}")]
    InvalidStride {
        format: PixelFormat,
        width: u32,
        stride: u32,
    },
    #[error("could not allocate {size} bytes of buffer storage")]
    Allocation { size: usize },
    #[error("could not allocate {size} bytes of shared memory")]
    SharedMemory {
        size: usize,
        #[source]
        source: io::Error,
    },
}

enum Storage {
    Heap(Vec<u8>),
    Shm { file: File, map: MmapMut },
}

/// Raster memory of one captured output.
pub struct PixelBuffer {
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: u32,
    storage: Storage,
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("shm", &matches!(self.storage, Storage::Shm { .. }))
            .finish()
    }
}

/// Validate the layout and return the storage size in bytes.
fn storage_size(
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: u32,
) -> Result<usize, BufferError> {
    if width == 0 || height == 0 {
        return Err(BufferError::InvalidDimensions { width, height });
    }

    // Unknown formats can't be checked any further, they are rejected at render time.
    let bpp = format.bytes_per_pixel().unwrap_or(1);
    let row = (width as usize)
        .checked_mul(bpp)
        .ok_or(BufferError::InvalidDimensions { width, height })?;
    if (stride as usize) < row {
        return Err(BufferError::InvalidStride {
            format,
            width,
            stride,
        });
    }

    (stride as usize)
        .checked_mul(height as usize)
        .ok_or(BufferError::Allocation { size: usize::MAX })
}

impl PixelBuffer {
    /// Allocate zeroed heap storage.
    pub fn allocate(
        format: PixelFormat,
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<Self, BufferError> {
        let size = storage_size(format, width, height, stride)?;

        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| BufferError::Allocation { size })?;
        data.resize(size, 0);

        Ok(Self {
            format,
            width,
            height,
            stride,
            storage: Storage::Heap(data),
        })
    }

    /// Allocate zeroed storage in an anonymous shared memory file, so that a compositor can write
    /// into it.
    pub fn allocate_shm(
        format: PixelFormat,
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<Self, BufferError> {
        let size = storage_size(format, width, height, stride)?;
        let shm_error = |source| BufferError::SharedMemory { size, source };

        let fd = create_shm_fd().map_err(shm_error)?;
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size as u64).map_err(shm_error)?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(shm_error)?;
        debug!("Allocated {} bytes of shared memory on fd {}", size, fd);

        Ok(Self {
            format,
            width,
            height,
            stride,
            storage: Storage::Shm { file, map },
        })
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Total storage size, `stride * height`.
    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Heap(data) => data.as_slice(),
            Storage::Shm { map, .. } => &map[..],
        }
    }

    /// Writable view for the producer of the pixels.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Heap(data) => data.as_mut_slice(),
            Storage::Shm { map, .. } => &mut map[..],
        }
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data()[start..start + self.stride as usize]
    }

    /// File descriptor backing a shared memory buffer.
    pub fn shm_fd(&self) -> Option<RawFd> {
        match &self.storage {
            Storage::Heap(_) => None,
            Storage::Shm { file, .. } => Some(file.as_raw_fd()),
        }
    }
}

/// Return a RawFd to a shm file. We use memfd create on linux and shm_open for BSD support.
fn create_shm_fd() -> io::Result<RawFd> {
    // Only try memfd on linux and freebsd.
    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    loop {
        let name = CStr::from_bytes_with_nul(b"scrcomp\0")
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        // Create a file that closes on succesful execution and seal it's operations.
        match memfd::memfd_create(
            name,
            memfd::MemFdCreateFlag::MFD_CLOEXEC | memfd::MemFdCreateFlag::MFD_ALLOW_SEALING,
        ) {
            Ok(fd) => {
                // This is only an optimization, so ignore errors.
                // F_SEAL_SRHINK = File cannot be reduced in size.
                // F_SEAL_SEAL = Prevent further calls to fcntl().
                let _ = fcntl::fcntl(
                    fd,
                    fcntl::F_ADD_SEALS(
                        fcntl::SealFlag::F_SEAL_SHRINK | fcntl::SealFlag::F_SEAL_SEAL,
                    ),
                );
                return Ok(fd);
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ENOSYS) => break,
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }

    // Fallback to using shm_open.
    let shm_name = || {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        format!("/scrcomp-{}", nanos)
    };
    let mut mem_file_handle = shm_name();
    loop {
        match mman::shm_open(
            mem_file_handle.as_str(),
            fcntl::OFlag::O_CREAT
                | fcntl::OFlag::O_EXCL
                | fcntl::OFlag::O_RDWR
                | fcntl::OFlag::O_CLOEXEC,
            stat::Mode::S_IRUSR | stat::Mode::S_IWUSR,
        ) {
            Ok(fd) => match mman::shm_unlink(mem_file_handle.as_str()) {
                Ok(_) => return Ok(fd),
                Err(errno) => {
                    let _ = unistd::close(fd);
                    return Err(io::Error::from(errno));
                }
            },
            Err(nix::errno::Errno::EEXIST) => {
                // If a file with that handle exists then change the handle
                mem_file_handle = shm_name();
                continue;
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }
}
