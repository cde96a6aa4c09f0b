use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SYSFS_GRAPHICS: &str = "/sys/class/graphics";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: malformed framebuffer metadata '{value}'")]
    Metadata { path: PathBuf, value: String },
    #[error("unsupported framebuffer depth: {0} bits per pixel")]
    UnsupportedDepth(u32),
    #[error("frame is {actual} bytes, device expects {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Channel order of one device pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// 24 bpp: R, G, B.
    Rgb24,
    /// 32 bpp: B, G, R, padding.
    Bgrx32,
}

impl PixelLayout {
    pub fn from_bits_per_pixel(bits: u32) -> Result<Self, DeviceError> {
        match bits {
            24 => Ok(PixelLayout::Rgb24),
            32 => Ok(PixelLayout::Bgrx32),
            other => Err(DeviceError::UnsupportedDepth(other)),
        }
    }

    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Rgb24 => 3,
            PixelLayout::Bgrx32 => 4,
        }
    }

    /// Offsets of the colour channels within a pixel. The padding byte of
    /// `Bgrx32` is deliberately absent.
    #[inline]
    pub const fn color_offsets(self) -> [usize; 3] {
        [0, 1, 2]
    }

    /// Native bytes for an RGB colour; only the first `bytes_per_pixel` are meaningful.
    #[inline]
    pub const fn encode(self, r: u8, g: u8, b: u8) -> [u8; 4] {
        match self {
            PixelLayout::Rgb24 => [r, g, b, 0],
            PixelLayout::Bgrx32 => [b, g, r, 0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub width: usize,
    pub height: usize,
    pub layout: PixelLayout,
}

impl DeviceGeometry {
    pub fn new(width: usize, height: usize, layout: PixelLayout) -> Self {
        Self {
            width,
            height,
            layout,
        }
    }

    /// Looks up `/sys/class/graphics/<name>` for a device such as `/dev/fb0`.
    pub fn query(device: &Path) -> Result<Self, DeviceError> {
        let name = device.file_name().ok_or_else(|| DeviceError::Metadata {
            path: device.to_path_buf(),
            value: String::new(),
        })?;
        Self::from_sysfs(&Path::new(SYSFS_GRAPHICS).join(name))
    }

    /// Reads `virtual_size` ("W,H") and `bits_per_pixel` from a sysfs directory.
    pub fn from_sysfs(dir: &Path) -> Result<Self, DeviceError> {
        let size_path = dir.join("virtual_size");
        let size = read_attr(&size_path)?;
        let (w, h) = size.split_once(',').ok_or_else(|| DeviceError::Metadata {
            path: size_path.clone(),
            value: size.clone(),
        })?;
        let malformed = || DeviceError::Metadata {
            path: size_path.clone(),
            value: size.clone(),
        };
        let width: usize = w.trim().parse().map_err(|_| malformed())?;
        let height: usize = h.trim().parse().map_err(|_| malformed())?;

        let bpp_path = dir.join("bits_per_pixel");
        let bpp = read_attr(&bpp_path)?;
        let bits: u32 = bpp.parse().map_err(|_| DeviceError::Metadata {
            path: bpp_path,
            value: bpp.clone(),
        })?;

        Ok(Self::new(width, height, PixelLayout::from_bits_per_pixel(bits)?))
    }

    #[inline]
    pub fn bytes_per_pixel(&self) -> usize {
        self.layout.bytes_per_pixel()
    }

    #[inline]
    pub fn frame_len(&self) -> usize {
        self.width * self.height * self.bytes_per_pixel()
    }

    /// Byte offset of pixel (x, y). Caller guarantees the coordinates are in range.
    #[inline]
    pub fn offset(&self, x: usize, y: usize) -> usize {
        (y * self.width + x) * self.bytes_per_pixel()
    }
}

fn read_attr(path: &Path) -> Result<String, DeviceError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| DeviceError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// The memory-mapped framebuffer.
///
/// Whole-frame writes only: [`blit`](Self::blit) replaces the full mapping in
/// one contiguous copy, so the device never shows a half-written frame from
/// us.
pub struct FramebufferDevice {
    map: MmapMut,
    geometry: DeviceGeometry,
    path: PathBuf,
}

impl FramebufferDevice {
    /// Opens a device whose geometry is published under sysfs.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let geometry = DeviceGeometry::query(path)?;
        Self::open_with_geometry(path, geometry)
    }

    /// Maps `path` read/write assuming `geometry`. Regular files must already
    /// be at least `geometry.frame_len()` bytes long.
    pub fn open_with_geometry(
        path: impl AsRef<Path>,
        geometry: DeviceGeometry,
    ) -> Result<Self, DeviceError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source: std::io::Error| DeviceError::Io {
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        // Safety: the pipeline writes the device only through this mapping.
        // Foreign writers (console, fbload) can tear the image but we never
        // hand out references that outlive a single copy.
        let map = unsafe {
            MmapOptions::new()
                .len(geometry.frame_len())
                .map_mut(&file)
                .map_err(io_err)?
        };

        Ok(Self {
            map,
            geometry,
            path,
        })
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current device memory.
    pub fn contents(&self) -> &[u8] {
        &self.map[..]
    }

    /// Replaces the whole frame.
    pub fn blit(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        if frame.len() != self.map.len() {
            return Err(DeviceError::SizeMismatch {
                expected: self.map.len(),
                actual: frame.len(),
            });
        }
        self.map.copy_from_slice(frame);
        Ok(())
    }

    /// Writes a pre-formatted blob from the start of the device. Shorter
    /// blobs leave the remainder untouched.
    pub fn write_raw(&mut self, blob: &[u8]) -> Result<(), DeviceError> {
        if blob.len() > self.map.len() {
            return Err(DeviceError::SizeMismatch {
                expected: self.map.len(),
                actual: blob.len(),
            });
        }
        self.map[..blob.len()].copy_from_slice(blob);
        Ok(())
    }

    pub fn fill(&mut self, r: u8, g: u8, b: u8) {
        let bpp = self.geometry.bytes_per_pixel();
        let px = self.geometry.layout.encode(r, g, b);
        for chunk in self.map.chunks_exact_mut(bpp) {
            chunk.copy_from_slice(&px[..bpp]);
        }
    }

    pub fn clear(&mut self) {
        self.map.fill(0);
    }
}
