//! Loader interface: turns an argument vector into a resolved memory image.
//!
//! Container formats are out of scope. [`FlatImageLoader`] maps a raw code
//! blob and [`StaticImageLoader`] hands out an image built in memory.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::memory::{Permissions, Segment};

/// Default load address for flat images.
pub const DEFAULT_FLAT_BASE: u32 = 0x0804_8000;

/// One segment of a loaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentImage {
    /// Guest base address.
    pub base: u32,
    /// Mapped length; content shorter than this is zero filled.
    pub len: u32,
    /// Access permissions.
    pub perms: Permissions,
    /// Initial bytes.
    pub content: Vec<u8>,
    /// Description shown in memory-map listings.
    pub name: String,
}

impl SegmentImage {
    /// Segment whose length equals its content.
    #[must_use]
    pub fn new(base: u32, content: Vec<u8>, perms: Permissions, name: impl Into<String>) -> Self {
        Self {
            base,
            len: u32::try_from(content.len()).unwrap_or(u32::MAX),
            perms,
            content,
            name: name.into(),
        }
    }

    pub(crate) fn into_segment(self) -> Segment {
        let mut data = self.content;
        data.resize(self.len as usize, 0);
        Segment::new(self.base, data, self.perms, self.name)
    }
}

/// Fully resolved initial image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    /// Entry point.
    pub entry: u32,
    /// Segments to map.
    pub segments: Vec<SegmentImage>,
    /// Initial stack pointer; `None` asks the core to build the stack.
    pub initial_sp: Option<u32>,
}

/// Loader failures.
#[derive(Debug, Error)]
pub enum LoadError {
    /// No program was named.
    #[error("no program specified")]
    MissingProgram,
    /// Image file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Image path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// Image file has no content.
    #[error("{0} is empty")]
    EmptyImage(PathBuf),
    /// Image does not fit in the address space at the requested base.
    #[error("image of {len} bytes does not fit at 0x{base:08x}")]
    TooLarge {
        /// Load address.
        base: u32,
        /// Image length.
        len: usize,
    },
}

/// Produces the initial image for `argv`.
pub trait Loader: Send {
    /// Resolves `argv[0]` to an image.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] when the program cannot be loaded.
    fn load(&mut self, argv: &[String]) -> Result<LoadedImage, LoadError>;
}

/// Maps `argv[0]` verbatim as one read-execute segment; entry is the base.
#[derive(Debug, Clone, Copy)]
pub struct FlatImageLoader {
    base: u32,
}

impl Default for FlatImageLoader {
    fn default() -> Self {
        Self::new(DEFAULT_FLAT_BASE)
    }
}

impl FlatImageLoader {
    /// Loader mapping images at `base`.
    #[must_use]
    pub const fn new(base: u32) -> Self {
        Self { base }
    }

    /// Load address.
    #[must_use]
    pub const fn base(&self) -> u32 {
        self.base
    }
}

impl Loader for FlatImageLoader {
    fn load(&mut self, argv: &[String]) -> Result<LoadedImage, LoadError> {
        let program = argv.first().ok_or(LoadError::MissingProgram)?;
        let path = PathBuf::from(program);
        let bytes = fs::read(&path).map_err(|source| LoadError::Read {
            path: path.clone(),
            source,
        })?;
        if bytes.is_empty() {
            return Err(LoadError::EmptyImage(path));
        }
        let fits = u32::try_from(bytes.len())
            .ok()
            .and_then(|len| self.base.checked_add(len))
            .is_some();
        if !fits {
            return Err(LoadError::TooLarge {
                base: self.base,
                len: bytes.len(),
            });
        }
        log::debug!("flat image {} mapped at 0x{:08x}", path.display(), self.base);
        Ok(LoadedImage {
            entry: self.base,
            segments: vec![SegmentImage::new(
                self.base,
                bytes,
                Permissions::RX,
                path.display().to_string(),
            )],
            initial_sp: None,
        })
    }
}

/// Returns a prepared image regardless of `argv`.
#[derive(Debug, Clone)]
pub struct StaticImageLoader {
    image: LoadedImage,
}

impl StaticImageLoader {
    /// Wraps `image`.
    #[must_use]
    pub const fn new(image: LoadedImage) -> Self {
        Self { image }
    }

    /// Single read-execute code segment at `base`, entered at `base`.
    #[must_use]
    pub fn code(base: u32, code: Vec<u8>) -> Self {
        Self::new(LoadedImage {
            entry: base,
            segments: vec![SegmentImage::new(base, code, Permissions::RX, "[text]")],
            initial_sp: None,
        })
    }

    /// Adds a segment to the image.
    #[must_use]
    pub fn with_segment(mut self, segment: SegmentImage) -> Self {
        self.image.segments.push(segment);
        self
    }
}

impl Loader for StaticImageLoader {
    fn load(&mut self, _argv: &[String]) -> Result<LoadedImage, LoadError> {
        Ok(self.image.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{FlatImageLoader, LoadError, Loader, SegmentImage, DEFAULT_FLAT_BASE};
    use crate::memory::Permissions;

    #[test]
    fn segment_content_is_zero_filled_to_length() {
        let mut image = SegmentImage::new(0x1000, vec![1, 2], Permissions::RW, "data");
        image.len = 8;
        let segment = image.into_segment();
        assert_eq!(segment.data(), &[1, 2, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn flat_loader_reports_missing_and_empty_files() {
        let mut loader = FlatImageLoader::default();
        assert!(matches!(loader.load(&[]), Err(LoadError::MissingProgram)));
        assert!(matches!(
            loader.load(&["/nonexistent/usersim-image".to_string()]),
            Err(LoadError::Read { .. })
        ));
    }

    #[test]
    fn flat_loader_maps_file_at_base() {
        let path = std::env::temp_dir().join(format!("usersim-flat-{}.bin", std::process::id()));
        std::fs::File::create(&path)
            .and_then(|mut file| file.write_all(&[0, 0, 0, 0]))
            .expect("write image");
        let image = FlatImageLoader::default()
            .load(&[path.display().to_string()])
            .expect("load");
        std::fs::remove_file(&path).expect("cleanup");
        assert_eq!(image.entry, DEFAULT_FLAT_BASE);
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].perms, Permissions::RX);
    }
}
