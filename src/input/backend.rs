use super::{ImageReader, IntoImageReader};
use crate::{Result, error::io_error};
use alloc::string::{String, ToString};

/// A module image held in memory.
///
/// # Examples
/// ```rust
/// use md64_loader::input::{ImageReader, ModuleBinary};
///
/// let bytes = [0u8; 64];
/// let mut binary = ModuleBinary::new("NE2000.MOD", &bytes);
/// assert_eq!(binary.len().unwrap(), 64);
/// ```
#[derive(Debug)]
pub struct ModuleBinary<'bytes> {
    name: String,
    bytes: &'bytes [u8],
}

impl<'bytes> ModuleBinary<'bytes> {
    /// Wraps an image already in memory.
    ///
    /// # Arguments
    /// - `name` - Name reported in errors and logs, usually the file the
    ///   bytes came from.
    /// - `bytes` - The complete image, header first.
    ///
    /// # Returns
    /// A new [`ModuleBinary`] borrowing `bytes`.
    pub fn new(name: &str, bytes: &'bytes [u8]) -> Self {
        Self {
            name: name.to_string(),
            bytes,
        }
    }
}

#[inline]
fn copy_out(bytes: &[u8], buf: &mut [u8], offset: usize) -> Result<()> {
    let src = offset
        .checked_add(buf.len())
        .and_then(|end| bytes.get(offset..end))
        .ok_or_else(|| io_error("read past the end of the image"))?;
    buf.copy_from_slice(src);
    Ok(())
}

impl ImageReader for ModuleBinary<'_> {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn len(&mut self) -> Result<usize> {
        Ok(self.bytes.len())
    }

    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()> {
        copy_out(self.bytes, buf, offset)
    }
}

impl ImageReader for &[u8] {
    fn file_name(&self) -> &str {
        "<memory>"
    }

    fn len(&mut self) -> Result<usize> {
        Ok(<[u8]>::len(*self))
    }

    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()> {
        copy_out(*self, buf, offset)
    }
}

impl<'a> IntoImageReader<'a> for &'a [u8] {
    type Reader = &'a [u8];

    fn into_reader(self) -> Result<Self::Reader> {
        Ok(self)
    }
}

impl<'a> IntoImageReader<'a> for ModuleBinary<'a> {
    type Reader = ModuleBinary<'a>;

    fn into_reader(self) -> Result<Self::Reader> {
        Ok(self)
    }
}

#[cfg(feature = "fs")]
pub use file::ModuleFile;

#[cfg(feature = "fs")]
mod file {
    use super::{ImageReader, IntoImageReader};
    use crate::{Result, error::io_error};
    use alloc::{format, string::String};
    use std::{
        fs::File,
        io::{Read, Seek, SeekFrom},
        path::{Path, PathBuf},
    };

    /// A module image read from the file system.
    pub struct ModuleFile {
        path: String,
        file: File,
    }

    impl ModuleFile {
        /// Opens the image at `path`.
        ///
        /// # Arguments
        /// - `path` - Path of the module file, also used as its name.
        ///
        /// # Returns
        /// - `Ok(ModuleFile)` - If the file was opened.
        /// - `Err` - [`Error::Io`](crate::Error::Io) naming `path` if it could not be.
        pub fn from_path(path: impl AsRef<str>) -> Result<Self> {
            let path = path.as_ref();
            let file = File::open(path).map_err(|err| io_error(format!("{path}: {err}")))?;
            Ok(Self {
                path: path.into(),
                file,
            })
        }

        /// Looks for `name` in each directory of `dirs` in turn and opens the
        /// first match. A `name` containing a path separator is opened as is.
        ///
        /// # Arguments
        /// - `name` - Bare file name such as `NE2000.MOD`, or a path.
        /// - `dirs` - Directories to try, in order.
        ///
        /// # Returns
        /// - `Ok(ModuleFile)` - The first existing file found.
        /// - `Err` - [`Error::Io`](crate::Error::Io) if no directory holds `name`
        ///   or the match cannot be opened.
        pub fn search<P: AsRef<Path>>(name: &str, dirs: &[P]) -> Result<Self> {
            if name.contains(['/', '\\']) {
                return Self::from_path(name);
            }
            let found = dirs
                .iter()
                .map(|dir| dir.as_ref().join(name))
                .find(|candidate: &PathBuf| candidate.is_file())
                .ok_or_else(|| io_error(format!("{name}: not found in search path")))?;
            #[cfg(feature = "log")]
            log::debug!("[Search] {} -> {}", name, found.display());
            Self::from_path(found.to_string_lossy())
        }
    }

    impl ImageReader for ModuleFile {
        fn file_name(&self) -> &str {
            &self.path
        }

        fn len(&mut self) -> Result<usize> {
            let meta = self
                .file
                .metadata()
                .map_err(|err| io_error(format!("{}: {err}", self.path)))?;
            Ok(meta.len() as usize)
        }

        fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()> {
            self.file
                .seek(SeekFrom::Start(offset as u64))
                .and_then(|_| self.file.read_exact(buf))
                .map_err(|err| io_error(format!("{}: {err}", self.path)))
        }
    }

    impl<'a> IntoImageReader<'a> for &'a str {
        type Reader = ModuleFile;

        fn into_reader(self) -> Result<Self::Reader> {
            ModuleFile::from_path(self)
        }
    }

    impl<'a> IntoImageReader<'a> for ModuleFile {
        type Reader = ModuleFile;

        fn into_reader(self) -> Result<Self::Reader> {
            Ok(self)
        }
    }
}
