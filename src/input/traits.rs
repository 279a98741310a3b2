use crate::Result;

/// A source of module image bytes.
pub trait ImageReader {
    /// Full name or path of the image.
    fn file_name(&self) -> &str;

    /// Size of the image in bytes.
    ///
    /// # Returns
    /// * `Ok(len)` - The number of bytes the image holds.
    /// * `Err(error)` - If the source cannot be queried, e.g. a failed `stat`.
    fn len(&mut self) -> Result<usize>;

    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// # Arguments
    /// * `buf` - The destination buffer. Its length is the number of bytes read.
    /// * `offset` - Byte offset within the image where reading begins.
    ///
    /// # Returns
    /// * `Ok(())` - If all of `buf` was filled.
    /// * `Err(error)` - If the range runs past the end of the image or the
    ///   source fails; `buf` is then unspecified.
    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()>;

    /// The file name without its directories.
    fn shortname(&self) -> &str {
        let name = self.file_name();
        name.rsplit(['/', '\\']).next().unwrap_or(name)
    }
}

/// Conversion into an [`ImageReader`].
///
/// Lets the loader take byte slices, [`ModuleBinary`](super::ModuleBinary)
/// values and (with the `fs` feature) paths interchangeably.
pub trait IntoImageReader<'a> {
    /// The reader produced by the conversion.
    type Reader: ImageReader + 'a;

    /// Converts the input into an [`ImageReader`].
    ///
    /// # Returns
    /// * `Ok(reader)` - The reader the loader pulls the image through.
    /// * `Err(error)` - If the conversion fails, e.g. a path that cannot be opened.
    fn into_reader(self) -> Result<Self::Reader>;
}
