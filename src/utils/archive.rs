//! Compressed artifact helpers
//!
//! Artifacts are written to a `.partial` sibling and renamed into place on
//! success, so a half-written file never carries its final name.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Timestamp format used in archive names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// `<service>_<timestamp>`
pub fn backup_stem(service: &str, timestamp: &str) -> String {
    format!("{}_{}", service, timestamp)
}

/// A file that only appears under its final name once committed
pub struct PartialFile {
    final_path: PathBuf,
    partial_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl PartialFile {
    pub fn create(final_path: &Path) -> io::Result<Self> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut name = final_path.as_os_str().to_owned();
        name.push(".partial");
        let partial_path = PathBuf::from(name);
        let file = File::create(&partial_path)?;

        Ok(Self {
            final_path: final_path.to_path_buf(),
            partial_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Flush, sync and rename into place
    pub fn commit(mut self) -> io::Result<PathBuf> {
        let synced = match self.writer.take() {
            Some(writer) => writer
                .into_inner()
                .map_err(|e| e.into_error())
                .and_then(|file| file.sync_all()),
            None => Ok(()),
        };
        // Drop no longer cleans up once the writer is taken
        if let Err(e) = synced.and_then(|()| fs::rename(&self.partial_path, &self.final_path)) {
            let _ = fs::remove_file(&self.partial_path);
            return Err(e);
        }
        Ok(self.final_path.clone())
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("partial file already committed"))
    }
}

impl Write for PartialFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.partial_path);
        }
    }
}

/// Gzip stream that lands at `final_path` once finished
pub fn gzip_file(final_path: &Path) -> io::Result<GzEncoder<PartialFile>> {
    Ok(GzEncoder::new(PartialFile::create(final_path)?, Compression::default()))
}

/// Finish the gzip stream and commit the file
pub fn finish_gzip(encoder: GzEncoder<PartialFile>) -> io::Result<PathBuf> {
    encoder.finish()?.commit()
}

/// Bundle `source_dir` into a gzip tar at `output`, rooted at `root_name`
pub fn tar_directory(source_dir: &Path, root_name: &str, output: &Path) -> io::Result<PathBuf> {
    let mut builder = tar::Builder::new(gzip_file(output)?);
    builder.follow_symlinks(false);
    builder.append_dir_all(root_name, source_dir)?;
    finish_gzip(builder.into_inner()?)
}
