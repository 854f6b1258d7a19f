//! Archive codecs.
//!
//! The pipelines only need two primitives: write a new archive entry by
//! entry, and extract an existing archive into a directory.

mod tar_zst;
mod zip_codec;

pub use self::tar_zst::TarZstCodec;
pub use self::zip_codec::ZipCodec;

use std::io;
use std::path::Path;

use serde::Deserialize;

/// An archive being written. Nothing is addressable until `finalize`.
pub trait ArchiveWriter {
    /// Adds one file. `name` is the `/`-separated path inside the archive.
    fn add_entry(&mut self, name: &str, contents: &[u8]) -> io::Result<()>;

    fn finalize(self: Box<Self>) -> io::Result<()>;
}

pub trait ArchiveCodec: Send + Sync {
    fn create_writer(&self, destination: &Path) -> io::Result<Box<dyn ArchiveWriter>>;

    /// Extracts every entry below `destination`, creating it if needed.
    /// Returns the number of files written.
    fn extract(&self, archive: &Path, destination: &Path) -> io::Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ArchiveFormat {
    #[default]
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.zst")]
    TarZst,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 2] = [ArchiveFormat::Zip, ArchiveFormat::TarZst];

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarZst => "tar.zst",
        }
    }

    /// Builds the codec. `compression_level` only applies to tar.zst.
    pub fn codec(&self, compression_level: Option<i32>) -> Box<dyn ArchiveCodec> {
        match self {
            ArchiveFormat::Zip => Box::new(ZipCodec::default()),
            ArchiveFormat::TarZst => match compression_level {
                Some(level) => Box::new(TarZstCodec::with_level(level)),
                None => Box::new(TarZstCodec::default()),
            },
        }
    }

    /// Detects the format from a file name's extension.
    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| {
            let ext = f.extension();
            name.len() > ext.len() + 1 && name.ends_with(&format!(".{}", ext))
        })
    }

    /// Strips the archive extension, e.g. `site-1.0-17.tar.zst` -> `site-1.0-17`.
    /// Names without a known extension lose whatever follows their last dot.
    pub fn strip_extension(name: &str) -> &str {
        if let Some(format) = Self::from_file_name(name) {
            return &name[..name.len() - format.extension().len() - 1];
        }
        match name.rfind('.') {
            Some(idx) if idx > 0 => &name[..idx],
            _ => name,
        }
    }
}
