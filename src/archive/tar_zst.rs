use std::fs::{self, File};
use std::io;
use std::path::Path;

use tar::{Archive, Builder, EntryType, Header};
use tracing::warn;
use zstd::{Decoder, Encoder};

use super::{ArchiveCodec, ArchiveWriter};

/// Tar archives compressed with zstd.
#[derive(Debug, Clone, Copy)]
pub struct TarZstCodec {
    level: i32,
}

impl Default for TarZstCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl TarZstCodec {
    /// Compression level, 0-22.
    pub fn with_level(level: i32) -> Self {
        Self {
            level: level.clamp(0, 22),
        }
    }
}

struct TarZstWriter {
    tar: Builder<Encoder<'static, File>>,
}

impl ArchiveWriter for TarZstWriter {
    fn add_entry(&mut self, name: &str, contents: &[u8]) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_path(name)?;
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        self.tar.append(&header, contents)
    }

    fn finalize(self: Box<Self>) -> io::Result<()> {
        let writer = *self;
        let encoder = writer.tar.into_inner()?;
        let file = encoder.finish()?;
        file.sync_all()
    }
}

impl ArchiveCodec for TarZstCodec {
    fn create_writer(&self, destination: &Path) -> io::Result<Box<dyn ArchiveWriter>> {
        let file = File::create(destination)?;
        let encoder = Encoder::new(file, self.level)?;
        Ok(Box::new(TarZstWriter {
            tar: Builder::new(encoder),
        }))
    }

    fn extract(&self, archive: &Path, destination: &Path) -> io::Result<usize> {
        let file = File::open(archive)?;
        let mut tar = Archive::new(Decoder::new(file)?);
        fs::create_dir_all(destination)?;

        let mut written = 0;
        for entry in tar.entries()? {
            let mut entry = entry?;
            let is_file = entry.header().entry_type().is_file();
            // unpack_in refuses entries that would land outside `destination`.
            if !entry.unpack_in(destination)? {
                warn!("Skipping unsafe archive entry: {}", entry.path()?.display());
                continue;
            }
            if is_file {
                written += 1;
            }
        }

        Ok(written)
    }
}
