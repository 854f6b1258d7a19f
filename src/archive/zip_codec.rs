use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use ::zip::write::SimpleFileOptions;
use ::zip::{CompressionMethod, ZipArchive, ZipWriter};
use tracing::{debug, warn};

use super::{ArchiveCodec, ArchiveWriter};

/// Deflated zip archives.
#[derive(Debug, Clone, Copy)]
pub struct ZipCodec {
    compression: CompressionMethod,
}

impl Default for ZipCodec {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::Deflated,
        }
    }
}

struct ZipFileWriter {
    zip: ZipWriter<BufWriter<File>>,
    options: SimpleFileOptions,
    written: HashSet<String>,
}

impl ArchiveWriter for ZipFileWriter {
    fn add_entry(&mut self, name: &str, contents: &[u8]) -> io::Result<()> {
        // Zip refuses duplicate names; overlapping source folders yield the
        // same file twice, so the first copy stands.
        if !self.written.insert(name.to_string()) {
            debug!("Entry {} already archived", name);
            return Ok(());
        }
        self.zip
            .start_file(name, self.options.clone())
            .map_err(io::Error::other)?;
        self.zip.write_all(contents)
    }

    fn finalize(self: Box<Self>) -> io::Result<()> {
        let writer = *self;
        let mut out = writer.zip.finish().map_err(io::Error::other)?;
        out.flush()
    }
}

impl ArchiveCodec for ZipCodec {
    fn create_writer(&self, destination: &Path) -> io::Result<Box<dyn ArchiveWriter>> {
        let file = File::create(destination)?;
        let options = SimpleFileOptions::default().compression_method(self.compression);
        Ok(Box::new(ZipFileWriter {
            zip: ZipWriter::new(BufWriter::new(file)),
            options,
            written: HashSet::new(),
        }))
    }

    fn extract(&self, archive: &Path, destination: &Path) -> io::Result<usize> {
        let file = File::open(archive)?;
        let mut zip = ZipArchive::new(file).map_err(io::Error::other)?;
        fs::create_dir_all(destination)?;

        let mut written = 0;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).map_err(io::Error::other)?;
            let Some(relative) = entry.enclosed_name() else {
                warn!("Skipping unsafe archive entry: {}", entry.name());
                continue;
            };
            let outpath = destination.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&outpath)?;
                continue;
            }
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)?;
            io::copy(&mut entry, &mut outfile)?;
            written += 1;
        }

        Ok(written)
    }
}
