//! Zip archives for `compress_folder`.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// In-memory zip archive builder.
///
/// Entry names are relative to the compressed folder (the folder itself is
/// not part of the archive), folders end with `/`.
pub struct ArchiveBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    options: SimpleFileOptions,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
            options: SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
        }
    }

    pub fn add_folder(&mut self, name: &str) -> Result<()> {
        self.writer
            .add_directory(format!("{}/", name.trim_end_matches('/')), self.options)
            .or_raise(|| ErrorKind::Io(format!("unable to add folder `{name}` to archive")))
    }

    pub fn add_file(&mut self, name: &str, contents: &[u8]) -> Result<()> {
        self.writer
            .start_file(name, self.options)
            .or_raise(|| ErrorKind::Io(format!("unable to add file `{name}` to archive")))?;
        self.writer
            .write_all(contents)
            .or_raise(|| ErrorKind::Io(format!("unable to write file `{name}` to archive")))
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let cursor = self.writer.finish().or_raise(|| ErrorKind::Io("unable to finish archive".to_string()))?;
        Ok(cursor.into_inner())
    }
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_archive_contents() {
        let mut builder = ArchiveBuilder::new();
        builder.add_folder("Verses").unwrap();
        builder.add_file("Verses/a.chopro", b"{t:A}").unwrap();
        builder.add_file("b.chopro", b"{t:B}").unwrap();
        let bytes = builder.finish().unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);
        let mut text = String::new();
        archive.by_name("Verses/a.chopro").unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "{t:A}");
        assert!(archive.by_name("Verses/").unwrap().is_dir());
    }
}
