//! Streamed line reading across a stack of template files.
//!
//! The block parser consumes one logical line at a time. `INCLUDE` markers
//! push the included file onto the stack via [`FileReader::prepend`], so the
//! included lines are spliced in front of the remaining lines of the
//! including file.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::Error;

#[derive(Debug)]
struct StackedFile {
    path: PathBuf,
    reader: BufReader<File>,
    /// Set until the first line is fetched; used to strip a UTF-8 BOM.
    at_start: bool,
}

/// Line iterator over a stack of open files.
#[derive(Debug)]
pub struct FileReader {
    stack: Vec<StackedFile>,
}

impl FileReader {
    /// Opens the initial file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut reader = Self { stack: Vec::new() };
        reader.push(path.as_ref())?;
        Ok(reader)
    }

    /// Pushes `path` onto the stack; the next [`fetch`](Self::fetch) returns
    /// its first line.
    pub fn prepend(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.push(path.as_ref())
    }

    /// Returns the next logical line, including its trailing newline where
    /// present. Exhausted files are popped transparently; `None` means the
    /// whole stack is drained.
    pub fn fetch(&mut self) -> Result<Option<String>, Error> {
        while let Some(top) = self.stack.last_mut() {
            let mut line = String::new();
            let read = top
                .reader
                .read_line(&mut line)
                .map_err(|e| Error::from_io(top.path.clone(), e))?;
            if read == 0 {
                self.stack.pop();
                continue;
            }
            if top.at_start {
                top.at_start = false;
                if let Some(stripped) = line.strip_prefix('\u{feff}') {
                    line = stripped.to_string();
                }
            }
            return Ok(Some(line));
        }
        Ok(None)
    }

    fn push(&mut self, path: &Path) -> Result<(), Error> {
        let file = File::open(path).map_err(|e| Error::from_io(path.to_path_buf(), e))?;
        debug!("reading template file {}", path.display());
        self.stack.push(StackedFile {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            at_start: true,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_fetch_lines_with_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.tpl", "one\ntwo\nthree");

        let mut reader = FileReader::open(&path).unwrap();
        assert_eq!(reader.fetch().unwrap(), Some("one\n".to_string()));
        assert_eq!(reader.fetch().unwrap(), Some("two\n".to_string()));
        assert_eq!(reader.fetch().unwrap(), Some("three".to_string()));
        assert_eq!(reader.fetch().unwrap(), None);
    }

    #[test]
    fn test_prepend_splices_file() {
        let dir = tempfile::tempdir().unwrap();
        let outer = write_file(dir.path(), "outer.tpl", "first\nlast\n");
        let inner = write_file(dir.path(), "inner.tpl", "spliced\n");

        let mut reader = FileReader::open(&outer).unwrap();
        assert_eq!(reader.fetch().unwrap(), Some("first\n".to_string()));
        reader.prepend(&inner).unwrap();
        assert_eq!(reader.fetch().unwrap(), Some("spliced\n".to_string()));
        assert_eq!(reader.fetch().unwrap(), Some("last\n".to_string()));
        assert_eq!(reader.fetch().unwrap(), None);
    }

    #[test]
    fn test_bom_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "bom.tpl", "\u{feff}hello\n");

        let mut reader = FileReader::open(&path).unwrap();
        assert_eq!(reader.fetch().unwrap(), Some("hello\n".to_string()));
    }

    #[test]
    fn test_missing_file() {
        let err = FileReader::open("/nonexistent/template.tpl").unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }
}
