//! Corpus access: whitespace tokenization, char counting and line
//! iteration from an arbitrary character offset.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Splits a line into tokens on spaces and tabs. Runs of separators are
/// collapsed; empty tokens are never produced.
pub fn tokenize(line: &str) -> impl Iterator<Item = &str> {
    line.split([' ', '\t']).filter(|t| !t.is_empty())
}

/// Total character count of a file, used to partition the corpus into
/// per-thread ranges.
pub fn char_count(path: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = String::new();
    let mut count = 0u64;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(count);
        }
        count += line.chars().count() as u64;
    }
}

/// Streams lines from a corpus file, optionally starting at a character
/// offset. The first line yielded after an offset seek is the first
/// complete line at or after the offset.
pub struct LineReader {
    path: PathBuf,
    reader: BufReader<File>,
}

impl LineReader {
    pub fn from_start(path: &Path) -> io::Result<LineReader> {
        Ok(LineReader {
            path: path.to_path_buf(),
            reader: BufReader::new(File::open(path)?),
        })
    }

    pub fn from_char_index(path: &Path, offset: u64) -> io::Result<LineReader> {
        let mut reader = LineReader::from_start(path)?;
        let mut skipped = 0u64;
        let mut line = String::new();
        while skipped < offset {
            line.clear();
            if reader.reader.read_line(&mut line)? == 0 {
                break;
            }
            skipped += line.chars().count() as u64;
        }
        Ok(reader)
    }

    /// Reopens the file from the beginning (workers wrap around when
    /// their range is exhausted).
    pub fn rewind(&mut self) -> io::Result<()> {
        self.reader = BufReader::new(File::open(&self.path)?);
        Ok(())
    }

    /// Next line without the trailing newline, or `None` at end of file.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tokenize_collapses_separators() {
        let tokens: Vec<&str> = tokenize("a  b\t\tc ").collect();
        assert_eq!(tokens, vec!["a", "b", "c"]);
        assert_eq!(tokenize("").count(), 0);
        assert_eq!(tokenize(" \t ").count(), 0);
    }

    #[test]
    fn char_offsets_and_wraparound() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "first line\nsecond line\nthird line\n").unwrap();

        assert_eq!(char_count(f.path()).unwrap(), 35);

        // An offset inside the first line skips to the second.
        let mut r = LineReader::from_char_index(f.path(), 4).unwrap();
        assert_eq!(r.next_line().unwrap().unwrap(), "second line");
        assert_eq!(r.next_line().unwrap().unwrap(), "third line");
        assert!(r.next_line().unwrap().is_none());

        r.rewind().unwrap();
        assert_eq!(r.next_line().unwrap().unwrap(), "first line");
    }
}
