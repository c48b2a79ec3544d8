//! Newest-first line reader.
//!
//! Reads a file backwards in fixed-size blocks and yields its lines last-to-first, so a
//! query for the newest `n` IDs touches only the tail of a segment.
//!
//! Lines are whitespace-trimmed; blank lines are skipped. A line may span any number of
//! blocks.

use std::io::{self, Read, Seek, SeekFrom};

/// Smallest read block.
pub const MIN_BLOCK_BYTES: usize = 4 * 1024;
/// Largest read block.
pub const MAX_BLOCK_BYTES: usize = 512 * 1024;
/// Default read block.
pub const DEFAULT_BLOCK_BYTES: usize = 8 * 1024;

/// Iterator over the lines of a seekable stream, last line first.
pub struct ReverseLines<R> {
    reader: R,
    block: usize,
    /// Bytes not yet read, i.e. `[0, pos)` of the stream.
    pos: u64,
    /// Bytes of a line whose start has not been read yet.
    partial: Vec<u8>,
    /// Complete lines from the current block, in file order (popped from the back).
    ready: Vec<Vec<u8>>,
    done: bool,
}

impl<R: Read + Seek> ReverseLines<R> {
    /// Create a reverse reader with the default block size.
    pub fn new(reader: R) -> io::Result<Self> {
        Self::with_block_size(reader, DEFAULT_BLOCK_BYTES)
    }

    /// Create a reverse reader; `block` is clamped to
    /// [`MIN_BLOCK_BYTES`, `MAX_BLOCK_BYTES`].
    pub fn with_block_size(mut reader: R, block: usize) -> io::Result<Self> {
        let pos = reader.seek(SeekFrom::End(0))?;
        Ok(Self {
            reader,
            block: block.clamp(MIN_BLOCK_BYTES, MAX_BLOCK_BYTES),
            pos,
            partial: Vec::new(),
            ready: Vec::new(),
            done: false,
        })
    }

    fn read_block(&mut self) -> io::Result<()> {
        let len = self.block.min(usize::try_from(self.pos).unwrap_or(self.block));
        let start = self.pos - len as u64;
        self.reader.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        self.pos = start;

        buf.extend_from_slice(&self.partial);
        let mut pieces = buf.split(|b| *b == b'\n');
        // The first piece may continue into the previous (not yet read) block.
        let head = pieces.next().unwrap_or_default().to_vec();
        self.ready.extend(pieces.map(<[u8]>::to_vec));
        self.partial = head;
        Ok(())
    }

    fn decode(bytes: Vec<u8>) -> io::Result<Option<String>> {
        let s = String::from_utf8(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(trimmed.to_string()))
    }
}

impl<R: Read + Seek> Iterator for ReverseLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(line) = self.ready.pop() {
                match Self::decode(line) {
                    Ok(Some(s)) => return Some(Ok(s)),
                    Ok(None) => continue,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            if self.pos == 0 {
                self.done = true;
                return match Self::decode(std::mem::take(&mut self.partial)) {
                    Ok(Some(s)) => Some(Ok(s)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                };
            }
            if let Err(e) = self.read_block() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(bytes: &[u8], block: usize) -> Vec<String> {
        ReverseLines::with_block_size(Cursor::new(bytes.to_vec()), block)
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn yields_lines_last_first() {
        assert_eq!(collect(b"a\nb\nc\n", 4096), vec!["c", "b", "a"]);
        assert_eq!(collect(b"a\nb\nc", 4096), vec!["c", "b", "a"]);
    }

    #[test]
    fn skips_blank_lines_and_trims() {
        assert_eq!(collect(b"\n a \n\n\r\nb\r\n\n", 4096), vec!["b", "a"]);
        assert!(collect(b"", 4096).is_empty());
        assert!(collect(b"\n\n\n", 4096).is_empty());
    }

    #[test]
    fn lines_spanning_blocks_are_reassembled() {
        let lines: Vec<String> = (0..5000).map(|i| format!("{:0>12}", i * 7919)).collect();
        let mut bytes = Vec::new();
        for l in &lines {
            bytes.extend_from_slice(l.as_bytes());
            bytes.push(b'\n');
        }
        // 13-byte lines never align with 4 KiB blocks.
        let got = collect(&bytes, MIN_BLOCK_BYTES);
        let want: Vec<String> = lines.into_iter().rev().collect();
        assert_eq!(got, want);
    }

    #[test]
    fn line_longer_than_a_block() {
        let long = "x".repeat(MIN_BLOCK_BYTES * 3 + 17);
        let bytes = format!("first\n{long}\nlast\n");
        assert_eq!(
            collect(bytes.as_bytes(), 0),
            vec!["last".to_string(), long, "first".to_string()]
        );
    }

    #[test]
    fn stops_early_without_reading_the_whole_file() {
        let bytes: Vec<u8> = (0..100_000)
            .flat_map(|i| format!("{i}\n").into_bytes())
            .collect();
        let it = ReverseLines::new(Cursor::new(bytes)).unwrap();
        let got: Vec<String> = it.take(3).map(Result::unwrap).collect();
        assert_eq!(got, vec!["99999", "99998", "99997"]);
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let mut it = ReverseLines::new(Cursor::new(vec![b'o', b'k', b'\n', 0xFF, 0xFE])).unwrap();
        assert!(it.next().unwrap().is_err());
        assert!(it.next().is_none());
    }
}
