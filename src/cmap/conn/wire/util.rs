use std::io::{Read, Result};

/// A `Read` wrapper that keeps track of the number of bytes it has read.
pub(super) struct CountReader<'a, R: Read> {
    reader: &'a mut R,
    bytes_read: usize,
}

impl<'a, R: Read> CountReader<'a, R> {
    pub(super) fn new(reader: &'a mut R) -> Self {
        CountReader {
            reader,
            bytes_read: 0,
        }
    }

    pub(super) fn bytes_read(&self) -> usize {
        self.bytes_read
    }
}

impl<'a, R: Read> Read for CountReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let count = self.reader.read(buf)?;
        self.bytes_read += count;

        Ok(count)
    }
}
