use std::io::{self, BufRead, Read};

use sha2::{Digest, Sha256};

/// Pass-through reader that hashes every byte the consumer takes.
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: BufRead> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Hex SHA-256 of everything consumed so far.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: BufRead> Read for DigestReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(out)?;
        self.hasher.update(&out[..count]);
        self.bytes += count as u64;
        Ok(count)
    }
}

impl<R: BufRead> BufRead for DigestReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        if amt > 0 {
            // Returns the already-filled buffer; no new read happens here.
            if let Ok(buf) = self.inner.fill_buf() {
                let take = amt.min(buf.len());
                self.hasher.update(&buf[..take]);
                self.bytes += take as u64;
            }
        }
        self.inner.consume(amt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_digest_matches_whole_content() {
        let data = b"{\"id\":1}\n{\"id\":2}\n";
        let mut reader = DigestReader::new(Cursor::new(&data[..]));
        let mut line = String::new();
        while reader.read_line(&mut line).unwrap() > 0 {}

        assert_eq!(reader.bytes_read(), data.len() as u64);
        assert_eq!(reader.finish(), hex::encode(Sha256::digest(data)));
    }
}
