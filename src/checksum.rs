/*!
 * SHA-256 content hashing
 */

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use debstash_core_manifest::ContentHash;

use crate::error::Result;

/// Read size used for every hashing and packing loop
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Streaming hasher for incremental content hashing
pub struct StreamingHasher {
    hasher: Sha256,
}

impl StreamingHasher {
    /// Create a new streaming hasher
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Update the hash with new data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize into a content hash
    pub fn finalize(self) -> ContentHash {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.hasher.finalize());
        ContentHash::from_bytes(bytes)
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash everything a reader yields
pub fn hash_reader<R: Read>(mut reader: R) -> Result<ContentHash> {
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Hash a whole file
pub fn hash_file(path: &Path) -> Result<ContentHash> {
    hash_reader(File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_streaming_hasher() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");

        // SHA256 of "hello world"
        assert_eq!(hasher.finalize().to_hex(), HELLO_WORLD);
    }

    #[test]
    fn test_hash_empty_reader() {
        let hash = hash_reader(&b""[..]).unwrap();
        assert_eq!(
            hash.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_file_spanning_chunks() {
        let mut file = NamedTempFile::new().unwrap();
        let data = vec![b'x'; CHUNK_SIZE * 2 + 17];
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        assert_eq!(
            hash_file(file.path()).unwrap(),
            hash_reader(&data[..]).unwrap()
        );
    }
}
