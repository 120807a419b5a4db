//! ANN index abstraction
//!
//! The production HNSW implementation is a drop-in behind `AnnIndex`; the
//! bundled `FlatIndex` is an exact brute-force index persisted to the same
//! binary file, sufficient for local graphs and used by tests.

use std::io::{self, Read, Write};
use std::path::Path;

use rustc_hash::FxHashMap;

/// File magic for the persisted index
const INDEX_MAGIC: &[u8; 4] = b"GANN";

/// Persisted format version
const INDEX_VERSION: u32 = 1;

/// Approximate-nearest-neighbor index over integer-keyed vectors.
///
/// The integer id written into the index equals `VectorDocument.id`, so a
/// search hit resolves to a node without scanning.
pub trait AnnIndex: Send + Sync {
    /// Insert or replace a vector under an id
    fn upsert(&mut self, id: i64, vector: &[f32]);

    /// Return up to `k` ids by descending similarity
    fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)>;

    /// Persist to disk
    fn save(&self, path: &Path) -> io::Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exact brute-force index with cosine scoring
#[derive(Debug, Default)]
pub struct FlatIndex {
    vectors: Vec<(i64, Vec<f32>)>,
    positions: FxHashMap<i64, usize>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a previously saved index; a missing file yields an empty index
    pub fn load(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let mut file = std::fs::File::open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad index magic"));
        }
        let version = read_u32(&mut file)?;
        if version != INDEX_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported index version {version}"),
            ));
        }
        let count = read_u32(&mut file)? as usize;

        let mut index = Self::new();
        for _ in 0..count {
            let mut id_bytes = [0u8; 8];
            file.read_exact(&mut id_bytes)?;
            let id = i64::from_le_bytes(id_bytes);
            let dim = read_u32(&mut file)? as usize;
            let mut buf = vec![0u8; dim * 4];
            file.read_exact(&mut buf)?;
            let vector: Vec<f32> = buf
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            index.positions.insert(id, index.vectors.len());
            index.vectors.push((id, vector));
        }
        Ok(index)
    }
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

impl AnnIndex for FlatIndex {
    fn upsert(&mut self, id: i64, vector: &[f32]) {
        match self.positions.get(&id) {
            Some(&pos) => self.vectors[pos].1 = vector.to_vec(),
            None => {
                self.positions.insert(id, self.vectors.len());
                self.vectors.push((id, vector.to_vec()));
            }
        }
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        let mut scored: Vec<(i64, f32)> = self
            .vectors
            .iter()
            .map(|(id, v)| (*id, cosine(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    fn save(&self, path: &Path) -> io::Result<()> {
        // Write to a sibling temp file, then rename for atomicity
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(INDEX_MAGIC)?;
            file.write_all(&INDEX_VERSION.to_le_bytes())?;
            file.write_all(&(self.vectors.len() as u32).to_le_bytes())?;
            for (id, vector) in &self.vectors {
                file.write_all(&id.to_le_bytes())?;
                file.write_all(&(vector.len() as u32).to_le_bytes())?;
                for value in vector {
                    file.write_all(&value.to_le_bytes())?;
                }
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_search_ranking() {
        let mut index = FlatIndex::new();
        index.upsert(1, &[1.0, 0.0]);
        index.upsert(2, &[0.0, 1.0]);
        index.upsert(3, &[0.7, 0.7]);

        let hits = index.search(&[1.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 1);
        assert_eq!(hits[1].0, 3);
    }

    #[test]
    fn test_upsert_replaces() {
        let mut index = FlatIndex::new();
        index.upsert(1, &[1.0, 0.0]);
        index.upsert(1, &[0.0, 1.0]);
        assert_eq!(index.len(), 1);

        let hits = index.search(&[0.0, 1.0], 1);
        assert!(hits[0].1 > 0.99);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("test.ann");

        let mut index = FlatIndex::new();
        index.upsert(7, &[0.5, -0.25, 1.5]);
        index.upsert(9, &[1.0, 1.0, 1.0]);
        index.save(&path).unwrap();

        let loaded = FlatIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        let hits = loaded.search(&[0.5, -0.25, 1.5], 1);
        assert_eq!(hits[0].0, 7);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let index = FlatIndex::load(&temp.path().join("nope.ann")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
