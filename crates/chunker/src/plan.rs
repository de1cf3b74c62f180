const MIB: u64 = 1024 * 1024;

/// How a file of a given size is split into upload chunks.
///
/// The chunk size scales with the file so very large files do not
/// explode into millions of parts: the file size in MiB is divided
/// into groups of 10 000 and the group count picks a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    /// Computes the plan for a file of `file_size` bytes.
    pub fn for_size(file_size: u64) -> Self {
        let mib = file_size as f64 / MIB as f64;
        let groups = (mib / 10_000.0).ceil();
        let tier_mib: u64 = if groups < 5.0 {
            5
        } else if groups < 50.0 {
            50
        } else if groups < 100.0 {
            100
        } else {
            210
        };
        Self {
            file_size,
            chunk_size: tier_mib * MIB,
        }
    }

    /// Overrides the chunk size, keeping the count formula.
    pub fn with_chunk_size(self, chunk_size: u64) -> Self {
        Self { chunk_size, ..self }
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Number of chunks the reader will enumerate, always at least 1.
    ///
    /// `size / chunk_size + 1` counts a trailing short chunk even when the
    /// file divides evenly; the reader drops the resulting empty read, so
    /// this is an upper bound used for progress totals.
    pub fn chunk_count(&self) -> u64 {
        self.file_size / self.chunk_size + 1
    }
}
