//! Process memory sampling.

/// Source of resident-set-size readings.
pub trait MemorySampler: Send + Sync {
    /// Current RSS in bytes, or `None` if unavailable on this platform.
    fn rss_bytes(&self) -> Option<u64>;
}

/// Sampler backed by `/proc/self/statm`.
///
/// Returns `None` on platforms without procfs; the guard then skips
/// memory checks entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMemorySampler;

impl MemorySampler for ProcMemorySampler {
    fn rss_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        // Second field is resident pages.
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * page_size())
    }
}

fn page_size() -> u64 {
    // Linux reports statm in pages; 4 KiB everywhere we deploy.
    4096
}
