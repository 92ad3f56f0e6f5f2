//! Warehouse persistence, import state tracking and raw extract archiving.

use sha2::{Digest, Sha256};

pub mod archive;
pub mod facts;
pub mod file_state;
pub mod retry;
pub mod staging;
pub mod warehouse;

pub use archive::{ArchiveEntry, ExtractArchive};
pub use facts::FactReader;
pub use file_state::{Begin, FileStateTracker};
pub use retry::{bounded, RetryPolicy};
pub use staging::StagingStore;
pub use warehouse::{storage_error, Warehouse, WarehouseConfig};

pub const CRATE_NAME: &str = "mesw-storage";

/// Content fingerprint used to detect re-extraction of a file under the same path.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_are_stable() {
        assert_eq!(
            fingerprint(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
