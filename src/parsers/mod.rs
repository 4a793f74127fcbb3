pub mod llvm_cov;

use crate::error::Result;
use crate::model::FileRecord;

/// Every coverage export parser implements this trait.
pub trait Parser {
    /// Parse the input bytes into per-file records.
    fn parse(&self, input: &[u8]) -> Result<Vec<FileRecord>>;
}
