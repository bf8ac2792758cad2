//! Remote flat-file access: object store client and the batched reader.

mod reader;
mod store;

pub use reader::BatchedCsvReader;
pub use store::FlatFileStore;
