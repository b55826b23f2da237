pub mod archive;
pub mod backend;
pub mod http;
pub mod local;
pub mod memory;
pub mod ops;
pub mod scp;

pub use archive::{ArchiveFormat, ArchiveFs};
pub use backend::{FileStat, ReadChunk, ReadHandle, VfsBackend, WriteHandle};
pub use http::HttpFs;
pub use local::LocalFs;
pub use memory::MemoryFs;
pub use ops::{copy_tree, move_tree, remove_tree, walk, WalkEntry};
pub use scp::{ScpFs, TransferStats};
