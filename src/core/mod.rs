pub mod arena;
pub mod shm;

pub use arena::{ArenaHeader, SharedMemoryArena};
pub use shm::{ShmMode, ShmRegion};
