pub mod coords;
pub mod detector;
pub mod events;
pub mod merge;
pub mod queue;
pub mod storage;
pub mod tiler;
