//! Core types shared by the tracker driver and the broadcast server.

pub mod buffer;
pub mod clock;
pub mod repository;
pub mod types;

pub use buffer::FrameBuffer;
pub use clock::Clock;
pub use repository::TransformRepository;
pub use types::{Matrix4x4, ToolPose, ToolStatus, TrackedFrame};
