//! Transform repository: latest matrix per transform name.
//!
//! The sender refreshes it from each frame before packing; the message
//! factory consults it so a client may subscribe to any transform name the
//! stream carries, independent of per-frame ordering.

use crate::core::types::{Matrix4x4, ToolStatus, TrackedFrame};
use std::collections::HashMap;

#[derive(Default)]
pub struct TransformRepository {
    transforms: HashMap<String, (Matrix4x4, ToolStatus)>,
}

impl TransformRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh all transforms carried by a frame.
    pub fn set_transforms(&mut self, frame: &TrackedFrame) {
        for pose in &frame.poses {
            self.transforms
                .insert(pose.name.clone(), (pose.matrix, pose.status));
        }
    }

    pub fn get(&self, name: &str) -> Option<&(Matrix4x4, ToolStatus)> {
        self.transforms.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{identity_matrix, ToolPose};

    #[test]
    fn later_frames_overwrite() {
        let mut repo = TransformRepository::new();
        let mut f1 = TrackedFrame::new(1.0);
        f1.poses.push(ToolPose {
            name: "StylusToTracker".into(),
            matrix: identity_matrix(),
            status: ToolStatus::Ok,
            frame_number: 1,
        });
        repo.set_transforms(&f1);

        let mut m = identity_matrix();
        m[0][3] = 5.0;
        let mut f2 = TrackedFrame::new(2.0);
        f2.poses.push(ToolPose {
            name: "StylusToTracker".into(),
            matrix: m,
            status: ToolStatus::OutOfView,
            frame_number: 2,
        });
        repo.set_transforms(&f2);

        let (matrix, status) = repo.get("StylusToTracker").unwrap();
        assert_eq!(matrix[0][3], 5.0);
        assert_eq!(*status, ToolStatus::OutOfView);
    }
}
