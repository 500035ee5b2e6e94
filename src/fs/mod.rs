//! What the process core needs from the filesystem: nodes that can be held
//! open by descriptors and working directories.

pub mod fd;

use alloc::sync::Arc;

/// A VFS node as seen by descriptor tables.
pub trait FileNode: Send + Sync {
    fn name(&self) -> &str;

    /// Called once, when the last handle on the node goes away.
    fn close(&self) {}
}

/// An open reference to a node. Clones share one open; the node is closed
/// when the last clone is dropped.
#[derive(Clone)]
pub struct NodeHandle(Arc<OpenNode>);

struct OpenNode {
    node: Arc<dyn FileNode>,
}

impl Drop for OpenNode {
    fn drop(&mut self) {
        self.node.close();
    }
}

impl NodeHandle {
    pub fn open(node: Arc<dyn FileNode>) -> Self {
        NodeHandle(Arc::new(OpenNode { node }))
    }

    pub fn node(&self) -> &dyn FileNode {
        &*self.0.node
    }

    /// Number of handles sharing this open.
    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl core::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("NodeHandle").field(&self.node().name()).finish()
    }
}
