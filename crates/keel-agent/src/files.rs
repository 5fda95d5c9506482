use std::path::Path;

use log::debug;

/// Exposes paths through the agent's read-only browsing endpoints.
/// The HTTP layer itself is out of scope; the agent only attaches executor
/// work directories (and the log directory) and detaches them after GC.
pub trait FileServing: Send + Sync + 'static {
    fn attach(&self, path: &Path, virtual_path: &Path);
    fn detach(&self, path: &Path);
}

/// A file server that only records attachments in the debug log.
#[derive(Debug, Default)]
pub struct NullFileServer;

impl FileServing for NullFileServer {
    fn attach(&self, path: &Path, virtual_path: &Path) {
        debug!(
            "attached '{}' as '{}'",
            path.display(),
            virtual_path.display()
        );
    }

    fn detach(&self, path: &Path) {
        debug!("detached '{}'", path.display());
    }
}
