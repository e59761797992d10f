//! Handler factory
//!
//! Pure mapping from a host's declared connection kind to a handler
//! variant. Unsupported kinds cannot be represented: `ConnectionKind` is a
//! closed enum, so a bad kind string is rejected when the host config is
//! deserialized, before any network activity starts.

use std::sync::Arc;

use crate::backend::Backend;
use crate::config::ConnectionKind;

use super::{ConnectionHandler, FileTransferHandler, RawStreamHandler, ShellHandler};

/// Produces handlers bound to the engine's backend
pub struct HandlerFactory {
    backend: Arc<dyn Backend>,
}

impl HandlerFactory {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Select the handler variant for `kind`
    pub fn create(&self, kind: ConnectionKind) -> ConnectionHandler {
        match kind {
            ConnectionKind::Shell => {
                ConnectionHandler::Shell(ShellHandler::new(Arc::clone(&self.backend)))
            }
            ConnectionKind::FileTransfer => {
                ConnectionHandler::FileTransfer(FileTransferHandler::new(Arc::clone(&self.backend)))
            }
            ConnectionKind::RawStream => {
                ConnectionHandler::RawStream(RawStreamHandler::new(Arc::clone(&self.backend)))
            }
        }
    }
}
