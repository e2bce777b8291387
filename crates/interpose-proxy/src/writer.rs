//! Client-facing response writer.
//!
//! Every inbound request gets one [`ResponseWriter`]. The pipeline relays its
//! final response through it, and filters that answer the client themselves
//! (CONNECT hijacking, synthetic replies) write to it directly. At most one
//! response can be written per request.

use std::sync::Arc;

use hyper::Response;
use parking_lot::Mutex;

use crate::body::ProxyBody;
use crate::error::FilterError;

#[derive(Default)]
struct WriterState {
    response: Option<Response<ProxyBody>>,
    written: bool,
}

/// Handle to the response slot of one client request.
#[derive(Clone, Default)]
pub struct ResponseWriter {
    state: Arc<Mutex<WriterState>>,
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("written", &self.is_written())
            .finish()
    }
}

impl ResponseWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the response the client will receive.
    ///
    /// Fails with [`FilterError::AlreadyWritten`] on a second call.
    pub fn write(&self, response: Response<ProxyBody>) -> Result<(), FilterError> {
        let mut state = self.state.lock();
        if state.written {
            return Err(FilterError::AlreadyWritten);
        }
        state.written = true;
        state.response = Some(response);
        Ok(())
    }

    /// Returns true once a response has been written.
    pub fn is_written(&self) -> bool {
        self.state.lock().written
    }

    /// Takes the written response for delivery to the connection.
    pub(crate) fn take(&self) -> Option<Response<ProxyBody>> {
        self.state.lock().response.take()
    }
}
