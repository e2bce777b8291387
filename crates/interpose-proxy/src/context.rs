//! Per-request shared context threaded through every filter.
//!
//! A [`Context`] is created fresh for each inbound request, passed by value
//! into each filter and replaced by the value the filter returns. Three
//! entries are reserved by the pipeline and can be read or replaced with a
//! value of the same type, but never removed.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::listener::ListenerHandle;
use crate::transport::Transport;
use crate::writer::ResponseWriter;

/// Reserved key for the listener reference.
pub const LISTENER_KEY: &str = "__listener__";
/// Reserved key for the default outbound transport.
pub const TRANSPORT_KEY: &str = "__transport__";
/// Reserved key for the client-facing response writer.
pub const RESPONSE_WRITER_KEY: &str = "__rw__";

type Value = Arc<dyn Any + Send + Sync>;

/// Context entry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    /// A reserved key was given a value of the wrong type.
    #[error("reserved key {0} cannot hold this type")]
    ReservedType(&'static str),

    /// A reserved key cannot be removed.
    #[error("reserved key {0} cannot be removed")]
    ReservedRemoval(&'static str),
}

/// String-keyed map of arbitrary values scoped to one request.
#[derive(Clone)]
pub struct Context {
    listener: ListenerHandle,
    transport: Transport,
    writer: ResponseWriter,
    entries: HashMap<String, Value>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("Context")
            .field("listener", &self.listener)
            .field("writer", &self.writer)
            .field("entries", &keys)
            .finish()
    }
}

impl Context {
    /// Creates a context seeded with the reserved entries.
    pub fn new(listener: ListenerHandle, transport: Transport, writer: ResponseWriter) -> Self {
        Self {
            listener,
            transport,
            writer,
            entries: HashMap::new(),
        }
    }

    /// Listener the request arrived on.
    pub fn listener(&self) -> &ListenerHandle {
        &self.listener
    }

    /// Default outbound transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Writer for the client-facing response.
    pub fn response_writer(&self) -> &ResponseWriter {
        &self.writer
    }

    /// Returns the value under `key` if it holds a `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        match key {
            LISTENER_KEY => (&self.listener as &dyn Any).downcast_ref(),
            TRANSPORT_KEY => (&self.transport as &dyn Any).downcast_ref(),
            RESPONSE_WRITER_KEY => (&self.writer as &dyn Any).downcast_ref(),
            _ => self.entries.get(key)?.downcast_ref(),
        }
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        is_reserved(key) || self.entries.contains_key(key)
    }

    /// Adds or overwrites an entry.
    ///
    /// Reserved keys accept only a value of their own type.
    pub fn insert<T: Any + Send + Sync>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), ContextError> {
        let key = key.into();
        match key.as_str() {
            LISTENER_KEY => self.listener = reserved(LISTENER_KEY, value)?,
            TRANSPORT_KEY => self.transport = reserved(TRANSPORT_KEY, value)?,
            RESPONSE_WRITER_KEY => self.writer = reserved(RESPONSE_WRITER_KEY, value)?,
            _ => {
                self.entries.insert(key, Arc::new(value));
            }
        }
        Ok(())
    }

    /// Builder-style [`Context::insert`] for non-reserved keys.
    pub fn with<T: Any + Send + Sync>(
        mut self,
        key: impl Into<String>,
        value: T,
    ) -> Result<Self, ContextError> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Removes a non-reserved entry, returning whether it was present.
    pub fn remove(&mut self, key: &str) -> Result<bool, ContextError> {
        if let Some(reserved) = reserved_name(key) {
            return Err(ContextError::ReservedRemoval(reserved));
        }
        Ok(self.entries.remove(key).is_some())
    }

    /// Number of entries, reserved ones included.
    pub fn len(&self) -> usize {
        3 + self.entries.len()
    }

    /// Always false: the reserved entries are present for the whole request.
    pub fn is_empty(&self) -> bool {
        false
    }
}

fn reserved_name(key: &str) -> Option<&'static str> {
    [LISTENER_KEY, TRANSPORT_KEY, RESPONSE_WRITER_KEY]
        .into_iter()
        .find(|k| *k == key)
}

fn is_reserved(key: &str) -> bool {
    reserved_name(key).is_some()
}

fn reserved<T: Any, R: Any>(key: &'static str, value: T) -> Result<R, ContextError> {
    let boxed: Box<dyn Any> = Box::new(value);
    boxed
        .downcast::<R>()
        .map(|v| *v)
        .map_err(|_| ContextError::ReservedType(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::{Dialer, DialerConfig};
    use crate::listener::ProxyListener;
    use crate::transport::TransportConfig;

    fn test_context() -> (Context, ProxyListener) {
        let listener = ProxyListener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let dialer =
            Dialer::with_roots(&DialerConfig::default(), rustls::RootCertStore::empty()).unwrap();
        let transport = Transport::new(dialer, &TransportConfig::default());
        let ctx = Context::new(listener.handle(), transport, ResponseWriter::new());
        (ctx, listener)
    }

    #[tokio::test]
    async fn reserved_entries_are_seeded_and_typed() {
        let (ctx, listener) = test_context();

        assert_eq!(ctx.len(), 3);
        assert!(ctx.contains(LISTENER_KEY));
        assert!(ctx.contains(TRANSPORT_KEY));
        assert!(ctx.contains(RESPONSE_WRITER_KEY));

        let handle = ctx.get::<ListenerHandle>(LISTENER_KEY).unwrap();
        assert_eq!(handle.local_addr(), listener.local_addr());
        assert!(ctx.get::<Transport>(TRANSPORT_KEY).is_some());
        assert!(ctx.get::<ResponseWriter>(RESPONSE_WRITER_KEY).is_some());
        assert!(ctx.get::<String>(LISTENER_KEY).is_none());
    }

    #[tokio::test]
    async fn entries_can_be_added_and_overwritten() {
        let (mut ctx, _listener) = test_context();

        ctx.insert("backend", "primary".to_string()).unwrap();
        assert_eq!(ctx.get::<String>("backend").unwrap(), "primary");

        ctx.insert("backend", 7u16).unwrap();
        assert!(ctx.get::<String>("backend").is_none());
        assert_eq!(*ctx.get::<u16>("backend").unwrap(), 7);
        assert!(ctx.remove("backend").unwrap());
        assert!(!ctx.contains("backend"));
    }

    #[tokio::test]
    async fn reserved_entries_cannot_be_removed() {
        let (mut ctx, _listener) = test_context();
        assert_eq!(
            ctx.remove(RESPONSE_WRITER_KEY),
            Err(ContextError::ReservedRemoval(RESPONSE_WRITER_KEY))
        );
        assert!(ctx.contains(RESPONSE_WRITER_KEY));
    }

    #[tokio::test]
    async fn reserved_entries_keep_their_type() {
        let (mut ctx, _listener) = test_context();
        assert_eq!(
            ctx.insert(TRANSPORT_KEY, "not a transport"),
            Err(ContextError::ReservedType(TRANSPORT_KEY))
        );

        let writer = ResponseWriter::new();
        ctx.insert(RESPONSE_WRITER_KEY, writer.clone()).unwrap();
        writer
            .write(hyper::Response::new(crate::body::empty()))
            .unwrap();
        assert!(ctx.response_writer().is_written());
    }

    #[tokio::test]
    async fn clones_do_not_share_entries() {
        let (ctx, _listener) = test_context();
        let first = ctx.clone().with("user", 1u32).unwrap();
        let second = ctx.with("user", 2u32).unwrap();

        assert_eq!(*first.get::<u32>("user").unwrap(), 1);
        assert_eq!(*second.get::<u32>("user").unwrap(), 2);
    }
}
