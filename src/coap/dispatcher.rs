use std::fmt;

use super::message::CoapMessage;
use crate::error::{Error, ParseError};

/// A decoded inbound request as seen by resource handlers.
#[derive(Debug)]
pub struct Request<'a> {
    pub message: &'a CoapMessage,
    pub uri_path: &'a str,
    /// The undecoded datagram.
    pub raw: &'a [u8],
}

type Handler<C> = Box<dyn FnMut(&Request<'_>, &mut C) + Send>;

/// A named handler, optionally bound to one URI path.
pub struct Resource<C> {
    name: String,
    uri: Option<String>,
    handler: Handler<C>,
}

impl<C> Resource<C> {
    /// A handler that sees every request and compares the path itself.
    pub fn new<F>(name: &str, handler: F) -> Self
    where
        F: FnMut(&Request<'_>, &mut C) + Send + 'static,
    {
        Resource {
            name: name.to_string(),
            uri: None,
            handler: Box::new(handler),
        }
    }

    /// A handler invoked only for requests on `uri`. The path doubles as the name.
    pub fn for_uri<F>(uri: &str, handler: F) -> Self
    where
        F: FnMut(&Request<'_>, &mut C) + Send + 'static,
    {
        Resource {
            name: uri.to_string(),
            uri: Some(uri.to_string()),
            handler: Box::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, uri_path: &str) -> bool {
        self.uri.as_deref().map(|u| u == uri_path).unwrap_or(true)
    }
}

impl<C> fmt::Debug for Resource<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("uri", &self.uri)
            .finish()
    }
}

/// Result of feeding one datagram to a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Decoded; this many handlers were invoked.
    Handled(usize),
    /// Decoding failed; the datagram was dropped.
    Malformed(ParseError),
}

/// Ordered table of CoAP resources.
///
/// `C` is the context handed to every handler, typically where handlers queue their
/// output. Resources are scanned linearly in registration order.
pub struct Dispatcher<C> {
    resources: Vec<Resource<C>>,
    malformed: u64,
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Dispatcher {
            resources: Vec::new(),
            malformed: 0,
        }
    }

    pub fn add_resource(&mut self, resource: Resource<C>) -> Result<(), Error> {
        if self.resources.iter().any(|r| r.name == resource.name) {
            return Err(Error::AlreadyRegistered(resource.name));
        }
        debug!("Add CoAP resource: {}", resource.name);
        self.resources.push(resource);
        Ok(())
    }

    pub fn remove_resource(&mut self, name: &str) -> bool {
        let before = self.resources.len();
        self.resources.retain(|r| r.name != name);
        self.resources.len() != before
    }

    /// Decode `bytes` and invoke every matching handler.
    ///
    /// Malformed datagrams are dropped and counted; they never surface as an error.
    pub fn receive(&mut self, bytes: &[u8], ctx: &mut C) -> Dispatch {
        let parsed = CoapMessage::decode(bytes).and_then(|m| {
            let path = m.uri_path()?;
            Ok((m, path))
        });

        let (message, uri_path) = match parsed {
            Ok(v) => v,
            Err(e) => {
                self.malformed += 1;
                debug!("Drop malformed CoAP datagram ({} bytes): {}", bytes.len(), e);
                return Dispatch::Malformed(e);
            }
        };

        trace!(
            "CoAP {:?} {} mid={} uri={:?}",
            message.message_type,
            message.code,
            message.message_id,
            uri_path
        );

        let request = Request {
            message: &message,
            uri_path: &uri_path,
            raw: bytes,
        };

        let mut handled = 0;
        for resource in self.resources.iter_mut() {
            if resource.matches(&uri_path) {
                (resource.handler)(&request, ctx);
                handled += 1;
            }
        }
        Dispatch::Handled(handled)
    }

    /// Count of datagrams dropped as malformed.
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("resources", &self.resources)
            .field("malformed", &self.malformed)
            .finish()
    }
}
