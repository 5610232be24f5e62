//! C9: downstream handler registry (§13).
//!
//! Grounded in `Downstream/Handler/*`'s `HandlerDict`/`HandlerManager`
//! pair: a name -> handler map built once from config, referenced by name
//! from the static-repeat mode's `servers` entries.

mod auto_block_by_rate;
mod tcp_repeat;
mod tls_repeat;

pub use auto_block_by_rate::AutoBlockByRateHandler;
pub use tcp_repeat::TcpRepeatHandler;
pub use tls_repeat::TlsRepeatHandler;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::DownstreamHandlerSpec;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("handler {0:?} already registered")]
    DuplicateName(String),
    #[error("handler {0:?} not found")]
    NotFound(String),
    #[error("unknown downstream module {0:?}")]
    UnknownModule(String),
    #[error("invalid config for handler {name:?}: {reason}")]
    InvalidConfig { name: String, reason: String },
}

/// An inbound connection, already stripped of any inbound TLS framing by
/// the listener that accepted it. Downstream handlers only ever see
/// plaintext; TLS termination on the way out is the handler's own concern
/// (see [`TlsRepeatHandler`]).
pub trait Duplex: io::Read + io::Write + Send {}
impl<T: io::Read + io::Write + Send> Duplex for T {}

pub trait DownstreamHandler: Send + Sync {
    /// `peer` is the accepted connection's remote address, threaded through
    /// so [`AutoBlockByRateHandler`] can key its sliding window by client IP
    /// without every other handler needing to care about it.
    fn handle(&self, conn: Box<dyn Duplex>, peer: SocketAddr, cancel: &Arc<AtomicBool>);
}

#[derive(Default)]
pub struct HandlerDict {
    handlers: HashMap<String, Arc<dyn DownstreamHandler>>,
}

impl HandlerDict {
    pub fn add(&mut self, name: String, handler: Arc<dyn DownstreamHandler>) -> Result<(), Error> {
        if self.handlers.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DownstreamHandler>, Error> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }
}

/// Mirrors `HandlerManager.BuildHandlerDictFromConfig`: construct each spec
/// in the order given, looking up prior handlers by name so
/// `auto_block_by_rate` can wrap an already-built `tcp_repeat`/`tls_repeat`.
pub fn build_handler_dict(specs: &[DownstreamHandlerSpec]) -> Result<HandlerDict, Error> {
    let mut dict = HandlerDict::default();
    for spec in specs {
        let handler: Arc<dyn DownstreamHandler> = match spec.module.as_str() {
            "tcp_repeat" => Arc::new(
                tcp_repeat::TcpRepeatHandler::from_config(&spec.config).map_err(|reason| {
                    Error::InvalidConfig {
                        name: spec.name.clone(),
                        reason,
                    }
                })?,
            ),
            "tls_repeat" => Arc::new(
                tls_repeat::TlsRepeatHandler::from_config(&spec.config).map_err(|reason| {
                    Error::InvalidConfig {
                        name: spec.name.clone(),
                        reason,
                    }
                })?,
            ),
            "auto_block_by_rate" => Arc::new(
                auto_block_by_rate::AutoBlockByRateHandler::from_config(&spec.config, &dict)
                    .map_err(|reason| Error::InvalidConfig {
                        name: spec.name.clone(),
                        reason,
                    })?,
            ),
            other => return Err(Error::UnknownModule(other.to_string())),
        };
        dict.add(spec.name.clone(), handler)?;
    }
    Ok(dict)
}
