// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::net::SocketAddr;
use std::net::TcpListener as StdTcpListener;
use tokio::net::TcpListener as AsyncTcpListener;

/// A TCP socket that is already bound and listening. The std constructor
/// allows binding before the runtime starts, so a busy port aborts startup
/// instead of surfacing later as a task failure; either version converts to
/// an async listener for the accept loop.
#[derive(Debug)]
pub struct Listener {
    inner: ListenerInner,
}

#[derive(Debug)]
enum ListenerInner {
    Async(AsyncTcpListener),
    Std(StdTcpListener),
}

impl Listener {
    pub fn listen_std(endpoint: SocketAddr) -> Result<Self, Box<dyn Error + Send + Sync>> {
        match StdTcpListener::bind(endpoint) {
            Ok(l) => Ok(Self {
                inner: ListenerInner::Std(l),
            }),
            Err(e) => Err(format!("unable to bind to {}: {}", endpoint, e).into()),
        }
    }

    pub async fn listen_async(endpoint: SocketAddr) -> Result<Self, Box<dyn Error + Send + Sync>> {
        match AsyncTcpListener::bind(endpoint).await {
            Ok(l) => Ok(Self {
                inner: ListenerInner::Async(l),
            }),
            Err(e) => Err(format!("unable to bind to {}: {}", endpoint, e).into()),
        }
    }

    pub fn bound_address(&self) -> Result<SocketAddr, Box<dyn Error + Send + Sync>> {
        Ok(match &self.inner {
            ListenerInner::Async(inner) => inner.local_addr()?,
            ListenerInner::Std(inner) => inner.local_addr()?,
        })
    }

    pub fn into_async(self) -> Result<AsyncTcpListener, Box<dyn Error + Send + Sync>> {
        match self.inner {
            ListenerInner::Async(inner) => Ok(inner),
            ListenerInner::Std(inner) => {
                // The std socket must be non-blocking before tokio adopts it.
                inner.set_nonblocking(true)?;

                let listener = AsyncTcpListener::from_std(inner)?;
                Ok(listener)
            }
        }
    }
}
