use std::net::TcpListener;

use anyhow::Context;

/// Binds a std listener for hyper's `Server::from_tcp`.
///
/// Binding before the runtime is up makes "port already in use" a startup
/// error with a clear message instead of a late task failure.
pub fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("could not bind to {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("could not set the listener to non-blocking mode")?;
    Ok(listener)
}
