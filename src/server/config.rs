use serde::Deserialize;

/// Per-connection limits and switches.
///
/// Deserializable so a host can load it from whatever format it uses; every
/// field falls back to its default when absent.
///
/// # Examples
///
/// ```
/// use weft::server::ServerConfig;
///
/// let config = ServerConfig {
///     keep_alive: false,
///     ..ServerConfig::default()
/// };
/// assert_eq!(config.max_body_bytes, 8 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Largest accepted request line plus header block.
    pub max_head_bytes: usize,
    /// Largest accepted request body, however it is framed.
    pub max_body_bytes: usize,
    /// Initial read buffer capacity per connection.
    pub read_buffer_capacity: usize,
    /// When `false`, every response closes its connection.
    pub keep_alive: bool,
    /// Completed requests a connection buffers behind the one being serviced
    /// before it stops reading from the socket.
    pub max_queued_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 8 * 1024,
            max_body_bytes: 8 * 1024 * 1024,
            read_buffer_capacity: 4096,
            keep_alive: true,
            max_queued_requests: 32,
        }
    }
}
