use std::time::Duration;

/// Protocol version advertised during the connection handshake.
pub(crate) const PROTOCOL_VERSION: u32 = 1;

/// Runtime configuration of a [`crate::LocalNode`].
///
/// Carried by value into the node at construction; there is no process-wide
/// attribute store. The wire string form lets a process group share one
/// configuration at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Globals {
    /// Flush threshold of object data output streams, in bytes.
    pub object_buffer_size: usize,
    /// Default timeout for request-based waits.
    pub timeout: Duration,
    /// Idle interval after which a keepalive ping is sent.
    pub keepalive: Duration,
    /// Byte budget of the instance cache. Zero disables the cache.
    pub instance_cache_size: u64,
    /// Minimum stream size before compression is attempted, in bytes.
    pub compression_threshold: usize,
    /// Upper bound on commands queued for one command task.
    pub command_queue_limit: usize,
    /// Speculatively send instance data of newly registered masters to all
    /// connected nodes, priming their instance caches.
    pub send_on_register: bool,
}

impl Default for Globals {
    fn default() -> Self {
        Globals {
            object_buffer_size: 60_000,
            timeout: Duration::from_millis(300_000),
            keepalive: Duration::from_millis(2_000),
            instance_cache_size: 100 * 1024 * 1024,
            compression_threshold: 1023,
            command_queue_limit: 4096,
            send_on_register: false,
        }
    }
}

impl Globals {
    /// Defaults overridden by the `CO_OBJECT_BUFFER_SIZE`, `CO_TIMEOUT` and
    /// `CO_KEEPALIVE_TIMEOUT` environment variables.
    pub fn from_env() -> Self {
        let mut globals = Globals::default();
        if let Some(size) = env_u64("CO_OBJECT_BUFFER_SIZE") {
            globals.object_buffer_size = size as usize;
        }
        if let Some(ms) = env_u64("CO_TIMEOUT") {
            globals.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("CO_KEEPALIVE_TIMEOUT") {
            globals.keepalive = Duration::from_millis(ms);
        }
        globals
    }

    /// Serialise into the `#`-delimited wire string.
    pub fn to_wire_string(&self) -> String {
        format!(
            "#{}#{}#{}#{}#{}#{}#{}#{}#",
            PROTOCOL_VERSION,
            self.object_buffer_size,
            self.timeout.as_millis(),
            self.keepalive.as_millis(),
            self.instance_cache_size,
            self.compression_threshold,
            self.command_queue_limit,
            self.send_on_register as u8,
        )
    }

    /// Parse the `#`-delimited wire string, ignoring trailing fields from
    /// newer peers. Returns `None` on anything but a well-formed string.
    pub fn from_wire_string(data: &str) -> Option<Self> {
        if !data.starts_with('#') || !data.ends_with('#') {
            return None;
        }
        let mut fields = data[1..data.len() - 1].split('#');

        let version: u32 = fields.next()?.parse().ok()?;
        if version != PROTOCOL_VERSION {
            return None;
        }
        Some(Globals {
            object_buffer_size: fields.next()?.parse().ok()?,
            timeout: Duration::from_millis(fields.next()?.parse().ok()?),
            keepalive: Duration::from_millis(fields.next()?.parse().ok()?),
            instance_cache_size: fields.next()?.parse().ok()?,
            compression_threshold: fields.next()?.parse().ok()?,
            command_queue_limit: fields.next()?.parse().ok()?,
            send_on_register: fields.next()? == "1",
        })
    }
}

fn env_u64(name: &str) -> Option<u64> {
    match std::env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!(%name, %value, "ignoring unparseable environment variable");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_string_round_trip() {
        let mut globals = Globals::default();
        globals.object_buffer_size = 1234;
        globals.send_on_register = true;

        let encoded = globals.to_wire_string();
        assert_eq!(Globals::from_wire_string(&encoded), Some(globals));
    }

    #[test]
    fn wire_string_rejects_garbage() {
        assert_eq!(Globals::from_wire_string(""), None);
        assert_eq!(Globals::from_wire_string("#999#"), None);
        assert_eq!(Globals::from_wire_string("#1#nope#"), None);
    }
}
