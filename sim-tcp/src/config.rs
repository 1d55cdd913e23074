//! Transport configuration.

use crate::error::ConfigError;
use crate::packet::MAX_TTL;
use crate::segment::MAX_PAYLOAD_LEN;
use crate::timer::TimerConfig;

/// Per-node transport parameters shared by every socket the node creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum payload bytes per DATA segment.
    pub mss: usize,
    /// Capacity of each socket's send and receive buffer.  One byte is always
    /// kept free, so at most `buffer_size - 1` bytes are ever buffered.
    pub buffer_size: usize,
    /// Initial sequence number for every connection this node opens.
    pub initial_seq: u32,
    /// Hop limit stamped on outgoing packets.
    pub ttl: u8,
    pub timers: TimerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: 1000,
            buffer_size: 16_000,
            initial_seq: 0,
            ttl: MAX_TTL,
            timers: TimerConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mss == 0 || self.mss > MAX_PAYLOAD_LEN {
            return Err(ConfigError::InvalidMss(self.mss));
        }
        if self.buffer_size < 2 || self.buffer_size <= self.mss {
            return Err(ConfigError::BufferTooSmall {
                buffer_size: self.buffer_size,
                mss: self.mss,
            });
        }
        if self.buffer_size > u32::MAX as usize {
            return Err(ConfigError::BufferTooLarge(self.buffer_size));
        }
        if self.ttl == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        Ok(())
    }
}
