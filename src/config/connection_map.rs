//! Static channel-to-relay-path table for the matrix board
//!
//! Each SiPM signal line is wired to one crosspoint column of the switching
//! matrix; the bias line has its own crosspoint. The identifiers are the
//! crosspoint names the matrix expects in its close/open commands.

use crate::types::{Channel, CHANNEL_COUNT};

/// Crosspoint identifier of the bias path
pub const BIAS_PATH: &str = "E001";

/// Crosspoint identifier for each channel, indexed by 0-based channel index
pub const CONNECTION_MAP: [&str; CHANNEL_COUNT] = [
    "F2", "F3", "F4", "F5", "F6", "F7", "F8", "F9", "F10", "F11", "F12", "F13", "F14", "F15",
    "F16", "F17",
];

/// Relay path for a channel
pub fn channel_path(channel: Channel) -> &'static str {
    CONNECTION_MAP[channel.index()]
}

/// Relay path for the bias line
pub fn bias_path() -> &'static str {
    BIAS_PATH
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_paths_are_unique() {
        let paths: HashSet<_> = CONNECTION_MAP.iter().collect();
        assert_eq!(paths.len(), CHANNEL_COUNT);
        assert!(!paths.contains(&BIAS_PATH));
    }

    #[test]
    fn test_first_and_last_channel() {
        assert_eq!(channel_path(Channel::new(0).unwrap()), "F2");
        assert_eq!(channel_path(Channel::new(15).unwrap()), "F17");
    }
}
