//! PIOP message codes reported in word 1 of the status block.

use std::collections::HashMap;
use tracing::info;

/// Text for a known message code.
pub fn describe(code: u16) -> Option<&'static str> {
    let text = match code {
        1 => "IPL complete",
        2 => "Klystron in standby",
        3 => "Klystron on beam",
        4 => "Modulator fault",
        5 => "Trigger lost",
        6 => "FTP buffer overrun",
        7 => "Phase loop unlocked",
        8 => "Control block checksum error",
        9 => "Watchdog timeout",
        _ => return None,
    };
    Some(text)
}

/// Logs device messages, skipping repeats of the last message per device.
#[derive(Debug, Default)]
pub struct MessageLog {
    last: HashMap<String, u16>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note the message code from a status read. Returns whether it was logged.
    ///
    /// Code 0 means no message; it is never logged but clears the last
    /// message, so a later repeat is reported again.
    pub fn observe(&mut self, device: &str, code: u16) -> bool {
        let previous = self.last.insert(device.to_string(), code);
        if code == 0 || previous == Some(code) {
            return false;
        }

        match describe(code) {
            Some(text) => info!(device, code, "{}", text),
            None => info!(device, code, "Unknown PIOP message"),
        }
        true
    }

    pub fn last(&self, device: &str) -> Option<u16> {
        self.last.get(device).copied().filter(|&code| code != 0)
    }
}
