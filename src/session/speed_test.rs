//! Speed-test policy used to filter slow sellers before a contract forms.

use std::time::Duration;

/// Governs the pre-contract speed test on the buying side and the payload
/// budget honored on the selling side.
#[derive(Debug, Clone)]
pub struct SpeedTestPolicy {
    payload_size: u32,
    max_payload_size: u32,
    max_time_to_respond: Duration,
    enabled: bool,
    disconnect_if_slow: bool,
}

impl Default for SpeedTestPolicy {
    fn default() -> SpeedTestPolicy {
        SpeedTestPolicy {
            payload_size: 500_000,
            max_payload_size: 2_000_000,
            max_time_to_respond: Duration::from_secs(5),
            enabled: true,
            disconnect_if_slow: false,
        }
    }
}

impl SpeedTestPolicy {
    pub fn payload_size(&self) -> u32 {
        self.payload_size
    }

    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    pub fn max_time_to_respond(&self) -> Duration {
        self.max_time_to_respond
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn disconnect_if_slow(&self) -> bool {
        self.disconnect_if_slow
    }

    pub fn set_payload_size(&mut self, payload_size: u32) {
        self.payload_size = payload_size;
    }

    pub fn set_max_payload_size(&mut self, max_payload_size: u32) {
        self.max_payload_size = max_payload_size;
    }

    pub fn set_max_time_to_respond(&mut self, max_time_to_respond: Duration) {
        self.max_time_to_respond = max_time_to_respond;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn set_disconnect_if_slow(&mut self, disconnect_if_slow: bool) {
        self.disconnect_if_slow = disconnect_if_slow;
    }
}
