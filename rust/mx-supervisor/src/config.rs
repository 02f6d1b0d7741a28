//! Supervisor configuration.

use std::time::Duration;

pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_HALT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(20);

/// What the failure worker does once services have been stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Reset services and re-probe every client so they can reopen.
    #[default]
    AutoRecover,
    /// Stay `Failed` until the last user closes.
    StayFailed,
}

#[derive(Debug, Clone)]
pub struct MxConfig {
    /// Wait for the firmware's start indication after releasing reset.
    ///
    /// A zero timeout waits forever in debug builds; release builds use the
    /// matching `DEFAULT_*` value instead.
    pub boot_timeout: Duration,
    /// Best-effort wait for the halt echo on the last close.
    pub halt_timeout: Duration,
    /// Wait for a service start/stop confirm.
    pub service_timeout: Duration,
    /// How long a service open waits for a failed coprocessor to recover.
    pub recovery_timeout: Duration,
    /// Interval between firmware integrity checks. `None` disables the monitor.
    pub crc_check_interval: Option<Duration>,
    pub skip_header_crc: bool,
    pub skip_const_crc: bool,
    /// Skip the whole-image CRC. Only checked at load time.
    pub skip_fw_crc: bool,
    pub recovery: RecoveryPolicy,
    /// Written to mailbox 3 and the configuration record.
    pub startup_flags: u32,
    /// Slots per direction in the management transport (8 bytes each).
    pub mgmt_slot_count: u32,
    /// Slots per direction in each debug transport.
    pub debug_slot_count: u32,
    pub debug_slot_size: u32,
}

impl Default for MxConfig {
    fn default() -> Self {
        Self {
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            halt_timeout: DEFAULT_HALT_TIMEOUT,
            service_timeout: DEFAULT_SERVICE_TIMEOUT,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            crc_check_interval: Some(Duration::from_millis(500)),
            skip_header_crc: false,
            skip_const_crc: false,
            skip_fw_crc: false,
            recovery: RecoveryPolicy::AutoRecover,
            startup_flags: 0,
            mgmt_slot_count: 256,
            debug_slot_count: 16,
            debug_slot_size: 64,
        }
    }
}

impl MxConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.mgmt_slot_count < 2 {
            return Err("mgmt_slot_count must be >= 2");
        }
        if self.debug_slot_count < 2 {
            return Err("debug_slot_count must be >= 2");
        }
        if self.debug_slot_size == 0 || !self.debug_slot_size.is_multiple_of(4) {
            return Err("debug_slot_size must be a non-zero multiple of 4");
        }
        if self.crc_check_interval == Some(Duration::ZERO) {
            return Err("crc_check_interval must be non-zero (use None to disable)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(MxConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_geometry() {
        let config = MxConfig {
            mgmt_slot_count: 1,
            ..MxConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MxConfig {
            debug_slot_size: 6,
            ..MxConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MxConfig {
            crc_check_interval: Some(Duration::ZERO),
            ..MxConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
