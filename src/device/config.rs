//! Device configuration.

use std::time::Duration;

use crate::core::{
    BACKOFF_TIME, DEFAULT_MTU, DEFAULT_PROTOCOL_VERSION, ECHO_TIMEOUT, GimdowError,
    LOCK_CONFIRM_TIMEOUT, MIN_MTU, RESPONSE_WAIT_TIMEOUT, SETTLE_DELAY, UNLOCK_CONFIRM_TIMEOUT,
};

/// Configuration for a [`GimdowDevice`](super::GimdowDevice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Bytes per written chunk.
    pub mtu: usize,

    /// Protocol version announced in outbound chunk 0 until the device
    /// reports its own.
    pub protocol_version: u8,

    /// How long an awaited request waits for its response.
    pub response_timeout: Duration,

    /// Delay before retrying after a bus error or a failed reconnect.
    pub backoff: Duration,

    /// How long the lock sequencer waits for a command echo.
    pub echo_timeout: Duration,

    /// How long the lock sequencer waits for the unlocked state.
    pub unlock_confirm_timeout: Duration,

    /// Settle delay after the second unlock.
    pub settle_delay: Duration,

    /// How long the lock sequencer waits for the locked state.
    pub lock_confirm_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            response_timeout: RESPONSE_WAIT_TIMEOUT,
            backoff: BACKOFF_TIME,
            echo_timeout: ECHO_TIMEOUT,
            unlock_confirm_timeout: UNLOCK_CONFIRM_TIMEOUT,
            settle_delay: SETTLE_DELAY,
            lock_confirm_timeout: LOCK_CONFIRM_TIMEOUT,
        }
    }
}

impl DeviceConfig {
    /// Create a builder starting from the defaults.
    pub fn builder() -> DeviceConfigBuilder {
        DeviceConfigBuilder::new()
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<(), GimdowError> {
        if self.mtu < MIN_MTU {
            return Err(GimdowError::Config(format!(
                "mtu {} is below the minimum of {MIN_MTU}",
                self.mtu
            )));
        }
        if self.protocol_version > 0x0F {
            return Err(GimdowError::Config(format!(
                "protocol version {} does not fit in four bits",
                self.protocol_version
            )));
        }
        Ok(())
    }
}

/// Builder for [`DeviceConfig`].
#[derive(Debug, Default)]
pub struct DeviceConfigBuilder {
    config: DeviceConfig,
}

impl DeviceConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk size.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the initial protocol version.
    pub fn protocol_version(mut self, version: u8) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Set the response timeout.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Set the retry backoff.
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Set the echo timeout.
    pub fn echo_timeout(mut self, timeout: Duration) -> Self {
        self.config.echo_timeout = timeout;
        self
    }

    /// Set the unlock confirmation timeout.
    pub fn unlock_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.config.unlock_confirm_timeout = timeout;
        self
    }

    /// Set the settle delay.
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.settle_delay = delay;
        self
    }

    /// Set the lock confirmation timeout.
    pub fn lock_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_confirm_timeout = timeout;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<DeviceConfig, GimdowError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
