//! Link configuration.
use std::time::Duration;

use anyhow::{bail, Result};

use crate::Format;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Q.921 with SAPI/TEI addressing.
    Lapd,
    /// Single octet address, no TEI management.
    Lapb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Network,
}

/// What to do when the peer never answers our polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollFailure {
    /// Re-establish the link with SABM(E).
    Reestablish,
    /// Drop to disconnected and tell layer 3.
    Release,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub variant: Variant,
    pub role: Role,
    pub sapi: u8,
    /// Use this TEI instead of asking the network for one.
    pub fixed_tei: Option<u8>,
    /// Modulo 128 sequence numbers.
    pub ext: bool,
    /// k, max outstanding I frames.
    pub window: u8,
    pub n200: u8,
    /// Max octets in an information field.
    pub n201: usize,
    pub t200: Duration,
    pub t203: Duration,
    pub t202: Duration,
    pub n202: u8,
    /// Identity verify attempts.
    pub n202_verify: u8,
    pub poll_failure: PollFailure,
    /// Trace every dispatched event.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            variant: Variant::Lapd,
            role: Role::User,
            sapi: 0,
            fixed_tei: None,
            ext: true,
            window: 1,
            n200: 3,
            n201: 260,
            t200: Duration::from_millis(1000),
            t203: Duration::from_millis(10000),
            t202: Duration::from_millis(2000),
            n202: 3,
            n202_verify: 2,
            poll_failure: PollFailure::Reestablish,
            debug: true,
        }
    }
}

impl Config {
    /// Basic mode LAPB, as used on X.25 lines.
    #[must_use]
    pub fn lapb() -> Self {
        Self {
            variant: Variant::Lapb,
            ext: false,
            window: 7,
            n200: 4,
            n201: 2048,
            t203: Duration::from_millis(5000),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub fn with_sapi(mut self, sapi: u8) -> Self {
        self.sapi = sapi;
        self
    }

    #[must_use]
    pub fn with_fixed_tei(mut self, tei: u8) -> Self {
        self.fixed_tei = Some(tei);
        self
    }

    #[must_use]
    pub fn with_ext(mut self, ext: bool) -> Self {
        self.ext = ext;
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: u8) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_t200(mut self, t200: Duration) -> Self {
        self.t200 = t200;
        self
    }

    #[must_use]
    pub fn with_poll_failure(mut self, poll_failure: PollFailure) -> Self {
        self.poll_failure = poll_failure;
        self
    }

    #[must_use]
    pub fn format(&self) -> Format {
        Format {
            lapb: self.variant == Variant::Lapb,
            ext: self.ext,
        }
    }

    /// The TEI this link uses without asking the network, if any.
    #[must_use]
    pub fn static_tei(&self) -> Option<u8> {
        match self.variant {
            Variant::Lapb => Some(0),
            Variant::Lapd => self.fixed_tei,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sapi > 63 {
            bail!("SAPI {} out of range", self.sapi);
        }
        if let Some(tei) = self.fixed_tei {
            if tei >= crate::GROUP_TEI {
                bail!("fixed TEI {tei} out of range");
            }
        }
        let modulus = self.format().modulus();
        if self.window == 0 || self.window >= modulus {
            bail!("window {} must be 1..{}", self.window, modulus - 1);
        }
        if self.n200 == 0 || self.n202 == 0 || self.n202_verify == 0 {
            bail!("retry counts must be at least 1");
        }
        if self.n201 == 0 {
            bail!("N201 must be at least 1");
        }
        if self.t200.is_zero() || self.t203.is_zero() || self.t202.is_zero() {
            bail!("timers must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        Config::default().validate()?;
        Config::lapb().validate()?;
        assert_eq!(Config::lapb().static_tei(), Some(0));
        assert_eq!(Config::default().static_tei(), None);
        assert_eq!(Config::default().with_fixed_tei(5).static_tei(), Some(5));
        Ok(())
    }

    #[test]
    fn window_bounded_by_modulus() {
        assert!(Config::lapb().with_window(8).validate().is_err());
        assert!(Config::default().with_window(127).validate().is_ok());
        assert!(Config::default().with_window(0).validate().is_err());
        assert!(Config::default().with_sapi(64).validate().is_err());
        assert!(Config::default().with_fixed_tei(127).validate().is_err());
        assert!(Config::default()
            .with_t200(Duration::ZERO)
            .validate()
            .is_err());
    }
}
