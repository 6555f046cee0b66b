//! Configuration management
//!
//! Neighbor Discovery and Neighbor Unreachability Detection tunables, plus
//! the stack's logging knobs. A TOML-facing layer (`StackConfigFile`) holds
//! raw user values (durations in seconds); the runtime types carry validated
//! `Duration`s. Invalid values are clamped to defaults rather than rejected.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default number of Neighbor Solicitations sent during DAD (RFC 4862)
pub const DEFAULT_DUP_ADDR_DETECT_TRANSMITS: u8 = 1;
/// Default interval between DAD probes (RFC 4861 RetransTimer)
pub const DEFAULT_RETRANSMIT_TIMER: Duration = Duration::from_secs(1);
/// Maximum Router Solicitations sent before giving up (RFC 4861)
pub const DEFAULT_MAX_RTR_SOLICITATIONS: u8 = 3;
/// Interval between Router Solicitations (RFC 4861)
pub const DEFAULT_RTR_SOLICITATION_INTERVAL: Duration = Duration::from_secs(4);
/// Delay before the first Router Solicitation (RFC 4861)
pub const DEFAULT_MAX_RTR_SOLICITATION_DELAY: Duration = Duration::from_secs(1);
/// Default cap on a temporary address's valid lifetime (RFC 4941)
pub const DEFAULT_MAX_TEMP_ADDR_VALID_LIFETIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Default cap on a temporary address's preferred lifetime (RFC 4941)
pub const DEFAULT_MAX_TEMP_ADDR_PREFERRED_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
/// How far before deprecation a replacement temporary address is generated
pub const DEFAULT_REGEN_ADVANCE_DURATION: Duration = Duration::from_secs(5);

/// Smallest retransmit timer we accept before falling back to the default
const MINIMUM_RETRANSMIT_TIMER: Duration = Duration::from_millis(1);

/// Per-interface Neighbor Discovery configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdpConfigurations {
    /// Number of NS probes sent while an address is tentative. Zero disables
    /// DAD; addresses become permanent immediately.
    pub dup_addr_detect_transmits: u8,
    /// Interval between DAD probes.
    pub retransmit_timer: Duration,
    /// Whether Router Advertisements are processed at all.
    pub handle_ras: bool,
    /// Whether default routers are discovered from RAs.
    pub discover_default_routers: bool,
    /// Whether on-link prefixes are discovered from RAs.
    pub discover_on_link_prefixes: bool,
    /// Whether global addresses are auto-generated via SLAAC.
    pub auto_gen_global_addresses: bool,
    /// Number of Router Solicitations sent when becoming a host.
    pub max_rtr_solicitations: u8,
    /// Interval between Router Solicitations.
    pub rtr_solicitation_interval: Duration,
    /// Delay before the first Router Solicitation.
    pub max_rtr_solicitation_delay: Duration,
    /// Whether temporary (privacy) addresses accompany stable SLAAC ones.
    pub auto_gen_temp_global_addresses: bool,
    /// Cap on a temporary address's valid lifetime.
    pub max_temp_addr_valid_lifetime: Duration,
    /// Cap on a temporary address's preferred lifetime.
    pub max_temp_addr_preferred_lifetime: Duration,
    /// Lead time for regenerating a temporary address before deprecation.
    pub regen_advance_duration: Duration,
}

impl Default for NdpConfigurations {
    fn default() -> Self {
        Self {
            dup_addr_detect_transmits: DEFAULT_DUP_ADDR_DETECT_TRANSMITS,
            retransmit_timer: DEFAULT_RETRANSMIT_TIMER,
            handle_ras: true,
            discover_default_routers: true,
            discover_on_link_prefixes: true,
            auto_gen_global_addresses: true,
            max_rtr_solicitations: DEFAULT_MAX_RTR_SOLICITATIONS,
            rtr_solicitation_interval: DEFAULT_RTR_SOLICITATION_INTERVAL,
            max_rtr_solicitation_delay: DEFAULT_MAX_RTR_SOLICITATION_DELAY,
            auto_gen_temp_global_addresses: false,
            max_temp_addr_valid_lifetime: DEFAULT_MAX_TEMP_ADDR_VALID_LIFETIME,
            max_temp_addr_preferred_lifetime: DEFAULT_MAX_TEMP_ADDR_PREFERRED_LIFETIME,
            regen_advance_duration: DEFAULT_REGEN_ADVANCE_DURATION,
        }
    }
}

impl NdpConfigurations {
    /// Replace invalid values with their defaults.
    pub fn validate(&mut self) {
        if self.retransmit_timer < MINIMUM_RETRANSMIT_TIMER {
            self.retransmit_timer = DEFAULT_RETRANSMIT_TIMER;
        }
        if self.rtr_solicitation_interval.is_zero() {
            self.rtr_solicitation_interval = DEFAULT_RTR_SOLICITATION_INTERVAL;
        }
        if self.max_temp_addr_valid_lifetime.is_zero() {
            self.max_temp_addr_valid_lifetime = DEFAULT_MAX_TEMP_ADDR_VALID_LIFETIME;
        }
        if self.max_temp_addr_preferred_lifetime > self.max_temp_addr_valid_lifetime {
            self.max_temp_addr_preferred_lifetime = self.max_temp_addr_valid_lifetime;
        }
    }
}

/// Neighbor Unreachability Detection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NudConfigurations {
    /// Base of the random reachable-time window (RFC 4861 BaseReachableTime).
    pub base_reachable_time: Duration,
    /// Interval between reachability probes.
    pub retransmit_timer: Duration,
    /// Multicast solicitations sent before resolution fails.
    pub max_multicast_probes: u8,
    /// Unicast solicitations sent before an entry goes stale.
    pub max_unicast_probes: u8,
}

impl Default for NudConfigurations {
    fn default() -> Self {
        Self {
            base_reachable_time: Duration::from_secs(30),
            retransmit_timer: Duration::from_secs(1),
            max_multicast_probes: 3,
            max_unicast_probes: 3,
        }
    }
}

impl NudConfigurations {
    /// Replace invalid values with their defaults.
    pub fn reset_invalid_fields(&mut self) {
        let defaults = Self::default();
        if self.base_reachable_time.is_zero() {
            self.base_reachable_time = defaults.base_reachable_time;
        }
        if self.retransmit_timer.is_zero() {
            self.retransmit_timer = defaults.retransmit_timer;
        }
        if self.max_multicast_probes == 0 {
            self.max_multicast_probes = defaults.max_multicast_probes;
        }
        if self.max_unicast_probes == 0 {
            self.max_unicast_probes = defaults.max_unicast_probes;
        }
    }
}

/// Trace output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, one event per line
    #[default]
    Full,
    /// Abbreviated fields
    Compact,
    /// One JSON object per event
    Json,
}

/// Logging configuration of the stack.
///
/// The filter holds `tracing` directives. Per-packet and per-timer events
/// (ingress dispatch, DAD probes, RA processing) sit at debug/trace under
/// the `rustack::stack` targets, so the dataplane can be turned up
/// selectively, e.g. `info,rustack::stack::ndp=trace`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfigurations {
    pub filter: String,
    pub format: LogFormat,
}

/// Default filter: administrative events only, dataplane quiet.
pub const DEFAULT_LOG_FILTER: &str = "info";

impl Default for LoggingConfigurations {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            format: LogFormat::Full,
        }
    }
}

impl LoggingConfigurations {
    /// Replace invalid values with their defaults.
    pub fn validate(&mut self) {
        if self.filter.trim().is_empty() {
            self.filter = DEFAULT_LOG_FILTER.to_string();
        }
    }
}

/// User-facing configuration file ([ndp], [nud] and [logging] tables,
/// durations in seconds, everything optional).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StackConfigFile {
    #[serde(default)]
    pub ndp: NdpConfigFile,
    #[serde(default)]
    pub nud: NudConfigFile,
    #[serde(default)]
    pub logging: LoggingConfigFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NdpConfigFile {
    pub dup_addr_detect_transmits: Option<u8>,
    pub retransmit_timer_secs: Option<u64>,
    pub handle_ras: Option<bool>,
    pub discover_default_routers: Option<bool>,
    pub discover_on_link_prefixes: Option<bool>,
    pub auto_gen_global_addresses: Option<bool>,
    pub max_rtr_solicitations: Option<u8>,
    pub rtr_solicitation_interval_secs: Option<u64>,
    pub max_rtr_solicitation_delay_secs: Option<u64>,
    pub auto_gen_temp_global_addresses: Option<bool>,
    pub max_temp_addr_valid_lifetime_secs: Option<u64>,
    pub max_temp_addr_preferred_lifetime_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NudConfigFile {
    pub base_reachable_time_secs: Option<u64>,
    pub retransmit_timer_secs: Option<u64>,
    pub max_multicast_probes: Option<u8>,
    pub max_unicast_probes: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfigFile {
    pub filter: Option<String>,
    pub format: Option<LogFormat>,
}

impl LoggingConfigFile {
    /// Fill in defaults and validate into runtime configuration.
    pub fn into_configurations(self) -> LoggingConfigurations {
        let defaults = LoggingConfigurations::default();
        let mut c = LoggingConfigurations {
            filter: self.filter.unwrap_or(defaults.filter),
            format: self.format.unwrap_or(defaults.format),
        };
        c.validate();
        c
    }
}

impl NdpConfigFile {
    /// Fill in defaults and validate into runtime configuration.
    pub fn into_configurations(self) -> NdpConfigurations {
        let defaults = NdpConfigurations::default();
        let mut c = NdpConfigurations {
            dup_addr_detect_transmits: self
                .dup_addr_detect_transmits
                .unwrap_or(defaults.dup_addr_detect_transmits),
            retransmit_timer: secs_or(self.retransmit_timer_secs, defaults.retransmit_timer),
            handle_ras: self.handle_ras.unwrap_or(defaults.handle_ras),
            discover_default_routers: self
                .discover_default_routers
                .unwrap_or(defaults.discover_default_routers),
            discover_on_link_prefixes: self
                .discover_on_link_prefixes
                .unwrap_or(defaults.discover_on_link_prefixes),
            auto_gen_global_addresses: self
                .auto_gen_global_addresses
                .unwrap_or(defaults.auto_gen_global_addresses),
            max_rtr_solicitations: self
                .max_rtr_solicitations
                .unwrap_or(defaults.max_rtr_solicitations),
            rtr_solicitation_interval: secs_or(
                self.rtr_solicitation_interval_secs,
                defaults.rtr_solicitation_interval,
            ),
            max_rtr_solicitation_delay: secs_or(
                self.max_rtr_solicitation_delay_secs,
                defaults.max_rtr_solicitation_delay,
            ),
            auto_gen_temp_global_addresses: self
                .auto_gen_temp_global_addresses
                .unwrap_or(defaults.auto_gen_temp_global_addresses),
            max_temp_addr_valid_lifetime: secs_or(
                self.max_temp_addr_valid_lifetime_secs,
                defaults.max_temp_addr_valid_lifetime,
            ),
            max_temp_addr_preferred_lifetime: secs_or(
                self.max_temp_addr_preferred_lifetime_secs,
                defaults.max_temp_addr_preferred_lifetime,
            ),
            regen_advance_duration: defaults.regen_advance_duration,
        };
        c.validate();
        c
    }
}

impl NudConfigFile {
    /// Fill in defaults and validate into runtime configuration.
    pub fn into_configurations(self) -> NudConfigurations {
        let defaults = NudConfigurations::default();
        let mut c = NudConfigurations {
            base_reachable_time: secs_or(
                self.base_reachable_time_secs,
                defaults.base_reachable_time,
            ),
            retransmit_timer: secs_or(self.retransmit_timer_secs, defaults.retransmit_timer),
            max_multicast_probes: self
                .max_multicast_probes
                .unwrap_or(defaults.max_multicast_probes),
            max_unicast_probes: self
                .max_unicast_probes
                .unwrap_or(defaults.max_unicast_probes),
        };
        c.reset_invalid_fields();
        c
    }
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

/// Load a configuration file from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<StackConfigFile> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: StackConfigFile =
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
    Ok(config)
}
