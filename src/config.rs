use std::env;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use log::{info, warn};

use crate::engine::{EngineConfig, NarrowPhase, OccupancyMode};
use crate::model::Layout;
use crate::optimizer::AnnealConfig;
use crate::types::Vec3;

/// Complete application configuration, loaded from environment variables or default values.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub engine: EngineConfig,
    pub anneal: AnnealConfig,
    pub layout: Layout,
}

impl AppConfig {
    /// Creates a configuration from the currently available environment variables.
    pub fn from_env() -> Self {
        Self {
            api: ApiConfig::from_env(),
            engine: engine_from_env(),
            anneal: anneal_from_env(),
            layout: layout_from_env(),
        }
    }
}

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    bind_ip: IpAddr,
    display_host: String,
    port: u16,
}

impl ApiConfig {
    const DEFAULT_HOST: &'static str = "0.0.0.0";
    const DEFAULT_PORT: u16 = 8080;

    fn from_env() -> Self {
        let host_value = env_string("STOW_IT_API_HOST").unwrap_or_else(|| Self::DEFAULT_HOST.to_string());
        let (bind_ip, effective_host) = match host_value.parse::<IpAddr>() {
            Ok(ip) => (ip, host_value),
            Err(err) => {
                warn!(
                    "Could not parse STOW_IT_API_HOST ('{}'): {}. Using {}.",
                    host_value,
                    err,
                    Self::DEFAULT_HOST
                );
                (IpAddr::V4(Ipv4Addr::UNSPECIFIED), Self::DEFAULT_HOST.to_string())
            }
        };

        let port = match env_string("STOW_IT_API_PORT") {
            Some(raw) => match raw.parse::<u16>() {
                Ok(value) if value != 0 => value,
                Ok(_) => {
                    warn!("STOW_IT_API_PORT must not be 0. Using {}.", Self::DEFAULT_PORT);
                    Self::DEFAULT_PORT
                }
                Err(err) => {
                    warn!(
                        "Could not parse STOW_IT_API_PORT ('{}'): {}. Using {}.",
                        raw,
                        err,
                        Self::DEFAULT_PORT
                    );
                    Self::DEFAULT_PORT
                }
            },
            None => Self::DEFAULT_PORT,
        };

        Self {
            bind_ip,
            display_host: effective_host,
            port,
        }
    }

    /// Socket address to bind the server to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Visible hostname for logging and hints.
    pub fn display_host(&self) -> &str {
        &self.display_host
    }

    /// Configured port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Indicates whether binding to all interfaces.
    pub fn binds_to_all_interfaces(&self) -> bool {
        match self.bind_ip {
            IpAddr::V4(addr) => addr == Ipv4Addr::UNSPECIFIED,
            IpAddr::V6(addr) => addr == Ipv6Addr::UNSPECIFIED,
        }
    }

    /// Checks whether the hostname matches the default value.
    pub fn uses_default_host(&self) -> bool {
        self.display_host == Self::DEFAULT_HOST
    }
}

const CONTACT_EPSILON_VAR: &str = "STOW_IT_CONTACT_EPSILON";
const REST_STEP_VAR: &str = "STOW_IT_REST_STEP";
const RESOLVER_ITERATIONS_VAR: &str = "STOW_IT_RESOLVER_ITERATIONS";
const RESOLVER_OVERSHOOT_VAR: &str = "STOW_IT_RESOLVER_OVERSHOOT";
const NARROW_PHASE_VAR: &str = "STOW_IT_NARROW_PHASE";
const QUALITY_RESOLUTION_VAR: &str = "STOW_IT_QUALITY_RESOLUTION";
const FITNESS_RESOLUTION_VAR: &str = "STOW_IT_FITNESS_RESOLUTION";
const QUALITY_OCCUPANCY_VAR: &str = "STOW_IT_QUALITY_OCCUPANCY";
const FITNESS_OCCUPANCY_VAR: &str = "STOW_IT_FITNESS_OCCUPANCY";
const EMPTY_WEIGHT_VAR: &str = "STOW_IT_EMPTY_WEIGHT";
const FRAGMENT_WEIGHT_VAR: &str = "STOW_IT_FRAGMENT_WEIGHT";
const STAGING_RING_CAP_VAR: &str = "STOW_IT_STAGING_RING_CAP";
const STAGING_STACKING_VAR: &str = "STOW_IT_STAGING_STACKING";

fn engine_from_env() -> EngineConfig {
    let contact_epsilon = load_f64_with_warning(
        CONTACT_EPSILON_VAR,
        EngineConfig::DEFAULT_CONTACT_EPSILON,
        |value| value >= 0.0,
        "must not be negative",
        "Adjusted contact margin changes which touching objects count as overlapping",
    );
    let rest_step = load_f64_with_warning(
        REST_STEP_VAR,
        EngineConfig::DEFAULT_REST_STEP,
        |value| value > 0.0,
        "must be greater than 0",
        "Adjusted resting step changes how tightly objects settle",
    );
    let resolver_overshoot = load_f64_with_warning(
        RESOLVER_OVERSHOOT_VAR,
        EngineConfig::DEFAULT_RESOLVER_OVERSHOOT,
        |value| value >= 1.0,
        "must be at least 1",
        "Adjusted resolver overshoot leaves wider gaps after separation",
    );
    let empty_weight = load_f64_with_warning(
        EMPTY_WEIGHT_VAR,
        EngineConfig::DEFAULT_EMPTY_WEIGHT,
        |value| value >= 0.0,
        "must not be negative",
        "Adjusted energy weights change what the optimizer favors",
    );
    let fragment_weight = load_f64_with_warning(
        FRAGMENT_WEIGHT_VAR,
        EngineConfig::DEFAULT_FRAGMENT_WEIGHT,
        |value| value >= 0.0,
        "must not be negative",
        "Adjusted energy weights change what the optimizer favors",
    );

    let resolver_iterations = load_parsed(
        RESOLVER_ITERATIONS_VAR,
        EngineConfig::DEFAULT_RESOLVER_ITERATIONS,
        |value| *value > 0,
        "must be greater than 0",
    );
    let quality_resolution = load_parsed(
        QUALITY_RESOLUTION_VAR,
        EngineConfig::DEFAULT_QUALITY_RESOLUTION,
        |value| (1..=128).contains(value),
        "must be between 1 and 128",
    );
    let fitness_resolution = load_parsed(
        FITNESS_RESOLUTION_VAR,
        EngineConfig::DEFAULT_FITNESS_RESOLUTION,
        |value| (1..=128).contains(value),
        "must be between 1 and 128",
    );
    let staging_ring_cap = load_parsed(
        STAGING_RING_CAP_VAR,
        EngineConfig::DEFAULT_STAGING_RING_CAP,
        |value| *value > 0,
        "must be greater than 0",
    );
    let narrow_phase = load_parsed::<NarrowPhase>(NARROW_PHASE_VAR, EngineConfig::DEFAULT_NARROW_PHASE, |_| true, "");
    let quality_occupancy = load_parsed::<OccupancyMode>(
        QUALITY_OCCUPANCY_VAR,
        EngineConfig::DEFAULT_QUALITY_OCCUPANCY,
        |_| true,
        "",
    );
    let fitness_occupancy = load_parsed::<OccupancyMode>(
        FITNESS_OCCUPANCY_VAR,
        EngineConfig::DEFAULT_FITNESS_OCCUPANCY,
        |_| true,
        "",
    );
    let staging_stacking = env_string(STAGING_STACKING_VAR)
        .and_then(|raw| parse_bool(&raw, STAGING_STACKING_VAR))
        .unwrap_or(EngineConfig::DEFAULT_STAGING_STACKING);

    EngineConfig::builder()
        .contact_epsilon(contact_epsilon)
        .rest_step(rest_step)
        .resolver_iterations(resolver_iterations)
        .resolver_overshoot(resolver_overshoot)
        .narrow_phase(narrow_phase)
        .quality_resolution(quality_resolution)
        .fitness_resolution(fitness_resolution)
        .quality_occupancy(quality_occupancy)
        .fitness_occupancy(fitness_occupancy)
        .energy_weights(empty_weight, fragment_weight)
        .staging_ring_cap(staging_ring_cap)
        .staging_stacking(staging_stacking)
        .build()
}

const ANNEAL_STEPS_VAR: &str = "STOW_IT_ANNEAL_STEPS";
const ANNEAL_TEMPERATURE_VAR: &str = "STOW_IT_ANNEAL_INITIAL_TEMPERATURE";
const ANNEAL_COOLING_VAR: &str = "STOW_IT_ANNEAL_COOLING_RATE";
const ANNEAL_BASE_STEP_VAR: &str = "STOW_IT_ANNEAL_BASE_STEP";
const ANNEAL_YAW_JITTER_VAR: &str = "STOW_IT_ANNEAL_YAW_JITTER";
const ANNEAL_ATTEMPTS_VAR: &str = "STOW_IT_ANNEAL_ATTEMPTS";
const ANNEAL_SLICE_MS_VAR: &str = "STOW_IT_ANNEAL_SLICE_MS";
const ANNEAL_SEED_VAR: &str = "STOW_IT_ANNEAL_SEED";

fn anneal_from_env() -> AnnealConfig {
    let steps = load_parsed(ANNEAL_STEPS_VAR, AnnealConfig::DEFAULT_STEPS, |_| true, "");
    let initial_temperature = load_f64_with_warning(
        ANNEAL_TEMPERATURE_VAR,
        AnnealConfig::DEFAULT_INITIAL_TEMPERATURE,
        |value| value > 0.0,
        "must be greater than 0",
        "Adjusted start temperature changes how many uphill moves are accepted",
    );
    let cooling_rate = load_f64_with_warning(
        ANNEAL_COOLING_VAR,
        AnnealConfig::DEFAULT_COOLING_RATE,
        |value| value > 0.0 && value < 1.0,
        "must be between 0 and 1 (exclusive)",
        "Adjusted cooling rate changes the annealing schedule",
    );
    let base_step = load_f64_with_warning(
        ANNEAL_BASE_STEP_VAR,
        AnnealConfig::DEFAULT_BASE_STEP,
        |value| value > 0.0,
        "must be greater than 0",
        "Adjusted perturbation step changes how far objects jump",
    );
    let yaw_jitter = load_f64_with_warning(
        ANNEAL_YAW_JITTER_VAR,
        AnnealConfig::DEFAULT_YAW_JITTER,
        |value| value >= 0.0,
        "must not be negative",
        "Adjusted yaw jitter changes how much objects turn",
    );
    let attempts = load_parsed(
        ANNEAL_ATTEMPTS_VAR,
        AnnealConfig::DEFAULT_PERTURBATION_ATTEMPTS,
        |value| *value > 0,
        "must be greater than 0",
    );
    let slice_ms = load_parsed(
        ANNEAL_SLICE_MS_VAR,
        AnnealConfig::DEFAULT_SLICE_BUDGET_MS,
        |value| *value > 0,
        "must be greater than 0",
    );
    let seed = env_string(ANNEAL_SEED_VAR).and_then(|raw| match raw.parse::<u64>() {
        Ok(seed) => Some(seed),
        Err(err) => {
            warn!("Could not parse {} ('{}'): {}. Using a random seed.", ANNEAL_SEED_VAR, raw, err);
            None
        }
    });

    AnnealConfig::builder()
        .steps(steps)
        .initial_temperature(initial_temperature)
        .cooling_rate(cooling_rate)
        .base_step(base_step)
        .yaw_jitter(yaw_jitter)
        .perturbation_attempts(attempts)
        .slice_budget(Duration::from_millis(slice_ms))
        .seed(seed)
        .build()
}

const CONTAINER_SIZE_VAR: &str = "STOW_IT_CONTAINER_SIZE";
const STAGING_SIZE_VAR: &str = "STOW_IT_STAGING_SIZE";
const STAGING_GAP_VAR: &str = "STOW_IT_STAGING_GAP";

const DEFAULT_CONTAINER_SIZE: Vec3 = Vec3::splat(110.0);
const DEFAULT_STAGING_SIZE: Vec3 = Vec3::splat(220.0);
const DEFAULT_STAGING_GAP: f64 = 20.0;

fn layout_from_env() -> Layout {
    let container = load_size(CONTAINER_SIZE_VAR, DEFAULT_CONTAINER_SIZE);
    let staging = load_size(STAGING_SIZE_VAR, DEFAULT_STAGING_SIZE);
    let gap = load_f64_with_warning(
        STAGING_GAP_VAR,
        DEFAULT_STAGING_GAP,
        |value| value >= 0.0,
        "must not be negative",
        "Adjusted staging gap moves the staging pad",
    );
    Layout::new(container, staging, gap)
}

fn load_size(var_name: &str, default: Vec3) -> Vec3 {
    match env_string(var_name) {
        Some(raw) => match parse_size(&raw) {
            Some(size) => size,
            None => {
                warn!(
                    "{} contains invalid value '{}': expected three positive numbers 'w,h,d'. Using {:?}.",
                    var_name,
                    raw,
                    default.as_tuple()
                );
                default
            }
        },
        None => default,
    }
}

/// Parses `"w,h,d"` (or `"w x h x d"`) into a positive size.
fn parse_size(raw: &str) -> Option<Vec3> {
    let parts: Vec<f64> = raw
        .split([',', 'x', 'X'])
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [w, h, d] => {
            let size = Vec3::new(*w, *h, *d);
            (size.is_finite() && size.is_valid_dimension()).then_some(size)
        }
        _ => None,
    }
}

fn env_string(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            }
        }
        Err(env::VarError::NotPresent) => None,
        Err(err) => {
            warn!("Access to {} failed: {}. Using default value.", name, err);
            None
        }
    }
}

fn parse_bool(raw: &str, var_name: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        other => {
            warn!(
                "Could not interpret {} ('{}') as boolean value. Using default value.",
                var_name, other
            );
            None
        }
    }
}

fn load_f64_with_warning(
    var_name: &str,
    default: f64,
    validator: impl Fn(f64) -> bool,
    invalid_hint: &str,
    warning: &str,
) -> f64 {
    match env_string(var_name) {
        Some(raw) => match raw.parse::<f64>() {
            Ok(value) => {
                if !value.is_finite() || !validator(value) {
                    warn!(
                        "{} contains invalid value '{}': {}. Using {}.",
                        var_name, raw, invalid_hint, default
                    );
                    default
                } else {
                    let tolerance = (default.abs().max(1.0)) * 1e-9;
                    if (value - default).abs() > tolerance {
                        info!("{} ({} = {}).", warning, var_name, value);
                    }
                    value
                }
            }
            Err(err) => {
                warn!(
                    "Could not parse {} ('{}') as number: {}. Using {}.",
                    var_name, raw, err, default
                );
                default
            }
        },
        None => default,
    }
}

/// Loads any `FromStr` value, falling back to `default` on parse or
/// validation failure.
fn load_parsed<T>(var_name: &str, default: T, validator: impl Fn(&T) -> bool, invalid_hint: &str) -> T
where
    T: FromStr + Display + Copy,
    T::Err: Display,
{
    let Some(raw) = env_string(var_name) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) if validator(&value) => value,
        Ok(_) => {
            warn!(
                "{} contains invalid value '{}': {}. Using {}.",
                var_name, raw, invalid_hint, default
            );
            default
        }
        Err(err) => {
            warn!("Could not parse {} ('{}'): {}. Using {}.", var_name, raw, err, default);
            default
        }
    }
}
