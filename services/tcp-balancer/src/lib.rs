pub mod config;
pub mod error;
pub mod proxy;

pub use config::{Config, Overrides};
pub use error::{ConfigError, SessionError};
pub use proxy::{
    Backend, BackendPool, HealthCheckConfig, HealthMonitor, HealthState, Listener,
    ListenerConfig, ListenerStats, Proxy, RelayStats, SessionTracker, Transition,
};
