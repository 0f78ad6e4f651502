use std::net::SocketAddr;
use std::time::Duration;

const HUB_BIND: &str = "DVR_HUB_BIND";

pub fn get_bind(default: SocketAddr) -> SocketAddr {
    let bind_from_env = std::env::var(HUB_BIND);
    bind_from_env.map_or(default, |res| res.parse().unwrap_or(default))
}

const HUB_TOKEN: &str = "DVR_HUB_TOKEN";

pub fn get_token(default: Option<String>) -> Option<String> {
    let token_from_env = std::env::var(HUB_TOKEN);
    token_from_env.ok().or(default)
}

/// Clamp a requested concurrency into `1..=max`
pub fn clamp_concurrency(requested: usize, max: usize) -> usize {
    requested.clamp(1, max.max(1))
}

pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Convert a std duration to a chrono one, saturating on overflow
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
