//! Channel naming
//!
//! Plain routes are named `{writer}_{reader}`. Sharded groups share one
//! channel: fan-in routes collapse onto `MULTI_{reader}`, fan-out routes
//! onto `{writer}_MULTI`.

use shmq_config::limits::names::MULTI;
use shmq_config::Sharding;

pub fn channel_name(writer: &str, reader: &str, sharding: Sharding) -> String {
    match sharding {
        Sharding::None => format!("{}_{}", writer, reader),
        Sharding::FanIn => format!("{}_{}", MULTI, reader),
        Sharding::FanOut => format!("{}_{}", writer, MULTI),
    }
}

/// Inbound command channel of a process instance
pub fn command_inbox(process: &str, instance: u32) -> String {
    format!("{}_{}", process, instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(channel_name("P", "Q", Sharding::None), "P_Q");
        assert_eq!(channel_name("P", "Q", Sharding::FanIn), "MULTI_Q");
        assert_eq!(channel_name("P", "Q", Sharding::FanOut), "P_MULTI");
        assert_eq!(command_inbox("Q", 3), "Q_3");
    }
}
