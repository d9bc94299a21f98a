// observe.rs - Logging context handed to each component
//
// main.rs installs env_logger once and builds the root Observer. Components
// receive an Observer in their constructor and log under its target instead
// of relying on a process-wide logger name.

#[derive(Debug, Clone)]
pub struct Observer {
    target: String,
    log_payloads: bool,
}

impl Observer {
    pub fn new(target: impl Into<String>, log_payloads: bool) -> Self {
        Self {
            target: target.into(),
            log_payloads,
        }
    }

    /// Child context for one component, e.g. `group_digest::retry`.
    pub fn scoped(&self, component: &str) -> Self {
        Self {
            target: format!("{}::{}", self.target, component),
            log_payloads: self.log_payloads,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether request/response bodies of model calls are promoted to info.
    pub fn log_payloads(&self) -> bool {
        self.log_payloads
    }

    /// Model payloads always go to the debug log; LOG_MODEL_PAYLOADS=true
    /// makes them visible at info as well.
    pub fn payload_level(&self) -> log::Level {
        if self.log_payloads {
            log::Level::Info
        } else {
            log::Level::Debug
        }
    }

    pub fn payload(&self, direction: &str, body: &str) {
        log::log!(target: self.target(), self.payload_level(), "📦 {}:\n{}", direction, body);
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new("group_digest", false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_targets_nest() {
        let root = Observer::new("group_digest", true);
        let retry = root.scoped("retry");
        assert_eq!(retry.target(), "group_digest::retry");
        assert_eq!(retry.scoped("vision").target(), "group_digest::retry::vision");
        assert!(retry.log_payloads());
    }

    #[test]
    fn test_payloads_log_at_debug_unless_promoted() {
        assert_eq!(Observer::default().payload_level(), log::Level::Debug);
        assert_eq!(Observer::new("group_digest", true).scoped("lm").payload_level(), log::Level::Info);
    }
}
