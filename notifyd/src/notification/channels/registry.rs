//! Name-to-driver map, written once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ChannelDriver, Capabilities};
use crate::{Error, Result};

/// Capability filter for listing drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFilter {
    All,
    Robot,
    /// Personal channels a receiver can enable.
    PersonalValid,
}

impl DriverFilter {
    fn accepts(&self, caps: Capabilities) -> bool {
        match self {
            Self::All => true,
            Self::Robot => caps.is_robot,
            Self::PersonalValid => caps.is_personal && !caps.is_robot,
        }
    }
}

#[derive(Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<&'static str, Arc<dyn ChannelDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver; a later registration under the same name replaces it.
    pub fn register(&mut self, driver: Arc<dyn ChannelDriver>) -> &mut Self {
        self.drivers.insert(driver.channel_type(), driver);
        self
    }

    pub fn get(&self, channel: &str) -> Result<Arc<dyn ChannelDriver>> {
        self.drivers
            .get(channel)
            .cloned()
            .ok_or_else(|| Error::input_invalid(format!("unknown channel '{}'", channel)))
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.drivers.contains_key(channel)
    }

    pub fn capabilities(&self, channel: &str) -> Option<Capabilities> {
        self.drivers.get(channel).map(|d| d.capabilities())
    }

    /// Sorted channel names passing `filter`.
    pub fn names(&self, filter: DriverFilter) -> Vec<&'static str> {
        self.drivers
            .iter()
            .filter(|(_, d)| filter.accepts(d.capabilities()))
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::super::SendParams;
    use super::*;

    struct Fake(&'static str, Capabilities);

    #[async_trait]
    impl ChannelDriver for Fake {
        fn channel_type(&self) -> &'static str {
            self.0
        }

        fn capabilities(&self) -> Capabilities {
            self.1
        }

        async fn send(&self, _params: &SendParams) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry
            .register(Arc::new(Fake(
                "email",
                Capabilities {
                    is_personal: true,
                    ..Default::default()
                },
            )))
            .register(Arc::new(Fake(
                "webhook",
                Capabilities {
                    is_robot: true,
                    ..Default::default()
                },
            )));
        registry
    }

    #[test]
    fn test_unknown_channel_is_input_invalid() {
        let registry = registry();
        assert!(registry.get("email").is_ok());
        assert!(matches!(registry.get("unknown"), Err(Error::InputInvalid(_))));
    }

    #[test]
    fn test_filtered_names() {
        let registry = registry();
        assert_eq!(registry.names(DriverFilter::All), vec!["email", "webhook"]);
        assert_eq!(registry.names(DriverFilter::Robot), vec!["webhook"]);
        assert_eq!(registry.names(DriverFilter::PersonalValid), vec!["email"]);
    }
}
