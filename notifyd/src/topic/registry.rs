//! Append-only registries mapping resource types and actions to bit positions.
//!
//! Topic bitmaps are persisted, so a name's bit must never move once
//! registered. Registration is idempotent; remapping is rejected.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::{Error, Result};

/// Built-in resource types, in bit order.
pub const BUILTIN_RESOURCES: &[&str] = &[
    "server",
    "scalinggroup",
    "scalingpolicy",
    "image",
    "disk",
    "snapshot",
    "instancesnapshot",
    "snapshotpolicy",
    "network",
    "eip",
    "secgroup",
    "loadbalancer",
    "loadbalanceracl",
    "loadbalancercertificate",
    "bucket",
    "dbinstance",
    "elasticcache",
    "scheduledtask",
    "baremetal",
    "vpc",
    "dns_zone",
    "natgateway",
    "webapp",
    "cdn_domain",
    "file_system",
    "waf",
    "kafka",
    "elasticsearch",
    "mongodb",
    "dns_recordset",
    "loadbalancerlistener",
    "loadbalancerbackendgroup",
    "host",
    "task",
    "cloudpods_component",
    "db_table_record",
    "user",
    "action_log",
    "account_status",
    "net",
    "service",
    "vm_integrity_check",
];

/// Built-in actions, in bit order.
pub const BUILTIN_ACTIONS: &[&str] = &[
    "create",
    "delete",
    "pending_delete",
    "update",
    "rebuild_root",
    "reset_password",
    "change_config",
    "expired_release",
    "execute",
    "change_ipaddr",
    "sync_status",
    "clean_data",
    "migrate",
    "create_backup_server",
    "delete_backup_server",
    "sync_create",
    "sync_update",
    "sync_delete",
    "offline",
    "panic",
    "exception",
    "checksum_test",
    "lock",
    "exceed_count",
    "sync_account_status",
    "password_expire_soon",
    "net_out_of_sync",
    "mysql_out_of_sync",
    "service_abnormal",
    "server_panicked",
];

#[derive(Default)]
struct Entries {
    by_name: HashMap<String, u32>,
    by_bit: BTreeMap<u32, String>,
}

/// One name-to-bit registry with a fixed capacity.
pub struct BitRegistry {
    kind: &'static str,
    capacity: u32,
    entries: RwLock<Entries>,
}

impl BitRegistry {
    pub fn new(kind: &'static str, capacity: u32) -> Self {
        Self {
            kind,
            capacity,
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Register `(name, bit)` pairs.
    ///
    /// The whole batch is validated before anything is inserted.
    pub fn register(&self, pairs: &[(&str, u32)]) -> Result<()> {
        let mut entries = self.entries.write();

        let mut staged: HashMap<&str, u32> = HashMap::new();
        let mut staged_bits: HashMap<u32, &str> = HashMap::new();
        for &(name, bit) in pairs {
            if name.is_empty() {
                return Err(Error::input_invalid(format!("empty {} name", self.kind)));
            }
            if bit >= self.capacity {
                return Err(Error::input_invalid(format!(
                    "{} bit {} exceeds capacity {}",
                    self.kind, bit, self.capacity
                )));
            }
            let existing_bit = entries
                .by_name
                .get(name)
                .copied()
                .or_else(|| staged.get(name).copied());
            if let Some(existing) = existing_bit
                && existing != bit
            {
                return Err(Error::input_invalid(format!(
                    "{} '{}' is already registered at bit {}, refusing to move it to {}",
                    self.kind, name, existing, bit
                )));
            }
            let existing_name = entries
                .by_bit
                .get(&bit)
                .map(String::as_str)
                .or_else(|| staged_bits.get(&bit).copied());
            if let Some(existing) = existing_name
                && existing != name
            {
                return Err(Error::input_invalid(format!(
                    "{} bit {} is already taken by '{}'",
                    self.kind, bit, existing
                )));
            }
            staged.insert(name, bit);
            staged_bits.insert(bit, name);
        }

        for (name, bit) in staged {
            entries.by_name.insert(name.to_string(), bit);
            entries.by_bit.insert(bit, name.to_string());
        }
        Ok(())
    }

    /// Register names at consecutive bits starting from 0.
    pub fn register_ordered(&self, names: &[&str]) -> Result<()> {
        let pairs: Vec<(&str, u32)> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (*n, i as u32))
            .collect();
        self.register(&pairs)
    }

    pub fn bit(&self, name: &str) -> Option<u32> {
        self.entries.read().by_name.get(name).copied()
    }

    pub fn name(&self, bit: u32) -> Option<String> {
        self.entries.read().by_bit.get(&bit).cloned()
    }

    /// Bitmap with the bit of every name set; unknown names are an error.
    pub fn mask_of<S: AsRef<str>>(&self, names: &[S]) -> Result<u64> {
        let entries = self.entries.read();
        names.iter().try_fold(0u64, |mask, name| {
            let name = name.as_ref();
            entries
                .by_name
                .get(name)
                .map(|bit| mask | (1u64 << bit))
                .ok_or_else(|| Error::input_invalid(format!("unknown {} '{}'", self.kind, name)))
        })
    }

    /// Names of all registered bits set in `mask`, in bit order.
    pub fn names_of(&self, mask: u64) -> Vec<String> {
        self.entries
            .read()
            .by_bit
            .iter()
            .filter(|(bit, _)| mask & (1u64 << **bit) != 0)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-scoped resource and action registries.
pub struct TopicRegistry {
    resources: BitRegistry,
    actions: BitRegistry,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

impl TopicRegistry {
    pub fn empty() -> Self {
        Self {
            resources: BitRegistry::new("resource", 64),
            actions: BitRegistry::new("action", 32),
        }
    }

    /// Registry preloaded with the built-in resources and actions.
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::empty();
        registry.resources.register_ordered(BUILTIN_RESOURCES)?;
        registry.actions.register_ordered(BUILTIN_ACTIONS)?;
        Ok(registry)
    }

    pub fn register_resources(&self, pairs: &[(&str, u32)]) -> Result<()> {
        self.resources.register(pairs)
    }

    pub fn register_actions(&self, pairs: &[(&str, u32)]) -> Result<()> {
        self.actions.register(pairs)
    }

    pub fn resources(&self) -> &BitRegistry {
        &self.resources
    }

    pub fn actions(&self) -> &BitRegistry {
        &self.actions
    }

    pub fn resource_mask<S: AsRef<str>>(&self, names: &[S]) -> Result<u64> {
        self.resources.mask_of(names)
    }

    pub fn action_mask<S: AsRef<str>>(&self, names: &[S]) -> Result<u32> {
        Ok(self.actions.mask_of(names)? as u32)
    }

    pub fn resources_of(&self, bitmap: u64) -> Vec<String> {
        self.resources.names_of(bitmap)
    }

    pub fn actions_of(&self, bitmap: u32) -> Vec<String> {
        self.actions.names_of(bitmap as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_positions() {
        let registry = TopicRegistry::with_builtins().unwrap();
        assert_eq!(registry.resources().len(), 42);
        assert_eq!(registry.actions().len(), 30);
        assert_eq!(registry.resources().bit("server"), Some(0));
        assert_eq!(registry.resources().bit("vm_integrity_check"), Some(41));
        assert_eq!(registry.actions().bit("create"), Some(0));
        assert_eq!(registry.actions().bit("server_panicked"), Some(29));
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = BitRegistry::new("resource", 64);
        registry.register(&[("server", 0), ("disk", 4)]).unwrap();
        registry.register(&[("server", 0), ("disk", 4)]).unwrap();
        assert_eq!(registry.len(), 2);
        for (name, bit) in [("server", 0), ("disk", 4)] {
            assert_eq!(registry.bit(name), Some(bit));
            assert_eq!(registry.name(bit).as_deref(), Some(name));
        }
    }

    #[test]
    fn test_remap_is_rejected() {
        let registry = BitRegistry::new("resource", 64);
        registry.register(&[("server", 0)]).unwrap();
        assert!(registry.register(&[("server", 1)]).is_err());
        assert!(registry.register(&[("disk", 0)]).is_err());
        // A rejected batch leaves nothing behind.
        assert!(registry.register(&[("eip", 9), ("server", 3)]).is_err());
        assert_eq!(registry.bit("eip"), None);
    }

    #[test]
    fn test_capacity() {
        let registry = BitRegistry::new("action", 32);
        assert!(registry.register(&[("x", 32)]).is_err());
        registry.register(&[("x", 31)]).unwrap();
    }

    #[test]
    fn test_masks() {
        let registry = TopicRegistry::with_builtins().unwrap();
        let mask = registry.resource_mask(&["server", "disk"]).unwrap();
        assert_eq!(mask, 0b10001);
        assert_eq!(registry.resources_of(mask), vec!["server", "disk"]);
        assert_eq!(registry.actions_of(0b11), vec!["create", "delete"]);
        assert!(registry.resource_mask(&["nope"]).is_err());
        assert_eq!(registry.action_mask(&["delete"]).unwrap(), 0b10);
    }
}
