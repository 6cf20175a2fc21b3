//! Process-wide registry mapping filesystem mount prefixes to device
//! classes. Writes targeting rotating media are serialized through the
//! device mutex to avoid seek thrashing; memory and SSD devices are not.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::error::{Error, Result};

/// Mount-point key selecting the fallback device.
pub const DEFAULT_DEVICE: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Memory,
    Hdd,
    Ssd,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Memory => write!(f, "mem"),
            DeviceKind::Hdd => write!(f, "hdd"),
            DeviceKind::Ssd => write!(f, "ssd"),
        }
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mem" | "memory" => Ok(DeviceKind::Memory),
            "hdd" => Ok(DeviceKind::Hdd),
            "ssd" => Ok(DeviceKind::Ssd),
            _ => Err(Error::InvalidArg(format!("invalid device kind: {s}"))),
        }
    }
}

#[derive(Debug)]
struct DeviceInner {
    kind: DeviceKind,
    serial: Mutex<()>,
}

/// Shared handle to a registered device.
#[derive(Clone, Debug)]
pub struct Device(Arc<DeviceInner>);

impl Device {
    fn new(kind: DeviceKind) -> Device {
        Device(Arc::new(DeviceInner {
            kind,
            serial: Mutex::new(()),
        }))
    }

    pub fn kind(&self) -> DeviceKind {
        self.0.kind
    }

    /// Serialization guard for a single positional write. Only rotating
    /// devices take the mutex; the guard must not be held across an await.
    pub fn lock(&self) -> Option<MutexGuard<'_, ()>> {
        if self.0.kind != DeviceKind::Hdd {
            return None;
        }
        match self.0.serial.lock() {
            Ok(guard) => Some(guard),
            Err(poisoned) => Some(poisoned.into_inner()),
        }
    }
}

struct Registry {
    default: Device,
    mounts: BTreeMap<String, Device>,
}

lazy_static::lazy_static! {
    static ref REGISTRY: RwLock<Registry> = RwLock::new(Registry {
        default: Device::new(DeviceKind::Memory),
        mounts: BTreeMap::new(),
    });
}

/// Declares the device class backing `mount_point`. Re-registering the same
/// mount point replaces its kind; nested prefixes are rejected. The special
/// mount point [`DEFAULT_DEVICE`] replaces the fallback device.
pub fn set_device(mount_point: &str, kind: DeviceKind) -> Result<()> {
    let mut registry = match REGISTRY.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if mount_point == DEFAULT_DEVICE {
        registry.default = Device::new(kind);
        return Ok(());
    }
    if !mount_point.starts_with('/') {
        return Err(Error::InvalidArg(format!(
            "mount point must be absolute: {mount_point:?}"
        )));
    }
    for existing in registry.mounts.keys() {
        if existing != mount_point
            && (existing.starts_with(mount_point) || mount_point.starts_with(existing.as_str()))
        {
            return Err(Error::InvalidArg(format!(
                "mount point {mount_point:?} nests with registered {existing:?}"
            )));
        }
    }
    registry
        .mounts
        .insert(mount_point.to_string(), Device::new(kind));
    Ok(())
}

/// Device whose mount prefix is the longest prefix of `path`, falling back
/// to the default device.
pub fn lookup(path: &std::path::Path) -> Device {
    let path = path.to_string_lossy();
    let registry = match REGISTRY.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut best: Option<(&String, &Device)> = None;
    for (mount, device) in &registry.mounts {
        if path.starts_with(mount.as_str())
            && best.is_none_or(|(longest, _)| mount.len() > longest.len())
        {
            best = Some((mount, device));
        }
    }
    match best {
        Some((_, device)) => device.clone(),
        None => registry.default.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn lookup_matches_mount_prefixes() -> Result<()> {
        set_device("/remi-test-a", DeviceKind::Hdd)?;
        set_device("/remi-test-other/nested", DeviceKind::Ssd)?;
        assert_eq!(
            lookup(Path::new("/remi-test-a/data/file")).kind(),
            DeviceKind::Hdd
        );
        assert_eq!(
            lookup(Path::new("/remi-test-other/nested/file")).kind(),
            DeviceKind::Ssd
        );
        assert_eq!(
            lookup(Path::new("/somewhere-else/file")).kind(),
            DeviceKind::Memory
        );
        Ok(())
    }

    #[test]
    fn nesting_is_rejected() -> Result<()> {
        set_device("/remi-test-b/mnt", DeviceKind::Ssd)?;
        assert!(matches!(
            set_device("/remi-test-b", DeviceKind::Hdd),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            set_device("/remi-test-b/mnt/sub", DeviceKind::Hdd),
            Err(Error::InvalidArg(_))
        ));
        // identical mount point replaces the kind
        set_device("/remi-test-b/mnt", DeviceKind::Hdd)?;
        assert_eq!(
            lookup(Path::new("/remi-test-b/mnt/file")).kind(),
            DeviceKind::Hdd
        );
        Ok(())
    }

    #[test]
    fn only_hdd_devices_serialize() -> Result<()> {
        set_device("/remi-test-c/hdd", DeviceKind::Hdd)?;
        set_device("/remi-test-c/ssd", DeviceKind::Ssd)?;
        assert!(lookup(Path::new("/remi-test-c/hdd/f")).lock().is_some());
        assert!(lookup(Path::new("/remi-test-c/ssd/f")).lock().is_none());
        assert!(lookup(Path::new("/elsewhere/f")).lock().is_none());
        Ok(())
    }

    #[test]
    fn relative_mount_points_are_rejected() {
        assert!(matches!(
            set_device("relative", DeviceKind::Hdd),
            Err(Error::InvalidArg(_))
        ));
    }
}
