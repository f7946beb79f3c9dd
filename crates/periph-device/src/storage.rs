//! Storage volume listing (Linux).
//!
//! Mounted volumes come from `/proc/mounts`, unmounted block partitions from
//! `/proc/partitions`, and removability from `/sys/block/<disk>/removable`.
//! Mounting and unmounting are left to the operating system.

use async_trait::async_trait;
use periph_core::{Capability, Device, DeviceClass, Result};
use periph_session::StorageCatalog;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

/// A mounted block device from `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: String,
    pub fs_type: String,
    pub read_only: bool,
}

impl MountEntry {
    /// `sdb1` for `/dev/sdb1`, `vg0-home` for `/dev/mapper/vg0-home`.
    pub fn device_name(&self) -> &str {
        self.source.rsplit('/').next().unwrap_or(&self.source)
    }
}

/// A block device from `/proc/partitions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub size_bytes: u64,
}

pub struct SysStorage {
    proc_root: PathBuf,
    sys_root: PathBuf,
}

impl Default for SysStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SysStorage {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            sys_root: PathBuf::from("/sys"),
        }
    }

    /// Read from alternate `/proc` and `/sys` trees.
    pub fn with_roots(proc_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
        }
    }

    async fn removable(&self, device_name: &str) -> bool {
        let disk = parent_disk(device_name);
        let path = self.sys_root.join("block").join(disk).join("removable");
        tokio::fs::read_to_string(path)
            .await
            .map(|s| s.trim() == "1")
            .unwrap_or(false)
    }
}

#[async_trait]
impl StorageCatalog for SysStorage {
    async fn volumes(&self) -> Result<Vec<Device>> {
        let mounts = match tokio::fs::read_to_string(self.proc_root.join("mounts")).await {
            Ok(raw) => parse_mounts(&raw),
            Err(e) => {
                debug!(error = %e, "cannot read mounts");
                return Ok(Vec::new());
            }
        };
        let partitions = tokio::fs::read_to_string(self.proc_root.join("partitions"))
            .await
            .map(|raw| parse_partitions(&raw))
            .unwrap_or_default();

        let mut devices = Vec::new();
        let mut seen = HashSet::new();
        for mount in &mounts {
            let name = mount.device_name().to_string();
            if !seen.insert(name.clone()) {
                continue;
            }
            let mut device = Device::new(name.clone(), DeviceClass::Storage, name.clone())
                .with_detail("path", mount.source.clone())
                .with_detail("mount_point", mount.mount_point.clone())
                .with_detail("file_system", mount.fs_type.clone())
                .with_detail("read_only", mount.read_only);
            if let Some(p) = partitions.iter().find(|p| p.name == name) {
                device = device.with_detail("size_bytes", p.size_bytes);
            }
            if self.removable(&name).await {
                device = device.with_capability(Capability::Removable);
            }
            devices.push(device);
        }

        for partition in unmounted(&partitions, &seen) {
            let mut device = Device::new(partition.name.clone(), DeviceClass::Storage, partition.name.clone())
                .with_detail("path", format!("/dev/{}", partition.name))
                .with_detail("mount_point", serde_json::Value::Null)
                .with_detail("size_bytes", partition.size_bytes);
            if self.removable(&partition.name).await {
                device = device.with_capability(Capability::Removable);
            }
            devices.push(device);
        }
        Ok(devices)
    }
}

// ─── Parsers ────────────────────────────────────────────────────

/// Parse `/proc/mounts`, keeping real block devices only.
pub fn parse_mounts(raw: &str) -> Vec<MountEntry> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = unescape_octal(fields.next()?);
            let mount_point = unescape_octal(fields.next()?);
            let fs_type = fields.next()?.to_string();
            let options = fields.next().unwrap_or("");
            if !source.starts_with("/dev/") || source.starts_with("/dev/loop") {
                return None;
            }
            Some(MountEntry {
                source,
                mount_point,
                fs_type,
                read_only: options.split(',').any(|o| o == "ro"),
            })
        })
        .collect()
}

/// Parse `/proc/partitions` (sizes are in 1 KiB blocks).
pub fn parse_partitions(raw: &str) -> Vec<Partition> {
    raw.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [_, _, blocks, name] = fields.as_slice() else {
                return None;
            };
            let blocks: u64 = blocks.parse().ok()?;
            if ["loop", "ram", "zram", "sr"].iter().any(|p| name.starts_with(p)) {
                return None;
            }
            Some(Partition {
                name: name.to_string(),
                size_bytes: blocks * 1024,
            })
        })
        .collect()
}

/// Partitions not already mounted. A whole disk that has partitions is
/// represented by them instead.
fn unmounted<'a>(partitions: &'a [Partition], mounted: &HashSet<String>) -> Vec<&'a Partition> {
    partitions
        .iter()
        .filter(|p| !mounted.contains(&p.name))
        .filter(|p| {
            !partitions
                .iter()
                .any(|other| other.name != p.name && parent_disk(&other.name) == p.name)
        })
        .collect()
}

/// `sdb1` → `sdb`, `nvme0n1p2` → `nvme0n1`, `mmcblk0p1` → `mmcblk0`.
pub fn parent_disk(name: &str) -> &str {
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() == name.len() {
        return name;
    }
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        return match trimmed.strip_suffix('p') {
            Some(disk) => disk,
            // nvme0n1 / mmcblk0 are already disks.
            None => name,
        };
    }
    trimmed
}

/// `/proc/mounts` escapes space, tab, newline and backslash as `\ooo`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/loop3 /snap/core/1 squashfs ro,nodev 0 0
/dev/sdb1 /media/me/USB\\040STICK vfat rw,nosuid,nodev 0 0
/dev/sr0 /media/cdrom iso9660 ro 0 0
/dev/nvme0n1p2 /home ext4 rw,relatime 0 0
";

    const PARTITIONS: &str = "\
major minor  #blocks  name

 259        0  500107608 nvme0n1
 259        1     524288 nvme0n1p1
 259        2  499582976 nvme0n1p2
   8       16   30720000 sdb
   8       17   30719000 sdb1
   8       32    1024000 sdc
   7        0      56000 loop0
";

    #[test]
    fn test_parse_mounts_filters_and_unescapes() {
        let mounts = parse_mounts(MOUNTS);
        assert_eq!(mounts.len(), 4);
        assert_eq!(mounts[0].device_name(), "nvme0n1p2");
        assert_eq!(mounts[1].mount_point, "/media/me/USB STICK");
        assert_eq!(mounts[1].fs_type, "vfat");
        assert!(mounts[2].read_only);
        assert!(mounts.iter().all(|m| !m.source.starts_with("/dev/loop")));
    }

    #[test]
    fn test_parse_partitions() {
        let parts = parse_partitions(PARTITIONS);
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[3].name, "sdb");
        assert_eq!(parts[3].size_bytes, 30_720_000 * 1024);
    }

    #[test]
    fn test_parent_disk() {
        assert_eq!(parent_disk("sdb1"), "sdb");
        assert_eq!(parent_disk("sdb"), "sdb");
        assert_eq!(parent_disk("nvme0n1p2"), "nvme0n1");
        assert_eq!(parent_disk("nvme0n1"), "nvme0n1");
        assert_eq!(parent_disk("mmcblk0p1"), "mmcblk0");
        assert_eq!(parent_disk("mmcblk0"), "mmcblk0");
    }

    #[test]
    fn test_unmounted_skips_partitioned_disks() {
        let parts = parse_partitions(PARTITIONS);
        let mounted: HashSet<String> = ["nvme0n1p2".to_string()].into();
        let names: Vec<&str> = unmounted(&parts, &mounted)
            .into_iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["nvme0n1p1", "sdb1", "sdc"]);
    }

    #[tokio::test]
    async fn test_volumes_from_fake_tree() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("proc");
        let sys_root = dir.path().join("sys");
        std::fs::create_dir_all(&proc_root).unwrap();
        std::fs::create_dir_all(sys_root.join("block/sdb")).unwrap();
        std::fs::write(proc_root.join("mounts"), MOUNTS).unwrap();
        std::fs::write(proc_root.join("partitions"), PARTITIONS).unwrap();
        std::fs::write(sys_root.join("block/sdb/removable"), "1\n").unwrap();

        let volumes = SysStorage::with_roots(&proc_root, &sys_root).volumes().await.unwrap();
        let sdb1 = volumes.iter().find(|d| d.id == "sdb1").unwrap();
        assert!(sdb1.supports(Capability::Removable));
        assert_eq!(sdb1.details["mount_point"], "/media/me/USB STICK");

        let root = volumes.iter().find(|d| d.id == "nvme0n1p2").unwrap();
        assert!(!root.supports(Capability::Removable));
        assert_eq!(volumes.iter().filter(|d| d.id == "nvme0n1p2").count(), 1);

        let sdc = volumes.iter().find(|d| d.id == "sdc").unwrap();
        assert!(sdc.details["mount_point"].is_null());
    }
}
