//! The `devices` subsystem. Grounded on `containers-youki`'s
//! `v1::devices::Devices` (`devices.allow`/`devices.deny` writes,
//! `LinuxDeviceCgroup::to_string()` serialization shape), reworked onto a
//! `DeviceRestriction` model (type/permission/access triple instead of the
//! OCI runtime-spec device cgroup type) and extended with a `get_state`
//! parser for `devices.list`.

use std::path::Path;

use crate::error::{Error, Result};

use super::{CgroupController, ControllerBase};

const DEVICES_ALLOW: &str = "devices.allow";
const DEVICES_DENY: &str = "devices.deny";
const DEVICES_LIST: &str = "devices.list";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeviceType {
    Char,
    Block,
    All,
}

impl DeviceType {
    fn letter(self) -> char {
        match self {
            DeviceType::Char => 'c',
            DeviceType::Block => 'b',
            DeviceType::All => 'a',
        }
    }

    fn from_letter(c: char) -> Option<Self> {
        match c {
            'c' => Some(DeviceType::Char),
            'b' => Some(DeviceType::Block),
            'a' => Some(DeviceType::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Permission {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Access {
    Read,
    Write,
    Mknod,
}

impl Access {
    fn letter(self) -> char {
        match self {
            Access::Read => 'r',
            Access::Write => 'w',
            Access::Mknod => 'm',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceRestriction {
    pub typ: DeviceType,
    pub permission: Permission,
    pub access: Vec<Access>,
    pub major: Option<u64>,
    pub minor: Option<u64>,
}

impl DeviceRestriction {
    /// Validates `access` is non-empty and free of duplicates, then
    /// serializes as `"<t> <M>:<m> <acc>"`, `*` standing in for a missing
    /// major/minor.
    fn serialize(&self) -> Result<String> {
        verify_access(&self.access, false)?;

        let major = self.major.map(|m| m.to_string()).unwrap_or_else(|| "*".to_string());
        let minor = self.minor.map(|m| m.to_string()).unwrap_or_else(|| "*".to_string());
        let access: String = self.access.iter().map(|a| a.letter()).collect();

        Ok(format!("{} {major}:{minor} {access}", self.typ.letter()))
    }
}

/// `verify_restriction(rule)` — like serialization's validation, but missing
/// major/minor is allowed and up to three distinct access values.
fn verify_access(access: &[Access], verify_only: bool) -> Result<()> {
    if access.is_empty() {
        return Err(Error::invalid_argument("access set must be non-empty"));
    }
    if !verify_only && access.len() > 3 {
        return Err(Error::invalid_argument("access set accepts at most 3 values"));
    }
    let mut seen = std::collections::HashSet::new();
    for a in access {
        if !seen.insert(a) {
            return Err(Error::invalid_argument("duplicate access value"));
        }
    }
    Ok(())
}

pub struct Device {
    base: ControllerBase,
}

impl CgroupController for Device {
    fn base(&self) -> &ControllerBase {
        &self.base
    }
}

impl Device {
    pub fn new(base: ControllerBase) -> Self {
        Device { base }
    }

    fn absolute_path(&self) -> &Path {
        self.base.absolute_path()
    }

    pub fn set_restrictions(&self, restrictions: &[DeviceRestriction]) -> Result<()> {
        for rule in restrictions {
            let line = rule.serialize()?;
            let file = match rule.permission {
                Permission::Allow => DEVICES_ALLOW,
                Permission::Deny => DEVICES_DENY,
            };
            self.base.fs().safe_write(self.absolute_path().join(file), &line)?;
        }
        Ok(())
    }

    /// `verify_restriction(rule)` — field-presence validation without
    /// writing anything.
    pub fn verify_restriction(&self, rule: &DeviceRestriction) -> Result<()> {
        verify_access(&rule.access, true)
    }

    /// `get_state()` — empty file means "all denied"; `a *:* rwm` collapses
    /// to a single allow-all rule.
    pub fn get_state(&self) -> Result<Vec<DeviceRestriction>> {
        let raw = self
            .base
            .fs()
            .read_to_string(self.absolute_path().join(DEVICES_LIST))?;

        if raw.trim().is_empty() {
            return Ok(vec![DeviceRestriction {
                typ: DeviceType::All,
                permission: Permission::Deny,
                access: vec![Access::Read, Access::Write, Access::Mknod],
                major: None,
                minor: None,
            }]);
        }

        raw.lines().map(parse_device_list_line).collect()
    }
}

fn parse_device_list_line(line: &str) -> Result<DeviceRestriction> {
    let mut fields = line.split_whitespace();
    let typ = fields
        .next()
        .and_then(|t| t.chars().next())
        .and_then(DeviceType::from_letter)
        .ok_or_else(|| Error::internal(format!("malformed devices.list line {line:?}")))?;
    let dev = fields
        .next()
        .ok_or_else(|| Error::internal(format!("malformed devices.list line {line:?}")))?;
    let acc = fields
        .next()
        .ok_or_else(|| Error::internal(format!("malformed devices.list line {line:?}")))?;

    let (major_raw, minor_raw) = dev
        .split_once(':')
        .ok_or_else(|| Error::internal(format!("malformed device number {dev:?}")))?;
    let major = if major_raw == "*" {
        None
    } else {
        Some(
            major_raw
                .parse()
                .map_err(|_| Error::internal(format!("malformed major {major_raw:?}")))?,
        )
    };
    let minor = if minor_raw == "*" {
        None
    } else {
        Some(
            minor_raw
                .parse()
                .map_err(|_| Error::internal(format!("malformed minor {minor_raw:?}")))?,
        )
    };

    let access = acc
        .chars()
        .map(|c| match c {
            'r' => Ok(Access::Read),
            'w' => Ok(Access::Write),
            'm' => Ok(Access::Mknod),
            other => Err(Error::internal(format!("unknown access letter {other:?}"))),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(DeviceRestriction {
        typ,
        permission: Permission::Allow,
        access,
        major,
        minor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::test_base;

    #[test]
    fn serialize_uses_wildcards_for_missing_components() {
        let rule = DeviceRestriction {
            typ: DeviceType::Char,
            permission: Permission::Allow,
            access: vec![Access::Read, Access::Write, Access::Mknod],
            major: None,
            minor: None,
        };
        assert_eq!(rule.serialize().unwrap(), "c *:* rwm");
    }

    #[test]
    fn set_restrictions_writes_to_allow_or_deny() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(DEVICES_ALLOW), "").unwrap();
        std::fs::write(tmp.path().join(DEVICES_DENY), "").unwrap();
        let device = Device::new(test_base(tmp.path()));

        device
            .set_restrictions(&[DeviceRestriction {
                typ: DeviceType::Block,
                permission: Permission::Deny,
                access: vec![Access::Mknod],
                major: Some(10),
                minor: Some(200),
            }])
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(tmp.path().join(DEVICES_DENY)).unwrap(),
            "b 10:200 m"
        );
    }

    #[test]
    fn get_state_empty_file_means_all_denied() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(DEVICES_LIST), "").unwrap();
        let device = Device::new(test_base(tmp.path()));

        let state = device.get_state().unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].permission, Permission::Deny);
        assert_eq!(state[0].typ, DeviceType::All);
    }

    #[test]
    fn get_state_round_trips_allow_all() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(DEVICES_LIST), "a *:* rwm\n").unwrap();
        let device = Device::new(test_base(tmp.path()));

        let state = device.get_state().unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].typ, DeviceType::All);
        assert_eq!(state[0].major, None);
    }

    #[test]
    fn verify_restriction_rejects_duplicate_access() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Device::new(test_base(tmp.path()));
        let rule = DeviceRestriction {
            typ: DeviceType::Char,
            permission: Permission::Allow,
            access: vec![Access::Read, Access::Read],
            major: None,
            minor: None,
        };
        let err = device.verify_restriction(&rule).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }
}
