//! Disk enumeration from the live domain XML.

use crate::utils::{Result, SupervisorError};
use serde::Deserialize;

/// Prefix the converter puts on user-defined device aliases
const USER_ALIAS_PREFIX: &str = "ua-";

#[derive(Debug, Deserialize)]
struct DomainXml {
    #[serde(default)]
    devices: Devices,
}

#[derive(Debug, Default, Deserialize)]
struct Devices {
    #[serde(rename = "disk", default)]
    disks: Vec<Disk>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Disk {
    #[serde(default)]
    pub target: DiskTarget,
    #[serde(default)]
    pub source: DiskSource,
    #[serde(default)]
    pub alias: Option<DiskAlias>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskTarget {
    #[serde(rename = "@dev", default)]
    pub device: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskSource {
    #[serde(rename = "@file", default)]
    pub file: Option<String>,
    #[serde(rename = "@dev", default)]
    pub dev: Option<String>,
    /// Present when the disk is a qcow2 overlay over a raw data file
    #[serde(rename = "dataStore", default)]
    pub data_store: Option<DataStore>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataStore {
    #[serde(rename = "@type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskAlias {
    #[serde(rename = "@name", default)]
    pub name: String,
}

impl Disk {
    /// Volume name recovered from the device alias
    pub fn volume_name(&self) -> String {
        let alias = self.alias.as_ref().map(|a| a.name.as_str()).unwrap_or_default();
        alias.strip_prefix(USER_ALIAS_PREFIX).unwrap_or(alias).to_string()
    }

    pub fn has_data_store(&self) -> bool {
        self.source.data_store.is_some()
    }
}

/// Parse every `<disk>` of a domain XML document.
pub fn parse_domain_disks(xml: &str) -> Result<Vec<Disk>> {
    let domain: DomainXml =
        quick_xml::de::from_str(xml).map_err(|e| SupervisorError::Xml(e.to_string()))?;
    Ok(domain.devices.disks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"
<domain type="kvm">
  <name>ns_vm1</name>
  <devices>
    <emulator>/usr/bin/qemu-kvm</emulator>
    <disk type="file" device="disk">
      <source file="/var/run/kubevirt-private/cbt/disk0.qcow2">
        <dataStore type="file">
          <format type="raw"/>
          <source file="/var/run/kubevirt-private/vmi-disks/disk0/disk.img"/>
        </dataStore>
      </source>
      <target dev="vda" bus="virtio"/>
      <alias name="ua-disk0"/>
    </disk>
    <interface type="ethernet"/>
    <disk type="file" device="disk">
      <source file="/var/run/kubevirt-ephemeral-disks/cloud-init-data/ns/vm1/noCloud.iso"/>
      <target dev="vdb" bus="virtio"/>
      <alias name="ua-cloudinitdisk"/>
    </disk>
  </devices>
</domain>
"#;

    #[test]
    fn test_parse_domain_disks() {
        let disks = parse_domain_disks(DOMAIN).unwrap();
        assert_eq!(disks.len(), 2);

        assert_eq!(disks[0].target.device, "vda");
        assert_eq!(disks[0].volume_name(), "disk0");
        assert!(disks[0].has_data_store());
        assert_eq!(
            disks[0].source.file.as_deref(),
            Some("/var/run/kubevirt-private/cbt/disk0.qcow2")
        );

        assert_eq!(disks[1].target.device, "vdb");
        assert_eq!(disks[1].volume_name(), "cloudinitdisk");
        assert!(!disks[1].has_data_store());
    }

    #[test]
    fn test_invalid_xml_is_reported() {
        assert!(matches!(
            parse_domain_disks("<domain><devices>"),
            Err(SupervisorError::Xml(_))
        ));
    }
}
