/*!
Compiled-in vendor table.

Each vendor has exactly one command. The table is a `const` and nothing in the
crate builds a [`VendorProfile`] at runtime, so no per-device or per-attempt
value can reach a command string through this module.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CaptureError;

/// Management transport used to reach a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ssh,
    Telnet,
}

impl Transport {
    pub fn default_port(self) -> u16 {
        match self {
            Transport::Ssh => 22,
            Transport::Telnet => 23,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Ssh => "ssh",
            Transport::Telnet => "telnet",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(Transport::Ssh),
            "telnet" => Ok(Transport::Telnet),
            other => Err(CaptureError::unsupported(format!(
                "unknown transport: {other}"
            ))),
        }
    }
}

/// How a vendor hands its configuration back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureShape {
    /// Output is read from the management session.
    Inline,
    /// The device pushes a file to the ingestion root after being triggered.
    Relay {
        /// Filename the device uploads.
        filename: &'static str,
    },
}

/// Supported device families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vendor {
    #[serde(rename = "mikrotik")]
    MikroTik,
    #[serde(rename = "cisco")]
    Cisco,
    #[serde(rename = "huawei")]
    Huawei,
    #[serde(rename = "zte")]
    Zte,
    #[serde(rename = "juniper")]
    Juniper,
    #[serde(rename = "generic")]
    Generic,
    #[serde(rename = "generic-saved")]
    GenericSaved,
    #[serde(rename = "generic-startup")]
    GenericStartup,
}

/// Immutable capabilities of one device family
#[derive(Debug, PartialEq, Eq)]
pub struct VendorProfile {
    pub vendor: Vendor,
    pub transports: &'static [Transport],
    pub command: &'static str,
    pub extension: &'static str,
    pub device_type: &'static str,
    /// Enter privileged mode before capturing when an enable secret is present.
    pub privileged: bool,
    pub shape: CaptureShape,
}

/// Filename the relay family uploads to the ingestion root.
pub const RELAY_FILENAME: &str = "startrun.dat";

const SSH_ONLY: &[Transport] = &[Transport::Ssh];
const SSH_TELNET: &[Transport] = &[Transport::Ssh, Transport::Telnet];

static PROFILES: [VendorProfile; 8] = [
    VendorProfile {
        vendor: Vendor::MikroTik,
        transports: SSH_ONLY,
        command: "/export",
        extension: ".rsc",
        device_type: "mikrotik_routeros",
        privileged: false,
        shape: CaptureShape::Inline,
    },
    VendorProfile {
        vendor: Vendor::Cisco,
        transports: SSH_TELNET,
        command: "show running-config",
        extension: ".txt",
        device_type: "cisco_ios",
        privileged: true,
        shape: CaptureShape::Inline,
    },
    VendorProfile {
        vendor: Vendor::Huawei,
        transports: SSH_TELNET,
        command: "display current-configuration",
        extension: ".txt",
        device_type: "huawei",
        privileged: false,
        shape: CaptureShape::Inline,
    },
    VendorProfile {
        vendor: Vendor::Zte,
        transports: SSH_TELNET,
        command: "file upload cfg-startup startrun.dat ftp",
        extension: ".dat",
        device_type: "zte_zxros",
        privileged: false,
        shape: CaptureShape::Relay {
            filename: RELAY_FILENAME,
        },
    },
    VendorProfile {
        vendor: Vendor::Juniper,
        transports: SSH_ONLY,
        command: "show configuration | display set",
        extension: ".txt",
        device_type: "juniper_junos",
        privileged: false,
        shape: CaptureShape::Inline,
    },
    VendorProfile {
        vendor: Vendor::Generic,
        transports: SSH_TELNET,
        command: "show running-config",
        extension: ".txt",
        device_type: "cisco_ios",
        privileged: false,
        shape: CaptureShape::Inline,
    },
    VendorProfile {
        vendor: Vendor::GenericSaved,
        transports: SSH_TELNET,
        command: "show saved-config",
        extension: ".txt",
        device_type: "cisco_ios",
        privileged: false,
        shape: CaptureShape::Inline,
    },
    VendorProfile {
        vendor: Vendor::GenericStartup,
        transports: SSH_TELNET,
        command: "show startup-config",
        extension: ".txt",
        device_type: "cisco_ios",
        privileged: false,
        shape: CaptureShape::Inline,
    },
];

impl Vendor {
    /// Every supported vendor, in table order.
    pub fn all() -> impl Iterator<Item = Vendor> {
        PROFILES.iter().map(|p| p.vendor)
    }

    pub fn profile(self) -> &'static VendorProfile {
        // PROFILES is ordered like the enum.
        &PROFILES[self as usize]
    }

    pub fn tag(self) -> &'static str {
        match self {
            Vendor::MikroTik => "mikrotik",
            Vendor::Cisco => "cisco",
            Vendor::Huawei => "huawei",
            Vendor::Zte => "zte",
            Vendor::Juniper => "juniper",
            Vendor::Generic => "generic",
            Vendor::GenericSaved => "generic-saved",
            Vendor::GenericStartup => "generic-startup",
        }
    }

    pub fn is_relay(self) -> bool {
        matches!(self.profile().shape, CaptureShape::Relay { .. })
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Vendor {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Vendor::all().find(|v| v.tag() == wanted).ok_or_else(|| {
            let supported: Vec<&str> = Vendor::all().map(Vendor::tag).collect();
            CaptureError::unsupported(format!(
                "unsupported vendor: {wanted} (supported: {})",
                supported.join(", ")
            ))
        })
    }
}

impl VendorProfile {
    pub fn permits(&self, transport: Transport) -> bool {
        self.transports.contains(&transport)
    }

    /// Device-type hint for the given transport.
    pub fn device_type_for(&self, transport: Transport) -> String {
        match transport {
            Transport::Ssh => self.device_type.to_string(),
            Transport::Telnet => format!("{}_telnet", self.device_type),
        }
    }

    /// Name of the content file inside an artifact directory.
    pub fn artifact_filename(&self) -> String {
        format!("config{}", self.extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_index_matches_vendor() {
        for vendor in Vendor::all() {
            assert_eq!(vendor.profile().vendor, vendor);
        }
        assert_eq!(Vendor::all().count(), 8);
    }

    #[test]
    fn test_vendor_table_is_exact() {
        let expected = [
            ("mikrotik", "/export", ".rsc", "mikrotik_routeros", SSH_ONLY),
            ("cisco", "show running-config", ".txt", "cisco_ios", SSH_TELNET),
            ("huawei", "display current-configuration", ".txt", "huawei", SSH_TELNET),
            ("zte", "file upload cfg-startup startrun.dat ftp", ".dat", "zte_zxros", SSH_TELNET),
            ("juniper", "show configuration | display set", ".txt", "juniper_junos", SSH_ONLY),
            ("generic", "show running-config", ".txt", "cisco_ios", SSH_TELNET),
            ("generic-saved", "show saved-config", ".txt", "cisco_ios", SSH_TELNET),
            ("generic-startup", "show startup-config", ".txt", "cisco_ios", SSH_TELNET),
        ];

        for (tag, command, ext, device_type, transports) in expected {
            let profile = tag.parse::<Vendor>().unwrap().profile();
            assert_eq!(profile.command, command, "{tag}");
            assert_eq!(profile.extension, ext, "{tag}");
            assert_eq!(profile.device_type, device_type, "{tag}");
            assert_eq!(profile.transports, transports, "{tag}");
        }
    }

    #[test]
    fn test_only_zte_is_relay_and_only_cisco_elevates() {
        for vendor in Vendor::all() {
            assert_eq!(vendor.is_relay(), vendor == Vendor::Zte);
            assert_eq!(vendor.profile().privileged, vendor == Vendor::Cisco);
        }
    }

    #[test]
    fn test_vendor_parsing() {
        assert_eq!("Cisco".parse::<Vendor>().unwrap(), Vendor::Cisco);
        assert_eq!(" generic-saved ".parse::<Vendor>().unwrap(), Vendor::GenericSaved);
        let err = "acme".parse::<Vendor>().unwrap_err();
        assert!(err.to_string().contains("unsupported vendor: acme"));
    }

    #[test]
    fn test_transport_defaults_and_hint() {
        assert_eq!(Transport::Ssh.default_port(), 22);
        assert_eq!(Transport::Telnet.default_port(), 23);

        let cisco = Vendor::Cisco.profile();
        assert_eq!(cisco.device_type_for(Transport::Telnet), "cisco_ios_telnet");
        assert!(!Vendor::MikroTik.profile().permits(Transport::Telnet));
        assert!(Vendor::Juniper.profile().permits(Transport::Ssh));
    }

    #[test]
    fn test_serde_uses_tags() {
        let json = serde_json::to_string(&Vendor::GenericStartup).unwrap();
        assert_eq!(json, "\"generic-startup\"");
        let vendor: Vendor = serde_json::from_str("\"mikrotik\"").unwrap();
        assert_eq!(vendor, Vendor::MikroTik);
    }
}
