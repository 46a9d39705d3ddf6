use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A LUKS passphrase. Never printed, zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop, Clone)]
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl From<String> for Passphrase {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Passphrase(<{} bytes>)", self.0.len())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CpuVendor {
    Amd,
    Intel,
}

impl CpuVendor {
    /// At most one microcode package is ever selected.
    pub fn microcode_package(&self) -> &'static str {
        match self {
            CpuVendor::Amd => "amd-ucode",
            CpuVendor::Intel => "intel-ucode",
        }
    }

    /// Name of the early-microcode image the package drops into /boot.
    pub fn microcode_image(&self) -> &'static str {
        match self {
            CpuVendor::Amd => "amd-ucode.img",
            CpuVendor::Intel => "intel-ucode.img",
        }
    }
}

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum GpuFamily {
    NvidiaProprietary,
    NvidiaOpen,
    Amd,
    Intel,
    #[default]
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passphrase_debug_is_redacted() {
        let p = Passphrase::from("hunter2".to_owned());
        assert!(!format!("{p:?}").contains("hunter2"));
    }

    #[test]
    fn cpu_vendor_selects_one_microcode_package() {
        assert_eq!(CpuVendor::Amd.microcode_package(), "amd-ucode");
        assert_eq!(CpuVendor::Intel.microcode_package(), "intel-ucode");
    }
}
