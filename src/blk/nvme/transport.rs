//! NVMe transport identifiers.
//!
//! A device symlink target file holds one line such as
//! `trtype:PCIe traddr:0000:04:00.0` or
//! `trtype:TCP adrfam:IPv4 traddr:10.0.0.5 trsvcid:4420 subnqn:nqn.2016-06.io.spdk:cnode1`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::common::exception::BlkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportType {
    Pcie,
    Rdma,
    Fc,
    Tcp,
    Custom,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Pcie => "PCIe",
            TransportType::Rdma => "RDMA",
            TransportType::Fc => "FC",
            TransportType::Tcp => "TCP",
            TransportType::Custom => "CUSTOM",
        }
    }
}

impl FromStr for TransportType {
    type Err = BlkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pcie" => Ok(TransportType::Pcie),
            "rdma" => Ok(TransportType::Rdma),
            "fc" => Ok(TransportType::Fc),
            "tcp" => Ok(TransportType::Tcp),
            "custom" => Ok(TransportType::Custom),
            _ => Err(BlkError::InvalidTransport(format!("unknown trtype '{}'", s))),
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `domain:bus:device.function`; the domain may be omitted and defaults to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
}

impl PciAddress {
    pub fn parse(s: &str) -> Result<Self, BlkError> {
        let invalid = || BlkError::InvalidTransport(format!("invalid PCI address '{}'", s));

        let (rest, func) = s.rsplit_once(['.', ':']).ok_or_else(invalid)?;
        if s.as_bytes()[rest.len()] != b'.' {
            return Err(invalid());
        }
        let parts: Vec<&str> = rest.split(':').collect();
        let (domain, bus, dev) = match parts.as_slice() {
            [bus, dev] => ("0", *bus, *dev),
            [domain, bus, dev] => (*domain, *bus, *dev),
            _ => return Err(invalid()),
        };

        let domain = u32::from_str_radix(domain, 16).map_err(|_| invalid())?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| invalid())?;
        let dev = u8::from_str_radix(dev, 16).map_err(|_| invalid())?;
        let func = u8::from_str_radix(func, 16).map_err(|_| invalid())?;
        if dev > 0x1f || func > 7 {
            return Err(invalid());
        }
        Ok(Self {
            domain,
            bus,
            dev,
            func,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.dev, self.func
        )
    }
}

#[derive(Debug, Clone)]
pub struct TransportId {
    pub trtype: TransportType,
    pub adrfam: Option<String>,
    pub traddr: String,
    pub trsvcid: Option<String>,
    pub subnqn: Option<String>,
}

impl TransportId {
    pub fn pcie(addr: PciAddress) -> Self {
        Self {
            trtype: TransportType::Pcie,
            adrfam: None,
            traddr: addr.to_string(),
            trsvcid: None,
            subnqn: None,
        }
    }

    /// Parses whitespace separated `key:value` pairs. `trtype` and `traddr` are required.
    pub fn parse(s: &str) -> Result<Self, BlkError> {
        let mut trtype = None;
        let mut adrfam = None;
        let mut traddr = None;
        let mut trsvcid = None;
        let mut subnqn = None;

        for token in s.split_whitespace() {
            let (key, value) = token
                .split_once(|c| c == ':' || c == '=')
                .ok_or_else(|| BlkError::InvalidTransport(format!("malformed field '{}'", token)))?;
            if value.is_empty() {
                return Err(BlkError::InvalidTransport(format!("empty value for '{}'", key)));
            }
            match key.to_ascii_lowercase().as_str() {
                "trtype" => trtype = Some(value.parse::<TransportType>()?),
                "adrfam" => adrfam = Some(value.to_string()),
                "traddr" => traddr = Some(value.to_string()),
                "trsvcid" => trsvcid = Some(value.to_string()),
                "subnqn" => subnqn = Some(value.to_string()),
                other => {
                    return Err(BlkError::InvalidTransport(format!("unknown key '{}'", other)));
                }
            }
        }

        let trtype = trtype.ok_or_else(|| BlkError::InvalidTransport(format!("no trtype in '{}'", s)))?;
        let traddr = traddr.ok_or_else(|| BlkError::InvalidTransport(format!("no traddr in '{}'", s)))?;
        Ok(Self {
            trtype,
            adrfam,
            traddr,
            trsvcid,
            subnqn,
        })
    }

    /// Parsed PCI address when this names a local PCIe function.
    pub fn local_pci_device(&self) -> Option<PciAddress> {
        match self.trtype {
            TransportType::Pcie => PciAddress::parse(&self.traddr).ok(),
            _ => None,
        }
    }

    /// Total order used to decide whether two ids name the same controller.
    ///
    /// PCIe addresses compare by value so `04:00.0` equals `0000:04:00.0`; other fields
    /// compare case-insensitively.
    pub fn compare(&self, other: &TransportId) -> Ordering {
        let by_type = self.trtype.cmp(&other.trtype);
        if by_type != Ordering::Equal {
            return by_type;
        }

        if self.trtype == TransportType::Pcie {
            if let (Ok(a), Ok(b)) = (PciAddress::parse(&self.traddr), PciAddress::parse(&other.traddr)) {
                return a.cmp(&b);
            }
        }

        cmp_ignore_case(&self.traddr, &other.traddr)
            .then_with(|| cmp_opt_ignore_case(&self.trsvcid, &other.trsvcid))
            .then_with(|| self.subnqn.cmp(&other.subnqn))
    }

    pub fn same_controller(&self, other: &TransportId) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
}

fn cmp_opt_ignore_case(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => cmp_ignore_case(a, b),
        _ => a.is_some().cmp(&b.is_some()),
    }
}

impl FromStr for TransportId {
    type Err = BlkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trtype:{}", self.trtype)?;
        if let Some(adrfam) = &self.adrfam {
            write!(f, " adrfam:{}", adrfam)?;
        }
        write!(f, " traddr:{}", self.traddr)?;
        if let Some(trsvcid) = &self.trsvcid {
            write!(f, " trsvcid:{}", trsvcid)?;
        }
        if let Some(subnqn) = &self.subnqn {
            write!(f, " subnqn:{}", subnqn)?;
        }
        Ok(())
    }
}
