//! Resource-address parsing.
//!
//! Instrument records store a single connection string. Vendor-specific
//! formats are recognised first; anything else is handed to the VISA runtime
//! untouched:
//!
//! - `ATS9360::SYSTEM1::1` (AlazarTech digitizer, system and board id)
//! - `ZI::HDAWG::DEV8123` (Zurich Instruments device type and id)
//! - `PXI0::CHASSIS1::SLOT2::FUNC0::INSTR` (Keysight PXI module)
//! - `OTHER::serial:A1234::INSTR` (vendor with an arbitrary key:value pair)
//! - `GPIB0::12::INSTR`, `TCPIP0::10.0.0.5::INSTR`, ... (plain VISA)
//!
//! Parsing never fails. A string that satisfies no vendor pattern, including a
//! vendor string with malformed fields, degrades to [`ResourceDescriptor::Visa`].

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::fmt;

static ATS_ADDR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ATS(9360|9850|9870)::SYSTEM([0-9]+)::([0-9]+)(?:::INSTR)?$")
        .unwrap_or_else(|e| unreachable!("invalid ATS pattern: {e}"))
});

static ZI_ADDR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ZI::([a-zA-Z]+[0-9]*)::([a-zA-Z-]+[0-9]*)(?:::INSTR)?$")
        .unwrap_or_else(|e| unreachable!("invalid ZI pattern: {e}"))
});

static PXI_ADDR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^PXI([0-9]?)::CHASSIS([0-9]+)::SLOT([0-9]+)::FUNC([0-9]+)::INSTR$")
        .unwrap_or_else(|e| unreachable!("invalid PXI pattern: {e}"))
});

static OTHER_ADDR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^OTHER::([a-zA-Z-]+):(.*)::INSTR$")
        .unwrap_or_else(|e| unreachable!("invalid OTHER pattern: {e}"))
});

static SOCKET_ADDR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^TCPIP[0-9]*::([^:]+)::([0-9]+)::SOCKET$")
        .unwrap_or_else(|e| unreachable!("invalid SOCKET pattern: {e}"))
});

/// Typed form of an instrument connection string.
///
/// Produced fresh by [`parse_resource_name`] for every open; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ResourceDescriptor {
    /// AlazarTech digitizer board.
    #[serde(rename = "ATS")]
    Alazar {
        /// Board model, such as `ATS9870`.
        model: String,
        /// Board system number.
        system_id: u32,
        /// Board number within the system.
        board_id: u32,
        /// Original address.
        addr: String,
    },
    /// Zurich Instruments device reached through the LabOne data server.
    #[serde(rename = "ZI")]
    Zurich {
        /// Device family, such as `HDAWG`.
        model: String,
        /// Device serial, such as `dev8123`.
        device_id: String,
        /// Original address.
        addr: String,
    },
    /// Keysight PXI module.
    #[serde(rename = "PXI")]
    Pxi {
        /// PXI interface number, when given.
        interface: Option<u32>,
        /// Chassis number.
        chassis: u32,
        /// Slot in the chassis.
        slot: u32,
        /// Module function number.
        function: u32,
        /// Original address.
        addr: String,
    },
    /// Vendor without a dedicated format, addressed by one key:value pair.
    #[serde(rename = "OTHER")]
    Other {
        /// Addressing key.
        key: String,
        /// Addressing value.
        value: String,
        /// Original address.
        addr: String,
    },
    /// Anything the VISA runtime understands (GPIB, USB, TCPIP, ASRL, ...).
    Visa {
        /// Original address.
        addr: String,
    },
}

impl ResourceDescriptor {
    /// Vendor type tag: `ATS`, `ZI`, `PXI`, `OTHER` or `Visa`.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceDescriptor::Alazar { .. } => "ATS",
            ResourceDescriptor::Zurich { .. } => "ZI",
            ResourceDescriptor::Pxi { .. } => "PXI",
            ResourceDescriptor::Other { .. } => "OTHER",
            ResourceDescriptor::Visa { .. } => "Visa",
        }
    }

    /// Manufacturer implied by the address format, if any.
    pub fn company(&self) -> Option<&'static str> {
        match self {
            ResourceDescriptor::Alazar { .. } => Some("AlazarTech"),
            ResourceDescriptor::Zurich { .. } => Some("ZurichInstruments"),
            ResourceDescriptor::Pxi { .. } => Some("KeySight"),
            ResourceDescriptor::Other { .. } | ResourceDescriptor::Visa { .. } => None,
        }
    }

    /// The original, unmodified address string.
    pub fn addr(&self) -> &str {
        match self {
            ResourceDescriptor::Alazar { addr, .. }
            | ResourceDescriptor::Zurich { addr, .. }
            | ResourceDescriptor::Pxi { addr, .. }
            | ResourceDescriptor::Other { addr, .. }
            | ResourceDescriptor::Visa { addr } => addr,
        }
    }

    /// Host and port of a raw `TCPIP::host::port::SOCKET` resource.
    pub fn socket_endpoint(&self) -> Option<(String, u16)> {
        let ResourceDescriptor::Visa { addr } = self else {
            return None;
        };
        let caps = SOCKET_ADDR.captures(addr)?;
        let port = caps[2].parse::<u16>().ok()?;
        Some((caps[1].to_string(), port))
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.addr())
    }
}

/// Classifies `addr` into a [`ResourceDescriptor`].
///
/// Patterns are tried in a fixed order (ATS, ZI, PXI, OTHER); the first full
/// match wins. Integer fields that do not fit a `u32` make the pattern count
/// as unmatched.
pub fn parse_resource_name(addr: &str) -> ResourceDescriptor {
    let parsers: [(&Lazy<Regex>, fn(&Captures<'_>, &str) -> Option<ResourceDescriptor>); 4] = [
        (&ATS_ADDR, parse_ats),
        (&ZI_ADDR, parse_zi),
        (&PXI_ADDR, parse_pxi),
        (&OTHER_ADDR, parse_other),
    ];

    parsers
        .iter()
        .find_map(|(pattern, build)| {
            pattern
                .captures(addr)
                .and_then(|caps| build(&caps, addr))
        })
        .unwrap_or_else(|| ResourceDescriptor::Visa {
            addr: addr.to_string(),
        })
}

/// True when `addr` names a raw socket resource (`TCPIP0::host::port::SOCKET`).
pub fn is_socket_address(addr: &str) -> bool {
    SOCKET_ADDR.is_match(addr)
}

fn parse_ats(caps: &Captures<'_>, addr: &str) -> Option<ResourceDescriptor> {
    Some(ResourceDescriptor::Alazar {
        model: format!("ATS{}", &caps[1]),
        system_id: caps[2].parse().ok()?,
        board_id: caps[3].parse().ok()?,
        addr: addr.to_string(),
    })
}

fn parse_zi(caps: &Captures<'_>, addr: &str) -> Option<ResourceDescriptor> {
    Some(ResourceDescriptor::Zurich {
        model: caps[1].to_string(),
        device_id: caps[2].to_string(),
        addr: addr.to_string(),
    })
}

fn parse_pxi(caps: &Captures<'_>, addr: &str) -> Option<ResourceDescriptor> {
    let interface = match &caps[1] {
        "" => None,
        digit => Some(digit.parse().ok()?),
    };
    Some(ResourceDescriptor::Pxi {
        interface,
        chassis: caps[2].parse().ok()?,
        slot: caps[3].parse().ok()?,
        function: caps[4].parse().ok()?,
        addr: addr.to_string(),
    })
}

fn parse_other(caps: &Captures<'_>, addr: &str) -> Option<ResourceDescriptor> {
    Some(ResourceDescriptor::Other {
        key: caps[1].to_string(),
        value: caps[2].to_string(),
        addr: addr.to_string(),
    })
}
