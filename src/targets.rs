use serde::Serialize;
use thiserror::Error;

use crate::chip;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Usb,
    Pci,
    Bluetooth,
    Unknown,
}

/// USB-UART bridge chips commonly used to reach a Bouffalo Lab boot ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsbBridge {
    Ch34x,
    Cp210x,
    Ftdi,
    BouffaloCdc,
}

impl UsbBridge {
    pub fn from_vid(vid: u16) -> Option<Self> {
        match vid {
            chip::VID_WCH => Some(UsbBridge::Ch34x),
            chip::VID_SILABS => Some(UsbBridge::Cp210x),
            chip::VID_FTDI => Some(UsbBridge::Ftdi),
            chip::VID_BOUFFALO => Some(UsbBridge::BouffaloCdc),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            UsbBridge::Ch34x => "CH34x",
            UsbBridge::Cp210x => "CP210x",
            UsbBridge::Ftdi => "FTDI",
            UsbBridge::BouffaloCdc => "Bouffalo CDC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub port_name: String,
    pub kind: PortKind,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub bridge: Option<UsbBridge>,
}

impl Target {
    /// A port named explicitly by the user that enumeration did not report.
    pub fn from_port_name(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            kind: PortKind::Unknown,
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
            bridge: None,
        }
    }

    pub fn id(&self) -> String {
        format!("serial:{}", self.port_name)
    }

    pub fn matches_port(&self, port: &str) -> bool {
        if cfg!(windows) {
            self.port_name.eq_ignore_ascii_case(port)
        } else {
            self.port_name == port
        }
    }
}

impl From<serialport::SerialPortInfo> for Target {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let serialport::SerialPortInfo {
            port_name,
            port_type,
        } = info;

        match port_type {
            serialport::SerialPortType::UsbPort(usb) => Target {
                port_name,
                kind: PortKind::Usb,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                bridge: UsbBridge::from_vid(usb.vid),
                serial_number: usb.serial_number,
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            serialport::SerialPortType::PciPort => Target {
                kind: PortKind::Pci,
                ..Target::from_port_name(&port_name)
            },
            serialport::SerialPortType::BluetoothPort => Target {
                kind: PortKind::Bluetooth,
                ..Target::from_port_name(&port_name)
            },
            serialport::SerialPortType::Unknown => Target::from_port_name(&port_name),
        }
    }
}

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("serial discovery failed: {0}")]
    Serial(#[from] serialport::Error),
}

pub fn discover_targets() -> Result<Vec<Target>, DiscoverError> {
    let mut out: Vec<Target> = serialport::available_ports()?
        .into_iter()
        .filter(|p| !matches!(p.port_type, serialport::SerialPortType::BluetoothPort))
        .map(Target::from)
        .collect();

    sort_targets(&mut out);
    tracing::debug!(count = out.len(), "serial ports discovered");
    Ok(out)
}

/// USB ports first, then by port name.
pub fn sort_targets(targets: &mut [Target]) {
    targets.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| a.port_name.cmp(&b.port_name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(port: &str, vid: u16) -> Target {
        Target {
            port_name: port.to_string(),
            kind: PortKind::Usb,
            vid: Some(vid),
            pid: Some(0x7523),
            serial_number: None,
            manufacturer: None,
            product: None,
            bridge: UsbBridge::from_vid(vid),
        }
    }

    #[test]
    fn target_id_format() {
        assert_eq!(usb("COM6", chip::VID_WCH).id(), "serial:COM6");
        assert_eq!(
            Target::from_port_name("/dev/ttyUSB0").id(),
            "serial:/dev/ttyUSB0"
        );
    }

    #[test]
    fn bridge_detection_by_vid() {
        assert_eq!(UsbBridge::from_vid(0x1A86), Some(UsbBridge::Ch34x));
        assert_eq!(UsbBridge::from_vid(0x10C4), Some(UsbBridge::Cp210x));
        assert_eq!(UsbBridge::from_vid(0x16C0), None);
    }

    #[test]
    fn usb_ports_sort_first() {
        let mut ts = vec![
            Target {
                kind: PortKind::Pci,
                ..Target::from_port_name("/dev/ttyS0")
            },
            usb("/dev/ttyUSB1", chip::VID_FTDI),
            usb("/dev/ttyUSB0", chip::VID_WCH),
        ];
        sort_targets(&mut ts);
        let names: Vec<&str> = ts.iter().map(|t| t.port_name.as_str()).collect();
        assert_eq!(names, vec!["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyS0"]);
    }
}
