use serde::Serialize;

use crate::domain::DeviceType;

/// Best guess at what answered a discovery probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub device_type: DeviceType,
    pub manufacturer: &'static str,
    pub model: &'static str,
}

/// Classify an RTU device from the line speed it answered at.
///
/// Fronius inverters ship at 19200 baud and SMA Sunny Boys at 9600; anything
/// else is reported as a generic Modbus RTU device.
pub fn classify(baud_rate: u32) -> Classification {
    match baud_rate {
        19_200 => Classification {
            device_type: DeviceType::SolarInverter,
            manufacturer: "Fronius",
            model: "Symo Series",
        },
        9600 => Classification {
            device_type: DeviceType::SolarInverter,
            manufacturer: "SMA",
            model: "Sunny Boy Series",
        },
        _ => Classification {
            device_type: DeviceType::GenericModbus,
            manufacturer: "Generic",
            model: "Modbus RTU Device",
        },
    }
}
