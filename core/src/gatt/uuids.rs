//! Well-known 16-bit GATT UUIDs expanded onto the Bluetooth base UUID

use uuid::Uuid;

const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16-bit assigned number to a full UUID
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = from_short(0x2902);

pub const GENERIC_ACCESS: Uuid = from_short(0x1800);
pub const GENERIC_ATTRIBUTE: Uuid = from_short(0x1801);
pub const DEVICE_INFORMATION: Uuid = from_short(0x180A);
pub const BATTERY_SERVICE: Uuid = from_short(0x180F);

pub const DEVICE_NAME: Uuid = from_short(0x2A00);
pub const APPEARANCE: Uuid = from_short(0x2A01);
pub const SERVICE_CHANGED: Uuid = from_short(0x2A05);
pub const BATTERY_LEVEL: Uuid = from_short(0x2A19);
pub const MODEL_NUMBER: Uuid = from_short(0x2A24);
pub const SERIAL_NUMBER: Uuid = from_short(0x2A25);
pub const FIRMWARE_REVISION: Uuid = from_short(0x2A26);
pub const HARDWARE_REVISION: Uuid = from_short(0x2A27);
pub const SOFTWARE_REVISION: Uuid = from_short(0x2A28);
pub const MANUFACTURER_NAME: Uuid = from_short(0x2A29);

static KNOWN: &[(Uuid, &str)] = &[
    (CLIENT_CHARACTERISTIC_CONFIG, "Client Characteristic Configuration"),
    (GENERIC_ACCESS, "Generic Access"),
    (GENERIC_ATTRIBUTE, "Generic Attribute"),
    (DEVICE_INFORMATION, "Device Information"),
    (BATTERY_SERVICE, "Battery Service"),
    (DEVICE_NAME, "Device Name"),
    (APPEARANCE, "Appearance"),
    (SERVICE_CHANGED, "Service Changed"),
    (BATTERY_LEVEL, "Battery Level"),
    (MODEL_NUMBER, "Model Number String"),
    (SERIAL_NUMBER, "Serial Number String"),
    (FIRMWARE_REVISION, "Firmware Revision String"),
    (HARDWARE_REVISION, "Hardware Revision String"),
    (SOFTWARE_REVISION, "Software Revision String"),
    (MANUFACTURER_NAME, "Manufacturer Name String"),
];

/// Assigned name of a well-known UUID
pub fn name_of(uuid: &Uuid) -> Option<&'static str> {
    KNOWN
        .iter()
        .find(|(known, _)| known == uuid)
        .map(|(_, name)| *name)
}

/// `name (uuid)` when known, otherwise just the UUID
pub fn describe(uuid: &Uuid) -> String {
    match name_of(uuid) {
        Some(name) => format!("{} ({})", name, uuid),
        None => uuid.to_string(),
    }
}
