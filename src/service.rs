//! GATT schema of the air quality peripheral.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::attribute::{
    AttributeTable, Characteristic, CharacteristicProp, Service, Uuid, CHARACTERISTIC_DEVICE_NAME_UUID16,
    GENERIC_ACCESS_SERVICE_UUID16,
};
use crate::sensor::ValueSource;

/// UUID of the environmental sensing service.
pub const ENVIRONMENTAL_SENSING_UUID16: Uuid = Uuid::new_short(0x181a);
/// UUID of the CO2 concentration characteristic.
pub const CO2_CONCENTRATION_UUID16: Uuid = Uuid::new_short(0x2b8c);
/// UUID of the temperature characteristic.
pub const TEMPERATURE_UUID16: Uuid = Uuid::new_short(0x2a6e);

/// Writes to the CO2 characteristic carry a full 8-byte calibration frame.
pub const CO2_WRITE_LEN: usize = 8;

/// Value storage backing the service, borrowed by the attribute table.
pub struct AirQualityStorage {
    co2: [u8; CO2_WRITE_LEN],
    temperature: [u8; 2],
}

impl Default for AirQualityStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl AirQualityStorage {
    /// Zeroed storage.
    pub const fn new() -> Self {
        Self {
            co2: [0; CO2_WRITE_LEN],
            temperature: [0; 2],
        }
    }
}

/// Handles of the built service.
pub struct AirQualityService {
    /// CO2 concentration in ppm, little-endian u16 on read and notify.
    pub co2: Characteristic,
    /// Temperature characteristic.
    pub temperature: Characteristic,
}

impl AirQualityService {
    /// Register the generic access and environmental sensing services.
    ///
    /// The CO2 value record serves the latest sampled reading on read, and
    /// only accepts full 8-byte calibration frames on write. Both sensing
    /// characteristics are dynamic-on-read from their sources.
    pub fn build<'d, M: RawMutex, const MAX: usize>(
        table: &mut AttributeTable<'d, M, MAX>,
        storage: &'d mut AirQualityStorage,
        device_name: &'d [u8],
        co2_source: &'d dyn ValueSource,
        temperature_source: &'d dyn ValueSource,
    ) -> Self {
        {
            let mut gap = table.add_service(Service::new(GENERIC_ACCESS_SERVICE_UUID16));
            gap.add_characteristic_ro(CHARACTERISTIC_DEVICE_NAME_UUID16, device_name)
                .build();
        }

        let mut svc = table.add_service(Service::new(ENVIRONMENTAL_SENSING_UUID16));
        let co2 = svc
            .add_characteristic(
                CO2_CONCENTRATION_UUID16,
                &[
                    CharacteristicProp::Read,
                    CharacteristicProp::Write,
                    CharacteristicProp::Notify,
                ],
                &mut storage.co2[..],
            )
            .fixed_write_len(CO2_WRITE_LEN)
            .value(&[0, 0])
            .dynamic(co2_source)
            .build();

        let temperature = svc
            .add_characteristic(
                TEMPERATURE_UUID16,
                &[CharacteristicProp::Read, CharacteristicProp::Notify],
                &mut storage.temperature[..],
            )
            .value(&[0, 0])
            .dynamic(temperature_source)
            .build();

        Self { co2, temperature }
    }
}
