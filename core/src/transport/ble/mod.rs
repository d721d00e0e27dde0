/// BLE (Bluetooth Low Energy) protocol helpers
///
/// - **advertisement**: AD structure parsing and service UUID filtering
/// - **gatt**: measurement characteristic subscription on served links
/// - **scanner**: scan window scheduling across the endpoint pool
///
/// Nothing here touches radio hardware; the radios themselves sit behind the
/// `Transport` trait.

pub mod advertisement;
pub mod gatt;
pub mod scanner;

// Re-export commonly used types
pub use advertisement::{find_service_in_ad_data, Advertisement, AdvertisementError, ServiceUuid};
pub use gatt::{
    parse_heart_rate, AttributeHandle, GattError, GattStage, MeasurementProfile, MeasurementTracker,
    HEART_RATE_MEASUREMENT,
};

pub use scanner::{ScanConfig, ScanScheduler, ScanWindow, ScannerError, ScannerState, WindowClose};
