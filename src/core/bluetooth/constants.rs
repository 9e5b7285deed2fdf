//! Constants used throughout the daemon: GATT UUIDs, company identifiers,
//! and the deadlines for each suspension point.

use std::time::Duration;
use uuid::Uuid;

/// Bluetooth company identifier assigned to Wacom.
pub const WACOM_COMPANY_ID: u16 = 0x4755;

/// Length of the manufacturer-data payload a SmartPad advertises while it
/// is in pairing mode.
pub const PAIRING_MANUFACTURER_DATA_LEN: usize = 4;

/// Nordic-UART-like service carrying commands and bulk stroke data.
pub const UUID_UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Host → tablet command characteristic.
pub const UUID_UART_WRITE_CHAR: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Tablet → host response/bulk characteristic.
pub const UUID_UART_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Vendor service streaming pen events while in live mode.
pub const UUID_LIVE_SERVICE: Uuid = Uuid::from_u128(0x00001523_1212_efde_1523_785feabcd123);
pub const UUID_LIVE_PEN_CHAR: Uuid = Uuid::from_u128(0x00001524_1212_efde_1523_785feabcd123);

/// Vendor service whose notification characteristic reports button
/// presses. Absent on the Spark family.
pub const UUID_BUTTON_SERVICE: Uuid = Uuid::from_u128(0x3a340720_c572_11e5_86c5_0002a5d5c51b);
pub const UUID_BUTTON_CHAR: Uuid = Uuid::from_u128(0x3a340721_c572_11e5_86c5_0002a5d5c51b);

/// How long a single StartSearch scans before SearchStopped fires.
pub const SEARCH_DURATION: Duration = Duration::from_secs(60);

/// Scan window used while listening for a registered device to reappear.
pub const LISTEN_SCAN_WINDOW: Duration = Duration::from_secs(30);

/// Deadline for a command's response frame.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the user to press the physical button during registration.
pub const BUTTON_PRESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the authentication acknowledgement.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the next pen-data record during a fetch.
pub const PEN_DATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Battery refresh interval while a listening device stays connected.
pub const BATTERY_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Device clock drift beyond this is logged as an error at fetch time.
pub const CLOCK_DRIFT_WARNING: Duration = Duration::from_secs(300);
