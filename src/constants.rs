use std::time::Duration;

pub const DEVICE_CAPABILITY_DESCRIPTOR_TYPE: u8 = 0x10;
pub const PLATFORM_DEV_CAPABILITY_TYPE: u8 = 0x05;
pub const BOS_DESCRIPTOR_TYPE: u16 = 0x0F;
pub const BOS_DESCRIPTOR_SIZE: usize = 0x05;
pub const GET_DESCRIPTOR_REQUEST: u8 = 0x06;

/// Canonical form of the WebUSB platform capability UUID.
pub const WEB_USB_UUID: &str = "3408b638-09a9-47a0-8bfd-a0768815b665";
/// Little-endian encoding of {3408b638-09a9-47a0-8bfd-a0768815b665}.
pub const WEB_USB_CAPABILITY_UUID: &[u8; 16] = &[
  0x38, 0xB6, 0x08, 0x34, 0xA9, 0x09, 0xA0, 0x47, 0x8B, 0xFD, 0xA0, 0x76, 0x88,
  0x15, 0xB6, 0x65,
];
pub const WEB_USB_CAPABILITY_VERSION: u16 = 0x0100;

// GET_URL vendor request.
pub const URL_REQUEST_TYPE: u8 = 0xC0;
pub const URL_REQUEST_INDEX: u16 = 0x02;
pub const URL_REQUEST_LENGTH: usize = 64;

pub const CLEAR_FEATURE_REQUEST: u8 = 0x01;
pub const ENDPOINT_HALT_FEATURE: u16 = 0x00;
pub const RECIPIENT_ENDPOINT: u8 = 0x02;

pub const ENDPOINT_DIR_IN: u8 = 0x80;
pub const ENDPOINT_DIR_OUT: u8 = 0x00;
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0F;
pub const TRANSFER_TYPE_MASK: u8 = 0x03;
pub const TRANSFER_TYPE_BULK: u8 = 0x02;
pub const TRANSFER_TYPE_INTERRUPT: u8 = 0x03;

pub const DEFAULT_RETRY_COUNT: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
