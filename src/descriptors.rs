use crate::backend::PlatformCapability;
use crate::constants::*;

macro_rules! assert_return {
  ($e: expr) => {
    if $e {
      return None;
    }
  };
}

/// Version triple decoded from a packed BCD field (`bcdUSB`, `bcdDevice`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsbVersion {
  pub major: u8,
  pub minor: u8,
  pub sub: u8,
}

/// Formats a 16 byte, mixed-endian GUID as `8-4-4-4-12` lowercase hex.
pub fn decode_uuid(bytes: &[u8; 16]) -> String {
  let data1 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
  let data2 = u16::from_le_bytes([bytes[4], bytes[5]]);
  let data3 = u16::from_le_bytes([bytes[6], bytes[7]]);
  let hex = |bytes: &[u8]| -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
  };
  let data4 = hex(&bytes[8..10]);
  let data5 = hex(&bytes[10..16]);

  format!("{:08x}-{:04x}-{:04x}-{}-{}", data1, data2, data3, data4, data5)
}

/// `0xJJMN` is read as major `JJ`, minor `M`, sub `N`. Any nibble above 9
/// yields all zeros.
pub fn decode_bcd_version(version: u16) -> UsbVersion {
  let digits = [
    (version >> 12) as u8 & 0xF,
    (version >> 8) as u8 & 0xF,
    (version >> 4) as u8 & 0xF,
    version as u8 & 0xF,
  ];
  if digits.iter().any(|d| *d > 9) {
    return UsbVersion::default();
  }

  UsbVersion {
    major: digits[0] * 10 + digits[1],
    minor: digits[2],
    sub: digits[3],
  }
}

// https://wicg.github.io/webusb/#webusb-platform-capability-descriptor
//
// Layout of `data`: bReserved, PlatformCapabilityUUID[16], bcdVersion[2],
// bVendorCode, iLandingPage.
pub fn find_web_capability(
  capabilities: &[PlatformCapability],
) -> Option<&PlatformCapability> {
  capabilities
    .iter()
    .filter(|c| c.capability_type == PLATFORM_DEV_CAPABILITY_TYPE)
    .find(|c| {
      let uuid = match c
        .data
        .get(1..17)
        .and_then(|bytes| <&[u8; 16]>::try_from(bytes).ok())
      {
        Some(uuid) => uuid,
        None => return false,
      };
      let version = match c.data.get(17..19) {
        Some(v) => u16::from_le_bytes([v[0], v[1]]),
        None => return false,
      };
      decode_uuid(uuid) == WEB_USB_UUID
        && version == WEB_USB_CAPABILITY_VERSION
    })
}

/// Vendor code and landing page index advertised by a WebUSB capability.
pub fn landing_page_request(
  capability: &PlatformCapability,
) -> Option<(u8, u8)> {
  assert_return!(capability.data.len() < 20);

  let vendor_code = capability.data[19];
  let landing_page_id = *capability.data.get(20)?;
  Some((vendor_code, landing_page_id))
}

// http://wicg.github.io/webusb/#dfn-url-descriptor
//
// bLength is not enforced, the URL runs to the end of the reply. Schemes
// other than 0 and 1 are taken as a complete URL.
pub fn parse_url_descriptor(bytes: &[u8]) -> Option<String> {
  assert_return!(bytes.len() < 3);

  let text = String::from_utf8_lossy(&bytes[3..]);
  let url = match bytes[2] {
    0 => format!("http://{}", text),
    1 => format!("https://{}", text),
    _ => text.into_owned(),
  };
  Some(url)
}

// Based on Chromium implementation https://source.chromium.org/chromium/chromium/src/+/main:services/device/usb/webusb_descriptors.cc;l=133;
pub fn parse_bos(bytes: &[u8]) -> Option<Vec<PlatformCapability>> {
  // Too short
  assert_return!(bytes.len() < BOS_DESCRIPTOR_SIZE);

  let total_length = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;

  // Validate BOS header
  // bLength
  assert_return!(bytes[0] as usize != BOS_DESCRIPTOR_SIZE);
  // bDescriptorType
  assert_return!(bytes[1] != BOS_DESCRIPTOR_TYPE as u8);
  // wTotalLength
  assert_return!(
    total_length < BOS_DESCRIPTOR_SIZE || total_length > bytes.len()
  );

  // bNumDeviceCaps
  let num_device_caps = bytes[4];
  let mut rest = &bytes[BOS_DESCRIPTOR_SIZE..];
  let mut capabilities = Vec::with_capacity(num_device_caps as usize);

  for _ in 0..num_device_caps {
    assert_return!(rest.len() < 3);

    // bLength
    let length = rest[0] as usize;
    assert_return!(length < 3);
    assert_return!(rest.len() < length);
    // bDescriptorType
    assert_return!(rest[1] != DEVICE_CAPABILITY_DESCRIPTOR_TYPE);

    capabilities.push(PlatformCapability {
      // bDevCapabilityType
      capability_type: rest[2],
      data: rest[3..length].to_vec(),
    });
    rest = &rest[length..];
  }

  Some(capabilities)
}
