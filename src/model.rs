use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::backend::ConfigDescriptor;
use crate::backend::EndpointDescriptor;
use crate::backend::InterfaceDescriptor;
use crate::backend::NativeDevice;
use crate::constants::*;

/// Reads a string descriptor, giving an empty string for a missing index or
/// a failed request.
pub(crate) async fn read_string(
  device: &dyn NativeDevice,
  index: Option<u8>,
) -> String {
  let index = match index {
    Some(idx) if idx != 0 => idx,
    _ => return String::new(),
  };

  match device.string_descriptor(index).await {
    Ok(s) => s,
    Err(err) => {
      debug!(index, %err, "string descriptor unavailable");
      String::new()
    }
  }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsbConfiguration {
  pub configuration_name: String,
  // The configuration number (bConfigurationValue)
  // https://www.beyondlogic.org/usbnutshell/usb5.shtml#ConfigurationDescriptors
  pub configuration_value: u8,
  pub interfaces: Vec<UsbInterface>,
}

impl UsbConfiguration {
  pub(crate) async fn from_descriptor(
    config_descriptor: &ConfigDescriptor,
    device: &dyn NativeDevice,
  ) -> Self {
    let mut interfaces = Vec::with_capacity(config_descriptor.interfaces.len());
    for alternates in &config_descriptor.interfaces {
      if let Some(interface) =
        UsbInterface::from_descriptors(alternates, device).await
      {
        interfaces.push(interface);
      }
    }

    UsbConfiguration {
      configuration_name: read_string(
        device,
        config_descriptor.configuration_string_index,
      )
      .await,
      configuration_value: config_descriptor.configuration_value,
      interfaces,
    }
  }

  pub fn interface(&self, interface_number: u8) -> Option<&UsbInterface> {
    self
      .interfaces
      .iter()
      .find(|i| i.interface_number == interface_number)
  }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsbInterface {
  pub interface_number: u8,
  pub alternates: Vec<UsbAlternateInterface>,
}

impl UsbInterface {
  /// `None` for an interface without any alternate setting.
  pub(crate) async fn from_descriptors(
    descriptors: &[InterfaceDescriptor],
    device: &dyn NativeDevice,
  ) -> Option<Self> {
    let interface_number = descriptors.first()?.interface_number;

    let mut alternates = Vec::with_capacity(descriptors.len());
    for d in descriptors {
      alternates.push(UsbAlternateInterface::from_descriptor(d, device).await);
    }

    Some(UsbInterface {
      interface_number,
      alternates,
    })
  }

  pub fn alternate(
    &self,
    alternate_setting: u8,
  ) -> Option<&UsbAlternateInterface> {
    self
      .alternates
      .iter()
      .find(|a| a.alternate_setting == alternate_setting)
  }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsbAlternateInterface {
  pub alternate_setting: u8,
  pub interface_class: u8,
  pub interface_subclass: u8,
  pub interface_protocol: u8,
  pub interface_name: String,
  pub endpoints: Vec<UsbEndpoint>,
}

impl UsbAlternateInterface {
  pub(crate) async fn from_descriptor(
    d: &InterfaceDescriptor,
    device: &dyn NativeDevice,
  ) -> Self {
    UsbAlternateInterface {
      alternate_setting: d.alternate_setting,
      interface_class: d.interface_class,
      interface_subclass: d.interface_subclass,
      interface_protocol: d.interface_protocol,
      interface_name: read_string(device, d.interface_string_index).await,
      endpoints: d.endpoints.iter().map(UsbEndpoint::from).collect(),
    }
  }

  pub fn endpoint(
    &self,
    direction: Direction,
    endpoint_number: u8,
  ) -> Option<&UsbEndpoint> {
    self.endpoints.iter().find(|e| {
      e.endpoint_number == endpoint_number && e.direction == direction
    })
  }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UsbEndpointType {
  Bulk,
  Interrupt,
  Isochronous,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  In,
  Out,
}

impl Direction {
  fn bit(self) -> u8 {
    match self {
      Direction::In => ENDPOINT_DIR_IN,
      Direction::Out => ENDPOINT_DIR_OUT,
    }
  }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsbEndpoint {
  pub endpoint_number: u8,
  pub direction: Direction,
  pub r#type: UsbEndpointType,
  pub packet_size: u16,
}

impl UsbEndpoint {
  /// `bEndpointAddress` of this endpoint.
  pub fn address(&self) -> u8 {
    endpoint_address(self.direction, self.endpoint_number)
  }
}

pub(crate) fn endpoint_address(
  direction: Direction,
  endpoint_number: u8,
) -> u8 {
  endpoint_number | direction.bit()
}

impl From<&EndpointDescriptor> for UsbEndpoint {
  fn from(e: &EndpointDescriptor) -> Self {
    let direction = if e.address & ENDPOINT_DIR_IN != 0 {
      Direction::In
    } else {
      Direction::Out
    };

    UsbEndpoint {
      endpoint_number: e.address & !ENDPOINT_DIR_IN,
      direction,
      // Control endpoints never appear in interface descriptors.
      r#type: match e.attributes & TRANSFER_TYPE_MASK {
        TRANSFER_TYPE_BULK => UsbEndpointType::Bulk,
        TRANSFER_TYPE_INTERRUPT => UsbEndpointType::Interrupt,
        _ => UsbEndpointType::Isochronous,
      },
      packet_size: e.max_packet_size,
    }
  }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsbRequestType {
  Standard,
  Class,
  Vendor,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsbRecipient {
  Device,
  Interface,
  Endpoint,
  Other,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsbControlTransferParameters {
  pub request_type: UsbRequestType,
  pub recipient: UsbRecipient,
  pub request: u8,
  pub value: u16,
  pub index: u16,
}

impl UsbControlTransferParameters {
  /// `bmRequestType` for this setup packet.
  pub fn bm_request_type(&self, direction: Direction) -> u8 {
    let recipient = match self.recipient {
      UsbRecipient::Device => 0x00,
      UsbRecipient::Interface => 0x01,
      UsbRecipient::Endpoint => 0x02,
      UsbRecipient::Other => 0x03,
    };
    let request_type = match self.request_type {
      UsbRequestType::Standard => 0x00,
      UsbRequestType::Class => 0x20,
      UsbRequestType::Vendor => 0x40,
    };

    recipient | request_type | direction.bit()
  }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsbTransferStatus {
  Ok,
  Stall,
  Babble,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsbInTransferResult {
  pub data: Vec<u8>,
  pub status: UsbTransferStatus,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsbOutTransferResult {
  pub bytes_written: usize,
  pub status: UsbTransferStatus,
}
