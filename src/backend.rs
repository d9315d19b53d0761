use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::model::UsbEndpointType;

/// Error raised by the native USB transport.
///
/// `Stall` and `Babble` are bus conditions the adapter turns into a transfer
/// status; every other variant is propagated to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
  #[error("endpoint stalled")]
  Stall,
  #[error("transfer overflow")]
  Babble,
  #[error("device is not open")]
  NotOpen,
  #[error("no such device (it may have been disconnected)")]
  NoDevice,
  #[error("access denied (insufficient permissions)")]
  Access,
  #[error("resource busy")]
  Busy,
  #[error("operation timed out")]
  Timeout,
  #[error("operation not supported")]
  NotSupported,
  #[error("{0}")]
  Other(String),
}

impl TransportError {
  /// Whether retrying the same request may succeed. A busy or settling
  /// device is; a missing device or a permission problem is not.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      TransportError::Busy | TransportError::Timeout | TransportError::Other(_)
    )
  }
}

/// Standard device descriptor, as reported by the host stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
  pub bcd_usb: u16,
  pub device_class: u8,
  pub device_subclass: u8,
  pub device_protocol: u8,
  pub max_packet_size0: u8,
  pub vendor_id: u16,
  pub product_id: u16,
  pub bcd_device: u16,
  pub manufacturer_string_index: Option<u8>,
  pub product_string_index: Option<u8>,
  pub serial_number_string_index: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDescriptor {
  pub configuration_value: u8,
  pub configuration_string_index: Option<u8>,
  /// One entry per interface number, each holding every alternate setting.
  pub interfaces: Vec<Vec<InterfaceDescriptor>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceDescriptor {
  pub interface_number: u8,
  pub alternate_setting: u8,
  pub interface_class: u8,
  pub interface_subclass: u8,
  pub interface_protocol: u8,
  pub interface_string_index: Option<u8>,
  pub endpoints: Vec<EndpointDescriptor>,
}

/// Raw endpoint descriptor: `bEndpointAddress`, `bmAttributes` and
/// `wMaxPacketSize`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointDescriptor {
  pub address: u8,
  pub attributes: u8,
  pub max_packet_size: u16,
}

/// Snapshot of every descriptor a device exposes without I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSet {
  pub device: DeviceDescriptor,
  /// `bConfigurationValue` of the active configuration, if any.
  pub active_configuration: Option<u8>,
  pub configurations: Vec<ConfigDescriptor>,
}

/// A device capability from the BOS descriptor. `data` begins right after
/// `bDevCapabilityType`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformCapability {
  pub capability_type: u8,
  pub data: Vec<u8>,
}

pub enum HotplugEvent {
  Arrived(Arc<dyn NativeDevice>),
  Left { bus: u8, address: u8 },
}

/// Keeps native attach/detach listening alive until dropped.
pub type HotplugGuard = Box<dyn Send>;

/// A device as seen by the host USB driver library.
///
/// Metadata reads and transfers require the device to be open.
#[async_trait::async_trait]
pub trait NativeDevice: Send + Sync {
  fn bus_number(&self) -> u8;
  fn address(&self) -> u8;

  fn descriptors(&self) -> Result<DescriptorSet, TransportError>;
  fn is_open(&self) -> bool;

  async fn open(&self) -> Result<(), TransportError>;
  async fn close(&self) -> Result<(), TransportError>;

  async fn capabilities(
    &self,
  ) -> Result<Vec<PlatformCapability>, TransportError>;
  async fn string_descriptor(&self, index: u8)
    -> Result<String, TransportError>;

  async fn control_transfer_in(
    &self,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: usize,
  ) -> Result<Vec<u8>, TransportError>;
  async fn control_transfer_out(
    &self,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    data: &[u8],
  ) -> Result<usize, TransportError>;

  async fn set_configuration(
    &self,
    configuration_value: u8,
  ) -> Result<(), TransportError>;
  async fn claim_interface(
    &self,
    interface_number: u8,
  ) -> Result<(), TransportError>;
  async fn release_interface(
    &self,
    interface_number: u8,
  ) -> Result<(), TransportError>;
  async fn set_alternate_setting(
    &self,
    interface_number: u8,
    alternate_setting: u8,
  ) -> Result<(), TransportError>;

  async fn transfer_in(
    &self,
    endpoint_address: u8,
    transfer_type: UsbEndpointType,
    length: usize,
  ) -> Result<Vec<u8>, TransportError>;
  async fn transfer_out(
    &self,
    endpoint_address: u8,
    transfer_type: UsbEndpointType,
    data: &[u8],
  ) -> Result<usize, TransportError>;

  async fn reset(&self) -> Result<(), TransportError>;
}

/// Describes a Usb backend. This lets target native, mocked and even *nothing*
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
  /// List all devices.
  async fn devices(&self) -> Result<Vec<Arc<dyn NativeDevice>>, TransportError>;

  /// Start forwarding attach/detach notifications to `events`. Listening
  /// stops when the returned guard is dropped.
  fn watch(
    &self,
    events: UnboundedSender<HotplugEvent>,
  ) -> Result<HotplugGuard, TransportError>;
}
