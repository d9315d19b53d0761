use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use serde::Serialize;
use tracing::debug;

use crate::adapter::UsbAdapter;
use crate::backend::DeviceDescriptor;
use crate::backend::NativeDevice;
use crate::constants::ENDPOINT_DIR_IN;
use crate::constants::ENDPOINT_NUMBER_MASK;
use crate::descriptors::decode_bcd_version;
use crate::lock;
use crate::model::*;
use crate::Error;
use crate::Result;
use crate::Target;

/// Identifies a connected device by bus number and address. A device that
/// is unplugged and plugged back in gets a new handle.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
)]
pub struct DeviceHandle {
  bus: u8,
  address: u8,
}

impl DeviceHandle {
  pub fn new(bus: u8, address: u8) -> Self {
    Self { bus, address }
  }

  pub(crate) fn of(device: &dyn NativeDevice) -> Self {
    Self::new(device.bus_number(), device.address())
  }

  pub fn bus(&self) -> u8 {
    self.bus
  }

  pub fn address(&self) -> u8 {
    self.address
  }
}

impl fmt::Display for DeviceHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.bus, self.address)
  }
}

/// Identity that survives reconnection, used by the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
  pub vendor_id: u16,
  pub product_id: u16,
  pub serial_number: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct InterfaceState {
  claimed: bool,
  alternate_setting: u8,
}

/// Session state of one connection, shared by every [`UsbDevice`] built
/// for the same handle.
#[derive(Debug, Default)]
pub(crate) struct DeviceState {
  current_configuration: Option<u8>,
  // Absent entries are unclaimed at alternate setting 0.
  interfaces: HashMap<u8, InterfaceState>,
}

impl DeviceState {
  pub(crate) fn new(current_configuration: Option<u8>) -> Self {
    Self {
      current_configuration,
      interfaces: HashMap::new(),
    }
  }

  fn interface(&self, interface_number: u8) -> InterfaceState {
    self
      .interfaces
      .get(&interface_number)
      .copied()
      .unwrap_or_default()
  }

  fn interface_mut(&mut self, interface_number: u8) -> &mut InterfaceState {
    self.interfaces.entry(interface_number).or_default()
  }
}

/// Represents a WebUSB UsbDevice.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDevice {
  pub usb_version_major: u8,
  pub usb_version_minor: u8,
  pub usb_version_subminor: u8,
  pub device_class: u8,
  pub device_subclass: u8,
  pub device_protocol: u8,
  pub vendor_id: u16,
  pub product_id: u16,
  pub device_version_major: u8,
  pub device_version_minor: u8,
  pub device_version_subminor: u8,
  pub manufacturer_name: String,
  pub product_name: String,
  pub serial_number: String,
  pub configurations: Vec<UsbConfiguration>,
  /// The `WEBUSB_URL` value. Present in devices with the WebUSB Platform
  /// Capability Descriptor.
  pub url: Option<String>,
  #[serde(skip)]
  pub max_packet_size0: u8,
  #[serde(skip)]
  handle: DeviceHandle,
  #[serde(skip)]
  state: Arc<Mutex<DeviceState>>,
  #[serde(skip)]
  adapter: Arc<UsbAdapter>,
}

pub(crate) struct DeviceStrings {
  pub manufacturer_name: String,
  pub product_name: String,
  pub serial_number: String,
}

impl UsbDevice {
  pub(crate) fn new(
    adapter: Arc<UsbAdapter>,
    handle: DeviceHandle,
    state: Arc<Mutex<DeviceState>>,
    descriptor: &DeviceDescriptor,
    strings: DeviceStrings,
    configurations: Vec<UsbConfiguration>,
    url: Option<String>,
  ) -> Self {
    let usb_version = decode_bcd_version(descriptor.bcd_usb);
    let device_version = decode_bcd_version(descriptor.bcd_device);

    UsbDevice {
      usb_version_major: usb_version.major,
      usb_version_minor: usb_version.minor,
      usb_version_subminor: usb_version.sub,
      device_class: descriptor.device_class,
      device_subclass: descriptor.device_subclass,
      device_protocol: descriptor.device_protocol,
      vendor_id: descriptor.vendor_id,
      product_id: descriptor.product_id,
      device_version_major: device_version.major,
      device_version_minor: device_version.minor,
      device_version_subminor: device_version.sub,
      manufacturer_name: strings.manufacturer_name,
      product_name: strings.product_name,
      serial_number: strings.serial_number,
      configurations,
      url,
      max_packet_size0: descriptor.max_packet_size0,
      handle,
      state,
      adapter,
    }
  }

  pub fn handle(&self) -> DeviceHandle {
    self.handle
  }

  pub fn identity(&self) -> DeviceIdentity {
    DeviceIdentity {
      vendor_id: self.vendor_id,
      product_id: self.product_id,
      serial_number: self.serial_number.clone(),
    }
  }

  /// `false` once the device was unplugged. A stale device rejects every
  /// operation.
  pub fn connected(&self) -> bool {
    self.adapter.is_connected(self.handle)
  }

  pub fn opened(&self) -> bool {
    self.adapter.is_opened(self.handle)
  }

  /// The currently selected configuration.
  pub fn configuration(&self) -> Option<&UsbConfiguration> {
    let current = self.state().current_configuration?;
    self
      .configurations
      .iter()
      .find(|c| c.configuration_value == current)
  }

  /// Interface `interface_number` of the current configuration.
  pub fn interface(&self, interface_number: u8) -> Option<&UsbInterface> {
    self.configuration()?.interface(interface_number)
  }

  pub fn is_claimed(&self, interface_number: u8) -> bool {
    self.state().interface(interface_number).claimed
  }

  /// The selected alternate setting of an interface in the current
  /// configuration.
  pub fn alternate(
    &self,
    interface_number: u8,
  ) -> Option<&UsbAlternateInterface> {
    let alternate_setting =
      self.state().interface(interface_number).alternate_setting;
    self.interface(interface_number)?.alternate(alternate_setting)
  }

  fn state(&self) -> MutexGuard<'_, DeviceState> {
    lock(&self.state)
  }

  /// Endpoint of the current alternate settings, with its interface number.
  fn find_endpoint(
    &self,
    direction: Direction,
    endpoint_number: u8,
  ) -> Option<(&UsbEndpoint, u8)> {
    self.configuration()?.interfaces.iter().find_map(|itf| {
      self
        .alternate(itf.interface_number)?
        .endpoint(direction, endpoint_number)
        .map(|endpoint| (endpoint, itf.interface_number))
    })
  }

  fn check_connected(&self) -> Result<()> {
    if !self.connected() {
      return Err(Error::NotFound(Target::Device));
    }
    Ok(())
  }

  pub async fn open(&self) -> Result<()> {
    self.check_connected()?;
    // Already open?
    if self.opened() {
      return Ok(());
    }

    self.adapter.open(self.handle).await
  }

  pub async fn close(&self) -> Result<()> {
    self.check_connected()?;
    // Already closed?
    if !self.opened() {
      return Ok(());
    }

    self.adapter.close(self.handle).await?;
    // Closing the native handle drops every claim.
    self.state().interfaces.clear();
    Ok(())
  }

  /// `configuration_value` is the bConfigurationValue of the device
  /// configuration.
  ///
  /// Every interface goes back to unclaimed at alternate setting 0.
  pub async fn select_configuration(
    &self,
    configuration_value: u8,
  ) -> Result<()> {
    // Don't change the configuration if it's already set correctly.
    let current = self.state().current_configuration;
    if current == Some(configuration_value) {
      return Ok(());
    }

    self.check_connected()?;
    if !self
      .configurations
      .iter()
      .any(|c| c.configuration_value == configuration_value)
    {
      return Err(Error::NotFound(Target::Configuration));
    }
    if !self.opened() {
      return Err(Error::InvalidState);
    }

    self
      .adapter
      .select_configuration(self.handle, configuration_value)
      .await?;

    let mut state = self.state();
    state.current_configuration = Some(configuration_value);
    state.interfaces.clear();
    Ok(())
  }

  pub async fn claim_interface(&self, interface_number: u8) -> Result<()> {
    self.check_connected()?;
    self
      .interface(interface_number)
      .ok_or(Error::NotFound(Target::Interface))?;
    if !self.opened() {
      return Err(Error::InvalidState);
    }
    if self.is_claimed(interface_number) {
      return Ok(());
    }

    self
      .adapter
      .claim_interface(self.handle, interface_number)
      .await?;
    self.state().interface_mut(interface_number).claimed = true;
    Ok(())
  }

  pub async fn release_interface(&self, interface_number: u8) -> Result<()> {
    self.check_connected()?;
    self
      .interface(interface_number)
      .ok_or(Error::NotFound(Target::Interface))?;
    if !self.opened() {
      return Err(Error::InvalidState);
    }
    if !self.is_claimed(interface_number) {
      return Ok(());
    }

    self
      .adapter
      .release_interface(self.handle, interface_number)
      .await?;
    self.state().interface_mut(interface_number).claimed = false;
    Ok(())
  }

  pub async fn select_alternate_interface(
    &self,
    interface_number: u8,
    alternate_setting: u8,
  ) -> Result<()> {
    self.check_connected()?;
    self
      .interface(interface_number)
      .ok_or(Error::NotFound(Target::Interface))?;
    if !self.opened() || !self.is_claimed(interface_number) {
      return Err(Error::InvalidState);
    }

    self
      .adapter
      .select_alternate_interface(
        self.handle,
        interface_number,
        alternate_setting,
      )
      .await?;
    self.state().interface_mut(interface_number).alternate_setting =
      alternate_setting;
    Ok(())
  }

  pub async fn control_transfer_in(
    &self,
    setup: UsbControlTransferParameters,
    length: usize,
  ) -> Result<UsbInTransferResult> {
    self.check_connected()?;
    if !self.opened() {
      return Err(Error::InvalidState);
    }
    self.validate_control_setup(&setup)?;

    self
      .adapter
      .control_transfer_in(self.handle, &setup, length)
      .await
  }

  pub async fn control_transfer_out(
    &self,
    setup: UsbControlTransferParameters,
    data: &[u8],
  ) -> Result<UsbOutTransferResult> {
    self.check_connected()?;
    if !self.opened() {
      return Err(Error::InvalidState);
    }
    self.validate_control_setup(&setup)?;

    self
      .adapter
      .control_transfer_out(self.handle, &setup, data)
      .await
  }

  // https://wicg.github.io/webusb/#check-the-validity-of-the-control-transfer-parameters
  fn validate_control_setup(
    &self,
    setup: &UsbControlTransferParameters,
  ) -> Result<()> {
    match setup.recipient {
      UsbRecipient::Interface => {
        let interface_number = (setup.index & 0xFF) as u8;
        self
          .interface(interface_number)
          .ok_or(Error::NotFound(Target::Interface))?;
        if !self.is_claimed(interface_number) {
          return Err(Error::InvalidState);
        }
      }
      UsbRecipient::Endpoint => {
        let endpoint_number = setup.index as u8 & ENDPOINT_NUMBER_MASK;
        let direction = if setup.index as u8 & ENDPOINT_DIR_IN != 0 {
          Direction::In
        } else {
          Direction::Out
        };
        let (_, interface_number) = self
          .find_endpoint(direction, endpoint_number)
          .ok_or(Error::NotFound(Target::Endpoint))?;
        if !self.is_claimed(interface_number) {
          return Err(Error::InvalidState);
        }
      }
      UsbRecipient::Device | UsbRecipient::Other => {}
    }

    Ok(())
  }

  pub async fn clear_halt(
    &self,
    direction: Direction,
    endpoint_number: u8,
  ) -> Result<()> {
    self.check_connected()?;
    let (_, interface_number) = self
      .find_endpoint(direction, endpoint_number)
      .ok_or(Error::NotFound(Target::Endpoint))?;
    if !self.opened() || !self.is_claimed(interface_number) {
      return Err(Error::InvalidState);
    }

    self
      .adapter
      .clear_halt(self.handle, direction, endpoint_number)
      .await
  }

  /// Finds a streaming endpoint and checks it may be used right now.
  fn transfer_endpoint(
    &self,
    direction: Direction,
    endpoint_number: u8,
  ) -> Result<&UsbEndpoint> {
    let (endpoint, interface_number) = self
      .find_endpoint(direction, endpoint_number)
      .ok_or(Error::NotFound(Target::Endpoint))?;
    match endpoint.r#type {
      UsbEndpointType::Bulk | UsbEndpointType::Interrupt => {}
      UsbEndpointType::Isochronous => return Err(Error::InvalidAccess),
    }
    if !self.opened() || !self.is_claimed(interface_number) {
      return Err(Error::InvalidState);
    }
    Ok(endpoint)
  }

  pub async fn transfer_in(
    &self,
    endpoint_number: u8,
    length: usize,
  ) -> Result<UsbInTransferResult> {
    self.check_connected()?;
    let endpoint = self.transfer_endpoint(Direction::In, endpoint_number)?;

    self.adapter.transfer_in(self.handle, endpoint, length).await
  }

  pub async fn transfer_out(
    &self,
    endpoint_number: u8,
    data: &[u8],
  ) -> Result<UsbOutTransferResult> {
    self.check_connected()?;
    let endpoint = self.transfer_endpoint(Direction::Out, endpoint_number)?;

    self.adapter.transfer_out(self.handle, endpoint, data).await
  }

  pub async fn isochronous_transfer_in(
    &self,
    endpoint_number: u8,
    _packet_lengths: &[u32],
  ) -> Result<UsbInTransferResult> {
    debug!(endpoint_number, "isochronousTransferIn is not implemented");
    Err(Error::NotImplemented)
  }

  pub async fn isochronous_transfer_out(
    &self,
    endpoint_number: u8,
    _data: &[u8],
    _packet_lengths: &[u32],
  ) -> Result<UsbOutTransferResult> {
    debug!(endpoint_number, "isochronousTransferOut is not implemented");
    Err(Error::NotImplemented)
  }

  pub async fn reset(&self) -> Result<()> {
    self.check_connected()?;
    if !self.opened() {
      return Err(Error::InvalidState);
    }

    self.adapter.reset(self.handle).await
  }
}

impl fmt::Debug for UsbDevice {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("UsbDevice")
      .field("handle", &self.handle)
      .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
      .field("product_id", &format_args!("{:#06x}", self.product_id))
      .field("product_name", &self.product_name)
      .field("serial_number", &self.serial_number)
      .finish()
  }
}
