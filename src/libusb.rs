//! [`Backend`] on top of libusb, through `rusb`.
//!
//! libusb calls block, so each one runs on Tokio's blocking pool. Hot-plug
//! callbacks are dispatched by a dedicated event thread that runs for as
//! long as the [`HotplugGuard`] returned by [`Backend::watch`] is alive.

use std::collections::BTreeSet;
use std::os::raw::c_int;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rusb::constants::*;
use rusb::ffi;
use rusb::Context;
use rusb::UsbContext;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use tracing::warn;

use crate::backend::*;
use crate::constants::*;
use crate::descriptors::parse_bos;
use crate::lock;
use crate::model::UsbEndpointType;

const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(2);
// libusb waits forever on a zero timeout.
const NO_TIMEOUT: Duration = Duration::from_secs(0);
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl From<rusb::Error> for TransportError {
  fn from(err: rusb::Error) -> Self {
    match err {
      rusb::Error::Pipe => TransportError::Stall,
      rusb::Error::Overflow => TransportError::Babble,
      rusb::Error::NoDevice => TransportError::NoDevice,
      rusb::Error::Access => TransportError::Access,
      rusb::Error::Busy => TransportError::Busy,
      rusb::Error::Timeout => TransportError::Timeout,
      rusb::Error::NotSupported => TransportError::NotSupported,
      err => TransportError::Other(err.to_string()),
    }
  }
}

/// Maps a `libusb_*` return code.
fn check(code: c_int) -> Result<(), TransportError> {
  if code >= 0 {
    return Ok(());
  }
  Err(match code {
    LIBUSB_ERROR_PIPE => TransportError::Stall,
    LIBUSB_ERROR_OVERFLOW => TransportError::Babble,
    LIBUSB_ERROR_NO_DEVICE | LIBUSB_ERROR_NOT_FOUND => TransportError::NoDevice,
    LIBUSB_ERROR_ACCESS => TransportError::Access,
    LIBUSB_ERROR_BUSY => TransportError::Busy,
    LIBUSB_ERROR_TIMEOUT => TransportError::Timeout,
    LIBUSB_ERROR_NOT_SUPPORTED => TransportError::NotSupported,
    code => TransportError::Other(format!("libusb error {}", code)),
  })
}

async fn blocking<T, F>(f: F) -> Result<T, TransportError>
where
  F: FnOnce() -> Result<T, TransportError> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|err| TransportError::Other(err.to_string()))?
}

/// Packs a decoded version back into its BCD field.
fn bcd(version: rusb::Version) -> u16 {
  let major = version.major() as u16;
  ((major / 10) << 12)
    | ((major % 10) << 8)
    | ((version.minor() as u16) << 4)
    | version.sub_minor() as u16
}

fn endpoint_descriptor(e: &rusb::EndpointDescriptor) -> EndpointDescriptor {
  let transfer_type = match e.transfer_type() {
    rusb::TransferType::Control => 0x00,
    rusb::TransferType::Isochronous => 0x01,
    rusb::TransferType::Bulk => TRANSFER_TYPE_BULK,
    rusb::TransferType::Interrupt => TRANSFER_TYPE_INTERRUPT,
  };

  EndpointDescriptor {
    address: e.address(),
    attributes: transfer_type,
    max_packet_size: e.max_packet_size(),
  }
}

fn interface_descriptor(d: &rusb::InterfaceDescriptor) -> InterfaceDescriptor {
  InterfaceDescriptor {
    interface_number: d.interface_number(),
    alternate_setting: d.setting_number(),
    interface_class: d.class_code(),
    interface_subclass: d.sub_class_code(),
    interface_protocol: d.protocol_code(),
    interface_string_index: d.description_string_index(),
    endpoints: d
      .endpoint_descriptors()
      .map(|e| endpoint_descriptor(&e))
      .collect(),
  }
}

fn config_descriptor(config: &rusb::ConfigDescriptor) -> ConfigDescriptor {
  ConfigDescriptor {
    configuration_value: config.number(),
    configuration_string_index: config.description_string_index(),
    interfaces: config
      .interfaces()
      .map(|i| i.descriptors().map(|d| interface_descriptor(&d)).collect())
      .collect(),
  }
}

type Handle = Arc<rusb::DeviceHandle<Context>>;

/// A libusb device.
///
/// Each request works on its own reference to the open handle, so a transfer
/// that never completes does not hold up other requests or [`close`].
///
/// [`close`]: NativeDevice::close
pub struct LibUsbDevice {
  device: rusb::Device<Context>,
  handle: Mutex<Option<Handle>>,
  claimed: Mutex<BTreeSet<u8>>,
}

impl LibUsbDevice {
  pub fn new(device: rusb::Device<Context>) -> Self {
    Self {
      device,
      handle: Mutex::new(None),
      claimed: Mutex::new(BTreeSet::new()),
    }
  }

  fn current(&self) -> Result<Handle, TransportError> {
    lock(&self.handle).clone().ok_or(TransportError::NotOpen)
  }

  async fn with_handle<T, F>(&self, op: F) -> Result<T, TransportError>
  where
    F: FnOnce(&rusb::DeviceHandle<Context>) -> rusb::Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let handle = self.current()?;
    blocking(move || Ok(op(&handle)?)).await
  }

  /// Calls libusb directly for requests `rusb` only offers on an exclusive
  /// handle. The raw pointer stays valid while `handle` is alive.
  async fn with_raw<F>(&self, op: F) -> Result<(), TransportError>
  where
    F: FnOnce(*mut ffi::libusb_device_handle) -> c_int + Send + 'static,
  {
    let handle = self.current()?;
    blocking(move || check(op(handle.as_raw()))).await
  }
}

#[async_trait]
impl NativeDevice for LibUsbDevice {
  fn bus_number(&self) -> u8 {
    self.device.bus_number()
  }

  fn address(&self) -> u8 {
    self.device.address()
  }

  fn descriptors(&self) -> Result<DescriptorSet, TransportError> {
    let descriptor = self.device.device_descriptor()?;

    let mut configurations = Vec::new();
    for index in 0..descriptor.num_configurations() {
      match self.device.config_descriptor(index) {
        Ok(config) => configurations.push(config_descriptor(&config)),
        Err(err) => debug!(index, %err, "skipping configuration descriptor"),
      }
    }
    let active_configuration = self
      .device
      .active_config_descriptor()
      .ok()
      .map(|config| config.number());

    Ok(DescriptorSet {
      device: DeviceDescriptor {
        bcd_usb: bcd(descriptor.usb_version()),
        device_class: descriptor.class_code(),
        device_subclass: descriptor.sub_class_code(),
        device_protocol: descriptor.protocol_code(),
        max_packet_size0: descriptor.max_packet_size(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bcd_device: bcd(descriptor.device_version()),
        manufacturer_string_index: descriptor.manufacturer_string_index(),
        product_string_index: descriptor.product_string_index(),
        serial_number_string_index: descriptor.serial_number_string_index(),
      },
      active_configuration,
      configurations,
    })
  }

  fn is_open(&self) -> bool {
    lock(&self.handle).is_some()
  }

  async fn open(&self) -> Result<(), TransportError> {
    let device = self.device.clone();
    let opened = blocking(move || {
      let mut opened = device.open()?;
      // Unsupported on some platforms.
      let _ = opened.set_auto_detach_kernel_driver(true);
      Ok(opened)
    })
    .await?;

    *lock(&self.handle) = Some(Arc::new(opened));
    Ok(())
  }

  async fn close(&self) -> Result<(), TransportError> {
    let handle = match lock(&self.handle).take() {
      Some(handle) => handle,
      None => return Ok(()),
    };
    let claimed = std::mem::take(&mut *lock(&self.claimed));

    blocking(move || {
      // Hands the interfaces back to their kernel drivers.
      for interface_number in claimed {
        let code = unsafe {
          ffi::libusb_release_interface(
            handle.as_raw(),
            interface_number as c_int,
          )
        };
        if let Err(err) = check(code) {
          debug!(interface_number, %err, "release on close failed");
        }
      }
      // libusb closes the device once pending transfers drop their handle.
      drop(handle);
      Ok(())
    })
    .await
  }

  // https://source.chromium.org/chromium/chromium/src/+/main:services/device/usb/webusb_descriptors.cc
  async fn capabilities(
    &self,
  ) -> Result<Vec<PlatformCapability>, TransportError> {
    let version = self.device.device_descriptor()?.usb_version();
    // BOS descriptors exist since USB 2.1.
    if (version.major(), version.minor()) < (2, 1) {
      return Ok(Vec::new());
    }

    let capabilities = self
      .with_handle(|handle| {
        let request_type = rusb::request_type(
          rusb::Direction::In,
          rusb::RequestType::Standard,
          rusb::Recipient::Device,
        );

        // Read the header for wTotalLength, then the whole descriptor.
        let mut header = [0u8; BOS_DESCRIPTOR_SIZE];
        handle.read_control(
          request_type,
          GET_DESCRIPTOR_REQUEST,
          BOS_DESCRIPTOR_TYPE << 8,
          0,
          &mut header,
          DESCRIPTOR_TIMEOUT,
        )?;
        let total_length = u16::from_le_bytes([header[2], header[3]]) as usize;

        let mut buffer = vec![0u8; total_length.max(BOS_DESCRIPTOR_SIZE)];
        let length = handle.read_control(
          request_type,
          GET_DESCRIPTOR_REQUEST,
          BOS_DESCRIPTOR_TYPE << 8,
          0,
          &mut buffer,
          DESCRIPTOR_TIMEOUT,
        )?;
        buffer.truncate(length);

        Ok(parse_bos(&buffer))
      })
      .await?;

    Ok(capabilities.unwrap_or_else(|| {
      debug!("malformed BOS descriptor");
      Vec::new()
    }))
  }

  async fn string_descriptor(
    &self,
    index: u8,
  ) -> Result<String, TransportError> {
    self
      .with_handle(move |handle| {
        let languages = handle.read_languages(DESCRIPTOR_TIMEOUT)?;
        match languages.first() {
          Some(language) => {
            handle.read_string_descriptor(*language, index, DESCRIPTOR_TIMEOUT)
          }
          None => handle.read_string_descriptor_ascii(index),
        }
      })
      .await
  }

  async fn control_transfer_in(
    &self,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: usize,
  ) -> Result<Vec<u8>, TransportError> {
    self
      .with_handle(move |handle| {
        let mut buffer = vec![0u8; length];
        let n = handle.read_control(
          request_type,
          request,
          value,
          index,
          &mut buffer,
          NO_TIMEOUT,
        )?;
        buffer.truncate(n);
        Ok(buffer)
      })
      .await
  }

  async fn control_transfer_out(
    &self,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    data: &[u8],
  ) -> Result<usize, TransportError> {
    let data = data.to_vec();
    self
      .with_handle(move |handle| {
        handle.write_control(
          request_type,
          request,
          value,
          index,
          &data,
          NO_TIMEOUT,
        )
      })
      .await
  }

  async fn set_configuration(
    &self,
    configuration_value: u8,
  ) -> Result<(), TransportError> {
    self
      .with_raw(move |raw| unsafe {
        ffi::libusb_set_configuration(raw, configuration_value as c_int)
      })
      .await
  }

  async fn claim_interface(
    &self,
    interface_number: u8,
  ) -> Result<(), TransportError> {
    self
      .with_raw(move |raw| unsafe {
        ffi::libusb_claim_interface(raw, interface_number as c_int)
      })
      .await?;
    lock(&self.claimed).insert(interface_number);
    Ok(())
  }

  async fn release_interface(
    &self,
    interface_number: u8,
  ) -> Result<(), TransportError> {
    self
      .with_raw(move |raw| unsafe {
        ffi::libusb_release_interface(raw, interface_number as c_int)
      })
      .await?;
    lock(&self.claimed).remove(&interface_number);
    Ok(())
  }

  async fn set_alternate_setting(
    &self,
    interface_number: u8,
    alternate_setting: u8,
  ) -> Result<(), TransportError> {
    self
      .with_raw(move |raw| unsafe {
        ffi::libusb_set_interface_alt_setting(
          raw,
          interface_number as c_int,
          alternate_setting as c_int,
        )
      })
      .await
  }

  async fn transfer_in(
    &self,
    endpoint_address: u8,
    transfer_type: UsbEndpointType,
    length: usize,
  ) -> Result<Vec<u8>, TransportError> {
    if transfer_type == UsbEndpointType::Isochronous {
      return Err(TransportError::NotSupported);
    }

    self
      .with_handle(move |handle| {
        let mut buffer = vec![0u8; length];
        let n = match transfer_type {
          UsbEndpointType::Interrupt => {
            handle.read_interrupt(endpoint_address, &mut buffer, NO_TIMEOUT)?
          }
          _ => handle.read_bulk(endpoint_address, &mut buffer, NO_TIMEOUT)?,
        };
        buffer.truncate(n);
        Ok(buffer)
      })
      .await
  }

  async fn transfer_out(
    &self,
    endpoint_address: u8,
    transfer_type: UsbEndpointType,
    data: &[u8],
  ) -> Result<usize, TransportError> {
    if transfer_type == UsbEndpointType::Isochronous {
      return Err(TransportError::NotSupported);
    }

    let data = data.to_vec();
    self
      .with_handle(move |handle| match transfer_type {
        UsbEndpointType::Interrupt => {
          handle.write_interrupt(endpoint_address, &data, NO_TIMEOUT)
        }
        _ => handle.write_bulk(endpoint_address, &data, NO_TIMEOUT),
      })
      .await
  }

  async fn reset(&self) -> Result<(), TransportError> {
    self
      .with_raw(|raw| unsafe { ffi::libusb_reset_device(raw) })
      .await
  }
}

struct HotplugForwarder {
  events: UnboundedSender<HotplugEvent>,
}

impl rusb::Hotplug<Context> for HotplugForwarder {
  fn device_arrived(&mut self, device: rusb::Device<Context>) {
    let native: Arc<dyn NativeDevice> = Arc::new(LibUsbDevice::new(device));
    let _ = self.events.send(HotplugEvent::Arrived(native));
  }

  fn device_left(&mut self, device: rusb::Device<Context>) {
    let _ = self.events.send(HotplugEvent::Left {
      bus: device.bus_number(),
      address: device.address(),
    });
  }
}

struct HotplugWatch {
  registration: Option<rusb::Registration<Context>>,
  running: Arc<AtomicBool>,
}

impl Drop for HotplugWatch {
  fn drop(&mut self) {
    // The event thread notices within one poll interval.
    self.running.store(false, Ordering::SeqCst);
    self.registration.take();
  }
}

/// The host's libusb.
pub struct LibUsb {
  context: Context,
}

impl LibUsb {
  pub fn new() -> Result<Self, TransportError> {
    Ok(Self {
      context: Context::new()?,
    })
  }

  pub fn context(&self) -> &Context {
    &self.context
  }
}

#[async_trait]
impl Backend for LibUsb {
  async fn devices(
    &self,
  ) -> Result<Vec<Arc<dyn NativeDevice>>, TransportError> {
    let context = self.context.clone();
    let devices =
      blocking(move || Ok(context.devices()?.iter().collect::<Vec<_>>()))
        .await?;

    Ok(
      devices
        .into_iter()
        .map(|device| {
          Arc::new(LibUsbDevice::new(device)) as Arc<dyn NativeDevice>
        })
        .collect(),
    )
  }

  fn watch(
    &self,
    events: UnboundedSender<HotplugEvent>,
  ) -> Result<HotplugGuard, TransportError> {
    if !rusb::has_hotplug() {
      return Err(TransportError::NotSupported);
    }

    let callback: Box<dyn rusb::Hotplug<Context>> =
      Box::new(HotplugForwarder { events });
    let registration = rusb::HotplugBuilder::new()
      .enumerate(false)
      .register(&self.context, callback)?;

    let running = Arc::new(AtomicBool::new(true));
    let context = self.context.clone();
    let flag = running.clone();
    std::thread::Builder::new()
      .name("libusb-events".to_string())
      .spawn(move || {
        while flag.load(Ordering::SeqCst) {
          if let Err(err) = context.handle_events(Some(EVENT_POLL_INTERVAL)) {
            warn!(%err, "libusb event handling failed");
            break;
          }
        }
        debug!("libusb event thread exiting");
      })
      .map_err(|err| TransportError::Other(err.to_string()))?;

    Ok(Box::new(HotplugWatch {
      registration: Some(registration),
      running,
    }))
  }
}
