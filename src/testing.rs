//! In-memory backend for unit tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::adapter::UsbAdapter;
use crate::backend::*;
use crate::config::AdapterConfig;
use crate::constants::*;
use crate::device::UsbDevice;
use crate::lock;
use crate::model::UsbEndpointType;

type Reply<T> = Mutex<VecDeque<Result<T, TransportError>>>;

/// A native call seen by [`MockDevice`]. String reads are not recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
  Open,
  Close,
  Capabilities,
  ControlIn {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: usize,
  },
  ControlOut {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    data: Vec<u8>,
  },
  SetConfiguration(u8),
  ClaimInterface(u8),
  ReleaseInterface(u8),
  SetAlternateSetting(u8, u8),
  TransferIn {
    endpoint: u8,
    length: usize,
  },
  TransferOut {
    endpoint: u8,
    data: Vec<u8>,
  },
  Reset,
}

fn endpoint(
  address: u8,
  attributes: u8,
  max_packet_size: u16,
) -> EndpointDescriptor {
  EndpointDescriptor {
    address,
    attributes,
    max_packet_size,
  }
}

fn interface(
  interface_number: u8,
  alternate_setting: u8,
  class: (u8, u8, u8),
  interface_string_index: Option<u8>,
  endpoints: Vec<EndpointDescriptor>,
) -> InterfaceDescriptor {
  InterfaceDescriptor {
    interface_number,
    alternate_setting,
    interface_class: class.0,
    interface_subclass: class.1,
    interface_protocol: class.2,
    interface_string_index,
    endpoints,
  }
}

/// Composite device with two configurations.
///
/// Configuration 1 (active, name at string 4):
/// - interface 0 (vendor class, name at string 5): alternate 0 with bulk
///   endpoints 1 IN and 1 OUT, alternate 1 with interrupt endpoint 2 IN
/// - interface 1 (HID boot keyboard): interrupt 3 IN, isochronous 4 OUT
///
/// Configuration 2: interface 0 (CDC data) with bulk 5 IN.
fn descriptor_set(vendor_id: u16, product_id: u16) -> DescriptorSet {
  DescriptorSet {
    device: DeviceDescriptor {
      bcd_usb: 0x0210,
      device_class: 0xEF,
      device_subclass: 0x02,
      device_protocol: 0x01,
      max_packet_size0: 64,
      vendor_id,
      product_id,
      bcd_device: 0x0100,
      manufacturer_string_index: Some(1),
      product_string_index: Some(2),
      serial_number_string_index: Some(3),
    },
    active_configuration: Some(1),
    configurations: vec![
      ConfigDescriptor {
        configuration_value: 1,
        configuration_string_index: Some(4),
        interfaces: vec![
          vec![
            interface(
              0,
              0,
              (0xFF, 0x00, 0x00),
              Some(5),
              vec![endpoint(0x81, 0x02, 64), endpoint(0x01, 0x02, 64)],
            ),
            interface(
              0,
              1,
              (0xFF, 0x00, 0x00),
              Some(5),
              vec![endpoint(0x82, 0x03, 8)],
            ),
          ],
          vec![interface(
            1,
            0,
            (0x03, 0x01, 0x01),
            None,
            vec![endpoint(0x83, 0x03, 8), endpoint(0x04, 0x01, 192)],
          )],
        ],
      },
      ConfigDescriptor {
        configuration_value: 2,
        configuration_string_index: None,
        interfaces: vec![vec![interface(
          0,
          0,
          (0x0A, 0x00, 0x00),
          None,
          vec![endpoint(0x85, 0x02, 512)],
        )]],
      },
    ],
  }
}

/// WebUSB platform capability advertising a landing page.
pub fn web_capability(vendor_code: u8, landing_page: u8) -> PlatformCapability {
  let mut data = vec![0x00];
  data.extend_from_slice(WEB_USB_CAPABILITY_UUID);
  data.extend_from_slice(&WEB_USB_CAPABILITY_VERSION.to_le_bytes());
  data.push(vendor_code);
  data.push(landing_page);
  PlatformCapability {
    capability_type: PLATFORM_DEV_CAPABILITY_TYPE,
    data,
  }
}

pub struct MockDevice {
  bus: u8,
  address: u8,
  descriptors: Mutex<Option<DescriptorSet>>,
  strings: Mutex<HashMap<u8, String>>,
  capabilities: Mutex<Vec<PlatformCapability>>,
  open: AtomicBool,
  open_failures: AtomicU32,
  open_error: Mutex<TransportError>,
  control_in: Reply<Vec<u8>>,
  transfer_in: Reply<Vec<u8>>,
  transfer_out: Reply<usize>,
  calls: Mutex<Vec<Call>>,
}

impl MockDevice {
  pub fn new(bus: u8, address: u8, vendor_id: u16, product_id: u16) -> Self {
    let strings = [(1, "Mock Inc."), (2, "Mock Device"), (3, "0001")]
      .iter()
      .map(|(index, s)| (*index, s.to_string()))
      .collect();

    Self {
      bus,
      address,
      descriptors: Mutex::new(Some(descriptor_set(vendor_id, product_id))),
      strings: Mutex::new(strings),
      capabilities: Mutex::new(Vec::new()),
      open: AtomicBool::new(false),
      open_failures: AtomicU32::new(0),
      open_error: Mutex::new(TransportError::Busy),
      control_in: Mutex::new(VecDeque::new()),
      transfer_in: Mutex::new(VecDeque::new()),
      transfer_out: Mutex::new(VecDeque::new()),
      calls: Mutex::new(Vec::new()),
    }
  }

  /// Arduino Leonardo (2341:8036).
  pub fn arduino(bus: u8, address: u8) -> Self {
    Self::new(bus, address, 0x2341, 0x8036)
  }

  pub fn set_string(&self, index: u8, value: &str) {
    lock(&self.strings).insert(index, value.to_string());
  }

  pub fn set_capabilities(&self, capabilities: Vec<PlatformCapability>) {
    *lock(&self.capabilities) = capabilities;
  }

  pub fn fail_descriptors(&self) {
    *lock(&self.descriptors) = None;
  }

  /// The next `n` opens fail with [`TransportError::Busy`].
  pub fn fail_opens(&self, n: u32) {
    self.fail_opens_with(n, TransportError::Busy);
  }

  pub fn fail_opens_with(&self, n: u32, err: TransportError) {
    *lock(&self.open_error) = err;
    self.open_failures.store(n, Ordering::SeqCst);
  }

  pub fn push_control_in(&self, reply: Result<Vec<u8>, TransportError>) {
    lock(&self.control_in).push_back(reply);
  }

  pub fn push_transfer_in(&self, reply: Result<Vec<u8>, TransportError>) {
    lock(&self.transfer_in).push_back(reply);
  }

  pub fn push_transfer_out(&self, reply: Result<usize, TransportError>) {
    lock(&self.transfer_out).push_back(reply);
  }

  pub fn calls(&self) -> Vec<Call> {
    lock(&self.calls).clone()
  }

  pub fn clear_calls(&self) {
    lock(&self.calls).clear();
  }

  fn record(&self, call: Call) {
    lock(&self.calls).push(call);
  }

  fn check_open(&self) -> Result<(), TransportError> {
    if !self.is_open() {
      return Err(TransportError::NotOpen);
    }
    Ok(())
  }
}

#[async_trait]
impl NativeDevice for MockDevice {
  fn bus_number(&self) -> u8 {
    self.bus
  }

  fn address(&self) -> u8 {
    self.address
  }

  fn descriptors(&self) -> Result<DescriptorSet, TransportError> {
    lock(&self.descriptors)
      .clone()
      .ok_or_else(|| TransportError::Other("descriptor read failed".into()))
  }

  fn is_open(&self) -> bool {
    self.open.load(Ordering::SeqCst)
  }

  async fn open(&self) -> Result<(), TransportError> {
    self.record(Call::Open);
    let failures = self.open_failures.load(Ordering::SeqCst);
    if failures > 0 {
      self.open_failures.store(failures - 1, Ordering::SeqCst);
      return Err(lock(&self.open_error).clone());
    }
    self.open.store(true, Ordering::SeqCst);
    Ok(())
  }

  async fn close(&self) -> Result<(), TransportError> {
    self.record(Call::Close);
    self.open.store(false, Ordering::SeqCst);
    Ok(())
  }

  async fn capabilities(
    &self,
  ) -> Result<Vec<PlatformCapability>, TransportError> {
    self.record(Call::Capabilities);
    self.check_open()?;
    Ok(lock(&self.capabilities).clone())
  }

  async fn string_descriptor(
    &self,
    index: u8,
  ) -> Result<String, TransportError> {
    self.check_open()?;
    lock(&self.strings)
      .get(&index)
      .cloned()
      .ok_or(TransportError::Stall)
  }

  async fn control_transfer_in(
    &self,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: usize,
  ) -> Result<Vec<u8>, TransportError> {
    self.record(Call::ControlIn {
      request_type,
      request,
      value,
      index,
      length,
    });
    self.check_open()?;
    lock(&self.control_in).pop_front().unwrap_or(Ok(Vec::new()))
  }

  async fn control_transfer_out(
    &self,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    data: &[u8],
  ) -> Result<usize, TransportError> {
    self.record(Call::ControlOut {
      request_type,
      request,
      value,
      index,
      data: data.to_vec(),
    });
    self.check_open()?;
    Ok(data.len())
  }

  async fn set_configuration(
    &self,
    configuration_value: u8,
  ) -> Result<(), TransportError> {
    self.record(Call::SetConfiguration(configuration_value));
    self.check_open()
  }

  async fn claim_interface(
    &self,
    interface_number: u8,
  ) -> Result<(), TransportError> {
    self.record(Call::ClaimInterface(interface_number));
    self.check_open()
  }

  async fn release_interface(
    &self,
    interface_number: u8,
  ) -> Result<(), TransportError> {
    self.record(Call::ReleaseInterface(interface_number));
    self.check_open()
  }

  async fn set_alternate_setting(
    &self,
    interface_number: u8,
    alternate_setting: u8,
  ) -> Result<(), TransportError> {
    self.record(Call::SetAlternateSetting(interface_number, alternate_setting));
    self.check_open()
  }

  async fn transfer_in(
    &self,
    endpoint_address: u8,
    _transfer_type: UsbEndpointType,
    length: usize,
  ) -> Result<Vec<u8>, TransportError> {
    self.record(Call::TransferIn {
      endpoint: endpoint_address,
      length,
    });
    self.check_open()?;
    lock(&self.transfer_in).pop_front().unwrap_or(Ok(Vec::new()))
  }

  async fn transfer_out(
    &self,
    endpoint_address: u8,
    _transfer_type: UsbEndpointType,
    data: &[u8],
  ) -> Result<usize, TransportError> {
    self.record(Call::TransferOut {
      endpoint: endpoint_address,
      data: data.to_vec(),
    });
    self.check_open()?;
    lock(&self.transfer_out)
      .pop_front()
      .unwrap_or(Ok(data.len()))
  }

  async fn reset(&self) -> Result<(), TransportError> {
    self.record(Call::Reset);
    self.check_open()
  }
}

type Watcher = Arc<Mutex<Option<UnboundedSender<HotplugEvent>>>>;

struct WatchGuard(Watcher);

impl Drop for WatchGuard {
  fn drop(&mut self) {
    *lock(&self.0) = None;
  }
}

#[derive(Default)]
pub struct MockBackend {
  devices: Mutex<Vec<Arc<MockDevice>>>,
  watcher: Watcher,
  enumerations: AtomicUsize,
}

impl MockBackend {
  /// Makes `device` visible to enumeration without an attach event.
  pub fn add(&self, device: MockDevice) -> Arc<MockDevice> {
    let device = Arc::new(device);
    lock(&self.devices).push(device.clone());
    device
  }

  pub fn remove(&self, bus: u8, address: u8) {
    lock(&self.devices).retain(|d| (d.bus, d.address) != (bus, address));
  }

  pub fn plug(&self, device: MockDevice) -> Arc<MockDevice> {
    let device = self.add(device);
    let native: Arc<dyn NativeDevice> = device.clone();
    self.notify(HotplugEvent::Arrived(native));
    device
  }

  pub fn unplug(&self, bus: u8, address: u8) {
    self.remove(bus, address);
    self.notify(HotplugEvent::Left { bus, address });
  }

  fn notify(&self, event: HotplugEvent) {
    if let Some(events) = lock(&self.watcher).as_ref() {
      let _ = events.send(event);
    }
  }

  pub fn device(&self, bus: u8, address: u8) -> Arc<MockDevice> {
    lock(&self.devices)
      .iter()
      .find(|d| (d.bus, d.address) == (bus, address))
      .cloned()
      .expect("no such mock device")
  }

  pub fn is_watching(&self) -> bool {
    lock(&self.watcher).is_some()
  }

  pub fn enumerations(&self) -> usize {
    self.enumerations.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Backend for MockBackend {
  async fn devices(
    &self,
  ) -> Result<Vec<Arc<dyn NativeDevice>>, TransportError> {
    self.enumerations.fetch_add(1, Ordering::SeqCst);
    Ok(
      lock(&self.devices)
        .iter()
        .map(|d| d.clone() as Arc<dyn NativeDevice>)
        .collect(),
    )
  }

  fn watch(
    &self,
    events: UnboundedSender<HotplugEvent>,
  ) -> Result<HotplugGuard, TransportError> {
    *lock(&self.watcher) = Some(events);
    Ok(Box::new(WatchGuard(self.watcher.clone())))
  }
}

pub fn mock_adapter_with(
  config: AdapterConfig,
  devices: Vec<MockDevice>,
) -> (Arc<MockBackend>, Arc<UsbAdapter>) {
  let backend = Arc::new(MockBackend::default());
  for device in devices {
    backend.add(device);
  }
  let adapter = UsbAdapter::new(backend.clone(), config);
  (backend, adapter)
}

pub fn mock_adapter(
  devices: Vec<MockDevice>,
) -> (Arc<MockBackend>, Arc<UsbAdapter>) {
  mock_adapter_with(AdapterConfig::default(), devices)
}

/// An Arduino at 1.4, enumerated and closed.
pub async fn single_device() -> (Arc<MockDevice>, UsbDevice) {
  let (backend, adapter) = mock_adapter(vec![MockDevice::arduino(1, 4)]);
  let mut devices = adapter.list_usb_devices().await.unwrap();
  (backend.device(1, 4), devices.remove(0))
}
