use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::Backend;
use crate::backend::DescriptorSet;
use crate::backend::HotplugEvent;
use crate::backend::HotplugGuard;
use crate::backend::NativeDevice;
use crate::backend::TransportError;
use crate::config::AdapterConfig;
use crate::constants::*;
use crate::descriptors::find_web_capability;
use crate::descriptors::landing_page_request;
use crate::descriptors::parse_url_descriptor;
use crate::device::DeviceHandle;
use crate::device::DeviceState;
use crate::device::DeviceStrings;
use crate::device::UsbDevice;
use crate::lock;
use crate::model::endpoint_address;
use crate::model::read_string;
use crate::model::*;
use crate::usb_error;
use crate::Error;
use crate::Result;
use crate::Target;

const EVENT_CAPACITY: usize = 64;

/// Attach and detach notifications for registered devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEvent {
  /// A device was attached and registered.
  Connect(DeviceHandle),
  /// A registered device went away. Its [`UsbDevice`] values are stale.
  Disconnect(DeviceHandle),
}

struct DeviceEntry {
  native: Arc<dyn NativeDevice>,
  url: Option<String>,
  state: Arc<Mutex<DeviceState>>,
}

#[derive(Default)]
struct Listening {
  subscribers: usize,
  active: Option<ActiveListener>,
}

struct ActiveListener {
  _guard: HotplugGuard,
  task: JoinHandle<()>,
}

impl Drop for ActiveListener {
  fn drop(&mut self) {
    self.task.abort();
  }
}

/// Registry of connected devices keyed by [`DeviceHandle`]. Runs every
/// native call on behalf of [`UsbDevice`].
pub struct UsbAdapter {
  backend: Arc<dyn Backend>,
  config: AdapterConfig,
  devices: Mutex<BTreeMap<DeviceHandle, DeviceEntry>>,
  events: broadcast::Sender<AdapterEvent>,
  listening: Mutex<Listening>,
}

impl UsbAdapter {
  pub fn new(backend: Arc<dyn Backend>, config: AdapterConfig) -> Arc<Self> {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Arc::new(Self {
      backend,
      config,
      devices: Mutex::new(BTreeMap::new()),
      events,
      listening: Mutex::new(Listening::default()),
    })
  }

  /// Adapter over the host's libusb.
  #[cfg(feature = "libusb")]
  pub fn libusb(config: AdapterConfig) -> Result<Arc<Self>> {
    let backend = crate::libusb::LibUsb::new().map_err(usb_error("init"))?;
    Ok(Self::new(Arc::new(backend), config))
  }

  pub fn config(&self) -> &AdapterConfig {
    &self.config
  }

  fn native(&self, handle: DeviceHandle) -> Result<Arc<dyn NativeDevice>> {
    lock(&self.devices)
      .get(&handle)
      .map(|entry| entry.native.clone())
      .ok_or(Error::NotFound(Target::Device))
  }

  pub fn is_connected(&self, handle: DeviceHandle) -> bool {
    lock(&self.devices).contains_key(&handle)
  }

  pub fn is_opened(&self, handle: DeviceHandle) -> bool {
    self
      .native(handle)
      .map(|native| native.is_open())
      .unwrap_or(false)
  }

  /// Enumerates the native devices, registering new ones and dropping
  /// entries for devices that are gone.
  pub async fn list_usb_devices(self: &Arc<Self>) -> Result<Vec<UsbDevice>> {
    let natives = self
      .backend
      .devices()
      .await
      .map_err(usb_error("getDevices"))?;
    let present = natives
      .iter()
      .map(|native| DeviceHandle::of(native.as_ref()))
      .collect::<BTreeSet<_>>();

    let mut handles = Vec::with_capacity(natives.len());
    for native in natives {
      if let Some(handle) =
        self.load_device(native, self.config.retry_count).await
      {
        handles.push(handle);
      }
    }
    self.prune(&present);

    let mut devices = Vec::with_capacity(handles.len());
    for handle in handles {
      match self.usb_device(handle).await {
        Ok(device) => devices.push(device),
        Err(err) => debug!(%handle, %err, "skipping device"),
      }
    }
    debug!(count = devices.len(), "enumerated devices");
    Ok(devices)
  }

  /// Builds a [`UsbDevice`] for a registered handle.
  pub async fn usb_device(
    self: &Arc<Self>,
    handle: DeviceHandle,
  ) -> Result<UsbDevice> {
    let (native, url, state) = {
      let devices = lock(&self.devices);
      let entry = devices
        .get(&handle)
        .ok_or(Error::NotFound(Target::Device))?;
      (entry.native.clone(), entry.url.clone(), entry.state.clone())
    };
    let descriptors = native.descriptors().map_err(usb_error("getDevices"))?;

    let opened = match open_for_read(native.as_ref(), 0, &self.config).await {
      Ok(opened) => opened,
      Err(err) => {
        debug!(%handle, %err, "cannot open device to read strings");
        false
      }
    };

    let descriptor = &descriptors.device;
    let strings = DeviceStrings {
      manufacturer_name: read_string(
        native.as_ref(),
        descriptor.manufacturer_string_index,
      )
      .await,
      product_name: read_string(
        native.as_ref(),
        descriptor.product_string_index,
      )
      .await,
      serial_number: read_string(
        native.as_ref(),
        descriptor.serial_number_string_index,
      )
      .await,
    };
    let mut configurations =
      Vec::with_capacity(descriptors.configurations.len());
    for config in &descriptors.configurations {
      configurations
        .push(UsbConfiguration::from_descriptor(config, native.as_ref()).await);
    }
    close_after_read(native.as_ref(), opened).await;

    Ok(UsbDevice::new(
      self.clone(),
      handle,
      state,
      descriptor,
      strings,
      configurations,
      url,
    ))
  }

  /// Registers `native` and reads its landing page. A device whose
  /// descriptors cannot be read is skipped.
  async fn load_device(
    &self,
    native: Arc<dyn NativeDevice>,
    retries: u32,
  ) -> Option<DeviceHandle> {
    let handle = DeviceHandle::of(native.as_ref());
    let descriptors = match native.descriptors() {
      Ok(descriptors) => descriptors,
      Err(err) => {
        debug!(%handle, %err, "skipping device, descriptors unreadable");
        return None;
      }
    };

    let registered = lock(&self.devices)
      .get(&handle)
      .map(|entry| entry.native.clone());
    // Another device may have taken over the bus address.
    let replaced = registered
      .as_ref()
      .map_or(false, |old| !same_device(old.as_ref(), &descriptors));
    // A registered device may be held open by the caller.
    let native = match registered {
      Some(old) if !replaced && old.is_open() => old,
      _ => native,
    };

    let url = match open_for_read(native.as_ref(), retries, &self.config).await
    {
      Ok(opened) => {
        let url = fetch_landing_page(native.as_ref()).await;
        close_after_read(native.as_ref(), opened).await;
        url
      }
      Err(err) => {
        warn!(%handle, %err, "cannot open device to read capabilities");
        None
      }
    };

    {
      let mut devices = lock(&self.devices);
      match devices.get_mut(&handle) {
        Some(entry) if !replaced => {
          entry.native = native;
          entry.url = url;
        }
        _ => {
          debug!(%handle, ?url, "registered device");
          devices.insert(
            handle,
            DeviceEntry {
              native,
              url,
              state: Arc::new(Mutex::new(DeviceState::new(
                descriptors.active_configuration,
              ))),
            },
          );
        }
      }
    }

    if replaced {
      info!(%handle, "device was replaced");
      let _ = self.events.send(AdapterEvent::Disconnect(handle));
    }
    Some(handle)
  }

  fn prune(&self, present: &BTreeSet<DeviceHandle>) {
    let mut gone = Vec::new();
    lock(&self.devices).retain(|handle, _| {
      let keep = present.contains(handle);
      if !keep {
        gone.push(*handle);
      }
      keep
    });

    for handle in gone {
      info!(%handle, "device is gone");
      let _ = self.events.send(AdapterEvent::Disconnect(handle));
    }
  }

  async fn attach(&self, native: Arc<dyn NativeDevice>) {
    let retries = self.config.retry_count;
    if let Some(handle) = self.load_device(native, retries).await {
      info!(%handle, "device attached");
      let _ = self.events.send(AdapterEvent::Connect(handle));
    }
  }

  fn detach(&self, handle: DeviceHandle) {
    if lock(&self.devices).remove(&handle).is_some() {
      info!(%handle, "device detached");
      let _ = self.events.send(AdapterEvent::Disconnect(handle));
    }
  }

  /// Native attach/detach listening runs while at least one
  /// [`Subscription`] is alive. Must be called within a Tokio runtime.
  pub fn subscribe(self: &Arc<Self>) -> Result<Subscription> {
    let events = self.events.subscribe();
    let mut listening = lock(&self.listening);
    if listening.subscribers == 0 {
      listening.active = Some(self.start_listening()?);
    }
    listening.subscribers += 1;

    Ok(Subscription {
      adapter: self.clone(),
      events,
    })
  }

  fn start_listening(self: &Arc<Self>) -> Result<ActiveListener> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
      usb_error("subscribe")(TransportError::Other(err.to_string()))
    })?;
    let (tx, rx) = mpsc::unbounded_channel();
    let guard = self.backend.watch(tx).map_err(usb_error("subscribe"))?;
    let task = runtime.spawn(run_hotplug(Arc::downgrade(self), rx));
    info!("listening for attach and detach");

    Ok(ActiveListener {
      _guard: guard,
      task,
    })
  }

  fn unsubscribe(&self) {
    let stopped = {
      let mut listening = lock(&self.listening);
      listening.subscribers = listening.subscribers.saturating_sub(1);
      if listening.subscribers == 0 {
        listening.active.take()
      } else {
        None
      }
    };

    if stopped.is_some() {
      info!("stopped listening for attach and detach");
    }
  }

  pub fn is_listening(&self) -> bool {
    lock(&self.listening).active.is_some()
  }

  pub async fn open(&self, handle: DeviceHandle) -> Result<()> {
    let native = self.native(handle)?;
    native.open().await.map_err(usb_error("open"))?;
    debug!(%handle, "opened");
    Ok(())
  }

  pub async fn close(&self, handle: DeviceHandle) -> Result<()> {
    let native = self.native(handle)?;
    native.close().await.map_err(usb_error("close"))?;
    debug!(%handle, "closed");
    Ok(())
  }

  pub async fn select_configuration(
    &self,
    handle: DeviceHandle,
    configuration_value: u8,
  ) -> Result<()> {
    self
      .native(handle)?
      .set_configuration(configuration_value)
      .await
      .map_err(usb_error("selectConfiguration"))
  }

  pub async fn claim_interface(
    &self,
    handle: DeviceHandle,
    interface_number: u8,
  ) -> Result<()> {
    self
      .native(handle)?
      .claim_interface(interface_number)
      .await
      .map_err(usb_error("claimInterface"))
  }

  pub async fn release_interface(
    &self,
    handle: DeviceHandle,
    interface_number: u8,
  ) -> Result<()> {
    self
      .native(handle)?
      .release_interface(interface_number)
      .await
      .map_err(usb_error("releaseInterface"))
  }

  pub async fn select_alternate_interface(
    &self,
    handle: DeviceHandle,
    interface_number: u8,
    alternate_setting: u8,
  ) -> Result<()> {
    self
      .native(handle)?
      .set_alternate_setting(interface_number, alternate_setting)
      .await
      .map_err(usb_error("selectAlternateInterface"))
  }

  pub async fn control_transfer_in(
    &self,
    handle: DeviceHandle,
    setup: &UsbControlTransferParameters,
    length: usize,
  ) -> Result<UsbInTransferResult> {
    let result = self
      .native(handle)?
      .control_transfer_in(
        setup.bm_request_type(Direction::In),
        setup.request,
        setup.value,
        setup.index,
        length,
      )
      .await;
    in_transfer_result(result).map_err(usb_error("controlTransferIn"))
  }

  pub async fn control_transfer_out(
    &self,
    handle: DeviceHandle,
    setup: &UsbControlTransferParameters,
    data: &[u8],
  ) -> Result<UsbOutTransferResult> {
    let result = self
      .native(handle)?
      .control_transfer_out(
        setup.bm_request_type(Direction::Out),
        setup.request,
        setup.value,
        setup.index,
        data,
      )
      .await;
    out_transfer_result(result).map_err(usb_error("controlTransferOut"))
  }

  /// Sends CLEAR_FEATURE(ENDPOINT_HALT) to the endpoint.
  pub async fn clear_halt(
    &self,
    handle: DeviceHandle,
    direction: Direction,
    endpoint_number: u8,
  ) -> Result<()> {
    self
      .native(handle)?
      .control_transfer_out(
        RECIPIENT_ENDPOINT,
        CLEAR_FEATURE_REQUEST,
        ENDPOINT_HALT_FEATURE,
        endpoint_address(direction, endpoint_number) as u16,
        &[],
      )
      .await
      .map_err(usb_error("clearHalt"))?;
    Ok(())
  }

  pub async fn transfer_in(
    &self,
    handle: DeviceHandle,
    endpoint: &UsbEndpoint,
    length: usize,
  ) -> Result<UsbInTransferResult> {
    let result = self
      .native(handle)?
      .transfer_in(endpoint.address(), endpoint.r#type, length)
      .await;
    in_transfer_result(result).map_err(usb_error("transferIn"))
  }

  pub async fn transfer_out(
    &self,
    handle: DeviceHandle,
    endpoint: &UsbEndpoint,
    data: &[u8],
  ) -> Result<UsbOutTransferResult> {
    let result = self
      .native(handle)?
      .transfer_out(endpoint.address(), endpoint.r#type, data)
      .await;
    out_transfer_result(result).map_err(usb_error("transferOut"))
  }

  pub async fn reset(&self, handle: DeviceHandle) -> Result<()> {
    self
      .native(handle)?
      .reset()
      .await
      .map_err(usb_error("reset"))
  }
}

async fn run_hotplug(
  adapter: Weak<UsbAdapter>,
  mut events: mpsc::UnboundedReceiver<HotplugEvent>,
) {
  while let Some(event) = events.recv().await {
    let adapter = match adapter.upgrade() {
      Some(adapter) => adapter,
      None => break,
    };

    match event {
      HotplugEvent::Arrived(native) => adapter.attach(native).await,
      HotplugEvent::Left { bus, address } => {
        adapter.detach(DeviceHandle::new(bus, address))
      }
    }
  }
}

fn same_device(
  native: &dyn NativeDevice,
  descriptors: &DescriptorSet,
) -> bool {
  native
    .descriptors()
    .map_or(false, |current| current.device == descriptors.device)
}

async fn open_with_retry(
  native: &dyn NativeDevice,
  retries: u32,
  config: &AdapterConfig,
) -> std::result::Result<(), TransportError> {
  let mut attempts_left = retries;
  loop {
    match native.open().await {
      Ok(()) => return Ok(()),
      Err(err) if attempts_left > 0 && err.is_transient() => {
        attempts_left -= 1;
        debug!(%err, attempts_left, "open failed, retrying");
        tokio::time::sleep(config.retry_delay()).await;
      }
      Err(err) => return Err(err),
    }
  }
}

/// Opens `native` unless it is already open. Returns whether it has to be
/// closed again after the read.
async fn open_for_read(
  native: &dyn NativeDevice,
  retries: u32,
  config: &AdapterConfig,
) -> std::result::Result<bool, TransportError> {
  if native.is_open() {
    return Ok(false);
  }
  open_with_retry(native, retries, config).await?;
  Ok(true)
}

async fn close_after_read(native: &dyn NativeDevice, opened: bool) {
  if !opened {
    return;
  }
  if let Err(err) = native.close().await {
    debug!(%err, "close after read failed");
  }
}

// http://wicg.github.io/webusb/#get-url
async fn fetch_landing_page(native: &dyn NativeDevice) -> Option<String> {
  let capabilities = match native.capabilities().await {
    Ok(capabilities) => capabilities,
    Err(err) => {
      debug!(%err, "device capabilities unavailable");
      return None;
    }
  };
  let capability = find_web_capability(&capabilities)?;
  let (vendor_code, landing_page_id) = landing_page_request(capability)?;

  match native
    .control_transfer_in(
      URL_REQUEST_TYPE,
      vendor_code,
      landing_page_id as u16,
      URL_REQUEST_INDEX,
      URL_REQUEST_LENGTH,
    )
    .await
  {
    Ok(bytes) => parse_url_descriptor(&bytes),
    Err(err) => {
      debug!(%err, "landing page request failed");
      None
    }
  }
}

fn in_transfer_result(
  result: std::result::Result<Vec<u8>, TransportError>,
) -> std::result::Result<UsbInTransferResult, TransportError> {
  let (data, status) = match result {
    Ok(data) => (data, UsbTransferStatus::Ok),
    Err(TransportError::Stall) => (Vec::new(), UsbTransferStatus::Stall),
    Err(TransportError::Babble) => (Vec::new(), UsbTransferStatus::Babble),
    Err(err) => return Err(err),
  };
  Ok(UsbInTransferResult { data, status })
}

fn out_transfer_result(
  result: std::result::Result<usize, TransportError>,
) -> std::result::Result<UsbOutTransferResult, TransportError> {
  let (bytes_written, status) = match result {
    Ok(n) => (n, UsbTransferStatus::Ok),
    Err(TransportError::Stall) => (0, UsbTransferStatus::Stall),
    Err(TransportError::Babble) => (0, UsbTransferStatus::Babble),
    Err(err) => return Err(err),
  };
  Ok(UsbOutTransferResult {
    bytes_written,
    status,
  })
}

/// A live registration for [`AdapterEvent`]s. Dropping the last one stops
/// native listening.
pub struct Subscription {
  adapter: Arc<UsbAdapter>,
  events: broadcast::Receiver<AdapterEvent>,
}

impl Subscription {
  pub async fn recv(&mut self) -> Option<AdapterEvent> {
    loop {
      match self.events.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "adapter events dropped");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  pub fn adapter(&self) -> &Arc<UsbAdapter> {
    &self.adapter
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.adapter.unsubscribe();
  }
}
