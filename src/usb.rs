use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;
use tracing::info;

use crate::adapter::AdapterEvent;
use crate::adapter::Subscription;
use crate::adapter::UsbAdapter;
use crate::device::UsbDevice;
use crate::filter::UsbDeviceRequestOptions;
use crate::lock;
use crate::Error;
use crate::Result;

/// Picks one of the devices matching a [`Usb::request_device`] call, the
/// way a browser's device chooser does.
#[async_trait]
pub trait DeviceChooser: Send + Sync {
  /// `None` cancels the request.
  async fn choose(&self, devices: Vec<UsbDevice>) -> Option<UsbDevice>;
}

/// Allow-list entry with the same identity is swapped for `device`.
fn replace_allowed(allowed: &mut [UsbDevice], device: &UsbDevice) -> bool {
  let identity = device.identity();
  match allowed.iter_mut().find(|d| d.identity() == identity) {
    Some(entry) => {
      *entry = device.clone();
      true
    }
    None => false,
  }
}

/// The `navigator.usb` object.
#[derive(Clone)]
pub struct Usb {
  adapter: Arc<UsbAdapter>,
  chooser: Option<Arc<dyn DeviceChooser>>,
  allowed: Arc<Mutex<Vec<UsbDevice>>>,
}

impl Usb {
  pub fn new(adapter: Arc<UsbAdapter>) -> Self {
    Self {
      adapter,
      chooser: None,
      allowed: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Without a chooser the first matching device is picked.
  pub fn with_chooser(
    adapter: Arc<UsbAdapter>,
    chooser: impl DeviceChooser + 'static,
  ) -> Self {
    Self {
      chooser: Some(Arc::new(chooser)),
      ..Self::new(adapter)
    }
  }

  #[cfg(feature = "libusb")]
  pub fn libusb() -> Result<Self> {
    let adapter = UsbAdapter::libusb(crate::AdapterConfig::default())?;
    Ok(Self::new(adapter))
  }

  pub fn adapter(&self) -> &Arc<UsbAdapter> {
    &self.adapter
  }

  /// Connected devices previously granted through
  /// [`Usb::request_device`], matched by vendor, product and serial number.
  pub async fn get_devices(&self) -> Result<Vec<UsbDevice>> {
    let devices = self.adapter.list_usb_devices().await?;

    let mut allowed = lock(&self.allowed);
    Ok(
      devices
        .into_iter()
        .filter(|device| replace_allowed(&mut allowed, device))
        .collect(),
    )
  }

  /// Resolves to `None` when the chooser picks nothing.
  pub async fn request_device(
    &self,
    options: &UsbDeviceRequestOptions,
  ) -> Result<Option<UsbDevice>> {
    options.validate()?;

    let devices = self
      .adapter
      .list_usb_devices()
      .await?
      .into_iter()
      .filter(|device| options.matches(device))
      .collect::<Vec<_>>();
    if devices.is_empty() {
      return Err(Error::NoDevicesFound);
    }

    let device = match &self.chooser {
      Some(chooser) => chooser.choose(devices).await,
      None => devices.into_iter().next(),
    };
    let device = match device {
      Some(device) => device,
      None => {
        debug!("no device chosen");
        return Ok(None);
      }
    };

    let mut allowed = lock(&self.allowed);
    if !replace_allowed(&mut allowed, &device) {
      allowed.push(device.clone());
    }
    info!(handle = %device.handle(), "device granted");
    Ok(Some(device))
  }

  /// [`Usb::request_device`] with options that still need their structure
  /// checked.
  pub async fn request_device_value(
    &self,
    options: serde_json::Value,
  ) -> Result<Option<UsbDevice>> {
    let options = UsbDeviceRequestOptions::from_value(options)?;
    self.request_device(&options).await
  }

  /// Attach and detach notifications for granted devices.
  pub fn events(&self) -> Result<UsbEvents> {
    Ok(UsbEvents {
      subscription: self.adapter.subscribe()?,
      allowed: self.allowed.clone(),
    })
  }
}

#[derive(Debug, Clone)]
pub enum UsbEvent {
  Connect(UsbDevice),
  Disconnect(UsbDevice),
}

pub struct UsbEvents {
  subscription: Subscription,
  allowed: Arc<Mutex<Vec<UsbDevice>>>,
}

impl UsbEvents {
  pub async fn next(&mut self) -> Option<UsbEvent> {
    loop {
      match self.subscription.recv().await? {
        AdapterEvent::Connect(handle) => {
          let adapter = self.subscription.adapter();
          let device = match adapter.usb_device(handle).await {
            Ok(device) => device,
            Err(err) => {
              debug!(%handle, %err, "attached device is unusable");
              continue;
            }
          };
          if replace_allowed(&mut lock(&self.allowed), &device) {
            return Some(UsbEvent::Connect(device));
          }
        }
        AdapterEvent::Disconnect(handle) => {
          let device = lock(&self.allowed)
            .iter()
            .find(|device| device.handle() == handle)
            .cloned();
          if let Some(device) = device {
            return Some(UsbEvent::Disconnect(device));
          }
        }
      }
    }
  }
}
