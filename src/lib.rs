//! WebUSB API on top of the host's native USB stack.
//!
//! [`Usb`] is the entry point (the `navigator.usb` of this crate): it
//! enumerates devices through a [`Backend`], picks one per
//! [`Usb::request_device`] call and remembers it for [`Usb::get_devices`].
//! Every [`UsbDevice`] operation checks the WebUSB state machine before
//! reaching the native transport.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

#[cfg(feature = "libusb")]
pub use rusb;

pub mod adapter;
pub mod backend;
pub mod config;
pub mod constants;
pub mod descriptors;
pub mod device;
pub mod filter;
#[cfg(feature = "libusb")]
pub mod libusb;
pub mod model;
mod usb;

#[cfg(test)]
mod testing;

pub use crate::adapter::AdapterEvent;
pub use crate::adapter::Subscription;
pub use crate::adapter::UsbAdapter;
pub use crate::backend::Backend;
pub use crate::backend::NativeDevice;
pub use crate::backend::TransportError;
pub use crate::config::AdapterConfig;
pub use crate::device::DeviceHandle;
pub use crate::device::DeviceIdentity;
pub use crate::device::UsbDevice;
pub use crate::filter::UsbDeviceFilter;
pub use crate::filter::UsbDeviceRequestOptions;
pub use crate::model::*;
pub use crate::usb::DeviceChooser;
pub use crate::usb::Usb;
pub use crate::usb::UsbEvent;
pub use crate::usb::UsbEvents;

/// What a [`Error::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
  Device,
  Configuration,
  Interface,
  Endpoint,
}

impl std::fmt::Display for Target {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Target::Device => "device",
      Target::Configuration => "configuration",
      Target::Interface => "interface",
      Target::Endpoint => "endpoint",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
  #[error("{0} not found")]
  NotFound(Target),
  #[error("invalid state")]
  InvalidState,
  #[error("invalid access")]
  InvalidAccess,
  #[error("method not implemented")]
  NotImplemented,
  #[error("requestDevice error: no devices found")]
  NoDevicesFound,
  /// Malformed caller input, rejected before any I/O.
  #[error("{0}")]
  Type(String),
  #[error("{operation} error: {source}")]
  Usb {
    operation: &'static str,
    source: TransportError,
  },
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn usb_error(
  operation: &'static str,
) -> impl Fn(TransportError) -> Error {
  move |source| Error::Usb { operation, source }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
