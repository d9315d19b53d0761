use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::device::UsbDevice;
use crate::Error;
use crate::Result;

/// One `USBDeviceFilter`. Every field that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UsbDeviceFilter {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub vendor_id: Option<u16>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub product_id: Option<u16>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub class_code: Option<u8>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub subclass_code: Option<u8>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub protocol_code: Option<u8>,
  #[serde(alias = "serialnumber", skip_serializing_if = "Option::is_none")]
  pub serial_number: Option<String>,
}

impl UsbDeviceFilter {
  pub fn vendor(vendor_id: u16) -> Self {
    Self {
      vendor_id: Some(vendor_id),
      ..Default::default()
    }
  }

  pub fn product(vendor_id: u16, product_id: u16) -> Self {
    Self {
      vendor_id: Some(vendor_id),
      product_id: Some(product_id),
      ..Default::default()
    }
  }

  /// Protocol needs a subclass and subclass needs a class.
  pub fn validate(&self) -> Result<()> {
    if self.protocol_code.is_some() && self.subclass_code.is_none() {
      return Err(Error::Type(
        "requestDevice error: subclass code is required".to_string(),
      ));
    }
    if self.subclass_code.is_some() && self.class_code.is_none() {
      return Err(Error::Type(
        "requestDevice error: class code is required".to_string(),
      ));
    }
    Ok(())
  }

  pub fn matches(&self, device: &UsbDevice) -> bool {
    if self.vendor_id.map_or(false, |id| id != device.vendor_id) {
      return false;
    }
    if self.product_id.map_or(false, |id| id != device.product_id) {
      return false;
    }
    if let Some(serial_number) = &self.serial_number {
      if *serial_number != device.serial_number {
        return false;
      }
    }

    if self.class_code.is_none() {
      return true;
    }
    if self.matches_class(
      device.device_class,
      device.device_subclass,
      device.device_protocol,
    ) {
      return true;
    }

    // Interfaces of the current configuration, at their selected setting.
    device.configuration().map_or(false, |configuration| {
      configuration.interfaces.iter().any(|itf| {
        device.alternate(itf.interface_number).map_or(false, |alt| {
          self.matches_class(
            alt.interface_class,
            alt.interface_subclass,
            alt.interface_protocol,
          )
        })
      })
    })
  }

  fn matches_class(&self, class: u8, subclass: u8, protocol: u8) -> bool {
    self.class_code.map_or(true, |c| c == class)
      && self.subclass_code.map_or(true, |c| c == subclass)
      && self.protocol_code.map_or(true, |c| c == protocol)
  }
}

/// `USBDeviceRequestOptions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsbDeviceRequestOptions {
  pub filters: Vec<UsbDeviceFilter>,
}

impl UsbDeviceRequestOptions {
  pub fn new(filters: Vec<UsbDeviceFilter>) -> Self {
    Self { filters }
  }

  /// Builds options from an untyped value, rejecting malformed input with
  /// the same messages a browser gives. `Value::Null` stands for a missing
  /// argument.
  pub fn from_value(value: Value) -> Result<Self> {
    let type_error = |message: &str| {
      Error::Type(format!("requestDevice error: {}", message))
    };

    let options = match value {
      Value::Null => {
        return Err(type_error("1 argument required, but only 0 present"))
      }
      Value::Object(options) => options,
      _ => return Err(type_error("parameter 1 (options) is not an object")),
    };
    let filters = match options.get("filters") {
      None | Some(Value::Null) => {
        return Err(type_error("required member filters is undefined"))
      }
      Some(filters @ Value::Array(_)) => filters.clone(),
      Some(_) => {
        return Err(type_error(
          "the provided value cannot be converted to a sequence",
        ))
      }
    };

    let filters: Vec<UsbDeviceFilter> = serde_json::from_value(filters)
      .map_err(|err| type_error(&err.to_string()))?;
    let options = Self::new(filters);
    options.validate()?;
    Ok(options)
  }

  /// Checks every filter; the first violation wins.
  pub fn validate(&self) -> Result<()> {
    self.filters.iter().try_for_each(UsbDeviceFilter::validate)
  }

  pub fn matches(&self, device: &UsbDevice) -> bool {
    self.filters.iter().any(|filter| filter.matches(device))
  }
}
