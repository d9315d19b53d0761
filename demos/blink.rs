use webusb::Direction;
use webusb::Result;
use webusb::Usb;
use webusb::UsbControlTransferParameters;
use webusb::UsbDeviceFilter;
use webusb::UsbDeviceRequestOptions;
use webusb::UsbRecipient;
use webusb::UsbRequestType;

use std::io::Read;

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const ARDUINO_CONTROL_INIT: UsbControlTransferParameters =
  UsbControlTransferParameters {
    request_type: UsbRequestType::Class,
    recipient: UsbRecipient::Interface,
    request: 0x22,
    value: 0x01,
    index: 2,
  };

const ARDUINO_CONTROL_BYE: UsbControlTransferParameters =
  UsbControlTransferParameters {
    request_type: UsbRequestType::Class,
    recipient: UsbRecipient::Interface,
    request: 0x22,
    value: 0x00,
    index: 2,
  };

fn setup_logging() {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new("webusb=info"));
  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer())
    .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  setup_logging();

  let usb = Usb::libusb()?;
  let options = UsbDeviceRequestOptions::new(vec![UsbDeviceFilter::product(
    0x2341, 0x8036,
  )]);
  let device = usb
    .request_device(&options)
    .await?
    .expect("Device not found.");
  println!("{} ({:?})", device.product_name, device.url);

  device.open().await?;
  if device.configuration().is_none() {
    device.select_configuration(1).await?;
  }
  device.claim_interface(2).await?;
  device.select_alternate_interface(2, 0).await?;

  device
    .control_transfer_out(ARDUINO_CONTROL_INIT, &[])
    .await?;

  println!("H: LED on, L: LED off, Q: quit");
  loop {
    let input: Option<u8> = std::io::stdin()
      .bytes()
      .next()
      .and_then(|result| result.ok());

    match input {
      Some(byte @ (b'H' | b'L')) => {
        device.transfer_out(4, &[byte]).await?;
        device.clear_halt(Direction::Out, 4).await?;
      }
      Some(b'Q') | None => break,
      _ => {}
    }
  }

  device
    .control_transfer_out(ARDUINO_CONTROL_BYE, &[])
    .await?;
  device.close().await?;
  Ok(())
}
