//! # LIFX Control Library
//!
//! `lifx-control-lib` is a Rust library for discovering and controlling LIFX bulbs over
//! the LAN protocol. It speaks the binary UDP protocol directly, without any cloud
//! service in between.
//!
//! The library is built around a single event loop. A [`LightController`] binds the UDP
//! socket, decodes every datagram it receives and feeds it to a registry that keeps the
//! state of every bulb and group it has seen. Commands are sent through the controller
//! handle and their outcome, as well as every state change reported by the bulbs, is
//! published as a stream of events.
//!
//! ## Features
//!
//! - Broadcast and per-address device discovery
//! - Per-device discovery of label, firmware, signal strength, product, group and color
//! - Power, color, label and reboot commands for single devices and whole groups
//! - Retries with configurable interval and retry count, with acknowledgement tracking
//! - Optional heartbeat (echo) monitoring per device
//!
//! ## Example
//!
//! Discover the bulbs on the local network and turn each one on as it is found:
//!
//! ```no_run
//! use lifx_control_lib::control_interface::controller::LightController;
//! use lifx_control_lib::control_interface::LightEvent;
//! use lifx_control_lib::led::hsbk::NamedColor;
//! use lifx_control_lib::util::config::ControllerConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let controller = LightController::start(ControllerConfig::default()).await?;
//!     let mut events = controller.subscribe();
//!     controller.discover().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let LightEvent::DiscoveryFinished(device) = event {
//!             println!("Found device: {}", device);
//!             controller.set_power(device.id, true).await?;
//!             controller
//!                 .set_color(device.id, NamedColor::Daylight.into(), 1000, false)
//!                 .await?;
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with LIFX or its affiliates.
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.
//! See the `LICENSE-MIT` and `LICENSE-APACHE` files for the full text of the licenses.

pub use control_interface::controller::LightController;

// The `control_interface` module holds the device registry, the data model for
// devices and groups, the events it publishes and the controller that runs it.
//
// Example usage:
//
// ```
// use lifx_control_lib::control_interface::controller::LightController;
// use lifx_control_lib::util::config::ControllerConfig;
//
// #[tokio::main]
// async fn main() {
//     let controller = LightController::start(ControllerConfig::default()).await.unwrap();
//     controller.discover().await.unwrap();
//     for device in controller.devices().await.unwrap() {
//         println!("{}", device);
//     }
// }
// ```
pub mod control_interface;

// The `led` module contains the HSBK color model used on the wire, named presets
// and conversion to and from RGB.
//
// Example usage:
//
// ```
// use lifx_control_lib::led::hsbk::{Hsbk, NamedColor};
//
// let warm: Hsbk = NamedColor::Warm.into();
// let rgb = warm.to_srgb();
// ```
pub mod led;

// The `protocol` module encodes and decodes frames and message payloads.
//
// Example usage:
//
// ```
// use lifx_control_lib::protocol::{decode, encode, FrameHeader};
//
// let datagram = encode(&FrameHeader::discovery(1), &[]);
// let frame = decode(&datagram).unwrap();
// ```
pub mod protocol;

// The `util` module provides the UDP transport, the request tracker that handles
// retries and correlation, and the controller configuration.
//
// Example usage:
//
// ```
// use lifx_control_lib::util::config::{ControllerConfig, RetryPolicy};
//
// let config = ControllerConfig {
//     request_policy: RetryPolicy::new(500, 5),
//     ..Default::default()
// };
// config.validate().unwrap();
// ```
pub mod util;
