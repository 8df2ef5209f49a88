//! Bluetooth Module
//!
//! Connects to the counter peripheral and streams its notifications.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (Coordinator - user intent in, status/values out)      │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌─────────────┐  ┌──────────┐
//! │  Scanner  │  │ GattSession │  │ Protocol │
//! │           │  │             │  │          │
//! │ - Address │  │ - Lifecycle │  │ - UUIDs  │
//! │   filter  │  │ - Subscribe │  │ - Decode │
//! └─────┬─────┘  └──────┬──────┘  └──────────┘
//!       └───────┬───────┘
//!               ▼
//!        ┌─────────────┐
//!        │  BleStack   │  SimulatedStack / WinRtStack
//!        └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Device identity constants and payload decoding
//! - [`stack`] - Platform seam and permission gate
//! - [`scanner`] - Advertisement filtering
//! - [`session`] - GATT connection state machine
//! - [`service`] - Main service coordinator
//! - [`simulated`] - In-process stack and scripted peripheral

pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;
pub mod simulated;
pub mod stack;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::BluetoothService;
