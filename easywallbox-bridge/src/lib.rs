//! EasyWallbox bridge.
//!
//! Connects an EasyWallbox charger over Bluetooth LE to an MQTT broker.
//! Command topics are translated into device commands, device notifications
//! are passed through, and both links are kept alive independently.
//!
//! # Topics
//!
//! ```text
//! <base>/set/<field>          structured commands (user_limit, dpm, refresh, ...)
//! <base>/dpm|charge|limit|read/...   legacy command topics
//! <base>/control              "reconnect" forces a Bluetooth reconnect
//! <base>/message              raw device notifications
//! <base>/availability         online / offline (retained)
//! <base>/<entity>/state       optimistic state after a set command
//! ```

pub mod ble;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod link;
pub mod mapper;
pub mod mqtt;
pub mod protocol;
pub mod runner;
pub mod wireless;

pub use bus::{BusClient, BusEvent, BusEventSource, BusHandle, BusLinkManager};
pub use config::WallboxBridgeConfig;
pub use coordinator::{BusLink, Coordinator, DeviceLink, ReconcileMode};
pub use link::{Availability, LinkError, LinkEvent, LinkState, RawNotification};
pub use mapper::{CommandMapper, DeviceCommandString, MappingError};
pub use runner::Bridge;
pub use wireless::{WirelessChannel, WirelessHandle, WirelessLinkManager, WirelessTransport};
