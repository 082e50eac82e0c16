pub mod device;
pub mod events;
pub mod registry;
pub mod transport;
pub mod types;

pub use device::{Device, DeviceSettings};
pub use registry::DeviceRegistry;
pub use transport::{DeviceTransport, SoapTransport};
pub use types::{DeviceCommand, DeviceEvent, DeviceProperties, MediaInfo, TransportState};
