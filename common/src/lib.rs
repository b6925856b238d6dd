pub mod cloud;
pub mod config;
pub mod dns;
pub mod link;
pub mod paths;
pub mod portal;
pub mod switch;

pub use cloud::{
    resource_url, LineAssembler, PutClient, PutOutcome, PutTransport, StreamSession,
    TransportError, Value,
};
pub use config::{CloudConfig, DeviceConfig, PortalConfig, StationCredential};
pub use dns::{captive_response, DnsError, DnsHeader};
pub use link::{LinkAction, LinkEvent, LinkState, LinkSupervisor};
pub use paths::*;
pub use portal::{parse_connect_query, Route};
pub use switch::{Debouncer, Pulse, SwitchState};
