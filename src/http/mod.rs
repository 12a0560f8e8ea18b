//! Blocking HTTP collaborators used by the binaries.

pub mod client;
pub mod couch;
pub mod platform;
pub mod tunnel;

pub use client::HttpClient;
pub use couch::CouchStore;
pub use platform::HttpPlatform;
pub use tunnel::PortForward;
