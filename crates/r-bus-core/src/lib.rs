//! ---
//! bus_section: "01-core-functionality"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Registry reconstruction from remote metadata and local publication."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
//! Bus publisher: turns the metadata of every online instance into registry
//! objects and writes the objects of this instance back to the bus.

pub mod publisher;

pub use publisher::{BusPublisher, PublisherHandle};
