//! Server and client bookkeeping.
//!
//! [`ServerList`] maps every known service identity to its provider
//! ([`ServerInfo`]) and the consumers waiting for or connected to it
//! ([`ClientList`]). Only the service manager mutates it.

mod info;
mod server_list;

pub use info::{ClientInfo, ClientList, ServerInfo};
pub use server_list::{ClientSnapshot, RegistrySnapshot, ServerList, ServerSnapshot};
