//! Service, stub and proxy addresses.
//!
//! Every address caches a 32-bit "magic number" over its identity fields.
//! The magic number is the hash key of an address and the fast path of its
//! equality check. It is recomputed on every identity mutation and equals
//! [`CHECKSUM_IGNORE`] while the address is not validated.
//!
//! Addresses have a canonical path form used in logs and when crossing a
//! process boundary:
//!
//! ```text
//! stub/<name>/<major>.<minor>.<patch>/<type>/<role>
//! proxy/<name>/<major>.<minor>.<patch>/<type>/<role>/<thread>/<cookie>
//! ```

use crate::channel::{Channel, Cookie, ThreadId};
use crate::service::{ServiceItem, ServiceType, Version};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Magic number of an address that is not validated.
pub const CHECKSUM_IGNORE: u32 = 0;

const SEPARATOR: char = '/';
const STUB_PREFIX: &str = "stub";
const PROXY_PREFIX: &str = "proxy";

/// Errors from parsing address paths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("missing path segment: {0}")]
    MissingSegment(&'static str),
    #[error("unexpected address kind '{found}', expected '{expected}'")]
    WrongKind {
        expected: &'static str,
        found: String,
    },
    #[error("invalid version '{0}'")]
    InvalidVersion(String),
    #[error("invalid service type '{0}'")]
    InvalidServiceType(String),
    #[error("invalid cookie '{0}'")]
    InvalidCookie(String),
    #[error("trailing path data: '{0}'")]
    TrailingData(String),
}

/// Split off the next path segment. Empty segments are rejected.
fn next_segment<'a>(
    path: &'a str,
    what: &'static str,
) -> Result<(&'a str, &'a str), AddressError> {
    let (segment, rest) = path.split_once(SEPARATOR).unwrap_or((path, ""));
    if segment.is_empty() {
        Err(AddressError::MissingSegment(what))
    } else {
        Ok((segment, rest))
    }
}

/// A field that prints as exactly one path segment.
fn is_segment(field: &str) -> bool {
    !field.is_empty() && !field.contains(SEPARATOR)
}

fn expect_prefix<'a>(path: &'a str, prefix: &'static str) -> Result<&'a str, AddressError> {
    let (kind, rest) = next_segment(path, "kind")?;
    if kind != prefix {
        return Err(AddressError::WrongKind {
            expected: prefix,
            found: kind.to_string(),
        });
    }
    Ok(rest)
}

/// First four bytes of the SHA-256 digest over the identity fields. A
/// validated address never gets [`CHECKSUM_IGNORE`].
fn checksum(fields: &[&[u8]]) -> u32 {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field);
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    match u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) {
        CHECKSUM_IGNORE => 1,
        magic => magic,
    }
}

// ---------------------------------------------------------------------------
// ServiceAddress
// ---------------------------------------------------------------------------

/// A service item bound to the role name of one component instance.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceAddress {
    item: ServiceItem,
    role_name: String,
    magic: u32,
}

impl ServiceAddress {
    pub fn new(item: ServiceItem, role_name: impl Into<String>) -> Self {
        let mut address = Self {
            item,
            role_name: role_name.into(),
            magic: CHECKSUM_IGNORE,
        };
        address.update_magic();
        address
    }

    /// The invalid sentinel address.
    pub fn invalid() -> Self {
        Self::new(ServiceItem::invalid(), "")
    }

    /// The (name, version, type) triple.
    pub fn service_item(&self) -> &ServiceItem {
        &self.item
    }

    /// Name of the service interface.
    pub fn service_name(&self) -> &str {
        &self.item.name
    }

    /// Interface version; not part of the identity.
    pub fn version(&self) -> Version {
        self.item.version
    }

    /// Local or public visibility.
    pub fn service_type(&self) -> ServiceType {
        self.item.service_type
    }

    /// Role name of the component instance.
    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    /// Cached identity hash, [`CHECKSUM_IGNORE`] when not validated.
    pub fn magic_number(&self) -> u32 {
        self.magic
    }

    /// Whether the identity fields are complete enough to ever connect.
    ///
    /// Names containing the path separator are rejected so the path form
    /// always parses back to the same address.
    pub fn is_validated(&self) -> bool {
        self.item.is_valid() && is_segment(&self.item.name) && is_segment(&self.role_name)
    }

    pub fn set_role_name(&mut self, role_name: impl Into<String>) {
        self.role_name = role_name.into();
        self.update_magic();
    }

    pub fn set_service_item(&mut self, item: ServiceItem) {
        self.item = item;
        self.update_magic();
    }

    /// Same service name, type and role, regardless of version.
    pub fn same_identity(&self, other: &ServiceAddress) -> bool {
        self.item.name == other.item.name
            && self.item.service_type == other.item.service_type
            && self.role_name == other.role_name
    }

    /// Whether this (provider) address can serve the `consumer` address.
    pub fn can_serve(&self, consumer: &ServiceAddress) -> bool {
        self.role_name == consumer.role_name && self.item.is_compatible_with(&consumer.item)
    }

    fn update_magic(&mut self) {
        self.magic = if self.is_validated() {
            checksum(&[
                self.item.name.as_bytes(),
                &[self.item.service_type.as_u8()],
                self.role_name.as_bytes(),
            ])
        } else {
            CHECKSUM_IGNORE
        };
    }

    fn write_path(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = write!(
            out,
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.item.name, self.item.version, self.item.service_type, self.role_name
        );
    }

    /// Parse `<name>/<version>/<type>/<role>` and return the remainder.
    pub fn try_from_path(path: &str) -> Result<(Self, &str), AddressError> {
        let (name, rest) = next_segment(path, "service name")?;
        let (version, rest) = next_segment(rest, "version")?;
        let version: Version = version.parse()?;
        let (service_type, rest) = next_segment(rest, "service type")?;
        let service_type = service_type
            .parse::<u8>()
            .map(ServiceType::from_u8)
            .map_err(|_| AddressError::InvalidServiceType(service_type.to_string()))?;
        let (role, rest) = next_segment(rest, "role name")?;
        let item = ServiceItem::new(name, version, service_type);
        Ok((Self::new(item, role), rest))
    }
}

impl Default for ServiceAddress {
    fn default() -> Self {
        Self::invalid()
    }
}

impl PartialEq for ServiceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.magic == other.magic && self.item == other.item && self.role_name == other.role_name
    }
}

impl Eq for ServiceAddress {}

impl Hash for ServiceAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.magic.hash(state);
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_path(&mut out);
        f.write_str(&out)
    }
}

// ---------------------------------------------------------------------------
// StubAddress
// ---------------------------------------------------------------------------

/// Address of a service provider.
///
/// Identity is the service address alone. The thread name and channel link
/// the stub to its hosting dispatcher thread.
#[derive(Debug, Clone, Serialize)]
pub struct StubAddress {
    service: ServiceAddress,
    thread_name: String,
    channel: Channel,
}

impl StubAddress {
    /// An unbound stub; set its channel before registering it.
    pub fn new(item: ServiceItem, role_name: impl Into<String>, thread_name: impl Into<String>) -> Self {
        Self::from_service(ServiceAddress::new(item, role_name), thread_name)
    }

    pub fn from_service(service: ServiceAddress, thread_name: impl Into<String>) -> Self {
        Self {
            service,
            thread_name: thread_name.into(),
            channel: Channel::default(),
        }
    }

    pub fn invalid() -> Self {
        Self::from_service(ServiceAddress::invalid(), "")
    }

    /// The service identity part of the address.
    pub fn service(&self) -> &ServiceAddress {
        &self.service
    }

    /// The (name, version, type) triple.
    pub fn service_item(&self) -> &ServiceItem {
        self.service.service_item()
    }

    /// Name of the service interface.
    pub fn service_name(&self) -> &str {
        self.service.service_name()
    }

    /// Role name of the component instance.
    pub fn role_name(&self) -> &str {
        self.service.role_name()
    }

    /// Interface version; not part of the identity.
    pub fn version(&self) -> Version {
        self.service.version()
    }

    /// Name of the hosting dispatcher thread.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Routing handle assigned at registration.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Connection the address was registered over.
    pub fn cookie(&self) -> Cookie {
        self.channel.cookie
    }

    /// Id of the hosting thread, unknown for remote addresses.
    pub fn source(&self) -> ThreadId {
        self.channel.source
    }

    /// Cached identity hash, [`CHECKSUM_IGNORE`] when not validated.
    pub fn magic_number(&self) -> u32 {
        self.service.magic_number()
    }

    pub fn is_validated(&self) -> bool {
        self.service.is_validated()
    }

    /// A validated stub with an operable channel.
    pub fn is_valid(&self) -> bool {
        self.is_validated() && self.channel.is_valid()
    }

    /// Hosted by this process.
    pub fn is_local(&self) -> bool {
        self.channel.cookie.is_local()
    }

    /// Announced by a peer process through the router.
    pub fn is_remote(&self) -> bool {
        self.channel.cookie.is_remote()
    }

    /// Whether the service is announced to the router.
    pub fn is_public(&self) -> bool {
        self.service.service_item().is_public()
    }

    /// Bind the address to a connection and hosting thread.
    pub fn set_channel(&mut self, channel: Channel) {
        self.channel = channel;
    }

    pub fn set_source(&mut self, source: ThreadId) {
        self.channel.source = source;
    }

    pub fn set_thread_name(&mut self, thread_name: impl Into<String>) {
        self.thread_name = thread_name.into();
    }

    pub fn set_role_name(&mut self, role_name: impl Into<String>) {
        self.service.set_role_name(role_name);
    }

    /// Whether this stub can serve `proxy`.
    pub fn is_proxy_compatible(&self, proxy: &ProxyAddress) -> bool {
        self.service.can_serve(proxy.service())
    }

    /// Canonical path form; parses back with [`FromStr`].
    pub fn to_path(&self) -> String {
        let mut out = String::from(STUB_PREFIX);
        out.push(SEPARATOR);
        self.service.write_path(&mut out);
        out
    }

    pub fn try_from_path(path: &str) -> Result<(Self, &str), AddressError> {
        let rest = expect_prefix(path, STUB_PREFIX)?;
        let (service, rest) = ServiceAddress::try_from_path(rest)?;
        Ok((Self::from_service(service, ""), rest))
    }

    /// Parse a stub path, returning the invalid sentinel and the untouched
    /// input when the path is malformed.
    pub fn from_path(path: &str) -> (Self, &str) {
        Self::try_from_path(path).unwrap_or_else(|_| (Self::invalid(), path))
    }
}

impl PartialEq for StubAddress {
    fn eq(&self, other: &Self) -> bool {
        self.service == other.service
    }
}

impl Eq for StubAddress {}

impl Hash for StubAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service.hash(state);
    }
}

impl fmt::Display for StubAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_path())
    }
}

impl FromStr for StubAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, rest) = Self::try_from_path(s)?;
        if !rest.is_empty() {
            return Err(AddressError::TrailingData(rest.to_string()));
        }
        Ok(address)
    }
}

// ---------------------------------------------------------------------------
// ProxyAddress
// ---------------------------------------------------------------------------

/// Address of one proxy instance.
///
/// Identity covers the service address and the hosting thread name; two
/// proxies are distinct entries when their channel cookies differ.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyAddress {
    service: ServiceAddress,
    thread_name: String,
    channel: Channel,
    magic: u32,
}

impl ProxyAddress {
    /// An unbound proxy; set its channel before registering it.
    pub fn new(item: ServiceItem, role_name: impl Into<String>, thread_name: impl Into<String>) -> Self {
        Self::from_service(ServiceAddress::new(item, role_name), thread_name)
    }

    pub fn from_service(service: ServiceAddress, thread_name: impl Into<String>) -> Self {
        let mut address = Self {
            service,
            thread_name: thread_name.into(),
            channel: Channel::default(),
            magic: CHECKSUM_IGNORE,
        };
        address.update_magic();
        address
    }

    pub fn invalid() -> Self {
        Self::from_service(ServiceAddress::invalid(), "")
    }

    /// The service identity part of the address.
    pub fn service(&self) -> &ServiceAddress {
        &self.service
    }

    /// The (name, version, type) triple.
    pub fn service_item(&self) -> &ServiceItem {
        self.service.service_item()
    }

    /// Name of the service interface.
    pub fn service_name(&self) -> &str {
        self.service.service_name()
    }

    /// Role name of the component instance.
    pub fn role_name(&self) -> &str {
        self.service.role_name()
    }

    /// Interface version; not part of the identity.
    pub fn version(&self) -> Version {
        self.service.version()
    }

    /// Name of the hosting dispatcher thread.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Routing handle assigned at registration.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Connection the address was registered over.
    pub fn cookie(&self) -> Cookie {
        self.channel.cookie
    }

    /// Id of the hosting thread, unknown for remote addresses.
    pub fn source(&self) -> ThreadId {
        self.channel.source
    }

    /// Thread of the connected stub, unknown while not connected.
    pub fn target(&self) -> ThreadId {
        self.channel.target
    }

    /// Cached identity hash, [`CHECKSUM_IGNORE`] when not validated.
    pub fn magic_number(&self) -> u32 {
        self.magic
    }

    /// Validated service identity plus a thread name usable as a path segment.
    pub fn is_validated(&self) -> bool {
        self.service.is_validated() && is_segment(&self.thread_name)
    }

    pub fn is_valid(&self) -> bool {
        self.is_validated() && self.channel.is_valid()
    }

    /// Hosted by this process.
    pub fn is_local(&self) -> bool {
        self.channel.cookie.is_local()
    }

    /// Announced by a peer process through the router.
    pub fn is_remote(&self) -> bool {
        self.channel.cookie.is_remote()
    }

    /// Whether the service is announced to the router.
    pub fn is_public(&self) -> bool {
        self.service.service_item().is_public()
    }

    /// Bind the address to a connection and hosting thread.
    pub fn set_channel(&mut self, channel: Channel) {
        self.channel = channel;
    }

    pub fn set_source(&mut self, source: ThreadId) {
        self.channel.source = source;
    }

    pub fn set_target(&mut self, target: ThreadId) {
        self.channel.target = target;
    }

    pub fn set_thread_name(&mut self, thread_name: impl Into<String>) {
        self.thread_name = thread_name.into();
        self.update_magic();
    }

    pub fn set_role_name(&mut self, role_name: impl Into<String>) {
        self.service.set_role_name(role_name);
        self.update_magic();
    }

    /// Whether `stub` can serve this proxy.
    pub fn is_stub_compatible(&self, stub: &StubAddress) -> bool {
        stub.service().can_serve(&self.service)
    }

    fn update_magic(&mut self) {
        self.magic = if self.is_validated() {
            let item = self.service.service_item();
            checksum(&[
                item.name.as_bytes(),
                &[item.service_type.as_u8()],
                self.service.role_name().as_bytes(),
                self.thread_name.as_bytes(),
            ])
        } else {
            CHECKSUM_IGNORE
        };
    }

    /// Canonical path form; parses back with [`FromStr`].
    pub fn to_path(&self) -> String {
        let mut out = String::from(PROXY_PREFIX);
        out.push(SEPARATOR);
        self.service.write_path(&mut out);
        out.push(SEPARATOR);
        out.push_str(&self.thread_name);
        out.push(SEPARATOR);
        out.push_str(&self.channel.cookie.to_string());
        out
    }

    pub fn try_from_path(path: &str) -> Result<(Self, &str), AddressError> {
        let rest = expect_prefix(path, PROXY_PREFIX)?;
        let (service, rest) = ServiceAddress::try_from_path(rest)?;
        let (thread, rest) = next_segment(rest, "thread name")?;
        let (cookie, rest) = next_segment(rest, "cookie")?;
        let cookie = cookie
            .parse::<u64>()
            .map(Cookie)
            .map_err(|_| AddressError::InvalidCookie(cookie.to_string()))?;
        let mut address = Self::from_service(service, thread);
        address.channel.cookie = cookie;
        Ok((address, rest))
    }

    /// Parse a proxy path, returning the invalid sentinel and the untouched
    /// input when the path is malformed.
    pub fn from_path(path: &str) -> (Self, &str) {
        Self::try_from_path(path).unwrap_or_else(|_| (Self::invalid(), path))
    }
}

impl PartialEq for ProxyAddress {
    fn eq(&self, other: &Self) -> bool {
        self.magic == other.magic
            && self.service == other.service
            && self.thread_name == other.thread_name
            && self.channel.cookie == other.channel.cookie
    }
}

impl Eq for ProxyAddress {}

impl Hash for ProxyAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.magic.hash(state);
        self.channel.cookie.hash(state);
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_path())
    }
}

impl FromStr for ProxyAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, rest) = Self::try_from_path(s)?;
        if !rest.is_empty() {
            return Err(AddressError::TrailingData(rest.to_string()));
        }
        Ok(address)
    }
}
