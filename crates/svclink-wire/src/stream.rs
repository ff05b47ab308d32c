//! Binary stream layout of service identity.
//!
//! All integers are little-endian. Strings are a `u32` byte length followed
//! by UTF-8 bytes.
//!
//! | Type             | Layout                                             |
//! |------------------|----------------------------------------------------|
//! | `ServiceItem`    | name: string, version: 3 × u32, type: u8           |
//! | `ServiceAddress` | `ServiceItem`, role: string                        |
//! | `StubAddress`    | `ServiceAddress`, thread: string, cookie: u64      |
//! | `ProxyAddress`   | `ServiceAddress`, thread: string, cookie: u64      |
//!
//! Thread ids are local to one process and never written. Reading an
//! address recomputes its magic number.

use bytes::{Buf, BufMut, BytesMut};
use svclink_types::{
    Channel, Cookie, ProxyAddress, ServiceAddress, ServiceItem, ServiceType, StubAddress,
    ThreadId, Version,
};
use thiserror::Error;

/// Longest string accepted when reading (64 KiB).
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Errors from decoding the wire layout.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Stream truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("String too long: {size} bytes (max {max})")]
    StringTooLong { size: usize, max: usize },
    #[error("Unknown message tag: {0}")]
    UnknownTag(u8),
    #[error("Invalid value {value} for field '{field}'")]
    InvalidField { field: &'static str, value: u8 },
}

/// Types that write themselves into a byte buffer.
pub trait WriteStream {
    fn write_to(&self, buf: &mut BytesMut);
}

/// Types that read themselves back from a byte buffer.
pub trait ReadStream: Sized {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self, WireError>;
}

pub(crate) fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn write_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub(crate) fn read_string<B: Buf>(buf: &mut B) -> Result<String, WireError> {
    ensure(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    if len > MAX_STRING_LEN {
        return Err(WireError::StringTooLong {
            size: len,
            max: MAX_STRING_LEN,
        });
    }
    ensure(buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    Ok(String::from_utf8(bytes.to_vec())?)
}

pub(crate) fn read_u8<B: Buf>(buf: &mut B) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn read_u32<B: Buf>(buf: &mut B) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn read_u64<B: Buf>(buf: &mut B) -> Result<u64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

impl WriteStream for Version {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.major);
        buf.put_u32_le(self.minor);
        buf.put_u32_le(self.patch);
    }
}

impl ReadStream for Version {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(Version::new(read_u32(buf)?, read_u32(buf)?, read_u32(buf)?))
    }
}

impl WriteStream for ServiceItem {
    fn write_to(&self, buf: &mut BytesMut) {
        write_string(buf, &self.name);
        self.version.write_to(buf);
        buf.put_u8(self.service_type.as_u8());
    }
}

impl ReadStream for ServiceItem {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        let name = read_string(buf)?;
        let version = Version::read_from(buf)?;
        let service_type = ServiceType::from_u8(read_u8(buf)?);
        Ok(ServiceItem::new(name, version, service_type))
    }
}

impl WriteStream for ServiceAddress {
    fn write_to(&self, buf: &mut BytesMut) {
        self.service_item().write_to(buf);
        write_string(buf, self.role_name());
    }
}

impl ReadStream for ServiceAddress {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        let item = ServiceItem::read_from(buf)?;
        let role = read_string(buf)?;
        Ok(ServiceAddress::new(item, role))
    }
}

fn remote_channel(cookie: Cookie) -> Channel {
    Channel::new(cookie, ThreadId::UNKNOWN, ThreadId::UNKNOWN)
}

impl WriteStream for StubAddress {
    fn write_to(&self, buf: &mut BytesMut) {
        self.service().write_to(buf);
        write_string(buf, self.thread_name());
        buf.put_u64_le(self.cookie().0);
    }
}

impl ReadStream for StubAddress {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        let service = ServiceAddress::read_from(buf)?;
        let thread = read_string(buf)?;
        let cookie = Cookie(read_u64(buf)?);
        let mut stub = StubAddress::from_service(service, thread);
        stub.set_channel(remote_channel(cookie));
        Ok(stub)
    }
}

impl WriteStream for ProxyAddress {
    fn write_to(&self, buf: &mut BytesMut) {
        self.service().write_to(buf);
        write_string(buf, self.thread_name());
        buf.put_u64_le(self.cookie().0);
    }
}

impl ReadStream for ProxyAddress {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        let service = ServiceAddress::read_from(buf)?;
        let thread = read_string(buf)?;
        let cookie = Cookie(read_u64(buf)?);
        let mut proxy = ProxyAddress::from_service(service, thread);
        proxy.set_channel(remote_channel(cookie));
        Ok(proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc_item() -> ServiceItem {
        ServiceItem::new("Calc", Version::new(2, 1, 7), ServiceType::Public)
    }

    #[test]
    fn test_service_item_layout() {
        let mut buf = BytesMut::new();
        calc_item().write_to(&mut buf);
        // 4 (len) + 4 ("Calc") + 12 (version) + 1 (type)
        assert_eq!(buf.len(), 21);
        assert_eq!(&buf[0..4], &4u32.to_le_bytes());
        assert_eq!(&buf[4..8], b"Calc");
        assert_eq!(buf[20], ServiceType::Public.as_u8());
    }

    #[test]
    fn test_proxy_address_keeps_magic_and_cookie() {
        let mut proxy = ProxyAddress::new(calc_item(), "CalcRole", "ui-thread");
        proxy.set_channel(Channel::new(Cookie(777), ThreadId(5), ThreadId(6)));

        let mut buf = BytesMut::new();
        proxy.write_to(&mut buf);
        let decoded = ProxyAddress::read_from(&mut buf.freeze()).unwrap();

        assert_eq!(decoded.magic_number(), proxy.magic_number());
        assert_eq!(decoded.cookie(), Cookie(777));
        assert_eq!(decoded, proxy);
        // thread ids are process-local
        assert_eq!(decoded.source(), ThreadId::UNKNOWN);
    }

    #[test]
    fn test_stub_address_keeps_thread_name() {
        let mut stub = StubAddress::new(calc_item(), "CalcRole", "worker");
        stub.set_channel(Channel::local(ThreadId(2)));

        let mut buf = BytesMut::new();
        stub.write_to(&mut buf);
        let decoded = StubAddress::read_from(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, stub);
        assert_eq!(decoded.thread_name(), "worker");
        assert_eq!(decoded.magic_number(), stub.magic_number());
    }

    #[test]
    fn test_truncated_stream() {
        let mut buf = BytesMut::new();
        calc_item().write_to(&mut buf);
        let mut short = buf.freeze().slice(0..10);
        let err = ServiceItem::read_from(&mut short).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn test_oversized_string_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_STRING_LEN + 1) as u32);
        let err = read_string(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, WireError::StringTooLong { .. }));
    }
}
