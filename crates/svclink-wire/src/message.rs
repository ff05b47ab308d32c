//! Router message types.
//!
//! Messages exchanged between a process and the router: service
//! (un)registrations and service events relayed to remote endpoints. Each
//! message is a tag byte followed by its body in the stream layout of
//! [`crate::stream`].

use crate::stream::{ensure, read_u32, read_u64, read_u8, ReadStream, WireError, WriteStream};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use svclink_types::event::{
    NotifyRequestEvent, ProxyConnectionEvent, RequestEvent, ResponseEvent, StubConnectionEvent,
};
use svclink_types::{
    ConnectionState, DisconnectReason, MessageId, NotifyRequest, ProxyAddress, ResultType,
    SequenceNumber, ServiceEvent, StubAddress,
};
use tracing::debug;

const TAG_REGISTER_STUB: u8 = 0x01;
const TAG_UNREGISTER_STUB: u8 = 0x02;
const TAG_REGISTER_PROXY: u8 = 0x03;
const TAG_UNREGISTER_PROXY: u8 = 0x04;
const TAG_PROXY_CONNECTION: u8 = 0x10;
const TAG_STUB_CONNECTION: u8 = 0x11;
const TAG_REQUEST: u8 = 0x12;
const TAG_NOTIFY_REQUEST: u8 = 0x13;
const TAG_RESPONSE: u8 = 0x14;

/// A message to or from the router.
#[derive(Debug, Clone)]
pub enum RouterMessage {
    /// A provider became available.
    RegisterStub(StubAddress),
    /// A provider went away.
    UnregisterStub {
        stub: StubAddress,
        reason: DisconnectReason,
    },
    /// A consumer is looking for a provider.
    RegisterProxy(ProxyAddress),
    /// A consumer went away.
    UnregisterProxy {
        proxy: ProxyAddress,
        reason: DisconnectReason,
    },
    /// A service event addressed to a remote endpoint.
    Event(ServiceEvent),
}

fn state_to_u8(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Unknown => 0,
        ConnectionState::Pending => 1,
        ConnectionState::Connected => 2,
    }
}

fn state_from_u8(value: u8) -> Result<ConnectionState, WireError> {
    match value {
        0 => Ok(ConnectionState::Unknown),
        1 => Ok(ConnectionState::Pending),
        2 => Ok(ConnectionState::Connected),
        _ => Err(WireError::InvalidField {
            field: "state",
            value,
        }),
    }
}

fn write_payload(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

fn read_payload<B: Buf>(buf: &mut B) -> Result<Vec<u8>, WireError> {
    ensure(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len).to_vec())
}

fn write_event(buf: &mut BytesMut, event: &ServiceEvent) {
    match event {
        ServiceEvent::ProxyConnection(e) => {
            buf.put_u8(TAG_PROXY_CONNECTION);
            e.proxy.write_to(buf);
            e.stub.write_to(buf);
            buf.put_u8(state_to_u8(e.state));
            buf.put_u8(e.reason.as_u8());
        }
        ServiceEvent::StubConnection(e) => {
            buf.put_u8(TAG_STUB_CONNECTION);
            e.stub.write_to(buf);
            e.proxy.write_to(buf);
            buf.put_u8(state_to_u8(e.state));
            buf.put_u8(e.reason.as_u8());
        }
        ServiceEvent::Request(e) => {
            buf.put_u8(TAG_REQUEST);
            e.proxy.write_to(buf);
            e.stub.write_to(buf);
            buf.put_u32_le(e.message_id.0);
            buf.put_u64_le(e.sequence_nr.0);
            write_payload(buf, &e.payload);
        }
        ServiceEvent::NotifyRequest(e) => {
            buf.put_u8(TAG_NOTIFY_REQUEST);
            e.proxy.write_to(buf);
            e.stub.write_to(buf);
            buf.put_u32_le(e.message_id.0);
            buf.put_u8(e.request.as_u8());
        }
        ServiceEvent::Response(e) => {
            buf.put_u8(TAG_RESPONSE);
            e.proxy.write_to(buf);
            buf.put_u32_le(e.message_id.0);
            buf.put_u64_le(e.sequence_nr.0);
            buf.put_u8(e.result.as_u8());
            write_payload(buf, &e.payload);
        }
    }
}

fn read_event<B: Buf>(tag: u8, buf: &mut B) -> Result<ServiceEvent, WireError> {
    let event = match tag {
        TAG_PROXY_CONNECTION => ServiceEvent::ProxyConnection(ProxyConnectionEvent {
            proxy: ProxyAddress::read_from(buf)?,
            stub: StubAddress::read_from(buf)?,
            state: state_from_u8(read_u8(buf)?)?,
            reason: DisconnectReason::from_u8(read_u8(buf)?),
        }),
        TAG_STUB_CONNECTION => ServiceEvent::StubConnection(StubConnectionEvent {
            stub: StubAddress::read_from(buf)?,
            proxy: ProxyAddress::read_from(buf)?,
            state: state_from_u8(read_u8(buf)?)?,
            reason: DisconnectReason::from_u8(read_u8(buf)?),
        }),
        TAG_REQUEST => ServiceEvent::Request(RequestEvent {
            proxy: ProxyAddress::read_from(buf)?,
            stub: StubAddress::read_from(buf)?,
            message_id: MessageId(read_u32(buf)?),
            sequence_nr: SequenceNumber(read_u64(buf)?),
            payload: read_payload(buf)?,
        }),
        TAG_NOTIFY_REQUEST => {
            let proxy = ProxyAddress::read_from(buf)?;
            let stub = StubAddress::read_from(buf)?;
            let message_id = MessageId(read_u32(buf)?);
            let raw = read_u8(buf)?;
            let request = NotifyRequest::from_u8(raw).ok_or(WireError::InvalidField {
                field: "notify_request",
                value: raw,
            })?;
            ServiceEvent::NotifyRequest(NotifyRequestEvent {
                proxy,
                stub,
                message_id,
                request,
            })
        }
        TAG_RESPONSE => ServiceEvent::Response(ResponseEvent {
            proxy: ProxyAddress::read_from(buf)?,
            message_id: MessageId(read_u32(buf)?),
            sequence_nr: SequenceNumber(read_u64(buf)?),
            result: ResultType::from_u8(read_u8(buf)?),
            payload: read_payload(buf)?,
        }),
        other => return Err(WireError::UnknownTag(other)),
    };
    Ok(event)
}

/// Encode a router message into a byte buffer.
pub fn encode_message(msg: &RouterMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    match msg {
        RouterMessage::RegisterStub(stub) => {
            buf.put_u8(TAG_REGISTER_STUB);
            stub.write_to(&mut buf);
        }
        RouterMessage::UnregisterStub { stub, reason } => {
            buf.put_u8(TAG_UNREGISTER_STUB);
            stub.write_to(&mut buf);
            buf.put_u8(reason.as_u8());
        }
        RouterMessage::RegisterProxy(proxy) => {
            buf.put_u8(TAG_REGISTER_PROXY);
            proxy.write_to(&mut buf);
        }
        RouterMessage::UnregisterProxy { proxy, reason } => {
            buf.put_u8(TAG_UNREGISTER_PROXY);
            proxy.write_to(&mut buf);
            buf.put_u8(reason.as_u8());
        }
        RouterMessage::Event(event) => write_event(&mut buf, event),
    }
    buf.freeze()
}

/// Decode a router message from a byte buffer.
pub fn decode_message(mut body: Bytes) -> Result<RouterMessage, WireError> {
    let tag = read_u8(&mut body)?;
    let msg = match tag {
        TAG_REGISTER_STUB => RouterMessage::RegisterStub(StubAddress::read_from(&mut body)?),
        TAG_UNREGISTER_STUB => RouterMessage::UnregisterStub {
            stub: StubAddress::read_from(&mut body)?,
            reason: DisconnectReason::from_u8(read_u8(&mut body)?),
        },
        TAG_REGISTER_PROXY => RouterMessage::RegisterProxy(ProxyAddress::read_from(&mut body)?),
        TAG_UNREGISTER_PROXY => RouterMessage::UnregisterProxy {
            proxy: ProxyAddress::read_from(&mut body)?,
            reason: DisconnectReason::from_u8(read_u8(&mut body)?),
        },
        other => RouterMessage::Event(read_event(other, &mut body)?),
    };
    if body.has_remaining() {
        debug!(
            tag,
            trailing = body.remaining(),
            "Router message has trailing bytes"
        );
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use svclink_types::{Channel, Cookie, ServiceItem, ServiceType, ThreadId, Version};

    fn addresses() -> (StubAddress, ProxyAddress) {
        let item = ServiceItem::new("Calc", Version::new(1, 0, 0), ServiceType::Public);
        let mut stub = StubAddress::new(item.clone(), "CalcRole", "worker");
        stub.set_channel(Channel::new(Cookie(300), ThreadId(1), ThreadId::UNKNOWN));
        let mut proxy = ProxyAddress::new(item, "CalcRole", "ui");
        proxy.set_channel(Channel::new(Cookie(301), ThreadId(2), ThreadId(1)));
        (stub, proxy)
    }

    #[test]
    fn test_register_stub_message() {
        let (stub, _) = addresses();
        let bytes = encode_message(&RouterMessage::RegisterStub(stub.clone()));
        assert_eq!(bytes[0], TAG_REGISTER_STUB);
        match decode_message(bytes).unwrap() {
            RouterMessage::RegisterStub(decoded) => {
                assert_eq!(decoded, stub);
                assert_eq!(decoded.cookie(), Cookie(300));
            }
            other => panic!("Expected RegisterStub, got {other:?}"),
        }
    }

    #[test]
    fn test_unregister_proxy_keeps_reason() {
        let (_, proxy) = addresses();
        let bytes = encode_message(&RouterMessage::UnregisterProxy {
            proxy,
            reason: DisconnectReason::ConsumerDisconnected,
        });
        match decode_message(bytes).unwrap() {
            RouterMessage::UnregisterProxy { reason, .. } => {
                assert_eq!(reason, DisconnectReason::ConsumerDisconnected);
            }
            other => panic!("Expected UnregisterProxy, got {other:?}"),
        }
    }

    #[test]
    fn test_relayed_response_event() {
        let (_, proxy) = addresses();
        let event = ServiceEvent::Response(
            ResponseEvent::new(
                proxy.clone(),
                MessageId(0x8002),
                SequenceNumber(17),
                ResultType::Ok,
            )
            .with_payload(vec![9, 8, 7]),
        );
        let bytes = encode_message(&RouterMessage::Event(event));
        match decode_message(bytes).unwrap() {
            RouterMessage::Event(ServiceEvent::Response(e)) => {
                assert_eq!(e.proxy, proxy);
                assert_eq!(e.message_id, MessageId(0x8002));
                assert_eq!(e.sequence_nr, SequenceNumber(17));
                assert_eq!(e.payload, vec![9, 8, 7]);
            }
            other => panic!("Expected Response, got {other:?}"),
        }
    }

    #[test]
    fn test_relayed_connection_event() {
        let (stub, proxy) = addresses();
        let event = ServiceEvent::ProxyConnection(ProxyConnectionEvent {
            proxy,
            stub,
            state: ConnectionState::Connected,
            reason: DisconnectReason::Undefined,
        });
        match decode_message(encode_message(&RouterMessage::Event(event))).unwrap() {
            RouterMessage::Event(ServiceEvent::ProxyConnection(e)) => {
                assert_eq!(e.state, ConnectionState::Connected);
            }
            other => panic!("Expected ProxyConnection, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tag() {
        let err = decode_message(Bytes::from_static(&[0xEE])).unwrap_err();
        assert!(matches!(err, WireError::UnknownTag(0xEE)));
    }

    #[test]
    fn test_invalid_notify_request() {
        let (stub, proxy) = addresses();
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_NOTIFY_REQUEST);
        proxy.write_to(&mut buf);
        stub.write_to(&mut buf);
        buf.put_u32_le(1);
        buf.put_u8(9);
        let err = decode_message(buf.freeze()).unwrap_err();
        assert!(matches!(
            err,
            WireError::InvalidField {
                field: "notify_request",
                value: 9
            }
        ));
    }
}
