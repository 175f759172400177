//! Minimal STUN binding client (RFC 5389), enough to learn the public
//! mapping of a socket for a server-reflexive candidate.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;

pub fn binding_request(txn: &[u8; 12]) -> [u8; HEADER_LEN] {
    let mut msg = [0u8; HEADER_LEN];
    msg[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Zero-length body.
    msg[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg[8..20].copy_from_slice(txn);
    msg
}

/// Mapped address from a binding success response for transaction `txn`.
pub fn parse_binding_response(data: &[u8], txn: &[u8; 12]) -> Option<SocketAddr> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let kind = u16::from_be_bytes([data[0], data[1]]);
    let len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if kind != BINDING_SUCCESS || cookie != MAGIC_COOKIE || &data[8..20] != txn {
        return None;
    }
    let body = data.get(HEADER_LEN..HEADER_LEN + len)?;

    let mut mapped = None;
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value = body.get(offset + 4..offset + 4 + attr_len)?;
        match attr {
            ATTR_XOR_MAPPED_ADDRESS => return decode_address(value, Some(txn)),
            ATTR_MAPPED_ADDRESS => mapped = decode_address(value, None),
            _ => {}
        }
        offset += 4 + ((attr_len + 3) & !3);
    }
    mapped
}

fn decode_address(value: &[u8], xor_txn: Option<&[u8; 12]>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let cookie = MAGIC_COOKIE.to_be_bytes();
    if xor_txn.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 => {
            let mut octets: [u8; 4] = value.get(4..8)?.try_into().ok()?;
            if xor_txn.is_some() {
                for (b, k) in octets.iter_mut().zip(cookie.iter()) {
                    *b ^= k;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            let mut octets: [u8; 16] = value.get(4..20)?.try_into().ok()?;
            if let Some(txn) = xor_txn {
                let key = cookie.iter().chain(txn.iter());
                for (b, k) in octets.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Ask `server` (host:port) for the public mapping of `socket`. `Ok(None)`
/// when the server does not answer in time.
pub async fn query(
    socket: &UdpSocket,
    server: &str,
    timeout: Duration,
) -> io::Result<Option<SocketAddr>> {
    let local = socket.local_addr()?;
    let target = tokio::net::lookup_host(server)
        .await?
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no usable address for {server}"))
        })?;

    let txn: [u8; 12] = rand::random();
    socket.send_to(&binding_request(&txn), target).await?;

    let mut buf = [0u8; 512];
    let exchange = async {
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if from != target {
                continue;
            }
            if let Some(mapped) = parse_binding_response(&buf[..n], &txn) {
                return Ok::<_, io::Error>(mapped);
            }
        }
    };
    match tokio::time::timeout(timeout, exchange).await {
        Ok(res) => res.map(Some),
        Err(_) => {
            debug!("STUN server {} did not answer within {:?}", server, timeout);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_response(txn: &[u8; 12], attr: u16, value: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        msg.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(txn);
        msg.extend_from_slice(&attr.to_be_bytes());
        msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
        msg.extend_from_slice(value);
        msg
    }

    #[test]
    fn test_request_header_layout() {
        let txn = [7u8; 12];
        let req = binding_request(&txn);
        assert_eq!(&req[0..4], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&req[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&req[8..], &txn);
    }

    #[test]
    fn test_decodes_xor_mapped_ipv4() {
        let txn = [1u8; 12];
        // 203.0.113.5:40000 xored with the cookie.
        let port = 40000u16 ^ 0x2112;
        let ip: [u8; 4] = [203 ^ 0x21, 0x12, 113 ^ 0xA4, 5 ^ 0x42];
        let mut value = vec![0x00, 0x01];
        value.extend_from_slice(&port.to_be_bytes());
        value.extend_from_slice(&ip);

        let resp = success_response(&txn, ATTR_XOR_MAPPED_ADDRESS, &value);
        assert_eq!(
            parse_binding_response(&resp, &txn),
            Some("203.0.113.5:40000".parse().unwrap())
        );
    }

    #[test]
    fn test_falls_back_to_plain_mapped_address() {
        let txn = [2u8; 12];
        let value: [u8; 8] = [0x00, 0x01, 0x1f, 0x90, 198, 51, 100, 7];
        let resp = success_response(&txn, ATTR_MAPPED_ADDRESS, &value);
        assert_eq!(
            parse_binding_response(&resp, &txn),
            Some("198.51.100.7:8080".parse().unwrap())
        );
    }

    #[test]
    fn test_rejects_foreign_transaction() {
        let value: [u8; 8] = [0x00, 0x01, 0x1f, 0x90, 198, 51, 100, 7];
        let resp = success_response(&[2u8; 12], ATTR_MAPPED_ADDRESS, &value);
        assert_eq!(parse_binding_response(&resp, &[3u8; 12]), None);
        assert_eq!(parse_binding_response(&resp[..10], &[2u8; 12]), None);
    }

    #[tokio::test]
    async fn test_query_against_local_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, HEADER_LEN);
            let txn: [u8; 12] = buf[8..20].try_into().unwrap();
            let value: [u8; 8] = [
                0x00,
                0x01,
                (from.port() >> 8) as u8,
                from.port() as u8,
                127,
                0,
                0,
                1,
            ];
            let resp = success_response(&txn, ATTR_MAPPED_ADDRESS, &value);
            server.send_to(&resp, from).await.unwrap();
        });

        let mapped = query(&client, &server_addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(mapped, Some(client_addr));
    }
}
