//! End-to-end tunnel tests against an in-process DNS server.
//!
//! The fake server speaks just enough DNS to play the far end: uplink A
//! queries have their base32 labels decoded and collected, polling queries
//! are answered from a scripted downlink queue using the record type under
//! test.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use data_encoding::BASE32_NOPAD;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;

use sdtun::{
    config::SessionConfig, session, DnsCodec, RecordType, ResolverDriver, QueryStrategy,
};

const QTYPE_A: u16 = 1;

struct FakeServer {
    addr: SocketAddr,
    /// Decoded uplink payload, in arrival order
    uplink: Arc<Mutex<Vec<u8>>>,
    /// Scripted downlink payloads, one per successful poll
    downlink: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

/// Extract id, labels and qtype from a query packet.
fn parse_query(packet: &[u8]) -> Option<(u16, Vec<String>, u16)> {
    if packet.len() < 12 {
        return None;
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);

    let mut labels = Vec::new();
    let mut pos = 12;
    loop {
        let len = *packet.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        labels.push(String::from_utf8_lossy(packet.get(pos..pos + len)?).into_owned());
        pos += len;
    }
    let qtype = u16::from_be_bytes([*packet.get(pos)?, *packet.get(pos + 1)?]);
    Some((id, labels, qtype))
}

fn response_header(id: u16, ancount: u16) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x81, 0x80]);
    packet.extend_from_slice(&[0x00, 0x00]); // QDCOUNT: question not echoed
    packet.extend_from_slice(&ancount.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    packet
}

fn push_answer(packet: &mut Vec<u8>, rtype: u16, rdata: &[u8]) {
    packet.push(0); // root name
    packet.extend_from_slice(&rtype.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01]); // IN
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x3c]);
    packet.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    packet.extend_from_slice(rdata);
}

/// Downlink payload as RDATA for the record type under test.
fn encode_rdata(record_type: RecordType, payload: &[u8], domain: &str) -> Vec<u8> {
    match record_type {
        RecordType::Txt => {
            let mut rdata = Vec::new();
            for chunk in payload.chunks(255) {
                rdata.push(chunk.len() as u8);
                rdata.extend_from_slice(chunk);
            }
            rdata
        }
        RecordType::Null => payload.to_vec(),
        RecordType::Cname => {
            let encoded = BASE32_NOPAD.encode(payload).to_ascii_lowercase();
            let mut rdata = Vec::new();
            for chunk in encoded.as_bytes().chunks(63) {
                rdata.push(chunk.len() as u8);
                rdata.extend_from_slice(chunk);
            }
            for label in domain.split('.') {
                rdata.push(label.len() as u8);
                rdata.extend_from_slice(label.as_bytes());
            }
            rdata.push(0);
            rdata
        }
    }
}

async fn spawn_fake_server(record_type: RecordType, domain: &'static str) -> FakeServer {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let uplink = Arc::new(Mutex::new(Vec::new()));
    let downlink: Arc<Mutex<VecDeque<Vec<u8>>>> = Arc::new(Mutex::new(VecDeque::new()));

    let uplink_srv = uplink.clone();
    let downlink_srv = downlink.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Some((id, labels, qtype)) = parse_query(&buf[..n]) else {
                continue;
            };

            let reply = if qtype == QTYPE_A {
                // Uplink delivery: data labels run until the control label,
                // which sits just in front of the domain suffix.
                let domain_labels = domain.split('.').count();
                let data_end = labels.len().saturating_sub(domain_labels + 1);
                let encoded: String = labels[..data_end].concat().to_ascii_uppercase();
                if let Ok(payload) = BASE32_NOPAD.decode(encoded.as_bytes()) {
                    uplink_srv.lock().unwrap().extend_from_slice(&payload);
                }
                response_header(id, 0)
            } else {
                match downlink_srv.lock().unwrap().pop_front() {
                    Some(payload) => {
                        let mut packet = response_header(id, 1);
                        push_answer(
                            &mut packet,
                            qtype,
                            &encode_rdata(record_type, &payload, domain),
                        );
                        packet
                    }
                    None => response_header(id, 0),
                }
            };

            let _ = socket.send_to(&reply, peer).await;
        }
    });

    FakeServer {
        addr,
        uplink,
        downlink,
    }
}

fn test_config(record_type: RecordType, domain: &str) -> SessionConfig {
    SessionConfig {
        domains: vec![domain.to_string()],
        record_type,
        sleep_us: 5_000,
        delay_us: 20_000,
        maxpollfail: 0,
        session_id: rand_session_id(),
        ..Default::default()
    }
}

fn rand_session_id() -> u16 {
    // Derive from the process id; tests must not depend on rand directly
    std::process::id() as u16 | 1
}

fn build_codec(config: &SessionConfig, server: SocketAddr) -> Arc<DnsCodec> {
    let resolver = Arc::new(ResolverDriver::new(vec![server], QueryStrategy::Rotate).unwrap());
    resolver.set_retransmit_timeout(2);
    Arc::new(DnsCodec::new(config, resolver).unwrap())
}

async fn round_trip_with(record_type: RecordType) {
    let domain = "tun.example.com";
    let server = spawn_fake_server(record_type, domain).await;
    let config = test_config(record_type, domain);
    let codec = build_codec(&config, server.addr);

    let (mut local_in, tunnel_reader) = tokio::io::duplex(1024);
    let (tunnel_writer, mut local_out) = tokio::io::duplex(1024);

    let expected_down = b"greetings from the far end";
    server
        .downlink
        .lock()
        .unwrap()
        .push_back(expected_down.to_vec());

    let handle = tokio::spawn(session::run(config, codec, tunnel_reader, tunnel_writer));

    // Uplink: a few interactive writes, then bulk
    let sent = b"uplink: interactive keys then a larger write of tunnel data";
    for piece in sent.chunks(7) {
        local_in.write_all(piece).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Downlink payload must reach the local output stream intact
    let mut received = vec![0u8; expected_down.len()];
    tokio::time::timeout(Duration::from_secs(10), local_out.read_exact(&mut received))
        .await
        .expect("downlink payload must arrive")
        .unwrap();
    assert_eq!(&received, expected_down);

    // EOF on the local input ends the whole session
    drop(local_in);
    tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("session must end after local EOF")
        .unwrap()
        .unwrap();

    assert_eq!(server.uplink.lock().unwrap().as_slice(), sent);
}

#[tokio::test]
async fn round_trip_txt() {
    round_trip_with(RecordType::Txt).await;
}

#[tokio::test]
async fn round_trip_cname() {
    round_trip_with(RecordType::Cname).await;
}

#[tokio::test]
async fn round_trip_null() {
    round_trip_with(RecordType::Null).await;
}

#[tokio::test]
async fn poll_limit_ends_an_idle_session() {
    let domain = "tun.example.com";
    let server = spawn_fake_server(RecordType::Txt, domain).await;
    let mut config = test_config(RecordType::Txt, domain);
    config.maxpollfail = 2;
    let codec = build_codec(&config, server.addr);

    // Local input stays open: only the downlink poll limit can end this.
    let (_local_in, tunnel_reader) = tokio::io::duplex(64);
    let (tunnel_writer, _local_out) = tokio::io::duplex(64);

    let result = tokio::time::timeout(
        Duration::from_secs(15),
        session::run(config, codec, tunnel_reader, tunnel_writer),
    )
    .await
    .expect("session must end at the poll limit");
    assert!(result.is_ok());
    assert!(server.uplink.lock().unwrap().is_empty());
}
