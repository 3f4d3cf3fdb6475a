//! Standalone runner: wires the gateway to the in-process loopback driver,
//! plays a short client exchange through it, and prints what came out. Real
//! deployments supply a kernel-bypass `PortDriver` instead.

use gateway_engine::port::{LoopbackPort, QUEUE_DATA};
use gateway_engine::wire::{self, ETHERTYPE_IPV4, ETHER_HDR_LEN, IPV4_HDR_LEN};
use gateway_engine::{logger, Gateway, GatewayConfig};
use std::env;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

const SWITCH_MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const VIP: Ipv4Addr = Ipv4Addr::new(172, 17, 17, 2);

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    logger::set_min_level(&settings.log_level);

    let port_count = (32 - settings.port_mask.leading_zeros()) as u16;
    let driver = Arc::new(LoopbackPort::new(port_count));

    let mut config = GatewayConfig::new(settings.self_ip, settings.peer_ip, settings.backends);
    config.port_mask = settings.port_mask;
    let gateway = Gateway::new(config, Arc::clone(&driver))?;
    gateway.start()?;

    eprintln!("[standalone] injecting arp keepalive + syn/ack exchange on port 0");
    driver.inject(0, QUEUE_DATA, arp_request(settings.self_ip));
    driver.inject(0, QUEUE_DATA, tcp_frame(40001, 0x02));
    driver.inject(0, QUEUE_DATA, tcp_frame(40001, 0x10));

    std::thread::sleep(Duration::from_millis(100));
    gateway.stop();

    for port in 0..port_count {
        for frame in driver.drain_tx(port, QUEUE_DATA) {
            describe(port, &frame);
        }
    }
    eprintln!("[standalone] counters: {:#?}", gateway.ctx().counters.snapshot());
    Ok(())
}

fn describe(port: u16, frame: &[u8]) {
    if wire::ether_type(frame) == wire::ETHERTYPE_ARP {
        eprintln!("[standalone] port {port}: arp reply ({} bytes)", frame.len());
        return;
    }
    match wire::ipv4_meta(frame) {
        Ok(meta) => eprintln!(
            "[standalone] port {port}: ipv4 {} -> {} proto {} ({} bytes)",
            meta.src,
            meta.dst,
            meta.proto,
            frame.len()
        ),
        Err(err) => eprintln!("[standalone] port {port}: unparseable frame: {err}"),
    }
}

fn arp_request(target_ip: Ipv4Addr) -> Vec<u8> {
    let mut frame = vec![0u8; ETHER_HDR_LEN + 28];
    frame[0..6].copy_from_slice(&[0xFF; 6]);
    frame[6..12].copy_from_slice(&SWITCH_MAC);
    frame[12..14].copy_from_slice(&wire::ETHERTYPE_ARP.to_be_bytes());
    let arp = &mut frame[ETHER_HDR_LEN..];
    arp[0..2].copy_from_slice(&1u16.to_be_bytes());
    arp[2..4].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&1u16.to_be_bytes());
    arp[8..14].copy_from_slice(&SWITCH_MAC);
    arp[14..18].copy_from_slice(&Ipv4Addr::new(172, 16, 0, 254).octets());
    arp[24..28].copy_from_slice(&target_ip.octets());
    frame
}

fn tcp_frame(src_port: u16, flags: u8) -> Vec<u8> {
    let total_len = IPV4_HDR_LEN + 20;
    let mut frame = vec![0u8; ETHER_HDR_LEN + total_len];
    frame[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame[6..12].copy_from_slice(&SWITCH_MAC);
    frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let ip = &mut frame[ETHER_HDR_LEN..];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = 6;
    ip[12..16].copy_from_slice(&CLIENT.octets());
    ip[16..20].copy_from_slice(&VIP.octets());
    let tcp = &mut ip[IPV4_HDR_LEN..];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    let cksum = wire::checksum::ipv4_header(&ip[..IPV4_HDR_LEN]);
    frame[ETHER_HDR_LEN + 10..ETHER_HDR_LEN + 12].copy_from_slice(&cksum.to_be_bytes());
    frame
}

struct Settings {
    port_mask: u32,
    self_ip: Ipv4Addr,
    peer_ip: Ipv4Addr,
    backends: Vec<Ipv4Addr>,
    log_level: String,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut port_mask = 0x1u32;
        let mut self_ip = Ipv4Addr::new(172, 16, 0, 1);
        let mut peer_ip = Ipv4Addr::new(172, 16, 0, 2);
        let mut backends = Vec::new();
        let mut log_level = "info".to_string();

        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--ports" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--ports requires a bitmask"))?;
                    port_mask = parse_mask(&value)?;
                }
                "--self-ip" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--self-ip requires a value"))?;
                    self_ip = value.parse().map_err(|_| anyhow::anyhow!("invalid self ip"))?;
                }
                "--peer-ip" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--peer-ip requires a value"))?;
                    peer_ip = value.parse().map_err(|_| anyhow::anyhow!("invalid peer ip"))?;
                }
                "--backend" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--backend requires a value"))?;
                    backends.push(value.parse().map_err(|_| anyhow::anyhow!("invalid backend ip"))?);
                }
                "--log-level" => {
                    log_level = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--log-level requires a value"))?;
                }
                "--help" | "-h" => {
                    eprintln!(
                        "usage: standalone [--ports MASK] [--self-ip IP] [--peer-ip IP] \
                         [--backend IP]... [--log-level LEVEL]"
                    );
                    std::process::exit(0);
                }
                other => anyhow::bail!("unknown flag {other}"),
            }
        }

        if backends.is_empty() {
            backends.push(Ipv4Addr::new(10, 1, 0, 1));
            backends.push(Ipv4Addr::new(10, 1, 0, 2));
        }
        Ok(Self {
            port_mask,
            self_ip,
            peer_ip,
            backends,
            log_level,
        })
    }
}

fn parse_mask(value: &str) -> anyhow::Result<u32> {
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.map_err(|_| anyhow::anyhow!("invalid port mask {value}"))
}
