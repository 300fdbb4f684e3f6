//! Summaries of the traffic captured in audit mode.
//!
//! pasta writes a classic pcap of Ethernet frames. Only the fields needed for
//! a per-destination byte count are decoded; DNS answers seen on the wire
//! label destination addresses with the hostname that was asked for.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use crate::error::SandboxError;
use crate::network::dns::packet::parse_answers;

const PCAP_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;
const MAX_RECORD_LEN: usize = 65535;
const LINKTYPE_ETHERNET: u32 = 1;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const PROTO_UDP: u8 = 17;

/// Rows printed in the summary table.
pub const TOP_DESTINATIONS: usize = 20;

/// Traffic exchanged with one external address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    /// Packets sent to the address.
    pub packets: u64,
    pub sent: u64,
    pub received: u64,
}

impl Traffic {
    pub fn total(&self) -> u64 {
        self.sent + self.received
    }
}

/// Per-destination traffic of one capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSummary {
    pub destinations: BTreeMap<IpAddr, Traffic>,
    /// Names learned from DNS answers in the capture.
    pub hostnames: BTreeMap<IpAddr, String>,
}

/// One line of the summary table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub addr: IpAddr,
    pub traffic: Traffic,
    pub hostname: Option<String>,
}

#[derive(Clone, Copy)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u32(self, bytes: &[u8]) -> u32 {
        let b = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            Endian::Little => u32::from_le_bytes(b),
            Endian::Big => u32::from_be_bytes(b),
        }
    }
}

fn be16(bytes: &[u8], offset: usize) -> Option<u16> {
    let b = bytes.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

/// Whether an address is local to the host or the namespace.
pub fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            a == 10
                || (a == 172 && (16..=31).contains(&b))
                || (a == 192 && b == 168)
                || a == 127
                || (a == 169 && b == 254)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || first & 0xffc0 == 0xfe80
                || first & 0xfe00 == 0xfc00
                || first & 0xff00 == 0xff00
        }
    }
}

impl AuditSummary {
    /// Parse a capture file. A missing file is an error; an empty or foreign
    /// file yields an empty summary.
    pub fn from_file(path: &Path) -> Result<Self, SandboxError> {
        let data = std::fs::read(path)?;
        Ok(Self::from_pcap(&data))
    }

    /// Parse capture bytes. Decoding stops at the first truncated record.
    pub fn from_pcap(data: &[u8]) -> Self {
        let mut summary = Self::default();
        if data.len() < PCAP_HEADER_LEN {
            return summary;
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let endian = match magic {
            0xa1b2c3d4 | 0xa1b23c4d => Endian::Little,
            0xd4c3b2a1 | 0x4d3cb2a1 => Endian::Big,
            _ => return summary,
        };
        if endian.u32(&data[20..24]) != LINKTYPE_ETHERNET {
            tracing::debug!("pcap link type is not Ethernet, skipping capture");
            return summary;
        }

        let mut pos = PCAP_HEADER_LEN;
        while let Some(header) = data.get(pos..pos + RECORD_HEADER_LEN) {
            let len = endian.u32(&header[8..12]) as usize;
            if len > MAX_RECORD_LEN {
                break;
            }
            let Some(frame) = data.get(pos + RECORD_HEADER_LEN..pos + RECORD_HEADER_LEN + len)
            else {
                break;
            };
            summary.add_frame(frame);
            pos += RECORD_HEADER_LEN + len;
        }
        summary
    }

    fn add_frame(&mut self, frame: &[u8]) {
        let Some(ethertype) = be16(frame, 12) else {
            return;
        };
        let ip = &frame[14..];
        let parsed = match ethertype {
            ETHERTYPE_IPV4 => parse_ipv4(ip),
            ETHERTYPE_IPV6 => parse_ipv6(ip),
            _ => None,
        };
        let Some(packet) = parsed else {
            return;
        };

        if !is_private(packet.dst) {
            let entry = self.destinations.entry(packet.dst).or_default();
            entry.packets += 1;
            entry.sent += packet.len;
        }
        if !is_private(packet.src) {
            self.destinations.entry(packet.src).or_default().received += packet.len;
        }

        if let Some(udp) = packet.udp {
            if be16(udp, 0) == Some(53) {
                if let Some(answer) = udp.get(8..).and_then(parse_answers) {
                    for addr in answer.addrs {
                        self.hostnames.insert(addr, answer.name.clone());
                    }
                }
            }
        }
    }

    pub fn total_packets(&self) -> u64 {
        self.destinations.values().map(|t| t.packets).sum()
    }

    pub fn total_sent(&self) -> u64 {
        self.destinations.values().map(|t| t.sent).sum()
    }

    pub fn total_received(&self) -> u64 {
        self.destinations.values().map(|t| t.received).sum()
    }

    /// Destinations the sandbox sent packets to.
    pub fn contacted(&self) -> usize {
        self.destinations.values().filter(|t| t.packets > 0).count()
    }

    /// All rows, most traffic first, ties by address.
    pub fn rows(&self) -> Vec<AuditRow> {
        let mut rows: Vec<AuditRow> = self
            .destinations
            .iter()
            .map(|(addr, traffic)| AuditRow {
                addr: *addr,
                traffic: *traffic,
                hostname: self.hostnames.get(addr).cloned(),
            })
            .collect();
        rows.sort_by(|a, b| {
            b.traffic
                .total()
                .cmp(&a.traffic.total())
                .then_with(|| a.addr.cmp(&b.addr))
        });
        rows
    }

    /// Human readable report.
    pub fn render(&self, pcap_path: Option<&Path>) -> String {
        let rule = "=".repeat(60);
        let mut out = String::new();
        let _ = writeln!(out, "\n{}\nNETWORK AUDIT RESULTS\n{}", rule, rule);
        if let Some(path) = pcap_path {
            let _ = writeln!(out, "\nCapture file: {}", path.display());
            let _ = writeln!(out, "  (open in Wireshark for detailed analysis)");
        }

        if self.contacted() == 0 {
            let _ = writeln!(out, "\nNo outbound connections detected.\n{}", rule);
            return out;
        }

        let _ = writeln!(out, "\nTotal packets: {}", self.total_packets());
        let _ = writeln!(out, "Unique destinations: {}", self.contacted());
        let _ = writeln!(out, "Data sent: {}", format_bytes(self.total_sent()));
        let _ = writeln!(out, "Data received: {}", format_bytes(self.total_received()));

        let rows = self.rows();
        let _ = writeln!(out, "\nTraffic by destination:\n");
        let _ = writeln!(
            out,
            "  {:<40}  {:>10}  {:>10}  {:>6}  Hostname",
            "IP", "Sent", "Recv", "Pkts"
        );
        let _ = writeln!(out, "  {}", "-".repeat(90));
        for row in rows.iter().take(TOP_DESTINATIONS) {
            let _ = writeln!(
                out,
                "  {:<40}  {:>10}  {:>10}  {:>6}  {}",
                row.addr.to_string(),
                format_bytes(row.traffic.sent),
                format_bytes(row.traffic.received),
                row.traffic.packets,
                row.hostname.as_deref().unwrap_or("")
            );
        }
        if rows.len() > TOP_DESTINATIONS {
            let _ = writeln!(out, "\n  ... and {} more", rows.len() - TOP_DESTINATIONS);
        }
        let _ = writeln!(out, "{}", rule);
        out
    }
}

struct IpPacket<'a> {
    src: IpAddr,
    dst: IpAddr,
    len: u64,
    udp: Option<&'a [u8]>,
}

fn parse_ipv4(ip: &[u8]) -> Option<IpPacket<'_>> {
    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    let total = be16(ip, 2)? as u64;
    let src = IpAddr::V4(Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]));
    let udp = if ip[9] == PROTO_UDP { ip.get(ihl..) } else { None };
    Some(IpPacket {
        src,
        dst,
        len: total,
        udp,
    })
}

fn parse_ipv6(ip: &[u8]) -> Option<IpPacket<'_>> {
    if ip.len() < 40 || ip[0] >> 4 != 6 {
        return None;
    }
    let payload = be16(ip, 4)? as u64;
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&ip[8..24]);
    dst.copy_from_slice(&ip[24..40]);
    let udp = if ip[6] == PROTO_UDP { ip.get(40..) } else { None };
    Some(IpPacket {
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        len: payload + 40,
        udp,
    })
}

/// Format a byte count with binary units.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else if b < KB * KB * KB {
        format!("{:.1} MB", b / (KB * KB))
    } else {
        format!("{:.1} GB", b / (KB * KB * KB))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dns::packet::tests::answer_with_a;
    use crate::network::dns::packet::{encode_query, TYPE_A};

    fn pcap_header() -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
        h.extend_from_slice(&2u16.to_le_bytes());
        h.extend_from_slice(&4u16.to_le_bytes());
        h.extend_from_slice(&[0u8; 8]);
        h.extend_from_slice(&65535u32.to_le_bytes());
        h.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        h
    }

    fn ipv4_frame(src: [u8; 4], dst: [u8; 4], sport: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let total = (20 + 8 + payload.len()) as u16;
        let mut ip = vec![0x45, 0];
        ip.extend_from_slice(&total.to_be_bytes());
        ip.extend_from_slice(&[0, 0, 0, 0, 64, PROTO_UDP, 0, 0]);
        ip.extend_from_slice(&src);
        ip.extend_from_slice(&dst);
        ip.extend_from_slice(&sport.to_be_bytes());
        ip.extend_from_slice(&40000u16.to_be_bytes());
        ip.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        ip.extend_from_slice(&[0, 0]);
        ip.extend_from_slice(payload);
        frame.extend_from_slice(&ip);
        frame
    }

    fn record(frame: &[u8]) -> Vec<u8> {
        let mut r = vec![0u8; 8];
        r.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        r.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        r.extend_from_slice(frame);
        r
    }

    #[test]
    fn test_summary_groups_and_labels() {
        let dns = answer_with_a(&encode_query(1, "example.com", TYPE_A), [93, 184, 216, 34]);

        let mut data = pcap_header();
        data.extend(record(&ipv4_frame([8, 8, 8, 8], [10, 0, 2, 15], 53, &dns)));
        data.extend(record(&ipv4_frame([10, 0, 2, 15], [93, 184, 216, 34], 40000, &[0u8; 72])));
        data.extend(record(&ipv4_frame([10, 0, 2, 15], [93, 184, 216, 34], 40000, &[0u8; 72])));
        data.extend(record(&ipv4_frame([93, 184, 216, 34], [10, 0, 2, 15], 443, &[0u8; 1000])));
        data.extend(record(&ipv4_frame([10, 0, 2, 15], [192, 168, 1, 1], 40000, &[0u8; 10])));

        let summary = AuditSummary::from_pcap(&data);
        let target: IpAddr = "93.184.216.34".parse().unwrap();
        let t = summary.destinations[&target];
        assert_eq!(t.packets, 2);
        assert_eq!(t.sent, 200);
        assert_eq!(t.received, 1028);
        assert_eq!(summary.hostnames[&target], "example.com");
        assert!(!summary.destinations.contains_key(&"192.168.1.1".parse().unwrap()));

        let rows = summary.rows();
        assert_eq!(rows[0].addr, target);
        assert_eq!(rows[0].hostname.as_deref(), Some("example.com"));

        let report = summary.render(Some(Path::new("/tmp/audit.pcap")));
        assert!(report.contains("Capture file: /tmp/audit.pcap"));
        assert!(report.contains("example.com"));
        assert!(report.contains("Unique destinations: 1"));
    }

    #[test]
    fn test_empty_and_foreign_captures() {
        assert_eq!(AuditSummary::from_pcap(&[]), AuditSummary::default());
        assert_eq!(AuditSummary::from_pcap(&[0u8; 40]), AuditSummary::default());

        let summary = AuditSummary::from_pcap(&pcap_header());
        assert!(summary.render(None).contains("No outbound connections detected."));
    }

    #[test]
    fn test_truncated_record_stops_parsing() {
        let mut data = pcap_header();
        data.extend(record(&ipv4_frame([10, 0, 2, 15], [1, 1, 1, 1], 40000, &[])));
        let mut partial = record(&ipv4_frame([10, 0, 2, 15], [9, 9, 9, 9], 40000, &[]));
        partial.truncate(partial.len() - 5);
        data.extend(partial);

        let summary = AuditSummary::from_pcap(&data);
        assert_eq!(summary.contacted(), 1);
    }

    #[test]
    fn test_top_destinations_limited() {
        let mut data = pcap_header();
        for i in 0..25u8 {
            data.extend(record(&ipv4_frame([10, 0, 2, 15], [1, 1, 1, i], 40000, &[])));
        }
        let summary = AuditSummary::from_pcap(&data);
        assert_eq!(summary.rows().len(), 25);
        assert!(summary.render(None).contains("... and 5 more"));
    }

    #[test]
    fn test_private_ranges() {
        for ip in ["10.1.2.3", "172.16.0.1", "172.31.255.1", "192.168.0.1", "127.0.0.1", "169.254.1.1", "::1", "fe80::1", "fd00::1", "ff02::1"] {
            assert!(is_private(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["172.32.0.1", "8.8.8.8", "2606:4700::1111"] {
            assert!(!is_private(ip.parse().unwrap()), "{ip}");
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
