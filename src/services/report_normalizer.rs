//! Active-scan report normalizer.
//!
//! Reads an nmap-style XML report and produces one [`ScanHost`] per `host`
//! element. Reading is streaming and tolerant: numeric attributes that do not
//! parse become `None`, and a report that breaks off after at least one
//! complete host still yields the hosts read so far.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

use crate::{
    error::ParseFailure,
    models::{HostTimes, Port, ScanHost, TraceHop},
};

/// Parse one raw report into its host entries.
pub fn normalize(raw_report: &[u8]) -> Result<Vec<ScanHost>, ParseFailure> {
    let mut reader = Reader::from_reader(raw_report);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut state = ReportState::default();

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(e) => {
                let position = reader.buffer_position();
                if state.hosts.is_empty() {
                    return Err(ParseFailure::at(e.to_string(), position));
                }
                tracing::warn!(
                    position,
                    error = %e,
                    hosts = state.hosts.len(),
                    "scan report is malformed, keeping hosts read so far"
                );
                break;
            }
        };

        match event {
            Event::Start(ref e) => {
                state.seen_element = true;
                state.open(e);
            }
            Event::Empty(ref e) => {
                state.seen_element = true;
                state.open(e);
                state.close(e.name().as_ref());
            }
            Event::End(ref e) => state.close(e.name().as_ref()),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !state.seen_element {
        return Err(ParseFailure::new("report contains no XML elements"));
    }

    tracing::debug!(hosts = state.hosts.len(), "normalized scan report");
    Ok(state.hosts)
}

#[derive(Default)]
struct ReportState {
    seen_element: bool,
    hosts: Vec<ScanHost>,
    host: Option<HostBuilder>,
    port: Option<PortBuilder>,
    in_os: bool,
    in_trace: bool,
}

#[derive(Default)]
struct HostBuilder {
    host: ScanHost,
    os_matches: Vec<(String, Option<u32>)>,
}

struct PortBuilder {
    protocol: String,
    port_id: Option<u16>,
    port: Port,
}

impl ReportState {
    fn open(&mut self, e: &BytesStart) {
        let name = e.name();
        let tag = name.as_ref();

        if tag == b"host" {
            self.host = Some(HostBuilder::default());
            self.port = None;
            self.in_os = false;
            self.in_trace = false;
            return;
        }

        // everything else only matters inside a host entry
        let Some(builder) = self.host.as_mut() else {
            return;
        };
        let attrs = attributes(e);
        let host = &mut builder.host;

        match tag {
            b"address" => {
                let addr_type = attrs.get("addrtype").map(|t| t.to_ascii_lowercase());
                let is_ip = matches!(addr_type.as_deref(), None | Some("ipv4") | Some("ipv6"));
                if is_ip && host.address.is_none() {
                    if let Some(addr) = attrs.get("addr").filter(|a| !a.is_empty()) {
                        host.address = Some(addr.clone());
                        host.address_type = addr_type;
                    }
                }
            }
            b"hostname" => {
                if let Some(name) = attrs.get("name").map(|n| n.trim().to_ascii_lowercase()) {
                    if !name.is_empty() && !host.hostnames.contains(&name) {
                        host.hostnames.push(name);
                    }
                }
            }
            b"port" => {
                let protocol = attrs
                    .get("protocol")
                    .map(|p| p.to_ascii_lowercase())
                    .unwrap_or_else(|| "tcp".to_string());
                let port_id = attrs.get("portid").and_then(|p| p.trim().parse::<u16>().ok());
                self.port = Some(PortBuilder {
                    port: Port::new(&protocol, port_id.unwrap_or(0)),
                    protocol,
                    port_id,
                });
            }
            b"state" => {
                if let Some(builder) = self.port.as_mut() {
                    builder.port.state = attrs.get("state").cloned();
                    builder.port.reason = attrs.get("reason").cloned();
                    builder.port.reason_ttl = parse_num(attrs.get("reason_ttl"));
                }
            }
            b"service" => {
                if let Some(builder) = self.port.as_mut() {
                    builder.port.service = attrs.get("name").cloned();
                    builder.port.product = attrs.get("product").cloned();
                    builder.port.extra_info = attrs.get("extrainfo").cloned();
                    builder.port.method = attrs.get("method").cloned();
                    builder.port.confidence = parse_num(attrs.get("conf"));
                }
            }
            b"os" => self.in_os = true,
            b"osmatch" => {
                if self.in_os {
                    if let Some(name) = attrs.get("name").filter(|n| !n.trim().is_empty()) {
                        builder
                            .os_matches
                            .push((name.trim().to_string(), parse_num(attrs.get("accuracy"))));
                    }
                }
            }
            b"distance" => host.distance = parse_num(attrs.get("value")),
            b"tcpsequence" => host.tcp_sequence = attrs.get("difficulty").cloned(),
            b"ipidsequence" => host.ip_id_sequence = attrs.get("class").cloned(),
            b"tcptssequence" => host.tcp_timestamp_seq = attrs.get("class").cloned(),
            b"trace" => self.in_trace = true,
            b"hop" => {
                if self.in_trace {
                    host.traceroute.push(TraceHop {
                        ttl: parse_num(attrs.get("ttl")),
                        ip: attrs.get("ipaddr").cloned(),
                        rtt: parse_num(attrs.get("rtt")),
                        hostname: attrs.get("host").cloned(),
                    });
                }
            }
            b"times" => {
                host.times = Some(HostTimes {
                    srtt: parse_num(attrs.get("srtt")),
                    rtt_variance: parse_num(attrs.get("rttvar")),
                    timeout: parse_num(attrs.get("to")),
                });
            }
            _ => {}
        }
    }

    fn close(&mut self, tag: &[u8]) {
        match tag {
            b"host" => {
                if let Some(builder) = self.host.take() {
                    self.hosts.push(builder.build());
                }
                self.port = None;
            }
            b"port" => {
                let Some(port) = self.port.take() else {
                    return;
                };
                let Some(builder) = self.host.as_mut() else {
                    return;
                };
                match port.port_id {
                    Some(port_id) => {
                        let mut value = port.port;
                        value.port_id = port_id;
                        let key = value.key();
                        builder.host.ports.retain(|p| p.key() != key);
                        builder.host.ports.push(value);
                    }
                    None => {
                        tracing::debug!(protocol = %port.protocol, "skipping port without a numeric port id");
                    }
                }
            }
            b"os" => self.in_os = false,
            b"trace" => self.in_trace = false,
            _ => {}
        }
    }
}

impl HostBuilder {
    fn build(self) -> ScanHost {
        let mut host = self.host;
        host.os = best_os_guess(&self.os_matches);
        host
    }
}

/// First OS match wins; when the next match has the same accuracy but a
/// different name the guess is ambiguous and no OS is reported.
fn best_os_guess(matches: &[(String, Option<u32>)]) -> Option<String> {
    let (name, accuracy) = matches.first()?;
    if let Some((next_name, next_accuracy)) = matches.get(1) {
        if accuracy.is_some() && next_accuracy == accuracy && next_name != name {
            return None;
        }
    }
    Some(name.clone())
}

fn attributes(e: &BytesStart) -> HashMap<String, String> {
    e.attributes()
        .filter_map(|attr| attr.ok())
        .filter_map(|attr| {
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

fn parse_num<T: std::str::FromStr>(value: Option<&String>) -> Option<T> {
    value.and_then(|v| v.trim().parse::<T>().ok())
}
