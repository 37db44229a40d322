// SPDX-License-Identifier: Apache-2.0

//! Parses lines emitted by an `ss`-compatible socket inspector.
//!
//! Each line has fixed leading positional fields (state, recv-q, send-q,
//! local endpoint, peer endpoint) followed by `key:value` or `key value`
//! tokens in no particular order. Unknown tokens are skipped. Rates carry a
//! `bps` suffix with SI k/M/G/T prefixes; times carry an `ms` suffix,
//! possibly followed by an ignored `(…)` annotation.

use heyp_proto::{AuxInfo, FlowMarker, Protocol};

/// Parse failures. These are data-loss events: the caller drops the line
/// with a debug-level log and moves on.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    /// The line has fewer positional fields than expected.
    #[error("too few fields in ss line")]
    TooFewFields,
    /// A `host:port` endpoint did not parse.
    #[error("bad endpoint: {reason}")]
    BadEndpoint {
        /// What was wrong.
        reason: &'static str,
    },
}

/// A parsed socket line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SsLine {
    /// The flow marker (host id filled from the caller, no seqnum).
    pub flow: FlowMarker,
    /// Instantaneous send rate in bps, zero when absent.
    pub cur_usage_bps: i64,
    /// Cumulative bytes sent, zero when absent.
    pub cum_usage_bytes: i64,
    /// TCP statistics; `None` unless requested.
    pub aux: Option<AuxInfo>,
}

/// Splits `addr:port`, handling IPv6 brackets and stripping `::ffff:` from
/// bracketed IPv4-mapped addresses.
pub fn parse_host_port(s: &str) -> Result<(&str, i32), ParseError> {
    if s.is_empty() {
        return Err(ParseError::BadEndpoint {
            reason: "empty host:port",
        });
    }
    let Some(port_separator) = s.rfind(':') else {
        return Err(ParseError::BadEndpoint {
            reason: "port not found",
        });
    };
    let port: i32 = s[port_separator + 1..]
        .parse()
        .map_err(|_| ParseError::BadEndpoint {
            reason: "invalid port",
        })?;
    if port_separator == 0 {
        return Err(ParseError::BadEndpoint {
            reason: "found port but no address",
        });
    }
    let host = &s[..port_separator];
    if let Some(stripped) = host.strip_prefix('[') {
        let Some(inner) = stripped.strip_suffix(']') else {
            return Err(ParseError::BadEndpoint {
                reason: "invalid address",
            });
        };
        if let Some(v4) = inner.strip_prefix("::ffff:") {
            if !v4.contains(':') {
                return Ok((v4, port));
            }
        }
        return Ok((inner, port));
    }
    Ok((host, port))
}

/// Parses an `ss` rate like `3458943bps` or `10Mbps`.
fn parse_bps(s: &str) -> Option<i64> {
    let s = s.strip_suffix("bps")?;
    let (digits, multiplier) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1e3),
        'm' | 'M' => (&s[..s.len() - 1], 1e6),
        'g' | 'G' => (&s[..s.len() - 1], 1e9),
        't' | 'T' => (&s[..s.len() - 1], 1e12),
        _ => (s, 1.0),
    };
    let val: f64 = digits.parse().ok()?;
    Some((val * multiplier) as i64)
}

/// Parses an `ss` time like `436ms` or `240ms(...)`; the annotation is
/// ignored.
fn parse_ms(s: &str) -> Option<i64> {
    let s = match s.find('(') {
        Some(idx) => &s[..idx],
        None => s,
    };
    s.strip_suffix("ms")?.parse().ok()
}

fn parse_i64(s: &str) -> Option<i64> {
    s.parse().ok()
}

fn parse_f64(s: &str) -> Option<f64> {
    s.parse().ok()
}

fn parse_bbr(body: &str, aux: &mut AuxInfo) {
    // bbr:(bw:413714088bps,mrtt:0.028,pacing_gain:2.88672,cwnd_gain:2.88672)
    let body = body
        .strip_prefix('(')
        .and_then(|b| b.strip_suffix(')'))
        .unwrap_or(body);
    for part in body.split(',') {
        let Some((key, value)) = part.split_once(':') else {
            continue;
        };
        match key {
            "bw" => aux.bbr_bw = parse_bps(value).unwrap_or(0),
            "mrtt" => aux.bbr_min_rtt_ms = parse_f64(value).unwrap_or(0.0),
            "pacing_gain" => aux.bbr_pacing_gain = parse_f64(value).unwrap_or(0.0),
            "cwnd_gain" => aux.bbr_cwnd_gain = parse_f64(value).unwrap_or(0.0),
            _ => {}
        }
    }
}

fn apply_key_value(key: &str, value: &str, aux: &mut AuxInfo) {
    match key {
        "wscale" => {
            if let Some((snd, rcv)) = value.split_once(',') {
                aux.snd_wscale = parse_i64(snd).unwrap_or(0);
                aux.rcv_wscale = parse_i64(rcv).unwrap_or(0);
            }
        }
        "rto" => aux.rto_ms = parse_i64(value).unwrap_or(0),
        "ato" => aux.ato_ms = parse_i64(value).unwrap_or(0),
        "rtt" => {
            let (rtt, rtt_var) = match value.split_once('/') {
                Some((a, b)) => (a, Some(b)),
                None => (value, None),
            };
            aux.rtt_ms = parse_f64(rtt).unwrap_or(0.0);
            if let Some(rtt_var) = rtt_var {
                aux.rtt_var_ms = parse_f64(rtt_var).unwrap_or(0.0);
            }
        }
        "minrtt" => aux.min_rtt_ms = parse_f64(value).unwrap_or(0.0),
        "mss" => aux.mss = parse_i64(value).unwrap_or(0),
        "pmtu" => aux.pmtu = parse_i64(value).unwrap_or(0),
        "rcvmss" => aux.rcvmss = parse_i64(value).unwrap_or(0),
        "advmss" => aux.advmss = parse_i64(value).unwrap_or(0),
        "cwnd" => aux.cwnd = parse_i64(value).unwrap_or(0),
        "bytes_acked" => aux.bytes_acked = parse_i64(value).unwrap_or(0),
        "bytes_received" => aux.bytes_received = parse_i64(value).unwrap_or(0),
        "segs_out" => aux.segs_out = parse_i64(value).unwrap_or(0),
        "segs_in" => aux.segs_in = parse_i64(value).unwrap_or(0),
        "data_segs_out" => aux.data_segs_out = parse_i64(value).unwrap_or(0),
        "data_segs_in" => aux.data_segs_in = parse_i64(value).unwrap_or(0),
        "lastsnd" => aux.lastsnd_ms = parse_i64(value).unwrap_or(0),
        "lastrcv" => aux.lastrcv_ms = parse_i64(value).unwrap_or(0),
        "lastack" => aux.lastack_ms = parse_i64(value).unwrap_or(0),
        "busy" => aux.busy_time_ms = parse_ms(value).unwrap_or(0),
        "delivered" => aux.delivered = parse_i64(value).unwrap_or(0),
        "rcv_space" => aux.rcv_space = parse_i64(value).unwrap_or(0),
        "rcv_ssthresh" => aux.rcv_ssthresh = parse_i64(value).unwrap_or(0),
        "bbr" => parse_bbr(value, aux),
        _ => {} // unknown keys are skipped
    }
}

/// Parses one socket line. `host_id_to_use` is stamped on the marker.
/// When `collect_aux` is false, TCP statistics are not gathered.
pub fn parse_line_ss(
    host_id_to_use: u64,
    line: &str,
    collect_aux: bool,
) -> Result<SsLine, ParseError> {
    let fields: Vec<&str> = line.split_ascii_whitespace().collect();
    if fields.len() < 5 {
        return Err(ParseError::TooFewFields);
    }

    let (src_addr, src_port) = parse_host_port(fields[3])?;
    let (dst_addr, dst_port) = parse_host_port(fields[4])?;

    let mut out = SsLine {
        flow: FlowMarker {
            host_id: host_id_to_use,
            src_addr: src_addr.to_string(),
            dst_addr: dst_addr.to_string(),
            protocol: Protocol::ProtoTcp as i32,
            src_port,
            dst_port,
            ..Default::default()
        },
        cur_usage_bps: 0,
        cum_usage_bytes: 0,
        aux: collect_aux.then(AuxInfo::default),
    };

    let mut i = 5;
    while i < fields.len() {
        let token = fields[i];
        // Two-token forms: `send 123bps`, `pacing_rate 123bps`,
        // `delivery_rate 123bps`.
        match token {
            "send" | "pacing_rate" | "delivery_rate" => {
                if let Some(&next) = fields.get(i + 1) {
                    if let Some(bps) = parse_bps(next) {
                        match token {
                            "send" => out.cur_usage_bps = bps,
                            "pacing_rate" => {
                                if let Some(aux) = out.aux.as_mut() {
                                    aux.pacing_rate = bps;
                                }
                            }
                            _ => {
                                if let Some(aux) = out.aux.as_mut() {
                                    aux.delivery_rate = bps;
                                }
                            }
                        }
                        i += 2;
                        continue;
                    }
                }
                i += 1;
                continue;
            }
            "app_limited" => {
                if let Some(aux) = out.aux.as_mut() {
                    aux.app_limited = true;
                }
                i += 1;
                continue;
            }
            _ => {}
        }

        if let Some((key, value)) = token.split_once(':') {
            if key == "bytes_sent" {
                out.cum_usage_bytes = parse_i64(value).unwrap_or(0);
            } else if let Some(aux) = out.aux.as_mut() {
                apply_key_value(key, value, aux);
            }
        }
        i += 1;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn line1() -> String {
        [
            "UNCONN",
            "1",
            "0",
            "140.197.113.99:22",
            "165.121.234.111:21364",
            "wscale:6,7",
            "rto:236",
            "rtt:33.49/1.669",
            "ato:40",
            "mss:1448",
            "pmtu:1500",
            "rcvmss:1392",
            "advmss:1448",
            "cwnd:10",
            "bytes_sent:4140",
            "bytes_acked:4141",
            "bytes_received:3302",
            "segs_out:21",
            "segs_in:31",
            "data_segs_out:14",
            "data_segs_in:13",
            "send 3458943bps",
            "lastsnd:72",
            "lastrcv:40",
            "pacing_rate",
            "6917808bps",
            "delivery_rate",
            "336408bps",
            "delivered:16",
            "busy:436ms",
            "rcv_space:14600",
            "rcv_ssthresh:64076",
            "minrtt:31.792",
        ]
        .join(" ")
    }

    fn line2(send: &str) -> String {
        [
            "ESTAB",
            "0",
            "0",
            "[::ffff:140.197.113.99]:4580",
            "[::ffff:192.168.1.7]:38290",
            "bbr",
            "wscale:7,7",
            "rto:204",
            "rtt:0.128/0.085",
            "ato:40",
            "mss:1448",
            "pmtu:1500",
            "rcvmss:536",
            "advmss:1448",
            "cwnd:43",
            "bytes_sent:1431",
            "bytes_acked:1431",
            "bytes_received:2214",
            "segs_out:100",
            "segs_in:95",
            "data_segs_out:33",
            "data_segs_in:67",
            "bbr:(bw:413714088bps,mrtt:0.028,pacing_gain:2.88672,cwnd_gain:2.88672)",
            "send",
            send,
            "lastsnd:1536",
            "lastrcv:1096",
            "lastack:1096",
            "pacing_rate",
            "4355966600bps",
            "delivery_rate",
            "413714280bps",
            "delivered:34",
            "app_limited",
            "rcv_space:14600",
            "rcv_ssthresh:64076",
            "minrtt:0.028",
        ]
        .join(" ")
    }

    #[test]
    fn parses_flow_and_counters() {
        let got = parse_line_ss(123, &line1(), false).unwrap();
        assert_eq!(got.flow.host_id, 123);
        assert_eq!(got.flow.src_addr, "140.197.113.99");
        assert_eq!(got.flow.dst_addr, "165.121.234.111");
        assert_eq!(got.flow.src_port, 22);
        assert_eq!(got.flow.dst_port, 21364);
        assert_eq!(got.flow.protocol, Protocol::ProtoTcp as i32);
        assert_eq!(got.cur_usage_bps, 3_458_943);
        assert_eq!(got.cum_usage_bytes, 4140);
        assert!(got.aux.is_none());
    }

    #[test]
    fn strips_mapped_v4_brackets() {
        let got = parse_line_ss(123, &line2("3891500000bps"), false).unwrap();
        assert_eq!(got.flow.src_addr, "140.197.113.99");
        assert_eq!(got.flow.dst_addr, "192.168.1.7");
        assert_eq!(got.flow.src_port, 4580);
        assert_eq!(got.flow.dst_port, 38290);
        assert_eq!(got.cur_usage_bps, 3_891_500_000);
        assert_eq!(got.cum_usage_bytes, 1431);
    }

    #[test]
    fn parses_si_prefixed_rates() {
        let got = parse_line_ss(123, &line2("10Mbps"), false).unwrap();
        assert_eq!(got.cur_usage_bps, 10_000_000);
    }

    #[test]
    fn collects_aux_stats() {
        let got = parse_line_ss(234, &line1(), true).unwrap();
        let aux = got.aux.unwrap();
        assert_eq!(
            aux,
            AuxInfo {
                advmss: 1448,
                ato_ms: 40,
                busy_time_ms: 436,
                bytes_acked: 4141,
                bytes_received: 3302,
                cwnd: 10,
                data_segs_in: 13,
                data_segs_out: 14,
                delivered: 16,
                delivery_rate: 336408,
                lastrcv_ms: 40,
                lastsnd_ms: 72,
                min_rtt_ms: 31.792,
                mss: 1448,
                pacing_rate: 6917808,
                pmtu: 1500,
                rcv_space: 14600,
                rcv_ssthresh: 64076,
                rcv_wscale: 7,
                rcvmss: 1392,
                rto_ms: 236,
                rtt_ms: 33.49,
                rtt_var_ms: 1.669,
                segs_in: 31,
                segs_out: 21,
                snd_wscale: 6,
                ..Default::default()
            }
        );
    }

    #[test]
    fn collects_bbr_aux() {
        let got = parse_line_ss(234, &line2("3891500000bps"), true).unwrap();
        let aux = got.aux.unwrap();
        assert_eq!(aux.bbr_bw, 413714088);
        assert!((aux.bbr_min_rtt_ms - 0.028).abs() < 1e-9);
        assert!((aux.bbr_pacing_gain - 2.88672).abs() < 1e-9);
        assert!((aux.bbr_cwnd_gain - 2.88672).abs() < 1e-9);
        assert!(aux.app_limited);
        assert_eq!(aux.lastack_ms, 1096);
    }

    #[test]
    fn rejects_bad_endpoints() {
        assert!(parse_line_ss(1, "ESTAB 0 0 noport 1.2.3.4:5", false).is_err());
        assert!(parse_line_ss(1, "ESTAB 0 0 :80 1.2.3.4:5", false).is_err());
        assert!(parse_line_ss(1, "ESTAB 0 0", false).is_err());
    }

    #[test]
    fn parse_host_port_handles_v6() {
        assert_eq!(parse_host_port("[2001:db8::1]:443").unwrap(), ("2001:db8::1", 443));
        assert_eq!(
            parse_host_port("[::ffff:10.0.0.1]:80").unwrap(),
            ("10.0.0.1", 80)
        );
        assert_eq!(parse_host_port("10.0.0.1:80").unwrap(), ("10.0.0.1", 80));
        assert!(parse_host_port("").is_err());
        assert!(parse_host_port("nocolon").is_err());
    }
}
