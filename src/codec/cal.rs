//! CAL (Common Application Language) payloads carried inside Point-to-Point
//! packets: identify requests and extended status reports.

use super::InvalidPacket;

#[derive(Clone, Debug, PartialEq)]
pub enum Cal {
    Identify {
        attribute: u8,
    },
    ExtendedReport {
        child_app: u8,
        block_start: u8,
        report: ExtendedReportData,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExtendedReportData {
    /// One tri-state entry per group in the block: `None` means "not
    /// reported", `Some(false)`/`Some(true)` is the observed binary state.
    Binary(Vec<Option<bool>>),
    /// One level (0-255) per group in the block, `None` if unreported.
    Level(Vec<Option<u8>>),
}

const TAG_IDENTIFY: u8 = 0x30;
const TAG_EXTENDED_REPORT: u8 = 0x31;
const REPORT_KIND_BINARY: u8 = 0x01;
const REPORT_KIND_LEVEL: u8 = 0x02;

pub fn encode_cal(cal: &Cal) -> Vec<u8> {
    match cal {
        Cal::Identify { attribute } => vec![TAG_IDENTIFY, *attribute],
        Cal::ExtendedReport {
            child_app,
            block_start,
            report,
        } => {
            let mut out = vec![TAG_EXTENDED_REPORT, *child_app, *block_start];
            match report {
                ExtendedReportData::Binary(states) => {
                    out.push(REPORT_KIND_BINARY);
                    out.push(states.len() as u8);
                    for s in states {
                        out.push(match s {
                            None => 0,
                            Some(false) => 1,
                            Some(true) => 2,
                        });
                    }
                }
                ExtendedReportData::Level(levels) => {
                    out.push(REPORT_KIND_LEVEL);
                    out.push(levels.len() as u8);
                    for l in levels {
                        match l {
                            None => {
                                out.push(0);
                                out.push(0);
                            }
                            Some(v) => {
                                out.push(1);
                                out.push(*v);
                            }
                        }
                    }
                }
            }
            out
        }
    }
}

pub fn encode_cal_list(cals: &[Cal]) -> Vec<u8> {
    cals.iter().flat_map(encode_cal).collect()
}

pub fn decode_cal(buf: &[u8]) -> Result<(Cal, usize), InvalidPacket> {
    let invalid = |reason: &str| InvalidPacket {
        reason: reason.to_string(),
        raw: buf.to_vec(),
    };
    if buf.is_empty() {
        return Err(invalid("empty CAL buffer"));
    }
    match buf[0] {
        TAG_IDENTIFY => {
            if buf.len() < 2 {
                return Err(invalid("truncated identify CAL"));
            }
            Ok((
                Cal::Identify {
                    attribute: buf[1],
                },
                2,
            ))
        }
        TAG_EXTENDED_REPORT => {
            if buf.len() < 5 {
                return Err(invalid("truncated extended report CAL header"));
            }
            let child_app = buf[1];
            let block_start = buf[2];
            let kind = buf[3];
            let count = buf[4] as usize;
            match kind {
                REPORT_KIND_BINARY => {
                    if buf.len() < 5 + count {
                        return Err(invalid("truncated binary report body"));
                    }
                    let states = buf[5..5 + count]
                        .iter()
                        .map(|b| match b {
                            0 => Ok(None),
                            1 => Ok(Some(false)),
                            2 => Ok(Some(true)),
                            _ => Err(invalid("invalid binary report entry")),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok((
                        Cal::ExtendedReport {
                            child_app,
                            block_start,
                            report: ExtendedReportData::Binary(states),
                        },
                        5 + count,
                    ))
                }
                REPORT_KIND_LEVEL => {
                    let body_len = count * 2;
                    if buf.len() < 5 + body_len {
                        return Err(invalid("truncated level report body"));
                    }
                    let mut levels = Vec::with_capacity(count);
                    for chunk in buf[5..5 + body_len].chunks_exact(2) {
                        levels.push(if chunk[0] == 0 { None } else { Some(chunk[1]) });
                    }
                    Ok((
                        Cal::ExtendedReport {
                            child_app,
                            block_start,
                            report: ExtendedReportData::Level(levels),
                        },
                        5 + body_len,
                    ))
                }
                _ => Err(invalid("unknown extended report kind")),
            }
        }
        _ => Err(invalid("unknown CAL tag")),
    }
}

pub fn decode_cal_list(buf: &[u8]) -> Result<Vec<Cal>, InvalidPacket> {
    let mut cals = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let (cal, consumed) = decode_cal(&buf[pos..])?;
        cals.push(cal);
        pos += consumed;
    }
    Ok(cals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_round_trips() {
        let cal = Cal::Identify { attribute: 0x09 };
        let bytes = encode_cal(&cal);
        let (decoded, consumed) = decode_cal(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, cal);
    }

    #[test]
    fn level_report_round_trips_with_gaps() {
        let cal = Cal::ExtendedReport {
            child_app: 0,
            block_start: 32,
            report: ExtendedReportData::Level(vec![Some(0), None, Some(255)]),
        };
        let bytes = encode_cal(&cal);
        let (decoded, consumed) = decode_cal(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, cal);
    }
}
