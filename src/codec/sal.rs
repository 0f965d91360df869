//! SAL (Service Access Layer) payloads carried inside Point-to-Multipoint
//! packets: lighting commands, clock broadcasts and status requests.

use super::application::Application;
use super::InvalidPacket;

/// One lighting/clock/status command. Several can be bundled into a single
/// Point-to-Multipoint packet (the PCI session batches up to nine lighting
/// commands of the same kind per spec).
#[derive(Clone, Debug, PartialEq)]
pub enum Sal {
    LightingOn {
        app: Application,
        group: u8,
    },
    LightingOff {
        app: Application,
        group: u8,
    },
    LightingRamp {
        app: Application,
        group: u8,
        duration_secs: u16,
        level: u8,
    },
    LightingTerminateRamp {
        app: Application,
        group: u8,
    },
    ClockRequest,
    ClockUpdate {
        year: u16,
        month: u8,
        day: u8,
        day_of_week: u8,
        hour: u8,
        minute: u8,
        second: u8,
    },
    StatusRequest {
        app: Application,
        group_start: u8,
        group_count: u8,
    },
}

const TAG_LIGHTING_ON: u8 = 0x01;
const TAG_LIGHTING_OFF: u8 = 0x02;
const TAG_LIGHTING_RAMP: u8 = 0x03;
const TAG_LIGHTING_TERMINATE_RAMP: u8 = 0x04;
const TAG_CLOCK_REQUEST: u8 = 0x10;
const TAG_CLOCK_UPDATE: u8 = 0x11;
const TAG_STATUS_REQUEST: u8 = 0x20;

/// Ramp rate table: (wire byte, duration in seconds), ascending by duration.
///
/// Durations below the first table entry round to `0x00` (instant); anything
/// above the top entry clamps to the slowest rate. Matches spec.md's
/// round-ties-down-to-the-shorter-duration rule.
pub const RAMP_RATES: &[(u8, u16)] = &[
    (0x00, 0),
    (0x02, 4),
    (0x03, 8),
    (0x04, 12),
    (0x05, 20),
    (0x06, 30),
    (0x07, 40),
    (0x08, 60),
    (0x09, 90),
    (0x0A, 120),
    (0x0B, 180),
    (0x0C, 300),
    (0x0D, 420),
    (0x0E, 600),
    (0x0F, 900),
    (0x10, 1020),
];

pub fn duration_to_ramp_byte(duration_secs: u16) -> u8 {
    let mut best = RAMP_RATES[0];
    let mut best_diff = duration_secs.abs_diff(best.1);
    for &(byte, secs) in &RAMP_RATES[1..] {
        let diff = duration_secs.abs_diff(secs);
        // Strictly-less keeps the first (shorter-duration) entry on a tie.
        if diff < best_diff {
            best = (byte, secs);
            best_diff = diff;
        }
    }
    best.0
}

pub fn ramp_byte_to_duration(byte: u8) -> Option<u16> {
    RAMP_RATES
        .iter()
        .find(|(b, _)| *b == byte)
        .map(|(_, secs)| *secs)
}

pub fn encode_sal(sal: &Sal) -> Vec<u8> {
    match sal {
        Sal::LightingOn { app, group } => vec![TAG_LIGHTING_ON, app.0, *group],
        Sal::LightingOff { app, group } => vec![TAG_LIGHTING_OFF, app.0, *group],
        Sal::LightingRamp {
            app,
            group,
            duration_secs,
            level,
        } => vec![
            TAG_LIGHTING_RAMP,
            app.0,
            *group,
            duration_to_ramp_byte(*duration_secs),
            *level,
        ],
        Sal::LightingTerminateRamp { app, group } => {
            vec![TAG_LIGHTING_TERMINATE_RAMP, app.0, *group]
        }
        Sal::ClockRequest => vec![TAG_CLOCK_REQUEST],
        Sal::ClockUpdate {
            year,
            month,
            day,
            day_of_week,
            hour,
            minute,
            second,
        } => {
            let [yr_hi, yr_lo] = year.to_be_bytes();
            vec![
                TAG_CLOCK_UPDATE,
                yr_hi,
                yr_lo,
                *month,
                *day,
                *day_of_week,
                *hour,
                *minute,
                *second,
            ]
        }
        Sal::StatusRequest {
            app,
            group_start,
            group_count,
        } => vec![TAG_STATUS_REQUEST, app.0, *group_start, *group_count],
    }
}

pub fn encode_sal_list(sals: &[Sal]) -> Vec<u8> {
    sals.iter().flat_map(encode_sal).collect()
}

/// Decodes one SAL entry from the front of `buf`, returning it with the
/// number of bytes consumed. `buf` must not be empty.
pub fn decode_sal(buf: &[u8]) -> Result<(Sal, usize), InvalidPacket> {
    let invalid = |reason: &str| InvalidPacket {
        reason: reason.to_string(),
        raw: buf.to_vec(),
    };
    let tag = buf[0];
    match tag {
        TAG_LIGHTING_ON | TAG_LIGHTING_OFF | TAG_LIGHTING_TERMINATE_RAMP => {
            if buf.len() < 3 {
                return Err(invalid("truncated lighting SAL"));
            }
            let app = Application(buf[1]);
            let group = buf[2];
            let sal = match tag {
                TAG_LIGHTING_ON => Sal::LightingOn { app, group },
                TAG_LIGHTING_OFF => Sal::LightingOff { app, group },
                _ => Sal::LightingTerminateRamp { app, group },
            };
            Ok((sal, 3))
        }
        TAG_LIGHTING_RAMP => {
            if buf.len() < 5 {
                return Err(invalid("truncated ramp SAL"));
            }
            let app = Application(buf[1]);
            let group = buf[2];
            let duration_secs = ramp_byte_to_duration(buf[3])
                .ok_or_else(|| invalid("unknown ramp rate byte"))?;
            let level = buf[4];
            Ok((
                Sal::LightingRamp {
                    app,
                    group,
                    duration_secs,
                    level,
                },
                5,
            ))
        }
        TAG_CLOCK_REQUEST => Ok((Sal::ClockRequest, 1)),
        TAG_CLOCK_UPDATE => {
            if buf.len() < 9 {
                return Err(invalid("truncated clock update SAL"));
            }
            let year = u16::from_be_bytes([buf[1], buf[2]]);
            Ok((
                Sal::ClockUpdate {
                    year,
                    month: buf[3],
                    day: buf[4],
                    day_of_week: buf[5],
                    hour: buf[6],
                    minute: buf[7],
                    second: buf[8],
                },
                9,
            ))
        }
        TAG_STATUS_REQUEST => {
            if buf.len() < 4 {
                return Err(invalid("truncated status request SAL"));
            }
            Ok((
                Sal::StatusRequest {
                    app: Application(buf[1]),
                    group_start: buf[2],
                    group_count: buf[3],
                },
                4,
            ))
        }
        _ => Err(invalid("unknown SAL tag")),
    }
}

pub fn decode_sal_list(buf: &[u8]) -> Result<Vec<Sal>, InvalidPacket> {
    let mut sals = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let (sal, consumed) = decode_sal(&buf[pos..])?;
        sals.push(sal);
        pos += consumed;
    }
    Ok(sals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_rate_round_trip_on_table_values() {
        for &(byte, secs) in RAMP_RATES {
            assert_eq!(duration_to_ramp_byte(secs), byte);
            assert_eq!(ramp_byte_to_duration(byte), Some(secs));
        }
    }

    #[test]
    fn ramp_rate_ties_round_down() {
        // Exactly between 4s (0x02) and 8s (0x03) is 6s; distance to 4 is 2,
        // distance to 8 is 2 — the shorter duration wins.
        assert_eq!(duration_to_ramp_byte(6), 0x02);
    }

    #[test]
    fn lighting_sal_round_trips() {
        let sal = Sal::LightingOn {
            app: Application::LIGHTING,
            group: 5,
        };
        let bytes = encode_sal(&sal);
        let (decoded, consumed) = decode_sal(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, sal);
    }

    #[test]
    fn sal_list_decodes_multiple_bundled_entries() {
        let sals = vec![
            Sal::LightingOn {
                app: Application::LIGHTING,
                group: 1,
            },
            Sal::LightingOn {
                app: Application::LIGHTING,
                group: 2,
            },
        ];
        let bytes = encode_sal_list(&sals);
        let decoded = decode_sal_list(&bytes).unwrap();
        assert_eq!(decoded, sals);
    }
}
