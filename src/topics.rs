//! Home Assistant MQTT topic construction and parsing.
//!
//! Grounded on `original_source/cbus/daemon/topics.py`: group addresses map
//! to topic segments via [`ga_string`], and command topics parse back into
//! `(Application, group)` pairs.

use crate::codec::Application;

const LIGHT_TOPIC_PREFIX: &str = "homeassistant/light/cbus_";
const BIN_SENSOR_TOPIC_PREFIX: &str = "homeassistant/binary_sensor/cbus_";
const SET_SUFFIX: &str = "/set";
const CONFIG_SUFFIX: &str = "/config";
const STATE_SUFFIX: &str = "/state";
const APP_GROUP_SEPARATOR: char = '_';

/// Renders a group address for use inside a topic segment or a unique id.
///
/// Lighting groups render as a bare (optionally zero-padded) group number;
/// any other application prefixes the zero-padded application number.
pub fn ga_string(group: u8, app: Application, zeros: bool) -> String {
    if app == Application::LIGHTING {
        if zeros {
            format!("{group:03}")
        } else {
            format!("{group}")
        }
    } else {
        // Non-lighting applications always zero-pad both halves, regardless
        // of `zeros` — there's no bare single-number form for them.
        format!("{:03}{APP_GROUP_SEPARATOR}{group:03}", app.0)
    }
}

pub fn light_set_topic(group: u8, app: Application) -> String {
    format!("{LIGHT_TOPIC_PREFIX}{}{SET_SUFFIX}", ga_string(group, app, false))
}

pub fn light_state_topic(group: u8, app: Application) -> String {
    format!("{LIGHT_TOPIC_PREFIX}{}{STATE_SUFFIX}", ga_string(group, app, false))
}

pub fn light_config_topic(group: u8, app: Application) -> String {
    format!("{LIGHT_TOPIC_PREFIX}{}{CONFIG_SUFFIX}", ga_string(group, app, false))
}

pub fn binary_sensor_state_topic(group: u8, app: Application) -> String {
    format!(
        "{BIN_SENSOR_TOPIC_PREFIX}{}{STATE_SUFFIX}",
        ga_string(group, app, false)
    )
}

pub fn binary_sensor_config_topic(group: u8, app: Application) -> String {
    format!(
        "{BIN_SENSOR_TOPIC_PREFIX}{}{CONFIG_SUFFIX}",
        ga_string(group, app, false)
    )
}

/// The discovery subscription wildcard the gateway listens on for commands.
pub const COMMAND_SUBSCRIPTION: &str = "homeassistant/light/+/set";

/// Parses a `.../set` command topic back into its `(Application, group)`.
/// Mirrors `get_topic_group_address` in the Python original: a single
/// underscore-delimited segment is a lighting group, two segments are
/// `app_group`.
pub fn parse_command_topic(topic: &str) -> Option<(Application, u8)> {
    let rest = topic
        .strip_prefix(LIGHT_TOPIC_PREFIX)?
        .strip_suffix(SET_SUFFIX)?;
    let parts: Vec<&str> = rest.split(APP_GROUP_SEPARATOR).collect();
    let (app, group) = match parts.as_slice() {
        [group] => {
            let group: u8 = group.parse().ok()?;
            (Application::LIGHTING, group)
        }
        [app, group] => {
            let app: u8 = app.parse().ok()?;
            let group: u8 = group.parse().ok()?;
            (Application(app), group)
        }
        _ => return None,
    };
    if group == 0 {
        return None;
    }
    Some((app, group))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ga_string_lighting_drops_app_segment() {
        assert_eq!(ga_string(1, Application::LIGHTING, false), "1");
        assert_eq!(ga_string(1, Application::LIGHTING, true), "001");
    }

    #[test]
    fn ga_string_non_lighting_prefixes_application() {
        assert_eq!(ga_string(1, Application::CLOCK, false), "223_001");
    }

    #[test]
    fn command_topic_round_trips_for_lighting() {
        let topic = light_set_topic(42, Application::LIGHTING);
        assert_eq!(topic, "homeassistant/light/cbus_42/set");
        assert_eq!(
            parse_command_topic(&topic),
            Some((Application::LIGHTING, 42))
        );
    }

    #[test]
    fn command_topic_rejects_group_zero() {
        assert_eq!(
            parse_command_topic("homeassistant/light/cbus_0/set"),
            None
        );
    }

    #[test]
    fn command_topic_round_trips_for_non_lighting() {
        let topic = light_set_topic(7, Application::CLOCK);
        assert_eq!(
            parse_command_topic(&topic),
            Some((Application::CLOCK, 7))
        );
    }
}
