//! Translation of MQTT command topics into device command strings.
//!
//! The table is static: a set of canonical [`MappingEntry`] records and a set
//! of alias paths pointing at them. Structured `set/<field>` topics and the
//! legacy flat topics are both just aliases.

use std::collections::HashMap;
use std::fmt;

use easywallbox_common::TopicBuilder;

use crate::protocol::{self, PLACEHOLDER};

/// Identifier of a logical device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    SetUserLimit,
    SetSafeLimit,
    SetDpmLimit,
    SetDpmSwitch,
    StartCharge,
    StopCharge,
    GetUserLimit,
    GetSafeLimit,
    GetDpmLimit,
    GetDpmStatus,
    ReadManufacturing,
    ReadSettings,
    ReadAlarms,
    ReadSessions,
    ReadAppData,
    ReadHwSettings,
    ReadSupplyVoltage,
    Refresh,
}

/// Broad class of a command, used to decide whether a state echo applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Writes a persistent setting.
    Set,
    /// Requests data; the answer arrives as a notification.
    Read,
    /// Triggers an action on the device.
    Action,
}

/// Parameter accepted by a mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSpec {
    /// Current in amps, inclusive range.
    Current { min: u32, max: u32 },
    /// Delay before the action, in hours.
    DelayHours,
    /// On/off switch, rendered as `1`/`0`.
    Switch,
}

/// A validated parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Amps(u32),
    Hours(u32),
    Switch(bool),
}

impl Param {
    /// Value substituted into the device command.
    fn render(&self) -> String {
        match self {
            Param::Amps(v) | Param::Hours(v) => v.to_string(),
            Param::Switch(true) => "1".to_string(),
            Param::Switch(false) => "0".to_string(),
        }
    }

    /// Value echoed on the entity state topic.
    fn state_value(&self) -> String {
        match self {
            Param::Amps(v) | Param::Hours(v) => v.to_string(),
            Param::Switch(true) => "ON".to_string(),
            Param::Switch(false) => "OFF".to_string(),
        }
    }
}

impl ParamSpec {
    fn parse(&self, raw: &str) -> Result<Param, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("missing value".to_string());
        }
        match *self {
            ParamSpec::Current { min, max } => {
                let value = parse_integral(raw)?;
                if value < min || value > max {
                    return Err(format!("{} is outside {}..={}", value, min, max));
                }
                Ok(Param::Amps(value))
            }
            ParamSpec::DelayHours => parse_integral(raw).map(Param::Hours),
            ParamSpec::Switch => match raw.to_ascii_lowercase().as_str() {
                "on" | "1" | "true" => Ok(Param::Switch(true)),
                "off" | "0" | "false" => Ok(Param::Switch(false)),
                _ => Err(format!("'{}' is not ON or OFF", raw)),
            },
        }
    }
}

/// Parse a non-negative integer, also accepting integral decimals like `16.0`.
fn parse_integral(raw: &str) -> Result<u32, String> {
    if let Ok(value) = raw.parse::<u32>() {
        return Ok(value);
    }
    let value: f64 = raw
        .parse()
        .map_err(|_| format!("'{}' is not a number", raw))?;
    if !value.is_finite() || value.fract() != 0.0 || value < 0.0 || value > u32::MAX as f64 {
        return Err(format!("'{}' is not a non-negative integer", raw));
    }
    Ok(value as u32)
}

/// Metadata for the discovery publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryDescriptor {
    /// Home Assistant component (`number`, `switch`, `button`).
    pub component: &'static str,
    /// Entity object id; also the `set/<object_id>` command and `<object_id>/state` topics.
    pub object_id: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub min: Option<u32>,
    pub max: Option<u32>,
    pub icon: Option<&'static str>,
}

/// One canonical device operation.
#[derive(Debug, Clone, Copy)]
pub struct MappingEntry {
    pub id: CommandId,
    pub class: CommandClass,
    /// Command template; contains exactly one `{}` iff `param` is set.
    pub template: &'static str,
    pub param: Option<ParamSpec>,
    /// Fixed commands sent after the main one.
    pub follow_up: &'static [&'static str],
    /// Entity whose state topic receives the optimistic echo.
    pub state_entity: Option<&'static str>,
    pub descriptor: Option<DiscoveryDescriptor>,
}

const LIMIT_RANGE: ParamSpec = ParamSpec::Current { min: 6, max: 32 };

const fn number(object_id: &'static str, name: &'static str, icon: &'static str) -> DiscoveryDescriptor {
    DiscoveryDescriptor {
        component: "number",
        object_id,
        name,
        unit: Some("A"),
        min: Some(6),
        max: Some(32),
        icon: Some(icon),
    }
}

const fn button(object_id: &'static str, name: &'static str, icon: &'static str) -> DiscoveryDescriptor {
    DiscoveryDescriptor {
        component: "button",
        object_id,
        name,
        unit: None,
        min: None,
        max: None,
        icon: Some(icon),
    }
}

const fn read(id: CommandId, template: &'static str) -> MappingEntry {
    MappingEntry {
        id,
        class: CommandClass::Read,
        template,
        param: None,
        follow_up: &[],
        state_entity: None,
        descriptor: None,
    }
}

static ENTRIES: &[MappingEntry] = &[
    MappingEntry {
        id: CommandId::SetUserLimit,
        class: CommandClass::Set,
        template: protocol::SET_USER_LIMIT,
        param: Some(LIMIT_RANGE),
        follow_up: &[],
        state_entity: Some("user_limit"),
        descriptor: Some(number("user_limit", "User Current Limit", "mdi:current-ac")),
    },
    MappingEntry {
        id: CommandId::SetSafeLimit,
        class: CommandClass::Set,
        template: protocol::SET_SAFE_LIMIT,
        param: Some(LIMIT_RANGE),
        follow_up: &[],
        state_entity: Some("safe_limit"),
        descriptor: Some(number("safe_limit", "Safe Current Limit", "mdi:shield-check")),
    },
    MappingEntry {
        id: CommandId::SetDpmLimit,
        class: CommandClass::Set,
        template: protocol::SET_DPM_LIMIT,
        param: Some(LIMIT_RANGE),
        follow_up: &[],
        state_entity: Some("dpm_limit"),
        descriptor: Some(number("dpm_limit", "DPM Current Limit", "mdi:transmission-tower")),
    },
    MappingEntry {
        id: CommandId::SetDpmSwitch,
        class: CommandClass::Set,
        template: protocol::SET_DPM_SWITCH,
        param: Some(ParamSpec::Switch),
        follow_up: &[],
        state_entity: Some("dpm"),
        descriptor: Some(DiscoveryDescriptor {
            component: "switch",
            object_id: "dpm",
            name: "Dynamic Power Management",
            unit: None,
            min: None,
            max: None,
            icon: Some("mdi:home-lightning-bolt"),
        }),
    },
    MappingEntry {
        id: CommandId::StartCharge,
        class: CommandClass::Action,
        template: protocol::START_CHARGE,
        param: Some(ParamSpec::DelayHours),
        follow_up: &[],
        state_entity: None,
        descriptor: Some(button("start_charge", "Start Charging", "mdi:ev-plug-type2")),
    },
    MappingEntry {
        id: CommandId::StopCharge,
        class: CommandClass::Action,
        template: protocol::STOP_CHARGE,
        param: Some(ParamSpec::DelayHours),
        follow_up: &[],
        state_entity: None,
        descriptor: Some(button("stop_charge", "Stop Charging", "mdi:ev-plug-type2-off")),
    },
    MappingEntry {
        id: CommandId::Refresh,
        class: CommandClass::Read,
        template: protocol::READ_SETTINGS,
        param: None,
        follow_up: &[protocol::READ_APP_DATA],
        state_entity: None,
        descriptor: Some(button("refresh", "Refresh Data", "mdi:refresh")),
    },
    read(CommandId::GetUserLimit, protocol::GET_USER_LIMIT),
    read(CommandId::GetSafeLimit, protocol::GET_SAFE_LIMIT),
    read(CommandId::GetDpmLimit, protocol::GET_DPM_LIMIT),
    read(CommandId::GetDpmStatus, protocol::GET_DPM_STATUS),
    read(CommandId::ReadManufacturing, protocol::READ_MANUFACTURING),
    read(CommandId::ReadSettings, protocol::READ_SETTINGS),
    read(CommandId::ReadAlarms, protocol::READ_ALARMS),
    read(CommandId::ReadSessions, protocol::READ_SESSIONS),
    read(CommandId::ReadAppData, protocol::READ_APP_DATA),
    read(CommandId::ReadHwSettings, protocol::READ_HW_SETTINGS),
    read(CommandId::ReadSupplyVoltage, protocol::READ_SUPPLY_VOLTAGE),
];

/// Where the parameter of an aliased command comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgSource {
    /// The message payload.
    Payload,
    /// The last level of the topic (alias path ends in `/{}`).
    PathLevel,
    /// A value fixed by the alias itself.
    Fixed(&'static str),
    /// The entry takes no parameter.
    None,
}

use ArgSource::{Fixed, PathLevel, Payload};

static ALIASES: &[(&str, CommandId, ArgSource)] = &[
    // Structured topics
    ("set/user_limit", CommandId::SetUserLimit, Payload),
    ("set/safe_limit", CommandId::SetSafeLimit, Payload),
    ("set/dpm_limit", CommandId::SetDpmLimit, Payload),
    ("set/dpm", CommandId::SetDpmSwitch, Payload),
    ("set/start_charge", CommandId::StartCharge, Fixed("0")),
    ("set/stop_charge", CommandId::StopCharge, Fixed("0")),
    ("set/refresh", CommandId::Refresh, ArgSource::None),
    // Legacy: dpm
    ("dpm/on", CommandId::SetDpmSwitch, Fixed("ON")),
    ("dpm/off", CommandId::SetDpmSwitch, Fixed("OFF")),
    ("dpm/status", CommandId::GetDpmStatus, ArgSource::None),
    ("dpm/limit", CommandId::GetDpmLimit, ArgSource::None),
    ("dpm/limit/{}", CommandId::SetDpmLimit, PathLevel),
    // Legacy: charge
    ("charge/start", CommandId::StartCharge, Fixed("0")),
    ("charge/start/{}", CommandId::StartCharge, PathLevel),
    ("charge/stop", CommandId::StopCharge, Fixed("0")),
    ("charge/stop/{}", CommandId::StopCharge, PathLevel),
    // Legacy: limit
    ("limit/dpm", CommandId::GetDpmLimit, ArgSource::None),
    ("limit/dpm/{}", CommandId::SetDpmLimit, PathLevel),
    ("limit/safe", CommandId::GetSafeLimit, ArgSource::None),
    ("limit/safe/{}", CommandId::SetSafeLimit, PathLevel),
    ("limit/user", CommandId::GetUserLimit, ArgSource::None),
    ("limit/user/{}", CommandId::SetUserLimit, PathLevel),
    // Legacy: read
    ("read/manufacturing", CommandId::ReadManufacturing, ArgSource::None),
    ("read/settings", CommandId::ReadSettings, ArgSource::None),
    ("read/app_data", CommandId::ReadAppData, ArgSource::None),
    ("read/hw_settings", CommandId::ReadHwSettings, ArgSource::None),
    ("read/voltage", CommandId::ReadSupplyVoltage, ArgSource::None),
    ("read/alarms", CommandId::ReadAlarms, ArgSource::None),
    ("read/sessions", CommandId::ReadSessions, ArgSource::None),
];

/// Legacy roots that also accept the operation in the payload (`limit` + `user/16`).
pub const LEGACY_ROOTS: &[&str] = &["dpm", "charge", "limit", "read"];

/// Errors from [`CommandMapper::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("unknown command path: '{0}'")]
    UnknownPath(String),

    #[error("invalid parameter for '{path}': {reason}")]
    InvalidParameter { path: String, reason: String },
}

/// A protocol-exact, `\n`-terminated device command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceCommandString(String);

impl DeviceCommandString {
    pub(crate) fn new(command: String) -> Self {
        debug_assert!(command.ends_with('\n'));
        Self(command)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceCommandString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.trim_end())
    }
}

/// A logical operation with its validated parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalCommand {
    pub id: CommandId,
    pub param: Option<Param>,
}

/// Optimistic state update implied by a successful `set` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub entity: &'static str,
    pub value: String,
}

/// Full result of resolving a command topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub command: LogicalCommand,
    pub class: CommandClass,
    /// Commands to send in order; never empty.
    pub commands: Vec<DeviceCommandString>,
    pub state: Option<StateUpdate>,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    entry: usize,
    arg: ArgSource,
}

/// Pure translation from command topics to device commands.
#[derive(Debug, Clone)]
pub struct CommandMapper {
    topics: TopicBuilder,
    entries: &'static [MappingEntry],
    aliases: HashMap<&'static str, Binding>,
}

impl CommandMapper {
    /// Build the mapper with the standard table.
    pub fn new(topics: TopicBuilder) -> Self {
        let mut aliases = HashMap::with_capacity(ALIASES.len());
        for (path, id, arg) in ALIASES {
            let entry = ENTRIES
                .iter()
                .position(|e| e.id == *id)
                .unwrap_or_else(|| unreachable!("alias '{}' points at a missing entry", path));
            let previous = aliases.insert(*path, Binding { entry, arg: *arg });
            debug_assert!(previous.is_none(), "duplicate alias '{}'", path);
        }

        Self {
            topics,
            entries: ENTRIES,
            aliases,
        }
    }

    /// Resolve a command topic to the first device command.
    pub fn resolve(
        &self,
        path: &str,
        payload: Option<&str>,
    ) -> Result<DeviceCommandString, MappingError> {
        self.resolve_command(path, payload)
            .map(|resolution| resolution.commands.into_iter().next())?
            .ok_or_else(|| MappingError::UnknownPath(path.to_string()))
    }

    /// Resolve a command topic to every device command it implies, in order.
    pub fn resolve_all(
        &self,
        path: &str,
        payload: Option<&str>,
    ) -> Result<Vec<DeviceCommandString>, MappingError> {
        self.resolve_command(path, payload)
            .map(|resolution| resolution.commands)
    }

    /// Resolve a command topic with all metadata the coordinator needs.
    pub fn resolve_command(
        &self,
        path: &str,
        payload: Option<&str>,
    ) -> Result<Resolution, MappingError> {
        let path = self.topics.strip(path).unwrap_or(path);
        let payload = payload.map(str::trim).filter(|p| !p.is_empty());

        if let Some((binding, level)) = self.lookup(path) {
            return self.build(path, binding, level, payload);
        }

        // Legacy form: the operation is carried in the payload (`limit` + `user/16`).
        if let Some(extra) = payload.filter(|_| LEGACY_ROOTS.contains(&path)) {
            let combined = format!("{}/{}", path, extra);
            if let Some((binding, level)) = self.lookup(&combined) {
                return self.build(&combined, binding, level, None);
            }
        }

        Err(MappingError::UnknownPath(path.to_string()))
    }

    /// Discovery metadata for the entity a path controls.
    pub fn describe(&self, path: &str) -> Option<DiscoveryDescriptor> {
        let path = self.topics.strip(path).unwrap_or(path);
        let (binding, _) = self.lookup(path)?;
        self.entries[binding.entry].descriptor
    }

    /// All entities with discovery metadata, in table order.
    pub fn descriptors(&self) -> impl Iterator<Item = &DiscoveryDescriptor> {
        self.entries.iter().filter_map(|e| e.descriptor.as_ref())
    }

    /// Topic filters (relative to the base) covering every command path.
    ///
    /// Path parameters become single-level wildcards; nothing broader is
    /// subscribed, so state echoes such as `dpm/state` never loop back.
    pub fn topic_filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = ALIASES
            .iter()
            .map(|(path, _, _)| path.replace(PLACEHOLDER, "+"))
            .chain(LEGACY_ROOTS.iter().map(|root| root.to_string()))
            .collect();
        filters.sort();
        filters.dedup();
        filters
    }

    fn lookup<'p>(&self, path: &'p str) -> Option<(Binding, Option<&'p str>)> {
        if let Some(binding) = self.aliases.get(path) {
            return Some((*binding, None));
        }
        let (head, last) = path.rsplit_once('/')?;
        if last.is_empty() {
            return None;
        }
        let key = format!("{}/{}", head, PLACEHOLDER);
        self.aliases
            .get(key.as_str())
            .map(|binding| (*binding, Some(last)))
    }

    fn build(
        &self,
        path: &str,
        binding: Binding,
        level: Option<&str>,
        payload: Option<&str>,
    ) -> Result<Resolution, MappingError> {
        let entry = &self.entries[binding.entry];
        let invalid = |reason: String| MappingError::InvalidParameter {
            path: path.to_string(),
            reason,
        };

        let param = match entry.param {
            Some(spec) => {
                let raw = match binding.arg {
                    ArgSource::Payload => payload,
                    ArgSource::PathLevel => level,
                    ArgSource::Fixed(value) => Some(value),
                    ArgSource::None => None,
                };
                let raw = raw.ok_or_else(|| invalid("missing value".to_string()))?;
                Some(spec.parse(raw).map_err(invalid)?)
            }
            None => None,
        };

        let main = match param {
            Some(param) => entry.template.replacen(PLACEHOLDER, &param.render(), 1),
            None => entry.template.to_string(),
        };

        let mut commands = Vec::with_capacity(1 + entry.follow_up.len());
        commands.push(DeviceCommandString::new(main));
        commands.extend(
            entry
                .follow_up
                .iter()
                .map(|c| DeviceCommandString::new(c.to_string())),
        );

        let state = match (entry.class, entry.state_entity, param) {
            (CommandClass::Set, Some(entity), Some(param)) => Some(StateUpdate {
                entity,
                value: param.state_value(),
            }),
            _ => None,
        };

        Ok(Resolution {
            command: LogicalCommand {
                id: entry.id,
                param,
            },
            class: entry.class,
            commands,
            state,
        })
    }
}

impl Default for CommandMapper {
    fn default() -> Self {
        Self::new(TopicBuilder::default())
    }
}
