//! EasyWallbox device protocol.
//!
//! Every device command string and answer the bridge knows about lives here.
//! Commands are ASCII lines terminated by `\n`; a `{}` marks the single
//! substitution point of a parameterised command.

use uuid::Uuid;

/// GATT service exposed by the wallbox.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x331a36f5_2459_45ea_9d95_6142f0c4b307);
/// Characteristic commands are written to.
pub const RX_CHAR_UUID: Uuid = Uuid::from_u128(0xa9da6040_0823_4995_94ec_9ce41ca28833);
/// Characteristic carrying command answers and asynchronous data.
pub const TX_CHAR_UUID: Uuid = Uuid::from_u128(0xa73e9a10_628f_4494_a099_12efaf72258f);
/// Characteristic carrying status frames.
pub const ST_CHAR_UUID: Uuid = Uuid::from_u128(0x75a9f022_af03_4e41_b4bc_9de90a47d50b);

/// Line terminator of every command and answer.
pub const TERMINATOR: u8 = b'\n';

/// Substitution point in a command template.
pub const PLACEHOLDER: &str = "{}";

pub const LOGIN: &str = "$BLE,AUTH,{}\n";
pub const LOGOUT: &str = "$BLE,LOGOUT\n";

pub const START_CHARGE: &str = "$CMD,CHARGE,START,{}\n";
pub const STOP_CHARGE: &str = "$CMD,CHARGE,STOP,{}\n";

pub const SET_USER_LIMIT: &str = "$EEP,WRITE,IDX,174,{}\n";
pub const SET_DPM_LIMIT: &str = "$EEP,WRITE,IDX,158,{}\n";
pub const SET_SAFE_LIMIT: &str = "$EEP,WRITE,IDX,156,{}\n";
pub const SET_DPM_SWITCH: &str = "$EEP,WRITE,IDX,178,{}\n";

pub const GET_USER_LIMIT: &str = "$EEP,READ,IDX,174\n";
pub const GET_DPM_LIMIT: &str = "$EEP,READ,IDX,158\n";
pub const GET_SAFE_LIMIT: &str = "$EEP,READ,IDX,156\n";
pub const GET_DPM_STATUS: &str = "$EEP,READ,IDX,178\n";

pub const READ_MANUFACTURING: &str = "$EEP,READ,MF\n";
pub const READ_SETTINGS: &str = "$EEP,READ,ST\n";
pub const READ_ALARMS: &str = "$EEP,READ,AL\n";
pub const READ_SESSIONS: &str = "$EEP,READ,SL\n";
pub const READ_APP_DATA: &str = "$DATA,READ,AD\n";
pub const READ_HW_SETTINGS: &str = "$DATA,READ,HS\n";
pub const READ_SUPPLY_VOLTAGE: &str = "$DATA,READ,SV\n";

/// Answers the device sends on the TX characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    AuthOk,
    AuthFail,
    ErrAuth,
    ErrBusy,
    ErrSyntax,
    WriteFail,
    LogoutOk,
}

impl Answer {
    const ALL: [(Answer, &'static str); 7] = [
        (Answer::AuthOk, "$BLE,AUTH,OK"),
        (Answer::AuthFail, "$BLE,AUTH,FAIL"),
        (Answer::ErrAuth, "$ERR,AUTH"),
        (Answer::ErrBusy, "$ERR,BUSY"),
        (Answer::ErrSyntax, "$ERR,SYNTAX"),
        (Answer::WriteFail, "$EEP,WRITE,FAIL"),
        (Answer::LogoutOk, "$BLE,LOGOUT,OK"),
    ];

    /// Recognise a known answer in a received frame.
    ///
    /// Trailing `\r`/`\n` are ignored; anything else must match exactly.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let line = trim_line(frame);
        Self::ALL
            .iter()
            .find(|(_, text)| text.as_bytes() == line)
            .map(|(answer, _)| *answer)
    }

    /// Whether the answer rejects the preceding command.
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            Answer::ErrBusy | Answer::ErrSyntax | Answer::WriteFail | Answer::ErrAuth
        )
    }
}

/// Strip the line terminator (and a stray carriage return) from a frame.
pub fn trim_line(frame: &[u8]) -> &[u8] {
    let mut end = frame.len();
    while end > 0 && matches!(frame[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &frame[..end]
}

/// Build the login command for a PIN.
pub fn login(pin: &str) -> String {
    LOGIN.replacen(PLACEHOLDER, pin, 1)
}
