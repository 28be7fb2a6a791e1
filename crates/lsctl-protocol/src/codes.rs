//! Command codes understood by the instrument firmware.
//!
//! Codes are grouped by subsystem in the high nibble of the low 16 bits:
//! `0x1xxx` scope, `0x2xxx` laser, `0x3xxx` camera/workflow,
//! `0x4xxx` LED illumination, `0x6xxx` stage, `0xAxxx` system.

// ---------------------------------------------------------------------------
// Scope settings
// ---------------------------------------------------------------------------

/// Save the current scope settings on the instrument.
pub const SCOPE_SETTINGS_SAVE: u32 = 0x1008;
/// Retrieve the scope settings; the reply carries them as payload text.
pub const SCOPE_SETTINGS_LOAD: u32 = 0x1009;

// ---------------------------------------------------------------------------
// Laser
// ---------------------------------------------------------------------------

/// Set a laser's power level (`params[0]` = laser index, `value` = percent).
pub const LASER_LEVEL_SET: u32 = 0x2001;
/// Query a laser's power level (`params[0]` = laser index).
pub const LASER_LEVEL_GET: u32 = 0x2002;
/// Enable a laser for live preview.
pub const LASER_PREVIEW_ENABLE: u32 = 0x2004;
/// Disable a laser's live preview.
pub const LASER_PREVIEW_DISABLE: u32 = 0x2005;
/// Switch every laser off.
pub const LASER_ALL_DISABLE: u32 = 0x2007;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Start a workflow; the workflow text follows the frame as payload.
pub const WORKFLOW_START: u32 = 0x3004;
/// Stop the running workflow. Firmware does not always acknowledge it.
pub const WORKFLOW_STOP: u32 = 0x3005;

// ---------------------------------------------------------------------------
// LED illumination
// ---------------------------------------------------------------------------

pub const LED_ON: u32 = 0x4001;
pub const LED_OFF: u32 = 0x4002;
pub const LED_LEVEL_SET: u32 = 0x4003;
pub const LED_LEVEL_GET: u32 = 0x4004;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Move an axis (`params[3]` = axis, `value` = target in mm).
pub const STAGE_POSITION_SET: u32 = 0x6005;
/// Query an axis position (`params[3]` = axis); the reply `value` is the
/// position in mm.
pub const STAGE_POSITION_GET: u32 = 0x6008;
/// Sent by the instrument when stage motion has stopped.
pub const STAGE_MOTION_STOPPED: u32 = 0x6010;

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// Sent by the instrument when it returns to idle, e.g. after the
/// workflow queue drains.
pub const SYSTEM_STATE_IDLE: u32 = 0xA002;
/// Query the system state; the reply carries it in `params[3]`.
pub const SYSTEM_STATE_GET: u32 = 0xA007;

/// Codes the instrument only ever sends unsolicited.
pub const NOTIFICATION_CODES: &[u32] = &[STAGE_MOTION_STOPPED, SYSTEM_STATE_IDLE];

/// Parameter slot used for the stage axis and for system-state replies.
pub const INT_DATA_SLOT: usize = 3;

/// Stage axes as numbered by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Axis {
    X = 1,
    Y = 2,
    Z = 3,
    R = 4,
}

impl Axis {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl std::str::FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            "z" => Ok(Axis::Z),
            "r" => Ok(Axis::R),
            other => Err(format!("unknown axis: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_parse() {
        assert_eq!("x".parse::<Axis>().unwrap(), Axis::X);
        assert_eq!("R".parse::<Axis>().unwrap(), Axis::R);
        assert!("w".parse::<Axis>().is_err());
    }

    #[test]
    fn axis_codes() {
        assert_eq!(Axis::X.code(), 1);
        assert_eq!(Axis::R.code(), 4);
    }
}
