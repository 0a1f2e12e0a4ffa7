//! Protocol commands
//!
//! Defines the verbs understood by the Microliter firmware.

/// Protocol verbs for pump communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Firmware model and version ('VER')
    Version,

    /// Set syringe diameter in mm ('MMD')
    SetDiameter,

    /// Read back syringe diameter ('DIA')
    Diameter,

    /// Set infuse rate in µL/min ('ULM')
    SetInfuseRate,

    /// Set withdraw rate in µL/min ('ULMW')
    SetWithdrawRate,

    /// Read back infuse rate ('RAT')
    InfuseRate,

    /// Read back withdraw rate ('RATW')
    WithdrawRate,

    /// Start infusing ('RUN')
    Run,

    /// Start withdrawing ('RUNW')
    RunWithdraw,

    /// Halt any movement ('STP')
    Stop,

    /// Clear infuse target ('CLT')
    ClearInfuseTarget,

    /// Clear withdraw target ('CLTW')
    ClearWithdrawTarget,

    /// Clear infused volume counter ('CLV')
    ClearInfusedVolume,

    /// Clear withdrawn volume counter ('CLVW')
    ClearWithdrawnVolume,

    /// Set infuse target in µL ('ULT')
    SetInfuseTarget,

    /// Set withdraw target in µL ('ULTW')
    SetWithdrawTarget,

    /// Displaced volume and motion status ('VOL')
    Volume,
}

impl Command {
    /// Every verb, in wire-table order
    pub const ALL: [Command; 17] = [
        Command::Version,
        Command::SetDiameter,
        Command::Diameter,
        Command::SetInfuseRate,
        Command::SetWithdrawRate,
        Command::InfuseRate,
        Command::WithdrawRate,
        Command::Run,
        Command::RunWithdraw,
        Command::Stop,
        Command::ClearInfuseTarget,
        Command::ClearWithdrawTarget,
        Command::ClearInfusedVolume,
        Command::ClearWithdrawnVolume,
        Command::SetInfuseTarget,
        Command::SetWithdrawTarget,
        Command::Volume,
    ];

    /// ASCII verb as sent on the wire
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Version => "VER",
            Command::SetDiameter => "MMD",
            Command::Diameter => "DIA",
            Command::SetInfuseRate => "ULM",
            Command::SetWithdrawRate => "ULMW",
            Command::InfuseRate => "RAT",
            Command::WithdrawRate => "RATW",
            Command::Run => "RUN",
            Command::RunWithdraw => "RUNW",
            Command::Stop => "STP",
            Command::ClearInfuseTarget => "CLT",
            Command::ClearWithdrawTarget => "CLTW",
            Command::ClearInfusedVolume => "CLV",
            Command::ClearWithdrawnVolume => "CLVW",
            Command::SetInfuseTarget => "ULT",
            Command::SetWithdrawTarget => "ULTW",
            Command::Volume => "VOL",
        }
    }

    /// Look up a verb received on the wire
    pub fn from_verb(verb: &str) -> Option<Command> {
        Command::ALL.iter().copied().find(|c| c.verb() == verb)
    }

    /// Whether the verb carries a numeric parameter
    pub fn takes_param(&self) -> bool {
        matches!(
            self,
            Command::SetDiameter
                | Command::SetInfuseRate
                | Command::SetWithdrawRate
                | Command::SetInfuseTarget
                | Command::SetWithdrawTarget
        )
    }

    /// Fixed reply length in bytes, for verbs read with an exact-length read
    pub fn reply_len(&self) -> Option<usize> {
        match self {
            Command::Version => Some(17),
            Command::Diameter => Some(15),
            _ => None,
        }
    }

    /// Whether a missing reply is an error. `STP` may go unacknowledged.
    pub fn waits_for_reply(&self) -> bool {
        !matches!(self, Command::Stop)
    }

    /// Command text without address or terminator, e.g. `MMD 4.61`
    pub fn text(&self, param: Option<&str>) -> String {
        match param {
            Some(p) => format!("{} {}", self.verb(), p),
            None => self.verb().to_string(),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.verb())
    }
}

/// Build a wire frame: two-digit address, command text, carriage return
pub fn frame(address: u8, command: &str) -> Vec<u8> {
    format!("{:02}{}\r", address, command).into_bytes()
}
