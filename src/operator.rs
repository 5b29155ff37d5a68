//! Line-oriented operator commands.
//!
//! The interactive console reads one command per line:
//!
//! | Command                 | Action                                  |
//! |-------------------------|-----------------------------------------|
//! | `jog fwd\|back [fast]`  | jog one step (fast = `fast_jog_factor`×) |
//! | `home`                  | go to the home position                 |
//! | `goto <deg>`            | jump to an absolute angle               |
//! | `sethome`               | make the current angle the new home     |
//! | `setpoint <mW>`         | change the setpoint                     |
//! | `jogsize <deg>`         | change the jog size                     |
//! | `zero`                  | start zero-offset calibration           |
//! | `seek`                  | start seeking the setpoint              |
//! | `cancel`                | stop a seek or calibration              |
//! | `findmin`               | sweep for the transmission minimum      |
//! | `optical`               | connect/disconnect the microscope       |
//! | `status`                | print the latest telemetry              |
//! | `help`                  | list commands                           |
//! | `quit`                  | shut down and exit                      |

use crate::app::{JogSpeed, PolarizerApp};
use crate::error::{AppResult, PolarizerError};
use crate::hardware::JogDirection;
use crate::scheduler::{ControllerMode, Telemetry};
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;

/// Help text for the console.
pub const HELP: &str = "\
commands:
  jog fwd|back [fast]   jog one step
  home                  go to the home position
  goto <deg>            jump to an absolute angle
  sethome               make the current angle the new home
  setpoint <mW>         change the setpoint
  jogsize <deg>         change the jog size
  zero                  start zero-offset calibration
  seek                  start seeking the setpoint
  cancel                stop a seek or calibration
  findmin               sweep for the transmission minimum
  optical               connect/disconnect the microscope
  status                print the latest readings
  quit                  shut down and exit";

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    /// Jog one step
    Jog(JogDirection, JogSpeed),
    /// Go home
    Home,
    /// Jump to an angle (degrees)
    Goto(f64),
    /// Current angle becomes home
    SetHome,
    /// New setpoint (mW)
    Setpoint(f64),
    /// New jog size (degrees)
    JogSize(f64),
    /// Zero-offset calibration
    Zero,
    /// Seek the setpoint
    Seek,
    /// Cancel a seek or calibration
    Cancel,
    /// Minimum search
    FindMinimum,
    /// Toggle the optical context
    Optical,
    /// Print telemetry
    Status,
    /// Print the command list
    Help,
    /// Leave
    Quit,
}

/// Why a line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCommandError {
    /// Blank line
    #[error("empty command")]
    Empty,
    /// Unknown verb
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
    /// Missing or malformed argument
    #[error("usage: {0}")]
    Usage(&'static str),
}

fn number(arg: Option<&str>, usage: &'static str) -> Result<f64, ParseCommandError> {
    arg.and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or(ParseCommandError::Usage(usage))
}

impl FromStr for OperatorCommand {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(ParseCommandError::Empty)?.to_lowercase();
        let arg = words.next();

        let command = match verb.as_str() {
            "jog" => {
                const USAGE: &str = "jog fwd|back [fast]";
                let direction = arg
                    .and_then(|word| word.parse::<JogDirection>().ok())
                    .ok_or(ParseCommandError::Usage(USAGE))?;
                let speed = match words.next().map(str::to_lowercase).as_deref() {
                    None => JogSpeed::Normal,
                    Some("fast") => JogSpeed::Fast,
                    Some(_) => return Err(ParseCommandError::Usage(USAGE)),
                };
                OperatorCommand::Jog(direction, speed)
            }
            "home" => OperatorCommand::Home,
            "goto" => OperatorCommand::Goto(number(arg, "goto <deg>")?),
            "sethome" => OperatorCommand::SetHome,
            "setpoint" => OperatorCommand::Setpoint(number(arg, "setpoint <mW>")?),
            "jogsize" => OperatorCommand::JogSize(number(arg, "jogsize <deg>")?),
            "zero" => OperatorCommand::Zero,
            "seek" => OperatorCommand::Seek,
            "cancel" => OperatorCommand::Cancel,
            "findmin" => OperatorCommand::FindMinimum,
            "optical" => OperatorCommand::Optical,
            "status" => OperatorCommand::Status,
            "help" | "?" => OperatorCommand::Help,
            "quit" | "exit" => OperatorCommand::Quit,
            other => return Err(ParseCommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

/// One-line summary of the telemetry for the console.
pub fn describe(telemetry: &Telemetry) -> String {
    let mut line = String::new();
    match telemetry.angle_deg {
        Some(angle) => {
            let _ = write!(line, "angle {angle:.3}°");
        }
        None => line.push_str("angle ?"),
    }
    match &telemetry.reading {
        Some(reading) => {
            let _ = write!(
                line,
                ", power {:.4} mW, error {:+.4} mW",
                reading.corrected_mw, reading.error_mw
            );
        }
        None => line.push_str(", power ?"),
    }
    let _ = write!(line, ", setpoint {} mW", telemetry.setpoint_mw);
    if telemetry.mode == ControllerMode::ProportionalCorrecting {
        let _ = write!(
            line,
            ", seeking ({}, {} steps)",
            telemetry.controller_state, telemetry.steps_taken
        );
    }
    if telemetry.suspended {
        line.push_str(", sampling suspended");
    }
    if let Some(error) = &telemetry.last_error {
        let _ = write!(line, ", last error: {error}");
    }
    line
}

/// Decide whether the console survives a failed command.
///
/// Recoverable errors come back as text to show the operator; anything else (a stopped
/// scheduler, I/O failure) is returned so the session ends.
pub fn report_failure(err: PolarizerError) -> AppResult<String> {
    if err.can_recover() {
        Ok(format!("❌ {err}"))
    } else {
        Err(err)
    }
}

/// Run one command against the app and return text for the operator.
///
/// `Quit` is not handled here; the caller decides how to leave.
pub async fn execute(app: &PolarizerApp, command: OperatorCommand) -> AppResult<Option<String>> {
    let reply = match command {
        OperatorCommand::Jog(direction, speed) => {
            let angle = app.jog(direction, speed).await?;
            Some(format!("angle {angle:.3}°"))
        }
        OperatorCommand::Home => {
            app.go_home().await?;
            None
        }
        OperatorCommand::Goto(angle) => {
            app.jump_to_angle(angle).await?;
            None
        }
        OperatorCommand::SetHome => {
            app.set_current_as_home().await?;
            None
        }
        OperatorCommand::Setpoint(setpoint) => {
            app.set_setpoint(setpoint).await?;
            Some(format!("setpoint {setpoint} mW"))
        }
        OperatorCommand::JogSize(step) => {
            app.set_jog_size(step).await?;
            Some(format!("jog size {step}°"))
        }
        OperatorCommand::Zero => {
            // Progress arrives on the status board
            let _run = app.start_calibration().await?;
            None
        }
        OperatorCommand::Seek => {
            app.seek_setpoint(None).await?;
            None
        }
        OperatorCommand::Cancel => {
            let seek = app.cancel_seek().await?;
            let calibration = app.cancel_calibration().await;
            (!seek && !calibration).then(|| "nothing to cancel".to_string())
        }
        OperatorCommand::FindMinimum => {
            let report = app.find_minimum().await?;
            Some(format!(
                "minimum at sweep point {} ({} points), angle now {:.3}°",
                report.minimum_index,
                report.sweep.len(),
                report.final_angle
            ))
        }
        OperatorCommand::Optical => {
            let connected = app.toggle_optical().await?;
            Some(if connected { "optical: connected" } else { "optical: disconnected" }.to_string())
        }
        OperatorCommand::Status => Some(describe(&app.telemetry())),
        OperatorCommand::Help => Some(HELP.to_string()),
        OperatorCommand::Quit => None,
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exclusive::Operation;

    #[test]
    fn recoverable_failures_keep_the_console_open() {
        let busy = PolarizerError::StageBusy(Operation::MinimumSearch);
        assert_eq!(
            report_failure(busy).unwrap(),
            "❌ Stage is in use by the running minimum search"
        );
        assert!(report_failure(PolarizerError::unreachable("rotator", "timeout")).is_ok());
        assert!(matches!(
            report_failure(PolarizerError::SchedulerStopped),
            Err(PolarizerError::SchedulerStopped)
        ));
    }

    #[test]
    fn parses_jog_variants() {
        assert_eq!(
            "jog fwd".parse::<OperatorCommand>(),
            Ok(OperatorCommand::Jog(JogDirection::Forward, JogSpeed::Normal))
        );
        assert_eq!(
            "JOG back FAST".parse::<OperatorCommand>(),
            Ok(OperatorCommand::Jog(JogDirection::Backward, JogSpeed::Fast))
        );
        assert!(matches!(
            "jog up".parse::<OperatorCommand>(),
            Err(ParseCommandError::Usage(_))
        ));
        assert!(matches!(
            "jog fwd slowly".parse::<OperatorCommand>(),
            Err(ParseCommandError::Usage(_))
        ));
    }

    #[test]
    fn parses_numeric_arguments() {
        assert_eq!("goto 45.5".parse::<OperatorCommand>(), Ok(OperatorCommand::Goto(45.5)));
        assert_eq!("setpoint 5".parse::<OperatorCommand>(), Ok(OperatorCommand::Setpoint(5.0)));
        assert_eq!("jogsize 0.25".parse::<OperatorCommand>(), Ok(OperatorCommand::JogSize(0.25)));
        assert_eq!(
            "goto".parse::<OperatorCommand>(),
            Err(ParseCommandError::Usage("goto <deg>"))
        );
        assert!("setpoint NaN".parse::<OperatorCommand>().is_err());
    }

    #[test]
    fn parses_plain_verbs() {
        assert_eq!("  findmin ".parse::<OperatorCommand>(), Ok(OperatorCommand::FindMinimum));
        assert_eq!("exit".parse::<OperatorCommand>(), Ok(OperatorCommand::Quit));
        assert_eq!("".parse::<OperatorCommand>(), Err(ParseCommandError::Empty));
        assert_eq!(
            "dance".parse::<OperatorCommand>(),
            Err(ParseCommandError::Unknown("dance".to_string()))
        );
    }

    #[test]
    fn describe_mentions_seek_and_errors() {
        let telemetry = Telemetry {
            mode: ControllerMode::ProportionalCorrecting,
            setpoint_mw: 5.0,
            angle_deg: Some(12.0),
            steps_taken: 2,
            last_error: Some("sensor unplugged".to_string()),
            ..Telemetry::default()
        };
        let line = describe(&telemetry);
        assert!(line.starts_with("angle 12.000°"));
        assert!(line.contains("power ?"));
        assert!(line.contains("seeking (idle, 2 steps)"));
        assert!(line.contains("last error: sensor unplugged"));
    }
}
