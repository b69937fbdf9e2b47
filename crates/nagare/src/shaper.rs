//! Drives an external link shaper (tc/netem style) from a text profile.
//!
//! A profile is a sequence of `rate <kbps>` and `wait <seconds>` lines; the
//! loop applies them in order, wrapping from the last line back to the first.
//! Pausing the stream freezes progress in place, without skipping or
//! repeating directives.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::process::Command;

use crate::{
    error::{NagareError, NagareResult},
    server::ShapingState,
};

pub struct ShaperConfig {
    /// Profile file: one `rate <kbps>` or `wait <seconds>` directive per line.
    pub profile: PathBuf,
    /// Command that removes any applied throttle. No arguments.
    pub reset_command: PathBuf,
    /// Command that applies a throttle. One argument: Mbps with one decimal.
    pub throttle_command: PathBuf,
}

pub struct Shaper {
    config: ShaperConfig,
    state: Arc<ShapingState>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Directive {
    /// Throttle the link to this many kbps.
    Rate(f64),
    Wait(Duration),
}

const WAIT_TICK: Duration = Duration::from_millis(10);
const PAUSE_POLL: Duration = Duration::from_millis(50);
const INACTIVE_POLL: Duration = Duration::from_millis(100);

impl Shaper {
    pub fn new(config: ShaperConfig, state: Arc<ShapingState>) -> Self {
        Self { config, state }
    }

    /// Run the profile until a command fails. Returns immediately if the
    /// profile contains no recognized directives.
    pub async fn run(self) -> NagareResult<()> {
        let data = tokio::fs::read_to_string(&self.config.profile).await?;
        let directives = parse_profile(&data);
        if directives.is_empty() {
            return Ok(());
        }

        let mut index = 0;
        loop {
            if !self.state.is_streaming() {
                tokio::time::sleep(PAUSE_POLL).await;
                continue;
            }

            if self.state.tc_reset_requested() {
                tracing::info!("resetting link shaping");
                self.run_command(&self.config.reset_command, None).await?;
                self.state.set_tc_rate(0.0);
            }

            if !self.state.is_tc_active() {
                // Restart the profile once a viewer reactivates shaping.
                index = 0;
                tokio::time::sleep(INACTIVE_POLL).await;
                continue;
            }

            self.apply(directives[index]).await?;
            index = (index + 1) % directives.len();
        }
    }

    async fn apply(&self, directive: Directive) -> NagareResult<()> {
        match directive {
            Directive::Rate(kbps) => {
                let mbps = kbps / 1024.0;
                self.state.set_tc_rate(mbps);
                tracing::info!(kbps, mbps, "applying rate directive");
                self.run_command(&self.config.throttle_command, Some(format!("{mbps:.1}")))
                    .await?;
            }
            Directive::Wait(total) => {
                tracing::debug!(?total, "waiting");
                let mut elapsed = Duration::ZERO;
                while elapsed < total {
                    // A paused stream holds the wait where it is.
                    if self.state.is_streaming() {
                        elapsed += WAIT_TICK;
                    }
                    tokio::time::sleep(WAIT_TICK).await;
                }
            }
        }

        Ok(())
    }

    async fn run_command(&self, program: &Path, arg: Option<String>) -> NagareResult<()> {
        let mut command = Command::new(program);
        if let Some(arg) = &arg {
            command.arg(arg);
        }

        let output = command
            .output()
            .await
            .map_err(|err| NagareError::ShaperCommand(format!("{}: {err}", program.display())))?;

        if !output.status.success() {
            return Err(NagareError::ShaperCommand(format!(
                "{} exited with {}",
                program.display(),
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            tracing::info!(command = %program.display(), output = %stdout.trim(), "shaper command");
        }

        Ok(())
    }
}

/// Unrecognized or short lines are skipped.
fn parse_profile(data: &str) -> Vec<Directive> {
    data.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Directive> {
    let mut parts = line.split_whitespace();
    let (action, value) = (parts.next()?, parts.next()?);

    match action {
        "rate" => value.parse().ok().map(Directive::Rate),
        "wait" => {
            let seconds: f64 = value.parse().ok()?;
            (seconds > 0.0).then(|| Directive::Wait(Duration::from_secs_f64(seconds)))
        }
        _ => None,
    }
}
