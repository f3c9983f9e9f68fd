//! Traffic shaping via the kernel queueing discipline
//!
//! Applies one aggregate delay/bandwidth/loss profile to the interface
//! carrying experiment traffic. Apply always clears first: the kernel
//! rejects a second root install, and the orchestrator must not depend on
//! knowing whether anything is installed. Hosts without the netem module
//! fail loudly; a run is skipped, never silently unshaped.

use std::time::Duration;

use pqb_core::config::TopologyProfile;
use pqb_core::error::ShapingError;

use crate::transport::{ExecOutput, HostTransport};

/// Currently-installed shaping on an interface
#[derive(Debug, Clone, PartialEq)]
pub enum ShapingState {
    /// No discipline installed
    None,
    /// A netem discipline with these parameters
    Shaped {
        delay_ms: Option<f64>,
        loss_percent: Option<f64>,
        rate_mbps: Option<f64>,
    },
}

/// Per-host traffic shaping over a Host Session
pub struct TrafficShaper {
    interface: String,
    command_timeout: Duration,
}

impl TrafficShaper {
    /// Create a shaper for one interface
    pub fn new(interface: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            interface: interface.into(),
            command_timeout,
        }
    }

    /// Install a profile. Idempotent: any existing discipline is cleared
    /// first, and a failed install is cleared and retried once.
    pub async fn apply(
        &self,
        transport: &dyn HostTransport,
        profile: &TopologyProfile,
    ) -> Result<(), ShapingError> {
        self.clear(transport).await?;

        match self.try_install(transport, profile).await? {
            InstallResult::Ok => return Ok(()),
            InstallResult::Unsupported(detail) => {
                return Err(ShapingError::Unsupported {
                    host: transport.host().to_string(),
                    detail,
                });
            }
            InstallResult::Failed(detail) => {
                tracing::warn!(
                    "Shaping install on {} failed ({}), clearing and retrying once",
                    transport.host(),
                    detail
                );
            }
        }

        self.clear(transport).await?;
        match self.try_install(transport, profile).await? {
            InstallResult::Ok => Ok(()),
            InstallResult::Unsupported(detail) => Err(ShapingError::Unsupported {
                host: transport.host().to_string(),
                detail,
            }),
            InstallResult::Failed(detail) => Err(ShapingError::Failed {
                host: transport.host().to_string(),
                detail,
            }),
        }
    }

    /// Report the currently-installed profile
    pub async fn verify(
        &self,
        transport: &dyn HostTransport,
    ) -> Result<ShapingState, ShapingError> {
        let command = format!("tc qdisc show dev {}", self.interface);
        let out = transport.exec(&command, self.command_timeout).await?;
        if !out.success() {
            return Err(ShapingError::Failed {
                host: transport.host().to_string(),
                detail: format!("tc qdisc show exited {}: {}", out.exit_code, out.stderr),
            });
        }
        Ok(parse_qdisc_show(&out.stdout))
    }

    /// Remove any shaping. Succeeds when nothing is installed.
    pub async fn clear(&self, transport: &dyn HostTransport) -> Result<(), ShapingError> {
        let command = format!("sudo -n tc qdisc del dev {} root", self.interface);
        let out = transport.exec(&command, self.command_timeout).await?;
        if out.success() || nothing_installed(&out) {
            return Ok(());
        }
        if let Some(detail) = unsupported_detail(&out) {
            return Err(ShapingError::Unsupported {
                host: transport.host().to_string(),
                detail,
            });
        }
        Err(ShapingError::Failed {
            host: transport.host().to_string(),
            detail: format!("tc qdisc del exited {}: {}", out.exit_code, out.stderr),
        })
    }

    async fn try_install(
        &self,
        transport: &dyn HostTransport,
        profile: &TopologyProfile,
    ) -> Result<InstallResult, ShapingError> {
        let command = format!(
            "sudo -n tc qdisc add dev {} root netem {}",
            self.interface,
            netem_args(profile)
        );
        let out = transport.exec(&command, self.command_timeout).await?;
        if out.success() {
            return Ok(InstallResult::Ok);
        }
        if let Some(detail) = unsupported_detail(&out) {
            return Ok(InstallResult::Unsupported(detail));
        }
        Ok(InstallResult::Failed(format!(
            "exit {}: {}",
            out.exit_code,
            out.stderr.trim()
        )))
    }
}

enum InstallResult {
    Ok,
    Unsupported(String),
    Failed(String),
}

/// Render the netem parameter list for a profile
fn netem_args(profile: &TopologyProfile) -> String {
    let mut args = match profile.jitter_ms {
        Some(jitter) => format!("delay {}ms {}ms", fmt_num(profile.delay_ms), fmt_num(jitter)),
        None => format!("delay {}ms", fmt_num(profile.delay_ms)),
    };
    args.push_str(&format!(" loss {}%", fmt_num(profile.loss_percent)));
    args.push_str(&format!(" rate {}mbit", fmt_num(profile.bandwidth_mbps)));
    args
}

/// Format a tc numeric argument without a trailing `.0`
fn fmt_num(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as u64)
    } else {
        format!("{}", value)
    }
}

/// The delete failed because no discipline was installed
fn nothing_installed(out: &ExecOutput) -> bool {
    out.stderr.contains("No such file or directory")
        || out.stderr.contains("Cannot delete qdisc with handle of zero")
        || out.stderr.contains("Invalid handle")
}

/// Detect a kernel/toolchain that cannot shape at all
fn unsupported_detail(out: &ExecOutput) -> Option<String> {
    const MARKERS: [&str; 4] = [
        "Unknown qdisc",
        "Specified qdisc not found",
        "Operation not supported",
        "tc: command not found",
    ];
    MARKERS
        .iter()
        .find(|marker| out.stderr.contains(*marker))
        .map(|_| out.stderr.trim().to_string())
}

/// Parse `tc qdisc show dev <if>` output into a [`ShapingState`]
fn parse_qdisc_show(output: &str) -> ShapingState {
    let netem_line = match output.lines().find(|line| line.contains("netem")) {
        Some(line) => line,
        None => return ShapingState::None,
    };

    ShapingState::Shaped {
        delay_ms: extract_suffixed(netem_line, "delay", "ms"),
        loss_percent: extract_suffixed(netem_line, "loss", "%"),
        rate_mbps: extract_rate_mbps(netem_line),
    }
}

/// Extract the numeric value following `keyword`, stripping `suffix`
fn extract_suffixed(line: &str, keyword: &str, suffix: &str) -> Option<f64> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let pos = tokens.iter().position(|t| *t == keyword)?;
    let value = tokens.get(pos + 1)?;
    value.strip_suffix(suffix)?.parse().ok()
}

/// tc prints rate as `60Mbit`, `1Gbit`, or `500Kbit`
fn extract_rate_mbps(line: &str) -> Option<f64> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let pos = tokens.iter().position(|t| *t == "rate")?;
    let value = tokens.get(pos + 1)?;
    if let Some(mbit) = value.strip_suffix("Mbit") {
        return mbit.parse().ok();
    }
    if let Some(gbit) = value.strip_suffix("Gbit") {
        return gbit.parse::<f64>().ok().map(|g| g * 1000.0);
    }
    if let Some(kbit) = value.strip_suffix("Kbit") {
        return kbit.parse::<f64>().ok().map(|k| k / 1000.0);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pqb_core::types::TopologyId;

    fn profile() -> TopologyProfile {
        TopologyProfile {
            id: TopologyId::new(1),
            delay_ms: 5.0,
            bandwidth_mbps: 60.0,
            loss_percent: 3.0,
            jitter_ms: None,
        }
    }

    #[test]
    fn test_netem_args() {
        assert_eq!(netem_args(&profile()), "delay 5ms loss 3% rate 60mbit");
    }

    #[test]
    fn test_netem_args_with_jitter() {
        let mut p = profile();
        p.jitter_ms = Some(1.5);
        assert_eq!(netem_args(&p), "delay 5ms 1.5ms loss 3% rate 60mbit");
    }

    #[test]
    fn test_parse_qdisc_show_netem() {
        let output =
            "qdisc netem 8001: root refcnt 2 limit 1000 delay 5ms loss 3% rate 60Mbit\n";
        assert_eq!(
            parse_qdisc_show(output),
            ShapingState::Shaped {
                delay_ms: Some(5.0),
                loss_percent: Some(3.0),
                rate_mbps: Some(60.0),
            }
        );
    }

    #[test]
    fn test_parse_qdisc_show_default_qdisc() {
        let output = "qdisc fq_codel 0: root refcnt 2 limit 10240p flows 1024\n";
        assert_eq!(parse_qdisc_show(output), ShapingState::None);
    }

    #[test]
    fn test_parse_qdisc_show_gbit_rate() {
        let output = "qdisc netem 8001: root refcnt 2 delay 1ms loss 0% rate 1Gbit\n";
        match parse_qdisc_show(output) {
            ShapingState::Shaped { rate_mbps, .. } => assert_eq!(rate_mbps, Some(1000.0)),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_detection() {
        let out = ExecOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "Error: Specified qdisc not found.\n".to_string(),
        };
        assert!(unsupported_detail(&out).is_some());

        let out = ExecOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "RTNETLINK answers: Invalid argument\n".to_string(),
        };
        assert!(unsupported_detail(&out).is_none());
    }

    #[test]
    fn test_nothing_installed_detection() {
        let out = ExecOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "RTNETLINK answers: No such file or directory\n".to_string(),
        };
        assert!(nothing_installed(&out));
    }

    mod behavior {
        use super::*;
        use crate::testing::{Scripted, ScriptedTransport};
        use std::time::Duration;

        fn shaper() -> TrafficShaper {
            TrafficShaper::new("eth0", Duration::from_secs(1))
        }

        #[tokio::test]
        async fn test_apply_verify_clear_round_trip() {
            let transport = ScriptedTransport::new("pi-01");
            let shaper = shaper();

            shaper.apply(&transport, &profile()).await.unwrap();
            assert_eq!(
                shaper.verify(&transport).await.unwrap(),
                ShapingState::Shaped {
                    delay_ms: Some(5.0),
                    loss_percent: Some(3.0),
                    rate_mbps: Some(60.0),
                }
            );

            shaper.clear(&transport).await.unwrap();
            assert_eq!(shaper.verify(&transport).await.unwrap(), ShapingState::None);

            // Clear with nothing installed still succeeds
            shaper.clear(&transport).await.unwrap();
        }

        #[tokio::test]
        async fn test_apply_is_idempotent() {
            let transport = ScriptedTransport::new("pi-01");
            let shaper = shaper();

            shaper.apply(&transport, &profile()).await.unwrap();
            shaper.apply(&transport, &profile()).await.unwrap();
            assert!(transport.is_shaped());
        }

        #[tokio::test]
        async fn test_apply_retries_once_after_failure() {
            let transport = ScriptedTransport::new("pi-01");
            transport.on_n(
                "tc qdisc add",
                Scripted::fail(2, "RTNETLINK answers: Invalid argument\n"),
                1,
            );

            shaper().apply(&transport, &profile()).await.unwrap();
            assert!(transport.is_shaped());
        }

        #[tokio::test]
        async fn test_apply_surfaces_unsupported_kernel() {
            let transport = ScriptedTransport::new("pi-01");
            transport.on(
                "tc qdisc add",
                Scripted::fail(2, "Error: Specified qdisc not found.\n"),
            );

            let err = shaper().apply(&transport, &profile()).await;
            assert!(matches!(err, Err(ShapingError::Unsupported { .. })));
        }
    }
}
