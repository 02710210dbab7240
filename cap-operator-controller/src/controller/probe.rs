// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use k8s_openapi::api::core::v1::{ExecAction, HTTPGetAction, Probe, TCPSocketAction};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use cap_operator_common::config::ControllerConfig;

use crate::crd::v1alpha1::deployable::DeployableContainer;

const DEFAULT_STARTUP_SECONDS: u32 = 120;
const PROBE_PERIOD_SECONDS: i32 = 10;
const STARTUP_FAILURE_THRESHOLD: i32 = 11;
const LIVENESS_DELAY_FACTOR: f64 = 1.2;

/// Timing parameters of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTiming {
    pub initial_delay_seconds: Option<i32>,
    pub period_seconds: i32,
    pub failure_threshold: i32,
    pub timeout_seconds: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSchedule {
    pub startup: Option<ProbeTiming>,
    pub readiness: ProbeTiming,
    pub liveness: ProbeTiming,
}

/// The probes of one container, all absent when it declares nothing to check
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerProbes {
    pub startup: Option<Probe>,
    pub readiness: Option<Probe>,
    pub liveness: Option<Probe>,
}

/// Derives probe timings from the time a container is allowed to take to start
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeTimingPolicy {
    pub startup_probes_supported: bool,
    pub allowed_failures: u32,
    pub timeout_adjustment_ratio: f64,
}

impl ProbeTimingPolicy {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            startup_probes_supported: config.startup_probes_supported,
            allowed_failures: config.allowed_probe_failures,
            timeout_adjustment_ratio: config.timeout_adjustment_ratio,
        }
    }

    /// Startup budget in seconds, the declared maximum (120 when omitted) scaled by the
    /// timeout adjustment ratio
    pub fn startup_budget(&self, declared_seconds: Option<u32>) -> i32 {
        let declared = declared_seconds.unwrap_or(DEFAULT_STARTUP_SECONDS) as f64;
        ((declared * self.timeout_adjustment_ratio).round() as i32).max(1)
    }

    pub fn schedule(&self, declared_seconds: Option<u32>) -> ProbeSchedule {
        let budget = self.startup_budget(declared_seconds);

        if self.startup_probes_supported {
            // Eleven periods of a tenth of the budget tolerate slightly more than the budget
            return ProbeSchedule {
                startup: Some(ProbeTiming {
                    initial_delay_seconds: None,
                    period_seconds: divide(budget, 10),
                    failure_threshold: STARTUP_FAILURE_THRESHOLD,
                    timeout_seconds: 3,
                }),
                readiness: ProbeTiming {
                    initial_delay_seconds: None,
                    period_seconds: PROBE_PERIOD_SECONDS,
                    failure_threshold: 1,
                    timeout_seconds: 3,
                },
                liveness: ProbeTiming {
                    initial_delay_seconds: None,
                    period_seconds: PROBE_PERIOD_SECONDS,
                    failure_threshold: 1,
                    timeout_seconds: 5,
                },
            };
        }

        let allowed_failures = self.allowed_failures.max(2) as i32;
        let readiness_period = divide(budget, allowed_failures);
        ProbeSchedule {
            startup: None,
            readiness: ProbeTiming {
                initial_delay_seconds: Some(readiness_period),
                period_seconds: readiness_period,
                failure_threshold: allowed_failures - 1,
                timeout_seconds: 3,
            },
            liveness: ProbeTiming {
                initial_delay_seconds: Some((budget as f64 * LIVENESS_DELAY_FACTOR).round() as i32),
                period_seconds: PROBE_PERIOD_SECONDS,
                failure_threshold: 1,
                timeout_seconds: 5,
            },
        }
    }

    /// Build the probes of a container. The check is the declared health command, else an
    /// HTTP GET of the declared path, else a TCP connect to the primary port.
    pub fn probes(&self, container: &DeployableContainer) -> ContainerProbes {
        let Some(check) = health_check(container) else {
            return ContainerProbes::default();
        };
        let schedule = self.schedule(container.maximum_startup_time_seconds);

        ContainerProbes {
            startup: schedule.startup.map(|timing| probe(&check, timing)),
            readiness: Some(probe(&check, schedule.readiness)),
            liveness: Some(probe(&check, schedule.liveness)),
        }
    }
}

fn divide(seconds: i32, parts: i32) -> i32 {
    ((seconds as f64 / parts as f64).round() as i32).max(1)
}

fn health_check(container: &DeployableContainer) -> Option<Probe> {
    let declared = container.health_check.as_ref();

    if let Some(command) = declared.and_then(|check| check.command.clone()) {
        return Some(Probe { exec: Some(ExecAction { command: Some(command) }), ..Default::default() });
    }

    let port = container.primary_port?;
    match declared.and_then(|check| check.http_path.clone()) {
        Some(path) => Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path),
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            ..Default::default()
        }),
        None => Some(Probe {
            tcp_socket: Some(TCPSocketAction { port: IntOrString::Int(port), ..Default::default() }),
            ..Default::default()
        }),
    }
}

fn probe(check: &Probe, timing: ProbeTiming) -> Probe {
    Probe {
        initial_delay_seconds: timing.initial_delay_seconds,
        period_seconds: Some(timing.period_seconds),
        failure_threshold: Some(timing.failure_threshold),
        timeout_seconds: Some(timing.timeout_seconds),
        ..check.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::v1alpha1::deployable::HealthCheckSpec;

    fn policy(startup_probes_supported: bool) -> ProbeTimingPolicy {
        ProbeTimingPolicy { startup_probes_supported, allowed_failures: 6, timeout_adjustment_ratio: 1.0 }
    }

    #[test]
    fn without_startup_probes() {
        let schedule = policy(false).schedule(Some(120));

        assert_eq!(schedule.startup, None);
        assert_eq!(schedule.readiness.initial_delay_seconds, Some(20));
        assert_eq!(schedule.readiness.period_seconds, 20);
        assert_eq!(schedule.readiness.failure_threshold, 5);
        assert_eq!(schedule.liveness.initial_delay_seconds, Some(144));
        assert_eq!(schedule.liveness.period_seconds, 10);
        assert_eq!(schedule.liveness.failure_threshold, 1);
    }

    #[test]
    fn with_startup_probes() {
        let schedule = policy(true).schedule(None);
        let startup = schedule.startup.unwrap();

        assert_eq!((startup.period_seconds, startup.failure_threshold), (12, 11));
        assert_eq!(schedule.readiness.initial_delay_seconds, None);
        assert_eq!((schedule.readiness.period_seconds, schedule.readiness.failure_threshold), (10, 1));
        assert_eq!(schedule.liveness.initial_delay_seconds, None);
        assert_eq!((schedule.liveness.period_seconds, schedule.liveness.failure_threshold), (10, 1));
    }

    #[test]
    fn budget_is_scaled_by_the_adjustment_ratio() {
        let policy = ProbeTimingPolicy { timeout_adjustment_ratio: 2.5, ..policy(false) };

        assert_eq!(policy.startup_budget(Some(60)), 150);
        assert_eq!(policy.schedule(Some(60)).readiness.period_seconds, 25);
        assert_eq!(policy.schedule(Some(60)).liveness.initial_delay_seconds, Some(180));
    }

    #[test]
    fn timeouts_stay_between_three_and_five_seconds() {
        for supported in [true, false] {
            let schedule = policy(supported).schedule(Some(600));
            let timings = schedule.startup.into_iter().chain([schedule.readiness, schedule.liveness]);
            assert!(timings.into_iter().all(|timing| (3..=5).contains(&timing.timeout_seconds)));
        }
    }

    #[test]
    fn health_check_priority() {
        let mut container = DeployableContainer {
            name: "web".to_string(),
            primary_port: Some(8080),
            health_check: Some(HealthCheckSpec {
                command: Some(vec!["/bin/healthy".to_string()]),
                http_path: Some("/health".to_string()),
            }),
            ..Default::default()
        };
        let readiness = policy(true).probes(&container).readiness.unwrap();
        assert!(readiness.exec.is_some() && readiness.http_get.is_none());

        container.health_check.as_mut().unwrap().command = None;
        let readiness = policy(true).probes(&container).readiness.unwrap();
        assert_eq!(readiness.http_get.unwrap().path.as_deref(), Some("/health"));

        container.health_check = None;
        let readiness = policy(true).probes(&container).readiness.unwrap();
        assert_eq!(readiness.tcp_socket.unwrap().port, IntOrString::Int(8080));

        container.primary_port = None;
        assert_eq!(policy(true).probes(&container), ContainerProbes::default());
    }
}
