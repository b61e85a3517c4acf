//! Inference provider selection
//!
//! Walks the execution providers in priority order (CUDA > DirectML > ROCm > CPU)
//! and only trusts a GPU provider after a verification probe reports that the GPU
//! provider actually executed. Probes run on their own thread under a time budget;
//! errors, panics and timeouts all count as "not confirmed". CPU is never probed
//! and is the terminal fallback, so selection cannot fail.

use crate::error::{PipelineError, Result};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Execution backend for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKind {
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// DirectML (Windows GPU)
    DirectMl,
    /// AMD ROCm GPU acceleration
    Rocm,
    /// CPU execution (always available)
    Cpu,
}

impl ProviderKind {
    /// All providers in priority order
    pub const ALL: [Self; 4] = [Self::Cuda, Self::DirectMl, Self::Rocm, Self::Cpu];

    /// GPU-class providers in priority order
    pub const GPU_PRIORITY: [Self; 3] = [Self::Cuda, Self::DirectMl, Self::Rocm];

    /// Position in the priority order (0 = most preferred)
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Cuda => 0,
            Self::DirectMl => 1,
            Self::Rocm => 2,
            Self::Cpu => 3,
        }
    }

    /// Name used by ONNX Runtime
    #[must_use]
    pub fn ort_name(self) -> &'static str {
        match self {
            Self::Cuda => "CUDAExecutionProvider",
            Self::DirectMl => "DmlExecutionProvider",
            Self::Rocm => "ROCMExecutionProvider",
            Self::Cpu => "CPUExecutionProvider",
        }
    }

    /// Parse an ONNX Runtime provider name
    #[must_use]
    pub fn from_ort_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.ort_name() == name)
    }

    #[must_use]
    pub fn is_gpu(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::DirectMl => write!(f, "directml"),
            Self::Rocm => write!(f, "rocm"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cuda" => Ok(Self::Cuda),
            "directml" | "dml" => Ok(Self::DirectMl),
            "rocm" => Ok(Self::Rocm),
            "cpu" => Ok(Self::Cpu),
            other => Self::from_ort_name(s).ok_or_else(|| {
                PipelineError::invalid_config(format!(
                    "Unknown execution provider '{other}'. Valid options: cpu, cuda, directml, rocm"
                ))
            }),
        }
    }
}

/// A provider together with its priority rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderCandidate {
    pub kind: ProviderKind,
    pub priority_rank: u8,
}

impl ProviderCandidate {
    #[must_use]
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            priority_rank: kind.rank(),
        }
    }

    #[must_use]
    pub fn cpu() -> Self {
        Self::new(ProviderKind::Cpu)
    }

    /// ONNX Runtime name of the provider
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind.ort_name()
    }
}

/// What a verification probe observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    /// Provider the probe asked for
    pub requested: ProviderKind,
    /// Provider that actually executed the probe
    pub active: ProviderKind,
    pub elapsed: Duration,
}

/// Backend hooks used by the selector
pub trait ProviderProbe: Send + Sync {
    /// Providers the runtime reports as available, in any order
    fn available_providers(&self) -> Vec<ProviderKind>;

    /// Build a session on `kind`, run a trivial inference and report which provider ran it
    ///
    /// # Errors
    /// - Session construction or the probe inference failed
    fn verify(&self, kind: ProviderKind, budget: Duration) -> Result<ProbeReport>;
}

/// Probe for builds without an accelerated runtime: only CPU is available
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuOnlyProbe;

impl ProviderProbe for CpuOnlyProbe {
    fn available_providers(&self) -> Vec<ProviderKind> {
        vec![ProviderKind::Cpu]
    }

    fn verify(&self, kind: ProviderKind, _budget: Duration) -> Result<ProbeReport> {
        Ok(ProbeReport {
            requested: kind,
            active: ProviderKind::Cpu,
            elapsed: Duration::ZERO,
        })
    }
}

/// Why a GPU candidate was not used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// Runtime does not report the provider
    Absent,
    /// Probe ran, but on a different provider
    Unconfirmed { active: ProviderKind },
    /// Probe returned an error or panicked
    ProbeFailed(String),
    /// Probe did not answer within the budget
    TimedOut(Duration),
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "not reported by the runtime"),
            Self::Unconfirmed { active } => write!(f, "probe executed on {active}"),
            Self::ProbeFailed(reason) => write!(f, "probe failed: {reason}"),
            Self::TimedOut(budget) => write!(f, "probe exceeded {:.1}s budget", budget.as_secs_f64()),
        }
    }
}

/// A rejected candidate and the reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRejection {
    pub kind: ProviderKind,
    pub reason: RejectionReason,
}

/// States of the selection state machine, recorded in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Unprobed,
    ProbingCandidate(ProviderKind),
    Confirmed(ProviderKind),
    Rejected(ProviderKind),
    CpuFallback,
}

/// Provider policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderPreference {
    /// Probe GPU providers in priority order, then CPU
    #[default]
    Auto,
    /// Only consider this provider (CPU skips probing); CPU remains the fallback
    Force(ProviderKind),
}

impl fmt::Display for ProviderPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Force(kind) => write!(f, "{kind}"),
        }
    }
}

impl FromStr for ProviderPreference {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            s.parse().map(Self::Force)
        }
    }
}

/// Result of provider selection, including every rejection on the way
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub candidate: ProviderCandidate,
    pub rejections: Vec<ProviderRejection>,
    pub transitions: Vec<ProbeState>,
    pub probes_run: usize,
}

impl ProviderSelection {
    /// Whether selection ended on the CPU fallback
    #[must_use]
    pub fn is_cpu_fallback(&self) -> bool {
        self.transitions.last() == Some(&ProbeState::CpuFallback)
    }
}

/// Chooses the execution provider for a batch
#[derive(Clone)]
pub struct ProviderSelector {
    probe: Arc<dyn ProviderProbe>,
    budget: Duration,
    preference: ProviderPreference,
}

impl fmt::Debug for ProviderSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSelector")
            .field("budget", &self.budget)
            .field("preference", &self.preference)
            .finish_non_exhaustive()
    }
}

impl ProviderSelector {
    #[must_use]
    pub fn new(probe: Arc<dyn ProviderProbe>) -> Self {
        Self {
            probe,
            budget: crate::config::DEFAULT_PROBE_BUDGET,
            preference: ProviderPreference::Auto,
        }
    }

    #[must_use]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    #[must_use]
    pub fn with_preference(mut self, preference: ProviderPreference) -> Self {
        self.preference = preference;
        self
    }

    /// Providers reported by the runtime, in priority order
    #[must_use]
    pub fn available(&self) -> Vec<ProviderKind> {
        let mut kinds = self.probe.available_providers();
        kinds.sort_by_key(|kind| kind.rank());
        kinds.dedup();
        kinds
    }

    /// Choose the provider to use
    #[must_use]
    pub fn select_provider(&self) -> ProviderCandidate {
        self.select().candidate
    }

    /// Choose the provider and report every rejection
    #[must_use]
    pub fn select(&self) -> ProviderSelection {
        let _span = tracing::info_span!("provider_selection", preference = %self.preference).entered();
        let available = self.available();
        let candidates: Vec<ProviderKind> = match self.preference {
            ProviderPreference::Auto => ProviderKind::GPU_PRIORITY.to_vec(),
            ProviderPreference::Force(ProviderKind::Cpu) => Vec::new(),
            ProviderPreference::Force(kind) => vec![kind],
        };

        let mut selection = ProviderSelection {
            candidate: ProviderCandidate::cpu(),
            rejections: Vec::new(),
            transitions: vec![ProbeState::Unprobed],
            probes_run: 0,
        };

        for kind in candidates {
            if !available.contains(&kind) {
                tracing::debug!(provider = %kind, "provider absent");
                selection.rejections.push(ProviderRejection {
                    kind,
                    reason: RejectionReason::Absent,
                });
                continue;
            }

            selection.transitions.push(ProbeState::ProbingCandidate(kind));
            selection.probes_run += 1;
            match self.run_probe(kind) {
                Ok(report) => {
                    tracing::info!(
                        provider = kind.ort_name(),
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "provider confirmed"
                    );
                    selection.transitions.push(ProbeState::Confirmed(kind));
                    selection.candidate = ProviderCandidate::new(kind);
                    return selection;
                },
                Err(reason) => {
                    tracing::warn!(provider = kind.ort_name(), %reason, "provider rejected");
                    selection.transitions.push(ProbeState::Rejected(kind));
                    selection.rejections.push(ProviderRejection { kind, reason });
                },
            }
        }

        tracing::info!(
            rejected = selection.rejections.len(),
            "using CPUExecutionProvider"
        );
        selection.transitions.push(ProbeState::CpuFallback);
        selection
    }

    fn run_probe(&self, kind: ProviderKind) -> std::result::Result<ProbeReport, RejectionReason> {
        let (tx, rx) = mpsc::channel();
        let probe = Arc::clone(&self.probe);
        let budget = self.budget;
        let spawned = thread::Builder::new()
            .name(format!("probe-{kind}"))
            .spawn(move || {
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| probe.verify(kind, budget)));
                // Receiver is gone after a timeout; nothing left to report to
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            return Err(RejectionReason::ProbeFailed(format!(
                "could not start probe thread: {e}"
            )));
        }

        match rx.recv_timeout(budget) {
            Ok(Ok(Ok(report))) if report.active == kind => Ok(report),
            Ok(Ok(Ok(report))) => Err(RejectionReason::Unconfirmed {
                active: report.active,
            }),
            Ok(Ok(Err(e))) => Err(RejectionReason::ProbeFailed(e.to_string())),
            Ok(Err(_)) => Err(RejectionReason::ProbeFailed("probe panicked".to_string())),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    provider = %kind,
                    "probe thread abandoned after timeout; it is not killed"
                );
                Err(RejectionReason::TimedOut(budget))
            },
            Err(RecvTimeoutError::Disconnected) => Err(RejectionReason::ProbeFailed(
                "probe worker exited without reporting".to_string(),
            )),
        }
    }
}
