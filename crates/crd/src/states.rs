use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Estados posibles de un JobRun
///
/// El controlador solo gestiona runs con agent `kubernetes`. `Scheduling` es
/// un estado de staging previo a `Triggered` y no se procesa aquí.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobRunState {
    #[default]
    Scheduling,
    Triggered,
    Pending,
    Success,
    Failure,
    Error,
    Aborted,
}

impl JobRunState {
    /// Valida si una transición de estado es válida según el State Machine del dominio
    ///
    /// Transiciones válidas:
    /// - Scheduling → Triggered
    /// - Triggered → Pending, Error, Aborted
    /// - Pending → Success, Failure, Error, Aborted, Triggered (revival tras perder el Pod)
    /// - Success, Failure, Error, Aborted → (terminal, sin transiciones salientes)
    pub fn can_transition_to(&self, new_state: &JobRunState) -> bool {
        match (self, new_state) {
            // Mismo estado - no es una transición válida
            (s, n) if s == n => false,

            (JobRunState::Scheduling, JobRunState::Triggered) => true,

            (JobRunState::Triggered, JobRunState::Pending) => true,
            (JobRunState::Triggered, JobRunState::Error) => true,
            (JobRunState::Triggered, JobRunState::Aborted) => true,

            (JobRunState::Pending, JobRunState::Success) => true,
            (JobRunState::Pending, JobRunState::Failure) => true,
            (JobRunState::Pending, JobRunState::Error) => true,
            (JobRunState::Pending, JobRunState::Aborted) => true,
            // Revival: el Pod desapareció y el run vuelve a la cola de arranque
            (JobRunState::Pending, JobRunState::Triggered) => true,

            // Todas las demás transiciones son inválidas
            _ => false,
        }
    }

    /// Retorna true si el estado es terminal (no se puede continuar)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobRunState::Success | JobRunState::Failure | JobRunState::Error | JobRunState::Aborted
        )
    }

    /// Retorna true si el run sigue vivo para el controlador
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobRunState::Triggered | JobRunState::Pending
        )
    }
}

impl fmt::Display for JobRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobRunState::Scheduling => write!(f, "scheduling"),
            JobRunState::Triggered => write!(f, "triggered"),
            JobRunState::Pending => write!(f, "pending"),
            JobRunState::Success => write!(f, "success"),
            JobRunState::Failure => write!(f, "failure"),
            JobRunState::Error => write!(f, "error"),
            JobRunState::Aborted => write!(f, "aborted"),
        }
    }
}

impl FromStr for JobRunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduling" => Ok(JobRunState::Scheduling),
            "triggered" => Ok(JobRunState::Triggered),
            "pending" => Ok(JobRunState::Pending),
            "success" => Ok(JobRunState::Success),
            "failure" => Ok(JobRunState::Failure),
            "error" => Ok(JobRunState::Error),
            "aborted" => Ok(JobRunState::Aborted),
            _ => Err(format!("Invalid JobRunState: {}", s)),
        }
    }
}

/// Tipo de job que dio origen al run
///
/// El controlador trata todos los tipos de forma uniforme; solo el
/// terminador de duplicados distingue `Presubmit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobRunType {
    Periodic,
    Presubmit,
    Postsubmit,
    Batch,
}

impl fmt::Display for JobRunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobRunType::Periodic => write!(f, "periodic"),
            JobRunType::Presubmit => write!(f, "presubmit"),
            JobRunType::Postsubmit => write!(f, "postsubmit"),
            JobRunType::Batch => write!(f, "batch"),
        }
    }
}

impl FromStr for JobRunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "periodic" => Ok(JobRunType::Periodic),
            "presubmit" => Ok(JobRunType::Presubmit),
            "postsubmit" => Ok(JobRunType::Postsubmit),
            "batch" => Ok(JobRunType::Batch),
            _ => Err(format!("Invalid JobRunType: {}", s)),
        }
    }
}

/// Agente encargado de ejecutar el run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionAgent {
    /// Ejecutado por este controlador como Pod en un cluster destino
    #[default]
    Kubernetes,
    /// Ejecutado por un sistema externo; el controlador lo ignora
    External,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_run_state_from_str() {
        assert_eq!(
            "triggered".parse::<JobRunState>().unwrap(),
            JobRunState::Triggered
        );
        assert_eq!(
            "pending".parse::<JobRunState>().unwrap(),
            JobRunState::Pending
        );
        assert_eq!(
            "success".parse::<JobRunState>().unwrap(),
            JobRunState::Success
        );
        assert_eq!(
            "failure".parse::<JobRunState>().unwrap(),
            JobRunState::Failure
        );
        assert_eq!("error".parse::<JobRunState>().unwrap(), JobRunState::Error);
        assert_eq!(
            "aborted".parse::<JobRunState>().unwrap(),
            JobRunState::Aborted
        );

        assert!("INVALID".parse::<JobRunState>().is_err());
    }

    #[test]
    fn test_job_run_state_transitions() {
        assert!(JobRunState::Scheduling.can_transition_to(&JobRunState::Triggered));
        assert!(JobRunState::Triggered.can_transition_to(&JobRunState::Pending));
        assert!(JobRunState::Triggered.can_transition_to(&JobRunState::Error));
        assert!(JobRunState::Triggered.can_transition_to(&JobRunState::Aborted));
        assert!(JobRunState::Pending.can_transition_to(&JobRunState::Success));
        assert!(JobRunState::Pending.can_transition_to(&JobRunState::Failure));
        assert!(JobRunState::Pending.can_transition_to(&JobRunState::Aborted));

        // Revival vuelve a Triggered
        assert!(JobRunState::Pending.can_transition_to(&JobRunState::Triggered));

        // Invalid transitions
        assert!(!JobRunState::Triggered.can_transition_to(&JobRunState::Success));
        assert!(!JobRunState::Success.can_transition_to(&JobRunState::Pending));
        assert!(!JobRunState::Aborted.can_transition_to(&JobRunState::Triggered));
        assert!(!JobRunState::Error.can_transition_to(&JobRunState::Error));
    }

    #[test]
    fn test_job_run_state_terminal() {
        assert!(!JobRunState::Scheduling.is_terminal());
        assert!(!JobRunState::Triggered.is_terminal());
        assert!(!JobRunState::Pending.is_terminal());
        assert!(JobRunState::Success.is_terminal());
        assert!(JobRunState::Failure.is_terminal());
        assert!(JobRunState::Error.is_terminal());
        assert!(JobRunState::Aborted.is_terminal());
    }

    #[test]
    fn test_job_run_state_active() {
        assert!(JobRunState::Triggered.is_active());
        assert!(JobRunState::Pending.is_active());
        assert!(!JobRunState::Scheduling.is_active());
        assert!(!JobRunState::Success.is_active());
        assert!(!JobRunState::Aborted.is_active());
    }

    #[test]
    fn test_job_run_state_serde_round_trip() {
        let json = serde_json::to_string(&JobRunState::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
        let back: JobRunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, JobRunState::Pending);
    }

    #[test]
    fn test_job_run_type_display() {
        assert_eq!(JobRunType::Presubmit.to_string(), "presubmit");
        assert_eq!(
            "batch".parse::<JobRunType>().unwrap(),
            JobRunType::Batch
        );
        assert!("cron".parse::<JobRunType>().is_err());
    }

    #[test]
    fn test_execution_agent_default() {
        assert_eq!(ExecutionAgent::default(), ExecutionAgent::Kubernetes);
    }
}
