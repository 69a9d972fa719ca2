//! Administrative command surface
//!
//! Every operator action goes through `Pool::execute` and comes back as an
//! `Envelope`: `{"status": "ok"|"error", "message"?, "data"?}`. Transports
//! map `Envelope::failure` to their own status codes.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::Error;
use crate::pool::{FallbackUpdate, ImportPayload, MonitorUpdate, Pool, StateLoad};

/// Operator actions.
#[derive(Debug, Clone)]
pub enum AdminCommand {
    Status,
    ListMembers,
    AddMember {
        id: String,
        csrf_token: String,
        session_token: String,
    },
    RemoveMember {
        id: String,
    },
    EnableMember {
        id: String,
    },
    DisableMember {
        id: String,
    },
    ResetMember {
        id: String,
    },
    ExportAll,
    ExportMember {
        id: String,
    },
    Import(ImportPayload),
    MonitorConfig,
    UpdateMonitor(MonitorUpdate),
    StartMonitor,
    StopMonitor,
    FallbackConfig,
    UpdateFallback(FallbackUpdate),
    TestMember {
        id: String,
    },
    TestAll,
    ReloadConfig,
}

/// Why an admin command failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminFailure {
    NotFound,
    /// The command conflicts with pool invariants or existing members.
    Conflict,
    Invalid,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip)]
    pub failure: Option<AdminFailure>,
}

impl Envelope {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok",
            message: Some(message.into()),
            data: None,
            failure: None,
        }
    }

    pub fn data(data: impl Serialize) -> Self {
        Self {
            status: "ok",
            message: None,
            data: Some(to_value(data)),
            failure: None,
        }
    }

    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = Some(to_value(data));
        self
    }

    pub fn error(failure: AdminFailure, message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: Some(message.into()),
            data: None,
            failure: Some(failure),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

fn to_value(data: impl Serialize) -> Value {
    serde_json::to_value(data).unwrap_or_else(|e| json!({ "serialization_error": e.to_string() }))
}

impl From<Error> for Envelope {
    fn from(error: Error) -> Self {
        let failure = match &error {
            Error::NotFound(_) => AdminFailure::NotFound,
            Error::AlreadyExists(_) | Error::LastMember | Error::LastEnabledMember => {
                AdminFailure::Conflict
            }
            Error::InvalidMember(_) | Error::InvalidConfig(_) | Error::EmptyImport => {
                AdminFailure::Invalid
            }
            Error::Store(_) => AdminFailure::Internal,
        };
        Envelope::error(failure, error.to_string())
    }
}

impl Pool {
    /// Run one admin command.
    pub async fn execute(self: &Arc<Self>, command: AdminCommand) -> Envelope {
        match command {
            AdminCommand::Status => Envelope::data(self.status().await),
            AdminCommand::ListMembers => Envelope::data(self.list_members().await),
            AdminCommand::AddMember {
                id,
                csrf_token,
                session_token,
            } => match self.add_member(&id, &csrf_token, &session_token).await {
                Ok(()) => Envelope::ok(format!("Member '{}' added", id.trim())),
                Err(e) => e.into(),
            },
            AdminCommand::RemoveMember { id } => match self.remove_member(&id).await {
                Ok(()) => Envelope::ok(format!("Member '{id}' removed")),
                Err(e) => e.into(),
            },
            AdminCommand::EnableMember { id } => match self.enable_member(&id).await {
                Ok(()) => Envelope::ok(format!("Member '{id}' enabled")),
                Err(e) => e.into(),
            },
            AdminCommand::DisableMember { id } => match self.disable_member(&id).await {
                Ok(()) => Envelope::ok(format!("Member '{id}' disabled")),
                Err(e) => e.into(),
            },
            AdminCommand::ResetMember { id } => match self.reset_member(&id).await {
                Ok(()) => Envelope::ok(format!("Member '{id}' reset")),
                Err(e) => e.into(),
            },
            AdminCommand::ExportAll => Envelope::data(json!({ "tokens": self.export().await })),
            AdminCommand::ExportMember { id } => match self.export_member(&id).await {
                Ok(entry) => Envelope::data(entry),
                Err(e) => e.into(),
            },
            AdminCommand::Import(payload) => match self.import(payload).await {
                Ok(report) => Envelope::ok(report.message()).with_data(report),
                Err(e) => e.into(),
            },
            AdminCommand::MonitorConfig => Envelope::data(json!({
                "config": self.monitor_config().await,
                "running": self.is_monitor_running(),
            })),
            AdminCommand::UpdateMonitor(update) => match self.update_monitor_config(update).await {
                Ok(config) => Envelope::ok("Monitor config updated").with_data(config),
                Err(e) => e.into(),
            },
            AdminCommand::StartMonitor => {
                if self.is_monitor_running() {
                    Envelope::ok("Monitor already running")
                } else if self.start_monitor().await {
                    Envelope::ok("Monitor started")
                } else if !self.monitor_config().await.enable {
                    Envelope::error(AdminFailure::Conflict, "Monitor is disabled in config")
                } else {
                    Envelope::error(AdminFailure::Internal, "Monitor could not be started")
                }
            }
            AdminCommand::StopMonitor => {
                if self.stop_monitor() {
                    Envelope::ok("Monitor stopped")
                } else {
                    Envelope::ok("Monitor not running")
                }
            }
            AdminCommand::FallbackConfig => Envelope::data(self.fallback_config().await),
            AdminCommand::UpdateFallback(update) => {
                let config = self.update_fallback_config(update).await;
                Envelope::ok("Fallback config updated").with_data(config)
            }
            AdminCommand::TestMember { id } => match self.test_member(&id).await {
                Ok(report) => {
                    self.save_state("monitor").await;
                    Envelope::data(report)
                }
                Err(e) => e.into(),
            },
            AdminCommand::TestAll => Envelope::data(self.test_all().await),
            AdminCommand::ReloadConfig => match self.reload_config().await {
                Ok(changed) => {
                    let state = self.load_state().await;
                    let message = if changed {
                        "Credential document reloaded"
                    } else {
                        "Credential document unchanged"
                    };
                    Envelope::ok(message).with_data(json!({
                        "changed": changed,
                        "state_members_applied": match state {
                            StateLoad::Applied(n) => n,
                            _ => 0,
                        },
                    }))
                }
                Err(e) => e.into(),
            },
        }
    }
}
