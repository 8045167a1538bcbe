// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain records: functions, deployments, invocations.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $(
                #[doc = concat!("`", $text, "`")]
                $variant,
            )+
        }

        impl $name {
            /// Stored text form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("Unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

status_enum! {
    /// Function lifecycle status.
    FunctionStatus {
        Init => "init",
        Building => "building",
        Active => "active",
        Disabled => "disabled",
        Deleted => "deleted",
    }
}

status_enum! {
    /// Deployment status.
    DeploymentStatus {
        Building => "building",
        Active => "active",
        Failed => "failed",
        Archived => "archived",
    }
}

status_enum! {
    /// Outcome of one invocation.
    InvocationStatus {
        Success => "success",
        Error => "error",
        Timeout => "timeout",
    }
}

impl FunctionStatus {
    /// Disabled and deleted functions accept neither deploys nor invocations.
    pub fn is_available(&self) -> bool {
        !matches!(self, FunctionStatus::Disabled | FunctionStatus::Deleted)
    }
}

/// A user function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    /// Opaque id.
    pub id: String,
    /// Owning account.
    pub owner: String,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    pub status: FunctionStatus,
    /// Currently active deployment, if any.
    pub active_deployment_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// A versioned build of a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Deployment id.
    pub id: String,
    /// Owning function.
    pub function_id: String,
    /// Per-function version, gap-free from 1.
    pub version: i64,
    /// Image tag the deployment runs.
    pub image_tag: String,
    /// Key of the stored artifact.
    pub artifact_key: String,
    /// Deployment status.
    pub status: DeploymentStatus,
    /// Whether this is the function's active deployment.
    pub is_active: bool,
    /// Build failure text.
    pub error: Option<String>,
    /// Entrypoint override.
    pub command: Option<Vec<String>>,
    /// Function-level environment.
    pub env: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// Captured container output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationLogs {
    /// Stdout lines.
    pub stdout: Vec<String>,
    /// Stderr lines.
    pub stderr: Vec<String>,
}

/// The recorded outcome of one invoke call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRecord {
    /// Invocation id.
    pub id: String,
    /// Invoked function.
    pub function_id: String,
    /// Deployment that ran.
    pub deployment_id: String,
    /// Outcome.
    pub status: InvocationStatus,
    /// Time from container creation to completion.
    pub duration_ms: i64,
    /// Error text for `error` and `timeout` outcomes.
    pub error: Option<String>,
    /// Container output.
    pub logs: Option<InvocationLogs>,
    /// Container that ran, when one was created.
    pub container_id: Option<String>,
    /// Container exit code, when it exited.
    pub exit_code: Option<i64>,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
}

/// Generated image tag for a function version: `funcd-fn-{id}:v{version}`.
pub fn image_tag(function_id: &str, version: i64) -> String {
    format!("{}:v{}", image_repository(function_id), version)
}

/// Image repository for a function: the id lowercased with unsupported characters replaced,
/// suffixed with a digest of the raw id so distinct ids never share a repository.
pub fn image_repository(function_id: &str) -> String {
    let sanitized: String = function_id
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let digest = crate::artifact::sha256_hex(function_id.as_bytes());
    format!("funcd-fn-{}-{}", sanitized, &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_text() {
        for status in [
            DeploymentStatus::Building,
            DeploymentStatus::Active,
            DeploymentStatus::Failed,
            DeploymentStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<DeploymentStatus>().unwrap(), status);
        }
        assert!("pending".parse::<InvocationStatus>().is_err());
    }

    #[test]
    fn test_function_availability() {
        assert!(FunctionStatus::Init.is_available());
        assert!(FunctionStatus::Active.is_available());
        assert!(!FunctionStatus::Disabled.is_available());
        assert!(!FunctionStatus::Deleted.is_available());
    }

    #[test]
    fn test_image_tag_is_sanitized() {
        assert_eq!(image_tag("Hello_World", 3), "funcd-fn-hello_world-345837a2:v3");
        assert_eq!(image_tag("a/b:c", 1), "funcd-fn-a-b-c-3b07f80c:v1");
    }

    #[test]
    fn test_image_repository_distinct_for_colliding_ids() {
        assert_eq!(image_repository("Billing"), "funcd-fn-billing-3ac8bbca");
        assert_eq!(image_repository("billing"), "funcd-fn-billing-0c95c7ec");
        assert_ne!(image_repository("a/b"), image_repository("a-b"));
    }
}
