// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The CNI error object.

use interface_manager::MigrationError;
use serde::Serialize;

/// Well known CNI error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    IncompatibleVersion = 1,
    UnknownContainer = 3,
    InvalidEnvironmentVariables = 4,
    IoFailure = 5,
    DecodingFailure = 6,
    InvalidNetworkConfig = 7,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{msg}{}", suffix(.details))]
pub struct CniError {
    pub code: ErrorCode,
    pub msg: String,
    pub details: String,
}

fn suffix(details: &str) -> String {
    if details.is_empty() {
        String::new()
    } else {
        format!(": {details}")
    }
}

impl CniError {
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> CniError {
        CniError {
            code,
            msg: msg.into(),
            details: String::new(),
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl ToString) -> CniError {
        self.details = details.to_string();
        self
    }

    pub fn missing_env(name: &str) -> CniError {
        CniError::new(
            ErrorCode::InvalidEnvironmentVariables,
            format!("{name} is not set"),
        )
    }

    pub fn decoding(what: &str, source: impl ToString) -> CniError {
        CniError::new(ErrorCode::DecodingFailure, format!("failed to parse {what}"))
            .with_details(source)
    }

    /// The JSON document printed on stdout when a command fails.
    #[must_use]
    pub fn to_json(&self, cni_version: &str) -> String {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire<'a> {
            cni_version: &'a str,
            code: u32,
            msg: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<&'a str>,
        }
        let wire = Wire {
            cni_version,
            code: self.code as u32,
            msg: &self.msg,
            details: (!self.details.is_empty()).then_some(self.details.as_str()),
        };
        serde_json::to_string(&wire).unwrap_or_else(|_| {
            format!(
                r#"{{"cniVersion":"{cni_version}","code":{},"msg":"internal error"}}"#,
                self.code as u32
            )
        })
    }
}

impl From<MigrationError> for CniError {
    fn from(value: MigrationError) -> Self {
        let code = match &value {
            MigrationError::Netns(e) if e.is_not_found() => ErrorCode::UnknownContainer,
            _ => ErrorCode::IoFailure,
        };
        CniError::new(code, "failed to migrate link").with_details(value)
    }
}
