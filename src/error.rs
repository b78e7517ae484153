//! Custom error types for dpo.

use thiserror::Error;

/// Errors that can occur while provisioning or tearing down a dataplane.
#[derive(Error, Debug)]
pub enum DpoError {
    #[error("[{0}] {1}")]
    AwsSdk(String, String),

    #[error("[{0}] AWS credentials error: {1}")]
    AwsCredentials(String, String),

    #[error("[{0}] AWS region not configured: {1}")]
    AwsRegion(String, String),

    #[error("[{0}] provider response is missing {1}")]
    MissingField(String, String),

    #[error("{0} {1} reported {2}")]
    ResourceFailed(String, String, String),

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Unsupported cloud: {0}")]
    UnsupportedCloud(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Write conflict on {0}")]
    Conflict(String),

    #[error("Status write conflict on {0} persisted after {1} attempts")]
    ConflictRetriesExhausted(String, u32),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Chart deployer error: {0}")]
    Chart(String),

    #[error("Reconcile pass exceeded {0}s")]
    Timeout(u64),
}

impl DpoError {
    /// Create an AWS SDK error from any error type.
    /// Analyzes the error message to provide more specific error types.
    pub fn aws<E: std::fmt::Debug + std::fmt::Display>(component: &str, err: E) -> Self {
        let err_debug = format!("{err:?}");
        let err_display = err.to_string();
        let component = component.to_string();

        let combined = format!("{err_display} {err_debug}");
        let combined_lower = combined.to_lowercase();

        if combined_lower.contains("no credentials")
            || combined_lower.contains("credentials not found")
            || combined_lower.contains("invalid credentials")
            || combined_lower.contains("expired token")
            || combined_lower.contains("expiredtoken")
            || combined_lower.contains("the security token included in the request is invalid")
            || combined_lower.contains("the security token included in the request is expired")
            || combined_lower.contains("unrecognized client")
            || combined_lower.contains("invalidclienttokenid")
            || combined_lower.contains("signaturedoesnotmatch")
            || combined_lower.contains("access denied")
            || combined_lower.contains("not authorized")
            || combined_lower.contains("accessdenied")
            || combined_lower.contains("unauthorizedoperation")
        {
            return Self::AwsCredentials(
                component,
                Self::extract_error_details(&err_debug, &err_display),
            );
        }

        if combined_lower.contains("no region")
            || combined_lower.contains("region not found")
            || combined_lower.contains("missing region")
        {
            return Self::AwsRegion(
                component,
                Self::extract_error_details(&err_debug, &err_display),
            );
        }

        Self::AwsSdk(
            component,
            Self::extract_error_details(&err_debug, &err_display),
        )
    }

    /// A create call was accepted but the response lacks the id we need to persist.
    pub fn missing(component: &str, field: &str) -> Self {
        Self::MissingField(component.to_string(), field.to_string())
    }

    /// Extract meaningful error details from AWS SDK error.
    /// Returns a single-line error message.
    fn extract_error_details(debug_str: &str, display_str: &str) -> String {
        if let Some(pos) = debug_str.find("message: Some(\"") {
            let start = pos + "message: Some(\"".len();
            let rest = &debug_str[start..];
            if let Some(end) = rest.find('"') {
                return rest[..end].to_string();
            }
        }

        if !display_str.to_lowercase().contains("service error") {
            return display_str.to_string();
        }

        "AWS API request failed".to_string()
    }

    /// Returns true if retrying the same pass can plausibly succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AwsSdk(_, _)
                | Self::Conflict(_)
                | Self::ConflictRetriesExhausted(_, _)
                | Self::KubernetesApi(_)
                | Self::Chart(_)
                | Self::Timeout(_)
        )
    }

    /// Short machine-readable reason used for status conditions.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::AwsSdk(_, _) | Self::MissingField(_, _) => "ProviderError",
            Self::AwsCredentials(_, _) => "CredentialsError",
            Self::ResourceFailed(_, _, _) => "ResourceFailed",
            Self::AwsRegion(_, _) => "RegionError",
            Self::InvalidSpec(_) | Self::InvalidVersion(_) | Self::UnsupportedCloud(_) => {
                "InvalidSpec"
            }
            Self::RecordNotFound(_)
            | Self::Conflict(_)
            | Self::ConflictRetriesExhausted(_, _)
            | Self::KubernetesApi(_) => "StoreError",
            Self::Chart(_) => "ChartError",
            Self::Timeout(_) => "Timeout",
        }
    }
}

/// Condition reason for any error that bubbled up through `anyhow`.
pub fn reason_of(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<DpoError>()
        .map_or("ReconcileError", DpoError::reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_aws_helper_generic() {
        let err = DpoError::aws("ec2::network", "connection failed");
        assert!(err.to_string().contains("[ec2::network]"));
        assert!(err.to_string().contains("connection failed"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_error_aws_credentials_no_credentials() {
        let err = DpoError::aws("eks::cluster", "No credentials in the property bag");
        assert!(matches!(err, DpoError::AwsCredentials(_, _)));
        assert!(err.to_string().contains("AWS credentials error"));
        assert!(!err.is_transient());
        assert_eq!(err.reason(), "CredentialsError");
    }

    #[test]
    fn test_error_aws_unauthorized_operation() {
        let err = DpoError::aws(
            "ec2::network",
            "UnauthorizedOperation: You are not authorized to perform this operation",
        );
        assert!(matches!(err, DpoError::AwsCredentials(_, _)));
    }

    #[test]
    fn test_error_aws_region_missing() {
        let err = DpoError::aws("eks::addon", "No region was found");
        assert!(matches!(err, DpoError::AwsRegion(_, _)));
        assert!(err.to_string().contains("AWS region not configured"));
    }

    #[test]
    fn test_error_extract_details_with_message_pattern() {
        let debug_str = r#"ServiceError { source: SomeError { message: Some("The cluster was not found"), code: Some("ResourceNotFoundException") } }"#;
        let details = DpoError::extract_error_details(debug_str, "service error");
        assert_eq!(details, "The cluster was not found");
    }

    #[test]
    fn test_error_extract_details_last_resort() {
        let details = DpoError::extract_error_details("Error { kind: Other }", "service error");
        assert_eq!(details, "AWS API request failed");
    }

    #[test]
    fn test_conflict_display() {
        let err = DpoError::ConflictRetriesExhausted("demo".to_string(), 5);
        assert_eq!(
            err.to_string(),
            "Status write conflict on demo persisted after 5 attempts"
        );
        assert_eq!(err.reason(), "StoreError");
    }

    #[test]
    fn test_reason_of_anyhow() {
        let err: anyhow::Error = DpoError::Chart("helm exited 1".to_string()).into();
        assert_eq!(reason_of(&err), "ChartError");
        let err = anyhow::anyhow!("plain");
        assert_eq!(reason_of(&err), "ReconcileError");
    }
}
