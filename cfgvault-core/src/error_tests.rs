/*!
Tests for error categories and error conversions.
*/

#[cfg(test)]
mod tests {
    use crate::error::{
        AttemptError, CaptureError, ConnectFailure, ErrorCategory, StoreError,
    };
    use cfgvault_retry::RetryableError;
    use std::io;
    use std::time::Duration;

    #[test]
    fn test_store_error_display() {
        let error = StoreError::validation("empty vendor");
        assert_eq!(error.to_string(), "Validation error: empty vendor");

        let error = StoreError::ImmutabilityViolation {
            path: "cisco/r1/20240101_000000".to_string(),
        };
        assert!(error.to_string().contains("immutability violation"));
        assert!(error.to_string().contains("cisco/r1/20240101_000000"));
    }

    #[test]
    fn test_store_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        match StoreError::from(io_error) {
            StoreError::Io(_) => {}
            other => panic!("Expected Io error variant, got {other:?}"),
        }
    }

    #[test]
    fn test_categories_map_from_capture_errors() {
        let cases = [
            (
                CaptureError::connect(ConnectFailure::Authentication, "10.0.0.1:22", "denied"),
                ErrorCategory::Connect,
            ),
            (CaptureError::capture("empty output"), ErrorCategory::Capture),
            (
                CaptureError::precondition("ingestion offline"),
                ErrorCategory::Precondition,
            ),
            (
                CaptureError::RelayTimeout {
                    waited: Duration::from_secs(120),
                },
                ErrorCategory::RelayTimeout,
            ),
            (
                CaptureError::Store(StoreError::ImmutabilityViolation {
                    path: "x".to_string(),
                }),
                ErrorCategory::Store,
            ),
            (
                CaptureError::unsupported("vendor acme"),
                ErrorCategory::Unsupported,
            ),
        ];

        for (error, category) in cases {
            assert_eq!(error.category(), category, "{error}");
        }
    }

    #[test]
    fn test_retry_eligibility_follows_category() {
        assert!(ErrorCategory::Connect.is_retryable());
        assert!(ErrorCategory::Capture.is_retryable());
        assert!(ErrorCategory::RelayTimeout.is_retryable());
        assert!(!ErrorCategory::Precondition.is_retryable());
        assert!(!ErrorCategory::Store.is_retryable());
        assert!(!ErrorCategory::Unsupported.is_retryable());
        assert!(!ErrorCategory::Busy.is_retryable());

        assert!(CaptureError::capture("timeout").is_transient());
        assert!(CaptureError::precondition("ftp down").is_permanent());
    }

    #[test]
    fn test_relay_timeout_message() {
        let error = CaptureError::RelayTimeout {
            waited: Duration::from_secs(120),
        };
        assert_eq!(
            error.to_string(),
            "Relay file not received within 120 seconds"
        );
        assert!(error.is_timeout());
    }

    #[test]
    fn test_attempt_error_from_capture_error() {
        let error = CaptureError::connect(ConnectFailure::Timeout, "olt1:23", "no banner");
        let boundary = AttemptError::from(&error);

        assert_eq!(boundary.category, ErrorCategory::Connect);
        assert!(boundary.message.contains("connection timed out"));
        assert!(boundary.to_string().starts_with("[connect]"));
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::RelayTimeout).unwrap();
        assert_eq!(json, "\"relay_timeout\"");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<CaptureError>();
        assert_sync::<CaptureError>();
        assert_send::<StoreError>();
        assert_sync::<StoreError>();
    }
}
