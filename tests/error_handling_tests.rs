mod common;

use btserial::core::events::{CONNECTION_SUCCEEDED, ERROR};
use btserial::domain::config::GlobalConfig;
use btserial::{BtSerialError, BtSerialResult, SessionEvent};
use common::{harness, quick_config, ConnectBehavior};
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Error handling and resilience tests
#[cfg(test)]
mod error_handling_tests {
    use super::*;

    async fn next_error(
        events: &mut btserial::core::events::EventStream,
    ) -> (String, String, Option<String>) {
        loop {
            match events.recv().await {
                Some(SessionEvent::Error {
                    message,
                    tag,
                    device_id,
                }) => return (message, tag, device_id),
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    }

    #[test]
    fn test_error_types() {
        let errors = vec![
            BtSerialError::TransportUnavailable,
            BtSerialError::device_not_found("AA:BB"),
            BtSerialError::connect_failed("AA:BB", "refused"),
            BtSerialError::LinkLost {
                device_id: "AA:BB".to_string(),
                reason: "out of range".to_string(),
            },
            BtSerialError::operation_failed("write failed"),
            BtSerialError::Superseded {
                key: "AA:BB".to_string(),
            },
            BtSerialError::Config {
                message: "bad file".to_string(),
            },
            BtSerialError::InvalidInput("bad hex".to_string()),
            BtSerialError::Output("broken pipe".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }

        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BtSerialError>();
    }

    #[test]
    fn test_error_messages_name_the_device() {
        let error = BtSerialError::connect_failed("AA:BB", "page timeout");
        assert_eq!(error.to_string(), "Connection to 'AA:BB' failed: page timeout");
        assert!(BtSerialError::device_not_found("CC").to_string().contains("'CC'"));
    }

    #[test]
    fn test_error_conversion_keeps_source() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "Access denied");
        let error: BtSerialError = io_error.into();
        assert!(matches!(error, BtSerialError::Io(_)));
        assert!(error.source().is_some());

        let serial_error = serialport::Error::new(serialport::ErrorKind::NoDevice, "unplugged");
        let error: BtSerialError = serial_error.into();
        assert!(matches!(error, BtSerialError::Serial(_)));
        assert!(error.to_string().contains("unplugged"));
    }

    #[tokio::test]
    async fn test_async_error_propagation() {
        async fn failing() -> BtSerialResult<()> {
            Err(BtSerialError::operation_failed("Async operation failed"))
        }

        async fn calling() -> BtSerialResult<()> {
            failing().await?;
            Ok(())
        }

        let error = calling().await.unwrap_err();
        assert!(error.to_string().contains("Async operation failed"));
    }

    #[tokio::test]
    async fn test_transport_unavailable_is_returned_and_published() {
        let (manager, transport) = harness(GlobalConfig::default());
        transport.set_available(false);
        let mut events = manager.subscribe();

        let result = manager.connect("AA:BB").await;

        assert!(matches!(result, Err(BtSerialError::TransportUnavailable)));
        let (_, tag, device_id) = next_error(&mut events).await;
        assert_eq!(tag, "SessionManager.connect");
        assert_eq!(device_id.as_deref(), Some("AA:BB"));
        assert!(!manager.is_enabled().await);
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let (manager, _transport) = harness(GlobalConfig::default());
        let result = manager.connect("unknown-device").await;
        assert!(matches!(result, Err(BtSerialError::DeviceNotFound { .. })));
        assert!(manager.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_connect_command() {
        let (manager, transport) = harness(GlobalConfig::default());
        transport.set_connect_behavior(ConnectBehavior::Reject);
        let mut events = manager.subscribe();

        let result = manager.connect("AA").await;

        match result {
            Err(BtSerialError::ConnectFailed { reason, .. }) => {
                assert!(reason.contains("adapter busy"))
            }
            other => panic!("expected connect failure, got {:?}", other),
        }
        let (message, _, _) = next_error(&mut events).await;
        assert!(message.contains("adapter busy"));
        assert_eq!(manager.session_state("AA").await, None);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_session_connected() {
        let (manager, transport) = harness(GlobalConfig::default());
        manager.connect("AA").await.unwrap();
        transport.set_fail_writes(true);
        let mut events = manager.subscribe();

        let result = manager.write(Some("AA"), b"ping").await;

        assert!(matches!(result, Err(BtSerialError::OperationFailed { .. })));
        let (message, tag, device_id) = next_error(&mut events).await;
        assert!(message.contains("socket closed"));
        assert_eq!(tag, "SessionManager.write");
        assert_eq!(device_id.as_deref(), Some("AA"));
        assert!(manager.is_connected(Some("AA")).await);
    }

    #[tokio::test]
    async fn test_ack_only_writes() {
        let (manager, transport) = harness(GlobalConfig {
            propagate_write_errors: false,
            ..GlobalConfig::default()
        });
        manager.connect("AA").await.unwrap();
        transport.set_fail_writes(true);
        let mut events = manager.subscribe();

        assert!(manager.write(None, b"ping").await.is_ok());
        let (_, tag, _) = next_error(&mut events).await;
        assert_eq!(tag, "SessionManager.write");
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_break_connect() {
        let (manager, _transport) = harness(GlobalConfig::default());
        let _broken = manager
            .events()
            .on_event(CONNECTION_SUCCEEDED, |_| anyhow::bail!("observer crashed"));
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let _errors = manager.events().on_event(ERROR, move |event| {
            if let SessionEvent::Error { tag, .. } = event {
                assert_eq!(tag, "EventDispatcher.publish");
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let device = manager.connect("AA").await.unwrap();

        assert_eq!(device.id, "AA");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected(None).await);
    }

    #[tokio::test]
    async fn test_unsupported_unpair() {
        let (manager, _transport) = harness(quick_config());
        let mut events = manager.subscribe();

        let result = manager.unpair("AA");

        assert!(matches!(result.await, Err(BtSerialError::OperationFailed { .. })));
        let (_, tag, device_id) = next_error(&mut events).await;
        assert_eq!(tag, "SessionManager.unpair");
        assert_eq!(device_id.as_deref(), Some("AA"));
    }

    #[tokio::test]
    async fn test_rejected_adapter_name() {
        let (manager, transport) = harness(GlobalConfig::default());
        let mut events = manager.subscribe();

        let result = manager.set_adapter_name("").await;

        assert!(matches!(result, Err(BtSerialError::OperationFailed { .. })));
        let (message, tag, device_id) = next_error(&mut events).await;
        assert!(message.contains("must not be empty"));
        assert_eq!(tag, "SessionManager.set_adapter_name");
        assert_eq!(device_id, None);
        assert_eq!(transport.adapter_name(), "mock-adapter");
    }

    #[tokio::test]
    async fn test_failure_on_one_device_leaves_others_usable() {
        let (manager, transport) = harness(GlobalConfig::default());
        manager.connect("AA").await.unwrap();

        transport.set_connect_behavior(ConnectBehavior::Refuse("busy".to_string()));
        assert!(manager.connect("BB").await.is_err());

        transport.set_connect_behavior(ConnectBehavior::Accept);
        assert!(manager.write(Some("AA"), b"still here").await.is_ok());
        assert!(manager.connect("BB").await.is_ok());
        assert_eq!(manager.connected_devices().await.len(), 2);
    }

    #[tokio::test]
    async fn test_set_delimiter_requires_session() {
        let (manager, _transport) = harness(GlobalConfig::default());
        assert!(matches!(
            manager.set_delimiter(None, b'\n').await,
            Err(BtSerialError::DeviceNotFound { .. })
        ));
        assert!(matches!(
            manager.set_delimiter(Some("AA"), b'\n').await,
            Err(BtSerialError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_delimiter_input() {
        assert!(matches!(
            btserial::core::buffer::parse_delimiter(""),
            Err(BtSerialError::InvalidInput(_))
        ));
    }
}
